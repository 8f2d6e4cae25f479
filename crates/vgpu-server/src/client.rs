//! Per-client state and thread lifecycle.
//!
//! Each client owns an isolated resource universe (one handle manager per
//! kind, wired parents-first), a dependency DAG, and two service threads:
//! the Parser validates and orders calls, the Worker dispatches them to the
//! accelerator. Teardown stops the parser, then the worker, then dumps
//! whatever the configuration asks for.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use vgpu_common::TickClock;
use vgpu_core::apicxt::{ApiContext, ApiContextRecord, Completion};
use vgpu_core::dag::BipartiteGraph;
use vgpu_core::handle::{Handle, HandleKey, HandleStatus};
use vgpu_core::manager::HandleManager;
use vgpu_core::{CkptOptLevel, KernelDescriptor, MigrOptLevel, RuntimeConfig};
use vgpu_protocol::{ApiId, ParamDesc, ResourceKind, RuntimeError, RuntimeResult};

use crate::driver::AcceleratorDriver;
use crate::migration::{self, MigrationContext};
use crate::parser::Parser;
use crate::trace;
use crate::worker::Worker;

/// DAG payload for a call vertex.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub api_id: ApiId,
    pub seq: u64,
}

/// DAG payload for a handle vertex. Only stateful handles get vertices;
/// checkpoint planning has no use for the rest.
#[derive(Debug, Clone)]
pub struct ResNode {
    pub kind: ResourceKind,
    pub handle_id: u64,
}

pub type ClientDag = BipartiteGraph<OpNode, ResNode>;

/// One manager per resource kind, initialized parents-first.
pub struct HandleRegistry {
    managers: [Arc<HandleManager>; 9],
}

fn kind_index(kind: ResourceKind) -> usize {
    ResourceKind::ALL.iter().position(|&k| k == kind).unwrap_or(0)
}

impl HandleRegistry {
    /// Build the registry and bootstrap the ambient handles (devices, the
    /// primary context, the default stream). Any failure here aborts client
    /// creation; the client never reaches a runnable state.
    pub fn init(driver: &Arc<dyn AcceleratorDriver>, config: &RuntimeConfig) -> RuntimeResult<Self> {
        let hw = config.ckpt_bag_high_water;

        let device_mgr = Arc::new(HandleManager::new(ResourceKind::Device, HashMap::new(), hw));
        let nb_devices = driver.device_count().map_err(RuntimeError::Vendor)?;
        if nb_devices <= 0 {
            warn!("no accelerator devices visible, client won't be run");
            return Err(RuntimeError::NotReady);
        }
        for ordinal in 0..nb_devices {
            let handle = device_mgr.allocate(Vec::new(), Some(0x1000 + ordinal as u64), 0)?;
            handle.set_meta(vgpu_core::HandleMeta::Device { ordinal });
            handle.activate(ordinal as u64, &[])?;
        }

        let mut related = HashMap::new();
        related.insert(ResourceKind::Device, device_mgr.handles());
        let context_mgr = Arc::new(HandleManager::new(ResourceKind::Context, related, hw));
        let device0 = device_mgr.get_by_id(0).ok_or(RuntimeError::NotFound)?;
        let primary = context_mgr.allocate(vec![device0.key()], None, 0)?;
        primary.activate(1, &[device0])?;

        let ctx_handles = || {
            let mut m = HashMap::new();
            m.insert(ResourceKind::Context, context_mgr.handles());
            m
        };

        let stream_mgr = Arc::new(HandleManager::new(ResourceKind::Stream, ctx_handles(), hw));
        // The legacy default stream: addressable as 0, materialized by the
        // worker at daemon init.
        stream_mgr.allocate(vec![primary.key()], Some(0), 0)?;

        let blas_mgr = Arc::new(HandleManager::new(ResourceKind::BlasContext, ctx_handles(), hw));
        let event_mgr = Arc::new(HandleManager::new(ResourceKind::Event, ctx_handles(), hw));
        let module_mgr = Arc::new(HandleManager::new(ResourceKind::Module, ctx_handles(), hw));

        if let Some(path) = &config.kernel_meta_path {
            if path.exists() {
                match module_mgr.load_cached_function_metas(path) {
                    Ok(count) => debug!(count, path = %path.display(), "loaded kernel meta cache"),
                    Err(_) => warn!(path = %path.display(), "kernel meta cache load failed"),
                }
            }
        }

        let mut fn_related = HashMap::new();
        fn_related.insert(ResourceKind::Module, module_mgr.handles());
        let function_mgr = Arc::new(HandleManager::new(ResourceKind::Function, fn_related.clone(), hw));
        let variable_mgr = Arc::new(HandleManager::new(ResourceKind::Variable, fn_related, hw));
        let memory_mgr = Arc::new(HandleManager::new(ResourceKind::Memory, ctx_handles(), hw));

        let mut managers: [Option<Arc<HandleManager>>; 9] = Default::default();
        for mgr in [
            device_mgr, context_mgr, stream_mgr, blas_mgr, event_mgr, module_mgr, function_mgr,
            variable_mgr, memory_mgr,
        ] {
            let idx = kind_index(mgr.kind());
            managers[idx] = Some(mgr);
        }
        let managers = managers.map(|m| m.unwrap_or_else(|| {
            // unreachable: the loop above covers every kind
            Arc::new(HandleManager::new(ResourceKind::Device, HashMap::new(), 1))
        }));

        Ok(Self { managers })
    }

    pub fn get(&self, kind: ResourceKind) -> &Arc<HandleManager> {
        &self.managers[kind_index(kind)]
    }

    pub fn all(&self) -> &[Arc<HandleManager>] {
        &self.managers
    }

    pub fn stateful(&self) -> impl Iterator<Item = &Arc<HandleManager>> {
        self.managers.iter().filter(|m| m.is_stateful())
    }

    /// Resolve a handle's parent keys to handles, in parent order.
    pub fn resolve_parents(&self, handle: &Handle) -> Vec<Arc<Handle>> {
        handle
            .parents
            .iter()
            .filter_map(|&HandleKey { kind, id }| self.get(kind).get_by_id(id))
            .collect()
    }
}

/// Stream ids the worker binds at daemon init.
#[derive(Default)]
pub struct ClientStreams {
    pub default_stream: AtomicU64,
    pub ckpt_stream: AtomicU64,
    pub precopy_stream: AtomicU64,
}

/// State shared between the client facade, its two service threads, and the
/// checkpoint/migration engines.
pub struct ClientShared {
    pub id: u64,
    pub pid: u32,
    pub config: RuntimeConfig,
    pub driver: Arc<dyn AcceleratorDriver>,
    pub registry: HandleRegistry,
    pub dag: ClientDag,
    pub streams: ClientStreams,
    pub migration: MigrationContext,
    pub stop: AtomicBool,
    /// A post-cutover reference to un-migrated state poisons the client.
    pub fatal: AtomicBool,
    outstanding: Mutex<u64>,
    idle: Condvar,
    trace_log: Mutex<Vec<ApiContextRecord>>,
}

impl ClientShared {
    pub fn manager(&self, kind: ResourceKind) -> &Arc<HandleManager> {
        self.registry.get(kind)
    }

    /// Create the DAG vertex of a stateful handle the first time it is seen.
    pub fn ensure_dag_vertex(&self, handle: &Handle) -> RuntimeResult<()> {
        if !handle.kind.is_stateful() || handle.dag_vertex().is_some() {
            return Ok(());
        }
        let vertex = self.dag.add_t2(
            ResNode { kind: handle.kind, handle_id: handle.id },
            Default::default(),
        )?;
        handle.set_dag_vertex(vertex);
        Ok(())
    }

    pub fn op_enqueued(&self) {
        *self.outstanding.lock() += 1;
    }

    pub fn op_retired(&self, cxt: &ApiContext) {
        if self.config.trace_dir.is_some() {
            self.trace_log.lock().push(cxt.record());
        }
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every submitted call has retired.
    pub fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            self.idle.wait(&mut outstanding);
        }
    }

    pub fn trace_records(&self) -> Vec<ApiContextRecord> {
        self.trace_log.lock().clone()
    }
}

pub struct Client {
    shared: Arc<ClientShared>,
    parser_tx: Mutex<Option<Sender<Box<ApiContext>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
}

impl Client {
    pub fn new(
        id: u64,
        pid: u32,
        config: RuntimeConfig,
        driver: Arc<dyn AcceleratorDriver>,
    ) -> RuntimeResult<Self> {
        let registry = HandleRegistry::init(&driver, &config)?;
        let dag = ClientDag::with_prefill(config.dag_prefill_slots, TickClock::TICKS_PER_SEC);

        let shared = Arc::new(ClientShared {
            id,
            pid,
            config,
            driver,
            registry,
            dag,
            streams: ClientStreams::default(),
            migration: MigrationContext::default(),
            stop: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            trace_log: Mutex::new(Vec::new()),
        });

        if let Some(path) = shared.config.checkpoint_path.clone() {
            if path.exists() {
                info!(client_id = id, path = %path.display(), "restoring client from checkpoint");
                migration::restore_checkpoint(&shared, &path)?;
            }
        }

        let (parser_tx, parser_rx): (Sender<Box<ApiContext>>, Receiver<Box<ApiContext>>) =
            crossbeam_channel::unbounded();
        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();

        let parser = Parser::new(shared.clone(), parser_rx, worker_tx);
        let worker = Worker::new(shared.clone(), worker_rx);

        let parser_thread = std::thread::Builder::new()
            .name(format!("vgpu-parser-{id}"))
            .spawn(move || parser.run())
            .map_err(|_| RuntimeError::Failed)?;
        let worker_thread = std::thread::Builder::new()
            .name(format!("vgpu-worker-{id}"))
            .spawn(move || worker.run())
            .map_err(|_| RuntimeError::Failed)?;

        info!(client_id = id, pid, "client created");
        Ok(Self {
            shared,
            parser_tx: Mutex::new(Some(parser_tx)),
            threads: Mutex::new(vec![parser_thread, worker_thread]),
            seq: AtomicU64::new(0),
        })
    }

    pub fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    /// Queue one call. Returns the completion receiver when a reply channel
    /// was requested.
    pub fn submit(
        &self,
        api_id: ApiId,
        params: Vec<ParamDesc>,
        want_completion: bool,
    ) -> RuntimeResult<Option<Receiver<Completion>>> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(RuntimeError::DrainPending);
        }
        let tx_guard = self.parser_tx.lock();
        let tx = tx_guard.as_ref().ok_or(RuntimeError::DrainPending)?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut cxt = ApiContext::new(self.shared.id, api_id, seq, params);
        let rx = if want_completion {
            let (ctx_tx, ctx_rx) = crossbeam_channel::bounded(1);
            cxt = cxt.with_completion(ctx_tx);
            Some(ctx_rx)
        } else {
            None
        };

        self.shared.op_enqueued();
        tx.send(Box::new(cxt)).map_err(|_| RuntimeError::Failed)?;
        Ok(rx)
    }

    /// Wait until the pipeline drains.
    pub fn drain(&self) {
        self.shared.wait_idle();
    }

    /// Stop both threads (draining, not aborting), then run the teardown
    /// dumps. Parser goes down before worker, worker before managers.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets the parser observe disconnect+empty.
        self.parser_tx.lock().take();
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }

        if let Some(path) = self.shared.config.kernel_meta_path.clone() {
            self.dump_kernel_metas(&path);
        }
        if self.shared.config.trace_dir.is_some() {
            if let Err(err) = trace::dump_trace(&self.shared) {
                warn!(client_id = self.shared.id, ?err, "trace dump failed");
            }
        }
        info!(client_id = self.shared.id, "client torn down");
    }

    /// Export every function handle's parameter layout, append-on-write.
    fn dump_kernel_metas(&self, path: &Path) {
        let function_mgr = self.shared.manager(ResourceKind::Function);
        let module_mgr = self.shared.manager(ResourceKind::Module);
        let descriptors: Vec<KernelDescriptor> = function_mgr
            .handles()
            .iter()
            .filter_map(|h| h.kernel_descriptor())
            .collect();
        if descriptors.is_empty() {
            return;
        }
        let count = descriptors.len();
        match module_mgr.dump_function_metas(path, descriptors.into_iter()) {
            Ok(()) => info!(client_id = self.shared.id, count, path = %path.display(), "dumped kernel metadata"),
            Err(err) => warn!(client_id = self.shared.id, ?err, "kernel metadata dump failed"),
        }
    }

    /// Levels the engines were configured with; used by the dispatch layer
    /// to refuse misconfigured migration requests.
    pub fn ckpt_level(&self) -> CkptOptLevel {
        self.shared.config.ckpt_opt_level
    }

    pub fn migr_level(&self) -> MigrOptLevel {
        self.shared.config.migr_opt_level
    }

    /// Default-stream handle status, used by tests and the dispatch layer
    /// to tell whether the worker finished daemon init.
    pub fn worker_ready(&self) -> bool {
        self.shared
            .manager(ResourceKind::Stream)
            .get_by_id(0)
            .map(|h| h.status() == HandleStatus::Active)
            .unwrap_or(false)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
