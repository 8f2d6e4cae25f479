//! Worker stage of the per-client pipeline.
//!
//! Single-threaded loop bound to the accelerator at startup. Each call runs
//! a launch handler (the vendor dispatch, using server-side addresses) and a
//! landing handler (post-dispatch bookkeeping), then the reply is published.
//! Vendor errors land in the WQE return code and travel to the guest
//! unaltered. The overlap checkpoint engine interleaves here: slot copies
//! are issued as ops flow and joined before any op that writes a
//! still-copying handle.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, warn};

use vgpu_core::apicxt::ApiContext;
use vgpu_core::handle::{Handle, HandleStatus, MigrationState};
use vgpu_core::CkptOptLevel;
use vgpu_protocol::{api, ApiId, ResourceKind, RuntimeError, RuntimeResult};

use crate::checkpoint::{self, OverlapScheme};
use crate::client::ClientShared;
use crate::driver::LaunchConfig;
use crate::state::HandleStateOps;

type WorkerFn = fn(&ClientShared, &mut ApiContext) -> RuntimeResult<()>;

struct OverlapState {
    scheme: OverlapScheme,
    rel_index: usize,
    inflight: Vec<Arc<Handle>>,
}

pub(crate) struct Worker {
    shared: Arc<ClientShared>,
    rx: Receiver<Box<ApiContext>>,
    launch_table: HashMap<ApiId, WorkerFn>,
    landing_table: HashMap<ApiId, WorkerFn>,
    overlap: Option<OverlapState>,
}

impl Worker {
    pub fn new(shared: Arc<ClientShared>, rx: Receiver<Box<ApiContext>>) -> Self {
        let mut launch_table: HashMap<ApiId, WorkerFn> = HashMap::new();
        launch_table.insert(api::MALLOC, wk_malloc);
        launch_table.insert(api::FREE, wk_free);
        launch_table.insert(api::LAUNCH_KERNEL, wk_launch_kernel);
        launch_table.insert(api::MEMCPY_H2D, wk_memcpy_h2d);
        launch_table.insert(api::MEMCPY_D2H, wk_memcpy_d2h);
        launch_table.insert(api::MEMCPY_D2D, wk_memcpy_d2d);
        launch_table.insert(api::MEMCPY_H2D_ASYNC, wk_memcpy_h2d);
        launch_table.insert(api::MEMCPY_D2H_ASYNC, wk_memcpy_d2h);
        launch_table.insert(api::MEMCPY_D2D_ASYNC, wk_memcpy_d2d);
        launch_table.insert(api::SET_DEVICE, wk_set_device);
        launch_table.insert(api::GET_LAST_ERROR, wk_get_last_error);
        launch_table.insert(api::GET_ERROR_STRING, wk_get_error_string);
        launch_table.insert(api::GET_DEVICE_COUNT, wk_get_device_count);
        launch_table.insert(api::GET_DEVICE, wk_get_device);
        launch_table.insert(api::STREAM_CREATE, wk_stream_create);
        launch_table.insert(api::STREAM_SYNCHRONIZE, wk_stream_synchronize);
        launch_table.insert(api::EVENT_CREATE, wk_event_create);
        launch_table.insert(api::EVENT_DESTROY, wk_event_destroy);
        launch_table.insert(api::EVENT_RECORD, wk_event_record);
        launch_table.insert(api::MODULE_LOAD, wk_module_load);
        launch_table.insert(api::MODULE_GET_FUNCTION, wk_module_get_function);
        launch_table.insert(api::REGISTER_VAR, wk_register_var);
        launch_table.insert(api::PRIMARY_CTX_GET_STATE, wk_primary_ctx_get_state);
        launch_table.insert(api::BLAS_CREATE, wk_blas_create);
        launch_table.insert(api::BLAS_SET_STREAM, wk_blas_set_stream);
        launch_table.insert(api::BLAS_SET_MATH_MODE, wk_blas_set_math_mode);
        launch_table.insert(api::BLAS_SGEMM, wk_blas_sgemm);

        let mut landing_table: HashMap<ApiId, WorkerFn> = HashMap::new();
        landing_table.insert(api::LAUNCH_KERNEL, wk_release_staged);
        landing_table.insert(api::MEMCPY_H2D, wk_release_staged);
        landing_table.insert(api::MEMCPY_H2D_ASYNC, wk_release_staged);

        Self { shared, rx, launch_table, landing_table, overlap: None }
    }

    pub fn run(mut self) {
        self.daemon_init();
        debug!(client_id = self.shared.id, "worker loop up");
        loop {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(cxt) => self.process(cxt),
                Err(RecvTimeoutError::Timeout) => {
                    // No follow-on ops to overlap with; finish pending copies.
                    self.flush_overlap();
                    if self.shared.stop.load(Ordering::Acquire) && self.rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_overlap();
                    break;
                }
            }
        }
        debug!(client_id = self.shared.id, "worker loop down");
    }

    /// Bind the thread to the accelerator and create the client-private
    /// streams before the first dispatch.
    fn daemon_init(&self) {
        let shared = &self.shared;
        if let Err(code) = shared.driver.set_device(0) {
            error!(client_id = shared.id, code, "worker failed to bind accelerator device");
            shared.fatal.store(true, Ordering::Release);
            return;
        }

        match shared.driver.stream_create() {
            Ok(stream) => {
                shared.streams.default_stream.store(stream, Ordering::Release);
                // Materialize the default-stream handle the registry
                // bootstrapped at address 0.
                if let Some(handle) = shared.manager(ResourceKind::Stream).get_by_id(0) {
                    let parents = shared.registry.resolve_parents(&handle);
                    if let Err(err) = handle.activate(stream, &parents) {
                        warn!(client_id = shared.id, %err, "default stream activation failed");
                    }
                }
            }
            Err(code) => {
                error!(client_id = shared.id, code, "default stream creation failed");
                shared.fatal.store(true, Ordering::Release);
                return;
            }
        }

        if shared.config.ckpt_opt_level == CkptOptLevel::Overlap {
            match shared.driver.stream_create() {
                Ok(stream) => shared.streams.ckpt_stream.store(stream, Ordering::Release),
                Err(code) => warn!(client_id = shared.id, code, "checkpoint stream creation failed"),
            }
        }
        if shared.config.migr_opt_level != vgpu_core::MigrOptLevel::Disabled {
            match shared.driver.stream_create() {
                Ok(stream) => shared.streams.precopy_stream.store(stream, Ordering::Release),
                Err(code) => warn!(client_id = shared.id, code, "precopy stream creation failed"),
            }
        }
    }

    fn process(&mut self, mut cxt: Box<ApiContext>) {
        self.overlap_step(&cxt);

        if cxt.api_id == api::CHECKPOINT {
            self.handle_checkpoint(&mut cxt);
            self.retire(cxt);
            return;
        }

        let result = self
            .ensure_views_ready(&cxt)
            .and_then(|()| match self.launch_table.get(&cxt.api_id) {
                Some(launch) => launch(&self.shared, &mut cxt),
                None => {
                    warn!(client_id = self.shared.id, api = %cxt.api_id, "no worker handler");
                    Err(RuntimeError::InvalidInput)
                }
            });

        match result {
            Ok(()) => {
                if let Some(landing) = self.landing_table.get(&cxt.api_id) {
                    if let Err(err) = landing(&self.shared, &mut cxt) {
                        warn!(client_id = self.shared.id, api = %cxt.api_id, %err, "landing failed");
                    }
                }
            }
            Err(err) => {
                cxt.return_code = err.code();
                debug!(client_id = self.shared.id, api = %cxt.api_id, %err, "dispatch failed");
            }
        }
        self.retire(cxt);
    }

    fn retire(&self, mut cxt: Box<ApiContext>) {
        cxt.publish();
        self.shared.op_retired(&cxt);
    }

    /// Overlap-checkpoint interplay around one op: issue this relative
    /// slot's copies, then join before dispatch if the op writes any handle
    /// whose copy is still in flight.
    fn overlap_step(&mut self, cxt: &ApiContext) {
        let Some(state) = &mut self.overlap else { return };

        let handles = state.scheme.take_slot(state.rel_index);
        state.rel_index += 1;
        for (handle, version) in handles {
            let stream = self.shared.streams.ckpt_stream.load(Ordering::Acquire);
            match handle.checkpoint_commit_async(version, stream, self.shared.driver.as_ref()) {
                Ok(()) => state.inflight.push(handle),
                Err(err) => {
                    warn!(id = handle.id, version, %err, "async checkpoint commit failed");
                    handle.ckpt_bag.discard(version);
                }
            }
        }

        let must_join = state
            .inflight
            .iter()
            .any(|h| cxt.writes_handle(h.kind, h.id));
        if must_join {
            Self::checkpoint_join(&self.shared, state);
        }

        if state.rel_index >= state.scheme.nb_slots() && state.inflight.is_empty() {
            self.overlap = None;
        }
    }

    fn checkpoint_join(shared: &ClientShared, state: &mut OverlapState) {
        let stream = shared.streams.ckpt_stream.load(Ordering::Acquire);
        if let Err(code) = shared.driver.stream_synchronize(stream) {
            warn!(client_id = shared.id, code, "checkpoint stream sync failed");
        }
        for handle in state.inflight.drain(..) {
            handle.checkpoint_join_commit();
        }
    }

    /// Issue every remaining slot and join; invoked when the pipeline runs
    /// dry before the overlap window is exhausted.
    fn flush_overlap(&mut self) {
        let Some(mut state) = self.overlap.take() else { return };
        for rel in state.rel_index..state.scheme.nb_slots() {
            for (handle, version) in state.scheme.take_slot(rel) {
                let stream = self.shared.streams.ckpt_stream.load(Ordering::Acquire);
                match handle.checkpoint_commit_async(version, stream, self.shared.driver.as_ref()) {
                    Ok(()) => state.inflight.push(handle),
                    Err(err) => {
                        warn!(id = handle.id, version, %err, "async checkpoint commit failed");
                        handle.ckpt_bag.discard(version);
                    }
                }
            }
        }
        Self::checkpoint_join(&self.shared, &mut state);
    }

    fn handle_checkpoint(&mut self, cxt: &mut ApiContext) {
        let result = match self.shared.config.ckpt_opt_level {
            CkptOptLevel::Disabled => Ok(()),
            CkptOptLevel::ModifiedSet => checkpoint::checkpoint_modified_set(&self.shared, cxt),
            CkptOptLevel::Overlap => {
                let nb_pending = self.rx.len();
                if nb_pending == 0 {
                    // Nothing to overlap with; degrade to the synchronous path.
                    checkpoint::checkpoint_modified_set(&self.shared, cxt)
                } else {
                    checkpoint::generate_overlap_scheme(&self.shared, cxt, nb_pending).map(|scheme| {
                        self.overlap =
                            Some(OverlapState { scheme, rel_index: 0, inflight: Vec::new() });
                    })
                }
            }
        };
        if let Err(err) = result {
            // Checkpoint failures never fail the guest; the slots involved
            // were already discarded.
            warn!(client_id = self.shared.id, %err, "checkpoint failed");
        }
    }

    /// Pre-dispatch restore: rebuild handles waiting on reload (checkpoint
    /// restore, on-demand migration reload) and fail hard on post-cutover
    /// references to state that never made it to the destination device.
    fn ensure_views_ready(&self, cxt: &ApiContext) -> RuntimeResult<()> {
        // Parents-first kind order, so a restored child finds its parent
        // already active.
        for kind in ResourceKind::ALL {
            for view in cxt.views_of(kind) {
                let handle = &view.handle;
                if handle.kind == ResourceKind::Memory
                    && self.shared.migration.predates_cutover(handle.id)
                    && handle.migration_state() != MigrationState::RemoteActive
                    && handle.status() == HandleStatus::Active
                {
                    error!(
                        client_id = self.shared.id,
                        id = handle.id,
                        "post-cutover reference to un-migrated memory"
                    );
                    self.shared.fatal.store(true, Ordering::Release);
                    return Err(RuntimeError::Failed);
                }
                if handle.status() == HandleStatus::WaitingReload {
                    let parents = self.shared.registry.resolve_parents(handle);
                    handle.restore(self.shared.driver.as_ref(), &parents)?;
                    if handle.kind == ResourceKind::Memory {
                        let stream = self.shared.streams.default_stream.load(Ordering::Acquire);
                        handle.reload_state(stream, self.shared.driver.as_ref())?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Shared helpers ─────────────────────────────────────────────────

fn view_handle(cxt: &ApiContext, kind: ResourceKind, idx: usize) -> RuntimeResult<Arc<Handle>> {
    cxt.view(kind, idx)
        .map(|v| v.handle.clone())
        .ok_or(RuntimeError::NotFound)
}

fn activate_created(shared: &ClientShared, handle: &Handle, server_addr: u64) -> RuntimeResult<()> {
    let parents = shared.registry.resolve_parents(handle);
    handle.activate(server_addr, &parents)
}

fn need_u32(cxt: &ApiContext, idx: usize) -> RuntimeResult<u32> {
    cxt.param(idx).and_then(|p| p.as_u32()).ok_or(RuntimeError::InvalidInput)
}

fn dim3(cxt: &ApiContext, idx: usize) -> RuntimeResult<(u32, u32, u32)> {
    let bytes = cxt.param(idx).map(|p| p.bytes()).ok_or(RuntimeError::InvalidInput)?;
    if bytes.len() < 12 {
        return Err(RuntimeError::InvalidInput);
    }
    let read = |o: usize| u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap_or([0; 4]));
    Ok((read(0), read(4), read(8)))
}

// ── Launch handlers ────────────────────────────────────────────────

fn wk_malloc(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Memory, 0)?;
    let ptr = shared.driver.mem_alloc(handle.state_size).map_err(RuntimeError::Vendor)?;
    activate_created(shared, &handle, ptr)?;
    debug!(client_id = shared.id, id = handle.id, size = handle.state_size, "memory materialized");
    Ok(())
}

fn wk_free(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Memory, 0)?;
    if handle.status() == HandleStatus::Active {
        shared.driver.mem_free(handle.server_addr()).map_err(RuntimeError::Vendor)?;
    }
    handle.set_status(HandleStatus::Deleted);
    shared.manager(ResourceKind::Memory).release_addr(handle.client_addr);
    Ok(())
}

fn wk_memcpy_h2d(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let view = cxt.view(ResourceKind::Memory, 0).ok_or(RuntimeError::NotFound)?;
    let dst = view.handle.server_addr() + view.offset;
    shared.driver.memcpy_htod(dst, &cxt.staged).map_err(RuntimeError::Vendor)
}

fn wk_memcpy_d2h(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let view = cxt.view(ResourceKind::Memory, 0).ok_or(RuntimeError::NotFound)?;
    let src = view.handle.server_addr() + view.offset;
    let mut buf = vec![0u8; view.size as usize];
    shared.driver.memcpy_dtoh(&mut buf, src).map_err(RuntimeError::Vendor)?;
    cxt.return_data = buf;
    Ok(())
}

fn wk_memcpy_d2d(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let views = cxt.views_of(ResourceKind::Memory);
    let (dst, src) = match views {
        [dst, src, ..] => (dst, src),
        _ => return Err(RuntimeError::NotFound),
    };
    shared
        .driver
        .memcpy_dtod(
            dst.handle.server_addr() + dst.offset,
            src.handle.server_addr() + src.offset,
            dst.size,
        )
        .map_err(RuntimeError::Vendor)
}

/// The critical path: marshal arguments via the cached parameter layout,
/// rewrite device-pointer slots to server addresses, dispatch.
fn wk_launch_kernel(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let function = view_handle(cxt, ResourceKind::Function, 0)?;
    let desc = function.kernel_descriptor().ok_or(RuntimeError::NotReady)?;
    if function.status() != HandleStatus::Active {
        return Err(RuntimeError::NotReady);
    }

    let grid = dim3(cxt, 1)?;
    let block = dim3(cxt, 2)?;
    let shared_mem = need_u32(cxt, 3)?;
    let stream_handle = view_handle(cxt, ResourceKind::Stream, 0)?;

    // Patch every device-pointer slot in the staged block.
    let mem = shared.manager(ResourceKind::Memory);
    let mut args = std::mem::take(&mut cxt.staged);
    let pointer_params = desc
        .input_params
        .iter()
        .chain(desc.output_params.iter())
        .chain(desc.inout_params.iter())
        .copied()
        .chain(desc.confirmed_suspicious.iter().map(|&(idx, _)| idx));
    for idx in pointer_params {
        let offset = desc.param_offsets[idx] as usize;
        let Some(slot) = args.get_mut(offset..offset + 8) else {
            return Err(RuntimeError::InvalidInput);
        };
        let bytes: [u8; 8] = (&*slot).try_into().map_err(|_| RuntimeError::InvalidInput)?;
        let guest_addr = u64::from_le_bytes(bytes);
        let (handle, within) = mem.resolve_within(guest_addr)?;
        let device_addr = handle.server_addr() + within;
        slot.copy_from_slice(&device_addr.to_le_bytes());
    }
    cxt.staged = args;

    let cfg = LaunchConfig {
        grid,
        block,
        shared_mem,
        stream: stream_handle.server_addr(),
    };
    shared
        .driver
        .launch_kernel(function.server_addr(), &cfg, &cxt.staged)
        .map_err(RuntimeError::Vendor)
}

fn wk_stream_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Stream, 0)?;
    let stream = shared.driver.stream_create().map_err(RuntimeError::Vendor)?;
    activate_created(shared, &handle, stream)
}

fn wk_stream_synchronize(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Stream, 0)?;
    shared.driver.stream_synchronize(handle.server_addr()).map_err(RuntimeError::Vendor)
}

fn wk_event_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Event, 0)?;
    let flags = cxt.param(0).and_then(|p| p.as_u32()).unwrap_or(0);
    let event = shared.driver.event_create(flags).map_err(RuntimeError::Vendor)?;
    activate_created(shared, &handle, event)
}

fn wk_event_destroy(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Event, 0)?;
    if handle.status() == HandleStatus::Active {
        shared.driver.event_destroy(handle.server_addr()).map_err(RuntimeError::Vendor)?;
    }
    handle.set_status(HandleStatus::Deleted);
    shared.manager(ResourceKind::Event).release_addr(handle.client_addr);
    Ok(())
}

fn wk_event_record(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let event = view_handle(cxt, ResourceKind::Event, 0)?;
    let stream = view_handle(cxt, ResourceKind::Stream, 0)?;
    shared
        .driver
        .event_record(event.server_addr(), stream.server_addr())
        .map_err(RuntimeError::Vendor)
}

fn wk_set_device(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let ordinal = cxt.param(0).and_then(|p| p.as_i32()).ok_or(RuntimeError::InvalidInput)?;
    shared.driver.set_device(ordinal).map_err(RuntimeError::Vendor)
}

fn wk_get_last_error(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    cxt.return_data = shared.driver.last_error().to_le_bytes().to_vec();
    Ok(())
}

fn wk_get_error_string(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let code = cxt.param(0).and_then(|p| p.as_i32()).ok_or(RuntimeError::InvalidInput)?;
    let mut text = shared.driver.error_string(code).into_bytes();
    text.push(0);
    cxt.return_data = text;
    Ok(())
}

fn wk_get_device_count(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let count = shared.driver.device_count().map_err(RuntimeError::Vendor)?;
    cxt.return_data = count.to_le_bytes().to_vec();
    Ok(())
}

fn wk_get_device(_shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let ordinal = cxt
        .view(ResourceKind::Device, 0)
        .map(|v| v.handle.id as i32)
        .unwrap_or(0);
    cxt.return_data = ordinal.to_le_bytes().to_vec();
    Ok(())
}

fn wk_primary_ctx_get_state(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let ordinal = cxt
        .view(ResourceKind::Device, 0)
        .map(|v| v.handle.id as i32)
        .unwrap_or(0);
    let (flags, active) = shared.driver.primary_ctx_state(ordinal).map_err(RuntimeError::Vendor)?;
    let mut data = flags.to_le_bytes().to_vec();
    data.extend_from_slice(&active.to_le_bytes());
    cxt.return_data = data;
    Ok(())
}

fn wk_module_load(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::Module, 0)?;
    let image = handle.latest_host_value().ok_or(RuntimeError::NotReady)?;
    let module = shared.driver.module_load(&image).map_err(RuntimeError::Vendor)?;
    activate_created(shared, &handle, module)?;
    debug!(client_id = shared.id, id = handle.id, bytes = image.len(), "module loaded");
    Ok(())
}

fn wk_module_get_function(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let function = view_handle(cxt, ResourceKind::Function, 0)?;
    let module = view_handle(cxt, ResourceKind::Module, 0)?;
    let name = function.symbol_name().ok_or(RuntimeError::NotReady)?;
    let func = shared
        .driver
        .module_get_function(module.server_addr(), &name)
        .map_err(RuntimeError::Vendor)?;
    activate_created(shared, &function, func)
}

fn wk_register_var(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let variable = view_handle(cxt, ResourceKind::Variable, 0)?;
    let module = view_handle(cxt, ResourceKind::Module, 0)?;
    let name = variable.symbol_name().ok_or(RuntimeError::NotReady)?;
    match shared.driver.module_get_global(module.server_addr(), &name) {
        Ok((ptr, _size)) => activate_created(shared, &variable, ptr),
        Err(code) if shared.config.tolerate_missing_global => {
            // Vendor lookup failures are masked here; guest frameworks probe
            // for optional globals and treat any error as fatal.
            debug!(client_id = shared.id, name = %name, code, "masking missing global symbol");
            Ok(())
        }
        Err(code) => Err(RuntimeError::Vendor(code)),
    }
}

fn wk_blas_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let handle = view_handle(cxt, ResourceKind::BlasContext, 0)?;
    let blas = shared.driver.blas_create().map_err(RuntimeError::Vendor)?;
    activate_created(shared, &handle, blas)
}

fn wk_blas_set_stream(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas = view_handle(cxt, ResourceKind::BlasContext, 0)?;
    let stream = view_handle(cxt, ResourceKind::Stream, 0)?;
    shared
        .driver
        .blas_set_stream(blas.server_addr(), stream.server_addr())
        .map_err(RuntimeError::Vendor)
}

fn wk_blas_set_math_mode(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas = view_handle(cxt, ResourceKind::BlasContext, 0)?;
    let mode = need_u32(cxt, 1)?;
    shared.driver.blas_set_math_mode(blas.server_addr(), mode).map_err(RuntimeError::Vendor)
}

fn wk_blas_sgemm(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas = view_handle(cxt, ResourceKind::BlasContext, 0)?;
    let views = cxt.views_of(ResourceKind::Memory);
    let [a, b, c] = views else { return Err(RuntimeError::NotFound) };
    let desc = crate::driver::SgemmDesc {
        m: need_u32(cxt, 1)?,
        n: need_u32(cxt, 2)?,
        k: need_u32(cxt, 3)?,
        a: a.handle.server_addr() + a.offset,
        b: b.handle.server_addr() + b.offset,
        c: c.handle.server_addr() + c.offset,
    };
    shared.driver.blas_sgemm(blas.server_addr(), &desc).map_err(RuntimeError::Vendor)
}

fn wk_release_staged(_shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    cxt.staged = Vec::new();
    Ok(())
}
