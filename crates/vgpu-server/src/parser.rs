//! Parser stage of the per-client pipeline.
//!
//! Single-threaded loop over the client's submission queue. Per-API handlers
//! resolve guest addresses to handles, emit the handle-view map, allocate
//! `PendingCreate` handles for Create calls so later calls can reference
//! them, and stage host payloads for the worker. The parser then records the
//! call in the DAG, bumps versions on stateful writes, and forwards the WQE.
//! Parser-stage errors short-circuit: the worker never sees the call and the
//! reply carries the error.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use vgpu_core::apicxt::{ApiContext, HandleView};
use vgpu_core::handle::{HandleMeta, MigrationState};
use vgpu_core::KernelDescriptor;
use vgpu_protocol::{api, AccessDirection, ApiId, ResourceKind, RuntimeError, RuntimeResult};

use crate::client::{ClientShared, OpNode};

type ParserFn = fn(&ClientShared, &mut ApiContext) -> RuntimeResult<()>;

pub(crate) struct Parser {
    shared: Arc<ClientShared>,
    rx: Receiver<Box<ApiContext>>,
    worker_tx: Sender<Box<ApiContext>>,
    table: HashMap<ApiId, ParserFn>,
}

impl Parser {
    pub fn new(
        shared: Arc<ClientShared>,
        rx: Receiver<Box<ApiContext>>,
        worker_tx: Sender<Box<ApiContext>>,
    ) -> Self {
        let mut table: HashMap<ApiId, ParserFn> = HashMap::new();
        table.insert(api::MALLOC, parse_malloc);
        table.insert(api::FREE, parse_free);
        table.insert(api::LAUNCH_KERNEL, parse_launch_kernel);
        table.insert(api::MEMCPY_H2D, parse_memcpy_h2d);
        table.insert(api::MEMCPY_D2H, parse_memcpy_d2h);
        table.insert(api::MEMCPY_D2D, parse_memcpy_d2d);
        table.insert(api::MEMCPY_H2D_ASYNC, parse_memcpy_h2d);
        table.insert(api::MEMCPY_D2H_ASYNC, parse_memcpy_d2h);
        table.insert(api::MEMCPY_D2D_ASYNC, parse_memcpy_d2d);
        table.insert(api::SET_DEVICE, parse_device_scalar);
        table.insert(api::GET_LAST_ERROR, parse_no_views);
        table.insert(api::GET_ERROR_STRING, parse_no_views);
        table.insert(api::GET_DEVICE_COUNT, parse_no_views);
        table.insert(api::GET_DEVICE, parse_no_views);
        table.insert(api::STREAM_CREATE, parse_stream_create);
        table.insert(api::STREAM_SYNCHRONIZE, parse_stream_sync);
        table.insert(api::EVENT_CREATE, parse_event_create);
        table.insert(api::EVENT_DESTROY, parse_event_destroy);
        table.insert(api::EVENT_RECORD, parse_event_record);
        table.insert(api::MODULE_LOAD, parse_module_load);
        table.insert(api::MODULE_GET_FUNCTION, parse_module_get_function);
        table.insert(api::REGISTER_VAR, parse_register_var);
        table.insert(api::PRIMARY_CTX_GET_STATE, parse_device_scalar);
        table.insert(api::BLAS_CREATE, parse_blas_create);
        table.insert(api::BLAS_SET_STREAM, parse_blas_set_stream);
        table.insert(api::BLAS_SET_MATH_MODE, parse_blas_set_math_mode);
        table.insert(api::BLAS_SGEMM, parse_blas_sgemm);
        table.insert(api::CHECKPOINT, parse_checkpoint);

        Self { shared, rx, worker_tx, table }
    }

    pub fn run(self) {
        debug!(client_id = self.shared.id, "parser loop up");
        loop {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(cxt) => self.handle(cxt),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.stop.load(Ordering::Acquire) && self.rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(client_id = self.shared.id, "parser loop down");
    }

    fn handle(&self, mut cxt: Box<ApiContext>) {
        let result = match self.table.get(&cxt.api_id) {
            Some(handler) => handler(&self.shared, &mut cxt),
            None => {
                warn!(client_id = self.shared.id, api = %cxt.api_id, "no parser handler");
                Err(RuntimeError::InvalidInput)
            }
        };

        let result = result.and_then(|()| self.commit(&mut cxt));
        match result {
            Ok(()) => {
                if self.worker_tx.send(cxt).is_err() {
                    warn!(client_id = self.shared.id, "worker queue closed, dropping call");
                }
            }
            Err(err) => {
                debug!(client_id = self.shared.id, api = %cxt.api_id, %err, "parser rejected call");
                cxt.return_code = err.code();
                cxt.publish();
                self.shared.op_retired(&cxt);
            }
        }
    }

    /// Record the call in the DAG and apply stateful-write bookkeeping.
    fn commit(&self, cxt: &mut ApiContext) -> RuntimeResult<()> {
        let neighbors = cxt.neighbor_map();
        let vertex = self.shared.dag.add_t1(
            OpNode { api_id: cxt.api_id, seq: cxt.seq },
            neighbors,
        )?;
        cxt.dag_vertex_id = vertex;

        for kind in [ResourceKind::Memory, ResourceKind::Module] {
            let mgr = self.shared.manager(kind);
            // One write edge per (call, handle): a call touching the same
            // buffer through several parameters still bumps once.
            let mut written: Vec<std::sync::Arc<vgpu_core::Handle>> = Vec::new();
            for view in cxt.views_of(kind) {
                if !view.direction.is_write() {
                    continue;
                }
                if written.iter().any(|h| h.id == view.handle.id) {
                    continue;
                }
                written.push(view.handle.clone());
            }
            for handle in written {
                handle.bump_version();
                mgr.mark_modified(&handle);
                if self.shared.migration.in_progress()
                    && handle.migration_state() == MigrationState::Precopied
                {
                    handle.set_migration_state(MigrationState::Invalidated);
                    self.shared.migration.invalidate(handle.id);
                }
            }
        }
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn need_u64(cxt: &ApiContext, idx: usize) -> RuntimeResult<u64> {
    cxt.param(idx).and_then(|p| p.as_u64()).ok_or(RuntimeError::InvalidInput)
}

fn need_u32(cxt: &ApiContext, idx: usize) -> RuntimeResult<u32> {
    cxt.param(idx).and_then(|p| p.as_u32()).ok_or(RuntimeError::InvalidInput)
}

fn need_str(cxt: &ApiContext, idx: usize) -> RuntimeResult<String> {
    cxt.param(idx)
        .and_then(|p| p.as_str())
        .map(str::to_string)
        .ok_or(RuntimeError::InvalidInput)
}

fn need_bytes(cxt: &ApiContext, idx: usize) -> RuntimeResult<Vec<u8>> {
    cxt.param(idx).map(|p| p.bytes().to_vec()).ok_or(RuntimeError::InvalidInput)
}

fn primary_context_key(shared: &ClientShared) -> RuntimeResult<vgpu_core::HandleKey> {
    shared
        .manager(ResourceKind::Context)
        .get_by_id(0)
        .map(|h| h.key())
        .ok_or(RuntimeError::NotReady)
}

/// Resolve a stream parameter; 0 means the client default stream.
fn stream_view(shared: &ClientShared, cxt: &mut ApiContext, addr: u64) -> RuntimeResult<()> {
    let stream = shared.manager(ResourceKind::Stream).resolve(addr)?;
    cxt.add_view(HandleView::whole(stream, AccessDirection::In));
    Ok(())
}

// ── Per-API handlers ───────────────────────────────────────────────

fn parse_no_views(_shared: &ClientShared, _cxt: &mut ApiContext) -> RuntimeResult<()> {
    Ok(())
}

fn parse_device_scalar(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    // Single ordinal parameter; the device handle itself is read-only.
    let ordinal = cxt.param(0).and_then(|p| p.as_i32()).unwrap_or(0);
    let mgr = shared.manager(ResourceKind::Device);
    if let Some(handle) = mgr.get_by_id(ordinal.max(0) as u64) {
        cxt.add_view(HandleView::whole(handle, AccessDirection::In));
        Ok(())
    } else {
        Err(RuntimeError::NotFound)
    }
}

fn parse_malloc(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let size = need_u64(cxt, 0)?;
    if size == 0 {
        return Err(RuntimeError::InvalidInput);
    }
    let parent = primary_context_key(shared)?;
    let handle = shared.manager(ResourceKind::Memory).allocate(vec![parent], None, size)?;
    shared.ensure_dag_vertex(&handle)?;
    cxt.return_data = handle.client_addr.to_le_bytes().to_vec();
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

fn parse_free(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let addr = need_u64(cxt, 0)?;
    let handle = shared.manager(ResourceKind::Memory).resolve(addr)?;
    cxt.add_view(HandleView::whole(handle, AccessDirection::Delete));
    Ok(())
}

fn parse_memcpy_h2d(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let dst = need_u64(cxt, 0)?;
    let payload = need_bytes(cxt, 1)?;
    let (handle, offset) = shared.manager(ResourceKind::Memory).resolve_within(dst)?;
    if offset + payload.len() as u64 > handle.state_size {
        return Err(RuntimeError::InvalidInput);
    }
    shared.ensure_dag_vertex(&handle)?;
    cxt.add_view(HandleView::ranged(handle, AccessDirection::Out, offset, payload.len() as u64));
    cxt.staged = payload;
    Ok(())
}

fn parse_memcpy_d2h(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let src = need_u64(cxt, 0)?;
    let len = need_u64(cxt, 1)?;
    let (handle, offset) = shared.manager(ResourceKind::Memory).resolve_within(src)?;
    if offset + len > handle.state_size {
        return Err(RuntimeError::InvalidInput);
    }
    shared.ensure_dag_vertex(&handle)?;
    cxt.add_view(HandleView::ranged(handle, AccessDirection::In, offset, len));
    Ok(())
}

fn parse_memcpy_d2d(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let dst = need_u64(cxt, 0)?;
    let src = need_u64(cxt, 1)?;
    let len = need_u64(cxt, 2)?;
    let mgr = shared.manager(ResourceKind::Memory);
    let (dst_handle, dst_off) = mgr.resolve_within(dst)?;
    let (src_handle, src_off) = mgr.resolve_within(src)?;
    if dst_off + len > dst_handle.state_size || src_off + len > src_handle.state_size {
        return Err(RuntimeError::InvalidInput);
    }
    shared.ensure_dag_vertex(&dst_handle)?;
    shared.ensure_dag_vertex(&src_handle)?;
    cxt.add_view(HandleView::ranged(dst_handle, AccessDirection::Out, dst_off, len));
    cxt.add_view(HandleView::ranged(src_handle, AccessDirection::In, src_off, len));
    Ok(())
}

/// params: func, grid(3xu32), block(3xu32), shared_mem, stream, arg block.
fn parse_launch_kernel(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let func_addr = need_u64(cxt, 0)?;
    let stream_addr = need_u64(cxt, 4)?;
    let args = need_bytes(cxt, 5)?;

    let function = shared.manager(ResourceKind::Function).resolve(func_addr)?;
    let Some(desc) = function.kernel_descriptor() else {
        return Err(RuntimeError::NotReady);
    };
    if (args.len() as u64) < desc.cbank_param_size {
        return Err(RuntimeError::InvalidInput);
    }

    cxt.add_view(HandleView::whole(function.clone(), AccessDirection::In));
    stream_view(shared, cxt, stream_addr)?;

    let mem = shared.manager(ResourceKind::Memory);
    let arg_ptr = |idx: usize| -> Option<u64> {
        if desc.param_sizes.get(idx).copied() != Some(8) {
            return None;
        }
        let off = *desc.param_offsets.get(idx)? as usize;
        Some(u64::from_le_bytes(args.get(off..off + 8)?.try_into().ok()?))
    };

    let mut add_mem_view = |idx: usize, direction: AccessDirection| -> RuntimeResult<()> {
        let Some(addr) = arg_ptr(idx) else { return Err(RuntimeError::InvalidInput) };
        let (handle, offset) = mem.resolve_within(addr)?;
        shared.ensure_dag_vertex(&handle)?;
        let size = handle.state_size - offset;
        cxt.add_view(HandleView::ranged(handle, direction, offset, size));
        Ok(())
    };

    for &idx in &desc.input_params {
        add_mem_view(idx, AccessDirection::In)?;
    }
    for &idx in &desc.output_params {
        add_mem_view(idx, AccessDirection::Out)?;
    }
    for &idx in &desc.inout_params {
        add_mem_view(idx, AccessDirection::InOut)?;
    }
    for &(idx, _) in &desc.confirmed_suspicious {
        add_mem_view(idx, AccessDirection::InOut)?;
    }

    // Unconfirmed suspicious slots: a value landing inside a live allocation
    // confirms the parameter as a device pointer from here on.
    for &idx in &desc.suspicious_params {
        if desc.confirmed_suspicious.iter().any(|&(i, _)| i == idx) {
            continue;
        }
        let Some(addr) = arg_ptr(idx) else { continue };
        if let Ok((handle, offset)) = mem.resolve_within(addr) {
            shared.ensure_dag_vertex(&handle)?;
            let size = handle.state_size - offset;
            cxt.add_view(HandleView::ranged(handle, AccessDirection::InOut, offset, size));
            let param_offset = desc.param_offsets[idx];
            function.update_kernel_descriptor(|d| d.confirm_suspicious(idx, param_offset));
        }
    }

    cxt.staged = args;
    Ok(())
}

fn parse_stream_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let parent = primary_context_key(shared)?;
    let handle = shared.manager(ResourceKind::Stream).allocate(vec![parent], None, 0)?;
    cxt.return_data = handle.client_addr.to_le_bytes().to_vec();
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

fn parse_stream_sync(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let stream = need_u64(cxt, 0)?;
    stream_view(shared, cxt, stream)
}

fn parse_event_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let parent = primary_context_key(shared)?;
    let handle = shared.manager(ResourceKind::Event).allocate(vec![parent], None, 0)?;
    cxt.return_data = handle.client_addr.to_le_bytes().to_vec();
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

fn parse_event_destroy(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let addr = need_u64(cxt, 0)?;
    let handle = shared.manager(ResourceKind::Event).resolve(addr)?;
    cxt.add_view(HandleView::whole(handle, AccessDirection::Delete));
    Ok(())
}

fn parse_event_record(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let event_addr = need_u64(cxt, 0)?;
    let stream_addr = need_u64(cxt, 1)?;
    let event = shared.manager(ResourceKind::Event).resolve(event_addr)?;
    cxt.add_view(HandleView::whole(event, AccessDirection::Out));
    stream_view(shared, cxt, stream_addr)
}

/// params: module key (guest-assigned address), image blob.
fn parse_module_load(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let key = need_u64(cxt, 0)?;
    let image = need_bytes(cxt, 1)?;
    if image.is_empty() {
        return Err(RuntimeError::InvalidInput);
    }
    let parent = primary_context_key(shared)?;
    let hint = if key == 0 { None } else { Some(key) };
    let handle = shared
        .manager(ResourceKind::Module)
        .allocate(vec![parent], hint, image.len() as u64)?;
    shared.ensure_dag_vertex(&handle)?;
    // Stage the image once; the worker loads it without a second copy.
    handle.stash_host_value(handle.latest_version(), Arc::new(image));
    cxt.return_data = handle.client_addr.to_le_bytes().to_vec();
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

/// params: module key, guest function address, _, mangled name, thread limit.
fn parse_module_get_function(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let module_key = need_u64(cxt, 0)?;
    let func_addr = need_u64(cxt, 1)?;
    let name = need_str(cxt, 3)?;

    let module_mgr = shared.manager(ResourceKind::Module);
    let module = module_mgr.resolve(module_key)?;
    let descriptor = module_mgr
        .cached_function_meta(&name)
        .unwrap_or_else(|| KernelDescriptor::from_mangled(&name));

    let handle = shared
        .manager(ResourceKind::Function)
        .allocate(vec![module.key()], Some(func_addr), 0)?;
    handle.set_meta(HandleMeta::Kernel(descriptor));

    cxt.add_view(HandleView::whole(module, AccessDirection::In));
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

/// params: module key, guest variable address, symbol name.
fn parse_register_var(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let module_key = need_u64(cxt, 0)?;
    let var_addr = need_u64(cxt, 1)?;
    let name = need_str(cxt, 2)?;

    let module = shared.manager(ResourceKind::Module).resolve(module_key)?;
    let handle = shared
        .manager(ResourceKind::Variable)
        .allocate(vec![module.key()], Some(var_addr), 0)?;
    handle.set_meta(HandleMeta::Symbol { name });

    cxt.add_view(HandleView::whole(module, AccessDirection::In));
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

fn parse_blas_create(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let hint = need_u64(cxt, 0)?;
    let parent = primary_context_key(shared)?;
    let hint = if hint == 0 { None } else { Some(hint) };
    let handle = shared.manager(ResourceKind::BlasContext).allocate(vec![parent], hint, 0)?;
    cxt.return_data = handle.client_addr.to_le_bytes().to_vec();
    cxt.add_view(HandleView::whole(handle, AccessDirection::Create));
    Ok(())
}

fn parse_blas_set_stream(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas_addr = need_u64(cxt, 0)?;
    let stream_addr = need_u64(cxt, 1)?;
    let blas = shared.manager(ResourceKind::BlasContext).resolve(blas_addr)?;
    cxt.add_view(HandleView::whole(blas, AccessDirection::Out));
    stream_view(shared, cxt, stream_addr)
}

fn parse_blas_set_math_mode(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas_addr = need_u64(cxt, 0)?;
    let _mode = need_u32(cxt, 1)?;
    let blas = shared.manager(ResourceKind::BlasContext).resolve(blas_addr)?;
    cxt.add_view(HandleView::whole(blas, AccessDirection::Out));
    Ok(())
}

/// params: blas, m, n, k, a, b, c.
fn parse_blas_sgemm(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    let blas_addr = need_u64(cxt, 0)?;
    for idx in 1..=3 {
        if need_u32(cxt, idx)? == 0 {
            return Err(RuntimeError::InvalidInput);
        }
    }
    let blas = shared.manager(ResourceKind::BlasContext).resolve(blas_addr)?;
    cxt.add_view(HandleView::whole(blas, AccessDirection::In));

    let mem = shared.manager(ResourceKind::Memory);
    for (idx, direction) in [(4, AccessDirection::In), (5, AccessDirection::In), (6, AccessDirection::InOut)] {
        let addr = need_u64(cxt, idx)?;
        let (handle, offset) = mem.resolve_within(addr)?;
        shared.ensure_dag_vertex(&handle)?;
        let size = handle.state_size - offset;
        cxt.add_view(HandleView::ranged(handle, direction, offset, size));
    }
    Ok(())
}

/// The checkpoint call reads every stateful handle modified since the last
/// checkpoint; the worker-side engine consumes these views.
fn parse_checkpoint(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    for mgr in shared.registry.stateful() {
        for handle in mgr.modified_set() {
            shared.ensure_dag_vertex(&handle)?;
            cxt.add_view(HandleView::whole(handle, AccessDirection::In));
        }
    }
    Ok(())
}
