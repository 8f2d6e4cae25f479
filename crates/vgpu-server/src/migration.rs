//! Live migration of a client's device state to another accelerator.
//!
//! Strategy by optimization level: level 0 only offers the full-snapshot
//! fallbacks (allcopy / allreload); level 1 runs the staged path: precopy
//! the modified set over a dedicated stream, delta-copy whatever the guest
//! dirtied in between, tear down and rebuild the context objects, cut over,
//! and reload host-resident buffers on demand in the background. Per-handle
//! copy failures are logged and skipped; the aggregate only surfaces when a
//! post-cutover reference hits a buffer that never made it across.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use vgpu_core::handle::{Handle, HandleStatus, MigrationState, StateStatus};
use vgpu_core::{MigrOptLevel, RuntimeConfig};
use vgpu_protocol::{ResourceKind, RuntimeError, RuntimeResult};

use crate::client::ClientShared;
use crate::state::HandleStateOps;

/// Per-client migration bookkeeping shared with the parser (which flips
/// precopied handles to invalidated on write).
#[derive(Default)]
pub struct MigrationContext {
    active: AtomicBool,
    cutover: AtomicBool,
    /// Memory-handle id watermark at cutover; handles below it must be
    /// `RemoteActive` to be referenced again.
    cutover_boundary: AtomicU64,
    dst_device: AtomicI32,
    precopied: Mutex<BTreeSet<u64>>,
    invalidated: Mutex<BTreeSet<u64>>,
    /// Host-stateful handles recorded during precopy for reload dedup.
    host_resident: Mutex<BTreeSet<u64>>,
}

impl MigrationContext {
    pub fn in_progress(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn cutover_done(&self) -> bool {
        self.cutover.load(Ordering::Acquire)
    }

    /// Whether a memory handle predates the cutover and therefore must have
    /// completed migration before it can be touched.
    pub fn predates_cutover(&self, handle_id: u64) -> bool {
        self.cutover_done() && handle_id < self.cutover_boundary.load(Ordering::Acquire)
    }

    pub fn invalidate(&self, handle_id: u64) {
        self.invalidated.lock().insert(handle_id);
    }

    pub fn destination_device(&self) -> i32 {
        self.dst_device.load(Ordering::Acquire)
    }

    pub fn nb_precopied(&self) -> usize {
        self.precopied.lock().len()
    }

    pub fn nb_invalidated(&self) -> usize {
        self.invalidated.lock().len()
    }

    pub fn nb_host_resident(&self) -> usize {
        self.host_resident.lock().len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationStats {
    pub nb_handles: u64,
    pub bytes: u64,
}

/// One migration strategy per configured optimization level.
pub struct MigrationEngine {
    level: MigrOptLevel,
    dst_device: i32,
}

impl MigrationEngine {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self { level: config.migr_opt_level, dst_device: 1 }
    }

    pub fn with_destination(level: MigrOptLevel, dst_device: i32) -> Self {
        Self { level, dst_device }
    }

    fn require_staged(&self) -> RuntimeResult<()> {
        if self.level == MigrOptLevel::Disabled {
            return Err(RuntimeError::InvalidInput);
        }
        Ok(())
    }

    /// Open the migration window: from here on the parser tracks writes to
    /// precopied handles as invalidations.
    pub fn begin(&self, shared: &ClientShared) -> RuntimeResult<()> {
        self.require_staged()?;
        shared.migration.dst_device.store(self.dst_device, Ordering::Release);
        shared.migration.active.store(true, Ordering::Release);
        shared.migration.cutover.store(false, Ordering::Release);
        shared.migration.precopied.lock().clear();
        shared.migration.invalidated.lock().clear();
        shared.migration.host_resident.lock().clear();
        info!(client_id = shared.id, dst_device = self.dst_device, "migration window opened");
        Ok(())
    }

    /// Copy every modified memory handle to the destination device on the
    /// precopy stream. Host-stateful handles are additionally recorded so
    /// the on-demand reload can dedup; they are still copied, dedup happens
    /// host-side.
    pub fn precopy(&self, shared: &ClientShared) -> RuntimeResult<MigrationStats> {
        self.require_staged()?;
        let mem = shared.manager(ResourceKind::Memory);
        let stream = shared.streams.precopy_stream.load(Ordering::Acquire);
        let mut stats = MigrationStats::default();
        let mut host_stats = MigrationStats::default();

        for handle in mem.modified_set() {
            if mem.is_host_stateful(&handle) {
                shared.migration.host_resident.lock().insert(handle.id);
                host_stats.nb_handles += 1;
                host_stats.bytes += handle.state_size;
            }
            if self.copy_to_destination(shared, &handle, stream).is_err() {
                continue;
            }
            handle.set_migration_state(MigrationState::Precopied);
            shared.migration.precopied.lock().insert(handle.id);
            stats.nb_handles += 1;
            stats.bytes += handle.state_size;
        }
        mem.clear_modified();

        info!(
            client_id = shared.id,
            nb = stats.nb_handles,
            bytes = stats.bytes,
            host_resident = host_stats.nb_handles,
            "precopy done"
        );
        Ok(stats)
    }

    /// Re-copy handles invalidated between precopy and cutover, skipping
    /// host-stateful ones (their bytes reload from host memory).
    pub fn deltacopy(&self, shared: &ClientShared) -> RuntimeResult<MigrationStats> {
        self.require_staged()?;
        let mem = shared.manager(ResourceKind::Memory);
        let stream = shared.streams.precopy_stream.load(Ordering::Acquire);
        let mut stats = MigrationStats::default();

        let invalidated: Vec<u64> = shared.migration.invalidated.lock().iter().copied().collect();
        for id in invalidated {
            let Some(handle) = mem.get_by_id(id) else { continue };
            if mem.is_host_stateful(&handle) {
                // No bytes shipped: the on-demand reload supplies them from
                // the host copy after cutover.
                handle.set_migration_state(MigrationState::Precopied);
                continue;
            }
            if self.copy_to_destination(shared, &handle, stream).is_err() {
                continue;
            }
            handle.set_migration_state(MigrationState::Precopied);
            stats.nb_handles += 1;
            stats.bytes += handle.state_size;
        }
        shared.migration.invalidated.lock().clear();

        info!(client_id = shared.id, nb = stats.nb_handles, bytes = stats.bytes, "deltacopy done");
        Ok(stats)
    }

    fn copy_to_destination(
        &self,
        shared: &ClientShared,
        handle: &Arc<Handle>,
        stream: u64,
    ) -> RuntimeResult<()> {
        if handle.remote_server_addr() == 0 {
            match shared.driver.mem_alloc_on(self.dst_device, handle.state_size) {
                Ok(ptr) => handle.set_remote_server_addr(ptr),
                Err(code) => {
                    warn!(id = handle.id, code, "destination allocation failed, skipping handle");
                    return Err(RuntimeError::Vendor(code));
                }
            }
        }
        if let Err(code) = shared.driver.memcpy_peer_async(
            handle.remote_server_addr(),
            self.dst_device,
            handle.server_addr(),
            0,
            handle.state_size,
            stream,
        ) {
            warn!(id = handle.id, code, "peer copy failed, skipping handle");
            return Err(RuntimeError::Vendor(code));
        }
        if let Err(code) = shared.driver.stream_synchronize(stream) {
            warn!(id = handle.id, code, "peer copy sync failed, skipping handle");
            return Err(RuntimeError::Vendor(code));
        }
        Ok(())
    }

    /// Destroy context-level vendor objects: BLAS first, then streams, then
    /// optionally modules and functions. Destroyed handles go `Broken`.
    pub fn tear_context(&self, shared: &ClientShared, do_tear_module: bool) {
        debug!(client_id = shared.id, do_tear_module, "tearing context");

        for handle in shared.manager(ResourceKind::BlasContext).handles() {
            if handle.status() == HandleStatus::Active {
                let _ = shared.driver.blas_destroy(handle.server_addr());
                handle.set_status(HandleStatus::Broken);
            }
        }
        for handle in shared.manager(ResourceKind::Stream).handles() {
            if handle.status() == HandleStatus::Active {
                let _ = shared.driver.stream_destroy(handle.server_addr());
                handle.set_status(HandleStatus::Broken);
            }
        }
        if do_tear_module {
            for handle in shared.manager(ResourceKind::Module).handles() {
                if handle.status() == HandleStatus::Active {
                    let _ = shared.driver.module_unload(handle.server_addr());
                    handle.set_status(HandleStatus::Broken);
                }
            }
            for handle in shared.manager(ResourceKind::Function).handles() {
                if handle.status() == HandleStatus::Active {
                    handle.set_status(HandleStatus::Broken);
                }
            }
        }
    }

    /// Rebuild vendor objects in reverse teardown order.
    pub fn restore_context(&self, shared: &ClientShared, do_restore_module: bool) -> RuntimeResult<()> {
        debug!(client_id = shared.id, do_restore_module, "restoring context");

        let restore_kind = |kind: ResourceKind| {
            for handle in shared.manager(kind).handles() {
                if handle.status() != HandleStatus::Broken {
                    continue;
                }
                let parents = shared.registry.resolve_parents(&handle);
                if let Err(err) = handle.restore(shared.driver.as_ref(), &parents) {
                    warn!(kind = %kind, id = handle.id, %err, "restore failed");
                }
            }
        };

        restore_kind(ResourceKind::BlasContext);
        restore_kind(ResourceKind::Stream);
        if do_restore_module {
            restore_kind(ResourceKind::Module);
            restore_kind(ResourceKind::Function);
        }

        // The worker's private streams were torn with the rest; re-point the
        // default stream at the rebuilt handle.
        if let Some(default) = shared.manager(ResourceKind::Stream).get_by_id(0) {
            if default.status() == HandleStatus::Active {
                shared.streams.default_stream.store(default.server_addr(), Ordering::Release);
            }
        }
        Ok(())
    }

    /// Flip precopied handles to the destination device. After this, any
    /// reference to a memory handle that never reached `RemoteActive` is a
    /// fatal client error.
    pub fn cutover(&self, shared: &ClientShared) -> RuntimeResult<()> {
        self.require_staged()?;
        let mem = shared.manager(ResourceKind::Memory);
        let precopied: Vec<u64> = shared.migration.precopied.lock().iter().copied().collect();
        for id in precopied {
            let Some(handle) = mem.get_by_id(id) else { continue };
            if handle.migration_state() != MigrationState::Precopied {
                continue;
            }
            handle.set_server_addr(handle.remote_server_addr());
            handle.set_migration_state(MigrationState::RemoteActive);
        }
        shared
            .migration
            .cutover_boundary
            .store(mem.nb_handles() as u64, Ordering::Release);
        shared.migration.cutover.store(true, Ordering::Release);
        shared.migration.active.store(false, Ordering::Release);
        info!(client_id = shared.id, "migration cutover complete");
        Ok(())
    }

    /// Background reload of host-resident handles recorded at precopy.
    pub fn ondemand_reload(&self, shared: Arc<ClientShared>) -> thread::JoinHandle<MigrationStats> {
        let stream = shared.streams.precopy_stream.load(Ordering::Acquire);
        thread::spawn(move || {
            let mem = shared.manager(ResourceKind::Memory);
            let ids: Vec<u64> = shared.migration.host_resident.lock().iter().copied().collect();
            let mut stats = MigrationStats::default();
            for id in ids {
                let Some(handle) = mem.get_by_id(id) else { continue };
                match handle.reload_state(stream, shared.driver.as_ref()) {
                    Ok(()) => {
                        handle.set_state_status(StateStatus::StateReady);
                        stats.nb_handles += 1;
                        stats.bytes += handle.state_size;
                    }
                    Err(err) => {
                        warn!(id = handle.id, %err, "on-demand reload failed");
                    }
                }
            }
            debug!(client_id = shared.id, nb = stats.nb_handles, "on-demand reload done");
            stats
        })
    }

    /// Fallback full snapshot: commit every active memory handle at its
    /// current version.
    pub fn allcopy(&self, shared: &ClientShared) -> RuntimeResult<MigrationStats> {
        let mem = shared.manager(ResourceKind::Memory);
        let mut stats = MigrationStats::default();
        for handle in mem.handles() {
            if handle.status() != HandleStatus::Active {
                continue;
            }
            let version = handle.latest_version();
            if let Err(err) = handle.checkpoint_commit_sync(version, shared.driver.as_ref()) {
                warn!(id = handle.id, %err, "allcopy commit failed");
                handle.ckpt_bag.discard(version);
                continue;
            }
            stats.nb_handles += 1;
            stats.bytes += handle.state_size;
        }
        info!(client_id = shared.id, nb = stats.nb_handles, bytes = stats.bytes, "allcopy done");
        Ok(stats)
    }

    /// Fallback full reload of every active memory handle.
    pub fn allreload(&self, shared: &ClientShared) -> RuntimeResult<MigrationStats> {
        let mem = shared.manager(ResourceKind::Memory);
        let mut stats = MigrationStats::default();
        for handle in mem.handles() {
            if handle.status() != HandleStatus::Active {
                continue;
            }
            if let Err(err) = handle.reload_state(0, shared.driver.as_ref()) {
                warn!(id = handle.id, %err, "allreload failed");
                continue;
            }
            stats.nb_handles += 1;
            stats.bytes += handle.state_size;
        }
        info!(client_id = shared.id, nb = stats.nb_handles, bytes = stats.bytes, "allreload done");
        Ok(stats)
    }
}

// ── Checkpoint-directory persistence ───────────────────────────────
//
// The startup restore path: a checkpoint directory holds every manager's
// handle metadata plus one state file per stateful handle.

pub fn persist_checkpoint(shared: &ClientShared, dir: &Path) -> RuntimeResult<()> {
    std::fs::create_dir_all(dir)?;
    for mgr in shared.registry.all() {
        mgr.persist_without_state_sync(dir)?;
    }
    for mgr in shared.registry.stateful() {
        for handle in mgr.handles() {
            if handle.status() != HandleStatus::Active {
                continue;
            }
            let bytes = match handle.ckpt_bag.latest() {
                Some((_, bytes)) => bytes,
                None => match handle.latest_host_value() {
                    Some(blob) => (*blob).clone(),
                    None => continue,
                },
            };
            let path = dir.join(format!("{}-{}.state", handle.kind, handle.id));
            std::fs::write(path, bytes)?;
        }
    }
    info!(client_id = shared.id, dir = %dir.display(), "checkpoint persisted");
    Ok(())
}

/// Rebuild managers from a checkpoint directory. Handles come back
/// `WaitingReload`; the worker restores and reloads them lazily on first
/// touch.
pub fn restore_checkpoint(shared: &ClientShared, dir: &Path) -> RuntimeResult<()> {
    // Managers were bootstrapped with ambient handles (devices, primary
    // context, default stream); only load kinds the bootstrap leaves empty.
    for kind in [
        ResourceKind::BlasContext,
        ResourceKind::Event,
        ResourceKind::Module,
        ResourceKind::Function,
        ResourceKind::Variable,
        ResourceKind::Memory,
    ] {
        let mgr = shared.manager(kind);
        let count = mgr.load(dir)?;
        if count == 0 {
            continue;
        }
        for handle in mgr.handles() {
            if !kind.is_stateful() {
                continue;
            }
            let path = dir.join(format!("{}-{}.state", kind, handle.id));
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if kind == ResourceKind::Module {
                        handle.stash_host_value(handle.latest_version(), Arc::new(bytes));
                    } else {
                        let version = handle.latest_version();
                        if let Err(err) = handle.ckpt_bag.commit(version, bytes, false) {
                            warn!(kind = %kind, id = handle.id, %err, "state slot restore failed");
                        }
                    }
                }
                Err(_) => {
                    debug!(kind = %kind, id = handle.id, "no state file, metadata-only restore");
                }
            }
        }
        info!(client_id = shared.id, kind = %kind, count, "restored handles from checkpoint");
    }
    Ok(())
}
