//! Shadow objects for accelerator-visible resources.
//!
//! A handle pairs the address the guest believes it owns with the real
//! accelerator address, tracks lifecycle status and per-version checkpoint
//! state, and records its parents (a function's parent[0] is its module, a
//! memory buffer's parent[0] is its context, ...). Managers own handles;
//! every other site holds an `Arc` or a stable id and resolves.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use vgpu_protocol::{ResourceKind, RuntimeError, RuntimeResult};

use crate::ckpt::CheckpointBag;
use crate::dag::VertexId;
use crate::kernel_meta::KernelDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleStatus {
    NotReady,
    WaitingReload,
    Active,
    Deleted,
    Broken,
    PendingCreate,
}

/// Whether the handle's bytes have been rebuilt on the current device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateStatus {
    NotReady,
    StateReady,
}

/// Per-handle position in the live-migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    None,
    Precopied,
    Invalidated,
    RemoteActive,
}

/// Stable reference to a handle: kind + id within that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleKey {
    pub kind: ResourceKind,
    pub id: u64,
}

/// Type-specific metadata.
#[derive(Debug, Clone, Default)]
pub enum HandleMeta {
    #[default]
    None,
    Device {
        ordinal: i32,
    },
    /// Module/variable symbol name.
    Symbol {
        name: String,
    },
    Kernel(KernelDescriptor),
}

#[derive(Debug)]
struct HandleMut {
    status: HandleStatus,
    state_status: StateStatus,
    server_addr: u64,
    remote_server_addr: u64,
    latest_version: u64,
    migration: MigrationState,
    dag_vertex: Option<VertexId>,
}

#[derive(Debug)]
pub struct Handle {
    pub id: u64,
    pub kind: ResourceKind,
    pub client_addr: u64,
    /// Byte size of device state; fixed at creation, zero for stateless
    /// kinds.
    pub state_size: u64,
    pub parents: Vec<HandleKey>,
    pub ckpt_bag: CheckpointBag,
    mutable: RwLock<HandleMut>,
    /// Version-indexed host blobs staged by the parser (module images) so
    /// the worker dispatches without a second copy.
    host_values: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
    meta: RwLock<HandleMeta>,
}

impl Handle {
    pub fn new(
        id: u64,
        kind: ResourceKind,
        client_addr: u64,
        state_size: u64,
        parents: Vec<HandleKey>,
        ckpt_high_water: usize,
    ) -> Self {
        Self {
            id,
            kind,
            client_addr,
            state_size,
            parents,
            ckpt_bag: CheckpointBag::with_high_water(ckpt_high_water),
            mutable: RwLock::new(HandleMut {
                status: HandleStatus::PendingCreate,
                state_status: StateStatus::NotReady,
                server_addr: 0,
                remote_server_addr: 0,
                latest_version: 0,
                migration: MigrationState::None,
                dag_vertex: None,
            }),
            host_values: Mutex::new(HashMap::new()),
            meta: RwLock::new(HandleMeta::None),
        }
    }

    pub fn key(&self) -> HandleKey {
        HandleKey { kind: self.kind, id: self.id }
    }

    pub fn status(&self) -> HandleStatus {
        self.mutable.read().status
    }

    pub fn set_status(&self, status: HandleStatus) {
        self.mutable.write().status = status;
    }

    /// Activate once materialized on the accelerator. Refuses activation
    /// while any parent is broken; resolving parents is the caller's job
    /// since only managers can map keys to handles.
    pub fn activate(&self, server_addr: u64, parents: &[Arc<Handle>]) -> RuntimeResult<()> {
        if parents.len() < self.parents.len() {
            return Err(RuntimeError::NotReady);
        }
        if parents.iter().any(|p| p.status() == HandleStatus::Broken) {
            tracing::warn!(
                kind = %self.kind,
                id = self.id,
                "refusing to activate handle under a broken parent"
            );
            return Err(RuntimeError::NotReady);
        }
        let mut m = self.mutable.write();
        m.server_addr = server_addr;
        m.status = HandleStatus::Active;
        Ok(())
    }

    pub fn server_addr(&self) -> u64 {
        self.mutable.read().server_addr
    }

    pub fn set_server_addr(&self, addr: u64) {
        self.mutable.write().server_addr = addr;
    }

    pub fn remote_server_addr(&self) -> u64 {
        self.mutable.read().remote_server_addr
    }

    pub fn set_remote_server_addr(&self, addr: u64) {
        self.mutable.write().remote_server_addr = addr;
    }

    pub fn state_status(&self) -> StateStatus {
        self.mutable.read().state_status
    }

    pub fn set_state_status(&self, s: StateStatus) {
        self.mutable.write().state_status = s;
    }

    pub fn latest_version(&self) -> u64 {
        self.mutable.read().latest_version
    }

    /// Record one mutation of the handle's bytes; strictly monotonic.
    pub fn bump_version(&self) -> u64 {
        let mut m = self.mutable.write();
        m.latest_version += 1;
        m.latest_version
    }

    pub fn migration_state(&self) -> MigrationState {
        self.mutable.read().migration
    }

    pub fn set_migration_state(&self, s: MigrationState) {
        self.mutable.write().migration = s;
    }

    pub fn dag_vertex(&self) -> Option<VertexId> {
        self.mutable.read().dag_vertex
    }

    pub fn set_dag_vertex(&self, v: VertexId) {
        self.mutable.write().dag_vertex = Some(v);
    }

    pub fn stash_host_value(&self, version: u64, value: Arc<Vec<u8>>) {
        self.host_values.lock().insert(version, value);
    }

    pub fn host_value(&self, version: u64) -> Option<Arc<Vec<u8>>> {
        self.host_values.lock().get(&version).cloned()
    }

    pub fn latest_host_value(&self) -> Option<Arc<Vec<u8>>> {
        let values = self.host_values.lock();
        values.iter().max_by_key(|(&v, _)| v).map(|(_, blob)| blob.clone())
    }

    pub fn meta(&self) -> HandleMeta {
        self.meta.read().clone()
    }

    pub fn set_meta(&self, meta: HandleMeta) {
        *self.meta.write() = meta;
    }

    pub fn symbol_name(&self) -> Option<String> {
        match &*self.meta.read() {
            HandleMeta::Symbol { name } => Some(name.clone()),
            HandleMeta::Kernel(desc) => Some(desc.name.clone()),
            _ => None,
        }
    }

    pub fn kernel_descriptor(&self) -> Option<KernelDescriptor> {
        match &*self.meta.read() {
            HandleMeta::Kernel(desc) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn update_kernel_descriptor(&self, f: impl FnOnce(&mut KernelDescriptor)) {
        if let HandleMeta::Kernel(desc) = &mut *self.meta.write() {
            f(desc);
        }
    }

    /// Snapshot of the persisted metadata (no state bytes).
    pub fn record(&self) -> HandleRecord {
        let m = self.mutable.read();
        HandleRecord {
            id: self.id,
            kind: self.kind,
            client_addr: self.client_addr,
            state_size: self.state_size,
            parents: self.parents.clone(),
            status: m.status,
            server_addr: m.server_addr,
            latest_version: m.latest_version,
            symbol: self.symbol_name(),
            kernel: self.kernel_descriptor(),
        }
    }

    /// Write metadata only; the state bytes travel through the checkpoint
    /// bag, not this file.
    pub fn persist_without_state_sync(&self, dir: &Path) -> RuntimeResult<()> {
        let record = self.record();
        let path = dir.join(format!("{}-{}.json", self.kind, self.id));
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &record).map_err(|_| RuntimeError::Failed)?;
        Ok(())
    }

    /// Rebuild a handle from persisted metadata. Materialization on the
    /// accelerator is deferred: the handle comes back `WaitingReload` with
    /// no server address.
    pub fn from_record(record: HandleRecord, ckpt_high_water: usize) -> Self {
        let handle = Handle::new(
            record.id,
            record.kind,
            record.client_addr,
            record.state_size,
            record.parents,
            ckpt_high_water,
        );
        {
            let mut m = handle.mutable.write();
            m.status = HandleStatus::WaitingReload;
            m.latest_version = record.latest_version;
        }
        if let Some(desc) = record.kernel {
            handle.set_meta(HandleMeta::Kernel(desc));
        } else if let Some(name) = record.symbol {
            handle.set_meta(HandleMeta::Symbol { name });
        }
        handle
    }
}

/// Persisted handle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleRecord {
    pub id: u64,
    pub kind: ResourceKind,
    pub client_addr: u64,
    pub state_size: u64,
    pub parents: Vec<HandleKey>,
    pub status: HandleStatus,
    pub server_addr: u64,
    pub latest_version: u64,
    pub symbol: Option<String>,
    pub kernel: Option<KernelDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_handle(id: u64) -> Handle {
        Handle::new(
            id,
            ResourceKind::Memory,
            0x1000,
            4096,
            vec![HandleKey { kind: ResourceKind::Context, id: 0 }],
            4,
        )
    }

    #[test]
    fn version_is_strictly_monotonic() {
        let h = memory_handle(0);
        assert_eq!(h.latest_version(), 0);
        assert_eq!(h.bump_version(), 1);
        assert_eq!(h.bump_version(), 2);
    }

    #[test]
    fn activation_requires_live_parents() {
        let ctx = Arc::new(Handle::new(0, ResourceKind::Context, 0, 0, Vec::new(), 4));
        ctx.set_status(HandleStatus::Active);
        let h = memory_handle(0);
        h.activate(0xdead_0000, &[ctx.clone()]).unwrap();
        assert_eq!(h.status(), HandleStatus::Active);
        assert_eq!(h.server_addr(), 0xdead_0000);

        ctx.set_status(HandleStatus::Broken);
        let orphan = memory_handle(1);
        assert_eq!(orphan.activate(0xbeef_0000, &[ctx]), Err(RuntimeError::NotReady));
        assert_eq!(orphan.status(), HandleStatus::PendingCreate);
    }

    #[test]
    fn record_round_trip_defers_materialization() {
        let h = memory_handle(3);
        h.set_server_addr(0xaaaa);
        h.set_status(HandleStatus::Active);
        h.bump_version();

        let dir = tempfile::tempdir().unwrap();
        h.persist_without_state_sync(dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join("memory-3.json")).unwrap();
        let record: HandleRecord = serde_json::from_str(&text).unwrap();
        let back = Handle::from_record(record, 4);
        assert_eq!(back.status(), HandleStatus::WaitingReload);
        assert_eq!(back.server_addr(), 0);
        assert_eq!(back.latest_version(), 1);
        assert_eq!(back.client_addr, 0x1000);
        assert_eq!(back.state_size, 4096);
    }

    #[test]
    fn latest_host_value_picks_newest_version() {
        let h = memory_handle(0);
        h.stash_host_value(1, Arc::new(vec![1]));
        h.stash_host_value(4, Arc::new(vec![4]));
        assert_eq!(*h.latest_host_value().unwrap(), vec![4]);
    }
}
