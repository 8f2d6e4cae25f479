//! Per-kind handle ownership.
//!
//! One manager per resource kind per client. The manager owns its handles,
//! hands out client-side addresses, resolves guest addresses back to
//! handles, and (for stateful kinds) tracks the modified set the checkpoint
//! and migration engines consume. Managers related by the resource hierarchy
//! are wired together at client init by injecting the parents' handles.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use vgpu_protocol::{ResourceKind, RuntimeError, RuntimeResult};

use crate::handle::{Handle, HandleKey, HandleRecord};
use crate::kernel_meta::KernelDescriptor;

/// Client-address space: every kind starts low and grows by page-aligned
/// steps; uniqueness is only required within a (kind, client) pair.
const ADDR_BASE: u64 = 0x1000;
const ADDR_ALIGN: u64 = 0x1000;

pub struct HandleManager {
    kind: ResourceKind,
    ckpt_high_water: usize,
    handles: RwLock<Vec<Arc<Handle>>>,
    /// client_addr -> handle id; ordered so interior pointers can find their
    /// containing allocation.
    by_addr: Mutex<BTreeMap<u64, u64>>,
    next_addr: Mutex<u64>,
    /// Stateful handles written since the last checkpoint.
    modified: Mutex<BTreeSet<u64>>,
    /// Handles whose authoritative bytes already live in host memory.
    host_stateful: Mutex<HashSet<u64>>,
    related: HashMap<ResourceKind, Vec<Arc<Handle>>>,
    /// Kernel parameter layouts loaded from the cache file (Module manager).
    kernel_metas: Mutex<HashMap<String, KernelDescriptor>>,
    meta_cache_loaded: AtomicBool,
}

impl HandleManager {
    pub fn new(
        kind: ResourceKind,
        related: HashMap<ResourceKind, Vec<Arc<Handle>>>,
        ckpt_high_water: usize,
    ) -> Self {
        Self {
            kind,
            ckpt_high_water,
            handles: RwLock::new(Vec::new()),
            by_addr: Mutex::new(BTreeMap::new()),
            next_addr: Mutex::new(ADDR_BASE),
            modified: Mutex::new(BTreeSet::new()),
            host_stateful: Mutex::new(HashSet::new()),
            related,
            kernel_metas: Mutex::new(HashMap::new()),
            meta_cache_loaded: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_stateful(&self) -> bool {
        self.kind.is_stateful()
    }

    /// Parent handles injected at init.
    pub fn related(&self, kind: ResourceKind) -> &[Arc<Handle>] {
        self.related.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Create a handle in `PendingCreate`, reserving a client address so the
    /// guest can reference the object before the worker materializes it.
    pub fn allocate(
        &self,
        parents: Vec<HandleKey>,
        client_addr_hint: Option<u64>,
        state_size: u64,
    ) -> RuntimeResult<Arc<Handle>> {
        let mut by_addr = self.by_addr.lock();

        let client_addr = match client_addr_hint {
            Some(addr) => {
                if by_addr.contains_key(&addr) {
                    return Err(RuntimeError::AlreadyExist);
                }
                addr
            }
            None => {
                let mut next = self.next_addr.lock();
                let step = state_size.max(1).div_ceil(ADDR_ALIGN) * ADDR_ALIGN;
                // Hint-reserved or reloaded addresses may sit in the path.
                while by_addr.contains_key(&*next) {
                    *next += ADDR_ALIGN;
                }
                let addr = *next;
                *next += step;
                addr
            }
        };

        let mut handles = self.handles.write();
        let id = handles.len() as u64;
        let handle = Arc::new(Handle::new(
            id,
            self.kind,
            client_addr,
            state_size,
            parents,
            self.ckpt_high_water,
        ));
        handles.push(handle.clone());
        by_addr.insert(client_addr, id);
        Ok(handle)
    }

    /// Exact client-address lookup.
    pub fn resolve(&self, client_addr: u64) -> RuntimeResult<Arc<Handle>> {
        let by_addr = self.by_addr.lock();
        let &id = by_addr.get(&client_addr).ok_or(RuntimeError::NotFound)?;
        drop(by_addr);
        self.get_by_id(id).ok_or(RuntimeError::NotFound)
    }

    /// Containing-range lookup for interior pointers. Returns the handle and
    /// the byte offset of `addr` within it.
    pub fn resolve_within(&self, addr: u64) -> RuntimeResult<(Arc<Handle>, u64)> {
        let by_addr = self.by_addr.lock();
        let (&base, &id) = by_addr.range(..=addr).next_back().ok_or(RuntimeError::NotFound)?;
        drop(by_addr);
        let handle = self.get_by_id(id).ok_or(RuntimeError::NotFound)?;
        let span = handle.state_size.max(1);
        if addr >= base + span {
            return Err(RuntimeError::NotFound);
        }
        Ok((handle, addr - base))
    }

    /// Release a client address on deletion; the handle itself stays for
    /// history and trace dumps.
    pub fn release_addr(&self, client_addr: u64) {
        self.by_addr.lock().remove(&client_addr);
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<Handle>> {
        self.handles.read().get(id as usize).cloned()
    }

    pub fn nb_handles(&self) -> usize {
        self.handles.read().len()
    }

    pub fn handles(&self) -> Vec<Arc<Handle>> {
        self.handles.read().clone()
    }

    // ── Modified-set tracking (stateful kinds) ─────────────────────

    pub fn mark_modified(&self, handle: &Handle) {
        debug_assert_eq!(handle.kind, self.kind);
        self.modified.lock().insert(handle.id);
    }

    pub fn modified_set(&self) -> Vec<Arc<Handle>> {
        let ids = self.modified.lock();
        ids.iter().filter_map(|&id| self.get_by_id(id)).collect()
    }

    pub fn clear_modified(&self) {
        self.modified.lock().clear();
    }

    pub fn set_host_stateful(&self, handle: &Handle, host_stateful: bool) {
        let mut set = self.host_stateful.lock();
        if host_stateful {
            set.insert(handle.id);
        } else {
            set.remove(&handle.id);
        }
    }

    /// True when a byte-identical copy of the handle's current state already
    /// lives in host memory: flagged explicitly, sealed in the checkpoint
    /// bag at the latest version, or staged as a host blob (modules).
    pub fn is_host_stateful(&self, handle: &Handle) -> bool {
        if self.host_stateful.lock().contains(&handle.id) {
            return true;
        }
        if handle.ckpt_bag.has_sealed(handle.latest_version()) {
            return true;
        }
        handle.latest_host_value().is_some()
    }

    // ── Metadata persistence ───────────────────────────────────────

    /// Write every handle's metadata (no state bytes) into `dir`.
    pub fn persist_without_state_sync(&self, dir: &Path) -> RuntimeResult<()> {
        for handle in self.handles.read().iter() {
            handle.persist_without_state_sync(dir)?;
        }
        Ok(())
    }

    /// Restore handle metadata from `dir`; materialization is deferred, the
    /// handles come back `WaitingReload`. Returns the number restored.
    pub fn load(&self, dir: &Path) -> RuntimeResult<usize> {
        let prefix = format!("{}-", self.kind);
        let mut records: Vec<HandleRecord> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let text = fs::read_to_string(entry.path())?;
            let record: HandleRecord =
                serde_json::from_str(&text).map_err(|_| RuntimeError::Failed)?;
            records.push(record);
        }
        records.sort_by_key(|r| r.id);

        let mut handles = self.handles.write();
        let mut by_addr = self.by_addr.lock();
        let mut next = self.next_addr.lock();
        for record in &records {
            if record.id != handles.len() as u64 {
                tracing::warn!(kind = %self.kind, id = record.id, "non-contiguous handle record, aborting load");
                return Err(RuntimeError::Failed);
            }
            let handle = Arc::new(Handle::from_record(record.clone(), self.ckpt_high_water));
            let span = handle.state_size.max(1).div_ceil(ADDR_ALIGN) * ADDR_ALIGN;
            *next = (*next).max(handle.client_addr.saturating_add(span));
            by_addr.insert(handle.client_addr, handle.id);
            handles.push(handle);
        }
        Ok(records.len())
    }

    // ── Kernel-meta cache (Module manager) ─────────────────────────

    /// Best-effort load of the kernel parameter-layout cache. A malformed
    /// line aborts the load, leaves the cache bit unset, and logs a warning.
    pub fn load_cached_function_metas(&self, path: &Path) -> RuntimeResult<usize> {
        let text = fs::read_to_string(path)?;
        let mut metas = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let desc = match KernelDescriptor::decode(line) {
                Ok(desc) => desc,
                Err(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        "malformed kernel meta record, discarding cache"
                    );
                    return Err(RuntimeError::InvalidInput);
                }
            };
            metas.insert(desc.name.clone(), desc);
        }
        let count = metas.len();
        *self.kernel_metas.lock() = metas;
        self.meta_cache_loaded.store(true, Ordering::Release);
        Ok(count)
    }

    /// Append function layouts to the cache file, one record per line.
    pub fn dump_function_metas(
        &self,
        path: &Path,
        descriptors: impl Iterator<Item = KernelDescriptor>,
    ) -> RuntimeResult<()> {
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        for desc in descriptors {
            writeln!(file, "{}", desc.encode())?;
        }
        Ok(())
    }

    pub fn cached_function_meta(&self, name: &str) -> Option<KernelDescriptor> {
        self.kernel_metas.lock().get(name).cloned()
    }

    pub fn is_meta_cache_loaded(&self) -> bool {
        self.meta_cache_loaded.load(Ordering::Acquire)
    }
}
