//! Per-handle checkpoint storage.
//!
//! A bag keeps one slot per committed version. A slot starts as a
//! device-side pre-commit (overlap checkpointing issues the copy on a
//! dedicated stream and seals it at join time) or lands directly as a host
//! copy after a synchronous commit. Slots beyond the configured high-water
//! mark are evicted oldest-access-first; in-flight slots are never evicted.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use vgpu_protocol::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone)]
struct Slot {
    data: Vec<u8>,
    /// Still a device-side pre-commit; sealed to a host copy at join.
    on_device: bool,
}

#[derive(Debug)]
struct BagInner {
    slots: BTreeMap<u64, Slot>,
    /// Access order, oldest first.
    order: Vec<u64>,
    high_water: usize,
}

#[derive(Debug)]
pub struct CheckpointBag {
    inner: Mutex<BagInner>,
}

impl CheckpointBag {
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            inner: Mutex::new(BagInner {
                slots: BTreeMap::new(),
                order: Vec::new(),
                high_water: high_water.max(1),
            }),
        }
    }

    /// Commit bytes for a version. At most one in-flight (device-side)
    /// commit may exist per version; a second attempt while the first is
    /// unsealed reports `AlreadyExist`. Re-committing a sealed version
    /// replaces it.
    pub fn commit(&self, version: u64, data: Vec<u8>, on_device: bool) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.slots.get(&version) {
            if existing.on_device {
                return Err(RuntimeError::AlreadyExist);
            }
        }
        inner.slots.insert(version, Slot { data, on_device });
        inner.order.retain(|&v| v != version);
        inner.order.push(version);
        Self::evict(&mut inner);
        Ok(())
    }

    /// Seal every device-side pre-commit into a host copy. Invoked by the
    /// checkpoint join after the copy stream synchronizes.
    pub fn seal_device_slots(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.values_mut() {
            slot.on_device = false;
        }
    }

    pub fn has_inflight(&self) -> bool {
        self.inner.lock().slots.values().any(|s| s.on_device)
    }

    /// Host-visible bytes of a version. Device pre-commits are not readable
    /// until sealed.
    pub fn get(&self, version: u64) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get(&version)?;
        if slot.on_device {
            return None;
        }
        let data = slot.data.clone();
        inner.order.retain(|&v| v != version);
        inner.order.push(version);
        Some(data)
    }

    /// Whether a sealed host copy exists for a version. Does not touch the
    /// access order.
    pub fn has_sealed(&self, version: u64) -> bool {
        self.inner
            .lock()
            .slots
            .get(&version)
            .is_some_and(|s| !s.on_device)
    }

    /// Newest sealed version and its bytes.
    pub fn latest(&self) -> Option<(u64, Vec<u8>)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .rev()
            .find(|(_, s)| !s.on_device)
            .map(|(&v, s)| (v, s.data.clone()))
    }

    /// Drop the slot for a version (failed checkpoint).
    pub fn discard(&self, version: u64) {
        let mut inner = self.inner.lock();
        inner.slots.remove(&version);
        inner.order.retain(|&v| v != version);
    }

    pub fn nb_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn memory_consumption(&self) -> u64 {
        self.inner.lock().slots.values().map(|s| s.data.len() as u64).sum()
    }

    fn evict(inner: &mut BagInner) {
        while inner.slots.len() > inner.high_water {
            let Some(pos) = inner
                .order
                .iter()
                .position(|v| inner.slots.get(v).is_some_and(|s| !s.on_device))
            else {
                break;
            };
            let victim = inner.order.remove(pos);
            inner.slots.remove(&victim);
        }
    }
}
