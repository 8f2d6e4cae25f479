//! Checkpoint engine.
//!
//! Three levels: disabled, modified-set (synchronous commit of every
//! stateful handle the checkpoint call sees), and overlap (copies issued on
//! a dedicated stream as later operations flow, each handle bounded by its
//! deadline: the last relative slot before its next mutation).

use std::sync::Arc;

use tracing::{debug, warn};

use vgpu_core::apicxt::ApiContext;
use vgpu_core::handle::Handle;
use vgpu_protocol::{ResourceKind, RuntimeError, RuntimeResult};

use crate::client::ClientShared;
use crate::state::HandleStateOps;

/// Per-relative-slot distribution of handles to checkpoint, each paired
/// with the version its copy must land under.
pub struct OverlapScheme {
    slots: Vec<Vec<(Arc<Handle>, u64)>>,
    staged: Vec<(usize, Arc<Handle>, u64)>,
}

impl OverlapScheme {
    pub fn new() -> Self {
        Self { slots: Vec::new(), staged: Vec::new() }
    }

    /// Reset for a window of `nb_pending` upcoming operations.
    pub fn refresh(&mut self, nb_pending: usize) {
        self.slots = std::iter::repeat_with(Vec::new).take(nb_pending).collect();
        self.staged.clear();
    }

    /// Stage a handle with its deadline (clamped into the window).
    pub fn add(&mut self, deadline: usize, handle: Arc<Handle>, version: u64) {
        if self.slots.is_empty() {
            return;
        }
        let deadline = deadline.min(self.slots.len() - 1);
        self.staged.push((deadline, handle, version));
    }

    /// Distribute staged handles across slots. A handle may move to an
    /// earlier slot than its deadline, never later, and the buckets are
    /// balanced by byte load.
    pub fn schedule(&mut self) {
        self.staged.sort_by_key(|(deadline, _, _)| *deadline);
        let staged = std::mem::take(&mut self.staged);
        for (deadline, handle, version) in staged {
            let slot = (0..=deadline)
                .min_by_key(|&s| self.slot_load(s))
                .unwrap_or(0);
            self.slots[slot].push((handle, version));
        }
    }

    fn slot_load(&self, slot: usize) -> u64 {
        self.slots[slot].iter().map(|(h, _)| h.state_size).sum()
    }

    pub fn nb_slots(&self) -> usize {
        self.slots.len()
    }

    /// Handles to checkpoint before dispatching the op at `rel_index`.
    pub fn take_slot(&mut self, rel_index: usize) -> Vec<(Arc<Handle>, u64)> {
        match self.slots.get_mut(rel_index) {
            Some(slot) => std::mem::take(slot),
            None => Vec::new(),
        }
    }

    /// Slot index a handle was scheduled at, for diagnostics and tests.
    pub fn slot_of(&self, handle_id: u64, kind: ResourceKind) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.iter().any(|(h, _)| h.id == handle_id && h.kind == kind)
        })
    }
}

impl Default for OverlapScheme {
    fn default() -> Self {
        Self::new()
    }
}

/// Modified-set checkpoint: commit the current version of every stateful
/// handle the call's view map names, synchronize the client stream, tally
/// telemetry. A per-handle failure discards that slot and continues.
pub fn checkpoint_modified_set(shared: &ClientShared, cxt: &mut ApiContext) -> RuntimeResult<()> {
    cxt.nb_ckpt_handles = 0;
    cxt.ckpt_size = 0;
    cxt.ckpt_memory_consumption = 0;

    for kind in [ResourceKind::Memory, ResourceKind::Module] {
        let views = cxt.views_of(kind).to_vec();
        for view in views {
            let handle = &view.handle;
            let version = view.version;
            match handle.checkpoint_commit_sync(version, shared.driver.as_ref()) {
                Ok(()) => {
                    cxt.nb_ckpt_handles += 1;
                    cxt.ckpt_size += handle.state_size;
                }
                Err(err) => {
                    warn!(kind = %kind, id = handle.id, version, %err, "checkpoint commit failed");
                    handle.ckpt_bag.discard(version);
                }
            }
        }
    }

    let stream = shared.streams.default_stream.load(std::sync::atomic::Ordering::Acquire);
    shared
        .driver
        .stream_synchronize(stream)
        .map_err(RuntimeError::Vendor)?;

    collect_bag_consumption(shared, cxt);
    clear_modified(shared);
    debug!(
        client_id = shared.id,
        nb = cxt.nb_ckpt_handles,
        bytes = cxt.ckpt_size,
        "modified-set checkpoint done"
    );
    Ok(())
}

/// Build the overlap scheme for a checkpoint call with `nb_pending`
/// operations queued behind it. Synchronizes the client-private stream so
/// every prior op of this client has landed before copies start overlapping.
pub fn generate_overlap_scheme(
    shared: &ClientShared,
    cxt: &mut ApiContext,
    nb_pending: usize,
) -> RuntimeResult<OverlapScheme> {
    let mut scheme = OverlapScheme::new();
    scheme.refresh(nb_pending);

    cxt.nb_ckpt_handles = 0;
    cxt.ckpt_size = 0;

    for kind in [ResourceKind::Memory, ResourceKind::Module] {
        let views = cxt.views_of(kind).to_vec();
        for view in views {
            let handle = view.handle.clone();
            let Some(handle_vertex) = handle.dag_vertex() else { continue };

            let window_start = cxt.dag_vertex_id + 1;
            let window_end = cxt.dag_vertex_id + nb_pending as u64;
            let positions =
                shared.dag.next_modified_positions(handle_vertex, window_start, window_end);

            // Deadline: one op before the next mutation, or the end of the
            // window if the handle is never written again.
            let deadline = match positions.first() {
                Some(&next_write) => (next_write - 1 - cxt.dag_vertex_id) as usize,
                None => nb_pending - 1,
            };

            cxt.nb_ckpt_handles += 1;
            cxt.ckpt_size += handle.state_size;
            scheme.add(deadline, handle, view.version);
        }
    }

    scheme.schedule();
    collect_bag_consumption(shared, cxt);
    clear_modified(shared);

    // Overlapped copies must not race ops already in flight. The sync is on
    // this client's private stream; co-resident clients are unaffected.
    let stream = shared.streams.default_stream.load(std::sync::atomic::Ordering::Acquire);
    shared
        .driver
        .stream_synchronize(stream)
        .map_err(RuntimeError::Vendor)?;

    debug!(
        client_id = shared.id,
        nb = cxt.nb_ckpt_handles,
        slots = scheme.nb_slots(),
        "overlap checkpoint scheme generated"
    );
    Ok(scheme)
}

fn collect_bag_consumption(shared: &ClientShared, cxt: &mut ApiContext) {
    for mgr in shared.registry.stateful() {
        for handle in mgr.handles() {
            cxt.ckpt_memory_consumption += handle.ckpt_bag.memory_consumption();
        }
    }
}

fn clear_modified(shared: &ClientShared) {
    for mgr in shared.registry.stateful() {
        mgr.clear_modified();
    }
}
