//! The API context (work-queue element): the envelope one intercepted call
//! travels in from dispatch through the Parser and Worker back to the guest.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vgpu_protocol::{AccessDirection, ApiId, ParamDesc, ResourceKind, RuntimeResult, RETCODE_SUCCESS};

use crate::dag::VertexId;
use crate::handle::Handle;

/// One touched handle: which, how, and the byte region of interest.
/// `version` snapshots the handle's version at parse time; checkpoint
/// commits key their slots by it, so a checkpoint captures exactly the
/// state the call observed regardless of writes queued behind it.
#[derive(Clone)]
pub struct HandleView {
    pub handle: Arc<Handle>,
    pub direction: AccessDirection,
    pub offset: u64,
    pub size: u64,
    pub version: u64,
}

impl HandleView {
    pub fn whole(handle: Arc<Handle>, direction: AccessDirection) -> Self {
        let size = handle.state_size;
        let version = handle.latest_version();
        Self { handle, direction, offset: 0, size, version }
    }

    pub fn ranged(handle: Arc<Handle>, direction: AccessDirection, offset: u64, size: u64) -> Self {
        let version = handle.latest_version();
        Self { handle, direction, offset, size, version }
    }
}

/// Reply published to the dispatch boundary when the call completes.
#[derive(Debug, Clone)]
pub struct Completion {
    pub return_code: i32,
    pub return_data: Vec<u8>,
}

pub struct ApiContext {
    pub client_id: u64,
    pub api_id: ApiId,
    /// Submission sequence within the client; the Worker must observe calls
    /// in this order.
    pub seq: u64,
    pub params: Vec<ParamDesc>,
    /// Per-kind touched handles, produced by the parser.
    pub views: HashMap<ResourceKind, Vec<HandleView>>,
    pub dag_vertex_id: VertexId,
    pub return_data: Vec<u8>,
    pub return_code: i32,
    /// Marshalled kernel-argument block (or host payload) staged by the
    /// parser for the worker.
    pub staged: Vec<u8>,

    // Checkpoint telemetry.
    pub nb_ckpt_handles: u64,
    pub ckpt_size: u64,
    pub ckpt_memory_consumption: u64,

    completion: Option<crossbeam_channel::Sender<Completion>>,
}

impl ApiContext {
    pub fn new(client_id: u64, api_id: ApiId, seq: u64, params: Vec<ParamDesc>) -> Self {
        Self {
            client_id,
            api_id,
            seq,
            params,
            views: HashMap::new(),
            dag_vertex_id: 0,
            return_data: Vec::new(),
            return_code: RETCODE_SUCCESS,
            staged: Vec::new(),
            nb_ckpt_handles: 0,
            ckpt_size: 0,
            ckpt_memory_consumption: 0,
            completion: None,
        }
    }

    /// Attach the reply channel the dispatch boundary blocks on.
    pub fn with_completion(mut self, tx: crossbeam_channel::Sender<Completion>) -> Self {
        self.completion = Some(tx);
        self
    }

    pub fn param(&self, idx: usize) -> Option<&ParamDesc> {
        self.params.get(idx)
    }

    pub fn add_view(&mut self, view: HandleView) {
        self.views.entry(view.handle.kind).or_default().push(view);
    }

    pub fn view(&self, kind: ResourceKind, idx: usize) -> Option<&HandleView> {
        self.views.get(&kind)?.get(idx)
    }

    pub fn views_of(&self, kind: ResourceKind) -> &[HandleView] {
        self.views.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether this call writes the given handle after the checkpoint copy
    /// was issued; the overlap engine joins before dispatching such calls.
    pub fn writes_handle(&self, kind: ResourceKind, id: u64) -> bool {
        self.views_of(kind)
            .iter()
            .any(|v| v.handle.id == id && v.direction.is_write())
    }

    /// DAG neighbor map of this call: one edge per touched stateful handle
    /// vertex, directions merged when a call touches a handle twice.
    pub fn neighbor_map(&self) -> crate::dag::NeighborMap {
        let mut map = crate::dag::NeighborMap::new();
        for views in self.views.values() {
            for view in views {
                let Some(vertex) = view.handle.dag_vertex() else { continue };
                map.entry(vertex)
                    .and_modify(|dir| *dir = dir.merge(view.direction))
                    .or_insert(view.direction);
            }
        }
        map
    }

    /// Publish the reply. Consumes the channel so a WQE replies only once.
    pub fn publish(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Completion {
                return_code: self.return_code,
                return_data: std::mem::take(&mut self.return_data),
            });
        }
    }

    /// Persisted form for the trace dump.
    pub fn record(&self) -> ApiContextRecord {
        ApiContextRecord {
            client_id: self.client_id,
            api_id: self.api_id,
            api_name: self.api_id.name().to_string(),
            seq: self.seq,
            dag_vertex_id: self.dag_vertex_id,
            return_code: self.return_code,
            nb_ckpt_handles: self.nb_ckpt_handles,
            ckpt_size: self.ckpt_size,
            ckpt_memory_consumption: self.ckpt_memory_consumption,
            views: self
                .views
                .iter()
                .flat_map(|(&kind, views)| {
                    views.iter().map(move |v| ViewRecord {
                        kind,
                        handle_id: v.handle.id,
                        direction: v.direction,
                        offset: v.offset,
                        size: v.size,
                    })
                })
                .collect(),
        }
    }
}

/// Persisted WQE, one JSON file per call in the trace dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiContextRecord {
    pub client_id: u64,
    pub api_id: ApiId,
    pub api_name: String,
    pub seq: u64,
    pub dag_vertex_id: VertexId,
    pub return_code: i32,
    pub nb_ckpt_handles: u64,
    pub ckpt_size: u64,
    pub ckpt_memory_consumption: u64,
    pub views: Vec<ViewRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRecord {
    pub kind: ResourceKind,
    pub handle_id: u64,
    pub direction: AccessDirection,
    pub offset: u64,
    pub size: u64,
}

impl ApiContextRecord {
    pub fn persist(&self, dir: &Path) -> RuntimeResult<()> {
        let path = dir.join(format!("wqe-{:08}.json", self.seq));
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|_| vgpu_protocol::RuntimeError::Failed)?;
        Ok(())
    }
}
