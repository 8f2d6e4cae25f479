//! Bipartite dependency graph between API-call vertices (T1) and handle
//! vertices (T2).
//!
//! Insertion of a call vertex is the hot path: it only appends the payload
//! and drops the neighbor map into a T1-keyed cache. The authoritative
//! T2-keyed topology needed by checkpoint planning and the dump is produced
//! by a merge pass that folds the cache in under a single mutex, invoked
//! lazily before any query.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use vgpu_protocol::{AccessDirection, RuntimeError, RuntimeResult};

pub type VertexId = u64;

/// Neighbor vertex id -> edge direction. Ordered so queries and the dump
/// walk edges in vertex order.
pub type NeighborMap = BTreeMap<VertexId, AccessDirection>;

struct Topology {
    /// Authoritative topology from the T2 view, indexed by T2 id.
    t2_topo: Vec<NeighborMap>,
    /// T1 insertions not yet folded into `t2_topo`.
    t1_cache: BTreeMap<VertexId, NeighborMap>,
}

pub struct BipartiteGraph<T1, T2> {
    t1s: RwLock<Vec<T1>>,
    t2s: RwLock<Vec<T2>>,
    topo: Mutex<Topology>,
    tick_freq: u64,
}

impl<T1: Clone, T2: Clone> BipartiteGraph<T1, T2> {
    /// `prefill` reserves vertex capacity up front; steady-state insertion
    /// must not stall on reallocation.
    pub fn with_prefill(prefill: usize, tick_freq: u64) -> Self {
        Self {
            t1s: RwLock::new(Vec::with_capacity(prefill)),
            t2s: RwLock::new(Vec::with_capacity(prefill)),
            topo: Mutex::new(Topology {
                t2_topo: Vec::with_capacity(prefill),
                t1_cache: BTreeMap::new(),
            }),
            tick_freq,
        }
    }

    /// Add a call vertex with its touched-handle edges. Fails with
    /// `NotFound` if any neighbor id is unknown; nothing is inserted in
    /// that case.
    pub fn add_t1(&self, payload: T1, neighbors: NeighborMap) -> RuntimeResult<VertexId> {
        let nb_t2 = self.t2s.read().len() as u64;
        if let Some((&bad, _)) = neighbors.iter().find(|(&n, _)| n >= nb_t2) {
            tracing::warn!(neighbor = bad, "call vertex references unknown handle vertex");
            return Err(RuntimeError::NotFound);
        }

        let mut t1s = self.t1s.write();
        let id = t1s.len() as VertexId;
        t1s.push(payload);
        drop(t1s);

        self.topo.lock().t1_cache.insert(id, neighbors);
        Ok(id)
    }

    /// Add a handle vertex. Handle vertices are created with no edges of
    /// their own; edges accrue from later call insertions.
    pub fn add_t2(&self, payload: T2, neighbors: NeighborMap) -> RuntimeResult<VertexId> {
        let nb_t1 = self.t1s.read().len() as u64;
        if let Some((&bad, _)) = neighbors.iter().find(|(&n, _)| n >= nb_t1) {
            tracing::warn!(neighbor = bad, "handle vertex references unknown call vertex");
            return Err(RuntimeError::NotFound);
        }

        let mut t2s = self.t2s.write();
        let id = t2s.len() as VertexId;
        t2s.push(payload);
        drop(t2s);

        let mut topo = self.topo.lock();
        topo.t2_topo.push(neighbors);
        Ok(id)
    }

    pub fn nb_t1(&self) -> usize {
        self.t1s.read().len()
    }

    pub fn nb_t2(&self) -> usize {
        self.t2s.read().len()
    }

    pub fn get_t1(&self, id: VertexId) -> Option<T1> {
        self.t1s.read().get(id as usize).cloned()
    }

    pub fn get_t2(&self, id: VertexId) -> Option<T2> {
        self.t2s.read().get(id as usize).cloned()
    }

    /// Edges incident to a handle vertex. Cold path: folds the cache first.
    pub fn t2_neighbors(&self, id: VertexId) -> Option<NeighborMap> {
        let mut topo = self.topo.lock();
        Self::merge_cache(&mut topo);
        topo.t2_topo.get(id as usize).cloned()
    }

    /// Ordered ids of call vertices in `[start_op, end_op]` that mutate the
    /// given handle vertex. Checkpoint planning derives deadlines from this.
    pub fn next_modified_positions(
        &self,
        handle_vertex: VertexId,
        start_op: VertexId,
        end_op: VertexId,
    ) -> Vec<VertexId> {
        let mut topo = self.topo.lock();
        Self::merge_cache(&mut topo);
        let Some(edges) = topo.t2_topo.get(handle_vertex as usize) else {
            return Vec::new();
        };
        edges
            .range(start_op..=end_op)
            .filter(|(_, dir)| dir.is_write())
            .map(|(&op, _)| op)
            .collect()
    }

    fn merge_cache(topo: &mut Topology) {
        if topo.t1_cache.is_empty() {
            return;
        }
        let cache = std::mem::take(&mut topo.t1_cache);
        for (t1_id, neighbors) in cache {
            for (t2_id, dir) in neighbors {
                topo.t2_topo[t2_id as usize].insert(t1_id, dir);
            }
        }
    }

    /// Dump the graph as plaintext. First line `nb_t1, nb_t2, tick_freq`,
    /// then one serialized line per T1, per T2, and per-T2 topology lines
    /// `vid, degree, n1, dir1, n2, dir2, ...`.
    pub fn dump(
        &self,
        path: &Path,
        serialize_t1: impl Fn(&T1) -> String,
        serialize_t2: impl Fn(&T2) -> String,
    ) -> std::io::Result<()> {
        let t1s = self.t1s.read();
        let t2s = self.t2s.read();
        let mut topo = self.topo.lock();
        Self::merge_cache(&mut topo);

        let mut out = String::new();
        let _ = writeln!(out, "{}, {}, {}", t1s.len(), t2s.len(), self.tick_freq);
        for v in t1s.iter() {
            let _ = writeln!(out, "{}", serialize_t1(v));
        }
        for v in t2s.iter() {
            let _ = writeln!(out, "{}", serialize_t2(v));
        }
        for (vid, edges) in topo.t2_topo.iter().enumerate() {
            let _ = write!(out, "{}, {}", vid, edges.len());
            for (&n, dir) in edges.iter() {
                let _ = write!(out, ", {}, {}", n, dir.code());
            }
            out.push('\n');
        }

        let mut file = fs::File::create(path)?;
        file.write_all(out.as_bytes())?;
        tracing::info!(path = %path.display(), "dumped dependency graph");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vgpu_protocol::AccessDirection::*;

    fn graph() -> BipartiteGraph<String, String> {
        BipartiteGraph::with_prefill(64, 1_000_000)
    }

    fn edges(pairs: &[(VertexId, AccessDirection)]) -> NeighborMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn merged_topology_reflects_every_insert() {
        let g = graph();
        let h0 = g.add_t2("h0".into(), NeighborMap::new()).unwrap();
        let h1 = g.add_t2("h1".into(), NeighborMap::new()).unwrap();

        let mut expected_h0 = Vec::new();
        for i in 0..32u64 {
            let dir = if i % 3 == 0 { Out } else { In };
            let op = g.add_t1(format!("op{i}"), edges(&[(h0, dir), (h1, In)])).unwrap();
            expected_h0.push((op, dir));
        }

        let topo = g.t2_neighbors(h0).unwrap();
        assert_eq!(topo.len(), 32);
        for (op, dir) in expected_h0 {
            assert_eq!(topo.get(&op), Some(&dir), "edge for op {op} lost in merge");
        }
        assert_eq!(g.t2_neighbors(h1).unwrap().len(), 32);
    }

    #[test]
    fn unknown_neighbor_is_not_found_and_nothing_inserted() {
        let g = graph();
        let err = g.add_t1("op".into(), edges(&[(5, In)])).unwrap_err();
        assert_eq!(err, RuntimeError::NotFound);
        assert_eq!(g.nb_t1(), 0);
    }

    #[test]
    fn modified_positions_window() {
        let g = graph();
        let h = g.add_t2("h".into(), NeighborMap::new()).unwrap();
        let mut writes = Vec::new();
        for i in 0..10u64 {
            let dir = if i % 2 == 0 { Out } else { In };
            let op = g.add_t1(format!("op{i}"), edges(&[(h, dir)])).unwrap();
            if dir.is_write() {
                writes.push(op);
            }
        }
        let positions = g.next_modified_positions(h, 3, 9);
        let expected: Vec<_> = writes.into_iter().filter(|&op| (3..=9).contains(&op)).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn only_byte_writes_count_as_modifications() {
        let g = graph();
        let h = g.add_t2("h".into(), NeighborMap::new()).unwrap();
        g.add_t1("create".into(), edges(&[(h, Create)])).unwrap();
        g.add_t1("write".into(), edges(&[(h, InOut)])).unwrap();
        g.add_t1("free".into(), edges(&[(h, Delete)])).unwrap();
        // Only Out/InOut mutate bytes; Create fixes the initial state and
        // Delete tears down without producing a new version.
        assert_eq!(g.next_modified_positions(h, 0, 10), vec![1]);
    }

    #[test]
    fn dump_layout_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dag.txt");

        let g = graph();
        let h = g.add_t2("mem:0".into(), NeighborMap::new()).unwrap();
        g.add_t1("malloc".into(), edges(&[(h, Create)])).unwrap();
        g.add_t1("launch".into(), edges(&[(h, Out)])).unwrap();
        g.dump(&path, |v| v.clone(), |v| v.clone()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split(", ").collect();
        assert_eq!(header[0], "2");
        assert_eq!(header[1], "1");
        assert_eq!(lines.next(), Some("malloc"));
        assert_eq!(lines.next(), Some("launch"));
        assert_eq!(lines.next(), Some("mem:0"));
        // vid 0, degree 2, (op0, Create), (op1, Out)
        assert_eq!(lines.next(), Some("0, 2, 0, 3, 1, 1"));
    }

    #[test]
    fn interleaved_queries_do_not_lose_cached_edges() {
        let g = graph();
        let h = g.add_t2("h".into(), NeighborMap::new()).unwrap();
        g.add_t1("a".into(), edges(&[(h, Out)])).unwrap();
        assert_eq!(g.t2_neighbors(h).unwrap().len(), 1);
        g.add_t1("b".into(), edges(&[(h, Out)])).unwrap();
        assert_eq!(g.t2_neighbors(h).unwrap().len(), 2);
    }
}
