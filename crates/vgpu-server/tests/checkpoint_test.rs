//! Integration test: checkpoint engine levels.
//!
//! Level 1 (modified-set) through the live pipeline, level 2 (overlap)
//! deadline derivation against the dependency DAG, and the join semantics
//! of in-flight copies.
//!
//! Run with: cargo test --test checkpoint_test -- --nocapture

use vgpu_core::apicxt::ApiContext;
use vgpu_core::dag::NeighborMap;
use vgpu_core::{CkptOptLevel, HandleView, RuntimeConfig};
use vgpu_protocol::{api, AccessDirection, ParamDesc, ResourceKind};
use vgpu_server::checkpoint;
use vgpu_server::client::OpNode;
use vgpu_server::Workspace;

fn config(level: CkptOptLevel, trace_dir: Option<std::path::PathBuf>) -> RuntimeConfig {
    RuntimeConfig {
        ckpt_opt_level: level,
        trace_dir,
        dag_prefill_slots: 2048,
        ..Default::default()
    }
}

fn malloc(ws: &Workspace, uuid: u64, size: u64) -> u64 {
    let mut reply = Vec::new();
    let rc = ws.process(api::MALLOC, uuid, vec![ParamDesc::from_u64(size)], Some(&mut reply));
    assert_eq!(rc, 0);
    u64::from_le_bytes(reply[..8].try_into().unwrap())
}

fn h2d(ws: &Workspace, uuid: u64, dst: u64, payload: &[u8]) {
    let rc = ws.process(
        api::MEMCPY_H2D,
        uuid,
        vec![ParamDesc::from_u64(dst), ParamDesc::new(payload.to_vec())],
        None,
    );
    assert_eq!(rc, 0);
}

fn wait_worker(client: &vgpu_server::Client) {
    while !client.worker_ready() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn test_modified_set_checkpoint_telemetry() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::with_sim_driver(config(
        CkptOptLevel::ModifiedSet,
        Some(dir.path().to_path_buf()),
    ));
    let uuid = ws.create_client(1).unwrap();
    let client = ws.client(uuid).unwrap();

    let addr = malloc(&ws, uuid, 4096);
    h2d(&ws, uuid, addr, &[0xab; 4096]);

    let rc = ws.process(api::CHECKPOINT, uuid, vec![], None);
    assert_eq!(rc, 0);
    client.drain();

    let records = client.shared().trace_records();
    let ckpt = records.iter().find(|r| r.api_id == api::CHECKPOINT).unwrap();
    assert_eq!(ckpt.nb_ckpt_handles, 1);
    assert_eq!(ckpt.ckpt_size, 4096);
    assert_eq!(ckpt.ckpt_memory_consumption, 4096);

    // The slot is sealed at the handle's current version and byte-identical.
    let handle = client.shared().manager(ResourceKind::Memory).resolve(addr).unwrap();
    assert_eq!(handle.latest_version(), 1);
    assert_eq!(handle.ckpt_bag.get(1), Some(vec![0xab; 4096]));

    // The modified set resets; an immediate second checkpoint sees nothing.
    let rc = ws.process(api::CHECKPOINT, uuid, vec![], None);
    assert_eq!(rc, 0);
    client.drain();
    let records = client.shared().trace_records();
    let second = records.iter().filter(|r| r.api_id == api::CHECKPOINT).nth(1).unwrap();
    assert_eq!(second.nb_ckpt_handles, 0);
}

#[test]
fn test_overlap_deadline_derivation() {
    let ws = Workspace::with_sim_driver(config(CkptOptLevel::Overlap, None));
    let uuid = ws.create_client(2).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);
    let shared = client.shared();

    let h1_addr = malloc(&ws, uuid, 4096);
    let h2_addr = malloc(&ws, uuid, 4096);
    h2d(&ws, uuid, h1_addr, &[1; 64]);
    h2d(&ws, uuid, h2_addr, &[2; 64]);
    client.drain();

    let mem = shared.manager(ResourceKind::Memory);
    let h1 = mem.resolve(h1_addr).unwrap();
    let h2 = mem.resolve(h2_addr).unwrap();
    let h1_vertex = h1.dag_vertex().unwrap();
    let h2_vertex = h2.dag_vertex().unwrap();

    // Pending window behind the checkpoint: the op right after writes H1,
    // the following five only read H2.
    let ckpt_vertex = shared.dag.add_t1(OpNode { api_id: api::CHECKPOINT, seq: 100 }, NeighborMap::new()).unwrap();
    let mut edges = NeighborMap::new();
    edges.insert(h1_vertex, AccessDirection::Out);
    shared.dag.add_t1(OpNode { api_id: api::LAUNCH_KERNEL, seq: 101 }, edges).unwrap();
    for i in 0..5 {
        let mut edges = NeighborMap::new();
        edges.insert(h2_vertex, AccessDirection::In);
        shared.dag.add_t1(OpNode { api_id: api::LAUNCH_KERNEL, seq: 102 + i }, edges).unwrap();
    }

    let mut cxt = ApiContext::new(uuid, api::CHECKPOINT, 100, Vec::new());
    cxt.dag_vertex_id = ckpt_vertex;
    cxt.add_view(HandleView::whole(h1.clone(), AccessDirection::In));
    cxt.add_view(HandleView::whole(h2.clone(), AccessDirection::In));

    let scheme = checkpoint::generate_overlap_scheme(shared, &mut cxt, 6).unwrap();
    assert_eq!(cxt.nb_ckpt_handles, 2);
    assert_eq!(cxt.ckpt_size, 8192);

    // H1's next write is the first pending op: it must be copied at slot 0.
    assert_eq!(scheme.slot_of(h1.id, ResourceKind::Memory), Some(0));
    // H2 is never written again: anywhere in the window is legal.
    let h2_slot = scheme.slot_of(h2.id, ResourceKind::Memory).unwrap();
    assert!(h2_slot <= 5, "H2 scheduled past the window: {h2_slot}");
}

#[test]
fn test_overlap_checkpoint_seals_before_next_write() {
    let ws = Workspace::with_sim_driver(config(CkptOptLevel::Overlap, None));
    let uuid = ws.create_client(3).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);

    let addr = malloc(&ws, uuid, 1024);
    h2d(&ws, uuid, addr, &[0x11; 1024]);
    let handle = client.shared().manager(ResourceKind::Memory).resolve(addr).unwrap();
    let version_at_ckpt = handle.latest_version();

    // Queue the checkpoint and a write behind it without waiting, so the
    // worker has follow-on ops to overlap with (or degrades to the
    // synchronous path when it drains first; both must seal the slot).
    client.submit(api::CHECKPOINT, vec![], false).unwrap();
    let rc = ws.process(
        api::MEMCPY_H2D,
        uuid,
        vec![ParamDesc::from_u64(addr), ParamDesc::new(vec![0x22; 1024])],
        None,
    );
    assert_eq!(rc, 0);
    client.drain();

    // The checkpoint captured the bytes as of its dispatch, not the later
    // write's.
    assert_eq!(handle.ckpt_bag.get(version_at_ckpt), Some(vec![0x11; 1024]));
    assert!(!handle.ckpt_bag.has_inflight());
}

#[test]
fn test_disabled_level_runs_no_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::with_sim_driver(config(
        CkptOptLevel::Disabled,
        Some(dir.path().to_path_buf()),
    ));
    let uuid = ws.create_client(4).unwrap();
    let client = ws.client(uuid).unwrap();

    let addr = malloc(&ws, uuid, 256);
    h2d(&ws, uuid, addr, &[9; 256]);
    let rc = ws.process(api::CHECKPOINT, uuid, vec![], None);
    assert_eq!(rc, 0);
    client.drain();

    let handle = client.shared().manager(ResourceKind::Memory).resolve(addr).unwrap();
    assert_eq!(handle.ckpt_bag.nb_slots(), 0);
}
