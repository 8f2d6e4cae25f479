//! Integration test: the per-client Parser -> Worker pipeline.
//!
//! Drives the workspace directly through its `process` boundary (no
//! transport) over the simulated accelerator: resource lifecycle, kernel
//! launch marshalling, ordering, and the error propagation policy.
//!
//! Run with: cargo test --test pipeline_test -- --nocapture

use std::sync::Arc;

use vgpu_core::handle::HandleStatus;
use vgpu_core::RuntimeConfig;
use vgpu_protocol::{api, AccessDirection, ParamDesc, ResourceKind};
use vgpu_server::driver::{SimDriver, VENDOR_ERR_NOT_FOUND};
use vgpu_server::Workspace;

const MODULE_IMAGE: &[u8] = b"_Z8kernel_1PKfPfS1_S1_i\0_Z6gatherPflj\0";
const KERNEL_1: &str = "_Z8kernel_1PKfPfS1_S1_i";
const MODULE_KEY: u64 = 0x2000_0000_0000;
const FUNC_ADDR: u64 = 0x3000_0000_0000;

fn test_config() -> RuntimeConfig {
    RuntimeConfig { dag_prefill_slots: 2048, ..Default::default() }
}

fn dim(x: u32, y: u32, z: u32) -> ParamDesc {
    let mut bytes = x.to_le_bytes().to_vec();
    bytes.extend_from_slice(&y.to_le_bytes());
    bytes.extend_from_slice(&z.to_le_bytes());
    ParamDesc::new(bytes)
}

fn malloc(ws: &Workspace, uuid: u64, size: u64) -> u64 {
    let mut reply = Vec::new();
    let rc = ws.process(api::MALLOC, uuid, vec![ParamDesc::from_u64(size)], Some(&mut reply));
    assert_eq!(rc, 0, "malloc failed");
    u64::from_le_bytes(reply[..8].try_into().unwrap())
}

fn load_module(ws: &Workspace, uuid: u64) {
    let rc = ws.process(
        api::MODULE_LOAD,
        uuid,
        vec![ParamDesc::from_u64(MODULE_KEY), ParamDesc::new(MODULE_IMAGE.to_vec())],
        None,
    );
    assert_eq!(rc, 0, "module load failed");
}

fn get_function(ws: &Workspace, uuid: u64, name: &str) {
    let rc = ws.process(
        api::MODULE_GET_FUNCTION,
        uuid,
        vec![
            ParamDesc::from_u64(MODULE_KEY),
            ParamDesc::from_u64(FUNC_ADDR),
            ParamDesc::from_str("nothing"),
            ParamDesc::from_str(name),
            ParamDesc::from_i32(16),
        ],
        None,
    );
    assert_eq!(rc, 0, "module get function failed");
}

/// kernel_1(const float* in, float* out0, float* out1, float* out2, int n)
fn launch_kernel_1(ws: &Workspace, uuid: u64, ptrs: [u64; 4], n: i32) {
    let mut args = Vec::new();
    for ptr in ptrs {
        args.extend_from_slice(&ptr.to_le_bytes());
    }
    args.extend_from_slice(&n.to_le_bytes());
    let rc = ws.process(
        api::LAUNCH_KERNEL,
        uuid,
        vec![
            ParamDesc::from_u64(FUNC_ADDR),
            dim(64, 1, 1),
            dim(256, 1, 1),
            ParamDesc::from_u32(0),
            ParamDesc::from_u64(0),
            ParamDesc::new(args),
        ],
        None,
    );
    assert_eq!(rc, 0, "launch enqueue failed");
}

fn h2d(ws: &Workspace, uuid: u64, dst: u64, payload: &[u8]) {
    let rc = ws.process(
        api::MEMCPY_H2D,
        uuid,
        vec![ParamDesc::from_u64(dst), ParamDesc::new(payload.to_vec())],
        None,
    );
    assert_eq!(rc, 0, "h2d failed");
}

fn d2h(ws: &Workspace, uuid: u64, src: u64, len: u64) -> Vec<u8> {
    let mut reply = Vec::new();
    let rc = ws.process(
        api::MEMCPY_D2H,
        uuid,
        vec![ParamDesc::from_u64(src), ParamDesc::from_u64(len)],
        Some(&mut reply),
    );
    assert_eq!(rc, 0, "d2h failed");
    reply
}

#[test]
fn test_allocate_launch_free_lifecycle() {
    let driver = Arc::new(SimDriver::new());
    let ws = Workspace::new(test_config(), driver.clone());
    let uuid = ws.create_client(4242).unwrap();
    let client = ws.client(uuid).unwrap();

    load_module(&ws, uuid);
    get_function(&ws, uuid, KERNEL_1);

    let addr = malloc(&ws, uuid, 4096);
    assert_eq!(addr, 0x1000, "first buffer starts at the base of the reserved range");

    let shared = client.shared();
    let mem = shared.manager(ResourceKind::Memory);
    let handle = mem.resolve(addr).unwrap();
    assert_eq!(handle.status(), HandleStatus::Active);
    assert_ne!(handle.server_addr(), 0);
    assert_eq!(handle.latest_version(), 0);

    launch_kernel_1(&ws, uuid, [addr; 4], 1024);
    client.drain();

    // One call writing the buffer through three parameters is one mutation.
    assert_eq!(handle.latest_version(), 1);
    let modified = mem.modified_set();
    assert_eq!(modified.len(), 1);
    assert_eq!(modified[0].id, handle.id);

    let function = shared.manager(ResourceKind::Function).resolve(FUNC_ADDR).unwrap();
    assert_eq!(driver.launch_count(function.server_addr()), 1);

    let rc = ws.process(api::FREE, uuid, vec![ParamDesc::from_u64(addr)], None);
    assert_eq!(rc, 0);
    assert_eq!(handle.status(), HandleStatus::Deleted);
    assert!(mem.resolve(addr).is_err(), "freed address no longer resolves");

    // The buffer's vertex saw exactly create, merged launch write, delete.
    let vertex = handle.dag_vertex().unwrap();
    let edges = shared.dag.t2_neighbors(vertex).unwrap();
    let dirs: Vec<AccessDirection> = edges.values().copied().collect();
    assert_eq!(
        dirs,
        vec![AccessDirection::Create, AccessDirection::InOut, AccessDirection::Delete]
    );
}

#[test]
fn test_module_load_and_get_function() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(1).unwrap();
    let client = ws.client(uuid).unwrap();

    load_module(&ws, uuid);
    get_function(&ws, uuid, KERNEL_1);

    let shared = client.shared();
    let module = shared.manager(ResourceKind::Module).resolve(MODULE_KEY).unwrap();
    assert_eq!(module.status(), HandleStatus::Active);

    let function = shared.manager(ResourceKind::Function).resolve(FUNC_ADDR).unwrap();
    assert_eq!(function.status(), HandleStatus::Active);
    assert_eq!(function.parents[0].kind, ResourceKind::Module);
    assert_eq!(function.parents[0].id, module.id);

    let desc = function.kernel_descriptor().unwrap();
    assert_eq!(desc.signature, "kernel_1(float const*, float*, float*, float*, int)");
    assert_eq!(desc.nb_params, 5);
    assert_eq!(desc.input_params, vec![0]);
    assert_eq!(desc.output_params, vec![1, 2, 3]);
}

#[test]
fn test_memcpy_round_trip_with_interior_offset() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(2).unwrap();

    let addr = malloc(&ws, uuid, 4096);
    let payload: Vec<u8> = (0..128u8).collect();
    h2d(&ws, uuid, addr + 256, &payload);
    assert_eq!(d2h(&ws, uuid, addr + 256, 128), payload);
    assert_eq!(d2h(&ws, uuid, addr, 4), vec![0, 0, 0, 0]);
}

#[test]
fn test_version_counts_write_edges() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(3).unwrap();
    let client = ws.client(uuid).unwrap();

    let addr = malloc(&ws, uuid, 64);
    for round in 0..3u8 {
        h2d(&ws, uuid, addr, &[round; 16]);
    }
    let _ = d2h(&ws, uuid, addr, 16);
    let _ = d2h(&ws, uuid, addr, 16);

    let shared = client.shared();
    let handle = shared.manager(ResourceKind::Memory).resolve(addr).unwrap();
    assert_eq!(handle.latest_version(), 3);

    let edges = shared.dag.t2_neighbors(handle.dag_vertex().unwrap()).unwrap();
    let write_edges = edges.values().filter(|d| d.is_write()).count();
    assert_eq!(write_edges as u64, handle.latest_version());
}

#[test]
fn test_worker_preserves_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        trace_dir: Some(dir.path().to_path_buf()),
        dag_prefill_slots: 2048,
        ..Default::default()
    };
    let ws = Workspace::with_sim_driver(config);
    let uuid = ws.create_client(4).unwrap();
    let client = ws.client(uuid).unwrap();

    let addr = malloc(&ws, uuid, 4096);
    for i in 0..50u8 {
        let rc = ws.process(
            api::MEMCPY_H2D_ASYNC,
            uuid,
            vec![ParamDesc::from_u64(addr), ParamDesc::new(vec![i; 8])],
            None,
        );
        assert_eq!(rc, 0);
    }
    client.drain();

    let seqs: Vec<u64> = client
        .shared()
        .trace_records()
        .iter()
        .filter(|r| r.api_id == api::MEMCPY_H2D_ASYNC)
        .map(|r| r.seq)
        .collect();
    assert_eq!(seqs.len(), 50);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "worker retired out of order: {seqs:?}");
}

#[test]
fn test_guest_bugs_short_circuit_in_parser() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(5).unwrap();

    // Unknown handle.
    let rc = ws.process(api::FREE, uuid, vec![ParamDesc::from_u64(0xdead_0000)], None);
    assert_eq!(rc, vgpu_protocol::RuntimeError::NotFound.code());

    // Malformed params.
    let rc = ws.process(api::MALLOC, uuid, vec![ParamDesc::new(vec![1, 2])], None);
    assert_eq!(rc, vgpu_protocol::RuntimeError::InvalidInput.code());

    // Unknown client.
    let rc = ws.process(api::MALLOC, 999, vec![ParamDesc::from_u64(64)], None);
    assert_eq!(rc, vgpu_protocol::RuntimeError::NotFound.code());
}

#[test]
fn test_missing_global_masked_behind_flag() {
    // Default: tolerated, call reports success.
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(6).unwrap();
    load_module(&ws, uuid);
    let rc = ws.process(
        api::REGISTER_VAR,
        uuid,
        vec![
            ParamDesc::from_u64(MODULE_KEY),
            ParamDesc::from_u64(0x4000_0000_0000),
            ParamDesc::from_str("_Z10missing_gv"),
        ],
        None,
    );
    assert_eq!(rc, 0);

    // Flag off: the vendor code travels to the guest unaltered.
    let config = RuntimeConfig { tolerate_missing_global: false, dag_prefill_slots: 2048, ..Default::default() };
    let ws = Workspace::with_sim_driver(config);
    let uuid = ws.create_client(7).unwrap();
    load_module(&ws, uuid);
    let rc = ws.process(
        api::REGISTER_VAR,
        uuid,
        vec![
            ParamDesc::from_u64(MODULE_KEY),
            ParamDesc::from_u64(0x4000_0000_0001),
            ParamDesc::from_str("_Z10missing_gv"),
        ],
        None,
    );
    assert_eq!(rc, VENDOR_ERR_NOT_FOUND);
}

#[test]
fn test_suspicious_param_confirmation() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(8).unwrap();
    load_module(&ws, uuid);
    // gather(float* out, long maybe_ptr, unsigned n): param 1 is suspicious.
    get_function(&ws, uuid, "_Z6gatherPflj");
    let client = ws.client(uuid).unwrap();

    let out = malloc(&ws, uuid, 4096);
    let table = malloc(&ws, uuid, 4096);

    let mut args = out.to_le_bytes().to_vec();
    args.extend_from_slice(&table.to_le_bytes()); // a real allocation: confirms
    args.extend_from_slice(&7u32.to_le_bytes());
    let rc = ws.process(
        api::LAUNCH_KERNEL,
        uuid,
        vec![
            ParamDesc::from_u64(FUNC_ADDR),
            dim(1, 1, 1),
            dim(32, 1, 1),
            ParamDesc::from_u32(0),
            ParamDesc::from_u64(0),
            ParamDesc::new(args),
        ],
        None,
    );
    assert_eq!(rc, 0);
    client.drain();

    let function = client.shared().manager(ResourceKind::Function).resolve(FUNC_ADDR).unwrap();
    let desc = function.kernel_descriptor().unwrap();
    assert!(desc.has_verified_params);
    assert_eq!(desc.confirmed_suspicious, vec![(1, 8)]);
}

#[test]
fn test_no_devices_aborts_client_creation() {
    let ws = Workspace::new(test_config(), Arc::new(SimDriver::with_devices(0)));
    assert!(ws.create_client(9).is_err());
    assert_eq!(ws.nb_clients(), 0);
}

#[test]
fn test_trace_dump_tree_on_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        trace_dir: Some(dir.path().to_path_buf()),
        dag_prefill_slots: 2048,
        ..Default::default()
    };
    let ws = Workspace::with_sim_driver(config);
    let uuid = ws.create_client(777).unwrap();

    let addr = malloc(&ws, uuid, 256);
    h2d(&ws, uuid, addr, &[1; 256]);
    ws.remove_client(uuid).unwrap();

    let root: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(root.len(), 1);
    let trace_root = root[0].as_ref().unwrap().path();
    let name = trace_root.file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.starts_with("777-"), "trace dir named <pid>-<tick>: {name}");

    assert!(trace_root.join("dag.txt").is_file());
    let wqes = std::fs::read_dir(trace_root.join("apicxt")).unwrap().count();
    assert_eq!(wqes, 2);
    let resources = std::fs::read_dir(trace_root.join("resource")).unwrap().count();
    // Devices (2), primary context, default stream, one buffer.
    assert_eq!(resources, 5);

    let dag_text = std::fs::read_to_string(trace_root.join("dag.txt")).unwrap();
    let header: Vec<&str> = dag_text.lines().next().unwrap().split(", ").collect();
    assert_eq!(header[0], "2");
    assert_eq!(header[1], "1");
}

#[test]
fn test_device_count_query() {
    let ws = Workspace::with_sim_driver(test_config());
    let uuid = ws.create_client(10).unwrap();
    let mut reply = Vec::new();
    let rc = ws.process(api::GET_DEVICE_COUNT, uuid, vec![], Some(&mut reply));
    assert_eq!(rc, 0);
    assert_eq!(i32::from_le_bytes(reply[..4].try_into().unwrap()), 2);
}
