//! Integration test: live migration and checkpoint-directory restore.
//!
//! Runs the staged migration path (precopy, dirty write, deltacopy, tear,
//! restore, cutover) over the simulated accelerator's two devices and
//! verifies byte identity on the destination, plus the full-snapshot
//! fallbacks and the startup restore path.
//!
//! Run with: cargo test --test migration_test -- --nocapture

use vgpu_core::handle::{HandleStatus, MigrationState, StateStatus};
use vgpu_core::{CkptOptLevel, MigrOptLevel, RuntimeConfig};
use vgpu_protocol::{api, ParamDesc, ResourceKind};
use vgpu_server::{migration, MigrationEngine, Workspace};

fn migration_config() -> RuntimeConfig {
    RuntimeConfig {
        migr_opt_level: MigrOptLevel::Precopy,
        ckpt_opt_level: CkptOptLevel::ModifiedSet,
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

fn d2h(ws: &Workspace, uuid: u64, src: u64, len: u64) -> (i32, Vec<u8>) {
    let mut reply = Vec::new();
    let rc = ws.process(
        api::MEMCPY_D2H,
        uuid,
        vec![ParamDesc::from_u64(src), ParamDesc::from_u64(len)],
        Some(&mut reply),
    );
    (rc, reply)
}

fn wait_worker(client: &vgpu_server::Client) {
    while !client.worker_ready() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn test_live_migration_preserves_bytes() {
    let ws = Workspace::with_sim_driver(migration_config());
    let uuid = ws.create_client(1).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);
    let shared = client.shared();

    let blas_rc = ws.process(
        api::BLAS_CREATE,
        uuid,
        vec![ParamDesc::from_u64(0x5000_0000_0000)],
        None,
    );
    assert_eq!(blas_rc, 0);

    let addr = malloc(&ws, uuid, 4096);
    let first: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    h2d(&ws, uuid, addr, &first);

    let mem = shared.manager(ResourceKind::Memory);
    let handle = mem.resolve(addr).unwrap();

    let engine = MigrationEngine::with_destination(MigrOptLevel::Precopy, 1);
    engine.begin(shared).unwrap();

    let stats = engine.precopy(shared).unwrap();
    assert_eq!(stats.nb_handles, 1);
    assert_eq!(stats.bytes, 4096);
    assert_eq!(handle.migration_state(), MigrationState::Precopied);
    assert_ne!(handle.remote_server_addr(), 0);

    // Dirty the buffer between precopy and cutover; the parser must flip it
    // to invalidated and deltacopy must re-ship it.
    let second: Vec<u8> = first.iter().map(|b| b.wrapping_add(1)).collect();
    h2d(&ws, uuid, addr, &second);
    assert_eq!(handle.migration_state(), MigrationState::Invalidated);
    assert_eq!(shared.migration.nb_invalidated(), 1);

    let delta = engine.deltacopy(shared).unwrap();
    assert_eq!(delta.nb_handles, 1);
    assert_eq!(handle.migration_state(), MigrationState::Precopied);

    let blas = shared.manager(ResourceKind::BlasContext).resolve(0x5000_0000_0000).unwrap();
    let stream0 = shared.manager(ResourceKind::Stream).get_by_id(0).unwrap();

    engine.tear_context(shared, false);
    assert_eq!(blas.status(), HandleStatus::Broken);
    assert_eq!(stream0.status(), HandleStatus::Broken);

    engine.restore_context(shared, false).unwrap();
    assert_eq!(blas.status(), HandleStatus::Active);
    assert_eq!(stream0.status(), HandleStatus::Active);

    engine.cutover(shared).unwrap();
    assert_eq!(handle.migration_state(), MigrationState::RemoteActive);
    assert_eq!(handle.server_addr(), handle.remote_server_addr());

    // Post-cutover read must see the destination copy, byte-identical to
    // the latest guest write.
    let (rc, bytes) = d2h(&ws, uuid, addr, 4096);
    assert_eq!(rc, 0);
    assert_eq!(bytes, second);
}

#[test]
fn test_host_stateful_dedup_and_ondemand_reload() {
    let ws = Workspace::with_sim_driver(migration_config());
    let uuid = ws.create_client(2).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);
    let shared = client.shared();

    let addr = malloc(&ws, uuid, 1024);
    let payload = vec![0x5a; 1024];
    h2d(&ws, uuid, addr, &payload);

    // A sealed checkpoint at the current version makes the handle
    // host-stateful: its authoritative bytes already live in host memory.
    let rc = ws.process(api::CHECKPOINT, uuid, vec![], None);
    assert_eq!(rc, 0);
    client.drain();
    let mem = shared.manager(ResourceKind::Memory);
    let handle = mem.resolve(addr).unwrap();
    assert!(mem.is_host_stateful(&handle));

    // Pin the host-stateful flag so later writes of identical bytes keep
    // the host copy authoritative, and put the handle back in the modified
    // set the checkpoint just drained.
    mem.set_host_stateful(&handle, true);
    mem.mark_modified(&handle);

    let engine = MigrationEngine::with_destination(MigrOptLevel::Precopy, 1);
    engine.begin(shared).unwrap();
    let stats = engine.precopy(shared).unwrap();

    // Host-stateful handles are recorded for reload dedup and still
    // precopied once; their bytes are not shipped a second time.
    assert_eq!(stats.nb_handles, 1);
    assert_eq!(shared.migration.nb_host_resident(), 1);

    h2d(&ws, uuid, addr, &payload);
    assert_eq!(handle.migration_state(), MigrationState::Invalidated);
    let delta = engine.deltacopy(shared).unwrap();
    assert_eq!(delta.nb_handles, 0, "host-stateful handles skip deltacopy");

    engine.cutover(shared).unwrap();
    let reload = engine.ondemand_reload(shared.clone()).join().unwrap();
    assert_eq!(reload.nb_handles, 1);
    assert_eq!(handle.state_status(), StateStatus::StateReady);

    // The destination buffer now carries the host-resident copy.
    let (rc, bytes) = d2h(&ws, uuid, addr, 1024);
    assert_eq!(rc, 0);
    assert_eq!(bytes, payload);
}

#[test]
fn test_post_cutover_reference_to_unmigrated_handle_is_fatal() {
    let ws = Workspace::with_sim_driver(migration_config());
    let uuid = ws.create_client(3).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);
    let shared = client.shared();

    let migrated = malloc(&ws, uuid, 256);
    h2d(&ws, uuid, migrated, &[1; 256]);
    // Allocated but never written: not in the modified set, never precopied.
    let stale = malloc(&ws, uuid, 256);

    let engine = MigrationEngine::with_destination(MigrOptLevel::Precopy, 1);
    engine.begin(shared).unwrap();
    engine.precopy(shared).unwrap();
    engine.cutover(shared).unwrap();

    let (rc, _) = d2h(&ws, uuid, migrated, 256);
    assert_eq!(rc, 0);

    // Buffers allocated after cutover are untouched by the watermark.
    let fresh = malloc(&ws, uuid, 256);
    let (rc, _) = d2h(&ws, uuid, fresh, 256);
    assert_eq!(rc, 0);

    // The surviving pre-cutover buffer that never migrated is the aggregate
    // failure surface: touching it poisons the client.
    let (rc, _) = d2h(&ws, uuid, stale, 256);
    assert_eq!(rc, vgpu_protocol::RuntimeError::Failed.code());
}

#[test]
fn test_allcopy_allreload_fallback() {
    let ws = Workspace::with_sim_driver(migration_config());
    let uuid = ws.create_client(4).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);
    let shared = client.shared();

    let a = malloc(&ws, uuid, 512);
    let b = malloc(&ws, uuid, 512);
    h2d(&ws, uuid, a, &[7; 512]);
    h2d(&ws, uuid, b, &[8; 512]);

    let engine = MigrationEngine::with_destination(MigrOptLevel::Disabled, 1);
    let copied = engine.allcopy(shared).unwrap();
    assert_eq!(copied.nb_handles, 2);
    assert_eq!(copied.bytes, 1024);

    // Clobber both buffers on-device, then reload the snapshots.
    h2d(&ws, uuid, a, &[0; 512]);
    h2d(&ws, uuid, b, &[0; 512]);
    let reloaded = engine.allreload(shared).unwrap();
    assert_eq!(reloaded.nb_handles, 2);

    assert_eq!(d2h(&ws, uuid, a, 512).1, vec![7; 512]);
    assert_eq!(d2h(&ws, uuid, b, 512).1, vec![8; 512]);
}

#[test]
fn test_checkpoint_directory_restore_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt_dir = dir.path().join("snapshot");
    let payload: Vec<u8> = (0..200u8).cycle().take(2048).collect();
    let addr;

    // First life: run, checkpoint, persist.
    {
        let ws = Workspace::with_sim_driver(migration_config());
        let uuid = ws.create_client(5).unwrap();
        let client = ws.client(uuid).unwrap();
        wait_worker(&client);

        addr = malloc(&ws, uuid, 2048);
        h2d(&ws, uuid, addr, &payload);
        let rc = ws.process(api::CHECKPOINT, uuid, vec![], None);
        assert_eq!(rc, 0);
        client.drain();

        migration::persist_checkpoint(client.shared(), &ckpt_dir).unwrap();
    }

    // Second life: a fresh workspace restores from the directory; the first
    // touch of the buffer reloads its bytes onto the device.
    let config = RuntimeConfig {
        checkpoint_path: Some(ckpt_dir.clone()),
        ..migration_config()
    };
    let ws = Workspace::with_sim_driver(config);
    let uuid = ws.create_client(6).unwrap();
    let client = ws.client(uuid).unwrap();
    wait_worker(&client);

    let handle = client.shared().manager(ResourceKind::Memory).resolve(addr).unwrap();
    assert_eq!(handle.status(), HandleStatus::WaitingReload);

    let (rc, bytes) = d2h(&ws, uuid, addr, 2048);
    assert_eq!(rc, 0);
    assert_eq!(bytes, payload);
    assert_eq!(handle.status(), HandleStatus::Active);
}
