//! Trace dump: persist the client's API-call history and resource shadows.
//!
//! Layout: `<trace_dir>/<pid>-<tick>/` with `apicxt/` (one WQE per file)
//! and `resource/` (one file per handle). An existing directory for the
//! same stamp is removed before writing.

use std::fs;
use std::path::PathBuf;

use tracing::info;

use vgpu_common::process_clock;
use vgpu_protocol::{RuntimeError, RuntimeResult};

use crate::client::ClientShared;

pub fn dump_trace(shared: &ClientShared) -> RuntimeResult<PathBuf> {
    let base = shared.config.trace_dir.clone().ok_or(RuntimeError::InvalidInput)?;
    let root = base.join(format!("{}-{}", shared.pid, process_clock().now_ticks()));
    let apicxt_dir = root.join("apicxt");
    let resource_dir = root.join("resource");

    if root.exists() {
        fs::remove_dir_all(&root)?;
    }
    fs::create_dir_all(&apicxt_dir)?;
    fs::create_dir_all(&resource_dir)?;

    let records = shared.trace_records();
    for record in &records {
        record.persist(&apicxt_dir)?;
    }

    for mgr in shared.registry.all() {
        mgr.persist_without_state_sync(&resource_dir)?;
    }

    shared.dag.dump(
        &root.join("dag.txt"),
        |op| format!("{}, 0x{:04x}", op.seq, op.api_id.0),
        |res| format!("{}, {}", res.kind, res.handle_id),
    )?;

    info!(
        client_id = shared.id,
        nb_calls = records.len(),
        dir = %root.display(),
        "trace dumped"
    );
    Ok(root)
}
