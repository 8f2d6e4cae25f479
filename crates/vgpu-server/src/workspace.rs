//! The workspace: the single per-host process multiplexing clients.
//!
//! The transport (out of scope here) delivers frames as
//! `(api_id, client uuid, parameter descriptors, reply buffer)`; `process`
//! is that boundary. Synchronous calls block on the per-call completion
//! channel; asynchronous calls return as soon as the parser queue accepts
//! them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use vgpu_core::RuntimeConfig;
use vgpu_protocol::{ApiId, ParamDesc, RuntimeError, RuntimeResult, RETCODE_SUCCESS};

use crate::client::Client;
use crate::driver::{AcceleratorDriver, SimDriver};

/// Workspace-wide counters, one cache line of atomics like everything else
/// in the dispatch path.
#[derive(Default)]
pub struct WorkspaceMetrics {
    pub calls_total: AtomicU64,
    pub parser_rejects_total: AtomicU64,
    pub vendor_errors_total: AtomicU64,
}

pub struct Workspace {
    config: RuntimeConfig,
    driver: Arc<dyn AcceleratorDriver>,
    clients: DashMap<u64, Arc<Client>>,
    next_client_id: AtomicU64,
    pub metrics: WorkspaceMetrics,
}

impl Workspace {
    pub fn new(config: RuntimeConfig, driver: Arc<dyn AcceleratorDriver>) -> Self {
        Self {
            config,
            driver,
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            metrics: WorkspaceMetrics::default(),
        }
    }

    /// Workspace over the in-process simulated accelerator.
    pub fn with_sim_driver(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(SimDriver::new()))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn AcceleratorDriver> {
        &self.driver
    }

    /// Create a client for one guest process. Returns its uuid. Any handle
    /// manager init failure aborts creation.
    pub fn create_client(&self, pid: u32) -> RuntimeResult<u64> {
        let uuid = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(uuid, pid, self.config.clone(), self.driver.clone())?;
        self.clients.insert(uuid, Arc::new(client));
        info!(uuid, pid, "workspace registered client");
        Ok(uuid)
    }

    pub fn client(&self, uuid: u64) -> Option<Arc<Client>> {
        self.clients.get(&uuid).map(|c| c.clone())
    }

    pub fn nb_clients(&self) -> usize {
        self.clients.len()
    }

    /// The dispatch boundary. Returns the call's integer retcode; reply data
    /// (if the call produces any and `reply` is given) is copied out.
    pub fn process(
        &self,
        api_id: ApiId,
        uuid: u64,
        params: Vec<ParamDesc>,
        reply: Option<&mut Vec<u8>>,
    ) -> i32 {
        self.metrics.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(client) = self.client(uuid) else {
            warn!(uuid, "call for unknown client");
            return RuntimeError::NotFound.code();
        };
        let Some(meta) = api_id.meta() else {
            warn!(uuid, api = api_id.0, "call with unknown api id");
            self.metrics.parser_rejects_total.fetch_add(1, Ordering::Relaxed);
            return RuntimeError::InvalidInput.code();
        };

        let want_reply = meta.is_sync || reply.is_some();
        let completion_rx = match client.submit(api_id, params, want_reply) {
            Ok(rx) => rx,
            Err(err) => return err.code(),
        };

        let Some(rx) = completion_rx else {
            return RETCODE_SUCCESS;
        };
        match rx.recv() {
            Ok(completion) => {
                if completion.return_code != RETCODE_SUCCESS {
                    self.metrics.vendor_errors_total.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(reply) = reply {
                    *reply = completion.return_data;
                }
                completion.return_code
            }
            Err(_) => RuntimeError::Failed.code(),
        }
    }

    /// Tear one client down: parser, then worker, then managers.
    pub fn remove_client(&self, uuid: u64) -> RuntimeResult<()> {
        let (_, client) = self.clients.remove(&uuid).ok_or(RuntimeError::NotFound)?;
        client.shutdown();
        info!(uuid, "workspace removed client");
        Ok(())
    }

    /// Drain and tear down every client.
    pub fn shutdown(&self) {
        let uuids: Vec<u64> = self.clients.iter().map(|entry| *entry.key()).collect();
        for uuid in uuids {
            let _ = self.remove_client(uuid);
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.shutdown();
    }
}
