pub mod apicxt;
pub mod ckpt;
pub mod config;
pub mod dag;
pub mod handle;
pub mod kernel_meta;
pub mod manager;

pub use apicxt::{ApiContext, ApiContextRecord, Completion, HandleView};
pub use ckpt::CheckpointBag;
pub use config::{CkptOptLevel, MigrOptLevel, RuntimeConfig};
pub use dag::{BipartiteGraph, NeighborMap, VertexId};
pub use handle::{Handle, HandleKey, HandleMeta, HandleRecord, HandleStatus, MigrationState, StateStatus};
pub use kernel_meta::KernelDescriptor;
pub use manager::HandleManager;
