pub mod checkpoint;
pub mod client;
pub mod driver;
pub mod migration;
mod parser;
pub mod state;
pub mod trace;
mod worker;
pub mod workspace;

pub use client::{Client, ClientShared, HandleRegistry};
pub use driver::{AcceleratorDriver, SimDriver};
pub use migration::{MigrationContext, MigrationEngine, MigrationStats};
pub use state::HandleStateOps;
pub use workspace::Workspace;
