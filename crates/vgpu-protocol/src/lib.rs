pub mod api;
pub mod error;
pub mod param;
pub mod resource;

pub use api::{ApiId, ApiMeta};
pub use error::{RuntimeError, RuntimeResult, RETCODE_SUCCESS};
pub use param::ParamDesc;
pub use resource::{AccessDirection, ResourceKind};
