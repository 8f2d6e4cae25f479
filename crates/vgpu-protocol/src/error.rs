/// Closed error set of the runtime core. `Success` is represented by
/// `Ok(())` on the Rust side; everything that can go wrong maps to one of
/// these variants, and vendor errors carry the foreign code verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("operation failed")]
    Failed,

    #[error("resource not found")]
    NotFound,

    #[error("resource not ready")]
    NotReady,

    #[error("resource already exists")]
    AlreadyExist,

    #[error("invalid input")]
    InvalidInput,

    #[error("drain pending")]
    DrainPending,

    #[error("vendor error {0}")]
    Vendor(i32),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Retcode returned to the guest for a successful call.
pub const RETCODE_SUCCESS: i32 = 0;

impl RuntimeError {
    /// Integer retcode placed in the reply frame. Vendor codes are returned
    /// unaltered; core errors use a small negative space that cannot collide
    /// with vendor error numbering.
    pub fn code(&self) -> i32 {
        match self {
            RuntimeError::Failed => -1,
            RuntimeError::NotFound => -2,
            RuntimeError::NotReady => -3,
            RuntimeError::AlreadyExist => -4,
            RuntimeError::InvalidInput => -5,
            RuntimeError::DrainPending => -6,
            RuntimeError::Vendor(code) => *code,
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(_: std::io::Error) -> Self {
        RuntimeError::Failed
    }
}
