use serde::{Deserialize, Serialize};

/// Kind tag of one accelerator-visible resource shadowed by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Device,
    Context,
    Stream,
    Event,
    Module,
    Function,
    Variable,
    Memory,
    BlasContext,
}

impl ResourceKind {
    /// All kinds, in handle-manager initialization order (parents first).
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Device,
        ResourceKind::Context,
        ResourceKind::Stream,
        ResourceKind::BlasContext,
        ResourceKind::Event,
        ResourceKind::Module,
        ResourceKind::Function,
        ResourceKind::Variable,
        ResourceKind::Memory,
    ];

    /// Stateful kinds carry bytes that must be captured to reconstruct
    /// execution (checkpoint / migration targets).
    pub fn is_stateful(self) -> bool {
        matches!(self, ResourceKind::Memory | ResourceKind::Module)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Device => "device",
            ResourceKind::Context => "context",
            ResourceKind::Stream => "stream",
            ResourceKind::Event => "event",
            ResourceKind::Module => "module",
            ResourceKind::Function => "function",
            ResourceKind::Variable => "variable",
            ResourceKind::Memory => "memory",
            ResourceKind::BlasContext => "blas",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one API call touches one handle. Doubles as the DAG edge tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessDirection {
    In,
    Out,
    InOut,
    Create,
    Delete,
}

impl AccessDirection {
    /// Whether this access mutates the handle's bytes after creation.
    /// Create fixes the initial (empty) state and does not count as a
    /// mutation; Delete tears the object down without producing new bytes.
    pub fn is_write(self) -> bool {
        matches!(self, AccessDirection::Out | AccessDirection::InOut)
    }

    /// Numeric code used by the DAG dump format.
    pub fn code(self) -> u8 {
        match self {
            AccessDirection::In => 0,
            AccessDirection::Out => 1,
            AccessDirection::InOut => 2,
            AccessDirection::Create => 3,
            AccessDirection::Delete => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => AccessDirection::In,
            1 => AccessDirection::Out,
            2 => AccessDirection::InOut,
            3 => AccessDirection::Create,
            4 => AccessDirection::Delete,
            _ => return None,
        })
    }

    /// Combine two accesses of the same call to the same handle.
    pub fn merge(self, other: Self) -> Self {
        use AccessDirection::*;
        match (self, other) {
            (Create, _) | (_, Create) => Create,
            (Delete, _) | (_, Delete) => Delete,
            (a, b) if a == b => a,
            _ => InOut,
        }
    }
}
