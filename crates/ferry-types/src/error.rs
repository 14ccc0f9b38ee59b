//! Bridge error taxonomy.

use std::fmt;
use thiserror::Error;

/// How a caller is expected to react to a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A broken invariant in the bridge or its caller. Fail fast.
    ContractViolation,
    /// A domain failure that is reported as an ordinary result.
    Recoverable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractViolation => write!(f, "contract violation"),
            Self::Recoverable => write!(f, "recoverable"),
        }
    }
}

/// Errors raised by the bridge runtime and its collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// Lookup of a free or out-of-range heap slot.
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// Module bytes were not valid UTF-8.
    #[error("invalid UTF-8 in {len} bytes at {ptr:#x}: {source}")]
    InvalidEncoding {
        ptr: u32,
        len: u32,
        #[source]
        source: std::str::Utf8Error,
    },

    /// A `(ptr, len)` range falls outside linear memory.
    #[error("memory access {ptr:#x}+{len} out of bounds ({memory_len} bytes)")]
    OutOfBounds { ptr: u32, len: u32, memory_len: usize },

    /// A host-side operation raised.
    #[error("host operation failed: {0}")]
    HostOperationFailed(String),

    /// A call into module code trapped or returned the wrong shape.
    #[error("guest call failed: {0}")]
    Guest(String),

    /// A closure was invoked while already executing or after its release.
    #[error("closure invoked recursively or after release")]
    ClosureUnavailable,

    /// The module allocator refused a request.
    #[error("allocation of {size} bytes failed: {reason}")]
    Allocation { size: u32, reason: String },

    /// An export the bridge depends on is absent or has the wrong type.
    #[error("missing export: {0}")]
    MissingExport(String),

    /// The module imports bridge functions that were never registered.
    #[error("unresolved imports: {}", .0.join(", "))]
    UnresolvedImports(Vec<String>),

    /// The module binary could not be parsed or instantiated.
    #[error("module load failed: {0}")]
    Load(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Classify the error per the bridge's propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidHandle(_)
            | Self::OutOfBounds { .. }
            | Self::MissingExport(_)
            | Self::UnresolvedImports(_)
            | Self::Config(_) => ErrorClass::ContractViolation,
            Self::InvalidEncoding { .. }
            | Self::HostOperationFailed(_)
            | Self::Guest(_)
            | Self::ClosureUnavailable
            | Self::Allocation { .. }
            | Self::Load(_) => ErrorClass::Recoverable,
        }
    }

    /// Shorthand for `class() == ContractViolation`.
    pub fn is_contract_violation(&self) -> bool {
        self.class() == ErrorClass::ContractViolation
    }

    /// Short name used when the error is surfaced to the module as a value.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidHandle(_) => "InvalidHandle",
            Self::InvalidEncoding { .. } => "InvalidEncoding",
            Self::OutOfBounds { .. } => "OutOfBounds",
            Self::HostOperationFailed(_) => "HostOperationFailed",
            Self::Guest(_) => "GuestError",
            Self::ClosureUnavailable => "ClosureUnavailable",
            Self::Allocation { .. } => "AllocationError",
            Self::MissingExport(_) => "MissingExport",
            Self::UnresolvedImports(_) => "UnresolvedImports",
            Self::Load(_) => "LoadError",
            Self::Config(_) => "ConfigError",
        }
    }
}
