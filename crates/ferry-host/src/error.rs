//! Engine traps raised by bridge imports.

use ferry_types::BridgeError;
use thiserror::Error;

/// Payload of a `wasmi` trap raised from a bridge import.
///
/// The raised host value itself is not `Send`, so it is parked in
/// [`crate::HostState`] and the trap only says why module code stopped.
#[derive(Debug, Error)]
pub enum Trap {
    /// A host operation raised and no exception slot was available.
    #[error("host exception pending")]
    Exception,

    /// Bridge bookkeeping failed inside an import.
    #[error(transparent)]
    Violation(BridgeError),
}

impl wasmi::core::HostError for Trap {}

impl Trap {
    pub(crate) fn into_engine(self) -> wasmi::Error {
        wasmi::Error::host(self)
    }
}

/// Map an engine error during loading to [`BridgeError::Load`].
pub(crate) fn load_error(err: impl std::fmt::Display) -> BridgeError {
    BridgeError::Load(err.to_string())
}
