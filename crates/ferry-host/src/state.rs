//! Store data shared by every import of one instance.

use ferry_runtime::{Bridge, Raised};
use ferry_types::BridgeConfig;
use wasmi::{Func, Instance, Memory, Table};

/// Exports the bridge calls back into, resolved once after instantiation.
#[derive(Debug, Clone, Copy)]
pub struct GuestExports {
    pub instance: Instance,
    pub memory: Memory,
    pub malloc: Func,
    pub realloc: Option<Func>,
    pub free: Func,
    pub exn_store: Option<Func>,
    pub destructors: Option<Table>,
}

/// The `wasmi` store data.
#[derive(Debug)]
pub struct HostState {
    pub bridge: Bridge,
    /// `None` until the loader has resolved the exports.
    pub exports: Option<GuestExports>,
    /// What an import raised before trapping out of module code.
    pub pending: Option<Raised>,
}

impl HostState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            bridge: Bridge::with_config(config),
            exports: None,
            pending: None,
        }
    }
}
