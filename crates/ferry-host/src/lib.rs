//! Ferry host glue for the `wasmi` engine.
//!
//! Connects [`ferry_runtime`] to real modules:
//!
//! - [`ImportTable`]: the bridge namespace a module links against. Bridge
//!   intrinsics, closure wrappers and declaratively marshalled host functions.
//! - [`ModuleLoader`]: validates bridge imports, digests the binary,
//!   instantiates and resolves the exports named in the [`BridgeConfig`].
//! - [`Instance`]: calls into the module, passes strings and delivers host
//!   events to registered module closures.
//! - [`WasmiGuest`]: the [`ferry_runtime::Guest`] implementation over a store.
//!
//! Raised host values never unwind through module frames. An import either
//! reports through an exception slot or traps, leaving the raised value in
//! [`HostState::pending`] for the host's outermost call to return.
//!
//! [`BridgeConfig`]: ferry_types::BridgeConfig

pub mod error;
pub mod guest;
pub mod imports;
pub mod loader;
pub mod state;

pub use error::Trap;
pub use guest::WasmiGuest;
pub use imports::{AbiKind, HostImport, HostOp, ImportTable, ReturnKind, INTRINSICS};
pub use loader::{unresolved_imports, Instance, ModuleLoader};
pub use state::{GuestExports, HostState};
