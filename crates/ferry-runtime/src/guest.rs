//! The module side of the bridge, as seen from host code.

use ferry_types::{AbiValue, BridgeResult, Handle};

use crate::bridge::Bridge;
use crate::closure::ClosureEnv;
use crate::exception::HostResult;

/// A running module instance plus its bridge state.
///
/// Implemented over a real engine by `ferry-host` and in-process by
/// [`crate::sim::SimGuest`]. Any method that runs module code may grow linear
/// memory, so slices from [`Guest::parts`] must not be held across calls.
pub trait Guest {
    /// Linear memory and the bridge state, borrowed together.
    fn parts(&mut self) -> (&mut [u8], &mut Bridge);

    /// `malloc(size) -> ptr` in module memory.
    fn malloc(&mut self, size: u32) -> BridgeResult<u32>;

    /// `realloc(ptr, old_size, new_size) -> ptr`.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> BridgeResult<u32>;

    /// Whether the module exports a reallocator.
    fn supports_realloc(&self) -> bool;

    /// `free(ptr, size)`.
    fn free(&mut self, ptr: u32, size: u32) -> BridgeResult<()>;

    /// Call an exported function by name.
    fn call_export(&mut self, name: &str, args: &[AbiValue]) -> HostResult<Vec<AbiValue>>;

    /// Run the destructor registered at `destructor` on a closure's state.
    fn destroy_closure(&mut self, destructor: u32, env: ClosureEnv) -> BridgeResult<()>;

    /// Hand an exception handle to the module's `exn_store` export.
    fn store_exception(&mut self, handle: Handle) -> BridgeResult<()>;

    fn bridge(&mut self) -> &mut Bridge {
        self.parts().1
    }

    fn memory(&mut self) -> &mut [u8] {
        self.parts().0
    }
}
