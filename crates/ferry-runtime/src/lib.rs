//! Ferry bridge runtime.
//!
//! The engine-agnostic half of the bridge between a managed host and a
//! sandboxed module that only understands integers, floats and a flat byte
//! array. Everything here is reached through a [`Guest`], which hands out the
//! module's linear memory together with the [`Bridge`] that owns the
//! per-instance state.
//!
//! # Components
//!
//! - [`heap`]: opaque object heap. Small integer handles name host values.
//! - [`memory`]: typed views over linear memory, refreshed after growth.
//! - [`codec`]: strings and byte ranges in and out of linear memory.
//! - [`closure`]: reference-counted trampolines around module closures.
//! - [`exception`]: host exceptions replayed through exception slots.
//! - [`intrinsics`]: the bridge's own import functions.
//!
//! [`sim::SimGuest`] is a deterministic in-process module used by tests.

pub mod bridge;
pub mod closure;
pub mod codec;
pub mod exception;
pub mod guest;
pub mod heap;
pub mod intrinsics;
pub mod memory;
pub mod sim;
pub mod value;

pub use bridge::Bridge;
pub use closure::{ClosureEnv, InvokeFn, Release, Trampoline};
pub use codec::MarshalledStr;
pub use exception::{ExceptionSlot, HostResult, Raised, SlotState};
pub use guest::Guest;
pub use heap::{ObjectHeap, Sentinels};
pub use memory::{TypedView, TypedViewMut, VecMemory, ViewCache, ViewKind, PAGE_SIZE};
pub use sim::SimGuest;
pub use value::{HostError, HostFunction, HostObject, HostValue, NativeFunction};
