//! Shared types for the Ferry bridge.
//!
//! This crate defines the vocabulary used on both sides of the bridge:
//! heap handles and their reserved sentinels, the scalar values allowed to
//! cross the module boundary, object capability tags, the error taxonomy,
//! and the bridge configuration.

mod abi;
mod config;
mod error;
mod handle;
mod kind;

pub use abi::{AbiValue, SLOT_FLAG_ERROR, SLOT_FLAG_OK, SLOT_SIZE, WORD_SIZE};
pub use config::{BridgeConfig, StringGrowth};
pub use error::{BridgeError, ErrorClass};
pub use handle::{Handle, HEAP_START, RESERVED_SLOTS};
pub use kind::ObjectKind;

/// Result type used throughout the bridge.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
