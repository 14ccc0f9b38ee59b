//! Scalar values and slot layout of the module ABI.
//!
//! Only 32-bit integers and 64-bit floats cross the boundary. Strings and
//! slices travel as `(ptr, len)` pairs, optional values use `0` for "absent".
//!
//! A fallible call reports through a two-word slot:
//!
//! ```text
//! retptr+0 : i32, handle (on failure) or payload word
//! retptr+4 : i32, 0 = success, non-zero = word 0 is an error handle
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of one ABI word in bytes.
pub const WORD_SIZE: u32 = 4;
/// Size of an exception slot in bytes.
pub const SLOT_SIZE: u32 = 2 * WORD_SIZE;
/// Flag word value for "no error".
pub const SLOT_FLAG_OK: i32 = 0;
/// Flag word value for "word 0 holds an error handle".
pub const SLOT_FLAG_ERROR: i32 = 1;

/// A single value crossing the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AbiValue {
    I32(i32),
    F64(f64),
}

impl AbiValue {
    /// The integer payload, if this is an `I32`.
    pub fn as_i32(self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(v),
            Self::F64(_) => None,
        }
    }

    /// The float payload, if this is an `F64`.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(v),
            Self::I32(_) => None,
        }
    }

    /// Pointer-or-handle reading of an `I32` word.
    pub fn as_u32(self) -> Option<u32> {
        self.as_i32().map(|v| v as u32)
    }
}

impl From<i32> for AbiValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u32> for AbiValue {
    fn from(v: u32) -> Self {
        Self::I32(v as i32)
    }
}

impl From<f64> for AbiValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl fmt::Display for AbiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "i32:{v}"),
            Self::F64(v) => write!(f, "f64:{v}"),
        }
    }
}
