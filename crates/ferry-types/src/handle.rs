use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of low slots kept permanently `undefined`.
///
/// Slots `0..RESERVED_SLOTS` are never handed out; handle `0` doubles as the
/// "absent" marker for optional results.
pub const RESERVED_SLOTS: u32 = 32;

/// First dynamically allocated slot. Everything below is a sentinel.
pub const HEAP_START: u32 = RESERVED_SLOTS + 4;

/// Index of a slot in the opaque object heap.
///
/// Handles are the only way the module refers to host values. They carry no
/// lifetime; the module releases them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    /// The "absent" handle used for optional results.
    pub const NONE: Self = Self(0);
    pub const UNDEFINED: Self = Self(RESERVED_SLOTS);
    pub const NULL: Self = Self(RESERVED_SLOTS + 1);
    pub const TRUE: Self = Self(RESERVED_SLOTS + 2);
    pub const FALSE: Self = Self(RESERVED_SLOTS + 3);

    /// Raw slot index as passed across the ABI.
    pub fn index(self) -> u32 {
        self.0
    }

    /// Whether this handle names a permanent sentinel slot.
    pub fn is_reserved(self) -> bool {
        self.0 < HEAP_START
    }

    /// Sentinel handle for a boolean.
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// Reinterpret an `i32` ABI word as a handle.
    pub fn from_abi(word: i32) -> Self {
        Self(word as u32)
    }

    /// The `i32` ABI word for this handle.
    pub fn to_abi(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_reserved() {
        for h in [Handle::NONE, Handle::UNDEFINED, Handle::NULL, Handle::TRUE, Handle::FALSE] {
            assert!(h.is_reserved(), "{h} should be reserved");
        }
        assert!(!Handle(HEAP_START).is_reserved());
    }

    #[test]
    fn abi_round_trip_preserves_high_bit() {
        let h = Handle(0x8000_0001);
        assert_eq!(Handle::from_abi(h.to_abi()), h);
    }
}
