//! Exception channel between host and module.
//!
//! A host operation that raises must not unwind through module frames. The
//! raised value is parked in the object heap and its handle is handed to the
//! module, either through the module's `exn_store` export or through a
//! two-word slot in linear memory:
//!
//! ```text
//! retptr+0 : payload word, or the error handle when the flag is set
//! retptr+4 : 0 = ok, 1 = error
//! ```
//!
//! The same slot layout carries failures the other way, from a fallible
//! module closure back to the host.

use ferry_types::{BridgeError, BridgeResult, Handle, SLOT_FLAG_ERROR, SLOT_FLAG_OK};
use thiserror::Error;

use crate::guest::Guest;
use crate::value::HostValue;

/// Outcome of a host operation that did not complete normally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Raised {
    /// A value raised by the operation. Delivered to the module.
    #[error("uncaught {0}")]
    Thrown(HostValue),

    /// Bridge bookkeeping failed. Never delivered to the module.
    #[error(transparent)]
    Violation(BridgeError),
}

impl Raised {
    /// Raise an `Error` value with the given name and message.
    pub fn error(name: &str, message: impl Into<String>) -> Self {
        Self::Thrown(HostValue::error(name, message))
    }

    /// The thrown value, if any.
    pub fn thrown(&self) -> Option<&HostValue> {
        match self {
            Self::Thrown(value) => Some(value),
            Self::Violation(_) => None,
        }
    }
}

impl From<BridgeError> for Raised {
    fn from(err: BridgeError) -> Self {
        if err.is_contract_violation() {
            tracing::warn!(error = %err, "bridge contract violation");
            Self::Violation(err)
        } else {
            Self::Thrown(HostValue::error(err.name(), err.to_string()))
        }
    }
}

/// Result of a host operation.
pub type HostResult<T> = Result<T, Raised>;

/// Decoded contents of an exception slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Ok(i32),
    Err(Handle),
}

/// A two-word exception slot at a module-provided offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionSlot {
    retptr: u32,
}

impl ExceptionSlot {
    pub fn at(retptr: u32) -> Self {
        Self { retptr }
    }

    pub fn retptr(self) -> u32 {
        self.retptr
    }

    pub fn write_ok(self, guest: &mut dyn Guest, word: i32) -> BridgeResult<()> {
        self.write(guest, word, SLOT_FLAG_OK)
    }

    pub fn write_err(self, guest: &mut dyn Guest, handle: Handle) -> BridgeResult<()> {
        self.write(guest, handle.to_abi(), SLOT_FLAG_ERROR)
    }

    pub fn read(self, guest: &mut dyn Guest) -> BridgeResult<SlotState> {
        let (memory, bridge) = guest.parts();
        let words = bridge.views_mut().view::<i32>(memory);
        let base = words.index_of(self.retptr)?;
        let word = words.get(base)?;
        let flag = words.get(base + 1)?;
        Ok(if flag == SLOT_FLAG_OK {
            SlotState::Ok(word)
        } else {
            SlotState::Err(Handle::from_abi(word))
        })
    }

    fn write(self, guest: &mut dyn Guest, word: i32, flag: i32) -> BridgeResult<()> {
        let (memory, bridge) = guest.parts();
        let mut words = bridge.views_mut().view_mut::<i32>(memory);
        let base = words.index_of(self.retptr)?;
        words.set(base, word)?;
        words.set(base + 1, flag)
    }
}

/// Run `op`; if it throws, park the value and hand it to `exn_store`.
///
/// Returns `Ok(None)` when an exception was stored. Contract violations
/// propagate as `Err`.
pub fn catch_and_store<T>(
    guest: &mut dyn Guest,
    op: impl FnOnce(&mut dyn Guest) -> HostResult<T>,
) -> BridgeResult<Option<T>> {
    match op(&mut *guest) {
        Ok(value) => Ok(Some(value)),
        Err(Raised::Thrown(value)) => {
            let handle = park(guest, value);
            guest.store_exception(handle)?;
            Ok(None)
        }
        Err(Raised::Violation(err)) => Err(err),
    }
}

/// Run `op` and report its outcome through the slot at `retptr`.
pub fn catch_into_slot(
    guest: &mut dyn Guest,
    retptr: u32,
    op: impl FnOnce(&mut dyn Guest) -> HostResult<i32>,
) -> BridgeResult<()> {
    let slot = ExceptionSlot::at(retptr);
    match op(&mut *guest) {
        Ok(word) => slot.write_ok(guest, word),
        Err(Raised::Thrown(value)) => {
            let handle = park(guest, value);
            slot.write_err(guest, handle)
        }
        Err(Raised::Violation(err)) => Err(err),
    }
}

/// Read a slot the module filled in. A set flag takes the error handle and
/// re-raises its value on the host side.
pub fn take_slot_result(guest: &mut dyn Guest, retptr: u32) -> HostResult<i32> {
    match ExceptionSlot::at(retptr).read(guest)? {
        SlotState::Ok(word) => Ok(word),
        SlotState::Err(handle) => {
            let value = guest.bridge().take(handle)?;
            tracing::debug!(%handle, "module reported failure through return slot");
            Err(Raised::Thrown(value))
        }
    }
}

fn park(guest: &mut dyn Guest, value: HostValue) -> Handle {
    let handle = guest.bridge().add(value);
    tracing::debug!(%handle, "host exception parked");
    handle
}
