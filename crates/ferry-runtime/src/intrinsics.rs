//! The bridge's own import functions.
//!
//! Engine-agnostic bodies of the imports every module linked against the
//! bridge expects, independent of whatever host API the embedder exposes.
//! `ferry-host` wires them into the import table.

use ferry_types::{BridgeError, BridgeResult, Handle, ObjectKind};

use crate::closure::{InvokeFn, Release, Trampoline};
use crate::codec;
use crate::exception::{HostResult, Raised};
use crate::guest::Guest;
use crate::value::{HostFunction, HostValue};

// ══════════════════════════════════════════════════════════════════════════════
// References
// ══════════════════════════════════════════════════════════════════════════════

/// Drop the module's reference. Sentinels are left alone.
pub fn object_drop_ref(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<()> {
    guest.bridge().release(handle)
}

/// A second handle to the same value.
pub fn object_clone_ref(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<Handle> {
    guest.bridge().clone_ref(handle)
}

// ══════════════════════════════════════════════════════════════════════════════
// Scalars and strings
// ══════════════════════════════════════════════════════════════════════════════

pub fn string_new(guest: &mut dyn Guest, ptr: u32, len: u32) -> HostResult<Handle> {
    let text = codec::decode_owned(guest, ptr, len)?;
    Ok(guest.bridge().add(HostValue::String(text)))
}

/// Write `(ptr, len)` of the string at `handle` to `retptr`, or `(0, 0)`
/// when the value is not a string.
pub fn string_get(guest: &mut dyn Guest, retptr: u32, handle: Handle) -> BridgeResult<()> {
    let text = guest.bridge().get(handle)?.as_str().map(str::to_owned);
    match text {
        Some(text) => {
            let encoded = codec::encode(guest, &text)?;
            codec::store_str(guest, retptr, &encoded)
        }
        None => codec::store_words(guest, retptr, &[0, 0]),
    }
}

pub fn number_new(guest: &mut dyn Guest, value: f64) -> Handle {
    guest.bridge().add(HostValue::Number(value))
}

/// Presence word at `retptr`, the number as an `f64` at `retptr + 8`.
pub fn number_get(guest: &mut dyn Guest, retptr: u32, handle: Handle) -> BridgeResult<()> {
    let number = guest.bridge().get(handle)?.as_number();
    let (memory, bridge) = guest.parts();
    let views = bridge.views_mut();
    let mut floats = views.view_mut::<f64>(&mut *memory);
    let index = floats.index_of(retptr)?;
    floats.set(index + 1, number.unwrap_or(0.0))?;
    let mut words = views.view_mut::<i32>(memory);
    let index = words.index_of(retptr)?;
    words.set(index, i32::from(number.is_some()))
}

/// `1` for true, `0` for false, `2` for anything else.
pub fn boolean_get(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<i32> {
    Ok(match guest.bridge().get(handle)?.as_bool() {
        Some(true) => 1,
        Some(false) => 0,
        None => 2,
    })
}

pub fn boolean_new(value: bool) -> Handle {
    Handle::from_bool(value)
}

// ══════════════════════════════════════════════════════════════════════════════
// Type tests
// ══════════════════════════════════════════════════════════════════════════════

pub fn is_undefined(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<bool> {
    Ok(guest.bridge().get(handle)?.is_undefined())
}

pub fn is_null(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<bool> {
    Ok(guest.bridge().get(handle)?.is_null())
}

pub fn is_function(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<bool> {
    Ok(guest.bridge().get(handle)?.as_function().is_some())
}

pub fn is_string(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<bool> {
    Ok(guest.bridge().get(handle)?.as_str().is_some())
}

/// Whether the value is an object carrying the capability tag `code`.
pub fn is_kind(guest: &mut dyn Guest, handle: Handle, code: u32) -> BridgeResult<bool> {
    let wanted = ObjectKind::from_code(code);
    let value = guest.bridge().get(handle)?;
    Ok(matches!((value.kind(), wanted), (Some(kind), Some(wanted)) if *kind == wanted))
}

// ══════════════════════════════════════════════════════════════════════════════
// JSON and debug rendering
// ══════════════════════════════════════════════════════════════════════════════

/// Serialize the value to JSON text and hand it to the module.
pub fn json_serialize(guest: &mut dyn Guest, retptr: u32, handle: Handle) -> BridgeResult<()> {
    let json = guest.bridge().get(handle)?.to_json().to_string();
    let encoded = codec::encode(guest, &json)?;
    codec::store_str(guest, retptr, &encoded)
}

/// Parse JSON text from module memory. Malformed input raises `SyntaxError`.
pub fn json_parse(guest: &mut dyn Guest, ptr: u32, len: u32) -> HostResult<Handle> {
    let text = codec::decode_owned(guest, ptr, len)?;
    let value = serde_json::from_str(&text).map_err(|e| Raised::error("SyntaxError", e.to_string()))?;
    Ok(guest.bridge().add(HostValue::from_json(value)))
}

pub fn debug_string(guest: &mut dyn Guest, retptr: u32, handle: Handle) -> BridgeResult<()> {
    let rendered = guest.bridge().get(handle)?.to_string();
    let encoded = codec::encode(guest, &rendered)?;
    codec::store_str(guest, retptr, &encoded)
}

// ══════════════════════════════════════════════════════════════════════════════
// Errors and logging
// ══════════════════════════════════════════════════════════════════════════════

/// Build the exception a module raises with `throw(ptr, len)`.
pub fn throw(guest: &mut dyn Guest, ptr: u32, len: u32) -> Raised {
    match codec::decode_owned(guest, ptr, len) {
        Ok(message) => Raised::error("Error", message),
        Err(err) => err.into(),
    }
}

/// Log a message from module memory. Returns the decoded text.
pub fn log(guest: &mut dyn Guest, ptr: u32, len: u32) -> BridgeResult<String> {
    let text = codec::decode_owned(guest, ptr, len)?;
    tracing::info!(target: "ferry::guest", "{text}");
    Ok(text)
}

/// As [`log`], freeing the string afterwards.
pub fn log_owned(guest: &mut dyn Guest, ptr: u32, len: u32) -> BridgeResult<String> {
    let text = codec::take_string(guest, ptr, len)?;
    tracing::info!(target: "ferry::guest", "{text}");
    Ok(text)
}

// ══════════════════════════════════════════════════════════════════════════════
// Functions and closures
// ══════════════════════════════════════════════════════════════════════════════

/// Wrap module closure state and hand the module a handle to it.
pub fn closure_new(
    guest: &mut dyn Guest,
    ptr: u32,
    aux: u32,
    destructor: u32,
    invoke: InvokeFn,
) -> Handle {
    let trampoline = Trampoline::wrap(ptr, aux, destructor, invoke);
    guest
        .bridge()
        .add(HostValue::Function(HostFunction::Closure(trampoline)))
}

/// The module dropped its closure. Returns `true` when that destroyed it.
pub fn cb_drop(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<bool> {
    let value = guest.bridge().take(handle)?;
    let Some(trampoline) = value.as_function().and_then(|f| f.trampoline()) else {
        tracing::warn!(%handle, kind = value.type_name(), "cb_drop on a non-closure");
        return Err(BridgeError::InvalidHandle(handle.index()));
    };
    Ok(trampoline.release_from_module(guest)? == Release::Destroyed)
}

/// Register a host-side listener for the function at `handle`.
///
/// Returns a handle the host keeps; a closure gains one reference that
/// [`unregister_callback`] gives back.
pub fn register_callback(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<Handle> {
    let bridge = guest.bridge();
    let value = bridge.clone_value(handle)?;
    let Some(function) = value.as_function() else {
        return Err(BridgeError::HostOperationFailed(format!(
            "{} is not callable",
            value.type_name()
        )));
    };
    if let Some(trampoline) = function.trampoline() {
        trampoline.retain()?;
    }
    Ok(bridge.add(value))
}

/// Drop a registration made by [`register_callback`].
pub fn unregister_callback(guest: &mut dyn Guest, handle: Handle) -> BridgeResult<Release> {
    let value = guest.bridge().take(handle)?;
    match value.as_function().and_then(|f| f.trampoline()) {
        Some(trampoline) => trampoline.release_from_module(guest),
        None => Ok(Release::Unmanaged),
    }
}

/// Call the function at `handle` with `args`.
pub fn call_function(
    guest: &mut dyn Guest,
    handle: Handle,
    args: &[HostValue],
) -> HostResult<HostValue> {
    let value = guest.bridge().clone_value(handle)?;
    match value.as_function() {
        Some(function) => function.call(guest, args),
        None => Err(Raised::error(
            "TypeError",
            format!("{} is not a function", value.type_name()),
        )),
    }
}
