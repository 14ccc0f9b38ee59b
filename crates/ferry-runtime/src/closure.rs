//! Closure trampolines.
//!
//! A module closure is two words of captured state plus a destructor index.
//! The trampoline turns that into a host-callable function and decides when
//! the state is destroyed. The reference count covers the module's own
//! reference, each extra host registration, and each in-flight invocation.
//! The destructor runs exactly once, on the transition to zero, and the
//! trampoline is inert afterwards.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use ferry_types::{AbiValue, BridgeError, BridgeResult, Handle, SLOT_SIZE};

use crate::exception::{self, HostResult, Raised};
use crate::guest::Guest;
use crate::value::HostValue;

/// Captured state of a module closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureEnv {
    pub ptr: u32,
    pub aux: u32,
}

/// Calls into the module with a closure's captured state.
pub type InvokeFn = Rc<dyn Fn(&mut dyn Guest, ClosureEnv, &[HostValue]) -> HostResult<HostValue>>;

/// Box a closure as an [`InvokeFn`].
pub fn invoke_fn(
    f: impl Fn(&mut dyn Guest, ClosureEnv, &[HostValue]) -> HostResult<HostValue> + 'static,
) -> InvokeFn {
    Rc::new(f)
}

/// Outcome of dropping a reference to a host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The count reached zero and the destructor ran.
    Destroyed,
    /// References remain.
    Retained(u32),
    /// The closure had already been destroyed. Nothing happened.
    AlreadyReleased,
    /// A native host function. There was no module state to release.
    Unmanaged,
}

pub struct Trampoline {
    /// `None` while an invocation holds the state.
    ptr: Cell<Option<u32>>,
    aux: u32,
    refcount: Cell<u32>,
    destructor: u32,
    inert: Cell<bool>,
    invoke: InvokeFn,
    name: Option<String>,
}

impl Trampoline {
    /// Wrap module closure state. The module holds the first reference.
    pub fn wrap(ptr: u32, aux: u32, destructor: u32, invoke: InvokeFn) -> Rc<Self> {
        Self::build(None, ptr, aux, destructor, invoke)
    }

    /// As [`Trampoline::wrap`], with a name for debug rendering.
    pub fn wrap_named(
        name: impl Into<String>,
        ptr: u32,
        aux: u32,
        destructor: u32,
        invoke: InvokeFn,
    ) -> Rc<Self> {
        Self::build(Some(name.into()), ptr, aux, destructor, invoke)
    }

    fn build(
        name: Option<String>,
        ptr: u32,
        aux: u32,
        destructor: u32,
        invoke: InvokeFn,
    ) -> Rc<Self> {
        tracing::debug!(ptr, aux, destructor, ?name, "closure wrapped");
        Rc::new(Self {
            ptr: Cell::new(Some(ptr)),
            aux,
            refcount: Cell::new(1),
            destructor,
            inert: Cell::new(false),
            invoke,
            name,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    pub fn destructor(&self) -> u32 {
        self.destructor
    }

    /// Whether the destructor has run.
    pub fn is_inert(&self) -> bool {
        self.inert.get()
    }

    /// Whether an invocation is currently running.
    pub fn is_executing(&self) -> bool {
        !self.is_inert() && self.ptr.get().is_none()
    }

    /// Add a reference for another host registration.
    pub fn retain(&self) -> BridgeResult<u32> {
        if self.is_inert() {
            return Err(BridgeError::ClosureUnavailable);
        }
        let count = self.refcount.get() + 1;
        self.refcount.set(count);
        tracing::trace!(count, "closure retained");
        Ok(count)
    }

    /// Invoke the closure.
    ///
    /// The in-flight reference keeps the state alive even if every other
    /// reference is released from inside the call.
    pub fn call(&self, guest: &mut dyn Guest, args: &[HostValue]) -> HostResult<HostValue> {
        if self.is_inert() {
            return Err(BridgeError::ClosureUnavailable.into());
        }
        let Some(ptr) = self.ptr.take() else {
            tracing::warn!(aux = self.aux, "closure invoked recursively");
            return Err(BridgeError::ClosureUnavailable.into());
        };
        self.refcount.set(self.refcount.get() + 1);
        let env = ClosureEnv { ptr, aux: self.aux };
        let result = (self.invoke)(&mut *guest, env, args);
        let settled = self.settle(guest, env);
        // A failed destructor outranks whatever the invocation raised.
        match settled {
            Err(err) => Err(Raised::from(err)),
            Ok(_) => result,
        }
    }

    /// Drop one reference on behalf of the module.
    pub fn release_from_module(&self, guest: &mut dyn Guest) -> BridgeResult<Release> {
        if self.is_inert() || self.refcount.get() == 0 {
            tracing::warn!(aux = self.aux, "release of already released closure");
            return Ok(Release::AlreadyReleased);
        }
        match self.ptr.get() {
            Some(ptr) => self.settle(guest, ClosureEnv { ptr, aux: self.aux }),
            // An invocation is in flight and holds the last reference itself.
            None if self.refcount.get() > 1 => {
                let count = self.refcount.get() - 1;
                self.refcount.set(count);
                Ok(Release::Retained(count))
            }
            None => {
                tracing::warn!(aux = self.aux, "release while only the running call holds the closure");
                Ok(Release::AlreadyReleased)
            }
        }
    }

    /// Decrement; on zero run the destructor, otherwise put the state back.
    fn settle(&self, guest: &mut dyn Guest, env: ClosureEnv) -> BridgeResult<Release> {
        let count = self.refcount.get() - 1;
        self.refcount.set(count);
        if count == 0 {
            self.inert.set(true);
            self.ptr.set(None);
            tracing::debug!(ptr = env.ptr, aux = env.aux, destructor = self.destructor, "closure destroyed");
            guest.destroy_closure(self.destructor, env)?;
            Ok(Release::Destroyed)
        } else {
            self.ptr.set(Some(env.ptr));
            Ok(Release::Retained(count))
        }
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("ptr", &self.ptr.get())
            .field("aux", &self.aux)
            .field("refcount", &self.refcount.get())
            .field("destructor", &self.destructor)
            .field("inert", &self.inert.get())
            .field("name", &self.name)
            .finish()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Module adapters
// ══════════════════════════════════════════════════════════════════════════════

/// Invoke function that calls an exported adapter
/// `adapter(ptr, aux, arg_handles...) -> result_handle`.
///
/// Arguments are parked in the heap and owned by the module from then on. A
/// returned handle of `0` means `undefined`.
pub fn adapter(export: impl Into<String>) -> InvokeFn {
    let export = export.into();
    invoke_fn(move |guest, env, args| {
        let mut params = vec![AbiValue::from(env.ptr), AbiValue::from(env.aux)];
        params.extend(park_args(guest, args));
        let results = guest.call_export(&export, &params)?;
        match results.first().and_then(|word| word.as_i32()) {
            Some(word) => result_value(guest, Handle::from_abi(word)),
            None => Ok(HostValue::Undefined),
        }
    })
}

/// Invoke function for a fallible adapter
/// `adapter(retptr, ptr, aux, arg_handles...)` that reports through a
/// return slot reserved on the module's shadow stack.
pub fn fallible_adapter(export: impl Into<String>) -> InvokeFn {
    let export = export.into();
    invoke_fn(move |guest, env, args| {
        let sp_export = guest
            .bridge()
            .config()
            .stack_pointer_export
            .clone()
            .ok_or_else(|| BridgeError::MissingExport("stack pointer".into()))?;
        let retptr = stack_pointer(guest, &sp_export, -(SLOT_SIZE as i32 * 2))?;
        let mut params = vec![
            AbiValue::from(retptr),
            AbiValue::from(env.ptr),
            AbiValue::from(env.aux),
        ];
        params.extend(park_args(guest, args));
        let outcome = guest
            .call_export(&export, &params)
            .and_then(|_| exception::take_slot_result(guest, retptr));
        stack_pointer(guest, &sp_export, SLOT_SIZE as i32 * 2)?;
        result_value(guest, Handle::from_abi(outcome?))
    })
}

fn park_args(guest: &mut dyn Guest, args: &[HostValue]) -> Vec<AbiValue> {
    let bridge = guest.bridge();
    args.iter()
        .map(|arg| AbiValue::from(bridge.add(arg.clone()).to_abi()))
        .collect()
}

fn result_value(guest: &mut dyn Guest, handle: Handle) -> HostResult<HostValue> {
    if handle == Handle::NONE {
        return Ok(HostValue::Undefined);
    }
    Ok(guest.bridge().take(handle)?)
}

fn stack_pointer(guest: &mut dyn Guest, export: &str, delta: i32) -> HostResult<u32> {
    let results = guest.call_export(export, &[AbiValue::from(delta)])?;
    results
        .first()
        .and_then(|word| word.as_u32())
        .ok_or_else(|| Raised::from(BridgeError::MissingExport(export.to_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> InvokeFn {
        invoke_fn(|_, _, _| Ok(HostValue::Undefined))
    }

    #[test]
    fn starts_with_module_reference() {
        let t = Trampoline::wrap(16, 0, 3, noop());
        assert_eq!(t.refcount(), 1);
        assert!(!t.is_inert());
        assert!(!t.is_executing());
    }

    #[test]
    fn named_wrap_keeps_name() {
        let t = Trampoline::wrap_named("onclick", 16, 0, 3, noop());
        assert_eq!(t.name(), Some("onclick"));
    }

    #[test]
    fn retain_fails_once_inert() {
        let t = Trampoline::wrap(16, 0, 3, noop());
        t.inert.set(true);
        assert_eq!(t.retain(), Err(BridgeError::ClosureUnavailable));
    }
}
