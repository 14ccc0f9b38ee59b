//! The import table a module is linked against.
//!
//! Three kinds of entries live under the bridge namespace:
//!
//! - the bridge intrinsics (`object_drop_ref`, `string_new`, `throw`, ...),
//! - closure wrappers, `name(ptr, aux) -> handle`, one per closure shape the
//!   module creates, each bound to a destructor slot and an adapter export,
//! - host functions, declared with the ABI shape of their arguments and
//!   result so that marshalling happens here instead of in every body.
//!
//! A host function marked fallible takes a leading `retptr` and reports
//! through the exception slot there. Anything else that raises traps out of
//! module code with the raised value parked in [`HostState::pending`].

use std::collections::BTreeSet;
use std::fmt;
use std::slice;
use std::sync::Arc;

use ferry_runtime::{closure, codec, exception, intrinsics};
use ferry_runtime::{Guest, HostResult, HostValue, Raised};
use ferry_types::{BridgeError, BridgeResult, Handle};
use wasmi::core::ValType;
use wasmi::{Caller, FuncType, Linker, Val};

use crate::error::{load_error, Trap};
use crate::guest::WasmiGuest;
use crate::state::HostState;

/// Body of a host function.
pub type HostOp = Arc<dyn Fn(&mut dyn Guest, &[HostValue]) -> HostResult<HostValue> + Send + Sync>;

/// Names of the bridge intrinsics installed by [`ImportTable::with_intrinsics`].
pub const INTRINSICS: &[&str] = &[
    "object_drop_ref",
    "object_clone_ref",
    "string_new",
    "string_get",
    "number_new",
    "number_get",
    "boolean_get",
    "is_undefined",
    "is_null",
    "is_function",
    "is_string",
    "is_kind",
    "json_serialize",
    "json_parse",
    "debug_string",
    "throw",
    "log",
    "log_owned",
    "cb_drop",
    "function_call",
];

/// How one argument arrives from the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiKind {
    /// Borrowed heap handle. The module keeps its reference.
    Handle,
    /// Heap handle whose reference moves to the host.
    OwnedHandle,
    I32,
    U32,
    F64,
    /// `(ptr, len)` UTF-8 the module keeps.
    Str,
    /// `(ptr, len)` with `ptr == 0` meaning absent.
    OptionalStr,
    /// `(ptr, len)` UTF-8 the host frees after reading.
    OwnedStr,
    /// `(ptr, len)` byte range, copied.
    Bytes,
}

impl AbiKind {
    fn push_types(self, types: &mut Vec<ValType>) {
        match self {
            Self::F64 => types.push(ValType::F64),
            Self::Handle | Self::OwnedHandle | Self::I32 | Self::U32 => types.push(ValType::I32),
            Self::Str | Self::OptionalStr | Self::OwnedStr | Self::Bytes => {
                types.extend([ValType::I32, ValType::I32])
            }
        }
    }

    fn decode(self, guest: &mut dyn Guest, words: &mut slice::Iter<'_, Val>) -> HostResult<HostValue> {
        Ok(match self {
            Self::Handle => guest.bridge().clone_value(Handle::from_abi(next_i32(words)?))?,
            Self::OwnedHandle => guest.bridge().take(Handle::from_abi(next_i32(words)?))?,
            Self::I32 => HostValue::Number(f64::from(next_i32(words)?)),
            Self::U32 => HostValue::Number(f64::from(next_i32(words)? as u32)),
            Self::F64 => HostValue::Number(next_f64(words)?),
            Self::Str => {
                let (ptr, len) = next_pair(words)?;
                HostValue::String(codec::decode_owned(guest, ptr, len)?)
            }
            Self::OptionalStr => match next_pair(words)? {
                (0, _) => HostValue::Undefined,
                (ptr, len) => HostValue::String(codec::decode_owned(guest, ptr, len)?),
            },
            Self::OwnedStr => {
                let (ptr, len) = next_pair(words)?;
                HostValue::String(codec::take_string(guest, ptr, len)?)
            }
            Self::Bytes => {
                let (ptr, len) = next_pair(words)?;
                HostValue::Bytes(codec::copy_bytes(guest, ptr, len)?)
            }
        })
    }
}

/// How the result goes back to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Unit,
    /// A fresh handle the module owns.
    Handle,
    /// As `Handle`, with `undefined` and `null` mapped to `0`.
    OptionalHandle,
    /// A number truncated to `i32`; booleans become `0` or `1`.
    I32,
    F64,
}

impl ReturnKind {
    fn val_type(self) -> Option<ValType> {
        match self {
            Self::Unit => None,
            Self::Handle | Self::OptionalHandle | Self::I32 => Some(ValType::I32),
            Self::F64 => Some(ValType::F64),
        }
    }

    fn encode(self, guest: &mut dyn Guest, value: HostValue) -> HostResult<Option<Val>> {
        Ok(match self {
            Self::Unit => None,
            Self::Handle => Some(Val::I32(guest.bridge().park(value).to_abi())),
            Self::OptionalHandle => Some(Val::I32(match value {
                HostValue::Undefined | HostValue::Null => 0,
                value => guest.bridge().park(value).to_abi(),
            })),
            Self::I32 => Some(Val::I32(match value {
                HostValue::Bool(b) => i32::from(b),
                HostValue::Number(n) => n as i32,
                other => return Err(type_error("a number", &other)),
            })),
            Self::F64 => match value {
                HostValue::Number(n) => Some(Val::F64(n.into())),
                other => return Err(type_error("a number", &other)),
            },
        })
    }
}

/// A declared host function.
#[derive(Clone)]
pub struct HostImport {
    params: Vec<AbiKind>,
    ret: ReturnKind,
    fallible: bool,
    op: HostOp,
}

impl HostImport {
    pub fn new(
        op: impl Fn(&mut dyn Guest, &[HostValue]) -> HostResult<HostValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            params: Vec::new(),
            ret: ReturnKind::Unit,
            fallible: false,
            op: Arc::new(op),
        }
    }

    pub fn params(mut self, params: impl IntoIterator<Item = AbiKind>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    pub fn returns(mut self, ret: ReturnKind) -> Self {
        self.ret = ret;
        self
    }

    /// Report raised values through a leading `retptr` slot.
    pub fn fallible(mut self) -> Self {
        self.fallible = true;
        self
    }

    /// Engine signature. A fallible import writes its result word into the
    /// slot and returns nothing.
    fn func_type(&self) -> FuncType {
        let mut params = Vec::new();
        if self.fallible {
            params.push(ValType::I32);
        }
        for kind in &self.params {
            kind.push_types(&mut params);
        }
        let results = if self.fallible {
            None
        } else {
            self.ret.val_type()
        };
        FuncType::new(params, results)
    }

    fn invoke(&self, guest: &mut dyn Guest, words: &[Val]) -> HostResult<Option<Val>> {
        if !self.fallible {
            let value = self.call(guest, words)?;
            return self.ret.encode(guest, value);
        }
        let (retptr, rest) = words
            .split_first()
            .ok_or_else(|| BridgeError::Guest("missing return slot".into()))?;
        let retptr = retptr
            .i32()
            .ok_or_else(|| BridgeError::Guest("return slot is not an i32".into()))?;
        exception::catch_into_slot(guest, retptr as u32, |guest| {
            let value = self.call(guest, rest)?;
            match self.ret.encode(guest, value)? {
                Some(Val::I32(word)) => Ok(word),
                _ => Ok(0),
            }
        })?;
        Ok(None)
    }

    fn call(&self, guest: &mut dyn Guest, words: &[Val]) -> HostResult<HostValue> {
        let mut words = words.iter();
        let args = self
            .params
            .iter()
            .map(|kind| kind.decode(&mut *guest, &mut words))
            .collect::<HostResult<Vec<_>>>()?;
        (self.op)(guest, &args)
    }
}

impl fmt::Debug for HostImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostImport")
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field("fallible", &self.fallible)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Closure {
        destructor: u32,
        adapter: String,
        fallible: bool,
    },
    Host(HostImport),
}

/// Builder for the bridge namespace of a module's imports.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    intrinsics: bool,
    entries: Vec<(String, Entry)>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the bridge intrinsics.
    pub fn with_intrinsics(mut self) -> Self {
        self.intrinsics = true;
        self
    }

    /// Register `name(ptr, aux) -> handle`, which wraps module closure state
    /// in a trampoline that calls `adapter_export` and is destroyed through
    /// the destructor table slot `destructor`.
    pub fn closure_wrapper(
        mut self,
        name: impl Into<String>,
        destructor: u32,
        adapter_export: impl Into<String>,
        fallible: bool,
    ) -> Self {
        self.entries.push((
            name.into(),
            Entry::Closure {
                destructor,
                adapter: adapter_export.into(),
                fallible,
            },
        ));
        self
    }

    pub fn host_function(mut self, name: impl Into<String>, import: HostImport) -> Self {
        self.entries.push((name.into(), Entry::Host(import)));
        self
    }

    /// Every name this table provides.
    pub fn names(&self) -> BTreeSet<&str> {
        let intrinsics: &[&str] = if self.intrinsics { INTRINSICS } else { &[] };
        intrinsics
            .iter()
            .copied()
            .chain(self.entries.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        (self.intrinsics && INTRINSICS.contains(&name))
            || self.entries.iter().any(|(entry, _)| entry == name)
    }

    /// Define every entry on `linker` under `namespace`.
    pub fn link(&self, linker: &mut Linker<HostState>, namespace: &str) -> BridgeResult<()> {
        if self.intrinsics {
            link_intrinsics(linker, namespace)?;
        }
        for (name, entry) in &self.entries {
            match entry {
                Entry::Closure {
                    destructor,
                    adapter,
                    fallible,
                } => link_closure_wrapper(linker, namespace, name, *destructor, adapter, *fallible)?,
                Entry::Host(import) => link_host_function(linker, namespace, name, import)?,
            }
        }
        tracing::debug!(namespace, count = self.names().len(), "imports linked");
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Linking
// ══════════════════════════════════════════════════════════════════════════════

/// Run `op` against the calling instance.
///
/// Raised values are parked in the store and turned into a trap, so they
/// surface from the host's outermost call into the module.
pub(crate) fn with_guest<R>(
    caller: Caller<'_, HostState>,
    op: impl FnOnce(&mut dyn Guest) -> HostResult<R>,
) -> Result<R, wasmi::Error> {
    let mut guest = WasmiGuest::new(caller).map_err(|err| Trap::Violation(err).into_engine())?;
    match op(&mut guest) {
        Ok(value) => Ok(value),
        Err(raised) => {
            let trap = match &raised {
                Raised::Thrown(_) => Trap::Exception,
                Raised::Violation(err) => Trap::Violation(err.clone()),
            };
            guest.set_pending(raised);
            Err(trap.into_engine())
        }
    }
}

fn link_closure_wrapper(
    linker: &mut Linker<HostState>,
    namespace: &str,
    name: &str,
    destructor: u32,
    adapter: &str,
    fallible: bool,
) -> BridgeResult<()> {
    let adapter = adapter.to_owned();
    linker
        .func_wrap(
            namespace,
            name,
            move |caller: Caller<'_, HostState>, ptr: i32, aux: i32| -> Result<i32, wasmi::Error> {
                with_guest(caller, |guest| {
                    let invoke = if fallible {
                        closure::fallible_adapter(adapter.as_str())
                    } else {
                        closure::adapter(adapter.as_str())
                    };
                    let handle =
                        intrinsics::closure_new(guest, ptr as u32, aux as u32, destructor, invoke);
                    Ok(handle.to_abi())
                })
            },
        )
        .map_err(load_error)?;
    Ok(())
}

fn link_host_function(
    linker: &mut Linker<HostState>,
    namespace: &str,
    name: &str,
    import: &HostImport,
) -> BridgeResult<()> {
    if import.fallible && import.ret == ReturnKind::F64 {
        return Err(BridgeError::Config(format!(
            "fallible import `{name}` cannot return f64 through its slot"
        )));
    }
    let import = import.clone();
    linker
        .func_new(
            namespace,
            name,
            import.func_type(),
            move |caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                let out = with_guest(caller, |guest| import.invoke(guest, params))?;
                if let (Some(slot), Some(val)) = (results.first_mut(), out) {
                    *slot = val;
                }
                Ok(())
            },
        )
        .map_err(load_error)?;
    Ok(())
}

fn link_intrinsics(linker: &mut Linker<HostState>, ns: &str) -> BridgeResult<()> {
    type Ctx<'a> = Caller<'a, HostState>;
    type Out<T> = Result<T, wasmi::Error>;

    let h = Handle::from_abi;

    linker
        .func_wrap(ns, "object_drop_ref", move |c: Ctx<'_>, handle: i32| -> Out<()> {
            with_guest(c, |g| Ok(intrinsics::object_drop_ref(g, h(handle))?))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "object_clone_ref", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(intrinsics::object_clone_ref(g, h(handle))?.to_abi()))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "string_new", |c: Ctx<'_>, ptr: i32, len: i32| -> Out<i32> {
            with_guest(c, |g| Ok(intrinsics::string_new(g, ptr as u32, len as u32)?.to_abi()))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "string_get", move |c: Ctx<'_>, retptr: i32, handle: i32| -> Out<()> {
            with_guest(c, |g| Ok(intrinsics::string_get(g, retptr as u32, h(handle))?))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "number_new", |c: Ctx<'_>, value: f64| -> Out<i32> {
            with_guest(c, |g| Ok(intrinsics::number_new(g, value).to_abi()))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "number_get", move |c: Ctx<'_>, retptr: i32, handle: i32| -> Out<()> {
            with_guest(c, |g| Ok(intrinsics::number_get(g, retptr as u32, h(handle))?))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "boolean_get", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(intrinsics::boolean_get(g, h(handle))?))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "is_undefined", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::is_undefined(g, h(handle))?)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "is_null", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::is_null(g, h(handle))?)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "is_function", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::is_function(g, h(handle))?)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "is_string", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::is_string(g, h(handle))?)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "is_kind", move |c: Ctx<'_>, handle: i32, code: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::is_kind(g, h(handle), code as u32)?)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "json_serialize", move |c: Ctx<'_>, retptr: i32, handle: i32| -> Out<()> {
            with_guest(c, |g| Ok(intrinsics::json_serialize(g, retptr as u32, h(handle))?))
        })
        .map_err(load_error)?;
    // Fallible: a parse error goes to `exn_store` and the call returns 0.
    linker
        .func_wrap(ns, "json_parse", |c: Ctx<'_>, ptr: i32, len: i32| -> Out<i32> {
            with_guest(c, |g| {
                let parsed = exception::catch_and_store(g, |g| {
                    intrinsics::json_parse(g, ptr as u32, len as u32)
                })?;
                Ok(parsed.map_or(0, Handle::to_abi))
            })
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "debug_string", move |c: Ctx<'_>, retptr: i32, handle: i32| -> Out<()> {
            with_guest(c, |g| Ok(intrinsics::debug_string(g, retptr as u32, h(handle))?))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "throw", |c: Ctx<'_>, ptr: i32, len: i32| -> Out<()> {
            with_guest(c, |g| Err(intrinsics::throw(g, ptr as u32, len as u32)))
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "log", |c: Ctx<'_>, ptr: i32, len: i32| -> Out<()> {
            with_guest(c, |g| {
                intrinsics::log(g, ptr as u32, len as u32)?;
                Ok(())
            })
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "log_owned", |c: Ctx<'_>, ptr: i32, len: i32| -> Out<()> {
            with_guest(c, |g| {
                intrinsics::log_owned(g, ptr as u32, len as u32)?;
                Ok(())
            })
        })
        .map_err(load_error)?;
    linker
        .func_wrap(ns, "cb_drop", move |c: Ctx<'_>, handle: i32| -> Out<i32> {
            with_guest(c, |g| Ok(i32::from(intrinsics::cb_drop(g, h(handle))?)))
        })
        .map_err(load_error)?;
    // function_call(retptr, f, arg): `arg == 0` calls with no arguments.
    linker
        .func_wrap(
            ns,
            "function_call",
            move |c: Ctx<'_>, retptr: i32, function: i32, arg: i32| -> Out<()> {
                with_guest(c, |g| {
                    exception::catch_into_slot(g, retptr as u32, |g| {
                        let args = match h(arg) {
                            Handle::NONE => Vec::new(),
                            arg => vec![g.bridge().clone_value(arg)?],
                        };
                        let out = intrinsics::call_function(g, h(function), &args)?;
                        Ok(g.bridge().park(out).to_abi())
                    })?;
                    Ok(())
                })
            },
        )
        .map_err(load_error)?;
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Argument words
// ══════════════════════════════════════════════════════════════════════════════

fn next_i32(words: &mut slice::Iter<'_, Val>) -> BridgeResult<i32> {
    words
        .next()
        .and_then(Val::i32)
        .ok_or_else(|| BridgeError::Guest("argument word missing or not an i32".into()))
}

fn next_f64(words: &mut slice::Iter<'_, Val>) -> BridgeResult<f64> {
    words
        .next()
        .and_then(Val::f64)
        .map(|v| v.to_float())
        .ok_or_else(|| BridgeError::Guest("argument word missing or not an f64".into()))
}

fn next_pair(words: &mut slice::Iter<'_, Val>) -> BridgeResult<(u32, u32)> {
    Ok((next_i32(words)? as u32, next_i32(words)? as u32))
}

fn type_error(expected: &str, got: &HostValue) -> Raised {
    Raised::error(
        "TypeError",
        format!("expected {expected}, got {}", got.type_name()),
    )
}
