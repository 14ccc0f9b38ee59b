//! Host-side values stored in the object heap.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use ferry_types::ObjectKind;
use serde_json::Value as Json;

use crate::closure::Trampoline;
use crate::exception::HostResult;
use crate::guest::Guest;
use crate::heap::Sentinels;

/// Largest integer an `f64` represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A value owned by the host and referenced from the module by handle.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    /// Structured data that never needs host identity (parsed JSON, records).
    Json(Json),
    Error(HostError),
    Function(HostFunction),
    Object(HostObject),
}

/// An error value raised by a host operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub name: String,
    pub message: String,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Something the host can call.
#[derive(Clone)]
pub enum HostFunction {
    /// A module closure behind a trampoline.
    Closure(Rc<Trampoline>),
    /// A host-implemented function.
    Native(NativeFunction),
}

type NativeFn = dyn Fn(&mut dyn Guest, &[HostValue]) -> HostResult<HostValue>;

/// Named host callable.
#[derive(Clone)]
pub struct NativeFunction {
    name: Rc<str>,
    func: Rc<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: &str,
        func: impl Fn(&mut dyn Guest, &[HostValue]) -> HostResult<HostValue> + 'static,
    ) -> Self {
        Self {
            name: Rc::from(name),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl HostFunction {
    /// Invoke with `args`. Closures go through their trampoline.
    pub fn call(&self, guest: &mut dyn Guest, args: &[HostValue]) -> HostResult<HostValue> {
        match self {
            Self::Closure(trampoline) => trampoline.call(guest, args),
            Self::Native(native) => (native.func)(guest, args),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Closure(trampoline) => trampoline.name(),
            Self::Native(native) => Some(native.name()),
        }
    }

    /// The trampoline, if this function wraps a module closure.
    pub fn trampoline(&self) -> Option<&Rc<Trampoline>> {
        match self {
            Self::Closure(trampoline) => Some(trampoline),
            Self::Native(_) => None,
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(&a.func, &b.func),
            _ => false,
        }
    }
}

/// An opaque host object tagged with its capability kind.
#[derive(Clone)]
pub struct HostObject {
    kind: ObjectKind,
    payload: Rc<dyn Any>,
}

impl HostObject {
    pub fn new<T: Any>(kind: ObjectKind, payload: T) -> Self {
        Self {
            kind,
            payload: Rc::new(payload),
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// The payload, if it is a `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Whether both refer to the same host object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload)
    }
}

impl HostValue {
    pub fn string(text: impl Into<String>) -> Self {
        Self::String(text.into())
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(HostError::new(name, message))
    }

    pub fn object<T: Any>(kind: ObjectKind, payload: T) -> Self {
        Self::Object(HostObject::new(kind, payload))
    }

    pub fn native(
        name: &str,
        func: impl Fn(&mut dyn Guest, &[HostValue]) -> HostResult<HostValue> + 'static,
    ) -> Self {
        Self::Function(HostFunction::Native(NativeFunction::new(name, func)))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Capability tag of an object value.
    pub fn kind(&self) -> Option<&ObjectKind> {
        self.as_object().map(HostObject::kind)
    }

    /// Short type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Json(_) => "json",
            Self::Error(_) => "error",
            Self::Function(_) => "function",
            Self::Object(_) => "object",
        }
    }

    /// JSON form of the value. `undefined`, functions and opaque objects
    /// have no JSON form and serialize as `null`.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Undefined | Self::Null | Self::Function(_) | Self::Object(_) => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(bytes) => Json::Array(bytes.iter().map(|&b| Json::from(b)).collect()),
            Self::Array(items) => Json::Array(items.iter().map(HostValue::to_json).collect()),
            Self::Json(value) => value.clone(),
            Self::Error(err) => serde_json::json!({ "name": err.name, "message": err.message }),
        }
    }

    /// Host value for parsed JSON. Scalars become plain values; arrays and
    /// objects stay structured.
    pub fn from_json(value: Json) -> Self {
        match value {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

/// Number formatting as the host language prints it.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.into()
    } else if n == 0.0 {
        "0".into()
    } else {
        n.to_string()
    }
}

impl Sentinels for HostValue {
    fn undefined() -> Self {
        Self::Undefined
    }

    fn null() -> Self {
        Self::Null
    }

    fn boolean(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Function(func) => f.debug_tuple("Function").field(&func.name()).finish(),
            Self::Object(o) => f.debug_tuple("Object").field(&o.kind).finish(),
        }
    }
}

/// Human-readable rendering used by the `debug_string` intrinsic.
impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Bytes(_) => f.write_str("Uint8Array"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Json(Json::Array(items)) => {
                let items: Vec<HostValue> =
                    items.iter().cloned().map(HostValue::from_json).collect();
                write!(f, "{}", HostValue::Array(items))
            }
            Self::Json(Json::Object(map)) => write!(f, "Object({})", Json::Object(map.clone())),
            Self::Json(scalar) => write!(f, "{}", HostValue::from_json(scalar.clone())),
            Self::Error(e) => write!(f, "{e}"),
            Self::Function(func) => match func.name() {
                Some(name) if !name.is_empty() => write!(f, "Function({name})"),
                _ => f.write_str("Function"),
            },
            Self::Object(o) => f.write_str(o.kind.name()),
        }
    }
}
