use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability tag attached to an opaque host object when it is created.
///
/// Import functions check the tag instead of probing the object's runtime
/// type, so "is this a rendering context?" is a plain comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Window,
    Document,
    Element,
    Canvas,
    RenderingContext,
    Request,
    Response,
    Headers,
    Promise,
    Memory,
    Event,
    /// Embedder-defined capability.
    Custom(String),
}

impl ObjectKind {
    /// Stable numeric code used by the `is_kind` intrinsic.
    ///
    /// `Custom` kinds have no code and can only be matched host-side.
    pub fn code(&self) -> Option<u32> {
        let code = match self {
            Self::Window => 1,
            Self::Document => 2,
            Self::Element => 3,
            Self::Canvas => 4,
            Self::RenderingContext => 5,
            Self::Request => 6,
            Self::Response => 7,
            Self::Headers => 8,
            Self::Promise => 9,
            Self::Memory => 10,
            Self::Event => 11,
            Self::Custom(_) => return None,
        };
        Some(code)
    }

    /// Inverse of [`ObjectKind::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        let kind = match code {
            1 => Self::Window,
            2 => Self::Document,
            3 => Self::Element,
            4 => Self::Canvas,
            5 => Self::RenderingContext,
            6 => Self::Request,
            7 => Self::Response,
            8 => Self::Headers,
            9 => Self::Promise,
            10 => Self::Memory,
            11 => Self::Event,
            _ => return None,
        };
        Some(kind)
    }

    /// Display name used by debug rendering.
    pub fn name(&self) -> &str {
        match self {
            Self::Window => "Window",
            Self::Document => "Document",
            Self::Element => "Element",
            Self::Canvas => "Canvas",
            Self::RenderingContext => "RenderingContext",
            Self::Request => "Request",
            Self::Response => "Response",
            Self::Headers => "Headers",
            Self::Promise => "Promise",
            Self::Memory => "Memory",
            Self::Event => "Event",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=11 {
            let kind = ObjectKind::from_code(code).unwrap();
            assert_eq!(kind.code(), Some(code));
        }
        assert_eq!(ObjectKind::from_code(0), None);
        assert_eq!(ObjectKind::Custom("Gamepad".into()).code(), None);
    }
}
