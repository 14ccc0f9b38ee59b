//! Bridge configuration.
//!
//! Names the module exports the bridge depends on and tunes the codec.
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Grow bound used when the string encoder leaves the ASCII fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringGrowth {
    /// Grow to exactly the remaining UTF-8 byte count.
    #[default]
    Exact,
    /// Grow by three bytes per remaining character.
    Conservative,
}

/// Configuration shared by the runtime and the module loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Import module name under which bridge functions are registered.
    pub import_namespace: String,
    /// Exported linear memory.
    pub memory_export: String,
    /// `malloc(size) -> ptr`.
    pub malloc_export: String,
    /// `realloc(ptr, old_size, new_size) -> ptr`; `None` disables the
    /// string fast path.
    pub realloc_export: Option<String>,
    /// `free(ptr, size)`.
    pub free_export: String,
    /// `exn_store(handle)`, the module-side exception slot.
    pub exn_store_export: Option<String>,
    /// `add_to_stack_pointer(delta) -> sp`, used to reserve return slots.
    pub stack_pointer_export: Option<String>,
    /// Function table holding closure destructors.
    pub destructor_table: String,
    /// Initial slot capacity of the object heap.
    pub heap_capacity: usize,
    /// Grow bound for non-ASCII string encoding.
    pub string_growth: StringGrowth,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            import_namespace: "ferry".into(),
            memory_export: "memory".into(),
            malloc_export: "__ferry_malloc".into(),
            realloc_export: Some("__ferry_realloc".into()),
            free_export: "__ferry_free".into(),
            exn_store_export: Some("__ferry_exn_store".into()),
            stack_pointer_export: Some("__ferry_add_to_stack_pointer".into()),
            destructor_table: "__ferry_destructors".into(),
            heap_capacity: 128,
            string_growth: StringGrowth::Exact,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON configuration and validate it.
    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that name empty exports.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let required = [
            ("import_namespace", &self.import_namespace),
            ("memory_export", &self.memory_export),
            ("malloc_export", &self.malloc_export),
            ("free_export", &self.free_export),
            ("destructor_table", &self.destructor_table),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(BridgeError::Config(format!("`{field}` must not be empty")));
            }
        }
        let optional = [
            ("realloc_export", &self.realloc_export),
            ("exn_store_export", &self.exn_store_export),
            ("stack_pointer_export", &self.stack_pointer_export),
        ];
        for (field, value) in optional {
            if matches!(value, Some(name) if name.is_empty()) {
                return Err(BridgeError::Config(format!(
                    "`{field}` must be omitted or non-empty"
                )));
            }
        }
        Ok(())
    }
}
