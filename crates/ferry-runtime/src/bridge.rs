//! Per-instance bridge state.

use ferry_types::{BridgeConfig, BridgeResult, Handle};

use crate::heap::ObjectHeap;
use crate::memory::ViewCache;
use crate::value::HostValue;

/// Owner of everything the bridge keeps for one module instance: the object
/// heap, the view cache and the configuration.
#[derive(Debug)]
pub struct Bridge {
    heap: ObjectHeap<HostValue>,
    views: ViewCache,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            heap: ObjectHeap::with_capacity(config.heap_capacity),
            views: ViewCache::new(),
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn heap(&self) -> &ObjectHeap<HostValue> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut ObjectHeap<HostValue> {
        &mut self.heap
    }

    pub fn views(&self) -> &ViewCache {
        &self.views
    }

    pub fn views_mut(&mut self) -> &mut ViewCache {
        &mut self.views
    }

    /// Park `value` in the heap.
    pub fn add(&mut self, value: HostValue) -> Handle {
        self.heap.reserve(value)
    }

    /// As [`Bridge::add`], but `undefined`, `null` and booleans map to their
    /// sentinel handles instead of taking a slot.
    pub fn park(&mut self, value: HostValue) -> Handle {
        match value {
            HostValue::Undefined => Handle::UNDEFINED,
            HostValue::Null => Handle::NULL,
            HostValue::Bool(b) => Handle::from_bool(b),
            other => self.add(other),
        }
    }

    pub fn get(&self, handle: Handle) -> BridgeResult<&HostValue> {
        self.heap.get(handle)
    }

    pub fn clone_value(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.heap.get(handle).cloned()
    }

    /// A second handle to the same value.
    pub fn clone_ref(&mut self, handle: Handle) -> BridgeResult<Handle> {
        let value = self.clone_value(handle)?;
        Ok(self.add(value))
    }

    pub fn release(&mut self, handle: Handle) -> BridgeResult<()> {
        self.heap.release(handle)
    }

    pub fn take(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        self.heap.take(handle)
    }

    /// Drop every dynamic handle and forget cached views.
    pub fn teardown(&mut self) -> usize {
        let dropped = self.heap.clear();
        self.views.invalidate();
        tracing::debug!(dropped, "bridge torn down");
        dropped
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}
