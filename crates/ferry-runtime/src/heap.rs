//! Opaque object heap.
//!
//! Maps small integer handles to host values. Free slots form a singly
//! linked list threaded through the slot array itself:
//!
//! ```text
//! heap_next ──► [37: Free(39)] ──► [39: Free(40)] ──► 40 == slots.len()
//! ```
//!
//! `heap_next` always names a free slot or the position one past the end,
//! where the next growth appends a fresh free slot.

use ferry_types::{BridgeError, BridgeResult, Handle, HEAP_START, RESERVED_SLOTS};

/// Values that can fill the heap's permanent sentinel slots.
pub trait Sentinels: Sized {
    fn undefined() -> Self;
    fn null() -> Self;
    fn boolean(value: bool) -> Self;
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Occupied(T),
    Free(u32),
}

/// Handle table with LIFO slot reuse.
#[derive(Debug, Clone)]
pub struct ObjectHeap<T> {
    slots: Vec<Slot<T>>,
    heap_next: u32,
    live: usize,
}

impl<T: Sentinels> ObjectHeap<T> {
    /// Create a heap with its sentinel slots populated.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a heap with room for `capacity` dynamic handles.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(HEAP_START as usize + capacity);
        slots.extend((0..RESERVED_SLOTS).map(|_| Slot::Occupied(T::undefined())));
        slots.push(Slot::Occupied(T::undefined()));
        slots.push(Slot::Occupied(T::null()));
        slots.push(Slot::Occupied(T::boolean(true)));
        slots.push(Slot::Occupied(T::boolean(false)));
        Self {
            slots,
            heap_next: HEAP_START,
            live: 0,
        }
    }

    /// Drop every dynamic handle and restore the initial free list.
    ///
    /// Returns the number of live values that were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.live;
        self.slots.truncate(HEAP_START as usize);
        self.heap_next = HEAP_START;
        self.live = 0;
        dropped
    }
}

impl<T: Sentinels> Default for ObjectHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectHeap<T> {
    /// Store `value` and return its handle.
    pub fn reserve(&mut self, value: T) -> Handle {
        if self.heap_next as usize == self.slots.len() {
            self.slots.push(Slot::Free(self.heap_next + 1));
        }
        let idx = self.heap_next;
        let slot = &mut self.slots[idx as usize];
        let Slot::Free(next) = *slot else {
            unreachable!("heap_next {idx} points at an occupied slot");
        };
        self.heap_next = next;
        *slot = Slot::Occupied(value);
        self.live += 1;
        tracing::trace!(handle = idx, live = self.live, "heap reserve");
        Handle(idx)
    }

    /// Borrow the value behind `handle`.
    pub fn get(&self, handle: Handle) -> BridgeResult<&T> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Occupied(value)) => Ok(value),
            _ => Err(invalid(handle)),
        }
    }

    /// Mutably borrow the value behind `handle`.
    pub fn get_mut(&mut self, handle: Handle) -> BridgeResult<&mut T> {
        match self.slots.get_mut(handle.0 as usize) {
            Some(Slot::Occupied(value)) => Ok(value),
            _ => Err(invalid(handle)),
        }
    }

    /// Return `handle` to the free list and drop its value.
    ///
    /// Sentinel handles are never freed.
    pub fn release(&mut self, handle: Handle) -> BridgeResult<()> {
        self.remove(handle).map(drop)
    }

    /// Move the value out and free the slot.
    ///
    /// Sentinels stay in place, so taking one yields a copy.
    pub fn take(&mut self, handle: Handle) -> BridgeResult<T>
    where
        T: Clone,
    {
        if handle.is_reserved() {
            return self.get(handle).cloned();
        }
        self.remove(handle)?.ok_or_else(|| invalid(handle))
    }

    /// Whether `handle` currently names a value.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live dynamic handles.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Head of the free list.
    pub fn next_free(&self) -> Handle {
        Handle(self.heap_next)
    }

    /// Total number of slots, including sentinels and free slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn remove(&mut self, handle: Handle) -> BridgeResult<Option<T>> {
        if handle.is_reserved() {
            return Ok(None);
        }
        let idx = handle.0;
        if !matches!(self.slots.get(idx as usize), Some(Slot::Occupied(_))) {
            return Err(invalid(handle));
        }
        let freed = Slot::Free(self.heap_next);
        let Slot::Occupied(value) = std::mem::replace(&mut self.slots[idx as usize], freed) else {
            unreachable!("slot {idx} checked occupied");
        };
        self.heap_next = idx;
        self.live -= 1;
        tracing::trace!(handle = idx, live = self.live, "heap release");
        Ok(Some(value))
    }
}

fn invalid(handle: Handle) -> BridgeError {
    tracing::warn!(handle = handle.0, "lookup of free or out-of-range heap slot");
    BridgeError::InvalidHandle(handle.0)
}
