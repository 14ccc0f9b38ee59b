//! Typed views over the module's linear memory.
//!
//! The module may grow its memory on any call into module code. A view
//! descriptor remembers the byte length of the buffer it was built over; once
//! the buffer has been resized the descriptor reports zero elements
//! (detached) and is rebuilt on next access. The borrowed view types tie
//! every read to a live borrow of the current buffer, so a detached buffer
//! can never be read through them.

use std::marker::PhantomData;

use ferry_types::{BridgeError, BridgeResult};

/// Size of one linear-memory page.
pub const PAGE_SIZE: usize = 65_536;

/// Element width of a typed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    U8,
    I32,
    F64,
}

impl ViewKind {
    /// Width of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 => 4,
            Self::F64 => 8,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::U8 => 0,
            Self::I32 => 1,
            Self::F64 => 2,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for i32 {}
    impl Sealed for f64 {}
}

/// Element types a typed view can expose. Little-endian, as in linear memory.
pub trait Element: Copy + sealed::Sealed {
    const KIND: ViewKind;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut [u8]);
}

impl Element for u8 {
    const KIND: ViewKind = ViewKind::U8;

    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn write(self, out: &mut [u8]) {
        out[0] = self;
    }
}

impl Element for i32 {
    const KIND: ViewKind = ViewKind::I32;

    fn read(bytes: &[u8]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[..4]);
        i32::from_le_bytes(word)
    }

    fn write(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for f64 {
    const KIND: ViewKind = ViewKind::F64;

    fn read(bytes: &[u8]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(word)
    }

    fn write(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }
}

/// Cached view: the buffer length it was materialized against.
#[derive(Debug, Clone, Copy)]
struct ViewDescriptor {
    byte_len: usize,
}

impl ViewDescriptor {
    /// Element count as the view would report it. A resized buffer detaches
    /// the view, which then reports zero.
    fn reported_len(self, kind: ViewKind, current_len: usize) -> usize {
        if self.byte_len == current_len {
            self.byte_len / kind.width()
        } else {
            0
        }
    }
}

/// Per-instance cache of typed views, keyed by element width.
#[derive(Debug, Default)]
pub struct ViewCache {
    views: [Option<ViewDescriptor>; 3],
    refreshes: u64,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only typed view over the current buffer.
    pub fn view<'m, T: Element>(&mut self, memory: &'m [u8]) -> TypedView<'m, T> {
        let len = self.ensure(T::KIND, memory.len());
        TypedView {
            bytes: &memory[..len * T::KIND.width()],
            _elem: PhantomData,
        }
    }

    /// Writable typed view over the current buffer.
    pub fn view_mut<'m, T: Element>(&mut self, memory: &'m mut [u8]) -> TypedViewMut<'m, T> {
        let len = self.ensure(T::KIND, memory.len());
        TypedViewMut {
            bytes: &mut memory[..len * T::KIND.width()],
            _elem: PhantomData,
        }
    }

    /// Element count the cached view of `kind` currently reports, or `None`
    /// when no view has been materialized yet.
    pub fn reported_len(&self, kind: ViewKind, current_len: usize) -> Option<usize> {
        self.views[kind.slot()].map(|view| view.reported_len(kind, current_len))
    }

    /// Whether the cached view of `kind` is detached from a buffer of
    /// `current_len` bytes.
    pub fn is_stale(&self, kind: ViewKind, current_len: usize) -> bool {
        self.reported_len(kind, current_len) == Some(0) && current_len != 0
    }

    /// Number of times a view was (re)materialized.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Forget every cached view, e.g. when the module instance is replaced.
    pub fn invalidate(&mut self) {
        self.views = [None; 3];
    }

    fn ensure(&mut self, kind: ViewKind, current_len: usize) -> usize {
        let slot = &mut self.views[kind.slot()];
        match slot {
            Some(view) if !(view.reported_len(kind, current_len) == 0 && current_len != 0) => {
                view.reported_len(kind, current_len)
            }
            _ => {
                let previous = slot.map(|view| view.byte_len);
                *slot = Some(ViewDescriptor {
                    byte_len: current_len,
                });
                self.refreshes += 1;
                tracing::trace!(?kind, ?previous, current_len, "memory view refreshed");
                current_len / kind.width()
            }
        }
    }
}

/// Read-only window of `T` elements.
#[derive(Debug, Clone, Copy)]
pub struct TypedView<'m, T> {
    bytes: &'m [u8],
    _elem: PhantomData<T>,
}

impl<'m, T: Element> TypedView<'m, T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / T::KIND.width()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> BridgeResult<T> {
        let width = T::KIND.width();
        let start = index.checked_mul(width);
        match start.and_then(|s| self.bytes.get(s..s + width)) {
            Some(bytes) => Ok(T::read(bytes)),
            None => Err(out_of_bounds(index.saturating_mul(width), width, self.bytes.len())),
        }
    }

    /// Element index of the byte offset `ptr`.
    pub fn index_of(&self, ptr: u32) -> BridgeResult<usize> {
        aligned_index(ptr, T::KIND.width(), self.bytes.len())
    }

    /// The underlying bytes of the view.
    pub fn as_bytes(&self) -> &'m [u8] {
        self.bytes
    }
}

impl<'m> TypedView<'m, u8> {
    /// Zero-copy sub-range `[ptr, ptr + len)`.
    pub fn subarray(&self, ptr: u32, len: u32) -> BridgeResult<&'m [u8]> {
        range(self.bytes.len(), ptr, len).map(|r| &self.bytes[r])
    }
}

/// Writable window of `T` elements.
#[derive(Debug)]
pub struct TypedViewMut<'m, T> {
    bytes: &'m mut [u8],
    _elem: PhantomData<T>,
}

impl<'m, T: Element> TypedViewMut<'m, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / T::KIND.width()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> BridgeResult<T> {
        let width = T::KIND.width();
        let start = index.checked_mul(width);
        match start.and_then(|s| self.bytes.get(s..s + width)) {
            Some(bytes) => Ok(T::read(bytes)),
            None => Err(out_of_bounds(index.saturating_mul(width), width, self.bytes.len())),
        }
    }

    pub fn index_of(&self, ptr: u32) -> BridgeResult<usize> {
        aligned_index(ptr, T::KIND.width(), self.bytes.len())
    }

    /// Store `value` at element `index`.
    pub fn set(&mut self, index: usize, value: T) -> BridgeResult<()> {
        let width = T::KIND.width();
        let memory_len = self.bytes.len();
        let start = index.checked_mul(width);
        match start.and_then(|s| self.bytes.get_mut(s..s + width)) {
            Some(bytes) => {
                value.write(bytes);
                Ok(())
            }
            None => Err(out_of_bounds(index.saturating_mul(width), width, memory_len)),
        }
    }
}

impl<'m> TypedViewMut<'m, u8> {
    /// Copy `data` into memory starting at byte `ptr`.
    pub fn copy_from(&mut self, ptr: u32, data: &[u8]) -> BridgeResult<()> {
        let r = range(self.bytes.len(), ptr, data.len() as u32)?;
        self.bytes[r].copy_from_slice(data);
        Ok(())
    }

    /// Zero-copy sub-range `[ptr, ptr + len)`.
    pub fn subarray(&self, ptr: u32, len: u32) -> BridgeResult<&[u8]> {
        range(self.bytes.len(), ptr, len).map(|r| &self.bytes[r])
    }
}

fn range(memory_len: usize, ptr: u32, len: u32) -> BridgeResult<std::ops::Range<usize>> {
    let start = ptr as usize;
    match start.checked_add(len as usize) {
        Some(end) if end <= memory_len => Ok(start..end),
        _ => Err(BridgeError::OutOfBounds {
            ptr,
            len,
            memory_len,
        }),
    }
}

/// Offsets that are not a multiple of the element width are rejected, never
/// rounded down.
fn aligned_index(ptr: u32, width: usize, memory_len: usize) -> BridgeResult<usize> {
    if ptr as usize % width != 0 {
        tracing::warn!(ptr, width, "unaligned typed access");
        return Err(out_of_bounds(ptr as usize, width, memory_len));
    }
    Ok(ptr as usize / width)
}

fn out_of_bounds(offset: usize, width: usize, memory_len: usize) -> BridgeError {
    BridgeError::OutOfBounds {
        ptr: u32::try_from(offset).unwrap_or(u32::MAX),
        len: width as u32,
        memory_len,
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// VecMemory: growable in-process linear memory
// ══════════════════════════════════════════════════════════════════════════════

/// Page-granular growable byte buffer.
///
/// Growth reallocates the backing buffer, which is exactly the event that
/// detaches cached views.
#[derive(Debug, Clone)]
pub struct VecMemory {
    bytes: Vec<u8>,
    max_pages: Option<u32>,
}

impl VecMemory {
    /// Memory of `pages` zeroed pages.
    pub fn new(pages: u32) -> Self {
        Self {
            bytes: vec![0; pages as usize * PAGE_SIZE],
            max_pages: None,
        }
    }

    /// Cap growth at `max_pages`.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn pages(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    /// Grow by `delta` pages. Returns the previous page count, or `None` if
    /// the limit would be exceeded.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let previous = self.pages();
        let target = previous.checked_add(delta)?;
        if matches!(self.max_pages, Some(max) if target > max) {
            return None;
        }
        // Fresh buffer rather than an in-place resize: the old one is gone.
        let mut grown = vec![0; target as usize * PAGE_SIZE];
        grown[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.bytes = grown;
        tracing::debug!(previous, target, "linear memory grown");
        Some(previous)
    }
}
