//! String and byte-range marshalling.
//!
//! Strings cross as `(ptr, len)` pairs of UTF-8 bytes in linear memory.
//! Encoding allocates through the module's allocator; the module owns the
//! result. Decoding is strict: malformed UTF-8 is an error, never replaced.

use ferry_types::{BridgeError, BridgeResult, StringGrowth};

use crate::guest::Guest;
use crate::memory::ViewCache;

/// A string the host wrote into module memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalledStr {
    pub ptr: u32,
    /// UTF-8 byte length.
    pub len: u32,
    /// Size of the allocation backing the string.
    pub capacity: u32,
}

/// Encode `text` into a fresh module allocation.
///
/// With a reallocator the first pass sizes the region by UTF-16 code units
/// and copies the ASCII prefix byte for byte. The first non-ASCII character
/// grows the region and the rest is encoded in one go. Without a reallocator
/// the string goes into one exact allocation.
pub fn encode(guest: &mut dyn Guest, text: &str) -> BridgeResult<MarshalledStr> {
    if !guest.supports_realloc() {
        return encode_exact(guest, text);
    }
    let bytes = text.as_bytes();
    let units = to_u32(text.encode_utf16().count())?;
    let mut ptr = guest.malloc(units)?;
    let mut capacity = units;

    let ascii = bytes.iter().position(|b| !b.is_ascii()).unwrap_or(bytes.len());
    write_bytes(guest, ptr, &bytes[..ascii])?;

    if ascii < bytes.len() {
        let rest = &text[ascii..];
        let offset = to_u32(ascii)?;
        let grown = match guest.bridge().config().string_growth {
            StringGrowth::Exact => offset + to_u32(rest.len())?,
            StringGrowth::Conservative => to_u32(rest.encode_utf16().count())?
                .checked_mul(3)
                .and_then(|bound| bound.checked_add(offset))
                .ok_or_else(|| too_large(text.len()))?,
        };
        ptr = guest.realloc(ptr, capacity, grown)?;
        capacity = grown;
        let tail = ptr.checked_add(offset).ok_or_else(|| too_large(text.len()))?;
        write_bytes(guest, tail, rest.as_bytes())?;
        let len = to_u32(bytes.len())?;
        if capacity != len {
            ptr = guest.realloc(ptr, capacity, len)?;
            capacity = len;
        }
        tracing::trace!(ptr, len, ascii_prefix = ascii, "string encoded (general path)");
    }

    Ok(MarshalledStr {
        ptr,
        len: to_u32(bytes.len())?,
        capacity,
    })
}

/// Encode `text` into a single allocation of exactly its UTF-8 length.
pub fn encode_exact(guest: &mut dyn Guest, text: &str) -> BridgeResult<MarshalledStr> {
    let len = to_u32(text.len())?;
    let ptr = guest.malloc(len)?;
    write_bytes(guest, ptr, text.as_bytes())?;
    Ok(MarshalledStr {
        ptr,
        len,
        capacity: len,
    })
}

/// Decode `len` bytes at `ptr` as UTF-8, borrowing from memory.
pub fn decode<'m>(
    views: &mut ViewCache,
    memory: &'m [u8],
    ptr: u32,
    len: u32,
) -> BridgeResult<&'m str> {
    let bytes = borrow_bytes(views, memory, ptr, len)?;
    std::str::from_utf8(bytes).map_err(|source| BridgeError::InvalidEncoding { ptr, len, source })
}

/// Decode into an owned `String`. The module keeps ownership of the bytes.
pub fn decode_owned(guest: &mut dyn Guest, ptr: u32, len: u32) -> BridgeResult<String> {
    let (memory, bridge) = guest.parts();
    decode(bridge.views_mut(), memory, ptr, len).map(str::to_owned)
}

/// Decode a string the module handed over, then free it.
///
/// The region is freed even when decoding fails.
pub fn take_string(guest: &mut dyn Guest, ptr: u32, len: u32) -> BridgeResult<String> {
    let text = decode_owned(guest, ptr, len);
    guest.free(ptr, len)?;
    text
}

/// Zero-copy view of `[ptr, ptr + len)`. Valid until module code next runs.
pub fn borrow_bytes<'m>(
    views: &mut ViewCache,
    memory: &'m [u8],
    ptr: u32,
    len: u32,
) -> BridgeResult<&'m [u8]> {
    views.view::<u8>(memory).subarray(ptr, len)
}

/// Owned copy of `[ptr, ptr + len)`.
pub fn copy_bytes(guest: &mut dyn Guest, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
    let (memory, bridge) = guest.parts();
    borrow_bytes(bridge.views_mut(), memory, ptr, len).map(<[u8]>::to_vec)
}

/// Copy `bytes` into a fresh module allocation. Returns `(ptr, len)`.
pub fn pass_bytes(guest: &mut dyn Guest, bytes: &[u8]) -> BridgeResult<(u32, u32)> {
    let len = to_u32(bytes.len())?;
    let ptr = guest.malloc(len)?;
    write_bytes(guest, ptr, bytes)?;
    Ok((ptr, len))
}

/// Write consecutive `i32` words starting at `retptr`.
pub fn store_words(guest: &mut dyn Guest, retptr: u32, words: &[i32]) -> BridgeResult<()> {
    let (memory, bridge) = guest.parts();
    let mut view = bridge.views_mut().view_mut::<i32>(memory);
    let base = view.index_of(retptr)?;
    for (i, &word) in words.iter().enumerate() {
        view.set(base + i, word)?;
    }
    Ok(())
}

/// Write a `(ptr, len)` pair at `retptr`.
pub fn store_str(guest: &mut dyn Guest, retptr: u32, text: &MarshalledStr) -> BridgeResult<()> {
    store_words(guest, retptr, &[text.ptr as i32, text.len as i32])
}

fn write_bytes(guest: &mut dyn Guest, ptr: u32, data: &[u8]) -> BridgeResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let (memory, bridge) = guest.parts();
    bridge.views_mut().view_mut::<u8>(memory).copy_from(ptr, data)
}

fn to_u32(n: usize) -> BridgeResult<u32> {
    u32::try_from(n).map_err(|_| too_large(n))
}

fn too_large(n: usize) -> BridgeError {
    BridgeError::Allocation {
        size: u32::MAX,
        reason: format!("{n} bytes exceed the 32-bit address space"),
    }
}
