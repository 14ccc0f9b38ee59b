//! Integration tests for string and byte marshalling.

use ferry_runtime::codec::{self, MarshalledStr};
use ferry_runtime::sim::AllocEvent;
use ferry_runtime::{Guest, SimGuest, PAGE_SIZE};
use ferry_types::{BridgeConfig, BridgeError, ErrorClass, StringGrowth};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn conservative() -> SimGuest {
    SimGuest::with_config(BridgeConfig {
        string_growth: StringGrowth::Conservative,
        ..BridgeConfig::default()
    })
}

fn round_trip(guest: &mut SimGuest, text: &str) -> String {
    let s = codec::encode(guest, text).unwrap();
    codec::decode_owned(guest, s.ptr, s.len).unwrap()
}

// ══════════════════════════════════════════════════════════════════════════════
// Encoding
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn ascii_takes_the_fast_path() {
    let mut guest = SimGuest::new();
    let s = codec::encode(&mut guest, "hello").unwrap();
    assert_eq!(s, MarshalledStr { ptr: 1024, len: 5, capacity: 5 });
    assert_eq!(guest.peek(s.ptr, s.len), b"hello");
    assert_eq!(guest.allocations(), &[AllocEvent::Malloc { ptr: 1024, size: 5 }]);
}

#[test]
fn non_ascii_grows_to_exact_byte_count() {
    let mut guest = SimGuest::new();
    let s = codec::encode(&mut guest, "héllo").unwrap();
    assert_eq!(s.len, 6);
    assert_eq!(guest.peek(s.ptr, s.len), "héllo".as_bytes());
    assert_eq!(
        guest.allocations(),
        &[
            AllocEvent::Malloc { ptr: 1024, size: 5 },
            AllocEvent::Realloc { ptr: 1024, old_size: 5, new_size: 6, new_ptr: 1032 },
        ]
    );
}

#[test]
fn conservative_growth_over_allocates_then_shrinks() {
    let mut guest = conservative();
    let s = codec::encode(&mut guest, "héllo").unwrap();
    assert_eq!(s.len, 6);
    assert_eq!(s.capacity, 6);
    assert_eq!(guest.peek(s.ptr, s.len), "héllo".as_bytes());
    assert_eq!(
        guest.allocations()[1],
        AllocEvent::Realloc { ptr: 1024, old_size: 5, new_size: 1 + 4 * 3, new_ptr: 1032 }
    );
    assert!(matches!(
        guest.allocations()[2],
        AllocEvent::Realloc { old_size: 13, new_size: 6, .. }
    ));
}

#[test]
fn growth_policies_produce_identical_bytes() {
    let text = "naïve café — 日本語 🚀";
    let mut exact = SimGuest::new();
    let mut wide = conservative();
    let a = codec::encode(&mut exact, text).unwrap();
    let b = codec::encode(&mut wide, text).unwrap();
    assert_eq!(a.len, b.len);
    assert_eq!(exact.peek(a.ptr, a.len), wide.peek(b.ptr, b.len));
}

#[test]
fn without_realloc_uses_one_exact_allocation() {
    let mut guest = SimGuest::without_realloc();
    let s = codec::encode(&mut guest, "ünïcödé").unwrap();
    assert_eq!(s.len as usize, "ünïcödé".len());
    assert_eq!(
        guest.allocations(),
        &[AllocEvent::Malloc { ptr: 1024, size: s.len }]
    );
}

#[test]
fn fast_path_matches_general_encoder() {
    let mut fast = SimGuest::new();
    let mut general = SimGuest::without_realloc();
    let text = "plain ascii text 0123456789";
    let a = codec::encode(&mut fast, text).unwrap();
    let b = codec::encode(&mut general, text).unwrap();
    assert_eq!(fast.peek(a.ptr, a.len), general.peek(b.ptr, b.len));
}

#[test]
fn encoding_grows_memory_when_needed() {
    let mut guest = SimGuest::new();
    let text = "x".repeat(PAGE_SIZE + 100);
    let s = codec::encode(&mut guest, &text).unwrap();
    assert_eq!(guest.memory().pages(), 2);
    assert_eq!(codec::decode_owned(&mut guest, s.ptr, s.len).unwrap(), text);
}

// ══════════════════════════════════════════════════════════════════════════════
// Decoding
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn round_trips() {
    let mut guest = SimGuest::new();
    for text in ["", "a", "hello world", "Grüße", "a😀b", "日本語テキスト"] {
        assert_eq!(round_trip(&mut guest, text), text);
    }
}

#[test]
fn malformed_utf8_is_a_recoverable_error() {
    let mut guest = SimGuest::new();
    guest.poke(2048, &[b'o', b'k', 0xff, 0xfe]);
    let err = codec::decode_owned(&mut guest, 2048, 4).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidEncoding { ptr: 2048, len: 4, .. }));
    assert_eq!(err.class(), ErrorClass::Recoverable);
}

#[test]
fn decode_out_of_bounds_is_a_violation() {
    let mut guest = SimGuest::new();
    let err = codec::decode_owned(&mut guest, PAGE_SIZE as u32 - 1, 8).unwrap_err();
    assert!(err.is_contract_violation());
}

#[test]
fn take_string_frees_even_on_failure() {
    let mut guest = SimGuest::new();
    guest.poke(2048, &[0xc3]);
    assert!(codec::take_string(&mut guest, 2048, 1).is_err());
    assert_eq!(guest.allocations(), &[AllocEvent::Free { ptr: 2048, size: 1 }]);
}

// ══════════════════════════════════════════════════════════════════════════════
// Bytes
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn borrowed_bytes_alias_memory() {
    let mut guest = SimGuest::new();
    guest.poke(4096, &[1, 2, 3, 4]);
    let (mem, bridge) = guest.parts();
    let bytes = codec::borrow_bytes(bridge.views_mut(), mem, 4096, 4).unwrap();
    assert_eq!(bytes, &[1, 2, 3, 4]);
    assert_eq!(bytes.as_ptr(), mem[4096..].as_ptr());
}

#[test]
fn pass_and_copy_bytes() {
    let mut guest = SimGuest::new();
    let payload = [9u8, 8, 7, 6, 5];
    let (ptr, len) = codec::pass_bytes(&mut guest, &payload).unwrap();
    assert_eq!(len, 5);
    assert_eq!(codec::copy_bytes(&mut guest, ptr, len).unwrap(), payload.to_vec());
}

#[test]
fn store_words_rejects_unaligned_slot() {
    let mut guest = SimGuest::new();
    let err = codec::store_words(&mut guest, 1026, &[1, 2]).unwrap_err();
    assert!(matches!(err, BridgeError::OutOfBounds { ptr: 1026, len: 4, .. }));
    assert_eq!(guest.peek(1024, 8), &[0; 8]);

    codec::store_words(&mut guest, 1024, &[1, 2]).unwrap();
    assert_eq!(guest.peek(1024, 8), &[1, 0, 0, 0, 2, 0, 0, 0]);
}
