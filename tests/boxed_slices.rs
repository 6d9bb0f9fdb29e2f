//! Boxed value slices crossing the boundary in both directions

mod common;

use bindhost::abi::AbiError;
use bindhost::{init_sync, AbiViolation, HostValue, Runtime, RuntimeConfig, RuntimeError, Scalar};
use common::{misaligned_turtle_wasm, turtle_wasm, turtle_without, STACK_TOP};

#[test]
fn decodes_mixed_slice() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    let values = turtle.return_boxed_js_value_slice().unwrap();
    assert_eq!(
        values,
        vec![
            HostValue::Number(1.5),
            HostValue::Bool(true),
            HostValue::String("hello".into()),
            HostValue::Number(7.0),
            HostValue::Null,
        ]
    );

    // The string buffer and the slot region are each released once.
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(2)));
    assert_eq!(turtle.global("freed_bytes"), Some(Scalar::I32(5 + 5 * 16)));
    // The referenced number was moved off the host heap.
    assert_eq!(turtle.heap_len(), 0);
}

#[test]
fn empty_slice_releases_nothing() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    turtle.call("set_slice_mode", &[Scalar::I32(1)]).unwrap();
    assert!(turtle.return_boxed_js_value_slice().unwrap().is_empty());
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(0)));
}

#[test]
fn invalid_tag_aborts_call() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    turtle.call("set_slice_mode", &[Scalar::I32(2)]).unwrap();
    match turtle.return_boxed_js_value_slice() {
        Err(RuntimeError::Abi(AbiViolation::Codec(AbiError::InvalidTag(tag)))) => assert_eq!(tag, 0xEE),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(turtle.stack_pointer().unwrap(), STACK_TOP);
}

#[test]
fn oversized_length_is_rejected_before_reading() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    turtle.call("set_slice_mode", &[Scalar::I32(3)]).unwrap();
    assert!(matches!(
        turtle.return_boxed_js_value_slice(),
        Err(RuntimeError::Abi(AbiViolation::SliceTooLong { len: 0x7fff_ffff, .. }))
    ));
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(0)));
}

#[test]
fn configured_slice_limit_applies() {
    let mut config = RuntimeConfig::default();
    config.limits.max_slice_len = 4;
    let mut turtle = Runtime::with_config(config)
        .unwrap()
        .init_sync(turtle_wasm())
        .expect("instantiate");

    assert!(matches!(
        turtle.return_boxed_js_value_slice(),
        Err(RuntimeError::Abi(AbiViolation::SliceTooLong { len: 5, max: 4 }))
    ));
    assert_eq!(turtle.stack_pointer().unwrap(), STACK_TOP);
}

#[test]
fn encoded_slice_is_readable_by_guest() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    let values = vec![
        HostValue::Number(2.5),
        HostValue::String("abc".into()),
        HostValue::Array(vec![HostValue::Bool(true), HostValue::BigInt(-1)]),
        HostValue::Bytes(Vec::new()),
    ];
    let slice = turtle.encode_boxed_slice(&values).unwrap();
    assert_eq!(slice.len, 4);
    assert_eq!(slice.ptr % 8, 0);

    let ptr = slice.ptr as i32;
    assert_eq!(turtle.call("slot_tag", &[Scalar::I32(ptr)]).unwrap(), vec![Scalar::I32(3)]);
    assert_eq!(turtle.call("slot_f64", &[Scalar::I32(ptr)]).unwrap(), vec![Scalar::F64(2.5)]);
    assert_eq!(turtle.call("slot_tag", &[Scalar::I32(ptr + 16)]).unwrap(), vec![Scalar::I32(5)]);
    assert_eq!(turtle.call("slot_tag", &[Scalar::I32(ptr + 32)]).unwrap(), vec![Scalar::I32(7)]);
    assert_eq!(turtle.heap_len(), 1);

    // Handing the slice back transfers ownership again.
    assert_eq!(turtle.decode_boxed_slice(slice).unwrap(), values);
    assert_eq!(turtle.heap_len(), 0);
    // "abc" and the slot region; the empty byte buffer was never allocated.
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(2)));
}

#[test]
fn encoding_needs_guest_allocator() {
    let mut turtle = init_sync(turtle_without("__wbindgen_malloc")).expect("instantiate");
    match turtle.encode_boxed_slice(&[HostValue::Null]) {
        Err(RuntimeError::FunctionNotFound(name)) => assert_eq!(name, "__wbindgen_malloc"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(turtle.encode_boxed_slice(&[]).unwrap().is_empty());
}

/// Guest pointer stored in the payload of slot `index`.
fn slot_buffer_ptr(turtle: &bindhost::Bindings, slots: u32, index: u32) -> u32 {
    let bytes = turtle.read_memory(slots + index * 16 + 8, 4).unwrap();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[test]
fn failed_decode_takes_nothing() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    let values = vec![
        HostValue::Array(vec![HostValue::Bool(true)]),
        HostValue::String("ab".into()),
    ];
    let slice = turtle.encode_boxed_slice(&values).unwrap();
    let text = slot_buffer_ptr(&turtle, slice.ptr, 1);
    turtle.write_memory(text, &[0xFF, 0xFF]).unwrap();

    match turtle.decode_boxed_slice(slice) {
        Err(RuntimeError::Abi(AbiViolation::Codec(AbiError::InvalidUtf8))) => {}
        other => panic!("unexpected: {other:?}"),
    }
    // The array is still on the heap and nothing was released.
    assert_eq!(turtle.heap_len(), 1);
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(0)));

    // Once repaired, the same slice decodes and is released exactly once.
    turtle.write_memory(text, b"ab").unwrap();
    assert_eq!(turtle.decode_boxed_slice(slice).unwrap(), values);
    assert_eq!(turtle.heap_len(), 0);
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(2)));
    assert_eq!(turtle.global("freed_bytes"), Some(Scalar::I32(2 + 2 * 16)));
}

#[test]
fn repeated_ref_in_one_slice_is_rejected() {
    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    let slice = turtle
        .encode_boxed_slice(&[HostValue::Array(vec![HostValue::Null]), HostValue::Null])
        .unwrap();
    let first = turtle.read_memory(slice.ptr, 16).unwrap();
    turtle.write_memory(slice.ptr + 16, &first).unwrap();

    assert!(matches!(
        turtle.decode_boxed_slice(slice),
        Err(RuntimeError::Abi(AbiViolation::StaleToken(_)))
    ));
    assert_eq!(turtle.heap_len(), 1);
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(0)));
}

#[test]
fn failed_encode_releases_what_it_allocated() {
    let mut config = RuntimeConfig::default();
    config.limits.max_buffer_len = 4;
    let mut turtle = Runtime::with_config(config)
        .unwrap()
        .init_sync(turtle_wasm())
        .expect("instantiate");

    let values = vec![
        HostValue::Array(vec![HostValue::Null]),
        HostValue::String("ab".into()),
        HostValue::String("abcdefgh".into()),
    ];
    match turtle.encode_boxed_slice(&values) {
        Err(RuntimeError::Abi(AbiViolation::Codec(AbiError::TooLong { len: 8, max: 4 }))) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(turtle.heap_len(), 0);
    // Only the "ab" buffer had been allocated.
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(1)));
    assert_eq!(turtle.global("freed_bytes"), Some(Scalar::I32(2)));
}

#[test]
fn misaligned_slot_region_is_rejected() {
    let mut turtle = init_sync(misaligned_turtle_wasm()).expect("instantiate");
    let values = [HostValue::Null, HostValue::String("ab".into())];
    match turtle.encode_boxed_slice(&values) {
        Err(RuntimeError::Abi(AbiViolation::Misaligned { ptr, align: 8 })) => assert_eq!(ptr % 8, 4),
        other => panic!("unexpected: {other:?}"),
    }
    // The string buffer and the rejected region both went back to the guest.
    assert_eq!(turtle.global("free_calls"), Some(Scalar::I32(2)));
    assert_eq!(turtle.global("freed_bytes"), Some(Scalar::I32(2 + 2 * 16)));
}

/// Equality that compares numbers by bit pattern, so NaN payloads and the
/// sign of zero count.
fn same_bits(a: &HostValue, b: &HostValue) -> bool {
    match (a, b) {
        (HostValue::Number(x), HostValue::Number(y)) => x.to_bits() == y.to_bits(),
        (HostValue::Array(xs), HostValue::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_bits(x, y))
        }
        _ => a == b,
    }
}

#[test]
fn every_value_kind_round_trips() {
    let cases: Vec<(&str, Vec<HostValue>)> = vec![
        ("undefined", vec![HostValue::Undefined]),
        ("null", vec![HostValue::Null]),
        ("bools", vec![HostValue::Bool(false), HostValue::Bool(true)]),
        (
            "numbers",
            vec![
                HostValue::Number(0.0),
                HostValue::Number(-0.0),
                HostValue::Number(f64::MIN_POSITIVE),
                HostValue::Number(f64::MAX),
                HostValue::Number(f64::NEG_INFINITY),
                HostValue::Number(f64::from_bits(0x7FF8_0000_DEAD_BEEF)),
                HostValue::Number(f64::from_bits(0xFFF4_0000_0000_0001)),
            ],
        ),
        (
            "bigints",
            vec![
                HostValue::BigInt(i64::MIN),
                HostValue::BigInt(-1),
                HostValue::BigInt(0),
                HostValue::BigInt(i64::MAX),
            ],
        ),
        ("empty string", vec![HostValue::String(String::new())]),
        (
            "strings",
            vec![HostValue::String("turtle".into()), HostValue::String("🐢 ünïcödé".into())],
        ),
        ("empty bytes", vec![HostValue::Bytes(Vec::new())]),
        ("bytes", vec![HostValue::Bytes(vec![0, 0xFF, 0x80, 7])]),
        ("empty array", vec![HostValue::Array(Vec::new())]),
        (
            "nested arrays",
            vec![HostValue::Array(vec![
                HostValue::Undefined,
                HostValue::Array(vec![HostValue::BigInt(i64::MIN), HostValue::String("x".into())]),
                HostValue::Number(f64::NAN),
            ])],
        ),
        (
            "mixed",
            vec![
                HostValue::Undefined,
                HostValue::Null,
                HostValue::Bool(true),
                HostValue::Number(-2.25),
                HostValue::BigInt(i64::MAX),
                HostValue::String(String::new()),
                HostValue::String("abc".into()),
                HostValue::Bytes(vec![1, 2, 3]),
                HostValue::Bytes(Vec::new()),
                HostValue::Array(vec![HostValue::Bool(false)]),
            ],
        ),
    ];

    let mut turtle = init_sync(turtle_wasm()).expect("instantiate");
    for (name, values) in cases {
        let slice = turtle.encode_boxed_slice(&values).unwrap();
        assert_eq!(slice.len as usize, values.len(), "{name}");
        let back = turtle.decode_boxed_slice(slice).unwrap();
        assert_eq!(back.len(), values.len(), "{name}");
        for (got, want) in back.iter().zip(&values) {
            assert!(same_bits(got, want), "{name}: {got:?} != {want:?}");
        }
        assert_eq!(turtle.heap_len(), 0, "{name}");
    }
    assert_eq!(turtle.stack_pointer().unwrap(), STACK_TOP);
}
