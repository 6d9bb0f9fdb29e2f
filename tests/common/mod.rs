//! Shared guest fixtures, written in WAT.
#![allow(dead_code)]

/// Initial shadow-stack pointer of the turtle guest.
pub const STACK_TOP: u32 = 1_048_576;

/// A guest implementing the turtle bindings by hand.
///
/// `return_boxed_js_value_slice` behaves according to `set_slice_mode`:
/// - 0: `[1.5, true, "hello", ref(7), null]`
/// - 1: empty slice
/// - 2: one slot with an invalid tag
/// - 3: a length far beyond any limit
///
/// `free_calls`, `freed_bytes` and `live_rudolphs` are exported globals so
/// tests can observe what the host released.
pub const TURTLE_WAT: &str = r#"
(module
  (import "wbg" "__wbindgen_number_new" (func $number_new (param f64) (result i32)))
  (import "wbg" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "wbg" "__wbindgen_object_drop_ref" (func $drop_ref (param i32)))
  (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))

  (memory (export "memory") 17)

  (global $sp (mut i32) (i32.const 1048576))
  (global $heap (mut i32) (i32.const 65536))
  (global $mode (mut i32) (i32.const 0))
  (global $free_calls (export "free_calls") (mut i32) (i32.const 0))
  (global $freed_bytes (export "freed_bytes") (mut i32) (i32.const 0))
  (global $live_rudolphs (export "live_rudolphs") (mut i32) (i32.const 0))

  (data (i32.const 1024) "hello")
  (data (i32.const 1040) "turtle exploded")

  (func (export "test1") (result f64)
    f64.const 42.5)

  (func (export "test2") (result i32)
    i32.const -7)

  (func (export "__wbindgen_add_to_stack_pointer") (param $delta i32) (result i32)
    (global.set $sp (i32.add (global.get $sp) (local.get $delta)))
    (global.get $sp))

  (func $malloc (export "__wbindgen_malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (i32.and (i32.add (global.get $heap) (i32.const 7)) (i32.const -8)))
    (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
    (local.get $ptr))

  (func (export "__wbindgen_free") (param $ptr i32) (param $size i32)
    (global.set $free_calls (i32.add (global.get $free_calls) (i32.const 1)))
    (global.set $freed_bytes (i32.add (global.get $freed_bytes) (local.get $size))))

  (func (export "set_slice_mode") (param $mode i32)
    (global.set $mode (local.get $mode)))

  (func $write_slot (param $at i32) (param $tag i32) (param $aux i32) (param $payload i64)
    (i32.store (local.get $at) (local.get $tag))
    (i32.store offset=4 (local.get $at) (local.get $aux))
    (i64.store offset=8 (local.get $at) (local.get $payload)))

  (func $set_ret (param $ret i32) (param $ptr i32) (param $len i32)
    (i32.store (local.get $ret) (local.get $ptr))
    (i32.store offset=4 (local.get $ret) (local.get $len)))

  (func (export "return_boxed_js_value_slice") (param $ret i32)
    (local $slots i32)
    (local $str i32)
    (if (i32.eq (global.get $mode) (i32.const 1))
      (then
        (call $set_ret (local.get $ret) (i32.const 0) (i32.const 0))
        (return)))
    (if (i32.eq (global.get $mode) (i32.const 3))
      (then
        (call $set_ret (local.get $ret) (i32.const 8) (i32.const 0x7fffffff))
        (return)))
    (local.set $slots (call $malloc (i32.const 80)))
    (if (i32.eq (global.get $mode) (i32.const 2))
      (then
        (call $write_slot (local.get $slots) (i32.const 0xEE) (i32.const 0) (i64.const 0))
        (call $set_ret (local.get $ret) (local.get $slots) (i32.const 1))
        (return)))
    (local.set $str (call $malloc (i32.const 5)))
    (memory.copy (local.get $str) (i32.const 1024) (i32.const 5))
    (call $write_slot (local.get $slots)
      (i32.const 3) (i32.const 0) (i64.reinterpret_f64 (f64.const 1.5)))
    (call $write_slot (i32.add (local.get $slots) (i32.const 16))
      (i32.const 2) (i32.const 0) (i64.const 1))
    (call $write_slot (i32.add (local.get $slots) (i32.const 32))
      (i32.const 5) (i32.const 5) (i64.extend_i32_u (local.get $str)))
    (call $write_slot (i32.add (local.get $slots) (i32.const 48))
      (i32.const 7) (i32.const 0) (i64.extend_i32_u (call $number_new (f64.const 7))))
    (call $write_slot (i32.add (local.get $slots) (i32.const 64))
      (i32.const 1) (i32.const 0) (i64.const 0))
    (call $set_ret (local.get $ret) (local.get $slots) (i32.const 5)))

  (func (export "rudolph_new") (result i32)
    (global.set $live_rudolphs (i32.add (global.get $live_rudolphs) (i32.const 1)))
    (call $malloc (i32.const 8)))

  (func (export "__wbg_rudolph_free") (param $ptr i32)
    (global.set $live_rudolphs (i32.sub (global.get $live_rudolphs) (i32.const 1))))

  (func (export "explode")
    (call $throw (i32.const 1040) (i32.const 15)))

  (func (export "intern_hello") (result i32)
    (call $string_new (i32.const 1024) (i32.const 5)))

  (func (export "drop_ref") (param $token i32)
    (call $drop_ref (local.get $token)))

  (func (export "slot_tag") (param $at i32) (result i32)
    (i32.load8_u (local.get $at)))

  (func (export "slot_f64") (param $at i32) (result f64)
    (f64.load offset=8 (local.get $at)))

  (func (export "add") (param i32 i64) (result i64)
    (i64.add (i64.extend_i32_s (local.get 0)) (local.get 1)))
)
"#;

/// Imports a host function nobody provides.
pub const MISSING_IMPORT_WAT: &str = r#"
(module
  (import "wbg" "__wbindgen_not_provided" (func (param i32)))
  (memory (export "memory") 1))
"#;

pub fn turtle_wasm() -> Vec<u8> {
    wat::parse_str(TURTLE_WAT).expect("turtle fixture parses")
}

/// The turtle guest with one export renamed away.
pub fn turtle_without(export: &str) -> Vec<u8> {
    let needle = format!("(export \"{export}\")");
    assert!(TURTLE_WAT.contains(&needle), "fixture has no export {export}");
    wat::parse_str(TURTLE_WAT.replace(&needle, "")).expect("modified fixture parses")
}

/// The turtle guest with an allocator that returns pointers 4 bytes off
/// 8-byte alignment.
pub fn misaligned_turtle_wasm() -> Vec<u8> {
    let aligned = "(local.set $ptr (i32.and (i32.add (global.get $heap) (i32.const 7)) (i32.const -8)))";
    assert!(TURTLE_WAT.contains(aligned));
    let skewed = "(local.set $ptr (i32.or (i32.and (i32.add (global.get $heap) (i32.const 7)) (i32.const -8)) (i32.const 4)))";
    wat::parse_str(TURTLE_WAT.replace(aligned, skewed)).expect("modified fixture parses")
}

pub fn missing_import_wasm() -> Vec<u8> {
    wat::parse_str(MISSING_IMPORT_WAT).expect("fixture parses")
}
