//! Value marshaling across the boundary
//!
//! Scalars travel as wasm values. Everything else travels through linear
//! memory as a boxed slice of 16-byte slots (see [`bindhost_abi::Slot`]).
//! Ownership of a decoded slice and of every string or byte buffer it points
//! at moves to the host, which hands the memory back through the guest's
//! free export once the bytes are copied out.
//!
//! Calls that need scratch space reserve it on the guest shadow stack through
//! [`with_stack_frame`], which restores the stack pointer whether or not the
//! body succeeds.

use crate::error::{AbiViolation, RuntimeError};
use crate::runtime::exports::{ExportTable, ADD_TO_STACK_POINTER, FREE, MALLOC};
use crate::runtime::host::{GuestThrow, HostFunctionError, HostFunctionErrorKind, HostState};
use crate::runtime::memory::GuestSlice;
use bindhost_abi::{
    decode_slots, encode_slots, AbiError, GuestBuf, HostValue, Scalar, ScalarType, Slot, Token, SLOT_ALIGN,
};
use std::collections::HashSet;
use tracing::{debug, warn};
use wasmtime::{Store, TypedFunc, Val, ValType, WasmParams, WasmResults};

/// Map a wasm value type onto the scalar types the boundary understands.
pub fn scalar_type(ty: &ValType) -> Option<ScalarType> {
    match ty {
        ValType::I32 => Some(ScalarType::I32),
        ValType::I64 => Some(ScalarType::I64),
        ValType::F32 => Some(ScalarType::F32),
        ValType::F64 => Some(ScalarType::F64),
        _ => None,
    }
}

/// Display name of a wasm value type.
pub(crate) fn type_name(ty: &ValType) -> &'static str {
    match scalar_type(ty) {
        Some(scalar) => scalar.name(),
        None if matches!(ty, ValType::V128) => "v128",
        None => "ref",
    }
}

pub fn encode_scalar(value: Scalar) -> Val {
    match value {
        Scalar::I32(v) => Val::I32(v),
        Scalar::I64(v) => Val::I64(v),
        Scalar::F32(v) => Val::F32(v.to_bits()),
        Scalar::F64(v) => Val::F64(v.to_bits()),
    }
}

/// Decode a wasm value, insisting on the declared type. Float bit patterns,
/// NaN payloads included, are preserved exactly.
pub fn decode_scalar(value: &Val, expected: ScalarType) -> Result<Scalar, AbiViolation> {
    match (value, expected) {
        (Val::I32(v), ScalarType::I32) => Ok(Scalar::I32(*v)),
        (Val::I64(v), ScalarType::I64) => Ok(Scalar::I64(*v)),
        (Val::F32(bits), ScalarType::F32) => Ok(Scalar::F32(f32::from_bits(*bits))),
        (Val::F64(bits), ScalarType::F64) => Ok(Scalar::F64(f64::from_bits(*bits))),
        (other, expected) => Err(AbiViolation::ScalarMismatch {
            expected,
            actual: val_name(other).to_string(),
        }),
    }
}

fn val_name(value: &Val) -> &'static str {
    match value {
        Val::I32(_) => "i32",
        Val::I64(_) => "i64",
        Val::F32(_) => "f32",
        Val::F64(_) => "f64",
        Val::V128(_) => "v128",
        _ => "ref",
    }
}

/// Convert a failed guest call into the error surfaced to the caller.
///
/// Host functions attach their own error types to the trap; those are
/// recovered so a guest throw or a bad token reads as what it is rather than
/// as a generic trap.
pub(crate) fn call_error(function: &str, err: wasmtime::Error) -> RuntimeError {
    if let Some(GuestThrow(message)) = err.downcast_ref::<GuestThrow>() {
        return RuntimeError::Thrown(message.clone());
    }
    if let Some(host) = err.downcast_ref::<HostFunctionError>() {
        if let HostFunctionErrorKind::Abi(violation) = &host.kind {
            return RuntimeError::Abi(violation.clone());
        }
        return RuntimeError::Trap {
            function: function.to_string(),
            message: host.to_string(),
        };
    }
    RuntimeError::Trap {
        function: function.to_string(),
        message: err.to_string(),
    }
}

fn typed<P: WasmParams, R: WasmResults>(
    store: &Store<HostState>,
    exports: &ExportTable,
    name: &str,
) -> Result<TypedFunc<P, R>, RuntimeError> {
    exports
        .require(name)?
        .typed::<P, R>(store)
        .map_err(|e| RuntimeError::FunctionNotFound(format!("{name}: {e}")))
}

/// Call a named export with scalar arguments, checking both directions
/// against its declared type.
pub fn call_export(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    name: &str,
    args: &[Scalar],
) -> Result<Vec<Scalar>, RuntimeError> {
    let func = *exports.require(name)?;
    let ty = func.ty(&*store);

    if ty.params().len() != args.len() {
        return Err(AbiViolation::ArityMismatch {
            expected: ty.params().len(),
            actual: args.len(),
        }
        .into());
    }
    for (param, arg) in ty.params().zip(args) {
        match scalar_type(&param) {
            Some(expected) if expected == arg.ty() => {}
            Some(expected) => {
                return Err(AbiViolation::ScalarMismatch {
                    expected,
                    actual: arg.ty().to_string(),
                }
                .into())
            }
            None => return Err(AbiViolation::UnsupportedType(type_name(&param).to_string()).into()),
        }
    }
    let result_types = ty
        .results()
        .map(|result| scalar_type(&result).ok_or_else(|| AbiViolation::UnsupportedType(type_name(&result).to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let params: Vec<Val> = args.iter().copied().map(encode_scalar).collect();
    let mut results = vec![Val::I32(0); result_types.len()];
    func.call(&mut *store, &params, &mut results)
        .map_err(|e| call_error(name, e))?;

    results
        .iter()
        .zip(result_types)
        .map(|(value, ty)| decode_scalar(value, ty).map_err(RuntimeError::from))
        .collect()
}

/// Current guest shadow-stack pointer.
pub fn stack_pointer(store: &mut Store<HostState>, exports: &ExportTable) -> Result<u32, RuntimeError> {
    add_to_stack_pointer(store, exports, 0)
}

fn add_to_stack_pointer(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    delta: i32,
) -> Result<u32, RuntimeError> {
    let add = typed::<i32, i32>(store, exports, ADD_TO_STACK_POINTER)?;
    add.call(&mut *store, delta)
        .map(|sp| sp as u32)
        .map_err(|e| call_error(ADD_TO_STACK_POINTER, e))
}

/// Put the stack pointer back to an absolute value captured earlier.
pub fn restore_stack_pointer(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    prior: u32,
) -> Result<(), RuntimeError> {
    let current = stack_pointer(store, exports)?;
    let delta = prior.wrapping_sub(current) as i32;
    if delta != 0 {
        add_to_stack_pointer(store, exports, delta)?;
    }
    Ok(())
}

/// Reserve `size` bytes on the guest shadow stack for the duration of `body`.
///
/// `body` receives the address of the reserved frame. The stack pointer is
/// restored to its value before the call on every exit path; if both `body`
/// and the restore fail, the body's error wins and the restore failure is
/// logged.
pub fn with_stack_frame<R>(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    size: u32,
    body: impl FnOnce(&mut Store<HostState>, u32) -> Result<R, RuntimeError>,
) -> Result<R, RuntimeError> {
    let prior = stack_pointer(store, exports)?;
    let frame = match add_to_stack_pointer(store, exports, (size as i32).wrapping_neg()) {
        Ok(frame) => frame,
        Err(e) => {
            if let Err(restore) = restore_stack_pointer(store, exports, prior) {
                warn!(error = %restore, "failed to restore stack pointer");
            }
            return Err(e);
        }
    };

    let result = body(store, frame);
    let restored = restore_stack_pointer(store, exports, prior);
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore)) => {
            warn!(error = %restore, "failed to restore stack pointer after error");
            Err(e)
        }
    }
}

fn guest_free(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    ptr: u32,
    size: u32,
) -> Result<(), RuntimeError> {
    let free = typed::<(i32, i32), ()>(store, exports, FREE)?;
    free.call(&mut *store, (ptr as i32, size as i32))
        .map_err(|e| call_error(FREE, e))
}

fn guest_malloc(store: &mut Store<HostState>, exports: &ExportTable, size: u32) -> Result<u32, RuntimeError> {
    let malloc = typed::<i32, i32>(store, exports, MALLOC)?;
    malloc
        .call(&mut *store, size as i32)
        .map(|ptr| ptr as u32)
        .map_err(|e| call_error(MALLOC, e))
}

/// Take ownership of a guest-returned boxed slice.
///
/// Decoding runs in two passes. The first copies every element buffer out,
/// checks UTF-8 and checks that each heap reference is live. Any failure
/// there aborts with nothing taken and nothing freed, so the slice stays
/// guest-owned. The second pass moves references off the host heap and
/// releases each buffer and then the slot region through `__wbindgen_free`,
/// each exactly once. A zero-length slice has no allocation behind it and
/// releases nothing.
pub fn decode_boxed_slice(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    slice: GuestSlice,
) -> Result<Vec<HostValue>, RuntimeError> {
    if slice.is_empty() {
        return Ok(Vec::new());
    }

    let limits = *store.data().abi_limits();
    let too_long = AbiViolation::SliceTooLong {
        len: slice.len,
        max: limits.max_slice_len,
    };
    if slice.len as usize > limits.max_slice_len {
        return Err(too_long.into());
    }
    let byte_len = slice.byte_len().ok_or(too_long)?;

    let bytes = exports.memory().read(&*store, slice.ptr, byte_len)?;
    let slots = decode_slots(&bytes, &limits).map_err(AbiViolation::from)?;

    let mut staged = Vec::with_capacity(slots.len());
    let mut refs = HashSet::new();
    for slot in slots {
        staged.push(stage_slot(store, exports, slot, &mut refs)?);
    }

    let mut values = Vec::with_capacity(staged.len());
    for element in staged {
        values.push(match element {
            Staged::Value(value) => value,
            Staged::Buffer(buf, value) => {
                guest_free(store, exports, buf.ptr, buf.len)?;
                value
            }
            Staged::Ref(token) => store.data_mut().heap.take(token)?,
        });
    }
    guest_free(store, exports, slice.ptr, byte_len)?;

    debug!(ptr = slice.ptr, len = slice.len, "decoded boxed slice");
    Ok(values)
}

/// A checked slot whose side effects have not run yet.
enum Staged {
    Value(HostValue),
    /// Copied out of a guest buffer that still has to be freed.
    Buffer(GuestBuf, HostValue),
    Ref(Token),
}

fn stage_slot(
    store: &Store<HostState>,
    exports: &ExportTable,
    slot: Slot,
    refs: &mut HashSet<Token>,
) -> Result<Staged, RuntimeError> {
    Ok(match slot {
        Slot::Undefined => Staged::Value(HostValue::Undefined),
        Slot::Null => Staged::Value(HostValue::Null),
        Slot::Bool(b) => Staged::Value(HostValue::Bool(b)),
        Slot::Number(n) => Staged::Value(HostValue::Number(n)),
        Slot::BigInt(n) => Staged::Value(HostValue::BigInt(n)),
        Slot::String(buf) if buf.is_empty() => Staged::Value(HostValue::String(String::new())),
        Slot::String(buf) => {
            let bytes = exports.memory().read(store, buf.ptr, buf.len)?;
            let s = String::from_utf8(bytes).map_err(|_| AbiViolation::Codec(AbiError::InvalidUtf8))?;
            Staged::Buffer(buf, HostValue::String(s))
        }
        Slot::Bytes(buf) if buf.is_empty() => Staged::Value(HostValue::Bytes(Vec::new())),
        Slot::Bytes(buf) => Staged::Buffer(buf, HostValue::Bytes(exports.memory().read(store, buf.ptr, buf.len)?)),
        Slot::Ref(token) => {
            store.data().heap.get(token)?;
            // A token can be moved out only once per slice.
            if !refs.insert(token) {
                return Err(AbiViolation::StaleToken(token).into());
            }
            Staged::Ref(token)
        }
    })
}

/// Host heap tokens and guest buffers created by an encode that has not
/// finished yet.
#[derive(Default)]
struct Allocations {
    tokens: Vec<Token>,
    buffers: Vec<GuestBuf>,
}

impl Allocations {
    /// Undo everything recorded so far. Failures are logged; the original
    /// error is what the caller sees.
    fn release(self, store: &mut Store<HostState>, exports: &ExportTable) {
        for token in self.tokens {
            if let Err(e) = store.data_mut().heap.take(token) {
                warn!(error = %e, "failed to reclaim heap token after encode error");
            }
        }
        for buf in self.buffers {
            if let Err(e) = guest_free(store, exports, buf.ptr, buf.len) {
                warn!(error = %e, ptr = buf.ptr, "failed to free guest buffer after encode error");
            }
        }
    }
}

/// Hand a boxed slice to the guest.
///
/// Strings and byte arrays are copied into guest allocations, nested arrays
/// are placed on the host heap and passed by reference. The guest owns the
/// returned region and everything it points at. If any element fails, the
/// heap entries and guest allocations made so far are released again.
pub fn encode_boxed_slice(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    values: &[HostValue],
) -> Result<GuestSlice, RuntimeError> {
    if values.is_empty() {
        return Ok(GuestSlice::empty());
    }

    let max = store.data().abi_limits().max_slice_len;
    let len = u32::try_from(values.len())
        .ok()
        .filter(|len| *len as usize <= max)
        .ok_or(AbiViolation::SliceTooLong {
            len: u32::try_from(values.len()).unwrap_or(u32::MAX),
            max,
        })?;
    let byte_len = GuestSlice::new(0, len)
        .byte_len()
        .ok_or(AbiViolation::SliceTooLong { len, max })?;

    let mut allocations = Allocations::default();
    match write_slots(store, exports, values, byte_len, &mut allocations) {
        Ok(ptr) => {
            debug!(ptr, len, "encoded boxed slice");
            Ok(GuestSlice::new(ptr, len))
        }
        Err(e) => {
            allocations.release(store, exports);
            Err(e)
        }
    }
}

fn write_slots(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    values: &[HostValue],
    byte_len: u32,
    allocations: &mut Allocations,
) -> Result<u32, RuntimeError> {
    let mut slots = Vec::with_capacity(values.len());
    for value in values {
        slots.push(put_value(store, exports, value, allocations)?);
    }

    let ptr = guest_malloc(store, exports, byte_len)?;
    allocations.buffers.push(GuestBuf { ptr, len: byte_len });
    if ptr as usize % SLOT_ALIGN != 0 {
        return Err(AbiViolation::Misaligned { ptr, align: SLOT_ALIGN }.into());
    }
    exports.memory().write(&mut *store, ptr, &encode_slots(&slots))?;
    Ok(ptr)
}

fn put_value(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    value: &HostValue,
    allocations: &mut Allocations,
) -> Result<Slot, RuntimeError> {
    Ok(match value {
        HostValue::Undefined => Slot::Undefined,
        HostValue::Null => Slot::Null,
        HostValue::Bool(b) => Slot::Bool(*b),
        HostValue::Number(n) => Slot::Number(*n),
        HostValue::BigInt(n) => Slot::BigInt(*n),
        HostValue::String(s) => Slot::String(put_buffer(store, exports, s.as_bytes(), allocations)?),
        HostValue::Bytes(b) => Slot::Bytes(put_buffer(store, exports, b, allocations)?),
        HostValue::Array(_) => {
            let token = store
                .data_mut()
                .heap
                .insert(value.clone())
                .ok_or(AbiViolation::HeapExhausted)?;
            allocations.tokens.push(token);
            Slot::Ref(token)
        }
    })
}

fn put_buffer(
    store: &mut Store<HostState>,
    exports: &ExportTable,
    bytes: &[u8],
    allocations: &mut Allocations,
) -> Result<GuestBuf, RuntimeError> {
    if bytes.is_empty() {
        return Ok(GuestBuf::EMPTY);
    }
    let limits = store.data().abi_limits();
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= limits.max_buffer_len)
        .ok_or(AbiViolation::Codec(AbiError::TooLong {
            len: bytes.len(),
            max: limits.max_buffer_len,
        }))?;
    let ptr = guest_malloc(store, exports, len)?;
    let buf = GuestBuf { ptr, len };
    allocations.buffers.push(buf);
    exports.memory().write(&mut *store, ptr, bytes)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_encoding_preserves_bits() {
        let nan = f64::from_bits(0x7FF8_0000_DEAD_BEEF);
        let val = encode_scalar(Scalar::F64(nan));
        match decode_scalar(&val, ScalarType::F64).unwrap() {
            Scalar::F64(back) => assert_eq!(back.to_bits(), nan.to_bits()),
            other => panic!("unexpected {other:?}"),
        }

        let neg_zero = encode_scalar(Scalar::F32(-0.0));
        match decode_scalar(&neg_zero, ScalarType::F32).unwrap() {
            Scalar::F32(back) => assert_eq!(back.to_bits(), (-0.0f32).to_bits()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn integer_extremes() {
        for v in [i32::MIN, -1, 0, i32::MAX] {
            assert_eq!(decode_scalar(&encode_scalar(Scalar::I32(v)), ScalarType::I32), Ok(Scalar::I32(v)));
        }
        for v in [i64::MIN, i64::MAX] {
            assert_eq!(decode_scalar(&encode_scalar(Scalar::I64(v)), ScalarType::I64), Ok(Scalar::I64(v)));
        }
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = decode_scalar(&Val::I32(1), ScalarType::F64).unwrap_err();
        assert_eq!(
            err,
            AbiViolation::ScalarMismatch {
                expected: ScalarType::F64,
                actual: "i32".to_string()
            }
        );
    }

    #[test]
    fn maps_value_types() {
        assert_eq!(scalar_type(&ValType::F32), Some(ScalarType::F32));
        assert_eq!(scalar_type(&ValType::V128), None);
    }

    #[test]
    fn throw_payload_becomes_thrown() {
        let err = wasmtime::Error::new(GuestThrow("boom".into()));
        assert!(matches!(call_error("explode", err), RuntimeError::Thrown(m) if m == "boom"));
    }

    #[test]
    fn host_abi_failure_becomes_violation() {
        let err = wasmtime::Error::new(HostFunctionError {
            interface: "wbg".into(),
            function: "__wbindgen_object_drop_ref".into(),
            kind: HostFunctionErrorKind::Abi(AbiViolation::UnknownToken(5)),
        });
        assert!(matches!(
            call_error("f", err),
            RuntimeError::Abi(AbiViolation::UnknownToken(5))
        ));
    }

    #[test]
    fn other_failures_are_traps() {
        let err = wasmtime::Error::msg("unreachable");
        match call_error("test1", err) {
            RuntimeError::Trap { function, message } => {
                assert_eq!(function, "test1");
                assert_eq!(message, "unreachable");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
