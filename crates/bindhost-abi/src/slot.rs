//! Boxed-slice slot codec

use crate::{AbiError, Limits, Token};
use alloc::vec::Vec;

/// Size of one encoded slot in bytes.
pub const SLOT_SIZE: usize = 16;

/// Required alignment of a slot region.
pub const SLOT_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotTag {
    Undefined = 0x00,
    Null = 0x01,
    Bool = 0x02,
    Number = 0x03,
    BigInt = 0x04,
    String = 0x05,
    Bytes = 0x06,
    Ref = 0x07,
}

impl TryFrom<u8> for SlotTag {
    type Error = AbiError;

    fn try_from(value: u8) -> Result<Self, AbiError> {
        match value {
            0x00 => Ok(SlotTag::Undefined),
            0x01 => Ok(SlotTag::Null),
            0x02 => Ok(SlotTag::Bool),
            0x03 => Ok(SlotTag::Number),
            0x04 => Ok(SlotTag::BigInt),
            0x05 => Ok(SlotTag::String),
            0x06 => Ok(SlotTag::Bytes),
            0x07 => Ok(SlotTag::Ref),
            _ => Err(AbiError::InvalidTag(value)),
        }
    }
}

/// A guest-owned byte region referenced from a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestBuf {
    pub ptr: u32,
    pub len: u32,
}

impl GuestBuf {
    pub const EMPTY: GuestBuf = GuestBuf { ptr: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One decoded slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(GuestBuf),
    Bytes(GuestBuf),
    Ref(Token),
}

impl Slot {
    pub fn tag(&self) -> SlotTag {
        match self {
            Slot::Undefined => SlotTag::Undefined,
            Slot::Null => SlotTag::Null,
            Slot::Bool(_) => SlotTag::Bool,
            Slot::Number(_) => SlotTag::Number,
            Slot::BigInt(_) => SlotTag::BigInt,
            Slot::String(_) => SlotTag::String,
            Slot::Bytes(_) => SlotTag::Bytes,
            Slot::Ref(_) => SlotTag::Ref,
        }
    }

    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let (aux, payload) = match *self {
            Slot::Undefined | Slot::Null => (0u32, 0u64),
            Slot::Bool(b) => (0, u64::from(b)),
            Slot::Number(n) => (0, n.to_bits()),
            Slot::BigInt(n) => (0, n as u64),
            Slot::String(buf) | Slot::Bytes(buf) => (buf.len, u64::from(buf.ptr)),
            Slot::Ref(token) => (0, u64::from(token.to_raw())),
        };

        let mut out = [0u8; SLOT_SIZE];
        out[0] = self.tag() as u8;
        out[4..8].copy_from_slice(&aux.to_le_bytes());
        out[8..16].copy_from_slice(&payload.to_le_bytes());
        out
    }

    /// Decode the slot at position `index` (used for error reporting).
    pub fn decode(bytes: &[u8; SLOT_SIZE], index: usize) -> Result<Slot, AbiError> {
        let tag = SlotTag::try_from(bytes[0])?;
        if bytes[1..4] != [0, 0, 0] {
            return Err(AbiError::ReservedBits { index });
        }
        let aux = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[8..16]);
        let payload = u64::from_le_bytes(raw);

        let invalid = |reason| AbiError::InvalidPayload { index, reason };
        let no_aux = || {
            if aux != 0 {
                Err(invalid("unexpected aux field"))
            } else {
                Ok(())
            }
        };

        match tag {
            SlotTag::Undefined | SlotTag::Null => {
                no_aux()?;
                if payload != 0 {
                    return Err(invalid("unit slot carries a payload"));
                }
                Ok(if tag == SlotTag::Null { Slot::Null } else { Slot::Undefined })
            }
            SlotTag::Bool => {
                no_aux()?;
                match payload {
                    0 => Ok(Slot::Bool(false)),
                    1 => Ok(Slot::Bool(true)),
                    _ => Err(invalid("bool payload must be 0 or 1")),
                }
            }
            SlotTag::Number => {
                no_aux()?;
                Ok(Slot::Number(f64::from_bits(payload)))
            }
            SlotTag::BigInt => {
                no_aux()?;
                Ok(Slot::BigInt(payload as i64))
            }
            SlotTag::String | SlotTag::Bytes => {
                let ptr = u32::try_from(payload).map_err(|_| invalid("pointer exceeds 32 bits"))?;
                let buf = GuestBuf { ptr, len: aux };
                Ok(if tag == SlotTag::String { Slot::String(buf) } else { Slot::Bytes(buf) })
            }
            SlotTag::Ref => {
                no_aux()?;
                let raw = u32::try_from(payload).map_err(|_| invalid("token exceeds 32 bits"))?;
                Token::from_raw(raw)
                    .map(Slot::Ref)
                    .ok_or_else(|| invalid("null heap token"))
            }
        }
    }
}

/// Encode a run of slots into one contiguous buffer.
pub fn encode_slots(slots: &[Slot]) -> Vec<u8> {
    let mut out = Vec::with_capacity(slots.len() * SLOT_SIZE);
    for slot in slots {
        out.extend_from_slice(&slot.encode());
    }
    out
}

/// Decode a contiguous slot buffer, enforcing `limits`.
pub fn decode_slots(bytes: &[u8], limits: &Limits) -> Result<Vec<Slot>, AbiError> {
    if bytes.len() % SLOT_SIZE != 0 {
        return Err(AbiError::Misaligned { len: bytes.len() });
    }
    let count = bytes.len() / SLOT_SIZE;
    if count > limits.max_slice_len {
        return Err(AbiError::TooLong {
            len: count,
            max: limits.max_slice_len,
        });
    }

    let mut slots = Vec::with_capacity(count);
    for (index, chunk) in bytes.chunks_exact(SLOT_SIZE).enumerate() {
        let mut raw = [0u8; SLOT_SIZE];
        raw.copy_from_slice(chunk);
        let slot = Slot::decode(&raw, index)?;
        if let Slot::String(buf) | Slot::Bytes(buf) = slot {
            if buf.len as usize > limits.max_buffer_len {
                return Err(AbiError::TooLong {
                    len: buf.len as usize,
                    max: limits.max_buffer_len,
                });
            }
        }
        slots.push(slot);
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_slot_layout() {
        let bytes = Slot::Number(1.5).encode();
        assert_eq!(bytes[0], SlotTag::Number as u8);
        assert_eq!(&bytes[1..8], &[0; 7]);
        assert_eq!(&bytes[8..16], &1.5f64.to_bits().to_le_bytes());
    }

    #[test]
    fn string_slot_carries_pointer_and_length() {
        let buf = GuestBuf { ptr: 0x1000, len: 5 };
        let bytes = Slot::String(buf).encode();
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 5);
        assert_eq!(Slot::decode(&bytes, 0), Ok(Slot::String(buf)));
    }

    #[test]
    fn negative_bigint_survives() {
        let bytes = Slot::BigInt(-9_007_199_254_740_993).encode();
        assert_eq!(Slot::decode(&bytes, 0), Ok(Slot::BigInt(-9_007_199_254_740_993)));
    }
}
