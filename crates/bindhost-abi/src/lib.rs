//! bindhost-abi: the wire contract between a bindhost host and its guests
//!
//! Everything in this crate is shared by both sides of the boundary, so it
//! is `no_std` (with `alloc`) and free of any engine types.
//!
//! ## Boxed slices
//!
//! A heterogeneous sequence crosses linear memory as `len` consecutive
//! 16-byte slots:
//!
//! ```text
//! ┌──────┬──────────┬──────────┬──────────────────┐
//! │ tag  │ reserved │ aux:u32  │ payload:u64      │
//! │ u8   │ 3 x 0x00 │          │                  │
//! └──────┴──────────┴──────────┴──────────────────┘
//! ```
//!
//! Scalars live inline in `payload`. Strings and byte buffers point at
//! guest-owned memory (`payload` = ptr, `aux` = byte length). Values that only
//! the host can represent stay in the host heap and are referenced by a
//! generation-tagged [`Token`].

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod slot;
mod token;
mod value;

pub use slot::{decode_slots, encode_slots, GuestBuf, Slot, SlotTag, SLOT_ALIGN, SLOT_SIZE};
pub use token::Token;
pub use value::{HostValue, Scalar, ScalarType};

use core::fmt;

/// Errors produced while decoding boundary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    /// Slot tag byte is not a known [`SlotTag`].
    InvalidTag(u8),
    /// Reserved bytes of a slot were not zero.
    ReservedBits { index: usize },
    /// Payload does not fit the declared tag.
    InvalidPayload { index: usize, reason: &'static str },
    /// Buffer length is not a whole number of slots.
    Misaligned { len: usize },
    /// Sequence exceeds the configured limit.
    TooLong { len: usize, max: usize },
    /// A string payload was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTag(tag) => write!(f, "invalid slot tag 0x{tag:02x}"),
            Self::ReservedBits { index } => {
                write!(f, "reserved bytes set in slot {index}")
            }
            Self::InvalidPayload { index, reason } => {
                write!(f, "invalid payload in slot {index}: {reason}")
            }
            Self::Misaligned { len } => {
                write!(f, "buffer of {len} bytes is not a multiple of {SLOT_SIZE}")
            }
            Self::TooLong { len, max } => {
                write!(f, "sequence of {len} exceeds limit of {max}")
            }
            Self::InvalidUtf8 => write!(f, "string payload is not valid UTF-8"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AbiError {}

/// Upper bounds applied when decoding data handed over by a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Limits {
    /// Maximum number of slots in one boxed slice.
    pub max_slice_len: usize,
    /// Maximum byte length of one string or byte buffer.
    pub max_buffer_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_slice_len: 1_000_000,
            max_buffer_len: 16 * 1024 * 1024,
        }
    }
}
