//! Generation-tagged heap tokens

use core::fmt;
use core::num::NonZeroU32;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Opaque reference to a host heap entry, as seen by a guest.
///
/// The low 24 bits index a slot, the high 8 bits carry the slot's
/// generation. Generation 0 is never issued, so a raw `0` is never a token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroU32);

impl Token {
    pub const MAX_INDEX: u32 = INDEX_MASK;

    /// Build a token. Returns `None` for generation 0 or an index that does
    /// not fit in 24 bits.
    pub fn new(index: u32, generation: u8) -> Option<Self> {
        if generation == 0 || index > INDEX_MASK {
            return None;
        }
        NonZeroU32::new(((generation as u32) << INDEX_BITS) | index).map(Token)
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        let token = NonZeroU32::new(raw).map(Token)?;
        if token.generation() == 0 {
            return None;
        }
        Some(token)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }

    pub fn index(self) -> u32 {
        self.0.get() & INDEX_MASK
    }

    pub fn generation(self) -> u8 {
        (self.0.get() >> INDEX_BITS) as u8
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}@{})", self.index(), self.generation())
    }
}
