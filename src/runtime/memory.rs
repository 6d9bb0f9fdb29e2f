//! Linear memory access for host <-> guest data transfer.
//!
//! [`MemoryView`] never caches a raw pointer into the guest buffer. Every
//! access re-resolves the backing slice from the store, so a `memory.grow`
//! in between two calls cannot leave the host holding a dangling view.

use crate::error::AbiViolation;
use bindhost_abi::SLOT_SIZE;
use wasmtime::{AsContext, AsContextMut, Memory};

/// Size of one wasm page in bytes.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// An element-counted region of linear memory, as returned by a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    /// Offset of the first element.
    pub ptr: u32,
    /// Number of elements (not bytes).
    pub len: u32,
}

impl GuestSlice {
    pub const fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    pub const fn empty() -> Self {
        Self { ptr: 0, len: 0 }
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte extent of the slot region, if it fits in 32 bits.
    pub fn byte_len(&self) -> Option<u32> {
        self.len.checked_mul(SLOT_SIZE as u32)
    }
}

/// Bounds-checked view over a guest's exported linear memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView {
    memory: Memory,
}

impl MemoryView {
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// The underlying wasmtime memory handle.
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Current size in bytes.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(&store)
    }

    fn range(&self, size: usize, offset: u32, len: u32) -> Result<std::ops::Range<usize>, AbiViolation> {
        let start = offset as usize;
        let end = start.checked_add(len as usize);
        match end {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(AbiViolation::OutOfBounds {
                offset: u64::from(offset),
                len: u64::from(len),
                size,
            }),
        }
    }

    /// Copy `len` bytes out of guest memory.
    pub fn read(&self, store: impl AsContext, offset: u32, len: u32) -> Result<Vec<u8>, AbiViolation> {
        let data = self.memory.data(&store);
        let range = self.range(data.len(), offset, len)?;
        Ok(data[range].to_vec())
    }

    /// Copy `bytes` into guest memory at `offset`.
    pub fn write(&self, mut store: impl AsContextMut, offset: u32, bytes: &[u8]) -> Result<(), AbiViolation> {
        let len = u32::try_from(bytes.len()).map_err(|_| AbiViolation::OutOfBounds {
            offset: u64::from(offset),
            len: bytes.len() as u64,
            size: self.memory.data_size(&store),
        })?;
        let data = self.memory.data_mut(&mut store);
        let range = self.range(data.len(), offset, len)?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u32(&self, store: impl AsContext, offset: u32) -> Result<u32, AbiViolation> {
        let bytes = self.read(store, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&self, store: impl AsContextMut, offset: u32, value: u32) -> Result<(), AbiViolation> {
        self.write(store, offset, &value.to_le_bytes())
    }

    /// Read a `(ptr, len)` pair written by the guest into a return area.
    pub fn read_slice(&self, store: impl AsContext, offset: u32) -> Result<GuestSlice, AbiViolation> {
        let bytes = self.read(store, offset, 8)?;
        Ok(GuestSlice::new(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        ))
    }

    /// Grow by `pages`, returning the previous size in pages.
    ///
    /// Any offset computed before this call must be re-derived afterwards.
    pub fn grow(&self, store: impl AsContextMut, pages: u64) -> Result<u64, AbiViolation> {
        let mut store = store;
        let size = self.memory.data_size(&store);
        self.memory
            .grow(&mut store, pages)
            .map_err(|_| AbiViolation::OutOfBounds {
                offset: size as u64,
                len: pages.saturating_mul(WASM_PAGE_SIZE as u64),
                size,
            })
    }
}
