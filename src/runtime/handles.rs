//! Handle tables
//!
//! Two kinds of cross-boundary ownership live here:
//!
//! - [`HandleTable`] is the host heap. Guests hold [`Token`]s to host values;
//!   slots are recycled and every reuse bumps a generation counter, so a
//!   token that outlived its value is detected instead of aliasing a newer
//!   one.
//! - [`ResourceRegistry`] and [`OpaqueHandle`] cover the opposite
//!   direction: guest-allocated resources the host holds by pointer and must
//!   release exactly once.

use crate::error::{AbiViolation, ResourceMisuse};
use bindhost_abi::Token;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u8, value: T },
    Vacant { generation: u8 },
}

/// Generational slab of host values referenced from a guest.
#[derive(Debug)]
pub struct HandleTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Entry<T> {
    fn generation(&self) -> u8 {
        match self {
            Entry::Occupied { generation, .. } | Entry::Vacant { generation } => *generation,
        }
    }
}

fn next_generation(generation: u8) -> u8 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `value` and return the token a guest will use for it.
    ///
    /// Returns `None` once the 24-bit index space is exhausted.
    pub fn insert(&mut self, value: T) -> Option<Token> {
        while let Some(index) = self.free.pop() {
            // Only vacant entries are ever pushed onto the free list.
            if let Some(entry @ Entry::Vacant { .. }) = self.entries.get_mut(index as usize) {
                let generation = entry.generation();
                *entry = Entry::Occupied { generation, value };
                self.live += 1;
                return Token::new(index, generation);
            }
        }

        let index = u32::try_from(self.entries.len()).ok()?;
        let token = Token::new(index, 1)?;
        self.entries.push(Entry::Occupied {
            generation: 1,
            value,
        });
        self.live += 1;
        Some(token)
    }

    fn check(&self, token: Token) -> Result<usize, AbiViolation> {
        let index = token.index() as usize;
        match self.entries.get(index) {
            Some(Entry::Occupied { generation, .. }) if *generation == token.generation() => Ok(index),
            Some(_) => Err(AbiViolation::StaleToken(token)),
            None => Err(AbiViolation::UnknownToken(token.to_raw())),
        }
    }

    pub fn get(&self, token: Token) -> Result<&T, AbiViolation> {
        let index = self.check(token)?;
        match self.entries.get(index) {
            Some(Entry::Occupied { value, .. }) => Ok(value),
            _ => Err(AbiViolation::StaleToken(token)),
        }
    }

    /// Remove the value behind `token`. The token, and any copy of it, is
    /// stale afterwards.
    pub fn take(&mut self, token: Token) -> Result<T, AbiViolation> {
        let index = self.check(token)?;
        let vacant = Entry::Vacant {
            generation: next_generation(token.generation()),
        };
        let Some(entry) = self.entries.get_mut(index) else {
            return Err(AbiViolation::StaleToken(token));
        };
        match std::mem::replace(entry, vacant) {
            Entry::Occupied { value, .. } => {
                self.free.push(index as u32);
                self.live -= 1;
                Ok(value)
            }
            previous @ Entry::Vacant { .. } => {
                *entry = previous;
                Err(AbiViolation::StaleToken(token))
            }
        }
    }

    /// Resolve a raw guest-supplied token.
    pub fn token(&self, raw: u32) -> Result<Token, AbiViolation> {
        Token::from_raw(raw).ok_or(AbiViolation::UnknownToken(raw))
    }
}

impl<T: Clone> HandleTable<T> {
    /// Duplicate an entry under a fresh token.
    pub fn clone_ref(&mut self, token: Token) -> Result<Option<Token>, AbiViolation> {
        let value = self.get(token)?.clone();
        Ok(self.insert(value))
    }
}

/// Identity of one instantiated module. Handles never cross instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        InstanceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A guest-side resource class: its display name and the export that
/// releases it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ResourceClass {
    pub name: &'static str,
    pub free_export: &'static str,
    pub constructor_export: Option<&'static str>,
}

/// Live guest resource pointers owned by the host, per class.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    live: HashSet<(&'static str, u32)>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the host now owns `ptr`.
    pub fn adopt(&mut self, class: &'static ResourceClass, ptr: u32) -> Result<(), ResourceMisuse> {
        if ptr == 0 {
            return Err(ResourceMisuse::NullHandle { class: class.name });
        }
        if !self.live.insert((class.name, ptr)) {
            return Err(ResourceMisuse::AlreadyWrapped {
                class: class.name,
                ptr,
            });
        }
        Ok(())
    }

    /// Forget `ptr`; fails if it was never adopted or already released.
    pub fn release(&mut self, class: &'static ResourceClass, ptr: u32) -> Result<(), ResourceMisuse> {
        if self.live.remove(&(class.name, ptr)) {
            Ok(())
        } else {
            Err(ResourceMisuse::DoubleFree {
                class: class.name,
                ptr,
            })
        }
    }

    pub fn is_live(&self, class: &'static ResourceClass, ptr: u32) -> bool {
        self.live.contains(&(class.name, ptr))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Owning host-side wrapper around a guest resource pointer.
///
/// The guest does not re-validate pointers handed to its free export, so
/// this wrapper does: it records its own release and refuses a second one.
/// Dropping it without calling free leaks the guest resource.
#[derive(Debug)]
pub struct OpaqueHandle {
    class: &'static ResourceClass,
    ptr: u32,
    instance: InstanceId,
    freed: bool,
}

impl OpaqueHandle {
    pub(crate) fn new(class: &'static ResourceClass, ptr: u32, instance: InstanceId) -> Self {
        Self {
            class,
            ptr,
            instance,
            freed: false,
        }
    }

    pub fn class(&self) -> &'static ResourceClass {
        self.class
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// The raw guest pointer, for passing back into guest calls.
    pub fn raw(&self) -> Result<u32, ResourceMisuse> {
        if self.freed {
            return Err(ResourceMisuse::UseAfterFree {
                class: self.class.name,
                ptr: self.ptr,
            });
        }
        Ok(self.ptr)
    }

    /// Check the handle may be released against `instance`. Does not mark it.
    pub(crate) fn check_release(&self, instance: InstanceId) -> Result<u32, ResourceMisuse> {
        if self.freed {
            return Err(ResourceMisuse::DoubleFree {
                class: self.class.name,
                ptr: self.ptr,
            });
        }
        if self.instance != instance {
            return Err(ResourceMisuse::ForeignHandle {
                class: self.class.name,
                ptr: self.ptr,
            });
        }
        Ok(self.ptr)
    }

    pub(crate) fn mark_freed(&mut self) {
        self.freed = true;
    }
}

impl Drop for OpaqueHandle {
    fn drop(&mut self) {
        if !self.freed {
            tracing::warn!(
                class = self.class.name,
                ptr = self.ptr,
                "handle dropped without free; guest resource leaked"
            );
        }
    }
}
