//! Host import registration
//!
//! Guests compiled against the bindgen ABI import a small set of host
//! functions to create, clone and drop host heap values and to raise
//! errors. They are registered through a builder that groups functions by
//! import module:
//!
//! ```ignore
//! let mut linker = Linker::new(&engine);
//! let mut builder = HostLinkerBuilder::new(&mut linker);
//! builder.register_provider(&BindgenHostProvider::new("wbg"))?;
//! ```
//!
//! Host functions never swallow failures. A bad pointer or token turns into
//! a trap carrying a [`HostFunctionError`], which aborts the guest call and
//! surfaces at the call boundary.

use crate::error::AbiViolation;
use crate::runtime::handles::HandleTable;
use crate::runtime::memory::MemoryView;
use bindhost_abi::{HostValue, Limits};
use std::marker::PhantomData;
use thiserror::Error;
use wasmtime::{Caller, Linker, StoreLimits};

/// State owned by each store: the host heap and resource limits.
pub struct HostState {
    pub(crate) heap: HandleTable<HostValue>,
    pub(crate) store_limits: StoreLimits,
    pub(crate) abi_limits: Limits,
}

impl HostState {
    pub fn new(store_limits: StoreLimits, abi_limits: Limits) -> Self {
        Self {
            heap: HandleTable::new(),
            store_limits,
            abi_limits,
        }
    }

    /// The host value heap.
    pub fn heap(&self) -> &HandleTable<HostValue> {
        &self.heap
    }

    pub fn abi_limits(&self) -> &Limits {
        &self.abi_limits
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new(StoreLimits::default(), Limits::default())
    }
}

/// Error raised by a host function. Attached to the trap it causes.
#[derive(Debug, Clone)]
pub struct HostFunctionError {
    /// The import module name (e.g., "wbg")
    pub interface: String,
    /// The function name (e.g., "__wbindgen_string_new")
    pub function: String,
    /// The kind of error that occurred
    pub kind: HostFunctionErrorKind,
}

impl std::fmt::Display for HostFunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "host function error in {}::{}: {}",
            self.interface, self.function, self.kind
        )
    }
}

impl std::error::Error for HostFunctionError {}

/// The specific kind of error that occurred in a host function.
#[derive(Debug, Clone)]
pub enum HostFunctionErrorKind {
    /// The guest exports no memory
    NoMemory,
    /// Bad pointer, length or heap token from the guest
    Abi(AbiViolation),
    /// String bytes were not UTF-8
    Utf8,
    /// Host heap index space is full
    HeapExhausted,
}

impl std::fmt::Display for HostFunctionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMemory => write!(f, "no exported memory"),
            Self::Abi(e) => write!(f, "{}", e),
            Self::Utf8 => write!(f, "string is not valid UTF-8"),
            Self::HeapExhausted => write!(f, "host heap exhausted"),
        }
    }
}

/// Trap payload for an error thrown by the guest through `__wbindgen_throw`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct GuestThrow(pub String);

/// Errors from linker operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),
}

/// Builder for registering host functions with a Linker.
///
/// Generic over `T` which is the store data type.
pub struct HostLinkerBuilder<'a, T> {
    linker: &'a mut Linker<T>,
    _marker: PhantomData<T>,
}

impl<'a, T> HostLinkerBuilder<'a, T> {
    /// Create a new builder wrapping a wasmtime Linker
    pub fn new(linker: &'a mut Linker<T>) -> Self {
        Self {
            linker,
            _marker: PhantomData,
        }
    }

    /// Start defining functions under the import module `name`.
    pub fn interface(&mut self, name: &str) -> Result<InterfaceBuilder<'_, 'a, T>, LinkerError> {
        Ok(InterfaceBuilder {
            linker: self,
            module_name: name.to_string(),
        })
    }

    /// Register a provider's functions.
    pub fn register_provider<P: HostFunctionProvider<T>>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, LinkerError> {
        provider.register(self)?;
        Ok(self)
    }
}

/// Builder for registering functions within a specific import module.
pub struct InterfaceBuilder<'a, 'b, T> {
    linker: &'a mut HostLinkerBuilder<'b, T>,
    module_name: String,
}

impl<'a, 'b, T: 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register a host function with direct WASM-level parameters.
    pub fn func_raw<Params, Results>(
        &mut self,
        name: &str,
        func: impl wasmtime::IntoFunc<T, Params, Results>,
    ) -> Result<&mut Self, LinkerError> {
        self.linker
            .linker
            .func_wrap(&self.module_name, name, func)
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;
        Ok(self)
    }
}

/// Trait for types that provide a set of host functions.
pub trait HostFunctionProvider<T> {
    /// Register this provider's functions with the linker builder.
    fn register(&self, builder: &mut HostLinkerBuilder<'_, T>) -> Result<(), LinkerError>;
}

/// The host side of the bindgen import surface.
///
/// Provides, under the configured import module:
/// - `__wbindgen_number_new(f64) -> i32`
/// - `__wbindgen_bigint_from_i64(i64) -> i32`
/// - `__wbindgen_string_new(ptr, len) -> i32`
/// - `__wbindgen_object_clone_ref(token) -> i32`
/// - `__wbindgen_object_drop_ref(token)`
/// - `__wbindgen_throw(ptr, len)`
pub struct BindgenHostProvider {
    module: String,
}

impl BindgenHostProvider {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
        }
    }
}

fn fail(module: &str, function: &str, kind: HostFunctionErrorKind) -> wasmtime::Error {
    wasmtime::Error::new(HostFunctionError {
        interface: module.to_string(),
        function: function.to_string(),
        kind,
    })
}

fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<String, HostFunctionErrorKind> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .map(MemoryView::new)
        .ok_or(HostFunctionErrorKind::NoMemory)?;
    let bytes = memory
        .read(&*caller, ptr as u32, len as u32)
        .map_err(HostFunctionErrorKind::Abi)?;
    String::from_utf8(bytes).map_err(|_| HostFunctionErrorKind::Utf8)
}

fn heap_insert(caller: &mut Caller<'_, HostState>, value: HostValue) -> Result<i32, HostFunctionErrorKind> {
    caller
        .data_mut()
        .heap
        .insert(value)
        .map(|token| token.to_raw() as i32)
        .ok_or(HostFunctionErrorKind::HeapExhausted)
}

impl HostFunctionProvider<HostState> for BindgenHostProvider {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, HostState>) -> Result<(), LinkerError> {
        let m = self.module.clone();
        let (m1, m2, m3, m4, m5, m6) = (m.clone(), m.clone(), m.clone(), m.clone(), m.clone(), m);

        builder
            .interface(&self.module)?
            .func_raw(
                "__wbindgen_number_new",
                move |mut caller: Caller<'_, HostState>, n: f64| -> wasmtime::Result<i32> {
                    heap_insert(&mut caller, HostValue::Number(n))
                        .map_err(|kind| fail(&m1, "__wbindgen_number_new", kind))
                },
            )?
            .func_raw(
                "__wbindgen_bigint_from_i64",
                move |mut caller: Caller<'_, HostState>, n: i64| -> wasmtime::Result<i32> {
                    heap_insert(&mut caller, HostValue::BigInt(n))
                        .map_err(|kind| fail(&m2, "__wbindgen_bigint_from_i64", kind))
                },
            )?
            .func_raw(
                "__wbindgen_string_new",
                move |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
                    read_guest_string(&mut caller, ptr, len)
                        .and_then(|s| heap_insert(&mut caller, HostValue::String(s)))
                        .map_err(|kind| fail(&m3, "__wbindgen_string_new", kind))
                },
            )?
            .func_raw(
                "__wbindgen_object_clone_ref",
                move |mut caller: Caller<'_, HostState>, raw: i32| -> wasmtime::Result<i32> {
                    let heap = &mut caller.data_mut().heap;
                    let cloned = heap
                        .token(raw as u32)
                        .and_then(|token| heap.clone_ref(token))
                        .map_err(HostFunctionErrorKind::Abi)
                        .and_then(|token| token.ok_or(HostFunctionErrorKind::HeapExhausted));
                    cloned
                        .map(|token| token.to_raw() as i32)
                        .map_err(|kind| fail(&m4, "__wbindgen_object_clone_ref", kind))
                },
            )?
            .func_raw(
                "__wbindgen_object_drop_ref",
                move |mut caller: Caller<'_, HostState>, raw: i32| -> wasmtime::Result<()> {
                    let heap = &mut caller.data_mut().heap;
                    heap.token(raw as u32)
                        .and_then(|token| heap.take(token))
                        .map(drop)
                        .map_err(|e| fail(&m5, "__wbindgen_object_drop_ref", HostFunctionErrorKind::Abi(e)))
                },
            )?
            .func_raw(
                "__wbindgen_throw",
                move |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                    match read_guest_string(&mut caller, ptr, len) {
                        Ok(message) => Err(wasmtime::Error::new(GuestThrow(message))),
                        Err(kind) => Err(fail(&m6, "__wbindgen_throw", kind)),
                    }
                },
            )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::Engine;

    #[test]
    fn test_interface_builder_creation() {
        let engine = Engine::default();
        let mut linker = Linker::<()>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);

        assert!(builder.interface("wbg").is_ok());
        assert!(builder.interface("__wbindgen_placeholder__").is_ok());
    }

    #[test]
    fn test_func_raw_registration() -> Result<(), LinkerError> {
        let engine = Engine::default();
        let mut linker = Linker::<()>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);

        builder
            .interface("test")?
            .func_raw("add", |_caller: Caller<'_, ()>, a: i32, b: i32| a + b)?;

        Ok(())
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let engine = Engine::default();
        let mut linker = Linker::<HostState>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);

        let provider = BindgenHostProvider::new("wbg");
        builder.register_provider(&provider).expect("first registration");
        assert!(builder.register_provider(&provider).is_err());
    }

    #[test]
    fn test_error_display_names_function() {
        let err = HostFunctionError {
            interface: "wbg".into(),
            function: "__wbindgen_string_new".into(),
            kind: HostFunctionErrorKind::Utf8,
        };
        assert_eq!(
            err.to_string(),
            "host function error in wbg::__wbindgen_string_new: string is not valid UTF-8"
        );
    }
}
