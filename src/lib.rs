//! Bindhost: a host for wasm-bindgen style guest modules
//!
//! A guest compiled against the bindgen ABI exports a linear memory, a
//! shadow-stack pointer, an allocator pair and a handful of functions; it
//! imports a few host functions for creating and dropping host values. This
//! crate plays the host side of that contract on top of wasmtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Bindings                  │
//! │   test1 / test2 / boxed slices / Rudolph│
//! ├─────────────────────────────────────────┤
//! │  loader   - sources and init states     │
//! │  exports  - export table and schema     │
//! │  marshal  - scalars, slots, stack frame │
//! │  handles  - host heap and guest handles │
//! │  memory   - bounds-checked linear memory│
//! │  host     - imported host functions     │
//! ├─────────────────────────────────────────┤
//! │         WASM Execution (wasmtime)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut turtle = bindhost::init_sync(std::fs::read("turtle_bg.wasm")?)?;
//! let n = turtle.test1()?;
//! let values = turtle.return_boxed_js_value_slice()?;
//!
//! let mut rudolph = turtle.new_rudolph()?;
//! rudolph.free(&mut turtle)?;
//! ```
//!
//! Boxed values use the 16-byte slot layout from [`abi`].

pub mod bindings;
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use bindhost_abi as abi;
pub use bindhost_abi::{HostValue, Scalar, ScalarType};
pub use bindings::{Bindings, Rudolph, RUDOLPH};
pub use config::RuntimeConfig;
pub use error::{AbiViolation, InitError, ResourceMisuse, RuntimeError};
pub use runtime::{GuestSlice, InitInput, InitState, Runtime, SyncInitInput};

/// Instantiate an in-memory module with a default [`Runtime`].
pub fn init_sync(input: impl Into<SyncInitInput>) -> Result<Bindings, InitError> {
    Runtime::new().init_sync(input)
}

/// Resolve and instantiate a module with a default [`Runtime`].
pub async fn init(input: impl Into<InitInput>) -> Result<Bindings, InitError> {
    Runtime::new().init(input).await
}
