//! Module runtime
//!
//! Compiles guest modules, links the host imports and brings each instance
//! to the `Ready` state. Both entry points end in the same synchronous
//! instantiation routine; [`Runtime::init`] only adds asynchronous source
//! resolution in front of it.

pub mod exports;
pub mod handles;
pub mod host;
pub mod loader;
pub mod marshal;
pub mod memory;

pub use exports::{BindingSchema, ExpectedSignature, ExportSpec, ExportTable};
pub use handles::{HandleTable, InstanceId, OpaqueHandle, ResourceClass, ResourceRegistry};
pub use host::{
    BindgenHostProvider, GuestThrow, HostFunctionError, HostFunctionErrorKind, HostFunctionProvider,
    HostLinkerBuilder, HostState, InterfaceBuilder, LinkerError,
};
pub use loader::{InitInput, InitState, InvalidTransition, SyncInitInput};
pub use memory::{GuestSlice, MemoryView, WASM_PAGE_SIZE};

use crate::bindings::Bindings;
use crate::config::RuntimeConfig;
use crate::error::InitError;
use loader::Attempt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimitsBuilder};

/// Compiles and instantiates guest modules.
///
/// A runtime is cheap to share: compiled modules are cached by content hash
/// and reused across instantiations, while every instantiation gets its own
/// store and host heap.
///
/// The cache is unbounded and lives as long as the runtime. Hosts that load
/// many distinct modules should disable it in [`RuntimeConfig`] or call
/// [`Runtime::clear_cache`].
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
    schema: BindingSchema,
    cache: Mutex<HashMap<[u8; 32], Module>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
            config: RuntimeConfig::default(),
            schema: BindingSchema::turtle(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, InitError> {
        config.validate()?;
        let mut wasm_config = Config::new();
        if config.fuel.is_some() {
            wasm_config.consume_fuel(true);
        }
        let engine = Engine::new(&wasm_config).map_err(|e| InitError::Engine(e.to_string()))?;
        Ok(Self {
            engine,
            config,
            schema: BindingSchema::turtle(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the export schema instances are validated against.
    pub fn with_schema(mut self, schema: BindingSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn schema(&self) -> &BindingSchema {
        &self.schema
    }

    /// Number of compiled modules held in the cache.
    pub fn cached_modules(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop every cached compilation, returning how many were held.
    /// Instances created from them are unaffected.
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache.lock();
        let dropped = cache.len();
        cache.clear();
        debug!(dropped, "module cache cleared");
        dropped
    }

    /// Compile `bytes`, reusing an earlier compilation of identical bytes.
    pub fn compile(&self, bytes: &[u8]) -> Result<Module, InitError> {
        if !self.config.cache_modules {
            return Module::new(&self.engine, bytes).map_err(|e| InitError::Compile(format!("{e:#}")));
        }

        let key: [u8; 32] = Sha256::digest(bytes).into();
        if let Some(module) = self.cache.lock().get(&key) {
            debug!(bytes = bytes.len(), "module cache hit");
            return Ok(module.clone());
        }

        let module = Module::new(&self.engine, bytes).map_err(|e| InitError::Compile(format!("{e:#}")))?;
        self.cache.lock().insert(key, module.clone());
        Ok(module)
    }

    /// Compile and instantiate an in-memory module.
    pub fn init_sync(&self, input: impl Into<SyncInitInput>) -> Result<Bindings, InitError> {
        self.instantiate(input.into())
    }

    /// Resolve `input`, then compile and instantiate it.
    ///
    /// The only suspension points are in source resolution. Dropping the
    /// future abandons the attempt without exposing any partial state.
    pub async fn init(&self, input: impl Into<InitInput>) -> Result<Bindings, InitError> {
        let source = input.into().resolve(self.config.fetch_timeout()).await?;
        self.instantiate(source)
    }

    fn instantiate(&self, input: SyncInitInput) -> Result<Bindings, InitError> {
        let mut attempt = Attempt::new();
        let result = self.instantiate_in(&mut attempt, input);
        if let Err(error) = &result {
            attempt.fail(error);
        }
        result
    }

    fn instantiate_in(&self, attempt: &mut Attempt, input: SyncInitInput) -> Result<Bindings, InitError> {
        attempt.advance(InitState::Compiling)?;
        let module = match input {
            SyncInitInput::Bytes(bytes) => self.compile(&bytes)?,
            SyncInitInput::Module(module) => {
                if !Engine::same(module.engine(), &self.engine) {
                    return Err(InitError::EngineMismatch);
                }
                module
            }
        };

        let mut linker = Linker::new(&self.engine);
        HostLinkerBuilder::new(&mut linker)
            .register_provider(&BindgenHostProvider::new(self.config.import_module.as_str()))
            .map_err(|e| InitError::Link(e.to_string()))?;

        let mut store = self.new_store()?;
        for import in module.imports() {
            if linker.get(&mut store, import.module(), import.name()).is_none() {
                return Err(InitError::MissingImport {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                });
            }
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| InitError::Link(format!("{e:#}")))?;
        attempt.advance(InitState::Instantiated)?;

        let exports = ExportTable::collect(&mut store, &instance, &self.schema)?;
        if let Some(start) = exports.func(exports::START) {
            start
                .typed::<(), ()>(&store)
                .and_then(|start| start.call(&mut store, ()))
                .map_err(|e| InitError::Start(format!("{e:#}")))?;
        }

        let bindings = Bindings::new(store, instance, exports, self.config.fuel);
        attempt.advance(InitState::Ready)?;
        info!(instance = ?bindings.id(), exports = bindings.export_names().len(), "module ready");
        Ok(bindings)
    }

    fn new_store(&self) -> Result<Store<HostState>, InitError> {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(max) = self.config.max_memory_bytes {
            limits = limits.memory_size(usize::try_from(max).unwrap_or(usize::MAX));
        }
        let state = HostState::new(limits.build(), self.config.limits);
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.store_limits);
        if let Some(fuel) = self.config.fuel {
            store.set_fuel(fuel).map_err(|e| InitError::Engine(e.to_string()))?;
        }
        Ok(store)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
