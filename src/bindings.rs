//! Typed bindings for an instantiated turtle module
//!
//! [`Bindings`] is what `init` and `init_sync` hand back. Every call takes
//! `&mut self`, so one `Bindings` has exactly one caller at a time; wrap it in
//! a lock to share it.

use crate::error::{ResourceMisuse, RuntimeError};
use crate::runtime::exports::ExportTable;
use crate::runtime::handles::{InstanceId, OpaqueHandle, ResourceClass, ResourceRegistry};
use crate::runtime::host::HostState;
use crate::runtime::marshal::{self, decode_scalar, scalar_type};
use crate::runtime::memory::{GuestSlice, MemoryView};
use bindhost_abi::{HostValue, Scalar};
use tracing::debug;
use wasmtime::{Instance, Store};

/// The guest's `Rudolph` class.
pub static RUDOLPH: ResourceClass = ResourceClass {
    name: "rudolph",
    free_export: "__wbg_rudolph_free",
    constructor_export: Some("rudolph_new"),
};

/// Size of the return area reserved for `return_boxed_js_value_slice`.
const RET_AREA: u32 = 16;

pub struct Bindings {
    id: InstanceId,
    store: Store<HostState>,
    instance: Instance,
    exports: ExportTable,
    resources: ResourceRegistry,
    fuel: Option<u64>,
}

impl Bindings {
    pub(crate) fn new(store: Store<HostState>, instance: Instance, exports: ExportTable, fuel: Option<u64>) -> Self {
        Self {
            id: InstanceId::next(),
            store,
            instance,
            exports,
            resources: ResourceRegistry::new(),
            fuel,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    fn refuel(&mut self) -> Result<(), RuntimeError> {
        if let Some(fuel) = self.fuel {
            self.store.set_fuel(fuel).map_err(|e| RuntimeError::Trap {
                function: "<refuel>".to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn number_thunk(&mut self, name: &str) -> Result<Scalar, RuntimeError> {
        self.call(name, &[])?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::FunctionNotFound(format!("{name} returned no value")))
    }

    /// `test1() -> number`
    pub fn test1(&mut self) -> Result<Scalar, RuntimeError> {
        self.number_thunk("test1")
    }

    /// `test2() -> number`
    pub fn test2(&mut self) -> Result<Scalar, RuntimeError> {
        self.number_thunk("test2")
    }

    /// Call the guest and take ownership of the slice it returns.
    ///
    /// The guest writes `(ptr, len)` into a return area on its shadow stack.
    /// The area is released whether or not decoding succeeds.
    pub fn return_boxed_js_value_slice(&mut self) -> Result<Vec<HostValue>, RuntimeError> {
        const NAME: &str = "return_boxed_js_value_slice";
        self.refuel()?;
        let Bindings { store, exports, .. } = self;
        let exports: &ExportTable = exports;
        let func = exports
            .require(NAME)?
            .typed::<i32, ()>(&*store)
            .map_err(|e| RuntimeError::FunctionNotFound(format!("{NAME}: {e}")))?;

        marshal::with_stack_frame(store, exports, RET_AREA, |store, retptr| {
            func.call(&mut *store, retptr as i32)
                .map_err(|e| marshal::call_error(NAME, e))?;
            let slice = exports.memory().read_slice(&*store, retptr)?;
            marshal::decode_boxed_slice(store, exports, slice)
        })
    }

    /// Call any export whose signature is made of scalars.
    pub fn call(&mut self, name: &str, args: &[Scalar]) -> Result<Vec<Scalar>, RuntimeError> {
        self.refuel()?;
        marshal::call_export(&mut self.store, &self.exports, name, args)
    }

    /// Construct a `Rudolph` through the guest's constructor export.
    pub fn new_rudolph(&mut self) -> Result<Rudolph, RuntimeError> {
        let constructor = RUDOLPH.constructor_export.unwrap_or("rudolph_new");
        let ptr = match self.call(constructor, &[])?.as_slice() {
            [Scalar::I32(ptr)] => *ptr as u32,
            other => {
                return Err(RuntimeError::FunctionNotFound(format!(
                    "{constructor} returned {other:?}, expected one i32"
                )))
            }
        };
        self.wrap_rudolph(ptr)
    }

    /// Take ownership of a `Rudolph` pointer the guest handed out.
    pub fn wrap_rudolph(&mut self, ptr: u32) -> Result<Rudolph, RuntimeError> {
        self.resources.adopt(&RUDOLPH, ptr)?;
        debug!(class = RUDOLPH.name, ptr, "adopted guest resource");
        Ok(Rudolph(OpaqueHandle::new(&RUDOLPH, ptr, self.id)))
    }

    fn free_resource(&mut self, handle: &mut OpaqueHandle) -> Result<(), RuntimeError> {
        let ptr = handle.check_release(self.id)?;
        let class = handle.class();
        self.resources.release(class, ptr)?;
        handle.mark_freed();
        self.refuel()?;
        let free = self
            .exports
            .require(class.free_export)?
            .typed::<i32, ()>(&self.store)
            .map_err(|e| RuntimeError::FunctionNotFound(format!("{}: {e}", class.free_export)))?;
        free.call(&mut self.store, ptr as i32)
            .map_err(|e| marshal::call_error(class.free_export, e))?;
        debug!(class = class.name, ptr, "released guest resource");
        Ok(())
    }

    /// Hand values to the guest. The guest owns the result.
    pub fn encode_boxed_slice(&mut self, values: &[HostValue]) -> Result<GuestSlice, RuntimeError> {
        self.refuel()?;
        marshal::encode_boxed_slice(&mut self.store, &self.exports, values)
    }

    /// Take ownership of a slice the guest owns.
    pub fn decode_boxed_slice(&mut self, slice: GuestSlice) -> Result<Vec<HostValue>, RuntimeError> {
        self.refuel()?;
        marshal::decode_boxed_slice(&mut self.store, &self.exports, slice)
    }

    pub fn stack_pointer(&mut self) -> Result<u32, RuntimeError> {
        marshal::stack_pointer(&mut self.store, &self.exports)
    }

    pub fn memory(&self) -> MemoryView {
        *self.exports.memory()
    }

    pub fn memory_size(&self) -> usize {
        self.exports.memory().size(&self.store)
    }

    pub fn read_memory(&self, offset: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        Ok(self.exports.memory().read(&self.store, offset, len)?)
    }

    pub fn write_memory(&mut self, offset: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        Ok(self.exports.memory().write(&mut self.store, offset, bytes)?)
    }

    /// Grow guest memory by `pages`, returning the previous page count.
    pub fn grow_memory(&mut self, pages: u64) -> Result<u64, RuntimeError> {
        Ok(self.exports.memory().grow(&mut self.store, pages)?)
    }

    /// Read an exported numeric global.
    pub fn global(&mut self, name: &str) -> Option<Scalar> {
        let global = self.instance.get_global(&mut self.store, name)?;
        let ty = scalar_type(global.ty(&self.store).content())?;
        decode_scalar(&global.get(&mut self.store), ty).ok()
    }

    /// Number of live values on the host heap.
    pub fn heap_len(&self) -> usize {
        self.store.data().heap().len()
    }

    /// Number of guest resources the host currently owns.
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn export_names(&self) -> Vec<String> {
        self.exports.names().map(str::to_string).collect()
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains(name)
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("id", &self.id)
            .field("exports", &self.exports.len())
            .field("resources", &self.resources.len())
            .finish_non_exhaustive()
    }
}

/// Host-owned handle to a guest `Rudolph`.
#[derive(Debug)]
pub struct Rudolph(OpaqueHandle);

impl Rudolph {
    /// Release the guest object. A second call fails with
    /// [`ResourceMisuse::DoubleFree`] and does not reach the guest.
    pub fn free(&mut self, bindings: &mut Bindings) -> Result<(), RuntimeError> {
        bindings.free_resource(&mut self.0)
    }

    pub fn raw(&self) -> Result<u32, ResourceMisuse> {
        self.0.raw()
    }

    pub fn is_freed(&self) -> bool {
        self.0.is_freed()
    }

    pub fn instance(&self) -> InstanceId {
        self.0.instance()
    }
}
