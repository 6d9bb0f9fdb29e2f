//! Export surface validation - check an instance provides the bindings ABI

use crate::error::{InitError, RuntimeError};
use crate::runtime::host::HostState;
use crate::runtime::marshal::{scalar_type, type_name};
use crate::runtime::memory::MemoryView;
use bindhost_abi::ScalarType;
use std::collections::BTreeMap;
use wasmtime::{ExternType, Func, FuncType, Instance, Module, Store};

pub const MEMORY: &str = "memory";
pub const ADD_TO_STACK_POINTER: &str = "__wbindgen_add_to_stack_pointer";
pub const FREE: &str = "__wbindgen_free";
pub const MALLOC: &str = "__wbindgen_malloc";
pub const START: &str = "__wbindgen_start";

/// The WASM-level signature an export must have.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpectedSignature {
    /// Exactly these params and results.
    Exact {
        params: &'static [ScalarType],
        results: &'static [ScalarType],
    },
    /// `() -> number`: no params, one numeric result of any width.
    NumberThunk,
}

impl ExpectedSignature {
    pub fn matches(&self, ty: &FuncType) -> bool {
        let params: Option<Vec<ScalarType>> = ty.params().map(|t| scalar_type(&t)).collect();
        let results: Option<Vec<ScalarType>> = ty.results().map(|t| scalar_type(&t)).collect();
        let (Some(params), Some(results)) = (params, results) else {
            return false;
        };
        match self {
            ExpectedSignature::Exact {
                params: expected_params,
                results: expected_results,
            } => params == *expected_params && results == *expected_results,
            ExpectedSignature::NumberThunk => params.is_empty() && results.len() == 1,
        }
    }

    pub fn description(&self) -> String {
        match self {
            ExpectedSignature::Exact { params, results } => {
                format!("({}) -> ({})", join(params.iter().map(|t| t.name())), join(results.iter().map(|t| t.name())))
            }
            ExpectedSignature::NumberThunk => "() -> (number)".to_string(),
        }
    }
}

fn join<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

/// Render a wasmtime function type the same way as [`ExpectedSignature::description`].
pub fn describe(ty: &FuncType) -> String {
    let params: Vec<_> = ty.params().collect();
    let results: Vec<_> = ty.results().collect();
    format!(
        "({}) -> ({})",
        join(params.iter().map(type_name)),
        join(results.iter().map(type_name))
    )
}

/// One export the bindings rely on.
#[derive(Debug, Clone)]
pub struct ExportSpec {
    pub name: &'static str,
    pub signature: ExpectedSignature,
    pub required: bool,
}

impl ExportSpec {
    pub const fn required(name: &'static str, signature: ExpectedSignature) -> Self {
        Self {
            name,
            signature,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, signature: ExpectedSignature) -> Self {
        Self {
            name,
            signature,
            required: false,
        }
    }

    fn check(&self, ty: Option<&FuncType>) -> Result<(), InitError> {
        match ty {
            None if self.required => Err(InitError::MissingExport(self.name.to_string())),
            None => Ok(()),
            Some(ty) if self.signature.matches(ty) => Ok(()),
            Some(ty) => Err(InitError::SignatureMismatch {
                name: self.name.to_string(),
                expected: self.signature.description(),
                actual: describe(ty),
            }),
        }
    }
}

const I32: ScalarType = ScalarType::I32;

/// The set of exports a module must provide to be driven by [`crate::Bindings`].
#[derive(Debug, Clone)]
pub struct BindingSchema {
    pub exports: Vec<ExportSpec>,
}

impl BindingSchema {
    /// The turtle module surface: two numeric tests, a boxed value slice,
    /// the `Rudolph` resource and the bindgen intrinsics.
    pub fn turtle() -> Self {
        use ExpectedSignature::{Exact, NumberThunk};
        Self {
            exports: vec![
                ExportSpec::required("test1", NumberThunk),
                ExportSpec::required("test2", NumberThunk),
                ExportSpec::required(
                    "return_boxed_js_value_slice",
                    Exact { params: &[I32], results: &[] },
                ),
                ExportSpec::required(
                    "__wbg_rudolph_free",
                    Exact { params: &[I32], results: &[] },
                ),
                ExportSpec::required(
                    ADD_TO_STACK_POINTER,
                    Exact { params: &[I32], results: &[I32] },
                ),
                ExportSpec::required(FREE, Exact { params: &[I32, I32], results: &[] }),
                ExportSpec::optional(MALLOC, Exact { params: &[I32], results: &[I32] }),
                ExportSpec::optional("rudolph_new", Exact { params: &[], results: &[I32] }),
                ExportSpec::optional(START, Exact { params: &[], results: &[] }),
            ],
        }
    }

    /// Check a compiled module without instantiating it.
    pub fn validate_module(&self, module: &Module) -> Result<(), InitError> {
        let mut has_memory = false;
        let mut funcs = BTreeMap::new();
        for export in module.exports() {
            match export.ty() {
                ExternType::Func(ty) => {
                    funcs.insert(export.name().to_string(), ty);
                }
                ExternType::Memory(_) if export.name() == MEMORY => has_memory = true,
                _ => {}
            }
        }
        if !has_memory {
            return Err(InitError::MissingMemory);
        }
        for spec in &self.exports {
            spec.check(funcs.get(spec.name))?;
        }
        Ok(())
    }
}

impl Default for BindingSchema {
    fn default() -> Self {
        Self::turtle()
    }
}

/// Name-addressed table of an instance's exported functions plus its memory.
///
/// Built once per instantiation and never modified.
#[derive(Debug)]
pub struct ExportTable {
    funcs: BTreeMap<String, Func>,
    memory: MemoryView,
}

impl ExportTable {
    /// Collect every exported function and check them against `schema`.
    pub fn collect(
        store: &mut Store<HostState>,
        instance: &Instance,
        schema: &BindingSchema,
    ) -> Result<Self, InitError> {
        let memory = instance
            .get_memory(&mut *store, MEMORY)
            .map(MemoryView::new)
            .ok_or(InitError::MissingMemory)?;

        let funcs: BTreeMap<String, Func> = instance
            .exports(&mut *store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_func().map(|func| (name, func))
            })
            .collect();

        for spec in &schema.exports {
            let ty = funcs.get(spec.name).map(|func| func.ty(&*store));
            spec.check(ty.as_ref())?;
        }

        Ok(Self { funcs, memory })
    }

    pub fn func(&self, name: &str) -> Option<&Func> {
        self.funcs.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Func, RuntimeError> {
        self.func(name)
            .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funcs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }
}
