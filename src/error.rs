//! Error taxonomy for the host/guest boundary

use crate::runtime::InitState;
use bindhost_abi::{AbiError, ScalarType, Token};
use thiserror::Error;

/// Top-level error returned by every boundary operation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),

    #[error("ABI violation: {0}")]
    Abi(#[from] AbiViolation),

    #[error("resource misuse: {0}")]
    ResourceMisuse(#[from] ResourceMisuse),

    #[error("guest trapped in '{function}': {message}")]
    Trap { function: String, message: String },

    #[error("guest threw: {0}")]
    Thrown(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),
}

/// Failure to bring a module to the `Ready` state.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("invalid runtime config: {0}")]
    Config(String),

    #[error("engine setup failed: {0}")]
    Engine(String),

    #[error("failed to fetch module: {0}")]
    Fetch(String),

    #[error("failed to read module: {0}")]
    Io(#[from] std::io::Error),

    #[error("pending module source failed: {0}")]
    Pending(String),

    #[error("compile failed: {0}")]
    Compile(String),

    #[error("precompiled module belongs to a different engine")]
    EngineMismatch,

    #[error("missing import {module}::{name}")]
    MissingImport { module: String, name: String },

    #[error("link failed: {0}")]
    Link(String),

    #[error("missing export '{0}'")]
    MissingExport(String),

    #[error("missing memory export 'memory'")]
    MissingMemory,

    #[error("export '{name}' has wrong signature: expected {expected}, got {actual}")]
    SignatureMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("start function failed: {0}")]
    Start(String),
}

impl InitError {
    /// The stage the attempt was in when this error occurred.
    pub fn stage(&self) -> InitState {
        match self {
            InitError::Config(_)
            | InitError::Engine(_)
            | InitError::Fetch(_)
            | InitError::Io(_)
            | InitError::Pending(_) => InitState::Unloaded,
            InitError::Compile(_)
            | InitError::EngineMismatch
            | InitError::MissingImport { .. }
            | InitError::Link(_) => InitState::Compiling,
            InitError::MissingExport(_)
            | InitError::MissingMemory
            | InitError::SignatureMismatch { .. }
            | InitError::Start(_) => InitState::Instantiated,
        }
    }
}

/// Malformed data or references crossing the boundary. Always fatal for the
/// current call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbiViolation {
    #[error("out of bounds access: {len} bytes at {offset:#x}, memory is {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: usize },

    #[error("{0}")]
    Codec(#[from] AbiError),

    #[error("slice length {len} exceeds limit {max}")]
    SliceTooLong { len: u32, max: usize },

    #[error("expected {expected} scalar, got {actual}")]
    ScalarMismatch { expected: ScalarType, actual: String },

    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("type {0} cannot cross the boundary as a scalar")]
    UnsupportedType(String),

    #[error("guest allocation {ptr:#x} is not {align}-byte aligned")]
    Misaligned { ptr: u32, align: usize },

    #[error("host heap exhausted")]
    HeapExhausted,

    #[error("unknown heap token {0:#x}")]
    UnknownToken(u32),

    #[error("stale heap token {0:?}")]
    StaleToken(Token),
}

/// Host-side misuse of an opaque resource handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceMisuse {
    #[error("{class} handle {ptr:#x} already freed")]
    DoubleFree { class: &'static str, ptr: u32 },

    #[error("{class} handle {ptr:#x} used after free")]
    UseAfterFree { class: &'static str, ptr: u32 },

    #[error("{class} handle {ptr:#x} belongs to another instance")]
    ForeignHandle { class: &'static str, ptr: u32 },

    #[error("{class} handle is null")]
    NullHandle { class: &'static str },

    #[error("{class} handle {ptr:#x} is already owned by the host")]
    AlreadyWrapped { class: &'static str, ptr: u32 },
}
