//! Module sources and the initialization state machine
//!
//! `init_sync` accepts only sources that are already in memory. `init`
//! additionally accepts paths, URLs, HTTP requests and responses, and
//! arbitrary futures that eventually produce one of those. All of these are
//! reduced to a [`SyncInitInput`] before the shared instantiation path runs,
//! so the two entry points cannot drift apart.

use crate::error::InitError;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::Module;

/// Where an initialization attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    Unloaded,
    Compiling,
    Instantiated,
    Ready,
    Failed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid init transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: InitState,
    pub to: InitState,
}

impl InitState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: InitState) -> bool {
        use InitState::*;
        matches!(
            (self, next),
            (Unloaded, Compiling)
                | (Compiling, Instantiated)
                | (Instantiated, Ready)
                | (Compiling, Failed)
                | (Instantiated, Failed)
        )
    }

    pub fn transition(self, next: InitState) -> Result<InitState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InitState::Ready | InitState::Failed)
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitState::Unloaded => "unloaded",
            InitState::Compiling => "compiling",
            InitState::Instantiated => "instantiated",
            InitState::Ready => "ready",
            InitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one initialization attempt through [`InitState`].
#[derive(Debug)]
pub(crate) struct Attempt {
    state: InitState,
}

impl Attempt {
    pub(crate) fn new() -> Self {
        Self {
            state: InitState::Unloaded,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> InitState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: InitState) -> Result<(), InitError> {
        let from = self.state;
        self.state = from
            .transition(next)
            .map_err(|e| InitError::Engine(e.to_string()))?;
        debug!(%from, to = %next, "init transition");
        Ok(())
    }

    /// Record a failure. Errors raised before compilation started leave the
    /// attempt unloaded.
    pub(crate) fn fail(&mut self, error: &InitError) {
        if self.state.can_transition_to(InitState::Failed) {
            debug!(from = %self.state, error = %error, "init failed");
            self.state = InitState::Failed;
        }
    }
}

/// A module source that needs no I/O.
#[derive(Debug, Clone)]
pub enum SyncInitInput {
    /// Raw wasm bytes (or WAT text).
    Bytes(Vec<u8>),
    /// A module compiled on the same engine.
    Module(Module),
}

impl From<Vec<u8>> for SyncInitInput {
    fn from(bytes: Vec<u8>) -> Self {
        SyncInitInput::Bytes(bytes)
    }
}

impl From<&[u8]> for SyncInitInput {
    fn from(bytes: &[u8]) -> Self {
        SyncInitInput::Bytes(bytes.to_vec())
    }
}

impl From<Module> for SyncInitInput {
    fn from(module: Module) -> Self {
        SyncInitInput::Module(module)
    }
}

pub type PendingInput = Pin<Box<dyn Future<Output = Result<InitInput, InitError>> + Send + 'static>>;

/// Any module source accepted by the async entry point.
pub enum InitInput {
    Bytes(Vec<u8>),
    Module(Module),
    Path(PathBuf),
    /// `file:` and `http(s):` URLs.
    Url(reqwest::Url),
    Request(reqwest::Request),
    Response(reqwest::Response),
    /// A source that is not known yet.
    Pending(PendingInput),
}

impl InitInput {
    /// Wrap a future that produces a source. Its error is reported as
    /// [`InitError::Pending`].
    pub fn pending<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<InitInput, E>> + Send + 'static,
        E: fmt::Display,
    {
        InitInput::Pending(Box::pin(async move {
            future.await.map_err(|e| InitError::Pending(e.to_string()))
        }))
    }

    fn kind(&self) -> &'static str {
        match self {
            InitInput::Bytes(_) => "bytes",
            InitInput::Module(_) => "module",
            InitInput::Path(_) => "path",
            InitInput::Url(_) => "url",
            InitInput::Request(_) => "request",
            InitInput::Response(_) => "response",
            InitInput::Pending(_) => "pending",
        }
    }

    /// Reduce to an in-memory source. Each step performs at most one fetch
    /// or read; nothing is retried.
    pub(crate) async fn resolve(self, fetch_timeout: Duration) -> Result<SyncInitInput, InitError> {
        let mut input = self;
        loop {
            debug!(source = input.kind(), "resolving module source");
            input = match input {
                InitInput::Bytes(bytes) => return Ok(SyncInitInput::Bytes(bytes)),
                InitInput::Module(module) => return Ok(SyncInitInput::Module(module)),
                InitInput::Path(path) => return Ok(SyncInitInput::Bytes(tokio::fs::read(&path).await?)),
                InitInput::Url(url) => match url.scheme().to_string().as_str() {
                    "file" => url
                        .to_file_path()
                        .map(InitInput::Path)
                        .map_err(|()| InitError::Fetch(format!("not a local file URL: {url}")))?,
                    "http" | "https" => InitInput::Request(reqwest::Request::new(reqwest::Method::GET, url)),
                    other => return Err(InitError::Fetch(format!("unsupported URL scheme '{other}'"))),
                },
                InitInput::Request(request) => {
                    let client = reqwest::Client::builder()
                        .timeout(fetch_timeout)
                        .build()
                        .map_err(|e| InitError::Fetch(e.to_string()))?;
                    let response = client
                        .execute(request)
                        .await
                        .map_err(|e| InitError::Fetch(e.to_string()))?;
                    InitInput::Response(response)
                }
                InitInput::Response(response) => return read_response(response).await.map(SyncInitInput::Bytes),
                InitInput::Pending(future) => future.await?,
            };
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<Vec<u8>, InitError> {
    let response = response
        .error_for_status()
        .map_err(|e| InitError::Fetch(e.to_string()))?;

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/wasm") {
        warn!(
            url = %response.url(),
            content_type,
            "response is not application/wasm; compiling from bytes anyway"
        );
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| InitError::Fetch(e.to_string()))?;
    Ok(bytes.to_vec())
}

impl fmt::Debug for InitInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitInput::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            InitInput::Module(module) => f.debug_tuple("Module").field(module).finish(),
            InitInput::Path(path) => f.debug_tuple("Path").field(path).finish(),
            InitInput::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            InitInput::Request(request) => f.debug_tuple("Request").field(&request.url().as_str()).finish(),
            InitInput::Response(response) => f.debug_tuple("Response").field(&response.status()).finish(),
            InitInput::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl From<SyncInitInput> for InitInput {
    fn from(input: SyncInitInput) -> Self {
        match input {
            SyncInitInput::Bytes(bytes) => InitInput::Bytes(bytes),
            SyncInitInput::Module(module) => InitInput::Module(module),
        }
    }
}

impl From<Vec<u8>> for InitInput {
    fn from(bytes: Vec<u8>) -> Self {
        InitInput::Bytes(bytes)
    }
}

impl From<&[u8]> for InitInput {
    fn from(bytes: &[u8]) -> Self {
        InitInput::Bytes(bytes.to_vec())
    }
}

impl From<Module> for InitInput {
    fn from(module: Module) -> Self {
        InitInput::Module(module)
    }
}

impl From<PathBuf> for InitInput {
    fn from(path: PathBuf) -> Self {
        InitInput::Path(path)
    }
}

impl From<&Path> for InitInput {
    fn from(path: &Path) -> Self {
        InitInput::Path(path.to_path_buf())
    }
}

impl From<reqwest::Url> for InitInput {
    fn from(url: reqwest::Url) -> Self {
        InitInput::Url(url)
    }
}

impl From<reqwest::Request> for InitInput {
    fn from(request: reqwest::Request) -> Self {
        InitInput::Request(request)
    }
}

impl From<reqwest::Response> for InitInput {
    fn from(response: reqwest::Response) -> Self {
        InitInput::Response(response)
    }
}
