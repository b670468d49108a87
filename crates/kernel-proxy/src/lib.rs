//! kernel-proxy - the narrow contract between the notebook editor and a
//! Jupyter kernel.
//!
//! The editor never talks to ZeroMQ sockets directly. It holds a
//! [`KernelService`] and asks it to run source text, interrupt, restart or
//! shut down. Results come back as nbformat output records (plain JSON) so
//! the editor can parse them into its own cell output model.
//!
//! Two implementations ship with the crate:
//! - [`JupyterKernel`]: launches a kernel from a kernelspec via `runtimelib`
//! - [`Disconnected`]: stands in when no kernel was started; every call
//!   reports [`KernelError::Unavailable`]

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

mod content;
mod jupyter;

pub use content::{flatten_to_strings, message_content_to_nbformat};
pub use jupyter::{JupyterKernel, KernelConfig};

/// Errors surfaced by a kernel service.
///
/// None of these are fatal to an editing session: the editor turns them into
/// a user-visible notice and leaves the target cell idle.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KernelError {
    /// The kernel was never started, could not be reached, or timed out.
    #[error("kernel unavailable: {0}")]
    Unavailable(String),

    /// The request was abandoned because the kernel restarted or shut down.
    #[error("execution cancelled")]
    Cancelled,

    /// The kernel answered with something we could not make sense of.
    #[error("kernel protocol error: {0}")]
    Protocol(String),
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Unavailable(err.to_string())
    }
}

/// Result of a single `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    /// nbformat output records in the order the kernel emitted them.
    pub outputs: Vec<serde_json::Value>,
    pub execution_count: Option<i64>,
}

/// Flat description of a kernel, written into notebook metadata on save.
///
/// Each map is empty when the kernel could not be asked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescription {
    pub kernel_info: BTreeMap<String, String>,
    pub kernel_spec: BTreeMap<String, String>,
    pub language_info: BTreeMap<String, String>,
}

/// The kernel execution contract consumed by the editor.
///
/// Implementations must allow at most one in-flight `run` at a time, and
/// `interrupt`/`restart` must be callable while a `run` is pending.
/// A `run` pending across a `restart` resolves with [`KernelError::Cancelled`].
pub trait KernelService: Send + Sync {
    fn run<'a>(&'a self, source: &'a str) -> BoxFuture<'a, Result<ExecuteReply, KernelError>>;

    fn interrupt(&self) -> BoxFuture<'_, Result<(), KernelError>>;

    fn restart(&self) -> BoxFuture<'_, Result<(), KernelError>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<(), KernelError>>;

    fn describe(&self) -> KernelDescription;

    /// Whether a kernel is attached at all. Callers check this before
    /// marking a cell as running.
    fn is_available(&self) -> bool {
        true
    }
}

/// A service with no kernel behind it.
#[derive(Debug, Clone, Default)]
pub struct Disconnected;

impl KernelService for Disconnected {
    fn run<'a>(&'a self, _source: &'a str) -> BoxFuture<'a, Result<ExecuteReply, KernelError>> {
        Box::pin(async { Err(not_started()) })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(async { Err(not_started()) })
    }

    fn restart(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(async { Err(not_started()) })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), KernelError>> {
        Box::pin(async { Ok(()) })
    }

    fn describe(&self) -> KernelDescription {
        KernelDescription::default()
    }

    fn is_available(&self) -> bool {
        false
    }
}

fn not_started() -> KernelError {
    KernelError::Unavailable("no kernel available for notebook".to_string())
}
