//! Engine client seams consumed by the debug adapter.
//!
//! The build engine itself lives outside this workspace; the adapter only
//! relies on the contracts below. Tests implement them with in-process
//! mocks, production embeds the real engine client.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::def::Definition;
use crate::op::Op;

// ── Errors ───────────────────────────────────────────────────────────────────

/// A failed solve. When the engine can attribute the failure to a single
/// operation it attaches that operation's payload.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SolveError {
    pub message: String,
    pub op: Option<Op>,
}

impl SolveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            op: None,
        }
    }

    pub fn for_op(message: impl Into<String>, op: Op) -> Self {
        Self {
            message: message.into(),
            op: Some(op),
        }
    }
}

// ── Solve ────────────────────────────────────────────────────────────────────

/// One-shot execution request: materialise the result of a definition.
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    pub definition: Definition,
}

/// A top-level output of a solve.
pub struct NamedRef {
    /// Display name of the output (platform suffix, target name, ...).
    pub name: String,
    pub reference: Arc<dyn Reference>,
}

/// Result of a solve: one reference per top-level output.
pub struct SolveResult {
    pub refs: Vec<NamedRef>,
}

#[async_trait]
pub trait Client: Send + Sync {
    async fn solve(&self, req: SolveRequest) -> Result<SolveResult, SolveError>;
}

/// A lazy result of a solve. `evaluate` forces it; `to_state` recovers the
/// graph behind it; `result_handle` exposes the produced (or failed)
/// filesystem state.
#[async_trait]
pub trait Reference: Send + Sync {
    fn to_state(&self) -> State;
    async fn evaluate(&self) -> Result<(), SolveError>;
    fn result_handle(&self) -> Arc<dyn ResultHandle>;
}

/// A graph state recovered from a reference.
#[derive(Debug, Clone)]
pub struct State {
    def: Definition,
}

impl State {
    pub fn new(def: Definition) -> Self {
        Self { def }
    }

    /// Marshal the state back into a definition.
    pub async fn marshal(&self) -> Result<Definition, SolveError> {
        Ok(self.def.clone())
    }
}

// ── Result handles ───────────────────────────────────────────────────────────

/// Stat options for [`ResultHandle::stat_file`].
#[derive(Debug, Clone, Default)]
pub struct StatConfig {
    pub follow_links: bool,
}

/// File metadata as the engine reports it (Unix mode bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
}

impl FileStat {
    const TYPE_MASK: u32 = 0o170000;
    const REGULAR: u32 = 0o100000;

    pub fn is_regular(&self) -> bool {
        self.mode & Self::TYPE_MASK == Self::REGULAR
    }

    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Container invocation settings.
#[derive(Debug, Clone, Default)]
pub struct InvokeConfig {
    pub entrypoint: Vec<String>,
    pub cwd: Option<String>,
    pub tty: bool,
}

/// Exec settings for a process inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub tty: bool,
}

/// Filesystem view produced by (or failed at) an operation.
#[async_trait]
pub trait ResultHandle: Send + Sync {
    async fn stat_file(&self, path: &str, cfg: StatConfig) -> Result<FileStat, SolveError>;
    async fn new_container(&self, cfg: InvokeConfig) -> Result<Box<dyn Container>, SolveError>;
    /// Release the handle. Idempotent.
    async fn done(&self);
}

/// A container created against a result handle. Exec borrows its stdio so
/// the caller keeps the streams after the process exits.
#[async_trait]
pub trait Container: Send + Sync {
    async fn exec(
        &self,
        cfg: ExecConfig,
        stdin: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), SolveError>;
    async fn release(&self);
}
