//! Build-graph operation payloads.
//!
//! An operation is a content-addressed node of the build DAG: an ordered list
//! of inputs (edges to other operations' outputs) plus a kind-specific
//! payload. The adapter never executes operations; it only inspects them to
//! synthesise frames, scopes, and stepping structure.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

// ── Input ────────────────────────────────────────────────────────────────────

/// Edge to another operation's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Digest of the referenced operation.
    pub digest: Digest,
    /// Output index of the referenced operation.
    pub index: u32,
}

impl Input {
    pub fn new(digest: Digest, index: u32) -> Self {
        Self { digest, index }
    }
}

// ── Platform ─────────────────────────────────────────────────────────────────

/// Target platform of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

// ── Exec ─────────────────────────────────────────────────────────────────────

/// A filesystem mount of an exec operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Index into the operation's inputs, or -1 for a scratch mount.
    pub input: i64,
    /// Mount destination inside the container.
    pub dest: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Process metadata of an exec operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMeta {
    pub args: Vec<String>,
    /// `KEY=VALUE` entries, as the engine carries them.
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Run a command against a set of mounted inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
    pub mounts: Vec<Mount>,
    pub meta: ExecMeta,
}

// ── File ─────────────────────────────────────────────────────────────────────

/// A single action of a file operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
    /// Index into the operation's inputs, or -1 when the action starts from
    /// an empty filesystem.
    pub input: i64,
    /// Action kind (`copy`, `mkdir`, `mkfile`, `rm`).
    pub kind: String,
    /// Primary path the action touches.
    pub path: String,
}

/// Apply a sequence of filesystem actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub actions: Vec<FileAction>,
}

// ── Op ───────────────────────────────────────────────────────────────────────

/// Kind-specific payload of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OpKind {
    /// Source fetches, merges, and other opaque nodes.
    Generic,
    Exec(ExecOp),
    File(FileOp),
}

/// One content-addressed node of the build DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub inputs: Vec<Input>,
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Op {
    pub fn generic(inputs: Vec<Input>) -> Self {
        Self {
            inputs,
            kind: OpKind::Generic,
            platform: None,
        }
    }

    pub fn exec(inputs: Vec<Input>, op: ExecOp) -> Self {
        Self {
            inputs,
            kind: OpKind::Exec(op),
            platform: None,
        }
    }

    pub fn file(inputs: Vec<Input>, op: FileOp) -> Self {
        Self {
            inputs,
            kind: OpKind::File(op),
            platform: None,
        }
    }

    /// Canonical payload bytes. Field order is fixed by the type definitions,
    /// so the encoding is deterministic.
    pub fn marshal(&self) -> Vec<u8> {
        // Serialization of these plain data types cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Content digest of the canonical payload.
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(&self.marshal())
    }

    /// The same operation without its platform constraint. File operations
    /// are recorded platform-stripped in some engine error paths, so digest
    /// lookups try both variants.
    pub fn strip_platform(&self) -> Op {
        let mut op = self.clone();
        op.platform = None;
        op
    }
}
