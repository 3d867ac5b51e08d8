//! Marshalled build-graph definitions.
//!
//! A definition is the wire form of a build graph: an ordered sequence of
//! canonical operation payloads (head last), per-file source contents, a
//! digest → source-location mapping, and per-digest description metadata.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;
use crate::op::Op;

// ── Source locations ─────────────────────────────────────────────────────────

/// A position in a source file. Lines are 1-based; columns are 0-based, the
/// way debug clients send them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: i64,
    pub col: i64,
}

/// An inclusive source range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: i64, start_col: i64, end_line: i64, end_col: i64) -> Self {
        Self {
            start: Position {
                line: start_line,
                col: start_col,
            },
            end: Position {
                line: end_line,
                col: end_col,
            },
        }
    }
}

/// Ranges an operation covers within one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Filename relative to the workspace root.
    pub filename: String,
    pub ranges: Vec<Range>,
}

/// Contents of one source file referenced by the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Per-file contents plus the digest → locations mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub infos: Vec<SourceInfo>,
    pub locations: BTreeMap<Digest, Vec<Location>>,
}

// ── Metadata ─────────────────────────────────────────────────────────────────

/// Free-form description attached to an operation. The keys `customname` and
/// `command` drive frame display names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMetadata {
    pub description: BTreeMap<String, String>,
}

impl OpMetadata {
    pub fn with_description<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            description: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition has no operations")]
    Empty,
    #[error("malformed operation payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("operation {op} references unknown input {input}")]
    MissingInput { op: Digest, input: Digest },
    #[error("definition contains a cycle through {0}")]
    Cyclic(Digest),
    #[error("unknown target {0}")]
    UnknownTarget(Digest),
}

// ── Definition ───────────────────────────────────────────────────────────────

/// The marshalled graph handed to the engine and back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Canonical operation payloads in dependency order, head last.
    pub ops: Vec<Vec<u8>>,
    pub source: Source,
    pub metadata: BTreeMap<Digest, OpMetadata>,
}

/// A decoded definition: the operation map plus the head digest.
#[derive(Debug, Clone)]
pub struct Graph {
    pub ops: HashMap<Digest, Op>,
    /// Digests in payload order (head last).
    pub order: Vec<Digest>,
    pub head: Digest,
}

impl Definition {
    /// Append an operation payload, returning its digest.
    pub fn push_op(&mut self, op: &Op) -> Digest {
        let payload = op.marshal();
        let digest = Digest::from_bytes(&payload);
        self.ops.push(payload);
        digest
    }

    /// Decode the payloads into an operation map and find the head.
    ///
    /// Validates that every input resolves and that the graph is acyclic;
    /// a malformed definition never reaches the program builder.
    pub fn load(&self) -> Result<Graph, DefinitionError> {
        if self.ops.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut ops = HashMap::new();
        let mut order = Vec::new();
        for payload in &self.ops {
            let op: Op = serde_json::from_slice(payload)?;
            let digest = Digest::from_bytes(payload);
            if ops.insert(digest.clone(), op).is_none() {
                order.push(digest);
            }
        }

        for (digest, op) in &ops {
            for input in &op.inputs {
                if !ops.contains_key(&input.digest) {
                    return Err(DefinitionError::MissingInput {
                        op: digest.clone(),
                        input: input.digest.clone(),
                    });
                }
            }
        }

        let head = order
            .last()
            .cloned()
            .ok_or(DefinitionError::Empty)?;
        validate_acyclic(&ops, &head)?;

        Ok(Graph {
            ops,
            order,
            head,
        })
    }

    /// A patched definition whose head is `target`: the target's transitive
    /// closure in the original payload order, with the target's payload last.
    pub fn for_target(&self, target: &Digest) -> Result<Definition, DefinitionError> {
        let graph = self.load()?;
        if !graph.ops.contains_key(target) {
            return Err(DefinitionError::UnknownTarget(target.clone()));
        }

        let mut reachable = HashSet::new();
        let mut stack = vec![target.clone()];
        while let Some(digest) = stack.pop() {
            if !reachable.insert(digest.clone()) {
                continue;
            }
            if let Some(op) = graph.ops.get(&digest) {
                for input in &op.inputs {
                    stack.push(input.digest.clone());
                }
            }
        }

        let mut ops = Vec::new();
        let mut target_payload = None;
        let mut seen = HashSet::new();
        for payload in &self.ops {
            let digest = Digest::from_bytes(payload);
            if digest == *target {
                target_payload = Some(payload.clone());
                continue;
            }
            if reachable.contains(&digest) && seen.insert(digest) {
                ops.push(payload.clone());
            }
        }
        // Head position: the target payload comes last.
        ops.extend(target_payload);

        Ok(Definition {
            ops,
            source: self.source.clone(),
            metadata: self.metadata.clone(),
        })
    }
}

/// Depth-first cycle check over the input edges. The program builder calls
/// this on externally-assembled operation maps before lowering them.
pub fn validate_acyclic(
    ops: &HashMap<Digest, Op>,
    head: &Digest,
) -> Result<(), DefinitionError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        digest: &Digest,
        ops: &HashMap<Digest, Op>,
        marks: &mut HashMap<Digest, Mark>,
    ) -> Result<(), DefinitionError> {
        match marks.get(digest) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(DefinitionError::Cyclic(digest.clone())),
            None => {}
        }
        marks.insert(digest.clone(), Mark::Visiting);
        if let Some(op) = ops.get(digest) {
            for input in &op.inputs {
                visit(&input.digest, ops, marks)?;
            }
        }
        marks.insert(digest.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for digest in ops.keys() {
        visit(digest, ops, &mut marks)?;
    }
    // The head check is redundant when every node is visited, but keeps the
    // error anchored at the head for single-chain graphs.
    visit(head, ops, &mut marks)
}
