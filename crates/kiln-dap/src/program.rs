//! Lowering of the operation DAG into a linear, steppable program.
//!
//! The graph is reshaped so every step has a single forward direction
//! (`next`, the direct-parent chain), a way into side dependencies (`into`,
//! one sub-branch per non-parent input), and an escape (`out`, the step
//! whose input the current branch feeds). Sub-branches end in a synthesised
//! return point that rejoins the enclosing branch, giving "after last op"
//! pause semantics before control re-enters the parent chain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use kiln_llb::{
    validate_acyclic, Digest, DefinitionError, Graph, Op, OpKind, OpMetadata, Range,
    Source as GraphSource,
};

use crate::ids::IdPool;

pub type StepId = usize;

// ── Frame ────────────────────────────────────────────────────────────────────

/// A stack entry synthesised from one operation.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Unique across the program; allocated from the adapter's id pool.
    pub id: i64,
    pub name: String,
    /// Workspace-joined source path, when the operation has a location.
    pub path: Option<String>,
    pub range: Option<Range>,
    /// Backing operation, for variable scopes.
    pub digest: Option<Digest>,
}

// ── Step ─────────────────────────────────────────────────────────────────────

/// Node of the linear program. `None` targets are the distinguished program
/// end.
#[derive(Debug, Clone)]
pub struct Step {
    /// Digest armed by arriving at this step; `None` for return points.
    pub digest: Option<Digest>,
    /// Step-Over target: the direct-parent chain.
    pub next: Option<StepId>,
    /// Step-In target: the first sub-branch, or the `next` target when the
    /// operation has no side inputs.
    pub into: Option<StepId>,
    /// Step-Out target: the enclosing step of this branch.
    pub out: Option<StepId>,
    /// Frame shown while paused here.
    pub frame: i64,
    /// Index of the direct-parent input, when the operation has one.
    pub parent: Option<usize>,
}

// ── Program ──────────────────────────────────────────────────────────────────

/// The linked-step lowering of one definition.
#[derive(Debug, Default)]
pub struct Program {
    steps: Vec<Step>,
    entry: Option<StepId>,
    frames: HashMap<i64, Frame>,
    by_digest: HashMap<Digest, StepId>,
}

impl Program {
    pub fn entry(&self) -> Option<StepId> {
        self.entry
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id]
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn frame(&self, id: i64) -> Option<&Frame> {
        self.frames.get(&id)
    }

    pub fn has_frame(&self, id: i64) -> bool {
        self.frames.contains_key(&id)
    }

    pub fn step_by_digest(&self, digest: &Digest) -> Option<StepId> {
        self.by_digest.get(digest).copied()
    }

    /// Frames from `from` outward, innermost first.
    pub fn stack(&self, from: StepId) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let step = &self.steps[id];
            if let Some(frame) = self.frames.get(&step.frame) {
                frames.push(frame.clone());
            }
            cursor = step.out;
        }
        frames
    }

    /// Steps strictly after `from` in depth-first order (the `into` chain).
    pub fn scan_into(&self, from: StepId) -> IntoChain<'_> {
        IntoChain {
            program: self,
            cursor: self.steps[from].into,
            hops: 0,
        }
    }
}

/// Iterator over the `into` chain. Bounded by the program size; the builder
/// guarantees the chain is acyclic.
pub struct IntoChain<'a> {
    program: &'a Program,
    cursor: Option<StepId>,
    hops: usize,
}

impl Iterator for IntoChain<'_> {
    type Item = StepId;

    fn next(&mut self) -> Option<StepId> {
        let id = self.cursor?;
        self.hops += 1;
        if self.hops > self.program.steps.len() {
            return None;
        }
        self.cursor = self.program.steps[id].into;
        Some(id)
    }
}

// ── Direct parent ────────────────────────────────────────────────────────────

/// Index of an operation's direct-parent input: the chain this operation
/// continues.
pub fn parent_input(op: &Op) -> Option<usize> {
    match &op.kind {
        OpKind::Generic => {
            if op.inputs.is_empty() {
                None
            } else {
                Some(0)
            }
        }
        // The root mount names the filesystem the command runs against.
        OpKind::Exec(exec) => exec
            .mounts
            .iter()
            .find(|m| m.dest == "/")
            .and_then(|m| usize::try_from(m.input).ok())
            .filter(|&i| i < op.inputs.len()),
        // The first action that reads an input continues that input's chain.
        OpKind::File(file) => file
            .actions
            .iter()
            .find_map(|a| usize::try_from(a.input).ok().filter(|&i| i < op.inputs.len())),
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Lower `graph` into a program. Frames are unique per digest; acyclicity of
/// the input graph is asserted before construction.
pub fn build(
    graph: &Graph,
    source: &GraphSource,
    metadata: &BTreeMap<Digest, OpMetadata>,
    root: &Path,
    ids: &IdPool,
) -> Result<Program, DefinitionError> {
    validate_acyclic(&graph.ops, &graph.head)?;

    let mut builder = Builder {
        ops: &graph.ops,
        source,
        metadata,
        root,
        ids,
        steps: Vec::new(),
        frames: HashMap::new(),
        by_digest: HashMap::new(),
        visited: HashSet::new(),
    };
    let entry = builder.branch(graph.head.clone(), None, None, false);

    Ok(Program {
        steps: builder.steps,
        entry,
        frames: builder.frames,
        by_digest: builder.by_digest,
    })
}

struct Builder<'a> {
    ops: &'a HashMap<Digest, Op>,
    source: &'a GraphSource,
    metadata: &'a BTreeMap<Digest, OpMetadata>,
    root: &'a Path,
    ids: &'a IdPool,
    steps: Vec<Step>,
    frames: HashMap<i64, Frame>,
    by_digest: HashMap<Digest, StepId>,
    visited: HashSet<Digest>,
}

impl Builder<'_> {
    /// Build the branch rooted at `head`: walk the direct-parent chain, then
    /// attach sub-branches for every side input. `out` is the enclosing
    /// step; `rejoin` is where the branch's return point re-enters the
    /// enclosing branch; `synth_return` is false only for the top-level
    /// branch, which ends at the program end instead.
    fn branch(
        &mut self,
        head: Digest,
        out: Option<StepId>,
        rejoin: Option<StepId>,
        synth_return: bool,
    ) -> Option<StepId> {
        // Pass 1: the direct-parent chain. Digests already placed elsewhere
        // in the program are not revisited, which also covers inputs that
        // reference the program head.
        let mut chain: Vec<StepId> = Vec::new();
        let mut cursor = Some(head);
        while let Some(digest) = cursor {
            if !self.visited.insert(digest.clone()) {
                break;
            }
            let Some(op) = self.ops.get(&digest).cloned() else {
                break;
            };
            let parent = parent_input(&op);
            let frame = self.new_frame(&digest);
            let id = self.steps.len();
            self.steps.push(Step {
                digest: Some(digest.clone()),
                next: None,
                into: None,
                out,
                frame,
                parent,
            });
            self.by_digest.insert(digest, id);
            chain.push(id);
            cursor = parent
                .and_then(|p| op.inputs.get(p))
                .map(|input| input.digest.clone());
        }

        let Some(&entry) = chain.first() else {
            return None;
        };

        // Pass 2: the return point. Sub-branches pause once more after
        // their last operation before re-entering the enclosing branch; the
        // top-level branch ends at the distinguished nil target.
        let mut tail = None;
        if synth_return {
            let last = *chain.last().unwrap_or(&entry);
            let frame = self.return_frame(self.steps[last].frame);
            let id = self.steps.len();
            self.steps.push(Step {
                digest: None,
                next: rejoin,
                into: rejoin,
                out: rejoin,
                frame,
                parent: None,
            });
            tail = Some(id);
        }

        for pair in chain.windows(2) {
            self.steps[pair[0]].next = Some(pair[1]);
        }
        if let Some(&last) = chain.last() {
            self.steps[last].next = tail;
        }

        // Sub-branches. Side inputs are processed in reverse declaration
        // order so each branch's return point rejoins the next declared
        // input's branch, and the step's `into` lands on the first declared
        // one. With no side inputs, Step-In behaves as Step-Over.
        for &sid in &chain {
            let Some(digest) = self.steps[sid].digest.clone() else {
                continue;
            };
            let Some(op) = self.ops.get(&digest).cloned() else {
                continue;
            };
            let parent = self.steps[sid].parent;
            let mut target = self.steps[sid].next;
            for (idx, input) in op.inputs.iter().enumerate().rev() {
                if Some(idx) == parent {
                    continue;
                }
                if let Some(entry) =
                    self.branch(input.digest.clone(), Some(sid), target, true)
                {
                    target = Some(entry);
                }
            }
            self.steps[sid].into = target;
        }

        Some(entry)
    }

    fn new_frame(&mut self, digest: &Digest) -> i64 {
        let id = self.ids.next();
        let name = self.display_name(digest);
        let (path, range) = self.location(digest);
        self.frames.insert(
            id,
            Frame {
                id,
                name,
                path,
                range,
                digest: Some(digest.clone()),
            },
        );
        id
    }

    /// A fresh frame sharing the last step's display info, backing the
    /// synthesised return point.
    fn return_frame(&mut self, like: i64) -> i64 {
        let id = self.ids.next();
        let template = self.frames.get(&like).cloned();
        let frame = match template {
            Some(f) => Frame { id, ..f },
            None => Frame {
                id,
                name: String::new(),
                path: None,
                range: None,
                digest: None,
            },
        };
        self.frames.insert(id, frame);
        id
    }

    fn location(&self, digest: &Digest) -> (Option<String>, Option<Range>) {
        let Some(locations) = self.source.locations.get(digest) else {
            return (None, None);
        };
        let Some(location) = locations.first() else {
            return (None, None);
        };
        let path = self
            .root
            .join(&location.filename)
            .to_string_lossy()
            .into_owned();
        (Some(path), location.ranges.first().copied())
    }

    fn display_name(&self, digest: &Digest) -> String {
        if let Some(meta) = self.metadata.get(digest) {
            if let Some(name) = meta.description.get("customname") {
                return name.clone();
            }
            if let Some(command) = meta.description.get("command") {
                return command.clone();
            }
        }
        match self.ops.get(digest).map(|op| &op.kind) {
            Some(OpKind::Exec(exec)) if !exec.meta.args.is_empty() => {
                exec.meta.args.join(" ")
            }
            Some(OpKind::File(file)) => file
                .actions
                .first()
                .map(|a| format!("{} {}", a.kind, a.path))
                .unwrap_or_else(|| "file".to_owned()),
            _ => digest.short().to_owned(),
        }
    }
}
