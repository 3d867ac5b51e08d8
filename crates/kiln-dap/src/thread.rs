//! Per-thread evaluation driver.
//!
//! Each top-level build output becomes one thread. The driver walks the
//! linear program, pausing on breakpoints, step completions, and solve
//! errors, and advances by solving the next target through the engine.
//! Pause and resume meet at a one-shot rendezvous: a fresh capacity-1
//! channel per pause, closed by the resuming side with the chosen action.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kiln_llb::{
    Client, Definition, Digest, Op, OpKind, ResultHandle, SolveError, SolveRequest,
};

use crate::breakpoints::Breakpoints;
use crate::error::AdapterError;
use crate::ids::IdPool;
use crate::program::{self, Program, StepId};
use crate::protocol::events::stop_reason;
use crate::protocol::{
    ContinuedEventBody, Event, OutputEventBody, Scope, Source, StackFrame, StoppedEventBody,
    Variable,
};
use crate::server::EventSink;
use crate::shell::Shell;
use crate::sources::SourceMap;
use crate::variables::VariableRefs;

// ── Actions ──────────────────────────────────────────────────────────────────

/// What a paused thread does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Continue,
    Next,
    StepIn,
    StepOut,
}

// ── Pause bookkeeping ────────────────────────────────────────────────────────

struct PauseState {
    tx: mpsc::Sender<StepKind>,
    stack: Vec<StackFrame>,
    handle: Option<Arc<dyn ResultHandle>>,
    attach_cancel: CancellationToken,
}

enum PauseKind {
    Step,
    Breakpoint(i64),
    Exception(String),
}

// ── Thread ───────────────────────────────────────────────────────────────────

/// Construction inputs for a thread; the shared state comes from the
/// adapter.
pub struct ThreadOptions {
    pub id: i64,
    pub name: String,
    pub client: Arc<dyn Client>,
    pub def: Definition,
    pub breakpoints: Arc<Breakpoints>,
    pub sources: Arc<SourceMap>,
    pub ids: Arc<IdPool>,
    pub shell: Option<Arc<Shell>>,
    pub sink: EventSink,
    pub root: PathBuf,
    pub cancel: CancellationToken,
}

pub struct Thread {
    pub id: i64,
    pub name: String,
    client: Arc<dyn Client>,
    def: Definition,
    ops: HashMap<Digest, Op>,
    program: Program,
    breakpoints: Arc<Breakpoints>,
    sources: Arc<SourceMap>,
    shell: Option<Arc<Shell>>,
    sink: EventSink,
    root: PathBuf,
    cancel: CancellationToken,
    refs: VariableRefs,
    armed: Mutex<HashMap<Digest, i64>>,
    paused: Mutex<Option<PauseState>>,
    scopes: Mutex<HashMap<i64, Vec<Scope>>>,
}

impl Thread {
    /// Decode the definition and lower it; fails fast on malformed graphs.
    pub fn new(opts: ThreadOptions) -> Result<Arc<Thread>, AdapterError> {
        let graph = opts.def.load()?;
        let program = program::build(
            &graph,
            &opts.def.source,
            &opts.def.metadata,
            &opts.root,
            &opts.ids,
        )?;
        Ok(Arc::new(Thread {
            id: opts.id,
            name: opts.name,
            client: opts.client,
            def: opts.def,
            ops: graph.ops,
            program,
            breakpoints: opts.breakpoints,
            sources: opts.sources,
            shell: opts.shell,
            sink: opts.sink,
            root: opts.root,
            cancel: opts.cancel,
            refs: VariableRefs::new(),
            armed: Mutex::new(HashMap::new()),
            paused: Mutex::new(None),
            scopes: Mutex::new(HashMap::new()),
        }))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    // ── Driver ───────────────────────────────────────────────────────────────

    /// Drive the program to completion. Returns when the program runs off
    /// its end, the session is cancelled, or an unattributable solve error
    /// occurs.
    pub async fn run(self: &Arc<Self>, stop_on_entry: bool) {
        for info in &self.def.source.infos {
            let path = self.root.join(&info.filename);
            self.sources.put(&path.to_string_lossy(), &info.data);
        }

        let mut action = if stop_on_entry {
            StepKind::Next
        } else {
            StepKind::Continue
        };
        let mut cursor = self.program.entry();
        let mut error: Option<SolveError> = None;
        let mut handle: Option<Arc<dyn ResultHandle>> = None;

        while let Some(step_id) = cursor {
            if self.cancel.is_cancelled() {
                return;
            }
            let kind = self.pause_kind(step_id, action, error.take());
            if let Some(kind) = kind {
                match self.pause(step_id, kind, handle.take()).await {
                    Some(next) => action = next,
                    None => return,
                }
            }

            // New breakpoints apply on the next continue.
            if action == StepKind::Continue {
                self.refresh_breakpoints();
            }

            let step = self.program.step(step_id);
            let target = match action {
                StepKind::Next => step.next,
                StepKind::StepIn => step.into,
                StepKind::StepOut => step.out,
                StepKind::Continue => self.continue_target(step_id),
            };

            match target {
                Some(t) => match self.program.step(t).digest.clone() {
                    Some(digest) => {
                        let (new_handle, result) = self.seek(Some(&digest)).await;
                        handle = new_handle;
                        match result {
                            Ok(()) => cursor = Some(t),
                            Err(err) => match self.rewind(&err) {
                                Some(at) => {
                                    debug!(thread = self.id, error = %err, "parked at failing step");
                                    cursor = Some(at);
                                    error = Some(err);
                                }
                                None => {
                                    self.report(&err);
                                    return;
                                }
                            },
                        }
                    }
                    // Return points have nothing to solve; the pause there
                    // shows the "after last op" position.
                    None => {
                        handle = None;
                        cursor = Some(t);
                    }
                },
                // Run to completion solves the original head; a plain step
                // off the end finishes the thread.
                None if action == StepKind::Continue => {
                    let (new_handle, result) = self.seek(None).await;
                    handle = new_handle;
                    match result {
                        Ok(()) => return,
                        Err(err) => match self.rewind(&err) {
                            Some(at) => {
                                debug!(thread = self.id, error = %err, "parked at failing step");
                                cursor = Some(at);
                                error = Some(err);
                            }
                            None => {
                                self.report(&err);
                                return;
                            }
                        },
                    }
                }
                None => return,
            }
        }
    }

    fn report(&self, err: &SolveError) {
        self.sink.event(Event::new(
            "output",
            OutputEventBody::stderr(format!("{err}\n")),
        ));
    }

    fn pause_kind(
        &self,
        step_id: StepId,
        action: StepKind,
        error: Option<SolveError>,
    ) -> Option<PauseKind> {
        if let Some(err) = error {
            return Some(PauseKind::Exception(err.message));
        }
        if action != StepKind::Continue {
            return Some(PauseKind::Step);
        }
        let step = self.program.step(step_id);
        let digest = step.digest.as_ref()?;
        let armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        armed.get(digest).copied().map(PauseKind::Breakpoint)
    }

    /// Park until the client chooses the next action, or until session
    /// cancellation. Returns `None` when cancelled.
    async fn pause(
        &self,
        at: StepId,
        kind: PauseKind,
        handle: Option<Arc<dyn ResultHandle>>,
    ) -> Option<StepKind> {
        let (tx, mut rx) = mpsc::channel(1);
        let attach_cancel = self.cancel.child_token();
        let stack = self.build_stack(at);
        {
            let mut paused = self.paused.lock().unwrap_or_else(|e| e.into_inner());
            *paused = Some(PauseState {
                tx,
                stack,
                handle: handle.clone(),
                attach_cancel: attach_cancel.clone(),
            });
        }

        let (reason, description, hits) = match kind {
            PauseKind::Step => (stop_reason::STEP, None, Vec::new()),
            PauseKind::Breakpoint(id) => (stop_reason::BREAKPOINT, None, vec![id]),
            PauseKind::Exception(message) => (stop_reason::EXCEPTION, Some(message), Vec::new()),
        };
        self.sink.event(Event::new(
            "stopped",
            StoppedEventBody {
                reason: reason.into(),
                description,
                thread_id: self.id,
                hit_breakpoint_ids: hits,
            },
        ));

        if let (Some(shell), Some(handle)) = (&self.shell, handle) {
            let shell = shell.clone();
            let cancel = attach_cancel.clone();
            let line = self.frame_line(at);
            tokio::spawn(async move {
                if let Err(err) = shell.attach(cancel, handle, line).await {
                    debug!(error = %err, "shell attach ended");
                }
            });
        }

        let action = tokio::select! {
            _ = self.cancel.cancelled() => None,
            action = rx.recv() => action,
        };

        // The cancellation path still owns the pause state; release it.
        let leftover = self
            .paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(state) = leftover {
            state.attach_cancel.cancel();
            if let Some(handle) = state.handle {
                handle.done().await;
            }
        }

        self.refs.reset();
        self.scopes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        action
    }

    /// Wake the paused driver with the chosen action. Returns false when the
    /// thread was not paused.
    pub async fn resume(&self, kind: StepKind) -> bool {
        let state = self
            .paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(state) = state else {
            return false;
        };
        state.attach_cancel.cancel();
        if let Some(handle) = state.handle {
            handle.done().await;
        }
        let _ = state.tx.try_send(kind);
        self.sink.event(Event::new(
            "continued",
            ContinuedEventBody {
                thread_id: self.id,
                all_threads_continued: false,
            },
        ));
        true
    }

    // ── Seek ─────────────────────────────────────────────────────────────────

    /// Solve up to `target` (the original head when `None`) and evaluate.
    /// The handle is produced even for failed evaluations: it exposes the
    /// failed state for shell attach.
    async fn seek(
        &self,
        target: Option<&Digest>,
    ) -> (Option<Arc<dyn ResultHandle>>, Result<(), SolveError>) {
        let def = match target {
            Some(digest) => match self.def.for_target(digest) {
                Ok(def) => def,
                Err(err) => return (None, Err(SolveError::new(err.to_string()))),
            },
            None => self.def.clone(),
        };

        let result = match self.client.solve(SolveRequest { definition: def }).await {
            Ok(result) => result,
            Err(err) => return (None, Err(err)),
        };
        let Some(named) = result.refs.into_iter().next() else {
            return (None, Err(SolveError::new("solve returned no references")));
        };
        let outcome = named.reference.evaluate().await;
        (Some(named.reference.result_handle()), outcome)
    }

    /// Find the step to park at for a solve error: the step whose digest
    /// matches the failing operation, also trying the platform-stripped
    /// variant recorded for file operations.
    fn rewind(&self, err: &SolveError) -> Option<StepId> {
        let op = err.op.as_ref()?;
        self.program
            .step_by_digest(&op.digest())
            .or_else(|| match op.kind {
                OpKind::File(_) => self.program.step_by_digest(&op.strip_platform().digest()),
                _ => None,
            })
    }

    // ── Breakpoints ──────────────────────────────────────────────────────────

    fn refresh_breakpoints(&self) {
        let armed = self.breakpoints.intersect(&self.def.source, &self.root);
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = armed;
    }

    /// The first step strictly after `from` in depth-first order whose
    /// digest has a breakpoint armed. `None` means run to completion.
    fn continue_target(&self, from: StepId) -> Option<StepId> {
        let armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        self.program.scan_into(from).find(|&id| {
            self.program
                .step(id)
                .digest
                .as_ref()
                .is_some_and(|digest| armed.contains_key(digest))
        })
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// The current stack trace, innermost frame first. Empty while running.
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        self.paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.stack.clone())
            .unwrap_or_default()
    }

    pub fn has_frame(&self, frame_id: i64) -> bool {
        self.program.has_frame(frame_id)
    }

    /// Scopes for a frame, created lazily and cached until resume. Empty
    /// while running.
    pub fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, AdapterError> {
        if self
            .paused
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Ok(Vec::new());
        }
        let Some(frame) = self.program.frame(frame_id) else {
            return Err(AdapterError::UnknownFrame(frame_id));
        };

        let mut cache = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(&frame_id) {
            return Ok(cached.clone());
        }

        let op = frame
            .digest
            .as_ref()
            .and_then(|digest| self.ops.get(digest))
            .cloned();

        let mut scopes = Vec::new();
        let args_op = op.clone();
        scopes.push(Scope {
            name: "Arguments".into(),
            variables_reference: self.refs.alloc(move || argument_variables(args_op.as_ref())),
            expensive: false,
        });
        if let Some(op) = &op {
            if let OpKind::Exec(exec) = &op.kind {
                if !exec.mounts.is_empty() {
                    let mounts = exec.mounts.clone();
                    scopes.push(Scope {
                        name: "Mounts".into(),
                        variables_reference: self
                            .refs
                            .alloc(move || mount_variables(&mounts)),
                        expensive: false,
                    });
                }
            }
        }

        cache.insert(frame_id, scopes.clone());
        Ok(scopes)
    }

    /// Resolve a thread-local variables reference.
    pub fn variables(&self, local_ref: i64) -> Vec<Variable> {
        self.refs.get(local_ref)
    }

    fn build_stack(&self, at: StepId) -> Vec<StackFrame> {
        self.program
            .stack(at)
            .into_iter()
            .map(|frame| StackFrame {
                id: frame.id,
                name: frame.name,
                source: frame.path.map(Source::for_path),
                line: frame.range.map(|r| r.start.line).unwrap_or(0),
                column: frame.range.map(|r| r.start.col).unwrap_or(0),
                end_line: frame.range.map(|r| r.end.line),
                end_column: frame.range.map(|r| r.end.col),
            })
            .collect()
    }

    fn frame_line(&self, at: StepId) -> i64 {
        let frame_id = self.program.step(at).frame;
        self.program
            .frame(frame_id)
            .and_then(|f| f.range)
            .map(|r| r.start.line)
            .unwrap_or(0)
    }
}

// ── Scope contents ───────────────────────────────────────────────────────────

fn argument_variables(op: Option<&Op>) -> Vec<Variable> {
    let Some(op) = op else {
        return Vec::new();
    };
    let mut vars = Vec::new();
    if let Some(platform) = &op.platform {
        vars.push(Variable::new(
            "platform",
            format!("{}/{}", platform.os, platform.architecture),
        ));
    }
    match &op.kind {
        OpKind::Exec(exec) => {
            vars.push(Variable::new("args", exec.meta.args.join(" ")));
            for entry in &exec.meta.env {
                match entry.split_once('=') {
                    Some((key, value)) => vars.push(Variable::new(key, value)),
                    None => vars.push(Variable::new(entry.clone(), "")),
                }
            }
            if let Some(cwd) = &exec.meta.cwd {
                vars.push(Variable::new("workdir", cwd.clone()));
            }
            if let Some(user) = &exec.meta.user {
                vars.push(Variable::new("user", user.clone()));
            }
        }
        OpKind::File(file) => {
            for (i, action) in file.actions.iter().enumerate() {
                vars.push(Variable::new(
                    format!("action[{i}]"),
                    format!("{} {}", action.kind, action.path),
                ));
            }
        }
        OpKind::Generic => {}
    }
    vars
}

fn mount_variables(mounts: &[kiln_llb::Mount]) -> Vec<Variable> {
    mounts
        .iter()
        .map(|mount| {
            let value = if mount.input < 0 {
                "scratch".to_owned()
            } else {
                format!("input {}", mount.input)
            };
            Variable::new(mount.dest.clone(), value)
        })
        .collect()
}
