//! The outer debug adapter.
//!
//! Owns the session server and all shared state, implements the handler
//! table, and runs the evaluate loop: one long-lived task that solves the
//! configured build and turns every top-level result into a thread. The
//! embedder supplies the engine client and the build request; everything
//! else arrives over the wire.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_llb::{Client, SolveRequest};

use crate::breakpoints::Breakpoints;
use crate::error::AdapterError;
use crate::ids::IdPool;
use crate::protocol::{
    AttachArguments, Capabilities, ConfigurationDoneArguments, ContinueArguments,
    ContinueResponseBody, DisconnectArguments, EvaluateArguments, EvaluateResponseBody, Event,
    InitializeArguments, LaunchArguments, NextArguments, OutputEventBody, Request,
    RestartArguments, RunInTerminalRequestArguments, ScopesArguments, ScopesResponseBody,
    SetBreakpointsArguments, SetBreakpointsResponseBody, SourceArguments, SourceResponseBody,
    StackTraceArguments, StackTraceResponseBody, StepInArguments, StepOutArguments,
    TerminateArguments, TerminatedEventBody, ThreadEventBody, ThreadsResponseBody,
    VariablesArguments, VariablesResponseBody,
};
use crate::server::{Handlers, Server};
use crate::shell::{Shell, ShellConfig};
use crate::sources::SourceMap;
use crate::thread::{StepKind, Thread, ThreadOptions};
use crate::variables::{compose_ref, split_ref, MAX_THREAD_ID};

// ── Configuration ────────────────────────────────────────────────────────────

/// Embedder-supplied settings.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    /// Workspace root client paths are resolved against.
    pub root: PathBuf,
    pub shell: ShellConfig,
}

/// The part of the launch body the adapter honours. Everything else in the
/// payload belongs to the embedder and is ignored here.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    #[serde(default)]
    pub stop_on_entry: bool,
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct Adapter {
    server: Arc<Server>,
    client: Arc<dyn Client>,
    build: SolveRequest,
    breakpoints: Arc<Breakpoints>,
    sources: Arc<SourceMap>,
    ids: Arc<IdPool>,
    shell: Arc<Shell>,
    threads: RwLock<HashMap<i64, Arc<Thread>>>,
    next_thread: AtomicI64,
    config: Mutex<Option<LaunchConfig>>,
    config_done: watch::Sender<bool>,
    launch_cancel: Mutex<CancellationToken>,
    root: PathBuf,
    weak: Weak<Adapter>,
}

impl Adapter {
    pub fn new(
        client: Arc<dyn Client>,
        build: SolveRequest,
        opts: AdapterOptions,
    ) -> Arc<Adapter> {
        let server = Arc::new(Server::new());
        let sink = server.sink();
        let (config_done, _) = watch::channel(false);
        let launch_cancel = server.cancellation().child_token();
        Arc::new_cyclic(|weak| Adapter {
            breakpoints: Arc::new(Breakpoints::new(sink.clone())),
            sources: Arc::new(SourceMap::new(sink)),
            ids: Arc::new(IdPool::new()),
            shell: Shell::new(opts.shell),
            threads: RwLock::new(HashMap::new()),
            next_thread: AtomicI64::new(1),
            config: Mutex::new(None),
            config_done,
            launch_cancel: Mutex::new(launch_cancel),
            root: opts.root,
            weak: weak.clone(),
            client,
            build,
            server,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn shell(&self) -> &Arc<Shell> {
        &self.shell
    }

    /// Serve one DAP session over a framed byte stream.
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<(), AdapterError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handlers: Arc<dyn Handlers> = self.clone();
        self.server.serve(reader, writer, handlers).await
    }

    /// Tear the session down: terminated event, thread cancellation, server
    /// stop.
    pub fn stop(&self) {
        self.server
            .sink()
            .event(Event::new("terminated", TerminatedEventBody::default()));
        self.cancel_launch();
        self.server.stop();
    }

    fn cancel_launch(&self) {
        let token = self
            .launch_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        token.cancel();
    }

    fn reset_launch_token(&self) -> CancellationToken {
        let fresh = self.server.cancellation().child_token();
        let mut slot = self.launch_cancel.lock().unwrap_or_else(|e| e.into_inner());
        slot.cancel();
        *slot = fresh.clone();
        fresh
    }

    fn find_thread(&self, id: i64) -> Result<Arc<Thread>, AdapterError> {
        self.threads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(AdapterError::UnknownThread(id))
    }

    fn thread_snapshot(&self) -> Vec<Arc<Thread>> {
        let mut threads: Vec<_> = self
            .threads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        threads.sort_by_key(|t| t.id);
        threads
    }

    fn start_session(&self, config: LaunchConfig) -> Result<(), AdapterError> {
        let adapter = self.weak.upgrade().ok_or(AdapterError::ServerStopped)?;
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
        let cancel = self.reset_launch_token();
        if !self.server.go(async move {
            adapter.evaluate_loop(config, cancel).await;
        }) {
            return Err(AdapterError::ServerStopped);
        }
        Ok(())
    }

    /// The evaluate loop: wait for configuration, solve the build, drive one
    /// thread per top-level result.
    async fn evaluate_loop(self: Arc<Self>, config: LaunchConfig, cancel: CancellationToken) {
        let sink = self.server.sink();

        let mut ready = self.config_done.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = ready.wait_for(|done| *done) => {
                if outcome.is_err() {
                    return;
                }
            }
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.client.solve(self.build.clone()) => result,
        };
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                sink.event(Event::new(
                    "output",
                    OutputEventBody::stderr(format!("build failed to start: {err}\n")),
                ));
                sink.event(Event::new("terminated", TerminatedEventBody::default()));
                return;
            }
        };

        for named in result.refs {
            if cancel.is_cancelled() {
                return;
            }
            let def = match named.reference.to_state().marshal().await {
                Ok(def) => def,
                Err(err) => {
                    sink.event(Event::new(
                        "output",
                        OutputEventBody::stderr(format!("marshal failed: {err}\n")),
                    ));
                    continue;
                }
            };

            let id = self.next_thread.fetch_add(1, Ordering::SeqCst);
            if id > MAX_THREAD_ID {
                warn!(thread = id, "thread id space exhausted, skipping result");
                continue;
            }
            let thread = match Thread::new(ThreadOptions {
                id,
                name: named.name.clone(),
                client: self.client.clone(),
                def,
                breakpoints: self.breakpoints.clone(),
                sources: self.sources.clone(),
                ids: self.ids.clone(),
                shell: Some(self.shell.clone()),
                sink: sink.clone(),
                root: self.root.clone(),
                cancel: cancel.child_token(),
            }) {
                Ok(thread) => thread,
                Err(err) => {
                    sink.event(Event::new(
                        "output",
                        OutputEventBody::stderr(format!("cannot debug {}: {err}\n", named.name)),
                    ));
                    continue;
                }
            };

            self.threads
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, thread.clone());
            sink.event(Event::new("thread", ThreadEventBody::started(id)));

            thread.run(config.stop_on_entry).await;

            sink.event(Event::new("thread", ThreadEventBody::exited(id)));
            self.threads
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        }

        if !cancel.is_cancelled() {
            sink.event(Event::new("terminated", TerminatedEventBody::default()));
        }
    }
}

// ── Handler table ────────────────────────────────────────────────────────────

#[async_trait]
impl Handlers for Adapter {
    async fn on_initialize(
        &self,
        args: InitializeArguments,
    ) -> Result<Capabilities, AdapterError> {
        debug!(client = ?args.client_id, "initialize");
        if args.supports_run_in_terminal_request {
            let server = Arc::downgrade(&self.server);
            self.shell.set_terminal_requester(Box::new(move |socket| {
                let Some(server) = server.upgrade() else {
                    return;
                };
                let args = RunInTerminalRequestArguments {
                    kind: Some("integrated".into()),
                    title: Some("kiln debug shell".into()),
                    cwd: String::new(),
                    args: vec![
                        "kiln".into(),
                        "dap".into(),
                        "attach".into(),
                        socket.display().to_string(),
                    ],
                    env: [("KILN_EXPERIMENTAL".to_owned(), "1".to_owned())]
                        .into_iter()
                        .collect(),
                };
                server.do_request(Request::new("runInTerminal", args), |resp| {
                    if !resp.success {
                        warn!(message = ?resp.message, "runInTerminal rejected by client");
                    }
                });
            }));
        }
        Ok(Capabilities {
            supports_configuration_done_request: true,
            supports_restart_request: true,
            support_terminate_debuggee: true,
        })
    }

    async fn on_launch(&self, args: LaunchArguments) -> Result<(), AdapterError> {
        let config: LaunchConfig = serde_json::from_value(args).unwrap_or_default();
        self.start_session(config)
    }

    async fn on_attach(&self, args: AttachArguments) -> Result<(), AdapterError> {
        self.on_launch(args).await
    }

    async fn on_disconnect(&self, _args: DisconnectArguments) -> Result<(), AdapterError> {
        self.stop();
        Ok(())
    }

    async fn on_terminate(&self, _args: TerminateArguments) -> Result<(), AdapterError> {
        self.stop();
        Ok(())
    }

    async fn on_restart(&self, _args: RestartArguments) -> Result<(), AdapterError> {
        let config = self
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or(AdapterError::NotLaunched)?;
        self.start_session(config)
    }

    async fn on_configuration_done(
        &self,
        _args: ConfigurationDoneArguments,
    ) -> Result<(), AdapterError> {
        self.config_done.send_replace(true);
        Ok(())
    }

    async fn on_continue(
        &self,
        args: ContinueArguments,
    ) -> Result<ContinueResponseBody, AdapterError> {
        let thread = self.find_thread(args.thread_id)?;
        thread.resume(StepKind::Continue).await;
        Ok(ContinueResponseBody {
            all_threads_continued: false,
        })
    }

    async fn on_next(&self, args: NextArguments) -> Result<(), AdapterError> {
        let thread = self.find_thread(args.thread_id)?;
        thread.resume(StepKind::Next).await;
        Ok(())
    }

    async fn on_step_in(&self, args: StepInArguments) -> Result<(), AdapterError> {
        let thread = self.find_thread(args.thread_id)?;
        thread.resume(StepKind::StepIn).await;
        Ok(())
    }

    async fn on_step_out(&self, args: StepOutArguments) -> Result<(), AdapterError> {
        let thread = self.find_thread(args.thread_id)?;
        thread.resume(StepKind::StepOut).await;
        Ok(())
    }

    async fn on_threads(&self) -> Result<ThreadsResponseBody, AdapterError> {
        let threads = self
            .thread_snapshot()
            .into_iter()
            .map(|t| crate::protocol::Thread {
                id: t.id,
                name: t.name.clone(),
            })
            .collect();
        Ok(ThreadsResponseBody { threads })
    }

    async fn on_stack_trace(
        &self,
        args: StackTraceArguments,
    ) -> Result<StackTraceResponseBody, AdapterError> {
        let thread = self.find_thread(args.thread_id)?;
        let stack_frames = thread.stack_trace();
        let total = stack_frames.len() as i64;
        Ok(StackTraceResponseBody {
            stack_frames,
            total_frames: Some(total),
        })
    }

    async fn on_scopes(&self, args: ScopesArguments) -> Result<ScopesResponseBody, AdapterError> {
        let thread = self
            .thread_snapshot()
            .into_iter()
            .find(|t| t.has_frame(args.frame_id))
            .ok_or(AdapterError::UnknownFrame(args.frame_id))?;
        let scopes = thread
            .scopes(args.frame_id)?
            .into_iter()
            .map(|mut scope| {
                scope.variables_reference = compose_ref(thread.id, scope.variables_reference);
                scope
            })
            .collect();
        Ok(ScopesResponseBody { scopes })
    }

    async fn on_variables(
        &self,
        args: VariablesArguments,
    ) -> Result<VariablesResponseBody, AdapterError> {
        let (thread_id, local) = split_ref(args.variables_reference);
        let thread = self.find_thread(thread_id)?;
        let variables = thread
            .variables(local)
            .into_iter()
            .map(|mut variable| {
                variable.variables_reference =
                    compose_ref(thread.id, variable.variables_reference);
                variable
            })
            .collect();
        Ok(VariablesResponseBody { variables })
    }

    async fn on_evaluate(
        &self,
        args: EvaluateArguments,
    ) -> Result<EvaluateResponseBody, AdapterError> {
        Err(AdapterError::CannotEvaluate(args.expression))
    }

    async fn on_source(&self, args: SourceArguments) -> Result<SourceResponseBody, AdapterError> {
        let path = args
            .source
            .as_ref()
            .and_then(|s| s.path.clone())
            .ok_or_else(|| AdapterError::UnknownSource(String::new()))?;
        let data = self
            .sources
            .get(&path)
            .ok_or(AdapterError::UnknownSource(path))?;
        Ok(SourceResponseBody {
            content: String::from_utf8_lossy(&data).into_owned(),
            mime_type: None,
        })
    }

    async fn on_set_breakpoints(
        &self,
        args: SetBreakpointsArguments,
    ) -> Result<SetBreakpointsResponseBody, AdapterError> {
        let path = args
            .source
            .path
            .clone()
            .ok_or_else(|| AdapterError::UnknownSource(args.source.name.unwrap_or_default()))?;
        Ok(SetBreakpointsResponseBody {
            breakpoints: self.breakpoints.set(&path, &args.breakpoints),
        })
    }
}
