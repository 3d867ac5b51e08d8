//! DAP session server.
//!
//! Owns the single-writer message channel, stamps sequence numbers,
//! dispatches client requests to the handler table, and routes responses to
//! server-initiated requests back to their callbacks. Long-running work is
//! scheduled on the session task group via [`Server::go`]; request handlers
//! themselves run inline on the read loop, which keeps responses FIFO with
//! respect to request arrival.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::protocol::{
    AttachArguments, Capabilities, ConfigurationDoneArguments, ContinueArguments,
    ContinueResponseBody, DisconnectArguments, EvaluateArguments, Event, InitializeArguments,
    LaunchArguments, Message, NextArguments, Request, Response, RestartArguments,
    ScopesArguments, ScopesResponseBody, SetBreakpointsArguments, SetBreakpointsResponseBody,
    SourceArguments, SourceResponseBody, StackTraceArguments, StackTraceResponseBody,
    StepInArguments, StepOutArguments, TerminateArguments, ThreadsResponseBody,
    VariablesArguments, VariablesResponseBody,
};
use crate::protocol::requests::EvaluateResponseBody;
use crate::transport;

type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

// ── Handler table ────────────────────────────────────────────────────────────

/// Per-command handlers. Every method defaults to a failed "not implemented"
/// response, so an implementation only overrides the commands it supports.
#[async_trait]
pub trait Handlers: Send + Sync + 'static {
    async fn on_initialize(
        &self,
        _args: InitializeArguments,
    ) -> Result<Capabilities, AdapterError> {
        Err(AdapterError::NotImplemented("initialize".into()))
    }

    async fn on_launch(&self, _args: LaunchArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("launch".into()))
    }

    async fn on_attach(&self, _args: AttachArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("attach".into()))
    }

    async fn on_disconnect(&self, _args: DisconnectArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("disconnect".into()))
    }

    async fn on_terminate(&self, _args: TerminateArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("terminate".into()))
    }

    async fn on_restart(&self, _args: RestartArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("restart".into()))
    }

    async fn on_configuration_done(
        &self,
        _args: ConfigurationDoneArguments,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("configurationDone".into()))
    }

    async fn on_continue(
        &self,
        _args: ContinueArguments,
    ) -> Result<ContinueResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("continue".into()))
    }

    async fn on_next(&self, _args: NextArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("next".into()))
    }

    async fn on_step_in(&self, _args: StepInArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("stepIn".into()))
    }

    async fn on_step_out(&self, _args: StepOutArguments) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented("stepOut".into()))
    }

    async fn on_threads(&self) -> Result<ThreadsResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("threads".into()))
    }

    async fn on_stack_trace(
        &self,
        _args: StackTraceArguments,
    ) -> Result<StackTraceResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("stackTrace".into()))
    }

    async fn on_scopes(&self, _args: ScopesArguments) -> Result<ScopesResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("scopes".into()))
    }

    async fn on_variables(
        &self,
        _args: VariablesArguments,
    ) -> Result<VariablesResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("variables".into()))
    }

    async fn on_evaluate(
        &self,
        _args: EvaluateArguments,
    ) -> Result<EvaluateResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("evaluate".into()))
    }

    async fn on_source(&self, _args: SourceArguments) -> Result<SourceResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("source".into()))
    }

    async fn on_set_breakpoints(
        &self,
        _args: SetBreakpointsArguments,
    ) -> Result<SetBreakpointsResponseBody, AdapterError> {
        Err(AdapterError::NotImplemented("setBreakpoints".into()))
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct OutState {
    seq: i64,
    tx: Option<mpsc::UnboundedSender<Message>>,
}

struct Shared {
    out: Mutex<OutState>,
    pending: Mutex<HashMap<i64, ResponseCallback>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    tasks: TaskTracker,
    initialized: watch::Sender<bool>,
}

impl Shared {
    /// Stamp and enqueue. Stamping and enqueueing happen under one lock so
    /// sequence numbers are monotonic in stream order.
    fn send(&self, mut msg: Message) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.seq += 1;
        *msg.seq_mut() = out.seq;
        if let Some(tx) = &out.tx {
            let _ = tx.send(msg);
        }
    }

    /// Stamp, register the callback, and enqueue a server-initiated request.
    fn send_request(&self, mut req: Request, cb: ResponseCallback) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.seq += 1;
        req.seq = out.seq;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req.seq, cb);
        if let Some(tx) = &out.tx {
            let _ = tx.send(Message::Request(req));
        }
    }

    fn close_write(&self) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.tx = None;
    }
}

// ── Event sink ───────────────────────────────────────────────────────────────

/// A clonable handle for emitting events through the session's write
/// channel. Sends after shutdown are dropped; events are best-effort.
#[derive(Clone)]
pub struct EventSink {
    kind: SinkKind,
}

#[derive(Clone)]
enum SinkKind {
    Server(Weak<Shared>),
    Channel(mpsc::UnboundedSender<Event>),
}

impl EventSink {
    pub fn event(&self, event: Event) {
        match &self.kind {
            SinkKind::Server(shared) => {
                if let Some(shared) = shared.upgrade() {
                    shared.send(Message::Event(event));
                }
            }
            SinkKind::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }

    /// A sink that forwards events to a plain channel instead of a session,
    /// for embedding components without a server.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                kind: SinkKind::Channel(tx),
            },
            rx,
        )
    }

    /// A sink that drops everything.
    pub fn disconnected() -> Self {
        Self {
            kind: SinkKind::Server(Weak::new()),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

pub struct Server {
    shared: Arc<Shared>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl Server {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (initialized, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                out: Mutex::new(OutState { seq: 0, tx: Some(tx) }),
                pending: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                tasks: TaskTracker::new(),
                initialized,
            }),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sink(&self) -> EventSink {
        EventSink {
            kind: SinkKind::Server(Arc::downgrade(&self.shared)),
        }
    }

    /// Cancellation token for the session. Child tokens hang off this one.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Observe the initialize handshake; the receiver flips to true once the
    /// first `initialize` succeeds.
    pub fn initialized(&self) -> watch::Receiver<bool> {
        self.shared.initialized.subscribe()
    }

    /// Schedule a task on the session group. Returns false iff the session
    /// is already torn down.
    pub fn go<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.shared.cancel.is_cancelled() || self.shared.tasks.is_closed() {
            return false;
        }
        self.shared.tasks.spawn(fut);
        true
    }

    /// Send a server-initiated request; `cb` runs on a fresh task when the
    /// matching response arrives.
    pub fn do_request<F>(&self, req: Request, cb: F)
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.shared.send_request(req, Box::new(cb));
    }

    /// Cancel the session. `serve` returns `ErrServerStopped` once the loops
    /// drain.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }

    /// Run the read and write loops over a framed byte stream until
    /// end-of-stream or [`Server::stop`].
    pub async fn serve<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        handlers: Arc<dyn Handlers>,
    ) -> Result<(), AdapterError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(AdapterError::ServerStopped)?;

        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = transport::write_message(&mut writer, &msg).await {
                    warn!(error = %err, "write loop ended");
                    break;
                }
            }
        });

        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                read = transport::read_message(&mut reader) => match read {
                    Ok(None) => break,
                    Ok(Some(Message::Request(req))) => {
                        self.handle_request(&handlers, req).await;
                    }
                    Ok(Some(Message::Response(resp))) => self.route_response(resp),
                    Ok(Some(Message::Event(ev))) => {
                        debug!(event = %ev.event, "ignoring client event");
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                },
            }
        }

        // Orderly shutdown: cancel outstanding tasks, drain the group, then
        // close the write channel so queued messages flush before EOF.
        self.shared.cancel.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.close_write();
        let _ = write_task.await;

        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(AdapterError::ServerStopped);
        }
        result
    }

    /// Dispatch one request through the handler table and write its
    /// response. Runs inline on the read loop so responses stay FIFO with
    /// request arrival; handlers schedule long work via [`Server::go`].
    async fn handle_request(&self, handlers: &Arc<dyn Handlers>, req: Request) {
        debug!(command = %req.command, seq = req.seq, "request");
        let outcome = self.run_command(handlers, &req).await;
        let initialize_ok = req.command == "initialize" && outcome.is_ok();

        let response = match outcome {
            Ok(body) => Response {
                seq: 0,
                request_seq: req.seq,
                success: true,
                command: req.command.clone(),
                message: None,
                body,
            },
            Err(err) => Response {
                seq: 0,
                request_seq: req.seq,
                success: false,
                command: req.command.clone(),
                message: Some(err.to_string()),
                body: None,
            },
        };
        self.shared.send(Message::Response(response));

        if initialize_ok {
            self.shared.initialized.send_replace(true);
            self.shared.send(Message::Event(Event::plain("initialized")));
        }
    }

    async fn run_command(
        &self,
        handlers: &Arc<dyn Handlers>,
        req: &Request,
    ) -> Result<Option<Value>, AdapterError> {
        match req.command.as_str() {
            "initialize" => {
                if *self.shared.initialized.borrow() {
                    return Err(AdapterError::AlreadyInitialized);
                }
                body(handlers.on_initialize(parse_args(req)?).await?)
            }
            "launch" => empty(handlers.on_launch(parse_args(req)?).await),
            "attach" => empty(handlers.on_attach(parse_args(req)?).await),
            "disconnect" => empty(handlers.on_disconnect(parse_args(req)?).await),
            "terminate" => empty(handlers.on_terminate(parse_args(req)?).await),
            "restart" => empty(handlers.on_restart(parse_args(req)?).await),
            "configurationDone" => {
                empty(handlers.on_configuration_done(parse_args(req)?).await)
            }
            "continue" => body(handlers.on_continue(parse_args(req)?).await?),
            "next" => empty(handlers.on_next(parse_args(req)?).await),
            "stepIn" => empty(handlers.on_step_in(parse_args(req)?).await),
            "stepOut" => empty(handlers.on_step_out(parse_args(req)?).await),
            "threads" => body(handlers.on_threads().await?),
            "stackTrace" => body(handlers.on_stack_trace(parse_args(req)?).await?),
            "scopes" => body(handlers.on_scopes(parse_args(req)?).await?),
            "variables" => body(handlers.on_variables(parse_args(req)?).await?),
            "evaluate" => body(handlers.on_evaluate(parse_args(req)?).await?),
            "source" => body(handlers.on_source(parse_args(req)?).await?),
            "setBreakpoints" => body(handlers.on_set_breakpoints(parse_args(req)?).await?),
            other => Err(AdapterError::NotImplemented(other.to_string())),
        }
    }

    fn route_response(&self, resp: Response) {
        let cb = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resp.request_seq);
        match cb {
            Some(cb) => {
                // Callbacks run on a fresh task so the read loop never waits
                // on them.
                self.shared.tasks.spawn(async move { cb(resp) });
            }
            None => warn!(request_seq = resp.request_seq, "response with no pending request"),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_args<T: DeserializeOwned>(req: &Request) -> Result<T, AdapterError> {
    let value = req
        .arguments
        .clone()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|source| AdapterError::Arguments {
        command: req.command.clone(),
        source,
    })
}

fn body<T: Serialize>(value: T) -> Result<Option<Value>, AdapterError> {
    Ok(Some(serde_json::to_value(value)?))
}

fn empty(result: Result<(), AdapterError>) -> Result<Option<Value>, AdapterError> {
    result.map(|()| None)
}
