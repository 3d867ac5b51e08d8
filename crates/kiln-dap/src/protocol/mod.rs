//! Debug Adapter Protocol wire types.
//!
//! All types are serde-serializable for JSON transport. The envelope is the
//! standard DAP triple: every message carries a sequence number and a type
//! tag; responses reference the originating request's sequence. Arrays the
//! protocol requires to be concrete are `Vec`, never `Option<Vec>`.

pub mod events;
pub mod requests;
pub mod types;

pub use events::{
    BreakpointEventBody, ContinuedEventBody, LoadedSourceEventBody, OutputEventBody,
    StoppedEventBody, TerminatedEventBody, ThreadEventBody,
};
pub use requests::{
    AttachArguments, Capabilities, ConfigurationDoneArguments, ContinueArguments,
    ContinueResponseBody, DisconnectArguments, EvaluateArguments, EvaluateResponseBody,
    InitializeArguments, LaunchArguments, NextArguments, RestartArguments,
    RunInTerminalRequestArguments,
    ScopesArguments, ScopesResponseBody, SetBreakpointsArguments, SetBreakpointsResponseBody,
    SourceArguments, SourceBreakpoint, SourceResponseBody, StackTraceArguments,
    StackTraceResponseBody, StepInArguments, StepOutArguments, TerminateArguments,
    ThreadsResponseBody, VariablesArguments, VariablesResponseBody,
};
pub use types::{Breakpoint, Scope, Source, StackFrame, Thread, Variable};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// A protocol message: request, response, or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    /// The sequence slot every outgoing message is stamped into.
    pub fn seq_mut(&mut self) -> &mut i64 {
        match self {
            Message::Request(r) => &mut r.seq,
            Message::Response(r) => &mut r.seq,
            Message::Event(e) => &mut e.seq,
        }
    }
}

/// A client- or server-initiated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(command: impl Into<String>, arguments: impl Serialize) -> Self {
        Self {
            seq: 0,
            command: command.into(),
            arguments: serde_json::to_value(arguments).ok(),
        }
    }
}

/// Response to a request. `request_seq` correlates; `success=false` carries
/// the error text in `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A server-initiated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    /// An event with a serializable body.
    pub fn new(event: impl Into<String>, body: impl Serialize) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body: serde_json::to_value(body).ok(),
        }
    }

    /// An event without a body.
    pub fn plain(event: impl Into<String>) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body: None,
        }
    }
}
