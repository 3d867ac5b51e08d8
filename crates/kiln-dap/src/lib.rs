//! Kiln interactive debug adapter.
//!
//! Exposes a build-graph evaluation to DAP clients: breakpoints on source
//! lines, stepping through build operations, per-step variable inspection,
//! stack traces, and an interactive shell attached to any paused step's
//! container state.

pub mod adapter;
pub mod breakpoints;
pub mod error;
pub mod ids;
pub mod program;
pub mod protocol;
pub mod server;
pub mod shell;
pub mod sources;
pub mod thread;
pub mod transport;
pub mod variables;

pub use adapter::{Adapter, AdapterOptions, LaunchConfig};
pub use breakpoints::Breakpoints;
pub use error::AdapterError;
pub use ids::IdPool;
pub use program::{Frame, Program, Step, StepId};
pub use server::{EventSink, Handlers, Server};
pub use shell::{Shell, ShellConfig};
pub use sources::SourceMap;
pub use thread::{StepKind, Thread, ThreadOptions};
pub use variables::{compose_ref, split_ref, VariableRefs};
