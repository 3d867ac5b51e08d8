//! Kiln low-level build graph.
//!
//! Data model shared between the build engine and its tooling:
//! - Content-addressed operation payloads and digests
//! - Marshalled definitions with source info and metadata
//! - The engine client contracts the debug adapter consumes

pub mod client;
pub mod def;
pub mod digest;
pub mod op;

pub use client::{
    Client, Container, ExecConfig, FileStat, InvokeConfig, NamedRef, Reference, ResultHandle,
    SolveError, SolveRequest, SolveResult, StatConfig, State,
};
pub use def::{
    validate_acyclic, Definition, DefinitionError, Graph, Location, OpMetadata, Position, Range,
    Source, SourceInfo,
};
pub use digest::Digest;
pub use op::{ExecMeta, ExecOp, FileAction, FileOp, Input, Mount, Op, OpKind, Platform};
