//! Adapter error taxonomy.
//!
//! Protocol and client-state errors become failed responses and the session
//! continues; solve errors park a thread at the failing operation; fatal
//! errors tear the session down.

use thiserror::Error;

use kiln_llb::{DefinitionError, SolveError};

#[derive(Debug, Error)]
pub enum AdapterError {
    // Protocol errors
    #[error("command \"{0}\" is not implemented")]
    NotImplemented(String),
    #[error("malformed arguments for \"{command}\": {source}")]
    Arguments {
        command: String,
        source: serde_json::Error,
    },
    #[error("frame missing Content-Length header")]
    MissingContentLength,

    // Client-state errors
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("no launch configuration")]
    NotLaunched,
    #[error("no such thread {0}")]
    UnknownThread(i64),
    #[error("no such frame {0}")]
    UnknownFrame(i64),
    #[error("no such source {0:?}")]
    UnknownSource(String),
    #[error("evaluation is not supported: {0:?}")]
    CannotEvaluate(String),

    // Build errors
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Solve(#[from] SolveError),

    // Fatal errors
    #[error("server stopped")]
    ServerStopped,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
