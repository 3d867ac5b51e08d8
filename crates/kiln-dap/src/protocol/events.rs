//! Event bodies the adapter emits.

use serde::{Deserialize, Serialize};

use crate::protocol::types::{Breakpoint, Source};

/// Reason strings for `stopped`.
pub mod stop_reason {
    pub const STEP: &str = "step";
    pub const BREAKPOINT: &str = "breakpoint";
    pub const EXCEPTION: &str = "exception";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub thread_id: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hit_breakpoint_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: i64,
    pub all_threads_continued: bool,
}

/// `reason` is `started` or `exited`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: String,
    pub thread_id: i64,
}

impl ThreadEventBody {
    pub fn started(thread_id: i64) -> Self {
        Self {
            reason: "started".into(),
            thread_id,
        }
    }

    pub fn exited(thread_id: i64) -> Self {
        Self {
            reason: "exited".into(),
            thread_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminatedEventBody {}

/// `reason` is `changed`: a breakpoint's verified flag or resolved range
/// moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointEventBody {
    pub reason: String,
    pub breakpoint: Breakpoint,
}

impl BreakpointEventBody {
    pub fn changed(breakpoint: Breakpoint) -> Self {
        Self {
            reason: "changed".into(),
            breakpoint,
        }
    }
}

/// `reason` is `new` for a first-seen path, `changed` for new contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedSourceEventBody {
    pub reason: String,
    pub source: Source,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputEventBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub output: String,
}

impl OutputEventBody {
    pub fn stderr(output: impl Into<String>) -> Self {
        Self {
            category: Some("stderr".into()),
            output: output.into(),
        }
    }
}
