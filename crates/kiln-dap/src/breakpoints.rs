//! Breakpoint engine.
//!
//! Stores user breakpoints per source path, matches new lists against old
//! ones so ids survive re-sends, and intersects the stored positions against
//! operation source ranges to verify them. Verification updates the
//! breakpoint's range to the operation's range and announces the change with
//! a `breakpoint{reason:"changed"}` event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use kiln_llb::{Digest, Range, Source as GraphSource};

use crate::protocol::{self, BreakpointEventBody, Event, SourceBreakpoint};
use crate::server::EventSink;

// ── Stored breakpoints ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Stored {
    id: i64,
    line: i64,
    col: i64,
    end_line: i64,
    end_col: i64,
    verified: bool,
}

impl Stored {
    fn point(id: i64, line: i64, col: i64) -> Self {
        Self {
            id,
            line,
            col,
            end_line: line,
            end_col: col,
            verified: false,
        }
    }

    /// Inclusive containment of this breakpoint's range within `rng`.
    fn contained_in(&self, rng: &Range) -> bool {
        rng.start.line <= self.line
            && rng.start.col <= self.col
            && rng.end.line >= self.end_line
            && rng.end.col >= self.end_col
    }

    /// Containment of a requested point within this breakpoint's resolved
    /// range, used to carry ids across `set` calls.
    fn covers_point(&self, line: i64, col: i64) -> bool {
        self.line <= line && self.col <= col && self.end_line >= line && self.end_col >= col
    }

    fn to_protocol(&self, path: &str) -> protocol::Breakpoint {
        protocol::Breakpoint {
            id: Some(self.id),
            verified: self.verified,
            message: None,
            source: Some(protocol::Source::for_path(path)),
            line: Some(self.line),
            column: Some(self.col),
            end_line: Some(self.end_line),
            end_column: Some(self.end_col),
        }
    }
}

#[derive(Default)]
struct State {
    by_path: HashMap<String, Vec<Stored>>,
    next_id: i64,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct Breakpoints {
    sink: EventSink,
    state: Mutex<State>,
}

impl Breakpoints {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            state: Mutex::new(State {
                by_path: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Replace the breakpoint list for `path`. Entries whose requested
    /// position lies within a previously stored breakpoint's range keep that
    /// breakpoint's id, verified flag, and resolved range; the rest get
    /// fresh ids and a point range. The result is always concrete, one entry
    /// per request, in request order.
    pub fn set(&self, path: &str, requested: &[SourceBreakpoint]) -> Vec<protocol::Breakpoint> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = state.by_path.remove(path).unwrap_or_default();

        let mut stored = Vec::with_capacity(requested.len());
        for sbp in requested {
            let col = sbp.column.unwrap_or(0);
            let carried = previous
                .iter()
                .find(|prev| prev.covers_point(sbp.line, col))
                .cloned();
            match carried {
                Some(prev) => stored.push(prev),
                None => {
                    state.next_id += 1;
                    stored.push(Stored::point(state.next_id, sbp.line, col));
                }
            }
        }

        let result = stored.iter().map(|bp| bp.to_protocol(path)).collect();
        state.by_path.insert(path.to_owned(), stored);
        result
    }

    /// Intersect stored breakpoints against the operation locations of
    /// `source`. Filenames are joined with `root` to match client paths.
    ///
    /// Returns the armed set: digest → breakpoint id for every operation
    /// whose first range contains a breakpoint. A breakpoint verifying for
    /// the first time adopts the operation's range and is announced with a
    /// `breakpoint{reason:"changed"}` event.
    pub fn intersect(&self, source: &GraphSource, root: &Path) -> HashMap<Digest, i64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut armed = HashMap::new();
        let mut events = Vec::new();

        for (digest, locations) in &source.locations {
            for location in locations {
                let Some(rng) = location.ranges.first() else {
                    continue;
                };
                let path = root.join(&location.filename);
                let path = path.to_string_lossy();
                let Some(list) = state.by_path.get_mut(path.as_ref()) else {
                    continue;
                };
                for bp in list.iter_mut() {
                    if !bp.contained_in(rng) {
                        continue;
                    }
                    armed.insert(digest.clone(), bp.id);
                    if !bp.verified {
                        bp.verified = true;
                        bp.line = rng.start.line;
                        bp.col = rng.start.col;
                        bp.end_line = rng.end.line;
                        bp.end_col = rng.end.col;
                        events.push(bp.to_protocol(path.as_ref()));
                    }
                }
            }
        }
        drop(state);

        for breakpoint in events {
            self.sink.event(Event::new(
                "breakpoint",
                BreakpointEventBody::changed(breakpoint),
            ));
        }
        armed
    }
}
