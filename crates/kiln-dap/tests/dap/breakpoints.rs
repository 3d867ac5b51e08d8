//! Breakpoint engine tests: set/carry-over, intersection, verification
//! events, and containment boundaries.

use std::path::Path;

use pretty_assertions::assert_eq;
use rstest::rstest;

use kiln_dap::protocol::BreakpointEventBody;
use kiln_llb::Source as GraphSource;

use super::*;

const DOCKERFILE: &str = "/ws/Dockerfile";

fn op_ranges() -> GraphSource {
    let mut source = GraphSource::default();
    let ranges = [
        (10, 0, 10, 10),
        (20, 5, 20, 5),
        (30, 0, 30, 10),
        (35, 2, 35, 7),
    ];
    for (i, (sl, sc, el, ec)) in ranges.into_iter().enumerate() {
        source.locations.insert(
            Digest::from_bytes(format!("op{i}").as_bytes()),
            vec![Location {
                filename: "Dockerfile".into(),
                ranges: vec![Range::new(sl, sc, el, ec)],
            }],
        );
    }
    source
}

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[test]
fn test_set_returns_one_entry_per_request() {
    let (sink, _events) = EventSink::channel();
    let bps = Breakpoints::new(sink);

    let out = bps.set(DOCKERFILE, &[sbp(1, 0), sbp(2, 0), sbp(3, 0)]);
    assert_eq!(out.len(), 3);
    let ids: Vec<i64> = out.iter().map(|bp| bp.id.unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(out.iter().all(|bp| !bp.verified));

    // Ids keep climbing across calls, even for other paths.
    let out = bps.set("/ws/other", &[sbp(1, 0)]);
    assert_eq!(out[0].id, Some(4));
}

#[test]
fn test_set_empty_list_is_concrete() {
    let (sink, _events) = EventSink::channel();
    let bps = Breakpoints::new(sink);
    let out = bps.set(DOCKERFILE, &[]);
    assert!(out.is_empty());
}

#[test]
fn test_verification_scenario() {
    let (sink, mut events) = EventSink::channel();
    let bps = Breakpoints::new(sink);

    let requested = [
        sbp(10, 5),
        sbp(10, -1),
        sbp(20, 5),
        sbp(20, 4),
        sbp(30, 10),
        sbp(30, 11),
        sbp(35, 4),
        sbp(40, 0),
    ];
    let out = bps.set(DOCKERFILE, &requested);
    assert_eq!(out.len(), 8);

    let armed = bps.intersect(&op_ranges(), Path::new(ROOT));
    assert_eq!(armed.len(), 4);

    let mut hit_ids: Vec<i64> = armed.values().copied().collect();
    hit_ids.sort_unstable();
    assert_eq!(hit_ids, vec![1, 3, 5, 7]);

    let changed = drain(&mut events);
    assert_eq!(changed.len(), 4);
    for event in &changed {
        assert_eq!(event.event, "breakpoint");
        let body: BreakpointEventBody = body_of(event);
        assert_eq!(body.reason, "changed");
        assert!(body.breakpoint.verified);
    }

    // Verified breakpoints adopt the operation's range.
    let out = bps.set(DOCKERFILE, &requested);
    assert_eq!(out[0].line, Some(10));
    assert_eq!(out[0].column, Some(0));
    assert_eq!(out[0].end_column, Some(10));

    // A second intersect changes nothing and stays silent.
    let armed = bps.intersect(&op_ranges(), Path::new(ROOT));
    assert_eq!(armed.len(), 4);
    assert!(drain(&mut events).is_empty());
}

#[test]
fn test_set_is_idempotent() {
    let (sink, _events) = EventSink::channel();
    let bps = Breakpoints::new(sink);

    let requested = [sbp(10, 5), sbp(20, 5), sbp(40, 0)];
    bps.set(DOCKERFILE, &requested);
    bps.intersect(&op_ranges(), Path::new(ROOT));

    let first = bps.set(DOCKERFILE, &requested);
    let second = bps.set(DOCKERFILE, &requested);
    let ids = |list: &[kiln_dap::protocol::Breakpoint]| {
        list.iter()
            .map(|bp| (bp.id.unwrap(), bp.verified))
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(ids(&second), vec![(1, true), (2, true), (3, false)]);
}

#[test]
fn test_removed_breakpoints_are_destroyed() {
    let (sink, _events) = EventSink::channel();
    let bps = Breakpoints::new(sink);

    bps.set(DOCKERFILE, &[sbp(10, 5), sbp(20, 5)]);
    let out = bps.set(DOCKERFILE, &[sbp(20, 5)]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, Some(2));

    // Only the surviving breakpoint intersects.
    let armed = bps.intersect(&op_ranges(), Path::new(ROOT));
    let ids: Vec<i64> = armed.values().copied().collect();
    assert_eq!(ids, vec![2]);
}

#[rstest]
#[case(30, 0, true)]
#[case(30, 10, true)]
#[case(30, -1, false)]
#[case(30, 11, false)]
#[case(29, 0, false)]
#[case(31, 0, false)]
fn test_containment_boundaries(#[case] line: i64, #[case] col: i64, #[case] verifies: bool) {
    let (sink, _events) = EventSink::channel();
    let bps = Breakpoints::new(sink);
    bps.set(DOCKERFILE, &[sbp(line, col)]);
    let armed = bps.intersect(&op_ranges(), Path::new(ROOT));
    assert_eq!(!armed.is_empty(), verifies);
}

#[test]
fn test_other_paths_do_not_intersect() {
    let (sink, mut events) = EventSink::channel();
    let bps = Breakpoints::new(sink);
    bps.set("/elsewhere/Dockerfile", &[sbp(10, 5)]);
    let armed = bps.intersect(&op_ranges(), Path::new(ROOT));
    assert!(armed.is_empty());
    assert!(drain(&mut events).is_empty());
}
