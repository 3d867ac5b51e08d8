//! Source map tests: one `loadedSource` per distinct content, `new` first,
//! `changed` afterwards.

use pretty_assertions::assert_eq;

use kiln_dap::protocol::LoadedSourceEventBody;

use super::*;

fn reasons(events: &mut UnboundedReceiver<Event>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.event, "loadedSource");
        let body: LoadedSourceEventBody = body_of(&event);
        out.push(body.reason);
    }
    out
}

#[test]
fn test_one_event_per_distinct_content() {
    let (sink, mut events) = EventSink::channel();
    let map = SourceMap::new(sink);

    map.put(BUILDFILE, b"v1");
    map.put(BUILDFILE, b"v1");
    map.put(BUILDFILE, b"v2");
    map.put(BUILDFILE, b"v2");
    map.put(BUILDFILE, b"v3");

    assert_eq!(reasons(&mut events), vec!["new", "changed", "changed"]);
    assert_eq!(map.get(BUILDFILE).unwrap().as_slice(), b"v3");
}

#[test]
fn test_each_path_gets_its_own_new_event() {
    let (sink, mut events) = EventSink::channel();
    let map = SourceMap::new(sink);

    map.put("/ws/a", b"same");
    map.put("/ws/b", b"same");
    assert_eq!(reasons(&mut events), vec!["new", "new"]);
}

#[test]
fn test_get_unknown_path() {
    let (sink, _events) = EventSink::channel();
    let map = SourceMap::new(sink);
    assert!(map.get("/ws/missing").is_none());
}

#[test]
fn test_event_carries_source_path() {
    let (sink, mut events) = EventSink::channel();
    let map = SourceMap::new(sink);
    map.put(BUILDFILE, b"v1");

    let event = events.try_recv().unwrap();
    let body: LoadedSourceEventBody = body_of(&event);
    assert_eq!(body.source.path.as_deref(), Some(BUILDFILE));
    assert_eq!(body.source.name.as_deref(), Some("Buildfile"));
}
