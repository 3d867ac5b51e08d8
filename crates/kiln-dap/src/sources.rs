//! Content-addressed store of source files seen during evaluation.
//!
//! Threads publish every file carried by a definition here; the client reads
//! them back through the `source` request. The first sighting of a path and
//! every subsequent content change emit a `loadedSource` event.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::protocol::{Event, LoadedSourceEventBody, Source};
use crate::server::EventSink;

pub struct SourceMap {
    sink: EventSink,
    files: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl SourceMap {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Store `data` under `path`. Emits `loadedSource{reason:"new"}` for a
    /// first-seen path and `loadedSource{reason:"changed"}` when contents
    /// differ; identical contents are a no-op.
    pub fn put(&self, path: &str, data: &[u8]) {
        {
            let files = self.files.read().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = files.get(path) {
                if existing.as_slice() == data {
                    return;
                }
            }
        }

        let reason = {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            match files.get(path) {
                // Lost the race to an identical write.
                Some(existing) if existing.as_slice() == data => return,
                Some(_) => {
                    files.insert(path.to_owned(), Arc::new(data.to_vec()));
                    "changed"
                }
                None => {
                    files.insert(path.to_owned(), Arc::new(data.to_vec()));
                    "new"
                }
            }
        };

        self.sink.event(Event::new(
            "loadedSource",
            LoadedSourceEventBody {
                reason: reason.into(),
                source: Source::for_path(path),
            },
        ));
    }

    pub fn get(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }
}
