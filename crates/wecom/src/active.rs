use std::{collections::HashMap, sync::Mutex};

use crate::stream::StreamRegistry;

/// Per-conversation history of stream ids, newest last.
#[derive(Default)]
pub struct ActiveStreamIndex {
    history: Mutex<HashMap<String, Vec<String>>>,
}

impl ActiveStreamIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stream_id` the newest entry for `key`.
    pub fn register(&self, key: &str, stream_id: &str) {
        if key.is_empty() || stream_id.is_empty() {
            return;
        }
        let mut map = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let ids = map.entry(key.to_string()).or_default();
        ids.retain(|id| id != stream_id);
        ids.push(stream_id.to_string());
    }

    pub fn unregister(&self, key: &str, stream_id: &str) {
        let mut map = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ids) = map.get_mut(key) {
            ids.retain(|id| id != stream_id);
            if ids.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Drop `stream_id` from every conversation it was registered under.
    pub fn forget(&self, stream_id: &str) {
        let mut map = self.history.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, ids| {
            ids.retain(|id| id != stream_id);
            !ids.is_empty()
        });
    }

    /// Newest stream for `key` that still exists in `streams`.
    ///
    /// Entries for deleted streams are pruned and the pruned history is kept.
    pub fn resolve(&self, key: &str, streams: &StreamRegistry) -> Option<String> {
        let mut map = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let ids = map.get_mut(key)?;
        ids.retain(|id| streams.has(id));
        let newest = ids.last().cloned();
        if newest.is_none() {
            map.remove(key);
        }
        newest
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
