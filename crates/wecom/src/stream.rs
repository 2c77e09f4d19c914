//! Live streams polled by the WeCom client.

use std::path::{Path, PathBuf};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tokio::time::Instant,
    tracing::debug,
};

#[cfg(feature = "metrics")]
use wecom_metrics::{gauge, wecom as wecom_names};

use crate::error::{Error, Result};

const SEPARATOR: &str = "\n\n";

/// A reply being built up while the client polls it.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: String,
    pub content: String,
    /// Monotonic: once set, content is frozen.
    pub finished: bool,
    pub created_at: Instant,
    pub updated_at: Instant,
    /// Local files sent with the terminal poll response.
    pub queued_media: Vec<PathBuf>,
}

impl Stream {
    fn new(id: &str, placeholder: &str) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            content: placeholder.to_string(),
            finished: false,
            created_at: now,
            updated_at: now,
            queued_media: Vec::new(),
        }
    }

    #[must_use]
    pub fn shows_placeholder(&self, placeholder: &str) -> bool {
        self.content.trim() == placeholder.trim()
    }

    fn append(&mut self, text: &str) {
        if !self.content.is_empty() {
            self.content.push_str(SEPARATOR);
        }
        self.content.push_str(text);
        self.updated_at = Instant::now();
    }

    fn replace(&mut self, text: &str) {
        self.content = text.to_string();
        self.updated_at = Instant::now();
    }
}

/// Result of a deduplicating write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The placeholder was replaced wholesale.
    Replaced,
    Appended,
    /// The text was already part of the stream.
    Duplicate,
    /// Unknown or finished stream.
    Rejected,
}

impl WriteOutcome {
    #[must_use]
    pub fn landed(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Registry of live streams, keyed by stream id.
pub struct StreamRegistry {
    streams: DashMap<String, Stream>,
    placeholder: String,
}

impl StreamRegistry {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            streams: DashMap::new(),
            placeholder: placeholder.into(),
        }
    }

    #[must_use]
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Register a new stream showing the placeholder.
    pub fn create(&self, id: &str) -> Result<()> {
        match self.streams.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists {
                stream_id: id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Stream::new(id, &self.placeholder));
                #[cfg(feature = "metrics")]
                gauge!(wecom_names::STREAMS_ACTIVE).set(self.streams.len() as f64);
                debug!(stream_id = id, "stream created");
                Ok(())
            },
        }
    }

    /// Append with a blank-line separator. No-op for unknown or finished streams.
    pub fn append(&self, id: &str, text: &str) -> bool {
        match self.streams.get_mut(id) {
            Some(mut stream) if !stream.finished => {
                stream.append(text);
                true
            },
            _ => false,
        }
    }

    /// Replace the content if it still shows `placeholder`, append otherwise.
    pub fn replace_if_placeholder(&self, id: &str, text: &str, placeholder: &str) -> bool {
        match self.streams.get_mut(id) {
            Some(mut stream) if !stream.finished => {
                if stream.shows_placeholder(placeholder) {
                    stream.replace(text);
                } else {
                    stream.append(text);
                }
                true
            },
            _ => false,
        }
    }

    /// Like [`Self::replace_if_placeholder`], but skips text the stream
    /// already contains. Upstream dispatchers may emit overlapping block and
    /// final payloads.
    pub fn write_deduped(&self, id: &str, text: &str, placeholder: &str) -> WriteOutcome {
        let Some(mut stream) = self.streams.get_mut(id) else {
            return WriteOutcome::Rejected;
        };
        if stream.finished {
            return WriteOutcome::Rejected;
        }
        if stream.shows_placeholder(placeholder) {
            stream.replace(text);
            return WriteOutcome::Replaced;
        }
        if stream.content.contains(text.trim()) {
            return WriteOutcome::Duplicate;
        }
        stream.append(text);
        WriteOutcome::Appended
    }

    /// Queue a local file for the terminal response. `false` tells the caller
    /// to fall back to an inline reference.
    pub fn queue_media(&self, id: &str, path: impl AsRef<Path>) -> bool {
        match self.streams.get_mut(id) {
            Some(mut stream) if !stream.finished => {
                stream.queued_media.push(path.as_ref().to_path_buf());
                true
            },
            _ => false,
        }
    }

    /// Mark a stream finished. Returns `true` only for the call that made
    /// the transition.
    pub fn finish(&self, id: &str) -> bool {
        match self.streams.get_mut(id) {
            Some(mut stream) if !stream.finished => {
                stream.finished = true;
                true
            },
            _ => false,
        }
    }

    pub fn delete(&self, id: &str) -> Option<Stream> {
        let removed = self.streams.remove(id).map(|(_, stream)| stream);
        #[cfg(feature = "metrics")]
        if removed.is_some() {
            gauge!(wecom_names::STREAMS_ACTIVE).set(self.streams.len() as f64);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Stream> {
        self.streams.get(id).map(|stream| stream.clone())
    }

    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    /// Exists and still accepts writes.
    #[must_use]
    pub fn is_open(&self, id: &str) -> bool {
        self.streams.get(id).is_some_and(|stream| !stream.finished)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
