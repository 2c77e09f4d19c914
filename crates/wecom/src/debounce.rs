//! Per-conversation coalescing window for inbound bursts.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {tokio::task::AbortHandle, tracing::debug};

/// A buffered message and the stream created for it.
#[derive(Debug, Clone)]
pub struct Pending<M> {
    pub message: M,
    pub stream_id: String,
}

/// Receives a conversation's batch, in arrival order, when its window closes.
pub type FlushFn<M> = Arc<dyn Fn(String, Vec<Pending<M>>) + Send + Sync>;

struct Entry<M> {
    pending: Vec<Pending<M>>,
    generation: u64,
    timer: AbortHandle,
}

type EntryMap<M> = Arc<Mutex<HashMap<String, Entry<M>>>>;

/// Sliding-window debouncer keyed by conversation.
///
/// Every push restarts the window, so a burst is flushed once, `window` after
/// its last message.
pub struct DebounceBuffer<M> {
    window: Duration,
    entries: EntryMap<M>,
    generation: AtomicU64,
    on_flush: FlushFn<M>,
}

impl<M: Send + 'static> DebounceBuffer<M> {
    pub fn new(window: Duration, on_flush: FlushFn<M>) -> Self {
        Self {
            window,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            on_flush,
        }
    }

    /// Buffer `message` for `key` and (re)start the window.
    /// Returns the number of messages now buffered for `key`.
    pub fn push(&self, key: &str, message: M, stream_id: &str) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = Pending {
            message,
            stream_id: stream_id.to_string(),
        };

        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let timer = self.spawn_timer(key.to_string(), generation);
        let buffered = match map.get_mut(key) {
            Some(entry) => {
                entry.timer.abort();
                entry.timer = timer;
                entry.generation = generation;
                entry.pending.push(pending);
                entry.pending.len()
            },
            None => {
                map.insert(key.to_string(), Entry {
                    pending: vec![pending],
                    generation,
                    timer,
                });
                1
            },
        };
        debug!(
            stream_key = key,
            stream_id,
            buffered,
            window_ms = self.window.as_millis() as u64,
            "message buffered"
        );
        buffered
    }

    fn spawn_timer(&self, key: String, generation: u64) -> AbortHandle {
        let window = self.window;
        let entries = Arc::clone(&self.entries);
        let on_flush = Arc::clone(&self.on_flush);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let batch = {
                let mut map = entries.lock().unwrap_or_else(|e| e.into_inner());
                // A newer push owns the entry if the generation moved on.
                match map.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        map.remove(&key).map(|entry| entry.pending)
                    },
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                debug!(stream_key = %key, size = batch.len(), "debounce window closed");
                on_flush(key, batch);
            }
        })
        .abort_handle()
    }

    /// Number of conversations with an open window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every window without flushing. Returns the dropped batches.
    pub fn shutdown(&self) -> Vec<(String, Vec<Pending<M>>)> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.drain()
            .map(|(key, entry)| {
                entry.timer.abort();
                (key, entry.pending)
            })
            .collect()
    }
}
