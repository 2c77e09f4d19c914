//! Terminal transitions and garbage collection of streams.
//!
//! A stream whose final block was delivered stays open for late content.
//! It is closed by the client's own polls once idle long enough, or by a
//! longer safety-net timer when polling stops. Finished streams are deleted
//! after a grace period so the last poll can still see the terminal flag.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{task::AbortHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use wecom_metrics::{counter, labels, wecom as wecom_names};

use crate::{active::ActiveStreamIndex, config::StreamTimings, stream::StreamRegistry};

/// Apology shown when a dispatch fails before producing anything.
pub const DISPATCH_ERROR_MESSAGE: &str = "处理消息时出错，请稍后再试。";

/// Why a stream reached the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    IdleClose,
    SafetyNet,
    DispatchError,
    CommandBlocked,
    MentionRequired,
    EmptyMessage,
    Merged,
    Welcome,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleClose => "idle_close",
            Self::SafetyNet => "safety_net",
            Self::DispatchError => "dispatch_error",
            Self::CommandBlocked => "command_blocked",
            Self::MentionRequired => "mention_required",
            Self::EmptyMessage => "empty_message",
            Self::Merged => "merged",
            Self::Welcome => "welcome",
        }
    }
}

/// Recorded when the agent's final block lands. Does not imply `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    pub main_response_done: bool,
    pub done_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    SafetyNet(String),
    Cleanup(String),
}

struct Inner {
    streams: Arc<StreamRegistry>,
    active: Arc<ActiveStreamIndex>,
    timings: StreamTimings,
    meta: Mutex<HashMap<String, StreamMeta>>,
    timers: Mutex<HashMap<TimerKey, (u64, AbortHandle)>>,
    next_timer: AtomicU64,
    cancel: CancellationToken,
}

/// Drives streams to `finished` and then out of the registry.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(
        streams: Arc<StreamRegistry>,
        active: Arc<ActiveStreamIndex>,
        timings: StreamTimings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams,
                active,
                timings,
                meta: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                next_timer: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Finish the stream and schedule its deletion.
    /// Returns `false` if it was unknown or already finished.
    pub fn finalize(&self, stream_id: &str, reason: FinishReason) -> bool {
        if !self.inner.streams.finish(stream_id) {
            return false;
        }
        debug!(stream_id, reason = reason.as_str(), "stream finished");
        #[cfg(feature = "metrics")]
        counter!(wecom_names::STREAMS_FINISHED_TOTAL, labels::REASON => reason.as_str())
            .increment(1);
        self.schedule_cleanup(stream_id);
        true
    }

    /// The agent delivered its final block. The stream stays pollable.
    pub fn mark_main_done(&self, stream_id: &str) {
        if !self.inner.streams.has(stream_id) {
            return;
        }
        let mut meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.insert(stream_id.to_string(), StreamMeta {
            main_response_done: true,
            done_at: Instant::now(),
        });
        info!(stream_id, "main response complete, keeping stream open for late content");
    }

    #[must_use]
    pub fn meta(&self, stream_id: &str) -> Option<StreamMeta> {
        let meta = self.inner.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.get(stream_id).copied()
    }

    /// Idle-close check run on every client poll. Returns `true` if this poll
    /// closed the stream.
    pub fn poll(&self, stream_id: &str) -> bool {
        let main_done = self.meta(stream_id).is_some_and(|m| m.main_response_done);
        if !main_done {
            return false;
        }
        let Some(idle) = self.idle_for(stream_id) else {
            return false;
        };
        if idle <= self.inner.timings.idle_close() {
            return false;
        }
        info!(stream_id, idle_ms = idle.as_millis() as u64, "closing idle stream");
        self.finalize(stream_id, FinishReason::IdleClose)
    }

    /// Time since the last write to an open stream.
    fn idle_for(&self, stream_id: &str) -> Option<Duration> {
        self.inner
            .streams
            .get(stream_id)
            .filter(|stream| !stream.finished)
            .map(|stream| Instant::now().saturating_duration_since(stream.updated_at))
    }

    /// Backstop for clients that stop polling: after the configured delay,
    /// force-close the stream if it is still open and has been idle long enough.
    pub fn arm_safety_net(&self, stream_id: &str, stream_key: &str) {
        let this = self.clone();
        let id = stream_id.to_string();
        let key = stream_key.to_string();
        self.schedule(
            TimerKey::SafetyNet(stream_id.to_string()),
            self.inner.timings.safety_net_delay(),
            move || {
                let Some(idle) = this.idle_for(&id) else {
                    return;
                };
                if idle <= this.inner.timings.safety_net_idle() {
                    return;
                }
                warn!(stream_id = %id, idle_ms = idle.as_millis() as u64, "safety net closing idle stream");
                this.finalize(&id, FinishReason::SafetyNet);
                this.inner.active.unregister(&key, &id);
            },
        );
    }

    /// Dispatch-failure policy: apologise if nothing was written yet, finish
    /// the stream and drop it from the conversation's history.
    pub fn fail(&self, stream_id: &str, stream_key: &str, message: &str) {
        let streams = &self.inner.streams;
        if let Some(stream) = streams.get(stream_id)
            && !stream.finished
            && stream.shows_placeholder(streams.placeholder())
        {
            streams.replace_if_placeholder(stream_id, message, streams.placeholder());
        }
        self.finalize(stream_id, FinishReason::DispatchError);
        self.inner.active.unregister(stream_key, stream_id);
        #[cfg(feature = "metrics")]
        counter!(wecom_names::DISPATCH_ERRORS_TOTAL).increment(1);
    }

    /// (Re)start the grace period after which the stream, its meta and its
    /// conversation history entries are deleted.
    pub fn schedule_cleanup(&self, stream_id: &str) {
        let this = self.clone();
        let id = stream_id.to_string();
        self.schedule(
            TimerKey::Cleanup(stream_id.to_string()),
            self.inner.timings.cleanup_delay(),
            move || {
                this.inner.streams.delete(&id);
                this.inner
                    .meta
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                this.inner.active.forget(&id);
                debug!(stream_id = %id, "stream deleted");
            },
        );
    }

    fn schedule<F>(&self, key: TimerKey, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let ticket = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        // Held across the spawn so the task cannot settle before it is tracked.
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
            {
                let mut timers = inner.timers.lock().unwrap_or_else(|e| e.into_inner());
                if timers.get(&timer_key).is_some_and(|(t, _)| *t == ticket) {
                    timers.remove(&timer_key);
                }
            }
            action();
        })
        .abort_handle();

        if let Some((_, previous)) = timers.insert(key, (ticket, handle)) {
            previous.abort();
        }
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel every outstanding timer. Later schedules are ignored.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, (_, handle)) in timers.drain() {
            handle.abort();
        }
    }
}
