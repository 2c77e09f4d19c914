//! Per-conversation FIFO execution of dispatches.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    futures::FutureExt,
    tokio::{sync::watch, task::JoinHandle},
    tracing::warn,
};

/// Tail of a conversation's chain. The receiver resolves once the task
/// holding the matching sender has settled.
struct Tail {
    ticket: u64,
    settled: watch::Receiver<()>,
}

type TailMap = Arc<Mutex<HashMap<String, Tail>>>;

/// Releases the successor and clears the map entry if no newer task replaced it.
struct TailGuard {
    tails: TailMap,
    key: String,
    ticket: u64,
    _settled: watch::Sender<()>,
}

impl Drop for TailGuard {
    fn drop(&mut self) {
        let mut map = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&self.key).is_some_and(|tail| tail.ticket == self.ticket) {
            map.remove(&self.key);
        }
    }
}

/// Runs at most one task per key at a time, in enqueue order.
#[derive(Default)]
pub struct DispatchSerializer {
    tails: TailMap,
    next_ticket: AtomicU64,
}

impl DispatchSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain `task` behind the current tail for `key`.
    ///
    /// A task that fails or panics is handed to `on_failure` inside its own
    /// slot, so the next task for the key still runs afterwards.
    pub fn enqueue<F, E>(&self, key: &str, task: F, on_failure: E) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        E: FnOnce(anyhow::Error) + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (settled_tx, settled_rx) = watch::channel(());
        let previous = {
            let mut map = self.tails.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(key.to_string(), Tail {
                ticket,
                settled: settled_rx,
            })
        };
        let guard = TailGuard {
            tails: Arc::clone(&self.tails),
            key: key.to_string(),
            ticket,
            _settled: settled_tx,
        };

        let key = key.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            if let Some(mut previous) = previous.map(|tail| tail.settled) {
                // Only ever errors once the predecessor's sender is dropped.
                let _ = previous.changed().await;
            }
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("dispatch task panicked")),
            };
            if let Err(error) = outcome {
                warn!(stream_key = %key, error = %error, "queued dispatch failed");
                on_failure(error);
            }
        })
    }

    /// Keys with a running or queued task.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tails.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn sleepy(
        log: &Log,
        name: &'static str,
        ms: u64,
    ) -> impl Future<Output = anyhow::Result<()>> + use<> {
        let log = Arc::clone(log);
        async move {
            record(&log, format!("{name}:start"));
            tokio::time::sleep(Duration::from_millis(ms)).await;
            record(&log, format!("{name}:end"));
            Ok(())
        }
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_runs_fifo_without_interleaving() {
        let serializer = DispatchSerializer::new();
        let log: Log = Arc::default();

        let handles = vec![
            serializer.enqueue("user", sleepy(&log, "a", 300), |_| {}),
            serializer.enqueue("user", sleepy(&log, "b", 100), |_| {}),
            serializer.enqueue("user", sleepy(&log, "c", 10), |_| {}),
        ];
        assert_eq!(serializer.pending(), 1);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), [
            "a:start", "a:end", "b:start", "b:end", "c:start", "c:end"
        ]);
        assert_eq!(serializer.pending(), 0, "drained keys leave no entry");
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_concurrently() {
        let serializer = DispatchSerializer::new();
        let log: Log = Arc::default();

        let slow = serializer.enqueue("alice", sleepy(&log, "alice", 500), |_| {});
        let fast = serializer.enqueue("bob", sleepy(&log, "bob", 10), |_| {});
        assert_eq!(serializer.pending(), 2);
        fast.await.unwrap();
        slow.await.unwrap();

        let log = log.lock().unwrap();
        let bob_end = log.iter().position(|e| e == "bob:end").unwrap();
        let alice_end = log.iter().position(|e| e == "alice:end").unwrap();
        assert!(bob_end < alice_end);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_and_chain_continues() {
        let serializer = DispatchSerializer::new();
        let log: Log = Arc::default();

        let failed_log = Arc::clone(&log);
        let first = serializer.enqueue(
            "user",
            async { Err::<(), _>(anyhow::anyhow!("runtime exploded")) },
            move |error| record(&failed_log, format!("failed:{error}")),
        );
        let second = serializer.enqueue("user", sleepy(&log, "next", 10), |_| {});
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*log.lock().unwrap(), [
            "failed:runtime exploded",
            "next:start",
            "next:end"
        ]);
        assert_eq!(serializer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_contained() {
        let serializer = DispatchSerializer::new();
        let log: Log = Arc::default();

        let failed_log = Arc::clone(&log);
        let first = serializer.enqueue(
            "user",
            explode(),
            move |_| record(&failed_log, "recovered"),
        );
        let second = serializer.enqueue("user", sleepy(&log, "next", 10), |_| {});
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["recovered", "next:start", "next:end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_enqueue_after_drain_starts_fresh() {
        let serializer = DispatchSerializer::new();
        let log: Log = Arc::default();

        serializer.enqueue("user", sleepy(&log, "a", 10), |_| {}).await.unwrap();
        assert_eq!(serializer.pending(), 0);
        serializer.enqueue("user", sleepy(&log, "b", 10), |_| {}).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(serializer.pending(), 0);
    }
}
