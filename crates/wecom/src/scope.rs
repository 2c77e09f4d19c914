//! Stream binding for everything a dispatch does.
//!
//! Outbound calls made by the agent runtime only carry a nominal recipient.
//! While a dispatch runs inside [`DeliveryScope::run`], those calls can look
//! up which stream the turn belongs to, across any number of `.await`s.
//! The binding is task-local: concurrent dispatches never see each other's.

use std::future::Future;

tokio::task_local! {
    static CURRENT: DeliveryScope;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryScope {
    pub stream_id: String,
    pub stream_key: String,
}

impl DeliveryScope {
    pub fn new(stream_id: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_key: stream_key.into(),
        }
    }

    /// Run `fut` with this scope bound.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// The scope of the running task, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[tokio::test]
    async fn unbound_outside_scope() {
        assert_eq!(DeliveryScope::current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn survives_suspension_points() {
        let seen = DeliveryScope::new("s1", "alice")
            .run(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::task::yield_now().await;
                DeliveryScope::current()
            })
            .await;
        assert_eq!(seen, Some(DeliveryScope::new("s1", "alice")));
        assert_eq!(DeliveryScope::current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_scopes_are_isolated() {
        let observe = |id: &'static str, key: &'static str, delay: u64| {
            tokio::spawn(DeliveryScope::new(id, key).run(async move {
                let mut seen = Vec::new();
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    seen.push(DeliveryScope::current().map(|s| s.stream_id));
                }
                seen
            }))
        };

        let a = observe("stream-a", "alice", 7);
        let b = observe("stream-b", "bob", 3);
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.iter().all(|s| s.as_deref() == Some("stream-a")));
        assert!(b.iter().all(|s| s.as_deref() == Some("stream-b")));
    }

    #[tokio::test]
    async fn nested_scope_shadows_outer() {
        let inner = DeliveryScope::new("outer", "k")
            .run(async {
                DeliveryScope::new("inner", "k")
                    .run(async { DeliveryScope::current() })
                    .await
            })
            .await;
        assert_eq!(inner.map(|s| s.stream_id).as_deref(), Some("inner"));
    }
}
