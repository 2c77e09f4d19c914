//! One-time `response_url` fallback channel.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use {async_trait::async_trait, tokio::time::Instant, tracing::debug};

use crate::error::{Error, Result};

struct Slot {
    url: String,
    expires_at: Instant,
    used: bool,
}

impl Slot {
    fn is_claimable(&self, now: Instant) -> bool {
        !self.used && now < self.expires_at
    }
}

/// Latest `response_url` per conversation. Each slot can be claimed once.
pub struct ResponseUrlSlots {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResponseUrlSlots {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the slot for `key` with a fresh, unused one.
    pub fn save(&self, key: &str, url: &str) {
        if key.is_empty() || url.trim().is_empty() {
            return;
        }
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|_, slot| now < slot.expires_at);
        slots.insert(key.to_string(), Slot {
            url: url.to_string(),
            expires_at: now + self.ttl,
            used: false,
        });
        debug!(stream_key = key, "response_url saved");
    }

    /// Mark the slot used and return its URL. Exactly one caller wins per slot,
    /// whether or not its delivery later succeeds.
    pub fn claim(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get_mut(key)?;
        if now >= slot.expires_at {
            slots.remove(key);
            return None;
        }
        if !slot.is_claimable(now) {
            return None;
        }
        slot.used = true;
        Some(slot.url.clone())
    }
}

/// Pushes text to a `response_url`.
#[async_trait]
pub trait ResponseUrlSender: Send + Sync {
    async fn send_text(&self, url: &str, text: &str) -> Result<()>;
}

/// Posts a plain text message to the one-time URL.
pub struct HttpResponseUrlSender {
    http: reqwest::Client,
}

impl HttpResponseUrlSender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ResponseUrlSender for HttpResponseUrlSender {
    async fn send_text(&self, url: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "msgtype": "text",
            "text": { "content": text },
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::message(format!(
                "response_url post failed ({status}): {body}"
            )));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3_600);

    #[tokio::test(start_paused = true)]
    async fn slot_is_claimed_exactly_once() {
        let slots = ResponseUrlSlots::new(HOUR);
        slots.save("alice", "https://callback/1");

        assert_eq!(slots.claim("alice").as_deref(), Some("https://callback/1"));
        assert_eq!(slots.claim("alice"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_message_replaces_used_slot() {
        let slots = ResponseUrlSlots::new(HOUR);
        slots.save("alice", "https://callback/1");
        slots.claim("alice");
        slots.save("alice", "https://callback/2");
        assert_eq!(slots.claim("alice").as_deref(), Some("https://callback/2"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slot_is_not_claimable() {
        let slots = ResponseUrlSlots::new(HOUR);
        slots.save("alice", "https://callback/1");
        tokio::time::advance(HOUR + Duration::from_secs(1)).await;
        assert_eq!(slots.claim("alice"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_url_is_ignored() {
        let slots = ResponseUrlSlots::new(HOUR);
        slots.save("alice", "  ");
        assert_eq!(slots.claim("alice"), None);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let slots = std::sync::Arc::new(ResponseUrlSlots::new(HOUR));
        slots.save("alice", "https://callback/1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slots = std::sync::Arc::clone(&slots);
                tokio::spawn(async move { slots.claim("alice") })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn http_sender_posts_text_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cgi-bin/aibot/response")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "msgtype": "text",
                "text": { "content": "late reply" }
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0}"#)
            .create_async()
            .await;

        let sender = HttpResponseUrlSender::new(reqwest::Client::new());
        let url = format!("{}/cgi-bin/aibot/response", server.url());
        sender.send_text(&url, "late reply").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_sender_reports_status_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/expired")
            .with_status(410)
            .with_body("gone")
            .create_async()
            .await;

        let sender = HttpResponseUrlSender::new(reqwest::Client::new());
        let err = sender
            .send_text(&format!("{}/expired", server.url()), "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("410"));
        assert!(err.to_string().contains("gone"));
    }
}
