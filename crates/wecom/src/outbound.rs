//! Outbound delivery: open stream, then the one-time `response_url`, then
//! log-and-drop.

use std::{path::PathBuf, sync::Arc};

use {
    tracing::{debug, error, info, warn},
    wecom_channels::DeliveryReceipt,
};

#[cfg(feature = "metrics")]
use wecom_metrics::{counter, labels, wecom as wecom_names};

use crate::{
    CHANNEL_ID,
    active::ActiveStreamIndex,
    callback::{ResponseUrlSender, ResponseUrlSlots},
    preview,
    scope::DeliveryScope,
    stream::{StreamRegistry, WriteOutcome},
};

/// Appended to the stream text when an image is queued for the final response.
pub const IMAGE_TOKEN: &str = "[图片]";

/// Where an outbound call ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to (or already present in) an open stream.
    Stream { stream_id: String },
    /// Local media queued on an open stream.
    StreamMedia { stream_id: String },
    ResponseUrl,
    /// The slot was consumed but the POST failed. The slot stays used.
    ResponseUrlFailed,
    /// No channel was available.
    Dropped,
    /// Nothing to send.
    Skipped,
}

impl Delivery {
    #[must_use]
    pub fn tier(&self) -> &'static str {
        match self {
            Self::Stream { .. } | Self::StreamMedia { .. } => "stream",
            Self::ResponseUrl | Self::ResponseUrlFailed => "response_url",
            Self::Dropped | Self::Skipped => "dropped",
        }
    }

    /// Acknowledgment handed back to generic callers. Never an error.
    #[must_use]
    pub fn receipt(&self) -> DeliveryReceipt {
        let now = unix_millis();
        let message_id = match self {
            Self::Stream { .. } => format!("msg_stream_{now}"),
            Self::StreamMedia { .. } => format!("msg_stream_img_{now}"),
            Self::ResponseUrl => format!("msg_response_url_{now}"),
            Self::ResponseUrlFailed | Self::Dropped | Self::Skipped => format!("fake_{now}"),
        };
        DeliveryReceipt::new(CHANNEL_ID, message_id)
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Resolve a media reference to a local file.
///
/// `sandbox:` references are mapped onto the filesystem root
/// (`sandbox:///tmp/a`, `sandbox://tmp/a` and `sandbox:/tmp/a` all become
/// `/tmp/a`). Anything that is not absolute is remote.
#[must_use]
pub fn local_media_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("sandbox:") {
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };
        return Some(PathBuf::from(path));
    }
    url.starts_with('/').then(|| PathBuf::from(url))
}

/// Markdown image reference, after `text` if there is any.
#[must_use]
pub fn inline_reference(text: &str, url: &str) -> String {
    if text.is_empty() {
        format!("![image]({url})")
    } else {
        format!("{text}\n\n![image]({url})")
    }
}

/// Picks a delivery target for every outbound write.
pub struct DeliveryRouter {
    streams: Arc<StreamRegistry>,
    active: Arc<ActiveStreamIndex>,
    slots: Arc<ResponseUrlSlots>,
    sender: Arc<dyn ResponseUrlSender>,
}

impl DeliveryRouter {
    pub fn new(
        streams: Arc<StreamRegistry>,
        active: Arc<ActiveStreamIndex>,
        slots: Arc<ResponseUrlSlots>,
        sender: Arc<dyn ResponseUrlSender>,
    ) -> Self {
        Self {
            streams,
            active,
            slots,
            sender,
        }
    }

    /// Open stream for a write: the explicit or task-scoped stream first,
    /// then the conversation's newest stream.
    #[must_use]
    pub fn resolve_stream(&self, stream_key: &str, explicit: Option<&str>) -> Option<String> {
        let bound = explicit
            .map(str::to_string)
            .or_else(|| DeliveryScope::current().map(|scope| scope.stream_id));
        if let Some(id) = bound
            && self.streams.is_open(&id)
        {
            return Some(id);
        }
        self.active
            .resolve(stream_key, &self.streams)
            .filter(|id| self.streams.is_open(id))
    }

    pub async fn deliver_text(
        &self,
        stream_key: &str,
        explicit: Option<&str>,
        text: &str,
    ) -> Delivery {
        if text.trim().is_empty() {
            return Delivery::Skipped;
        }
        if let Some(stream_id) = self.resolve_stream(stream_key, explicit)
            && let Some(delivery) = self.write_stream(&stream_id, text)
        {
            return self.record(stream_key, delivery);
        }
        let delivery = self.fallback(stream_key, text).await;
        self.record(stream_key, delivery)
    }

    /// Media variant. Local files are queued for the terminal poll response
    /// and announced with [`IMAGE_TOKEN`]; remote references are inlined.
    pub async fn deliver_media(
        &self,
        stream_key: &str,
        explicit: Option<&str>,
        text: &str,
        media_url: &str,
    ) -> Delivery {
        let local = local_media_path(media_url);

        if let Some(stream_id) = self.resolve_stream(stream_key, explicit) {
            if let Some(path) = &local {
                if self.streams.queue_media(&stream_id, path) {
                    if !text.trim().is_empty() {
                        self.write_stream(&stream_id, text);
                    }
                    self.streams.replace_if_placeholder(
                        &stream_id,
                        IMAGE_TOKEN,
                        self.streams.placeholder(),
                    );
                    debug!(stream_id = %stream_id, path = %path.display(), "media queued on stream");
                    return self.record(stream_key, Delivery::StreamMedia { stream_id });
                }
                warn!(stream_id = %stream_id, media_url, "failed to queue media, falling back to inline reference");
            }
            let content = inline_reference(text, media_url);
            if let Some(delivery) = self.write_stream(&stream_id, &content) {
                return self.record(stream_key, delivery);
            }
        }

        // A local path means nothing to the remote client; only the text survives.
        let content = match local {
            Some(_) => text.to_string(),
            None => inline_reference(text, media_url),
        };
        if content.trim().is_empty() {
            warn!(stream_key, media_url, "no open stream for local media, dropping");
            return self.record(stream_key, Delivery::Dropped);
        }
        let delivery = self.fallback(stream_key, &content).await;
        self.record(stream_key, delivery)
    }

    fn write_stream(&self, stream_id: &str, text: &str) -> Option<Delivery> {
        match self
            .streams
            .write_deduped(stream_id, text, self.streams.placeholder())
        {
            WriteOutcome::Rejected => None,
            WriteOutcome::Duplicate => {
                debug!(stream_id, preview = %preview(text), "duplicate content, skipping");
                Some(Delivery::Stream {
                    stream_id: stream_id.to_string(),
                })
            },
            WriteOutcome::Replaced | WriteOutcome::Appended => Some(Delivery::Stream {
                stream_id: stream_id.to_string(),
            }),
        }
    }

    async fn fallback(&self, stream_key: &str, text: &str) -> Delivery {
        let Some(url) = self.slots.claim(stream_key) else {
            warn!(
                stream_key,
                preview = %preview(text),
                "no delivery channel available (stream closed, response_url unavailable)"
            );
            return Delivery::Dropped;
        };
        match self.sender.send_text(&url, text).await {
            Ok(()) => {
                info!(stream_key, "sent via response_url fallback");
                Delivery::ResponseUrl
            },
            Err(e) => {
                error!(stream_key, error = %e, "response_url fallback failed");
                Delivery::ResponseUrlFailed
            },
        }
    }

    fn record(&self, stream_key: &str, delivery: Delivery) -> Delivery {
        debug!(stream_key, tier = delivery.tier(), ?delivery, "outbound delivery");
        #[cfg(feature = "metrics")]
        counter!(wecom_names::DELIVERIES_TOTAL, labels::TIER => delivery.tier()).increment(1);
        delivery
    }
}
