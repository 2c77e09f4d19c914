use std::sync::{Arc, Weak};

use {
    anyhow::Result,
    async_trait::async_trait,
    axum::Router,
    tracing::{debug, info},
    wecom_channels::{
        DeliveryReceipt,
        plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelStatus},
    },
    wecom_common::types::ReplyPayload,
};

use crate::{
    active::ActiveStreamIndex,
    agent::AgentRuntime,
    callback::{HttpResponseUrlSender, ResponseUrlSender, ResponseUrlSlots},
    codec::{InboundMessage, MediaDecryptor, WebhookCodec},
    config::{WecomAccountConfig, normalize_webhook_path},
    debounce::{DebounceBuffer, FlushFn},
    error::Error,
    inbound,
    lifecycle::Lifecycle,
    media::MediaFetcher,
    outbound::DeliveryRouter,
    serializer::DispatchSerializer,
    state::Shared,
    stream::StreamRegistry,
    webhook,
};

/// Conversation key of an outbound address (`wecom:alice`, `wecom:group:g1`).
fn target_key(to: &str) -> wecom_channels::Result<&str> {
    let trimmed = to.trim();
    let key = trimmed.strip_prefix("wecom:").unwrap_or(trimmed);
    let key = key.strip_prefix("group:").unwrap_or(key);
    if key.is_empty() {
        return Err(wecom_channels::Error::invalid_input(format!("empty recipient: {to:?}")));
    }
    Ok(key)
}

/// A running WeCom AI-bot account.
///
/// Cheap to clone. Mount [`WecomChannel::router`] on the HTTP server and call
/// [`WecomChannel::shutdown`] when the account stops.
#[derive(Clone)]
pub struct WecomChannel {
    shared: Arc<Shared>,
}

impl WecomChannel {
    pub fn builder(account_id: impl Into<String>, config: WecomAccountConfig) -> WecomChannelBuilder {
        WecomChannelBuilder {
            account_id: account_id.into(),
            config,
            runtime: None,
            codec: None,
            decryptor: None,
            response_url_sender: None,
            http: None,
        }
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.shared.account_id
    }

    #[must_use]
    pub fn webhook_path(&self) -> &str {
        &self.shared.config.webhook_path
    }

    /// Axum router serving `GET` and `POST` on the webhook path.
    pub fn router(&self) -> Router {
        webhook::router(Arc::clone(&self.shared))
    }

    /// Snapshot of a stream, mostly useful for diagnostics.
    #[must_use]
    pub fn stream(&self, stream_id: &str) -> Option<crate::stream::Stream> {
        self.shared.streams.get(stream_id)
    }

    /// Cancel debounce and lifecycle timers. Buffered messages are dropped
    /// and their streams finished.
    pub fn shutdown(&self) {
        let dropped = self.shared.debounce.shutdown();
        for (key, batch) in &dropped {
            for pending in batch {
                self.shared.active.unregister(key, &pending.stream_id);
                self.shared.streams.finish(&pending.stream_id);
            }
        }
        self.shared.lifecycle.shutdown();
        info!(
            account_id = %self.shared.account_id,
            dropped_conversations = dropped.len(),
            "wecom channel stopped"
        );
    }
}

#[async_trait]
impl ChannelOutbound for WecomChannel {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<DeliveryReceipt> {
        let key = target_key(to)?;
        debug!(account_id, to, "outbound text");
        let delivery = self.shared.router.deliver_text(key, None, text).await;
        Ok(delivery.receipt())
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<DeliveryReceipt> {
        let key = target_key(to)?;
        debug!(account_id, to, "outbound media");
        let delivery = match &payload.media {
            Some(media) => {
                self.shared
                    .router
                    .deliver_media(key, None, &payload.text, &media.url)
                    .await
            },
            None => self.shared.router.deliver_text(key, None, &payload.text).await,
        };
        Ok(delivery.receipt())
    }
}

#[async_trait]
impl ChannelStatus for WecomChannel {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        if account_id != self.shared.account_id {
            return Ok(ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            });
        }
        let details = format!(
            "live streams: {}, buffered conversations: {}, queued dispatches: {}",
            self.shared.streams.len(),
            self.shared.debounce.len(),
            self.shared.serializer.pending()
        );
        Ok(ChannelHealthSnapshot {
            connected: true,
            account_id: self.shared.account_id.clone(),
            details: Some(details),
        })
    }
}

pub struct WecomChannelBuilder {
    account_id: String,
    config: WecomAccountConfig,
    runtime: Option<Arc<dyn AgentRuntime>>,
    codec: Option<Arc<dyn WebhookCodec>>,
    decryptor: Option<Arc<dyn MediaDecryptor>>,
    response_url_sender: Option<Arc<dyn ResponseUrlSender>>,
    http: Option<reqwest::Client>,
}

impl WecomChannelBuilder {
    pub fn runtime(mut self, runtime: Arc<dyn AgentRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn WebhookCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn MediaDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Defaults to a reqwest-backed sender.
    pub fn response_url_sender(mut self, sender: Arc<dyn ResponseUrlSender>) -> Self {
        self.response_url_sender = Some(sender);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> crate::Result<WecomChannel> {
        let Self {
            account_id,
            mut config,
            runtime,
            codec,
            decryptor,
            response_url_sender,
            http,
        } = self;
        config.webhook_path = normalize_webhook_path(&config.webhook_path);
        config.validate()?;
        let runtime = runtime.ok_or_else(|| Error::config("agent runtime is required"))?;
        let codec = codec.ok_or_else(|| Error::config("webhook codec is required"))?;
        let decryptor = decryptor.ok_or_else(|| Error::config("media decryptor is required"))?;
        let http = http.unwrap_or_default();
        let sender = response_url_sender
            .unwrap_or_else(|| Arc::new(HttpResponseUrlSender::new(http.clone())));

        let timings = config.stream.clone();
        let streams = Arc::new(StreamRegistry::new(config.placeholder.clone()));
        let active = Arc::new(ActiveStreamIndex::new());
        let slots = Arc::new(ResponseUrlSlots::new(timings.response_url_ttl()));
        let router = DeliveryRouter::new(
            Arc::clone(&streams),
            Arc::clone(&active),
            Arc::clone(&slots),
            sender,
        );
        let lifecycle = Lifecycle::new(Arc::clone(&streams), Arc::clone(&active), timings.clone());
        let media = MediaFetcher::new(http, decryptor, config.media_cache_dir());

        info!(
            account_id = %account_id,
            webhook_path = %config.webhook_path,
            media_dir = %media.cache_dir().display(),
            "starting wecom account"
        );

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let on_flush: FlushFn<InboundMessage> = Arc::new(move |key, batch| {
                if let Some(shared) = weak.upgrade() {
                    inbound::flush(&shared, key, batch);
                }
            });
            Shared {
                account_id,
                codec,
                runtime,
                streams,
                active,
                slots,
                router,
                lifecycle,
                serializer: DispatchSerializer::new(),
                debounce: DebounceBuffer::new(timings.debounce(), on_flush),
                media,
                config,
            }
        });
        Ok(WecomChannel { shared })
    }
}
