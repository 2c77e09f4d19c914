use std::sync::Arc;

use crate::{
    active::ActiveStreamIndex,
    agent::AgentRuntime,
    callback::ResponseUrlSlots,
    codec::{InboundMessage, WebhookCodec},
    config::WecomAccountConfig,
    debounce::DebounceBuffer,
    lifecycle::Lifecycle,
    media::MediaFetcher,
    outbound::DeliveryRouter,
    serializer::DispatchSerializer,
    stream::StreamRegistry,
};

/// Orchestrator state for one account, shared by the webhook handlers, the
/// outbound surface and the dispatch tasks.
pub(crate) struct Shared {
    pub account_id: String,
    pub config: WecomAccountConfig,
    pub codec: Arc<dyn WebhookCodec>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub streams: Arc<StreamRegistry>,
    pub active: Arc<ActiveStreamIndex>,
    pub slots: Arc<ResponseUrlSlots>,
    pub router: DeliveryRouter,
    pub lifecycle: Lifecycle,
    pub serializer: DispatchSerializer,
    pub debounce: DebounceBuffer<InboundMessage>,
    pub media: MediaFetcher,
}

impl Shared {
    pub fn placeholder(&self) -> &str {
        self.streams.placeholder()
    }
}
