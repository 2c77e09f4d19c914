//! Contract with the backend agent runtime.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::Serialize,
    wecom_common::types::{ChatType, ReplyPayload},
};

/// Which part of a turn a delivery carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Incremental block emitted while the agent is still working.
    Block,
    /// The agent's terminal reply for the turn.
    Final,
}

impl DeliveryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Final => "final",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub channel: &'static str,
    pub account_id: String,
    pub peer_kind: ChatType,
    pub peer_id: String,
}

/// Agent and session a conversation is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRoute {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

impl AgentRoute {
    /// Move the conversation onto its own agent with a session scoped to the peer.
    #[must_use]
    pub fn isolated(self, agent_id: String, peer_kind: ChatType, peer_id: &str) -> Self {
        Self {
            session_key: format!("agent:{agent_id}:{peer_kind}:{peer_id}"),
            agent_id,
            account_id: self.account_id,
        }
    }
}

/// Everything the runtime needs to run one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboundContext {
    pub body: String,
    pub raw_body: String,
    /// Empty for attachment-only messages so they never parse as commands.
    pub command_body: String,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub account_id: String,
    pub agent_id: String,
    pub chat_type: ChatType,
    pub conversation_label: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub command_authorized: bool,
    /// Decrypted attachments on local disk.
    pub media_paths: Vec<PathBuf>,
    /// Attachments that could not be decrypted, passed by reference.
    pub media_urls: Vec<String>,
    pub media_types: Vec<String>,
}

/// Callbacks the runtime invokes while dispatching a turn.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, payload: ReplyPayload, kind: DeliveryKind);
    async fn on_error(&self, error: &anyhow::Error, kind: DeliveryKind);
}

/// The conversational-agent dispatcher.
///
/// Besides the sink it is handed, the runtime may reply through the
/// channel's generic [`wecom_channels::ChannelOutbound`] surface; calls made
/// from the dispatch task land on the dispatch's stream.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn resolve_route(&self, request: &RouteRequest) -> AgentRoute;

    async fn dispatch(&self, ctx: InboundContext, sink: Arc<dyn ReplySink>) -> anyhow::Result<()>;
}
