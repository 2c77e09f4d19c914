//! WeCom AI-bot channel.
//!
//! The platform never accepts pushed replies. Every inbound message gets a
//! stream with a placeholder, and the client polls the webhook until the
//! stream is finished. Agent output is written into that stream; late
//! output falls back to the message's one-time `response_url`.

pub mod active;
pub mod agent;
pub mod callback;
pub mod channel;
pub mod codec;
pub mod commands;
pub mod config;
pub mod debounce;
pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod media;
pub mod outbound;
pub mod scope;
pub mod serializer;
pub mod stream;

mod state;
mod webhook;

pub use {
    agent::{AgentRoute, AgentRuntime, DeliveryKind, InboundContext, ReplySink, RouteRequest},
    callback::{HttpResponseUrlSender, ResponseUrlSender},
    channel::{WecomChannel, WecomChannelBuilder},
    codec::{
        DecodeOutcome, Decoded, Inbound, InboundEvent, InboundMessage, MediaDecryptor,
        StreamReply, WebhookCodec, WebhookQuery,
    },
    config::WecomAccountConfig,
    error::{Error, Result},
    outbound::Delivery,
    webhook::EXPIRED_MESSAGE,
};

/// Channel identifier used in addresses, routes and receipts.
pub const CHANNEL_ID: &str = "wecom";

/// First 50 characters, for log lines.
pub(crate) fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
