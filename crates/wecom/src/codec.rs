//! Wire contracts with the webhook and crypto collaborators.
//!
//! Signature checks, envelope decryption and the JSON shapes of the
//! platform live behind [`WebhookCodec`] and [`MediaDecryptor`]; this crate
//! only sees decoded messages and hands back stream snapshots to encode.

use std::{collections::HashMap, path::PathBuf};

use {serde::Deserialize, wecom_common::types::ChatType};

use crate::error::Result;

/// Query string of a webhook request (`msg_signature`, `timestamp`, `nonce`, ...).
pub type WebhookQuery = HashMap<String, String>;

/// A decoded inbound chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InboundMessage {
    pub msg_id: String,
    pub from_user: String,
    pub chat_type: ChatType,
    pub chat_id: Option<String>,
    pub msg_type: String,
    pub content: String,
    /// Single-attachment field used by plain image messages.
    pub image_url: Option<String>,
    /// Attachments of mixed (text + images) messages.
    pub image_urls: Vec<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    /// One-time fallback URL, valid for an hour.
    pub response_url: Option<String>,
}

impl InboundMessage {
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        match self.chat_type {
            ChatType::Group => self.chat_id.as_deref().filter(|id| !id.is_empty()),
            ChatType::Dm => None,
        }
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        self.group_id().is_some()
    }

    /// Conversation key: the group id in group chats, the sender otherwise.
    #[must_use]
    pub fn conversation_key(&self) -> String {
        self.group_id().unwrap_or(&self.from_user).to_string()
    }

    #[must_use]
    pub fn is_command(&self) -> bool {
        self.content.trim_start().starts_with('/')
    }

    /// All image references, single-attachment field first, without repeats.
    #[must_use]
    pub fn image_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for url in self.image_url.iter().chain(self.image_urls.iter()) {
            if !url.is_empty() && !refs.contains(url) {
                refs.push(url.clone());
            }
        }
        refs
    }

    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.image_refs().is_empty() || self.file_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// A decoded platform event (e.g. `enter_chat`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InboundEvent {
    pub event_type: String,
    pub from_user: Option<String>,
}

/// The three kinds of POST the platform sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(InboundMessage),
    /// The client polling for the current content of a stream.
    StreamRefresh { stream_id: String },
    Event(InboundEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub inbound: Inbound,
    /// Echoed back into the encrypted reply envelope.
    pub timestamp: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded(Decoded),
    /// Platform retry of a message that was already accepted.
    Duplicate,
    Invalid { reason: String },
}

/// Snapshot of a stream to encode as a reply.
#[derive(Debug, Clone, Copy)]
pub struct StreamReply<'a> {
    pub stream_id: &'a str,
    pub content: &'a str,
    pub finished: bool,
    pub timestamp: &'a str,
    pub nonce: &'a str,
    /// Queued local media; only ever non-empty once `finished` is set.
    pub media: &'a [PathBuf],
}

/// Verifies, decrypts and encodes webhook traffic.
pub trait WebhookCodec: Send + Sync {
    /// Returns the plaintext echo for a valid URL-verification request.
    fn verify_challenge(&self, query: &WebhookQuery) -> Option<String>;

    fn decode(&self, query: &WebhookQuery, body: &str) -> DecodeOutcome;

    /// Encrypted JSON envelope for a stream snapshot.
    fn build_stream_response(&self, reply: &StreamReply<'_>) -> Result<String>;
}

/// Decrypts media downloaded from the platform.
pub trait MediaDecryptor: Send + Sync {
    /// Fails with [`crate::Error::Decrypt`] on tampered or undecryptable input.
    fn decrypt_media(&self, encrypted: &[u8]) -> Result<Vec<u8>>;
}
