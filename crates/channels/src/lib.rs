//! Channel-facing traits shared by the bot and the gateway embedding it.
//!
//! A channel exposes a generic outbound surface (`send_text` / `send_media`)
//! that knows only a nominal recipient address, plus a health check.

pub mod error;
pub mod gating;
pub mod plugin;

pub use {
    error::{Error, Result},
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelStatus, DeliveryReceipt},
};
