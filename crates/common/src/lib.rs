//! Shared types and error plumbing used across the wecom crates.

pub mod error;
pub mod types;

pub use error::FromMessage;
