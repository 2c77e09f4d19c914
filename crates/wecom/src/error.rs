use wecom_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A stream with this id is already registered.
    #[error("stream already exists: {stream_id}")]
    AlreadyExists { stream_id: String },

    #[error("invalid wecom account config: {message}")]
    Config { message: String },

    /// Media download returned a non-success status.
    #[error("media download failed ({status}): {url}")]
    FetchStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Media download failed at the transport level.
    #[error("media download failed: {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Encrypted media could not be authenticated or decrypted.
    #[error("media decryption failed: {message}")]
    Decrypt { message: String },

    /// For [`crate::codec::WebhookCodec`] implementations that fail to seal a reply.
    #[error("webhook codec error: {message}")]
    Codec { message: String },

    #[error("{message}")]
    Message { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn decrypt(message: impl std::fmt::Display) -> Self {
        Self::Decrypt {
            message: message.to_string(),
        }
    }

    /// Transient download failures: the attachment is skipped.
    #[must_use]
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::FetchStatus { .. })
    }

    /// The payload arrived but could not be decrypted.
    #[must_use]
    pub fn is_decrypt(&self) -> bool {
        matches!(self, Self::Decrypt { .. })
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

wecom_common::impl_context!();
