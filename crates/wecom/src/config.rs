use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    wecom_channels::gating::MentionMode,
};

use crate::error::{Error, Result};

/// Filler shown while a reply is pending.
pub const DEFAULT_PLACEHOLDER: &str = "思考中...";

pub const DEFAULT_WEBHOOK_PATH: &str = "/webhooks/wecom";

pub const DEFAULT_COMMAND_ALLOWLIST: [&str; 4] = ["/new", "/compact", "/help", "/status"];

pub const DEFAULT_COMMAND_BLOCK_MESSAGE: &str = "⚠️ 该命令不可用。

支持的命令：
• **/new** - 新建会话
• **/compact** - 压缩会话（保留上下文摘要）
• **/help** - 查看帮助
• **/status** - 查看状态";

pub const DEFAULT_WELCOME_MESSAGE: &str = "你好！👋 我是 AI 助手。

你可以使用下面的指令管理会话：
• **/new** - 新建会话（清空上下文）
• **/compact** - 压缩会话（保留上下文摘要）
• **/help** - 查看更多命令

有什么我可以帮你的吗？";

/// Configuration for a single WeCom AI-bot account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WecomAccountConfig {
    /// Bot token from the WeCom admin console.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// 43-character message encryption key.
    #[serde(serialize_with = "serialize_secret")]
    pub encoding_aes_key: Secret<String>,

    /// HTTP path the webhook is mounted on.
    pub webhook_path: String,

    /// Slash-command allowlist.
    pub commands: CommandsConfig,

    /// Users who bypass the command allowlist.
    pub admin_users: Vec<String>,

    /// Senders whose commands are marked authorized for the agent runtime.
    /// Empty means everyone.
    pub allow_from: Vec<String>,

    pub group: GroupConfig,

    /// Per-conversation agent isolation.
    pub dynamic_agents: DynamicAgentsConfig,

    /// Stream lifecycle timings.
    pub stream: StreamTimings,

    pub placeholder: String,

    /// Reply sent when a user opens the chat window.
    pub welcome_message: String,

    /// Where decrypted inbound media is written.
    /// Defaults to `~/.openclaw/media/wecom`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_cache_dir: Option<PathBuf>,
}

impl std::fmt::Debug for WecomAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomAccountConfig")
            .field("token", &"[REDACTED]")
            .field("encoding_aes_key", &"[REDACTED]")
            .field("webhook_path", &self.webhook_path)
            .field("commands", &self.commands)
            .field("admin_users", &self.admin_users)
            .field("allow_from", &self.allow_from)
            .field("group", &self.group)
            .field("dynamic_agents", &self.dynamic_agents)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for WecomAccountConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            encoding_aes_key: Secret::new(String::new()),
            webhook_path: DEFAULT_WEBHOOK_PATH.into(),
            commands: CommandsConfig::default(),
            admin_users: Vec::new(),
            allow_from: Vec::new(),
            group: GroupConfig::default(),
            dynamic_agents: DynamicAgentsConfig::default(),
            stream: StreamTimings::default(),
            placeholder: DEFAULT_PLACEHOLDER.into(),
            welcome_message: DEFAULT_WELCOME_MESSAGE.into(),
            media_cache_dir: None,
        }
    }
}

impl WecomAccountConfig {
    /// Parse an account config from its JSON form.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let mut config: Self = serde_json::from_value(value)?;
        config.webhook_path = normalize_webhook_path(&config.webhook_path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.expose_secret().trim().is_empty() {
            return Err(Error::config("token is required"));
        }
        let key_len = self.encoding_aes_key.expose_secret().trim().len();
        if key_len != 43 {
            return Err(Error::config(format!(
                "encoding_aes_key must be 43 characters, got {key_len}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn media_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.media_cache_dir {
            return dir.clone();
        }
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".openclaw")
            .join("media")
            .join("wecom")
    }
}

/// Slash-command gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// When false every command is allowed.
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub block_message: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: DEFAULT_COMMAND_ALLOWLIST.iter().map(|c| (*c).into()).collect(),
            block_message: DEFAULT_COMMAND_BLOCK_MESSAGE.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub mention_mode: MentionMode,
}

/// When enabled, each conversation outside the admin list is routed to its
/// own agent instead of the runtime's default one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicAgentsConfig {
    pub enabled: bool,
    /// Create an agent per direct-message peer on first contact.
    pub dm: bool,
    /// Create an agent per group chat.
    pub group: bool,
}

impl Default for DynamicAgentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dm: true,
            group: true,
        }
    }
}

/// Stream lifecycle timings, in milliseconds unless noted.
///
/// The defaults follow the WeCom client's polling cadence (it keeps
/// refreshing a stream for up to six minutes). Other polling protocols
/// need their own values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTimings {
    /// Sliding window for coalescing bursts from one conversation.
    pub debounce_ms: u64,
    /// Idle time after the final block before a poll closes the stream.
    pub idle_close_ms: u64,
    /// Delay before the safety-net check runs after dispatch completes.
    pub safety_net_delay_ms: u64,
    /// Idle time the safety net requires before force-closing.
    pub safety_net_idle_ms: u64,
    /// Grace period between finishing and deleting a stream.
    pub cleanup_delay_ms: u64,
    /// Lifetime of a one-time `response_url`, in seconds.
    pub response_url_ttl_secs: u64,
}

impl Default for StreamTimings {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            idle_close_ms: 10_000,
            safety_net_delay_ms: 35_000,
            safety_net_idle_ms: 30_000,
            cleanup_delay_ms: 30_000,
            response_url_ttl_secs: 60 * 60,
        }
    }
}

impl StreamTimings {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn idle_close(&self) -> Duration {
        Duration::from_millis(self.idle_close_ms)
    }

    #[must_use]
    pub fn safety_net_delay(&self) -> Duration {
        Duration::from_millis(self.safety_net_delay_ms)
    }

    #[must_use]
    pub fn safety_net_idle(&self) -> Duration {
        Duration::from_millis(self.safety_net_idle_ms)
    }

    #[must_use]
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    #[must_use]
    pub fn response_url_ttl(&self) -> Duration {
        Duration::from_secs(self.response_url_ttl_secs)
    }
}

/// Leading slash, no trailing slash, `/` for empty input.
#[must_use]
pub fn normalize_webhook_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "/".into();
    }
    let with_slash = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    if with_slash.len() > 1 && with_slash.ends_with('/') {
        with_slash[..with_slash.len() - 1].to_string()
    } else {
        with_slash
    }
}
