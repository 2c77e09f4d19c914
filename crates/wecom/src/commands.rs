use {
    wecom_channels::gating::{MentionMode, is_allowed, is_listed},
    wecom_common::types::ChatType,
};

use crate::{
    CHANNEL_ID,
    config::{CommandsConfig, DynamicAgentsConfig, WecomAccountConfig},
};

/// Answer to group messages that do not mention the bot.
pub const MENTION_REQUIRED_MESSAGE: &str = "请@提及我以获取回复。";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCheck {
    pub is_command: bool,
    pub allowed: bool,
    /// First token, lower-cased.
    pub command: Option<String>,
}

/// Check a body against the slash-command allowlist.
#[must_use]
pub fn check_command(body: &str, config: &CommandsConfig) -> CommandCheck {
    let trimmed = body.trim();
    if !trimmed.starts_with('/') {
        return CommandCheck {
            is_command: false,
            allowed: true,
            command: None,
        };
    }
    let command = trimmed
        .split_whitespace()
        .next()
        .unwrap_or(trimmed)
        .to_lowercase();
    let allowed = !config.enabled || config.allowlist.iter().any(|c| c.to_lowercase() == command);
    CommandCheck {
        is_command: true,
        allowed,
        command: Some(command),
    }
}

#[must_use]
pub fn is_admin(user_id: &str, config: &WecomAccountConfig) -> bool {
    let user_id = user_id.trim();
    !user_id.is_empty() && is_listed(user_id, &config.admin_users)
}

/// Deterministic agent id for a conversation, e.g. `wecom-dm-zhangsan` or
/// `wecom-group-wrkgroup1`. `None` keeps the runtime's own route.
#[must_use]
pub fn dynamic_agent_id(
    peer_kind: ChatType,
    peer_id: &str,
    config: &DynamicAgentsConfig,
) -> Option<String> {
    let wanted = match peer_kind {
        ChatType::Dm => config.dm,
        ChatType::Group => config.group,
    };
    let peer_id = peer_id.trim();
    if !config.enabled || !wanted || peer_id.is_empty() {
        return None;
    }
    let sanitized: String = peer_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    Some(format!("{CHANNEL_ID}-{}-{sanitized}", peer_kind.as_str()))
}

/// Strip `wecom:` / `wework:` and `user:` prefixes and lower-case.
#[must_use]
pub fn normalize_allow_from_entry(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "*" {
        return Some("*".into());
    }
    let lower = trimmed.to_lowercase();
    let rest = lower
        .strip_prefix("wecom:")
        .or_else(|| lower.strip_prefix("wework:"))
        .unwrap_or(&lower);
    let rest = rest.strip_prefix("user:").unwrap_or(rest);
    Some(rest.to_string())
}

/// Whether the runtime may treat commands from `sender_id` as authorized.
/// An empty `allow_from` authorizes everyone; an empty sender nobody.
#[must_use]
pub fn command_authorized(sender_id: &str, allow_from: &[String]) -> bool {
    let sender = sender_id.trim();
    if sender.is_empty() {
        return false;
    }
    let normalized: Vec<String> = allow_from
        .iter()
        .filter_map(|entry| normalize_allow_from_entry(entry))
        .collect();
    is_allowed(sender, &normalized)
}

/// Outcome of group mention gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionGate {
    /// Proceed with this body (mentions stripped in groups).
    Pass(String),
    /// Tell the user to mention the bot.
    MentionRequired,
    /// Drop the message silently.
    Ignore,
}

#[must_use]
pub fn gate_mention(body: &str, is_group: bool, mode: MentionMode) -> MentionGate {
    if !is_group {
        return MentionGate::Pass(body.to_string());
    }
    match mode {
        MentionMode::Always => MentionGate::Pass(strip_mentions(body)),
        MentionMode::Mention if body.contains('@') => MentionGate::Pass(strip_mentions(body)),
        MentionMode::Mention => MentionGate::MentionRequired,
        MentionMode::None => MentionGate::Ignore,
    }
}

/// Drop leading `@name` tokens.
#[must_use]
pub fn strip_mentions(body: &str) -> String {
    let mut rest = body.trim_start();
    while let Some(after_at) = rest.strip_prefix('@') {
        let end = after_at
            .find(char::is_whitespace)
            .unwrap_or(after_at.len());
        rest = after_at[end..].trim_start();
    }
    rest.to_string()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn commands() -> CommandsConfig {
        CommandsConfig::default()
    }

    #[rstest]
    #[case("hello", false, true, None)]
    #[case("/new", true, true, Some("/new"))]
    #[case("  /HELP me", true, true, Some("/help"))]
    #[case("/reset", true, false, Some("/reset"))]
    #[case("/compact\tnow", true, true, Some("/compact"))]
    fn classifies_commands(
        #[case] body: &str,
        #[case] is_command: bool,
        #[case] allowed: bool,
        #[case] command: Option<&str>,
    ) {
        let check = check_command(body, &commands());
        assert_eq!(check.is_command, is_command);
        assert_eq!(check.allowed, allowed);
        assert_eq!(check.command.as_deref(), command);
    }

    #[test]
    fn disabled_gating_allows_every_command() {
        let config = CommandsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(check_command("/reset", &config).allowed);
    }

    #[test]
    fn admin_match_is_case_insensitive() {
        let config = WecomAccountConfig {
            admin_users: vec!["ZhangSan".into()],
            ..Default::default()
        };
        assert!(is_admin("zhangsan", &config));
        assert!(!is_admin("lisi", &config));
        assert!(!is_admin("", &config));
        assert!(!is_admin("zhangsan", &WecomAccountConfig::default()));
    }

    #[rstest]
    #[case("wecom:ZhangSan", Some("zhangsan"))]
    #[case("WeWork:user:lisi", Some("lisi"))]
    #[case("user:wangwu", Some("wangwu"))]
    #[case("*", Some("*"))]
    #[case("   ", None)]
    fn normalizes_allow_from(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_allow_from_entry(raw).as_deref(), expected);
    }

    #[test]
    fn command_authorization() {
        assert!(command_authorized("anyone", &[]));
        assert!(command_authorized("anyone", &["*".into()]));
        assert!(command_authorized("ZhangSan", &["wecom:zhangsan".into()]));
        assert!(!command_authorized("lisi", &["wecom:zhangsan".into()]));
        assert!(!command_authorized("", &[]));
    }

    #[rstest]
    #[case("@bot hi there", "hi there")]
    #[case("@bot @other  /new", "/new")]
    #[case("no mention", "no mention")]
    #[case("@bot", "")]
    fn strips_leading_mentions(#[case] body: &str, #[case] expected: &str) {
        assert_eq!(strip_mentions(body), expected);
    }

    #[test]
    fn mention_gating_by_mode() {
        assert_eq!(
            gate_mention("hi", false, MentionMode::None),
            MentionGate::Pass("hi".into())
        );
        assert_eq!(
            gate_mention("hi", true, MentionMode::Mention),
            MentionGate::MentionRequired
        );
        assert_eq!(
            gate_mention("@bot hi", true, MentionMode::Mention),
            MentionGate::Pass("hi".into())
        );
        assert_eq!(
            gate_mention("hi", true, MentionMode::Always),
            MentionGate::Pass("hi".into())
        );
        assert_eq!(gate_mention("@bot hi", true, MentionMode::None), MentionGate::Ignore);
    }

    #[rstest]
    #[case(ChatType::Dm, "ZhangSan", Some("wecom-dm-zhangsan"))]
    #[case(ChatType::Dm, "li.si@corp", Some("wecom-dm-li_si_corp"))]
    #[case(ChatType::Group, "wrkGroup-1", Some("wecom-group-wrkgroup-1"))]
    #[case(ChatType::Dm, "  ", None)]
    fn dynamic_agent_ids_are_deterministic(
        #[case] kind: ChatType,
        #[case] peer: &str,
        #[case] expected: Option<&str>,
    ) {
        let config = DynamicAgentsConfig::default();
        assert_eq!(dynamic_agent_id(kind, peer, &config).as_deref(), expected);
    }

    #[test]
    fn dynamic_agents_respect_switches() {
        let config = DynamicAgentsConfig {
            group: false,
            ..Default::default()
        };
        assert_eq!(dynamic_agent_id(ChatType::Group, "g1", &config), None);
        assert!(dynamic_agent_id(ChatType::Dm, "alice", &config).is_some());

        let config = DynamicAgentsConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(dynamic_agent_id(ChatType::Dm, "alice", &config), None);
    }
}
