use serde::{Deserialize, Serialize};

/// Check if an identity is on an allowlist.
///
/// An empty allowlist means everyone is allowed (open policy).
/// Entries are matched case-insensitively and support glob-style `*`.
pub fn is_allowed(id: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let id_lower = id.to_lowercase();
    allowlist.iter().any(|pattern| {
        let pat = pattern.to_lowercase();
        if pat.contains('*') {
            glob_match(&pat, &id_lower)
        } else {
            pat == id_lower
        }
    })
}

/// Exact, case-insensitive membership. Unlike [`is_allowed`], an empty
/// list matches nobody.
pub fn is_listed(id: &str, list: &[String]) -> bool {
    let id = id.trim();
    !id.is_empty() && list.iter().any(|entry| entry.trim().eq_ignore_ascii_case(id))
}

/// Glob matching with `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    if !parts.last().unwrap_or(&"").is_empty() {
        pos == text.len()
    } else {
        true
    }
}

/// Mention activation mode for group chats.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MentionMode {
    /// Bot must be @mentioned to respond.
    #[default]
    Mention,
    /// Bot responds to all messages.
    Always,
    /// Bot does not respond in groups.
    None,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn empty_allowlist_allows_everyone() {
        assert!(is_allowed("anyone", &[]));
    }

    #[rstest]
    #[case("alice", true)]
    #[case("Alice", true)]
    #[case("charlie", false)]
    fn exact_match(#[case] id: &str, #[case] expected: bool) {
        let list = vec!["alice".into(), "bob".into()];
        assert_eq!(is_allowed(id, &list), expected);
    }

    #[rstest]
    #[case("*", "anyone", true)]
    #[case("ops_*", "ops_alice", true)]
    #[case("ops_*", "dev_bob", false)]
    #[case("*@corp", "zhang@corp", true)]
    #[case("team_*_lead", "team_7_lead", true)]
    #[case("team_*_lead", "team_7_member", false)]
    fn glob_patterns(#[case] pattern: &str, #[case] id: &str, #[case] expected: bool) {
        assert_eq!(is_allowed(id, &[pattern.to_string()]), expected);
    }

    #[test]
    fn listed_requires_membership() {
        let admins = vec![" Root ".to_string()];
        assert!(is_listed("root", &admins));
        assert!(!is_listed("", &admins));
        assert!(!is_listed("root", &[]));
    }

    #[test]
    fn mention_mode_deserializes_lowercase() {
        let mode: MentionMode = serde_json::from_str("\"always\"").unwrap();
        assert_eq!(mode, MentionMode::Always);
    }
}
