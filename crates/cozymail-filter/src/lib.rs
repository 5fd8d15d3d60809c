//! Per-message routing decisions that need no network access: user rules,
//! the sender whitelist and the header spam score.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use cozymail_core::{FetchedMessage, FilterRule};

pub const DEFAULT_TARGET_FOLDER: &str = "INBOX";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleField {
    Subject,
    Sender,
    To,
    Body,
    Headers,
}

impl RuleField {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "subject" => Some(RuleField::Subject),
            "sender" | "from" => Some(RuleField::Sender),
            "to" => Some(RuleField::To),
            "body" => Some(RuleField::Body),
            "headers" => Some(RuleField::Headers),
            _ => None,
        }
    }

    fn haystack(self, message: &FetchedMessage) -> String {
        match self {
            RuleField::Subject => message.subject.clone(),
            RuleField::Sender => message.sender_address.clone(),
            RuleField::To => message.to_address.clone(),
            RuleField::Body => message.text.clone(),
            RuleField::Headers => message.headers_text(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    Contains,
    StartsWith,
    EndsWith,
    Exact,
    Regex,
}

impl MatchMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contains" => Some(MatchMode::Contains),
            "startswith" => Some(MatchMode::StartsWith),
            "endswith" => Some(MatchMode::EndsWith),
            "exact" => Some(MatchMode::Exact),
            "regex" => Some(MatchMode::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: i64,
    pub target_folder: String,
    pub mark_read: bool,
}

/// First active rule (in the order given) that matches wins. Rules with an
/// unknown field or mode, or a pattern that does not compile, are skipped.
pub fn evaluate(rules: &[FilterRule], message: &FetchedMessage) -> Option<RuleMatch> {
    for rule in rules.iter().filter(|r| r.active) {
        let Some(field) = RuleField::parse(&rule.field) else {
            tracing::debug!(rule_id = rule.id, field = %rule.field, "skipping rule with unknown field");
            continue;
        };
        let Some(mode) = MatchMode::parse(&rule.mode) else {
            tracing::debug!(rule_id = rule.id, mode = %rule.mode, "skipping rule with unknown mode");
            continue;
        };
        let haystack = field.haystack(message);
        if matches(mode, &rule.value, &haystack, rule.id) {
            return Some(RuleMatch {
                rule_id: rule.id,
                target_folder: resolve_folder(rule.target_folder.as_deref()),
                mark_read: rule.mark_read,
            });
        }
    }
    None
}

fn matches(mode: MatchMode, value: &str, haystack: &str, rule_id: i64) -> bool {
    if mode == MatchMode::Regex {
        return match Regex::new(value) {
            Ok(re) => re.is_match(haystack),
            Err(err) => {
                tracing::warn!(rule_id, error = %err, "skipping rule with invalid pattern");
                false
            }
        };
    }
    let needle = value.to_lowercase();
    let haystack = haystack.to_lowercase();
    match mode {
        MatchMode::Contains => haystack.contains(&needle),
        MatchMode::StartsWith => haystack.starts_with(&needle),
        MatchMode::EndsWith => haystack.ends_with(&needle),
        MatchMode::Exact => haystack == needle,
        MatchMode::Regex => false,
    }
}

fn resolve_folder(raw: Option<&str>) -> String {
    let decoded = percent_decode(raw.unwrap_or("").trim());
    if decoded.trim().is_empty() {
        DEFAULT_TARGET_FOLDER.to_string()
    } else {
        decoded
    }
}

/// `%XX` escapes only; `+` stays literal since folder names may contain it.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (from_hex(bytes[i + 1]), from_hex(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn from_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// `*` matches any run of characters; everything else is literal. The whole
/// address must match, ignoring case. Blank entries never match.
pub fn is_whitelisted<'a, I>(sender_address: &str, entries: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let sender = sender_address.trim();
    if sender.is_empty() {
        return false;
    }
    entries
        .into_iter()
        .filter_map(wildcard_pattern)
        .any(|re| re.is_match(sender))
}

fn wildcard_pattern(entry: &str) -> Option<Regex> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let body = entry
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
        .ok()
}

/// Number of `*` markers in an `X-Spam-Level` style header.
pub fn spam_level(header: Option<&str>) -> u32 {
    header
        .map(|value| value.chars().filter(|c| *c == '*').count() as u32)
        .unwrap_or(0)
}

/// Header score and model prediction, OR-combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpamVerdict {
    pub level: u32,
    pub threshold: u32,
    pub model_says_spam: bool,
}

impl SpamVerdict {
    pub fn header_hit(&self) -> bool {
        self.level >= self.threshold
    }

    pub fn is_spam(&self) -> bool {
        self.header_hit() || self.model_says_spam
    }

    pub fn reason(&self) -> String {
        let mut reasons = Vec::new();
        if self.header_hit() {
            reasons.push(format!("Level {} ≥ {}", self.level, self.threshold));
        }
        if self.model_says_spam {
            reasons.push("ML".to_string());
        }
        reasons.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use cozymail_core::{FetchedMessage, FilterRule};

    use super::{SpamVerdict, evaluate, is_whitelisted, percent_decode, spam_level};

    fn rule(id: i64, field: &str, mode: &str, value: &str, target: Option<&str>) -> FilterRule {
        FilterRule {
            id,
            account_id: 1,
            field: field.to_string(),
            mode: mode.to_string(),
            value: value.to_string(),
            target_folder: target.map(str::to_string),
            mark_read: false,
            active: true,
            created_at: format!("2024-01-01T00:00:0{}Z", id),
            usage_count: 0,
            last_used: None,
        }
    }

    fn message() -> FetchedMessage {
        FetchedMessage {
            uid: 1,
            from: "Weekly News <News@Letters.test>".to_string(),
            sender_address: "News@Letters.test".to_string(),
            to_address: "me@example.com".to_string(),
            subject: "Your Weekly Digest".to_string(),
            headers: vec![
                ("List-Id".to_string(), "<weekly.letters.test>".to_string()),
                ("X-Spam-Level".to_string(), "**".to_string()),
            ],
            text: "Top stories this week".to_string(),
            ..FetchedMessage::default()
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule(1, "subject", "contains", "weekly", Some("News")),
            rule(2, "sender", "endswith", "@letters.test", Some("Other")),
        ];
        let hit = evaluate(&rules, &message());
        assert_eq!(hit.map(|m| (m.rule_id, m.target_folder)), Some((1, "News".to_string())));
    }

    #[test]
    fn modes_are_case_insensitive_except_regex() {
        let msg = message();
        for (field, mode, value) in [
            ("subject", "startswith", "YOUR weekly"),
            ("from", "exact", "news@letters.test"),
            ("to", "endswith", "EXAMPLE.COM"),
            ("body", "contains", "STORIES"),
            ("headers", "contains", "list-id: <weekly"),
            ("subject", "regex", r"Weekly\s+Digest$"),
        ] {
            let rules = vec![rule(1, field, mode, value, Some("X"))];
            assert!(evaluate(&rules, &msg).is_some(), "{} {} {}", field, mode, value);
        }
        let rules = vec![rule(1, "subject", "regex", "weekly digest", Some("X"))];
        assert!(evaluate(&rules, &msg).is_none());
    }

    #[test]
    fn bad_rules_are_skipped_not_fatal() {
        let mut inactive = rule(3, "subject", "contains", "weekly", Some("Inactive"));
        inactive.active = false;
        let rules = vec![
            rule(1, "subject", "regex", "([unclosed", Some("Broken")),
            rule(2, "cc", "contains", "weekly", Some("Unknown")),
            rule(4, "subject", "fuzzy", "weekly", Some("Unknown")),
            inactive,
            rule(5, "subject", "contains", "digest", Some("Good")),
        ];
        let hit = evaluate(&rules, &message());
        assert_eq!(hit.map(|m| m.rule_id), Some(5));
    }

    #[test]
    fn target_folder_is_decoded_and_defaults_to_inbox() {
        let rules = vec![rule(1, "subject", "contains", "weekly", Some("INBOX.Caf%C3%A9%20Club"))];
        let hit = evaluate(&rules, &message());
        assert_eq!(hit.map(|m| m.target_folder), Some("INBOX.Café Club".to_string()));

        for target in [None, Some(""), Some("  ")] {
            let rules = vec![rule(1, "subject", "contains", "weekly", target)];
            let hit = evaluate(&rules, &message());
            assert_eq!(hit.map(|m| m.target_folder), Some("INBOX".to_string()));
        }
    }

    #[test]
    fn percent_decode_leaves_plus_and_bad_escapes() {
        assert_eq!(percent_decode("C++%2FNotes"), "C++/Notes");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn wildcard_whitelist_matches_whole_address_only() {
        let entries = ["*@example.com"];
        assert!(is_whitelisted("user@example.com", entries));
        assert!(is_whitelisted("a.b@example.com", entries));
        assert!(is_whitelisted("USER@Example.COM", entries));
        assert!(!is_whitelisted("user@example.com.evil.net", entries));
        assert!(!is_whitelisted("user@notexample.org", entries));
    }

    #[test]
    fn exact_whitelist_entries_and_blanks() {
        assert!(is_whitelisted("boss@corp.test", [" Boss@Corp.test "]));
        assert!(!is_whitelisted("boss@corp.test.evil", ["boss@corp.test"]));
        assert!(!is_whitelisted("boss@corp.test", ["", "   "]));
        assert!(!is_whitelisted("", ["*"]));
        assert!(is_whitelisted("a+b@x.test", ["a+b@x.test"]));
    }

    #[test]
    fn spam_level_counts_stars() {
        assert_eq!(spam_level(Some("****")), 4);
        assert_eq!(spam_level(Some(" ** * ")), 3);
        assert_eq!(spam_level(None), 0);
    }

    #[test]
    fn verdict_or_combines_and_explains() {
        let header_only = SpamVerdict {
            level: 4,
            threshold: 3,
            model_says_spam: false,
        };
        assert!(header_only.is_spam());
        assert_eq!(header_only.reason(), "Level 4 ≥ 3");

        let both = SpamVerdict {
            model_says_spam: true,
            ..header_only
        };
        assert_eq!(both.reason(), "Level 4 ≥ 3, ML");

        let clean = SpamVerdict {
            level: 2,
            threshold: 5,
            model_says_spam: false,
        };
        assert!(!clean.is_spam());
        assert_eq!(clean.reason(), "");
    }
}
