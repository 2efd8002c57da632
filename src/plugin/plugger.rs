//! The plugger facade (§4.6, §4.7, §4.8): everything a plugin instance
//! gets handed at start, plus the outbound composition logic (auto-split,
//! reply prefixing, moniker resolution) shared by every send path.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use mup_proto::{Address, BotMessage, Lane};

use crate::db::{Database, TargetRecord};
use crate::ldap::{LdapError, LdapHandle, LdapPool};

use std::sync::Arc;

/// What a plugin instance is handed at start. Config and targets are
/// snapshot once here (§5: "mutations require a restart").
pub struct Plugger {
    name: String,
    db: Database,
    ldap: Arc<LdapPool>,
    config: Value,
    targets: Vec<TargetRecord>,
    max_text_len: usize,
    min_text_len: usize,
}

impl Plugger {
    pub fn new(
        name: String,
        db: Database,
        ldap: Arc<LdapPool>,
        config: Value,
        targets: Vec<TargetRecord>,
        max_text_len: usize,
        min_text_len: usize,
    ) -> Self {
        Self {
            name,
            db,
            ldap,
            config,
            targets,
            max_text_len,
            min_text_len,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logf(&self, text: impl std::fmt::Display) {
        info!(plugin = %self.name, "{text}");
    }

    pub fn debugf(&self, text: impl std::fmt::Display) {
        debug!(plugin = %self.name, "{text}");
    }

    /// Unmarshal this instance's config JSON into `T`.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.config.clone())
    }

    /// Read-only share of the store.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Check out a leased LDAP handle by name (§4.9).
    pub fn ldap(&self, name: &str) -> Result<LdapHandle, LdapError> {
        self.ldap.get(name)
    }

    /// This instance's target scopes, in declaration order.
    pub fn targets(&self) -> &[TargetRecord] {
        &self.targets
    }

    /// The first target whose scope contains `msg`'s address, if any.
    pub fn target(&self, msg: &BotMessage) -> Option<&TargetRecord> {
        self.targets.iter().find(|t| t.address().contains(&msg.address))
    }

    /// Compose and queue a reply, prefixed with the addressed nick when the
    /// target has both a channel and a nick (§4.7).
    pub async fn sendf(&self, account: &str, address: Address, text: impl Into<String>) {
        let prefix = reply_prefix(&self.db, account, &address).await;
        let body = format!("{prefix}{}", text.into());
        queue_outbound(&self.db, account, address, "PRIVMSG", body, self.max_text_len, self.min_text_len).await;
    }

    /// Send to a nick directly, ignoring any channel on the target.
    pub async fn send_directf(&self, account: &str, nick: &str, text: impl Into<String>) {
        let address = Address {
            account: account.to_owned(),
            nick: nick.to_owned(),
            ..Address::default()
        };
        queue_outbound(&self.db, account, address, "PRIVMSG", text.into(), self.max_text_len, self.min_text_len).await;
    }

    /// Send to a channel directly, ignoring any nick on the target.
    pub async fn send_channelf(&self, account: &str, channel: &str, text: impl Into<String>) {
        let address = Address {
            account: account.to_owned(),
            channel: channel.to_owned(),
            ..Address::default()
        };
        queue_outbound(&self.db, account, address, "PRIVMSG", text.into(), self.max_text_len, self.min_text_len).await;
    }

    /// Send the same text to every declared target.
    pub async fn broadcastf(&self, text: impl Into<String>) {
        let text = text.into();
        for target in &self.targets {
            if target.account.is_empty() {
                continue;
            }
            let address = Address {
                channel: target.channel.clone(),
                nick: target.nick.clone(),
                ..Address::default()
            };
            self.sendf(&target.account, address, text.clone()).await;
        }
    }

    /// Queue a fully-formed message as-is (no reply prefix). Used when a
    /// plugin wants full control over command/address/text.
    pub async fn send(&self, msg: BotMessage) {
        let mut msg = msg;
        msg.lane = Lane::Outbound;
        let text = msg.text.clone().unwrap_or_default();
        queue_outbound(
            &self.db,
            &msg.address.account.clone(),
            msg.address,
            &msg.command,
            text,
            self.max_text_len,
            self.min_text_len,
        )
        .await;
    }

    /// Inject `msg` onto the inbound lane, as if a transport had delivered
    /// it (§4.6 `Handle`).
    pub async fn handle(&self, msg: BotMessage) {
        let mut msg = msg;
        msg.lane = Lane::Inbound;
        if let Err(e) = self.db.messages().insert(&msg).await {
            warn!(plugin = %self.name, error = %e, "failed to inject inbound message");
        }
    }
}

/// The nick-prefix a reply is composed with when the target names both a
/// channel and a nick (§4.7): `<nick>: ` on IRC, `@<nick> ` on transports
/// whose account kind is `telegram` or `webhook`. Monikers (§4.8) override
/// the displayed nick. Empty if the target doesn't name both.
pub(crate) async fn reply_prefix(db: &Database, account: &str, address: &Address) -> String {
    if address.channel.is_empty() || address.nick.is_empty() {
        return String::new();
    }

    let nick = match db.monikers().resolve(account, &address.channel, &address.nick).await {
        Ok(Some(name)) => name,
        _ => address.nick.clone(),
    };

    let kind = db.accounts().get(account).await.map(|a| a.kind).unwrap_or_default();
    if kind == "telegram" || kind == "webhook" {
        format!("@{nick} ")
    } else {
        format!("{nick}: ")
    }
}

/// Stamp, trim, auto-split, and insert one or more outbound rows (§4.7).
pub(crate) async fn queue_outbound(
    db: &Database,
    account: &str,
    address: Address,
    command: &str,
    text: String,
    max_text_len: usize,
    min_text_len: usize,
) {
    let trimmed = text.trim_end();
    for fragment in split_text(trimmed, max_text_len, min_text_len) {
        let msg = BotMessage::new_outgoing(account, address.clone(), command, fragment);
        if let Err(e) = db.messages().insert(&msg).await {
            warn!(account = %account, error = %e, "failed to queue outbound message");
        }
    }
}

/// Split `text` into cap-respecting fragments (§4.7, §8):
/// 1. Prefer the last space at or before `max_len`.
/// 2. If that leaves a tail shorter than `min_len`, retry near the
///    midpoint instead, to avoid a tiny awkward trailing fragment.
/// 3. If no space exists inside the cap, accept a small overshoot or fall
///    back to a hard midpoint break.
/// 4. Recurse on the remaining tail.
///
/// Invariants: no fragment exceeds `max_len`; no non-terminal fragment ends
/// in whitespace; joining the fragments with a single space between
/// non-empty ones reproduces `text` after a right-trim.
pub fn split_text(text: &str, max_len: usize, min_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            let fragment: String = chars[start..].iter().collect();
            let trimmed = fragment.trim_end();
            if !trimmed.is_empty() {
                out.push(trimmed.to_owned());
            }
            break;
        }

        let cap_end = start + max_len;
        let split_at = choose_split(&chars, start, cap_end, min_len);

        let fragment: String = chars[start..split_at].iter().collect();
        let trimmed = fragment.trim_end();
        if !trimmed.is_empty() {
            out.push(trimmed.to_owned());
        }

        let mut next = split_at;
        if next < chars.len() && chars[next] == ' ' {
            next += 1;
        }
        start = next;
    }

    out
}

fn choose_split(chars: &[char], start: usize, cap_end: usize, min_len: usize) -> usize {
    let cap_end = cap_end.min(chars.len());

    if let Some(pos) = (start..cap_end).rev().find(|&i| chars[i] == ' ') {
        let tail_len = chars.len() - pos - 1;
        if tail_len >= min_len {
            return pos;
        }

        // Tail too small: retry near the midpoint, preferring the nearest
        // space after it so the head isn't starved either.
        let mid = start + (cap_end - start) / 2;
        if let Some(p) = (mid..cap_end).find(|&i| chars[i] == ' ') {
            return p;
        }
        if let Some(p) = (start..mid).rev().find(|&i| chars[i] == ' ') {
            return p;
        }
        return pos;
    }

    // No space inside the cap at all: if the next word boundary is only
    // slightly past the cap, it isn't worth a mid-word break there either —
    // cut exactly at the cap (never past it, per the max_len invariant).
    // Otherwise this is one long run with no nearby boundary; hard-break at
    // the midpoint instead.
    let overshoot_budget = (cap_end - start) / 10;
    let overshoot_end = chars.len().min(cap_end + overshoot_budget + 1);
    if (cap_end..overshoot_end).any(|i| chars[i] == ' ') {
        return cap_end;
    }

    ((start + cap_end) / 2).max(start + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_not_split() {
        let fragments = split_text("hello there", 300, 50);
        assert_eq!(fragments, vec!["hello there".to_owned()]);
    }

    #[test]
    fn test_no_fragment_exceeds_max_len() {
        let text = "word ".repeat(200);
        let fragments = split_text(text.trim_end(), 60, 20);
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.chars().count() <= 60, "fragment too long: {fragment:?}");
        }
    }

    #[test]
    fn test_no_non_terminal_fragment_ends_in_whitespace() {
        let text = "word ".repeat(200);
        let fragments = split_text(text.trim_end(), 60, 20);
        for fragment in &fragments[..fragments.len() - 1] {
            assert!(!fragment.ends_with(' '), "fragment ends in whitespace: {fragment:?}");
        }
    }

    #[test]
    fn test_concatenation_round_trips() {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(10);
        let trimmed = text.trim_end().to_owned();
        let fragments = split_text(&trimmed, 40, 10);
        let rejoined = fragments.join(" ");
        assert_eq!(rejoined, trimmed);
    }

    #[test]
    fn test_hard_break_with_no_spaces() {
        let text = "a".repeat(500);
        let fragments = split_text(&text, 100, 20);
        assert!(fragments.len() >= 5);
        for fragment in &fragments {
            assert!(fragment.chars().count() <= 100);
        }
        assert_eq!(fragments.concat(), text);
    }

    #[test]
    fn test_token_overshooting_cap_never_exceeds_max_len() {
        // The only space is past the cap; the fragment must still stop
        // exactly at the cap rather than reaching for that space.
        let fragments = split_text("abcdefghijk lmno", 10, 3);
        for fragment in &fragments {
            assert!(fragment.chars().count() <= 10, "fragment too long: {fragment:?}");
        }
        assert_eq!(fragments.concat(), "abcdefghijk lmno");
    }

    #[tokio::test]
    async fn test_reply_prefix_empty_without_both_channel_and_nick() {
        let db = Database::new(":memory:").await.unwrap();
        let channel_only = Address {
            account: "one".into(),
            channel: "#chan".into(),
            ..Address::default()
        };
        assert_eq!(reply_prefix(&db, "one", &channel_only).await, "");
    }

    #[tokio::test]
    async fn test_reply_prefix_irc_style_with_channel_and_nick() {
        let db = Database::new(":memory:").await.unwrap();
        db.accounts()
            .upsert(&crate::db::AccountRecord {
                name: "one".into(),
                kind: "irc".into(),
                endpoint: String::new(),
                host: String::new(),
                tls: false,
                tls_insecure: false,
                nick: "mup".into(),
                identity: String::new(),
                password: String::new(),
                last_id: 0,
            })
            .await
            .unwrap();

        let address = Address {
            account: "one".into(),
            channel: "#chan".into(),
            nick: "someone".into(),
            ..Address::default()
        };
        assert_eq!(reply_prefix(&db, "one", &address).await, "someone: ");
    }

    #[tokio::test]
    async fn test_reply_prefix_at_style_for_telegram() {
        let db = Database::new(":memory:").await.unwrap();
        db.accounts()
            .upsert(&crate::db::AccountRecord {
                name: "tg".into(),
                kind: "telegram".into(),
                endpoint: String::new(),
                host: String::new(),
                tls: false,
                tls_insecure: false,
                nick: "mup".into(),
                identity: String::new(),
                password: String::new(),
                last_id: 0,
            })
            .await
            .unwrap();

        let address = Address {
            account: "tg".into(),
            channel: "#group:1".into(),
            nick: "someone".into(),
            ..Address::default()
        };
        assert_eq!(reply_prefix(&db, "tg", &address).await, "@someone ");
    }
}
