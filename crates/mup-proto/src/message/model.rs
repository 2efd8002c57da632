//! The enriched, address-aware message model stored on the bus.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::address::Address;
use crate::chan::ChannelExt;
use crate::error;
use crate::prefix::Prefix;

use super::raw::RawMessage;

/// Direction a stored message travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Lane {
    /// Received from a transport.
    Inbound = 1,
    /// Queued by a plugin for delivery.
    Outbound = 2,
}

impl Lane {
    /// The integer representation stored in the `lane` column.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Reconstruct a lane from its stored integer representation.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Lane::Inbound),
            2 => Some(Lane::Outbound),
            _ => None,
        }
    }
}

/// A single record on the shared message bus.
///
/// This is the address-aware, bot-addressing-aware shape every account
/// client and plugin works with. It is produced either by parsing an
/// inbound wire line ([`BotMessage::parse_incoming`]) or by a plugin
/// composing a reply ([`BotMessage::parse_outgoing`] / [`BotMessage::new_outgoing`]),
/// and is what the store round-trips as rows in the `message` table.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BotMessage {
    /// Monotonic id assigned by the store; `None` until inserted.
    pub id: Option<i64>,
    /// Random 16-byte hex string, unique per `(nonce, lane)`.
    pub nonce: String,
    /// Direction this message travels.
    pub lane: Lane,
    /// Event time, Unix seconds.
    pub time: i64,
    /// Who this message is from/to.
    pub address: Address,
    /// The IRC command verb.
    pub command: String,
    /// Raw parameters, populated for commands other than PRIVMSG/NOTICE.
    pub params: Vec<String>,
    /// Trailing text payload, populated for PRIVMSG/NOTICE.
    pub text: Option<String>,
    /// The portion of `text` addressed to the bot, if any.
    pub bot_text: Option<String>,
    /// The bang prefix active when this message was observed, if configured.
    pub bang: Option<char>,
    /// The nick the bot was using when this message was observed.
    pub as_nick: String,
}

impl BotMessage {
    /// Parse an inbound wire line into a bot-addressed message.
    ///
    /// `account` identifies the account the line arrived on; `as_nick` and
    /// `bang` are the connection settings in effect at the time, used to
    /// derive [`BotMessage::bot_text`].
    pub fn parse_incoming(
        line: &str,
        account: &str,
        as_nick: &str,
        bang: Option<char>,
    ) -> error::Result<Self> {
        let raw = RawMessage::parse(line)?;

        let (nick, user, host) = match &raw.prefix {
            Some(Prefix::Nickname(n, u, h)) => (n.clone(), u.clone(), h.clone()),
            Some(Prefix::ServerName(name)) => (String::new(), String::new(), name.clone()),
            None => (String::new(), String::new(), String::new()),
        };

        let command = raw.command.clone();
        let mut address = Address {
            account: account.to_owned(),
            channel: String::new(),
            nick,
            user,
            host,
        };

        let mut params = Vec::new();
        let mut text = None;
        let mut bot_text = None;

        if command == "PRIVMSG" || command == "NOTICE" {
            let target = raw.params.first().cloned().unwrap_or_default();
            if target.is_channel_name() {
                address.channel = target.clone();
            }
            let body = raw.trailing().unwrap_or_default().to_owned();
            if command == "PRIVMSG" {
                bot_text = derive_bot_text(&target, &body, as_nick, bang);
            }
            text = Some(body);
        } else {
            params = raw.params.iter().cloned().collect();
        }

        Ok(Self {
            id: None,
            nonce: generate_nonce(),
            lane: Lane::Inbound,
            time: now_unix(),
            address,
            command,
            params,
            text,
            bot_text,
            bang,
            as_nick: as_nick.to_owned(),
        })
    }

    /// Build an outbound message bound for `address`, leaving addressing
    /// untouched (per §4.1, outgoing parsing does no bot-text derivation).
    pub fn new_outgoing(account: &str, address: Address, command: &str, text: impl Into<String>) -> Self {
        Self {
            id: None,
            nonce: generate_nonce(),
            lane: Lane::Outbound,
            time: now_unix(),
            address: Address {
                account: account.to_owned(),
                ..address
            },
            command: command.to_owned(),
            params: Vec::new(),
            text: Some(text.into()),
            bot_text: None,
            bang: None,
            as_nick: String::new(),
        }
    }

    /// Render this message as a wire line, preferring `address.channel` as
    /// the PRIVMSG target, falling back to `as_nick` then `address.nick`.
    pub fn format(&self) -> String {
        let target = if !self.address.channel.is_empty() {
            self.address.channel.as_str()
        } else if !self.as_nick.is_empty() {
            self.as_nick.as_str()
        } else {
            self.address.nick.as_str()
        };

        let params: smallvec::SmallVec<[String; 15]> = match self.text.as_ref() {
            Some(text) => vec![target.to_owned(), text.clone()].into(),
            None => self.params.iter().cloned().collect(),
        };

        let raw = RawMessage {
            prefix: None,
            command: self.command.clone(),
            params,
        };
        raw.format()
    }
}

/// Implements the §4.1 bot-addressing derivation: a PRIVMSG is "to the bot"
/// if the target is the bot's nick, the text opens with `<nick>[:,]` or
/// `@<nick>[:, ]`, or (bang mode) the text opens with the bang character
/// followed by a letter.
fn derive_bot_text(target: &str, text: &str, as_nick: &str, bang: Option<char>) -> Option<String> {
    if !as_nick.is_empty() && target == as_nick {
        return Some(text.to_owned());
    }

    if !as_nick.is_empty() {
        for form in [
            format!("{as_nick}:"),
            format!("{as_nick},"),
            format!("@{as_nick}:"),
            format!("@{as_nick},"),
            format!("@{as_nick} "),
        ] {
            if let Some(rest) = text.strip_prefix(form.as_str()) {
                return Some(rest.trim_start().to_owned());
            }
        }
    }

    if let Some(bang) = bang {
        let mut chars = text.chars();
        if chars.next() == Some(bang) {
            if let Some(next) = chars.next() {
                if next.is_alphabetic() {
                    return Some(text[bang.len_utf8()..].to_owned());
                }
            }
        }
    }

    None
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
