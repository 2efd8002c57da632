//! # mup-proto
//!
//! Wire-level IRC parsing/encoding plus the declarative bot command schema
//! shared by every account client and plugin in `mup`.
//!
//! This crate is deliberately narrow: it knows how to turn an IRC line into
//! an [`Address`]ed, bot-aware [`BotMessage`], how to turn one back into a
//! wire line, and how to parse free text against a plugin's declared
//! [`command::CommandSchema`]. It does not know about accounts, plugins, or
//! storage — those live in the `mup` binary crate.
//!
//! ## Parsing and formatting a line
//!
//! ```rust
//! use mup_proto::{BotMessage, Lane};
//!
//! let msg = BotMessage::parse_incoming(
//!     ":nick!~user@host PRIVMSG mup :Hello mup!",
//!     "one",
//!     "mup",
//!     Some('!'),
//! )
//! .unwrap();
//! assert_eq!(msg.bot_text.as_deref(), Some("Hello mup!"));
//! assert_eq!(msg.lane, Lane::Inbound);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod casemap;
pub mod chan;
pub mod command;
pub mod error;
pub mod format;
#[cfg(feature = "tokio")]
pub mod irc;
#[cfg(feature = "tokio")]
pub mod line;
pub mod message;
pub mod nick;
pub mod prefix;
pub mod util;

pub use self::address::Address;
pub use self::chan::ChannelExt;
pub use self::error::{MessageParseError, ProtocolError};
#[cfg(feature = "tokio")]
pub use self::irc::RawCodec;
pub use self::message::{BotMessage, Lane, RawMessage};
pub use self::nick::{NickExt, DEFAULT_NICK_MAX_LEN};
pub use self::prefix::Prefix;
