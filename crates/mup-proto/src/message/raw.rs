//! Wire-level representation of a single IRC line.

use smallvec::SmallVec;

use crate::error::{self, MessageParseError, ProtocolError};
use crate::format::scrub_line_breaks;
use crate::prefix::Prefix;

use super::nom_parser::ParsedMessage;

/// A parsed IRC line: optional prefix, a command verb, and its parameters.
///
/// This is the wire-level shape with no notion of accounts or bot-addressing
/// — see [`crate::BotMessage`] for the enriched model the rest of `mup`
/// works with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    /// Origin of the message, if the line carried one.
    pub prefix: Option<Prefix>,
    /// The command verb (e.g. `PRIVMSG`, `001`).
    pub command: String,
    /// Positional parameters, with the trailing parameter (if any) last.
    pub params: SmallVec<[String; 15]>,
}

impl RawMessage {
    /// Construct a message with no prefix.
    pub fn new(command: impl Into<String>, params: impl IntoIterator<Item = String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params: params.into_iter().collect(),
        }
    }

    /// Parse a single IRC line (with or without trailing `\r\n`).
    pub fn parse(line: &str) -> error::Result<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidMessage {
                string: line.to_owned(),
                cause: MessageParseError::EmptyMessage,
            });
        }

        let parsed = ParsedMessage::parse(trimmed).map_err(|e| ProtocolError::InvalidMessage {
            string: line.to_owned(),
            cause: MessageParseError::ParseContext {
                position: 0,
                context: e.to_string(),
            },
        })?;

        Ok(Self {
            prefix: parsed.prefix.map(Prefix::new_from_str),
            command: parsed.command.to_ascii_uppercase(),
            params: parsed.params.iter().map(|p| (*p).to_owned()).collect(),
        })
    }

    /// The trailing parameter (the message text), if one was supplied.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Render the message back into a wire line, without the trailing
    /// newline. Any `\r`, `\n`, or NUL in the output is scrubbed to `_`.
    pub fn format(&self) -> String {
        let mut out = String::new();

        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(&prefix.to_string());
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, rest)) = self.params.split_last() {
            for p in rest {
                out.push(' ');
                out.push_str(p);
            }
            out.push(' ');
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }

        scrub_line_breaks(&out)
    }
}
