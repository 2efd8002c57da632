//! Error types for wire parsing and command-schema parsing.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 decoding error.
    #[error("decode error: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    /// Message exceeded maximum allowed length.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong {
        /// Actual message length.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// Illegal control character in message.
    #[error("illegal control character: {0:?}")]
    IllegalControlChar(char),

    /// Failed to parse an IRC message.
    #[error("invalid message: {string}")]
    InvalidMessage {
        /// The invalid message string.
        string: String,
        /// The underlying parse error.
        #[source]
        cause: MessageParseError,
    },
}

/// Errors encountered when parsing IRC messages.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum MessageParseError {
    /// Message was empty.
    #[error("empty message")]
    EmptyMessage,

    /// Command was invalid or missing.
    #[error("invalid command")]
    InvalidCommand,

    /// Invalid message prefix.
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// Parsing error with detailed context information.
    #[error("parsing failed at position {position}: {context}")]
    ParseContext {
        /// Character position where parsing failed.
        position: usize,
        /// Description of what was being parsed.
        context: String,
    },
}

/// Errors from the declarative bot-command parser (§4.2 of the schema).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandParseError {
    /// The text didn't select any known command name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// An option (`-foo`) isn't declared in the schema.
    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    /// A typed option (`-foo=value`) was given with no value.
    #[error("missing value for argument: {0}")]
    MissingValue(String),

    /// A value couldn't be parsed as the argument's declared type.
    #[error("cannot parse argument {name} as {kind}: {value}")]
    CannotParse {
        /// Argument name.
        name: String,
        /// The declared type name (string/int/bool).
        kind: &'static str,
        /// The raw text that failed to parse.
        value: String,
    },

    /// A required positional or option was never supplied.
    #[error("missing input for argument: {0}")]
    MissingRequired(String),

    /// Input remained after every declared argument was consumed.
    #[error("unexpected trailing input: {0}")]
    UnexpectedTrailing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MessageTooLong {
            actual: 1024,
            limit: 512,
        };
        assert_eq!(
            format!("{}", err),
            "message too long: 1024 bytes (limit: 512)"
        );
    }

    #[test]
    fn test_command_parse_error_display() {
        let err = CommandParseError::MissingRequired("text".into());
        assert_eq!(format!("{}", err), "missing input for argument: text");
    }
}
