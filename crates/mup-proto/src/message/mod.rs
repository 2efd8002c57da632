//! Message types: wire-level lines and the bot-addressed model built on top.

mod model;
mod nom_parser;
mod raw;

pub use self::model::{BotMessage, Lane};
pub use self::raw::RawMessage;
