//! The bound argument-set a plugin receives for one command-to-bot
//! invocation (§4.2, §4.6).

use mup_proto::command::ParsedArgs;
use mup_proto::BotMessage;

/// A parsed command-to-bot: the originating message plus its bound
/// arguments. Rust has no reflective struct-binding, so callers fetch
/// fields by name through the typed getters instead of `cmd.Args(&out)`.
pub struct Command {
    pub msg: BotMessage,
    pub name: String,
    args: ParsedArgs,
}

impl Command {
    pub fn new(msg: BotMessage, name: String, args: ParsedArgs) -> Self {
        Self { msg, name, args }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.args.get_str(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.args.get_int(name)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.args.get_bool(name)
    }
}
