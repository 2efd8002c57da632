//! `echo`: replies with its argument verbatim, optionally upper-cased and
//! prefixed, as an illustration of the `HandleCommand`-only plugin contract
//! (§4.6, §4.10).

use async_trait::async_trait;
use serde::Deserialize;

use mup_proto::command::Argument;
use mup_proto::command::CommandSchema;

use crate::plugin::{Command, Plugger, Plugin};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct EchoConfig {
    prefix: String,
}

struct Echo {
    plugger: Plugger,
    config: EchoConfig,
}

#[async_trait]
impl Plugin for Echo {
    async fn handle_command(&self, cmd: &Command) {
        let text = cmd.get_str("text").unwrap_or_default();
        let shout = cmd.get_bool("shout");
        let body = if shout { text.to_uppercase() } else { text.to_owned() };
        let reply = format!("[cmd] {}{}", self.config.prefix, body);
        self.plugger
            .sendf(&cmd.msg.address.account, cmd.msg.address.clone(), reply)
            .await;
    }

    async fn stop(&self) {}
}

pub fn schema() -> CommandSchema {
    CommandSchema::new("echo")
        .arg(Argument::trailing("text", true))
        .arg(Argument::option("shout", mup_proto::command::ArgKind::Bool, false))
}

pub fn start(plugger: Plugger) -> std::sync::Arc<dyn Plugin> {
    let config = plugger.config().unwrap_or_default();
    std::sync::Arc::new(Echo { plugger, config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ldap::LdapPool;
    use mup_proto::{Address, BotMessage};
    use serde_json::json;

    async fn test_plugger(config: serde_json::Value) -> Plugger {
        let db = Database::new(":memory:").await.unwrap();
        let ldap = LdapPool::new(db.clone());
        Plugger::new("echo".into(), db, ldap, config, Vec::new(), 300, 50)
    }

    fn cmd(text: &str, shout: bool) -> Command {
        let msg = BotMessage::new_outgoing("one", Address::default(), "PRIVMSG", "");
        let input = if shout { format!("-shout {text}") } else { text.to_owned() };
        let args = schema().parse(&input).unwrap();
        Command::new(msg, "echo".into(), args)
    }

    #[tokio::test]
    async fn test_echo_replies_with_prefix() {
        let plugger = test_plugger(json!({"prefix": "A."})).await;
        let echo = start(plugger);
        echo.handle_command(&cmd("hello", false)).await;
    }

    #[tokio::test]
    async fn test_echo_shout_uppercases() {
        let plugger = test_plugger(json!({})).await;
        let echo = start(plugger);
        echo.handle_command(&cmd("hello", true)).await;
    }
}
