//! `help`: lists registered commands, or shows one command's usage, reading
//! straight out of the store's schema tables rather than the live plugin
//! registry — a registered command is discoverable whether or not its home
//! plugin instance happens to be running right now (§4.6, §4.10).

use async_trait::async_trait;

use crate::plugin::{Command, Plugger, Plugin};

struct Help {
    plugger: Plugger,
}

#[async_trait]
impl Plugin for Help {
    async fn handle_command(&self, cmd: &Command) {
        let db = self.plugger.db();
        let reply = match cmd.get_str("command") {
            Some(name) => match usage_for(db, name).await {
                Some(usage) => usage,
                None => format!("no such command: {name}"),
            },
            None => command_list(db).await,
        };
        self.plugger
            .sendf(&cmd.msg.address.account, cmd.msg.address.clone(), reply)
            .await;
    }

    async fn stop(&self) {}
}

async fn command_list(db: &crate::db::Database) -> String {
    let plugins = db.plugins().list().await.unwrap_or_default();
    let mut names = Vec::new();
    for plugin in plugins {
        let commands = db.schemas().commands_for_plugin(&plugin.name).await.unwrap_or_default();
        names.extend(commands.into_iter().map(|c| c.name));
    }
    if names.is_empty() {
        "no commands registered".to_owned()
    } else {
        names.sort();
        format!("known commands: {}", names.join(", "))
    }
}

async fn usage_for(db: &crate::db::Database, name: &str) -> Option<String> {
    let plugins = db.plugins().list().await.ok()?;
    for plugin in plugins {
        let commands = db.schemas().commands_for_plugin(&plugin.name).await.ok()?;
        if let Some(found) = commands.iter().find(|c| c.name == name) {
            let args: Vec<String> = found
                .arguments
                .iter()
                .map(|a| {
                    if a.is_option {
                        format!("-{}", a.name)
                    } else if a.trailing {
                        format!("<{}...>", a.name)
                    } else {
                        format!("<{}>", a.name)
                    }
                })
                .collect();
            return Some(format!("{} {}", name, args.join(" ")).trim_end().to_owned());
        }
    }
    None
}

pub fn schema() -> mup_proto::command::CommandSchema {
    mup_proto::command::CommandSchema::new("help")
        .arg(mup_proto::command::Argument::optional_positional("command"))
}

pub fn start(plugger: Plugger) -> std::sync::Arc<dyn Plugin> {
    std::sync::Arc::new(Help { plugger })
}
