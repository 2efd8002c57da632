//! Plugin manager (§4.6): reconciles live plugin instances against the
//! `plugin`/`target` tables, tails the inbound lane from the smallest of
//! all plugins' cursors, fans dispatch out to each matching plugin's own
//! bounded queue, and also tails the outbound lane so outgoing-handler
//! plugins can observe what was actually sent.

mod command;
mod plugger;
mod registry;

pub use command::Command;
pub use plugger::{split_text, Plugger};
pub use registry::{register, PluginSpec};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mup_proto::command::CommandSchema;
use mup_proto::{Address, BotMessage, Lane};

use crate::db::{Database, TargetRecord};
use crate::dying::{Dying, DyingSignal};
use crate::ldap::LdapPool;

/// What a plugin instance implements, discovered by capability (§4.6, §6).
/// Every method but [`Plugin::stop`] has a no-op default; a plugin
/// overrides only the handlers its spec declares a use for.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Observe an inbound message that isn't a command-to-bot this plugin
    /// owns (§4.6).
    async fn handle_message(&self, _msg: &BotMessage) {}

    /// Handle a command-to-bot this plugin's spec declared (§4.2, §4.6).
    async fn handle_command(&self, _cmd: &Command) {}

    /// Observe an outbound message that was actually sent (§4.6).
    async fn handle_outgoing(&self, _msg: &BotMessage) {}

    /// Mandatory: release any resources before the instance is dropped
    /// (§4.6, §5).
    async fn stop(&self);
}

enum PluginEvent {
    Message(BotMessage),
    Command(Command),
    Outgoing(BotMessage),
}

struct LivePlugin {
    plugin: Arc<dyn Plugin>,
    config: Value,
    targets: Vec<TargetRecord>,
    commands: HashMap<String, CommandSchema>,
    /// Highest inbound id this plugin has been handed (§3 `Plugin.last_id`).
    /// Advanced in memory as the central tailer walks the stream; the
    /// store is checkpointed periodically (§4.6).
    last_id: i64,
    tx: mpsc::Sender<PluginEvent>,
    worker: JoinHandle<()>,
    dying: DyingSignal,
    unchecked_since_checkpoint: u32,
}

impl LivePlugin {
    fn address_matches(&self, address: &Address) -> bool {
        self.targets.iter().any(|t| t.address().contains(address))
    }
}

/// Bounded per-plugin inbound queue (§5: "plugins must not block the bus").
const PLUGIN_QUEUE_CAPACITY: usize = 256;
/// Checkpoint `last_id` to the store after this many advances, or on stop.
const CHECKPOINT_EVERY: u32 = 20;
const DISPATCH_BATCH: i64 = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Owns the set of live plugin instances keyed by (possibly `/label`-suffixed)
/// name, the LDAP pool reconciled in lockstep, and the two lane tailers
/// (§4.6, §4.9).
pub struct PluginManager {
    db: Database,
    ldap: Arc<LdapPool>,
    plugins: DashMap<String, LivePlugin>,
    max_text_len: usize,
    min_text_len: usize,
    dying: DyingSignal,
}

impl PluginManager {
    pub fn new(db: Database, max_text_len: usize, min_text_len: usize) -> (Arc<Self>, DyingSignal) {
        let ldap = LdapPool::new(db.clone());
        let (dying, _root) = DyingSignal::new();
        (
            Arc::new(Self {
                db,
                ldap,
                plugins: DashMap::new(),
                max_text_len,
                min_text_len,
                dying: dying.clone(),
            }),
            dying,
        )
    }

    /// Drive reconciliation and dispatch until told to stop (§4.6, §5).
    pub async fn run(
        self: Arc<Self>,
        selection: crate::config::Selection,
        refresh_period: Option<Duration>,
        mut dying: Dying,
    ) {
        self.refresh(&selection).await;
        self.ldap.refresh().await;

        let mut outbound_cursor = self.db.messages().max_id(Lane::Outbound).await.unwrap_or(0);

        let mut ticker = refresh_period.map(tokio::time::interval);

        loop {
            let tick = async {
                match &mut ticker {
                    Some(t) => {
                        t.tick().await;
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = dying.recv() => break,
                _ = tick => {
                    self.refresh(&selection).await;
                    self.ldap.refresh().await;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.dispatch_inbound().await;
                    outbound_cursor = self.dispatch_outgoing(outbound_cursor).await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Reconcile the live plugin set against `plugin`/`target` (§4.6).
    async fn refresh(&self, selection: &crate::config::Selection) {
        let records = match self.db.plugins().list().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to list plugins, skipping this refresh");
                return;
            }
        };
        let all_targets = match self.db.targets().list().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to list targets, skipping this refresh");
                return;
            }
        };

        let mut targets_by_plugin: HashMap<String, Vec<TargetRecord>> = HashMap::new();
        for t in all_targets {
            targets_by_plugin.entry(t.plugin.clone()).or_default().push(t);
        }

        let desired: HashSet<String> = records
            .iter()
            .map(|r| r.name.clone())
            .filter(|n| selection.allows(n))
            .collect();

        // Stop instances no longer desired, whose config/targets changed, or
        // whose dying signal fired (§4.6: "hot-change is a restart").
        let mut stale = Vec::new();
        for entry in self.plugins.iter() {
            let name = entry.key().clone();
            let live = entry.value();
            if !desired.contains(&name) || live.dying.is_dead() {
                stale.push(name);
                continue;
            }
            let record = records.iter().find(|r| r.name == name);
            let targets = targets_by_plugin.get(&name).cloned().unwrap_or_default();
            let changed = match record {
                Some(r) => r.config != live.config || targets != live.targets,
                None => true,
            };
            if changed {
                stale.push(name);
            }
        }
        for name in stale {
            if let Some((_, live)) = self.plugins.remove(&name) {
                info!(plugin = %name, "stopping plugin instance");
                self.checkpoint(&name, &live).await;
                live.dying.kill();
                live.plugin.stop().await;
                live.worker.abort();
            }
        }

        for record in &records {
            if !selection.allows(&record.name) || self.plugins.contains_key(&record.name) {
                continue;
            }
            let Some(spec) = registry::lookup(&record.name) else {
                warn!(plugin = %record.name, "no registered plugin spec for this name, skipping");
                continue;
            };

            if let Err(e) = self
                .db
                .schemas()
                .register_plugin(
                    &record.name,
                    spec.help,
                    &spec
                        .commands
                        .iter()
                        .map(|c| crate::db::CommandSchemaRecord::from_schema(&record.name, c))
                        .collect::<Vec<_>>(),
                )
                .await
            {
                warn!(plugin = %record.name, error = %e, "failed to register plugin schema");
            }

            let targets = targets_by_plugin.remove(&record.name).unwrap_or_default();
            let plugger = Plugger::new(
                record.name.clone(),
                self.db.clone(),
                self.ldap.clone(),
                record.config.clone(),
                targets.clone(),
                self.max_text_len,
                self.min_text_len,
            );
            let plugin = (spec.start)(plugger);
            let commands = spec
                .commands
                .iter()
                .map(|c| (c.name.clone(), c.clone()))
                .collect();

            let (tx, rx) = mpsc::channel(PLUGIN_QUEUE_CAPACITY);
            let (plugin_dying, worker_dying) = DyingSignal::new();
            let worker_plugin = plugin.clone();
            let worker = tokio::spawn(run_plugin_worker(worker_plugin, rx, worker_dying));

            info!(plugin = %record.name, "started plugin instance");
            self.plugins.insert(
                record.name.clone(),
                LivePlugin {
                    plugin,
                    config: record.config.clone(),
                    targets,
                    commands,
                    last_id: record.last_id,
                    tx,
                    worker,
                    dying: plugin_dying,
                    unchecked_since_checkpoint: 0,
                },
            );
        }
    }

    /// Fetch the smallest live `last_id` to resume tailing from, or the
    /// highest-recorded id among desired-but-not-yet-running plugins if
    /// none are live yet.
    fn min_last_id(&self) -> i64 {
        self.plugins
            .iter()
            .map(|e| e.value().last_id)
            .min()
            .unwrap_or(0)
    }

    /// Tail the inbound lane from the minimum cursor, fan out to every
    /// plugin whose target matches, advance per-plugin cursors in
    /// dispatch order (§4.6, §5, §8).
    async fn dispatch_inbound(&self) {
        if self.plugins.is_empty() {
            return;
        }
        let mut cursor = self.min_last_id();

        loop {
            let rows = match self
                .db
                .messages()
                .after(Lane::Inbound, None, cursor, DISPATCH_BATCH)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "inbound dispatch tail read failed");
                    return;
                }
            };
            if rows.is_empty() {
                return;
            }

            for msg in &rows {
                self.dispatch_one(msg).await;
                cursor = msg.id.unwrap_or(cursor);
            }

            if (rows.len() as i64) < DISPATCH_BATCH {
                return;
            }
        }
    }

    /// Route one inbound message: a command-to-bot goes single-delivery to
    /// the first plugin (in name order) that declares that command name
    /// and matches the address; otherwise (including an unrouted command)
    /// every matching plugin gets it as a plain message (§4.6).
    async fn dispatch_one(&self, msg: &BotMessage) {
        let id = msg.id.unwrap_or(0);
        let first_token = msg
            .bot_text
            .as_deref()
            .map(str::trim_start)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.split_whitespace().next());

        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut owner: Option<String> = None;
        if let Some(token) = first_token {
            for name in &names {
                let Some(live) = self.plugins.get(name) else { continue };
                if live.last_id >= id || !live.address_matches(&msg.address) {
                    continue;
                }
                if live.commands.contains_key(token) {
                    owner = Some(name.clone());
                    break;
                }
            }
        }

        for name in &names {
            let matched = {
                let Some(live) = self.plugins.get(name) else { continue };
                if live.last_id >= id {
                    continue;
                }
                live.address_matches(&msg.address)
            };

            if matched {
                if owner.as_deref() == Some(name.as_str()) {
                    self.deliver_command(name, msg, first_token.unwrap()).await;
                } else if first_token.is_none() || owner.is_none() {
                    // Either plain chat, or a command-to-bot nobody claimed
                    // ("unrouted"): every matching plugin sees it as a
                    // normal message (§4.6). A claimed command is
                    // single-delivery: non-owning plugins see nothing.
                    self.deliver(name, PluginEvent::Message(msg.clone())).await;
                }
            }

            self.advance(name, id).await;
        }
    }

    /// Parse a command-to-bot against its owning plugin's schema and queue
    /// it, or surface a user-visible parse error (§4.2, §7).
    async fn deliver_command(&self, name: &str, msg: &BotMessage, token: &str) {
        let Some(live) = self.plugins.get(name) else { return };
        let Some(schema) = live.commands.get(token) else { return };
        let rest = msg
            .bot_text
            .as_deref()
            .unwrap_or_default()
            .trim_start()
            .strip_prefix(token)
            .unwrap_or_default();

        match schema.parse(rest) {
            Ok(args) => {
                let cmd = Command::new(msg.clone(), token.to_owned(), args);
                drop(live);
                self.deliver(name, PluginEvent::Command(cmd)).await;
            }
            Err(e) => {
                drop(live);
                let reply_address = Address {
                    account: String::new(),
                    channel: msg.address.channel.clone(),
                    nick: msg.address.nick.clone(),
                    user: String::new(),
                    host: String::new(),
                };
                let prefix = plugger::reply_prefix(&self.db, &msg.address.account, &reply_address).await;
                let text = format!("{prefix}{e}");
                plugger::queue_outbound(
                    &self.db,
                    &msg.address.account,
                    reply_address,
                    "PRIVMSG",
                    text,
                    self.max_text_len,
                    self.min_text_len,
                )
                .await;
            }
        }
    }

    async fn deliver(&self, name: &str, event: PluginEvent) {
        let Some(live) = self.plugins.get(name) else { return };
        if live.tx.try_send(event).is_err() {
            warn!(plugin = %name, "plugin inbound queue full, dropping message");
        }
    }

    /// Advance a plugin's in-memory cursor and checkpoint to the store
    /// periodically (§4.6).
    async fn advance(&self, name: &str, id: i64) {
        let should_checkpoint = {
            let Some(mut live) = self.plugins.get_mut(name) else { return };
            if id <= live.last_id {
                return;
            }
            live.last_id = id;
            live.unchecked_since_checkpoint += 1;
            if live.unchecked_since_checkpoint >= CHECKPOINT_EVERY {
                live.unchecked_since_checkpoint = 0;
                true
            } else {
                false
            }
        };
        if should_checkpoint {
            if let Err(e) = self.db.plugins().advance_last_id(name, id).await {
                warn!(plugin = %name, error = %e, "failed to checkpoint plugin cursor");
            }
        }
    }

    /// Tail the outbound lane so outgoing-handler plugins can observe
    /// actually-sent messages; starts from "now" on first run, not from
    /// the start of history (§4.6).
    async fn dispatch_outgoing(&self, cursor: i64) -> i64 {
        if self.plugins.is_empty() {
            return cursor;
        }
        let rows = match self
            .db
            .messages()
            .after(Lane::Outbound, None, cursor, DISPATCH_BATCH)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "outgoing dispatch tail read failed");
                return cursor;
            }
        };

        let mut next_cursor = cursor;
        for msg in &rows {
            let names: Vec<String> = self
                .plugins
                .iter()
                .filter(|e| e.value().address_matches(&msg.address))
                .map(|e| e.key().clone())
                .collect();
            for name in names {
                self.deliver(&name, PluginEvent::Outgoing(msg.clone())).await;
            }
            next_cursor = msg.id.unwrap_or(next_cursor);
        }
        next_cursor
    }

    async fn checkpoint(&self, name: &str, live: &LivePlugin) {
        if let Err(e) = self.db.plugins().advance_last_id(name, live.last_id).await {
            warn!(plugin = %name, error = %e, "failed to checkpoint plugin cursor on stop");
        }
    }

    /// Stop every live plugin (§4.6, §5).
    async fn shutdown(&self) {
        let names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, live)) = self.plugins.remove(&name) {
                self.checkpoint(&name, &live).await;
                live.dying.kill();
                live.plugin.stop().await;
                live.worker.abort();
            }
        }
        debug!("plugin manager shut down");
    }
}

async fn run_plugin_worker(plugin: Arc<dyn Plugin>, mut rx: mpsc::Receiver<PluginEvent>, mut dying: Dying) {
    loop {
        tokio::select! {
            _ = dying.recv() => return,
            event = rx.recv() => {
                match event {
                    Some(PluginEvent::Message(msg)) => plugin.handle_message(&msg).await,
                    Some(PluginEvent::Command(cmd)) => plugin.handle_command(&cmd).await,
                    Some(PluginEvent::Outgoing(msg)) => plugin.handle_outgoing(&msg).await,
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Selection;
    use crate::db::{Database, PluginRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    async fn test_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    struct RecordingPlugin {
        messages: &'static StdMutex<Vec<String>>,
        commands: &'static StdMutex<Vec<String>>,
        stops: &'static AtomicUsize,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        async fn handle_message(&self, msg: &BotMessage) {
            self.messages.lock().unwrap().push(msg.text.clone().unwrap_or_default());
        }
        async fn handle_command(&self, cmd: &Command) {
            self.commands.lock().unwrap().push(cmd.get_str("text").unwrap_or_default().to_owned());
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rec_command_schema() -> CommandSchema {
        CommandSchema::new("rec").arg(mup_proto::command::Argument::trailing("text", true))
    }

    // The registry holds plain `fn` pointers (no captures), mirroring how a
    // real plugin's `start` only ever closes over its `Plugger` argument.
    // Test fixtures use one static slot per registered name instead of a
    // captured closure.
    static REC_A_MESSAGES: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_A_COMMANDS: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_A_STOPS: AtomicUsize = AtomicUsize::new(0);
    fn start_rec_a(_plugger: Plugger) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin {
            messages: REC_A_MESSAGES.get_or_init(|| StdMutex::new(Vec::new())),
            commands: REC_A_COMMANDS.get_or_init(|| StdMutex::new(Vec::new())),
            stops: &REC_A_STOPS,
        })
    }

    static REC_B_MESSAGES: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_B_COMMANDS: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_B_STOPS: AtomicUsize = AtomicUsize::new(0);
    fn start_rec_b(_plugger: Plugger) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin {
            messages: REC_B_MESSAGES.get_or_init(|| StdMutex::new(Vec::new())),
            commands: REC_B_COMMANDS.get_or_init(|| StdMutex::new(Vec::new())),
            stops: &REC_B_STOPS,
        })
    }

    static REC_C_MESSAGES: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_C_COMMANDS: OnceLock<StdMutex<Vec<String>>> = OnceLock::new();
    static REC_C_STOPS: AtomicUsize = AtomicUsize::new(0);
    fn start_rec_c(_plugger: Plugger) -> Arc<dyn Plugin> {
        Arc::new(RecordingPlugin {
            messages: REC_C_MESSAGES.get_or_init(|| StdMutex::new(Vec::new())),
            commands: REC_C_COMMANDS.get_or_init(|| StdMutex::new(Vec::new())),
            stops: &REC_C_STOPS,
        })
    }

    async fn seed_target(db: &Database, plugin: &str, account: &str) {
        db.targets()
            .insert(&TargetRecord {
                plugin: plugin.into(),
                account: account.into(),
                channel: String::new(),
                nick: String::new(),
                config: Value::Object(Default::default()),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_skips_unregistered_plugin_name() {
        let db = test_db().await;
        db.plugins()
            .upsert(&PluginRecord {
                name: "nope-not-registered".into(),
                last_id: 0,
                config: Value::Object(Default::default()),
                state: Value::Object(Default::default()),
            })
            .await
            .unwrap();

        let (manager, _dying) = PluginManager::new(db, 300, 50);
        manager.refresh(&Selection::All).await;
        assert!(manager.plugins.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_message_to_matching_target_only() {
        registry::register(PluginSpec {
            name: "recA",
            help: "records what it sees",
            commands: vec![rec_command_schema()],
            start: start_rec_a,
        });

        let db = test_db().await;
        db.plugins()
            .upsert(&PluginRecord {
                name: "recA".into(),
                last_id: 0,
                config: Value::Object(Default::default()),
                state: Value::Object(Default::default()),
            })
            .await
            .unwrap();
        seed_target(&db, "recA", "one").await;

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

        let mut in_scope = BotMessage::parse_incoming(
            ":nick!~user@host PRIVMSG #chan :just chatting",
            "one",
            "mup",
            None,
        )
        .unwrap();
        in_scope.id = Some(db.messages().insert(&in_scope).await.unwrap());

        let mut out_of_scope = BotMessage::parse_incoming(
            ":nick!~user@host PRIVMSG #chan :also chatting",
            "two",
            "mup",
            None,
        )
        .unwrap();
        out_of_scope.id = Some(db.messages().insert(&out_of_scope).await.unwrap());

        let (manager, _dying) = PluginManager::new(db.clone(), 300, 50);
        manager.refresh(&Selection::All).await;
        manager.dispatch_inbound().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            REC_A_MESSAGES.get().unwrap().lock().unwrap().as_slice(),
            ["just chatting"]
        );

        let plugin = db.plugins().get("recA").await.unwrap();
        assert_eq!(plugin.last_id, 0, "checkpoint only happens every N or on stop");

        let live = manager.plugins.get("recA").unwrap();
        assert_eq!(live.last_id, out_of_scope.id.unwrap());
    }

    #[tokio::test]
    async fn test_command_to_bot_routes_as_command_not_message() {
        registry::register(PluginSpec {
            name: "recB",
            help: "records what it sees",
            commands: vec![rec_command_schema()],
            start: start_rec_b,
        });

        let db = test_db().await;
        db.plugins()
            .upsert(&PluginRecord {
                name: "recB".into(),
                last_id: 0,
                config: Value::Object(Default::default()),
                state: Value::Object(Default::default()),
            })
            .await
            .unwrap();
        seed_target(&db, "recB", "one").await;

        let mut msg = BotMessage::parse_incoming(
            ":nick!~user@host PRIVMSG mup :rec hello there",
            "one",
            "mup",
            None,
        )
        .unwrap();
        msg.id = Some(db.messages().insert(&msg).await.unwrap());

        let (manager, _dying) = PluginManager::new(db, 300, 50);
        manager.refresh(&Selection::All).await;
        manager.dispatch_inbound().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(REC_B_MESSAGES.get_or_init(|| StdMutex::new(Vec::new())).lock().unwrap().is_empty());
        assert_eq!(
            REC_B_COMMANDS.get().unwrap().lock().unwrap().as_slice(),
            ["hello there"]
        );
    }

    #[tokio::test]
    async fn test_stop_checkpoints_and_calls_plugin_stop() {
        registry::register(PluginSpec {
            name: "recC",
            help: "records what it sees",
            commands: vec![rec_command_schema()],
            start: start_rec_c,
        });

        let db = test_db().await;
        db.plugins()
            .upsert(&PluginRecord {
                name: "recC".into(),
                last_id: 0,
                config: Value::Object(Default::default()),
                state: Value::Object(Default::default()),
            })
            .await
            .unwrap();
        seed_target(&db, "recC", "one").await;

        let mut msg = BotMessage::parse_incoming(
            ":nick!~user@host PRIVMSG #chan :hi",
            "one",
            "mup",
            None,
        )
        .unwrap();
        msg.id = Some(db.messages().insert(&msg).await.unwrap());

        let (manager, _dying) = PluginManager::new(db.clone(), 300, 50);
        manager.refresh(&Selection::All).await;
        manager.dispatch_inbound().await;
        manager.shutdown().await;

        assert_eq!(REC_C_STOPS.load(Ordering::SeqCst), 1);
        let plugin = db.plugins().get("recC").await.unwrap();
        assert_eq!(plugin.last_id, msg.id.unwrap());
    }
}
