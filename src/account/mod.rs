//! Account manager (§4.5): reconciles the set of live account clients
//! against the `account` table, routes inbound traffic into the store, and
//! tails each account's outbound lane back out to its client.

mod info;
mod irc;
mod signal;
mod telegram;
mod tls;
mod webhook;

pub use info::AccountInfo;
pub use irc::IrcClient;
pub use signal::SignalClient;
pub use telegram::TelegramClient;
pub use webhook::WebhookClient;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mup_proto::{BotMessage, Lane};

use crate::config::Selection;
use crate::db::{ChannelRecord, Database};
use crate::dying::{Dying, DyingSignal};

/// A constructed-but-not-yet-running value every account client implements.
///
/// One implementation per transport (IRC, Telegram, Signal, WebHook); held
/// by the account manager as `Arc<dyn AccountClient>` (§4.4, §9).
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// The account name this client serves. Never changes for the life of
    /// the client (§4.4: `update_info` must not change the account name).
    fn account_name(&self) -> &str;

    /// Whether the client's supervisor is still running.
    fn alive(&self) -> bool;

    /// A fresh observer of this client's dying signal.
    fn dying(&self) -> Dying;

    /// The sink the account manager pushes outbound messages into.
    fn outgoing(&self) -> mpsc::Sender<BotMessage>;

    /// Reconcile this client's configuration against a fresh read of the
    /// store. The client itself decides whether the change requires a
    /// restart (§4.4).
    async fn update_info(&self, info: AccountInfo);

    /// Gracefully stop: attempt a polite disconnect within the configured
    /// network timeout before the supervisor is torn down (§4.4, §5).
    async fn stop(&self);
}

/// Shared knobs every client needs at construction time.
#[derive(Clone)]
pub struct ClientContext {
    pub network_timeout: Duration,
    pub inbound: mpsc::Sender<BotMessage>,
    pub telegram_api_host: Option<String>,
    pub bang: Option<char>,
    /// Address the WebHook client listens on for inbound POSTs (§6).
    pub webhook_listen: String,
}

fn spawn_client(
    name: &str,
    info: &AccountInfo,
    ctx: &ClientContext,
) -> Option<Arc<dyn AccountClient>> {
    match info.kind.as_str() {
        "" | "irc" => Some(IrcClient::spawn(name.to_owned(), info.clone(), ctx.clone())),
        "telegram" => Some(TelegramClient::spawn(name.to_owned(), info.clone(), ctx.clone())),
        "signal" => Some(SignalClient::spawn(name.to_owned(), info.clone(), ctx.clone())),
        "webhook" => Some(WebhookClient::spawn(name.to_owned(), info.clone(), ctx.clone())),
        other => {
            warn!(account = %name, kind = %other, "unknown account kind, skipping");
            None
        }
    }
}

struct LiveClient {
    client: Arc<dyn AccountClient>,
    tailer: JoinHandle<()>,
}

/// Owns the set of live account clients and the per-account outbound
/// tailers (§4.5).
pub struct AccountManager {
    db: Database,
    ctx: ClientContext,
    refresh_period: Option<Duration>,
    clients: DashMap<String, LiveClient>,
    dying: DyingSignal,
}

impl AccountManager {
    pub fn new(
        db: Database,
        ctx: ClientContext,
        refresh_secs: i64,
    ) -> (Arc<Self>, DyingSignal) {
        let (dying, _root) = DyingSignal::new();
        let refresh_period = if refresh_secs < 0 {
            None
        } else {
            Some(Duration::from_secs(refresh_secs.max(0) as u64))
        };
        (
            Arc::new(Self {
                db,
                ctx,
                refresh_period,
                clients: DashMap::new(),
                dying: dying.clone(),
            }),
            dying,
        )
    }

    /// Drive reconciliation on a tick and drain the shared inbound channel
    /// until told to stop (§5: the account manager's single-threaded select
    /// loop).
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<BotMessage>,
        selection: Selection,
        mut dying: Dying,
    ) {
        self.refresh(&selection).await;

        let mut ticker = self
            .refresh_period
            .map(|period| tokio::time::interval(period));

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
                Some(msg) = inbound_rx.recv() => {
                    self.handle_inbound(msg).await;
                }
                _ = tick => {
                    self.refresh(&selection).await;
                }
            }
        }

        self.shutdown(inbound_rx).await;
    }

    /// Insert an inbound message and, if it is a delivery-confirmation
    /// marker (`PONG sent:<id>`), advance `account.last_id` (§4.4.1, §4.5).
    async fn handle_inbound(&self, msg: BotMessage) {
        let account = msg.address.account.clone();
        let confirmed_id = (msg.command == "PONG")
            .then(|| msg.text.as_deref())
            .flatten()
            .and_then(|text| text.strip_prefix("sent:"))
            .and_then(|id| id.parse::<i64>().ok());

        match self.db.messages().insert(&msg).await {
            Ok(_) => {}
            Err(e) => {
                // Fatal store error (§7): escalate by killing the manager;
                // the process-level supervisor will observe this and exit.
                tracing::error!(error = %e, "store error inserting inbound message, killing account manager");
                self.dying.kill();
                return;
            }
        }

        if let Some(id) = confirmed_id {
            if let Err(e) = self.db.accounts().advance_last_id(&account, id).await {
                warn!(account = %account, error = %e, "failed to advance last_id on confirmation");
            }
        }
    }

    /// Reconcile the live client set against the store (§4.5).
    async fn refresh(&self, selection: &Selection) {
        let accounts = match self.db.accounts().list().await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "failed to list accounts, killing account manager");
                self.dying.kill();
                return;
            }
        };
        let all_channels = match self.db.channels().list().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to list channels, skipping this refresh");
                return;
            }
        };

        let mut channels_by_account: HashMap<String, Vec<ChannelRecord>> = HashMap::new();
        for chan in all_channels {
            channels_by_account.entry(chan.account.clone()).or_default().push(chan);
        }

        let desired: std::collections::HashSet<String> = accounts
            .iter()
            .map(|a| a.name.clone())
            .filter(|n| selection.allows(n))
            .collect();

        // Stop clients no longer desired, or whose dying signal fired.
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|e| !desired.contains(e.key()) || !e.value().client.alive())
            .map(|e| e.key().clone())
            .collect();
        for name in stale {
            if let Some((_, entry)) = self.clients.remove(&name) {
                info!(account = %name, "stopping account client");
                entry.client.stop().await;
                entry.tailer.abort();
            }
        }

        for account in &accounts {
            if !selection.allows(&account.name) {
                continue;
            }
            let channels = channels_by_account.remove(&account.name).unwrap_or_default();
            let info = AccountInfo::from_record(account, channels);

            if let Some(entry) = self.clients.get(&account.name) {
                entry.client.update_info(info).await;
                continue;
            }

            let Some(client) = spawn_client(&account.name, &info, &self.ctx) else {
                continue;
            };
            info!(account = %account.name, kind = %info.kind, "started account client");
            let tailer = tokio::spawn(tail_outbound(
                self.db.clone(),
                account.name.clone(),
                account.last_id,
                client.clone(),
                self.ctx.network_timeout,
            ));
            self.clients.insert(account.name.clone(), LiveClient { client, tailer });
        }
    }

    /// Process-level stop: kill every client in parallel while continuing
    /// to drain the inbound channel (clients may be blocked writing to it)
    /// (§4.5, §5).
    async fn shutdown(&self, mut inbound_rx: mpsc::Receiver<BotMessage>) {
        let names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let stops: Vec<_> = names
            .iter()
            .filter_map(|name| self.clients.get(name).map(|e| e.client.clone()))
            .collect();

        let drain = async {
            while inbound_rx.recv().await.is_some() {
                // Dropped during shutdown: no plugin manager is left running
                // to observe it, but we must keep the channel unblocked.
            }
        };

        let stop_all = async {
            let mut handles = Vec::with_capacity(stops.len());
            for client in stops {
                handles.push(tokio::spawn(async move { client.stop().await }));
            }
            for h in handles {
                let _ = h.await;
            }
        };

        tokio::select! {
            _ = drain => {}
            _ = stop_all => {}
        }

        for name in names {
            if let Some((_, entry)) = self.clients.remove(&name) {
                entry.tailer.abort();
            }
        }
        debug!("account manager shut down");
    }
}

/// Dedicated worker: tail one account's outbound lane and push each message
/// to its client (§4.5). After successful dispatch, mirror the message onto
/// the inbound lane for outgoing-handler plugins, and advance a local
/// cursor. Exits on send failure or client death; the reconciler recreates.
async fn tail_outbound(
    db: Database,
    account: String,
    start_cursor: i64,
    client: Arc<dyn AccountClient>,
    _network_timeout: Duration,
) {
    const POLL_INTERVAL: Duration = Duration::from_millis(200);
    const BATCH: i64 = 100;

    let mut cursor = start_cursor;
    let mut dying = client.dying();

    loop {
        tokio::select! {
            _ = dying.recv() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        if !client.alive() {
            return;
        }

        let rows = match db.messages().after(Lane::Outbound, Some(&account), cursor, BATCH).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(account = %account, error = %e, "outbound tail read failed, exiting tailer");
                return;
            }
        };

        for msg in rows {
            if client.outgoing().send(msg.clone()).await.is_err() {
                return;
            }
            if let Err(e) = db.messages().insert_as(&msg, Lane::Inbound).await {
                warn!(account = %account, error = %e, "failed to mirror outbound onto inbound lane");
            }
            cursor = msg.id.unwrap_or(cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AccountRecord;
    use mup_proto::Address;
    use tokio::sync::mpsc;

    struct FakeClient {
        name: String,
        alive: std::sync::atomic::AtomicBool,
        dying: DyingSignal,
        outgoing: mpsc::Sender<BotMessage>,
    }

    #[async_trait]
    impl AccountClient for FakeClient {
        fn account_name(&self) -> &str {
            &self.name
        }
        fn alive(&self) -> bool {
            self.alive.load(std::sync::atomic::Ordering::SeqCst)
        }
        fn dying(&self) -> Dying {
            self.dying.child()
        }
        fn outgoing(&self) -> mpsc::Sender<BotMessage> {
            self.outgoing.clone()
        }
        async fn update_info(&self, _info: AccountInfo) {}
        async fn stop(&self) {
            self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
            self.dying.kill();
        }
    }

    async fn test_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_handle_inbound_advances_last_id_on_pong_marker() {
        let db = test_db().await;
        db.accounts()
            .upsert(&AccountRecord {
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

        let (dying, _child) = DyingSignal::new();
        let ctx = ClientContext {
            network_timeout: Duration::from_secs(1),
            inbound: mpsc::channel(1).0,
            telegram_api_host: None,
            bang: Some('!'),
            webhook_listen: "127.0.0.1:0".into(),
        };
        let manager = AccountManager {
            db: db.clone(),
            ctx,
            refresh_period: None,
            clients: DashMap::new(),
            dying,
        };

        let marker = BotMessage::new_outgoing(
            "one",
            Address::for_account("one"),
            "PONG",
            "sent:42",
        );
        // Delivery markers travel as inbound; new_outgoing defaults to
        // Outbound, so flip it the way a client's reader would.
        let mut marker = marker;
        marker.lane = Lane::Inbound;

        manager.handle_inbound(marker).await;
        assert_eq!(db.accounts().get("one").await.unwrap().last_id, 42);
    }

    #[tokio::test]
    async fn test_tail_outbound_mirrors_to_inbound_and_advances_cursor() {
        let db = test_db().await;
        let mut msg = BotMessage::new_outgoing("one", Address::for_account("one"), "PRIVMSG", "hi");
        let id = db.messages().insert(&msg).await.unwrap();
        msg.id = Some(id);

        let (tx, mut rx) = mpsc::channel(8);
        let (dying_signal, _root) = DyingSignal::new();
        let client = Arc::new(FakeClient {
            name: "one".into(),
            alive: std::sync::atomic::AtomicBool::new(true),
            dying: dying_signal.clone(),
            outgoing: tx,
        });

        let handle = tokio::spawn(tail_outbound(
            db.clone(),
            "one".into(),
            0,
            client.clone(),
            Duration::from_secs(1),
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, Some(id));

        dying_signal.kill();
        let _ = handle.await;

        let mirrored = db.messages().after(Lane::Inbound, Some("one"), 0, 10).await.unwrap();
        assert_eq!(mirrored.len(), 1);
    }
}
