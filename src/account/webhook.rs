//! WebHook account client (§4.4, §6): a small inbound HTTP listener plus an
//! outbound POST, tied together by the same synthetic confirmation marker
//! the other transports use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use mup_proto::{Address, BotMessage, Lane};

use super::{AccountClient, AccountInfo, ClientContext};
use crate::dying::{Dying, DyingSignal};

/// Body posted to the inbound listener: `{channel, nick, text}`, channel
/// empty for a direct message.
#[derive(Debug, Deserialize)]
struct IncomingPayload {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    nick: String,
    text: String,
}

pub struct WebhookClient {
    name: String,
    alive: Arc<AtomicBool>,
    dying: DyingSignal,
    info_tx: watch::Sender<AccountInfo>,
    outgoing_tx: mpsc::Sender<BotMessage>,
}

#[async_trait]
impl AccountClient for WebhookClient {
    fn account_name(&self) -> &str {
        &self.name
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn dying(&self) -> Dying {
        self.dying.child()
    }

    fn outgoing(&self) -> mpsc::Sender<BotMessage> {
        self.outgoing_tx.clone()
    }

    async fn update_info(&self, info: AccountInfo) {
        let _ = self.info_tx.send(info);
    }

    async fn stop(&self) {
        self.dying.kill();
    }
}

impl WebhookClient {
    pub fn spawn(name: String, info: AccountInfo, ctx: ClientContext) -> Arc<dyn AccountClient> {
        let (dying, root_dying) = DyingSignal::new();
        let (info_tx, info_rx) = watch::channel(info);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));

        let client = Arc::new(WebhookClient {
            name: name.clone(),
            alive: alive.clone(),
            dying: dying.clone(),
            info_tx,
            outgoing_tx,
        });

        tokio::spawn(supervise(name, info_rx, outgoing_rx, ctx, root_dying, alive));

        client
    }
}

#[derive(Clone)]
struct ListenerState {
    account: String,
    inbound: mpsc::Sender<BotMessage>,
    bang: Option<char>,
}

async fn supervise(
    account: String,
    mut info_rx: watch::Receiver<AccountInfo>,
    mut outgoing_rx: mpsc::Receiver<BotMessage>,
    ctx: ClientContext,
    mut dying: Dying,
    alive: Arc<AtomicBool>,
) {
    let http = reqwest::Client::new();

    let state = ListenerState {
        account: account.clone(),
        inbound: ctx.inbound.clone(),
        bang: ctx.bang,
    };
    let app = Router::new()
        .route("/", post(handle_post))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&ctx.webhook_listen).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(account = %account, address = %ctx.webhook_listen, error = %e, "failed to bind webhook listener");
            alive.store(false, Ordering::SeqCst);
            return;
        }
    };
    info!(account = %account, address = %ctx.webhook_listen, "webhook listener bound");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    'session: loop {
        if dying.is_dying() {
            break;
        }

        let info = info_rx.borrow().clone();

        tokio::select! {
            _ = dying.recv() => break 'session,

            changed = info_rx.changed() => {
                if changed.is_err() {
                    break 'session;
                }
            }

            Some(msg) = outgoing_rx.recv() => {
                post_outgoing(&http, &info.endpoint, &msg).await;
                let confirmation = pong_marker(&account, &msg);
                if ctx.inbound.send(confirmation).await.is_err() {
                    warn!(account = %account, "inbound channel closed");
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = server.await;
    alive.store(false, Ordering::SeqCst);
    debug!(account = %account, "webhook account client stopped");
}

async fn handle_post(
    State(state): State<ListenerState>,
    Json(payload): Json<IncomingPayload>,
) -> StatusCode {
    let Some(msg) = to_bot_message(&state.account, &payload, state.bang) else {
        return StatusCode::BAD_REQUEST;
    };
    if state.inbound.send(msg).await.is_err() {
        warn!(account = %state.account, "inbound channel closed, dropping webhook message");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}

/// Outgoing POST as `payload=<json>` with `{channel,text}` (§6).
async fn post_outgoing(http: &reqwest::Client, endpoint: &str, msg: &BotMessage) {
    if endpoint.is_empty() {
        warn!("webhook account has no endpoint configured, dropping outgoing message");
        return;
    }
    let body = serde_json::json!({
        "channel": msg.address.channel,
        "text": msg.text.clone().unwrap_or_default(),
    });
    let Ok(payload) = serde_json::to_string(&body) else {
        warn!("failed to serialize webhook payload");
        return;
    };
    if let Err(e) = http
        .post(endpoint)
        .form(&[("payload", payload)])
        .send()
        .await
    {
        warn!(error = %e, "webhook outgoing post failed");
    }
}

fn pong_marker(account: &str, msg: &BotMessage) -> BotMessage {
    let mut marker = BotMessage::new_outgoing(
        account,
        Address::for_account(account),
        "PONG",
        format!("sent:{}", msg.id.unwrap_or(0)),
    );
    marker.lane = Lane::Inbound;
    marker
}

fn to_bot_message(account: &str, payload: &IncomingPayload, bang: Option<char>) -> Option<BotMessage> {
    if payload.text.is_empty() {
        return None;
    }
    let is_private = payload.channel.is_empty();
    let bot_text = if is_private {
        Some(payload.text.clone())
    } else {
        bang.and_then(|b| payload.text.strip_prefix(b).map(str::to_owned))
    };

    Some(BotMessage {
        id: None,
        nonce: webhook_nonce(),
        lane: Lane::Inbound,
        time: now_unix(),
        address: Address {
            account: account.to_owned(),
            channel: payload.channel.clone(),
            nick: payload.nick.clone(),
            user: String::new(),
            host: String::new(),
        },
        command: "PRIVMSG".to_owned(),
        params: Vec::new(),
        text: Some(payload.text.clone()),
        bot_text,
        bang,
        as_nick: String::new(),
    })
}

fn webhook_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bot_message_private_always_addressed() {
        let payload = IncomingPayload { channel: String::new(), nick: "alice".into(), text: "hi".into() };
        let msg = to_bot_message("hook", &payload, Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("hi"));
        assert_eq!(msg.address.nick, "alice");
    }

    #[test]
    fn test_to_bot_message_channel_requires_bang() {
        let payload = IncomingPayload { channel: "#room".into(), nick: "alice".into(), text: "just chatting".into() };
        let msg = to_bot_message("hook", &payload, Some('!')).unwrap();
        assert_eq!(msg.bot_text, None);

        let payload = IncomingPayload { channel: "#room".into(), nick: "alice".into(), text: "!echo hi".into() };
        let msg = to_bot_message("hook", &payload, Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_to_bot_message_rejects_empty_text() {
        let payload = IncomingPayload { channel: String::new(), nick: "alice".into(), text: String::new() };
        assert!(to_bot_message("hook", &payload, Some('!')).is_none());
    }
}
