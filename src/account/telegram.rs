//! Telegram account client (§4.4): long-polls `getUpdates`, posts replies
//! via `sendMessage`, and synthesises the same `PONG sent:<id>` delivery
//! confirmation the IRC client produces from the real wire protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use mup_proto::{Address, BotMessage, Lane};

use super::{AccountClient, AccountInfo, ClientContext};
use crate::dying::{Dying, DyingSignal};

const DEFAULT_API_HOST: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: String,
}

/// Collapse a Telegram chat title to the conservative channel-name
/// character set the rest of `mup` expects (§3 `channel.name`).
fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// The channel/nick name a Telegram chat is addressed by on the bus: a
/// private chat is `@<user>:<chat_id>`, anything else is
/// `#<sanitized_title>:<chat_id>`.
fn chat_label(chat: &Chat, from: Option<&User>) -> (String, String) {
    if chat.kind == "private" {
        let user = from
            .and_then(|u| u.username.clone())
            .unwrap_or_else(|| from.map(|u| u.first_name.clone()).unwrap_or_default());
        (String::new(), format!("@{user}:{}", chat.id))
    } else {
        let title = chat.title.as_deref().unwrap_or("chat");
        (format!("#{}:{}", sanitize_title(title), chat.id), String::new())
    }
}

/// Extract the chat id mup encoded into a channel/nick label.
fn chat_id_from_label(label: &str) -> Option<i64> {
    label.rsplit(':').next()?.parse().ok()
}

pub struct TelegramClient {
    name: String,
    alive: Arc<AtomicBool>,
    dying: DyingSignal,
    info_tx: watch::Sender<AccountInfo>,
    outgoing_tx: mpsc::Sender<BotMessage>,
}

#[async_trait]
impl AccountClient for TelegramClient {
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

impl TelegramClient {
    pub fn spawn(name: String, info: AccountInfo, ctx: ClientContext) -> Arc<dyn AccountClient> {
        let (dying, root_dying) = DyingSignal::new();
        let (info_tx, info_rx) = watch::channel(info);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));

        let client = Arc::new(TelegramClient {
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

async fn supervise(
    account: String,
    mut info_rx: watch::Receiver<AccountInfo>,
    mut outgoing_rx: mpsc::Receiver<BotMessage>,
    ctx: ClientContext,
    mut dying: Dying,
    alive: Arc<AtomicBool>,
) {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
        .build()
        .expect("reqwest client builds with static configuration");

    let mut offset: i64 = 0;

    'session: loop {
        if dying.is_dying() {
            break;
        }

        let info = info_rx.borrow().clone();
        let base = ctx.telegram_api_host.clone().unwrap_or_else(|| DEFAULT_API_HOST.to_owned());
        let token = info.endpoint.clone();
        if token.is_empty() {
            warn!(account = %account, "telegram account has no bot token configured, skipping");
            tokio::select! {
                _ = dying.recv() => break 'session,
                _ = tokio::time::sleep(ctx.network_timeout) => continue 'session,
            }
        }

        tokio::select! {
            _ = dying.recv() => break 'session,

            Some(msg) = outgoing_rx.recv() => {
                send_message(&http, &base, &token, &msg).await;
                let confirmation = pong_marker(&account, &msg);
                if ctx.inbound.send(confirmation).await.is_err() {
                    warn!(account = %account, "inbound channel closed");
                }
            }

            changed = info_rx.changed() => {
                if changed.is_err() {
                    break 'session;
                }
            }

            updates = get_updates(&http, &base, &token, offset, POLL_TIMEOUT_SECS) => {
                match updates {
                    Ok(batch) => {
                        for update in batch {
                            offset = offset.max(update.update_id + 1);
                            let Some(message) = update.message else { continue };
                            let Some(msg) = to_bot_message(&account, &message, ctx.bang) else { continue };
                            if ctx.inbound.send(msg).await.is_err() {
                                warn!(account = %account, "inbound channel closed, dropping telegram message");
                            }
                        }
                    }
                    Err(e) => {
                        debug!(account = %account, error = %e, "telegram getUpdates failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    info!(account = %account, "telegram account client stopped");
}

async fn get_updates(
    http: &reqwest::Client,
    base: &str,
    token: &str,
    offset: i64,
    timeout_secs: u64,
) -> Result<Vec<Update>, reqwest::Error> {
    let url = format!("{base}/bot{token}/getUpdates");
    let response: GetUpdatesResponse = http
        .get(url)
        .query(&[
            ("offset", offset.to_string()),
            ("timeout", timeout_secs.to_string()),
        ])
        .send()
        .await?
        .json()
        .await?;
    if !response.ok {
        return Ok(Vec::new());
    }
    Ok(response.result)
}

async fn send_message(http: &reqwest::Client, base: &str, token: &str, msg: &BotMessage) {
    let label = if !msg.address.channel.is_empty() {
        &msg.address.channel
    } else {
        &msg.address.nick
    };
    let Some(chat_id) = chat_id_from_label(label) else {
        warn!(label = %label, "cannot resolve telegram chat id from address");
        return;
    };
    let text = msg.text.clone().unwrap_or_default();
    let url = format!("{base}/bot{token}/sendMessage");
    if let Err(e) = http
        .post(url)
        .form(&[("chat_id", chat_id.to_string()), ("text", text)])
        .send()
        .await
    {
        warn!(error = %e, "telegram sendMessage failed");
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

fn to_bot_message(account: &str, message: &TgMessage, bang: Option<char>) -> Option<BotMessage> {
    let text = message.text.clone()?;
    let (channel, nick) = chat_label(&message.chat, message.from.as_ref());
    let is_private = channel.is_empty();

    let bot_text = if is_private {
        Some(text.clone())
    } else {
        bang.and_then(|b| text.strip_prefix(b).map(str::to_owned))
    };

    Some(BotMessage {
        id: None,
        nonce: telegram_nonce(),
        lane: Lane::Inbound,
        time: now_unix(),
        address: Address {
            account: account.to_owned(),
            channel,
            nick,
            user: String::new(),
            host: String::new(),
        },
        command: "PRIVMSG".to_owned(),
        params: Vec::new(),
        text: Some(text),
        bot_text,
        bang,
        as_nick: String::new(),
    })
}

fn telegram_nonce() -> String {
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
    fn test_chat_label_private() {
        let chat = Chat { id: 42, kind: "private".into(), title: None };
        let from = User { username: Some("alice".into()), first_name: "Alice".into() };
        let (channel, nick) = chat_label(&chat, Some(&from));
        assert_eq!(channel, "");
        assert_eq!(nick, "@alice:42");
    }

    #[test]
    fn test_chat_label_group_sanitizes_title() {
        let chat = Chat { id: 7, kind: "group".into(), title: Some("Dev Team!!".into()) };
        let (channel, nick) = chat_label(&chat, None);
        assert_eq!(channel, "#Dev_Team__:7");
        assert_eq!(nick, "");
    }

    #[test]
    fn test_chat_id_from_label_roundtrips() {
        assert_eq!(chat_id_from_label("#chan:99"), Some(99));
        assert_eq!(chat_id_from_label("@user:5"), Some(5));
        assert_eq!(chat_id_from_label("garbage"), None);
    }

    #[test]
    fn test_to_bot_message_private_always_addressed() {
        let message = TgMessage {
            chat: Chat { id: 1, kind: "private".into(), title: None },
            from: Some(User { username: Some("bob".into()), first_name: "Bob".into() }),
            text: Some("hello".into()),
        };
        let msg = to_bot_message("tg", &message, Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("hello"));
        assert_eq!(msg.address.nick, "@bob:1");
    }

    #[test]
    fn test_to_bot_message_group_requires_bang() {
        let message = TgMessage {
            chat: Chat { id: 9, kind: "group".into(), title: Some("Team".into()) },
            from: None,
            text: Some("just chatting".into()),
        };
        let msg = to_bot_message("tg", &message, Some('!')).unwrap();
        assert_eq!(msg.bot_text, None);

        let message = TgMessage {
            chat: Chat { id: 9, kind: "group".into(), title: Some("Team".into()) },
            from: None,
            text: Some("!echo hi".into()),
        };
        let msg = to_bot_message("tg", &message, Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("echo hi"));
    }
}
