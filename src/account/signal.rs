//! Signal account client (§4.4): shells out to `signal-cli`, a JSON-lines
//! receive loop on one side and a serialized send invocation on the other.
//! Like the Telegram client, delivery confirmation is synthesised rather
//! than read back off a wire protocol.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use mup_proto::{Address, BotMessage, Lane};

use super::{AccountClient, AccountInfo, ClientContext};
use crate::dying::{Dying, DyingSignal};

/// One line of `signal-cli --json` receive output. Only the shape we use.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    envelope: Option<InnerEnvelope>,
}

#[derive(Debug, Deserialize)]
struct InnerEnvelope {
    #[serde(default)]
    source: Option<String>,
    #[serde(rename = "sourceName", default)]
    source_name: Option<String>,
    #[serde(rename = "dataMessage", default)]
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
struct DataMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "groupInfo", default)]
    group_info: Option<GroupInfo>,
}

#[derive(Debug, Deserialize)]
struct GroupInfo {
    #[serde(rename = "groupId")]
    group_id: String,
}

pub struct SignalClient {
    name: String,
    alive: Arc<AtomicBool>,
    dying: DyingSignal,
    info_tx: watch::Sender<AccountInfo>,
    outgoing_tx: mpsc::Sender<BotMessage>,
}

#[async_trait]
impl AccountClient for SignalClient {
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

impl SignalClient {
    pub fn spawn(name: String, info: AccountInfo, ctx: ClientContext) -> Arc<dyn AccountClient> {
        let (dying, root_dying) = DyingSignal::new();
        let (info_tx, info_rx) = watch::channel(info);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));

        let client = Arc::new(SignalClient {
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
    let send_lock = Arc::new(Mutex::new(()));

    'session: loop {
        if dying.is_dying() {
            break;
        }

        let info = info_rx.borrow().clone();
        if info.identity.is_empty() {
            warn!(account = %account, "signal account has no identity configured, skipping");
            tokio::select! {
                _ = dying.recv() => break 'session,
                _ = tokio::time::sleep(ctx.network_timeout) => continue 'session,
            }
        }

        let mut child = match Command::new("signal-cli")
            .arg("-u")
            .arg(&info.identity)
            .arg("receive")
            .arg("--json")
            .arg("--ignore-attachments")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(account = %account, error = %e, "failed to start signal-cli receive, retrying");
                tokio::select! {
                    _ = dying.recv() => break 'session,
                    _ = tokio::time::sleep(ctx.network_timeout) => continue 'session,
                }
            }
        };

        let Some(stdout) = child.stdout.take() else {
            warn!(account = %account, "signal-cli spawned without stdout pipe");
            continue 'session;
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = dying.recv() => {
                    let _ = child.kill().await;
                    break 'session;
                }

                changed = info_rx.changed() => {
                    if changed.is_err() {
                        let _ = child.kill().await;
                        break 'session;
                    }
                    let new_info = info_rx.borrow().clone();
                    if info.requires_irc_restart(&new_info) {
                        let _ = child.kill().await;
                        continue 'session;
                    }
                }

                Some(msg) = outgoing_rx.recv() => {
                    send(&send_lock, &info.identity, &msg).await;
                    let confirmation = pong_marker(&account, &msg);
                    if ctx.inbound.send(confirmation).await.is_err() {
                        warn!(account = %account, "inbound channel closed");
                    }
                }

                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(msg) = parse_envelope(&account, &line, ctx.bang) {
                                if ctx.inbound.send(msg).await.is_err() {
                                    warn!(account = %account, "inbound channel closed, dropping signal message");
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(account = %account, "signal-cli receive exited, restarting");
                            continue 'session;
                        }
                        Err(e) => {
                            warn!(account = %account, error = %e, "signal-cli receive read error, restarting");
                            continue 'session;
                        }
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    info!(account = %account, "signal account client stopped");
}

/// One `signal-cli send` invocation at a time per account (§5: "the CLI
/// only ever has one invocation in flight").
async fn send(lock: &Arc<Mutex<()>>, identity: &str, msg: &BotMessage) {
    let _guard = lock.lock().await;

    let recipient = if !msg.address.channel.is_empty() {
        msg.address.channel.as_str()
    } else {
        msg.address.nick.as_str()
    };
    if recipient.is_empty() {
        warn!("signal message has no recipient, dropping");
        return;
    }

    let mut cmd = Command::new("signal-cli");
    cmd.arg("-u").arg(identity).arg("send");
    if recipient.starts_with('#') {
        cmd.arg("-g").arg(recipient.trim_start_matches('#'));
    } else {
        cmd.arg(recipient);
    }
    cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to spawn signal-cli send");
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let body = msg.text.clone().unwrap_or_default();
        if let Err(e) = stdin.write_all(body.as_bytes()).await {
            warn!(error = %e, "failed to write signal-cli send body");
        }
    }

    if let Err(e) = child.wait().await {
        warn!(error = %e, "signal-cli send failed");
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

fn parse_envelope(account: &str, line: &str, bang: Option<char>) -> Option<BotMessage> {
    let parsed: Envelope = serde_json::from_str::<Value>(line).ok().and_then(|v| serde_json::from_value(v).ok())?;
    let inner = parsed.envelope?;
    let data = inner.data_message?;
    let text = data.message?;

    let (channel, nick) = match data.group_info {
        Some(group) => (format!("#{}", group.group_id), String::new()),
        None => (String::new(), inner.source_name.or(inner.source).unwrap_or_default()),
    };
    let is_private = channel.is_empty();

    let bot_text = if is_private {
        Some(text.clone())
    } else {
        bang.and_then(|b| text.strip_prefix(b).map(str::to_owned))
    };

    Some(BotMessage {
        id: None,
        nonce: signal_nonce(),
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

fn signal_nonce() -> String {
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
    fn test_parse_envelope_private_message() {
        let line = r#"{"envelope":{"source":"+15551234567","sourceName":"Alice","dataMessage":{"message":"hello there"}}}"#;
        let msg = parse_envelope("sig", line, Some('!')).unwrap();
        assert_eq!(msg.address.nick, "Alice");
        assert_eq!(msg.bot_text.as_deref(), Some("hello there"));
    }

    #[test]
    fn test_parse_envelope_group_message_requires_bang() {
        let line = r#"{"envelope":{"source":"+1","dataMessage":{"message":"just chatting","groupInfo":{"groupId":"abc123"}}}}"#;
        let msg = parse_envelope("sig", line, Some('!')).unwrap();
        assert_eq!(msg.address.channel, "#abc123");
        assert_eq!(msg.bot_text, None);

        let line = r#"{"envelope":{"source":"+1","dataMessage":{"message":"!echo hi","groupInfo":{"groupId":"abc123"}}}}"#;
        let msg = parse_envelope("sig", line, Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_parse_envelope_skips_non_data_messages() {
        let line = r#"{"envelope":{"source":"+1"}}"#;
        assert!(parse_envelope("sig", line, Some('!')).is_none());
    }
}
