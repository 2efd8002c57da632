//! IRC account client (§4.4.1): Dial, Auth, Forward, Quitting.
//!
//! One supervisor task per account owns the connection end to end: dial,
//! register, then a single unified `select!` loop multiplexing the socket,
//! the plugin-originated outbound queue, reconciliation ticks, and
//! shutdown. No separate reader/writer tasks — the socket is split into a
//! sink and a stream so both directions can be polled from the same loop
//! without a read blocking a write.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use mup_proto::{BotMessage, RawCodec, RawMessage};

use super::{AccountClient, AccountInfo, ClientContext};
use crate::dying::{Dying, DyingSignal};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const REALNAME: &str = "Mup Pet";

/// A connected stream, plain or TLS (§4.4.1 Dial, §3 `account.tls`).
enum IrcStream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IrcStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            IrcStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IrcStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IrcStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            IrcStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            IrcStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            IrcStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Unpin for IrcStream {}

async fn dial(info: &AccountInfo, network_timeout: Duration) -> std::io::Result<IrcStream> {
    let tcp = tokio::time::timeout(network_timeout, TcpStream::connect(&info.endpoint))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    if !info.tls {
        return Ok(IrcStream::Plain(tcp));
    }
    let hostname = if info.host.is_empty() {
        info.endpoint.split(':').next().unwrap_or(&info.endpoint)
    } else {
        &info.host
    };
    let tls = tokio::time::timeout(
        network_timeout,
        super::tls::connect(tcp, hostname, info.tls_insecure),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tls handshake timed out"))?
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(IrcStream::Tls(tls))
}

fn now_token() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_owned())
}

/// The IRC client's own account client implementation. Owns the long-lived
/// supervisor task; `stop`/`update_info` talk to it over channels.
pub struct IrcClient {
    name: String,
    alive: Arc<AtomicBool>,
    dying: DyingSignal,
    info_tx: watch::Sender<AccountInfo>,
    outgoing_tx: mpsc::Sender<BotMessage>,
}

#[async_trait]
impl AccountClient for IrcClient {
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

impl IrcClient {
    pub fn spawn(name: String, info: AccountInfo, ctx: ClientContext) -> Arc<dyn AccountClient> {
        let (dying, root_dying) = DyingSignal::new();
        let (info_tx, info_rx) = watch::channel(info.clone());
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let alive = Arc::new(AtomicBool::new(true));

        let client = Arc::new(IrcClient {
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

/// Per-connection nick/channel state, reset on every reconnect.
struct ConnState {
    configured_nick: String,
    current_nick: String,
    active_channels: BTreeSet<String>,
}

impl ConnState {
    fn new(info: &AccountInfo) -> Self {
        Self {
            configured_nick: info.nick.clone(),
            current_nick: info.nick.clone(),
            active_channels: BTreeSet::new(),
        }
    }
}

enum ForwardOutcome {
    Dying,
    RestartRequired,
    ConnectionLost,
}

async fn supervise(
    account: String,
    mut info_rx: watch::Receiver<AccountInfo>,
    mut outgoing_rx: mpsc::Receiver<BotMessage>,
    ctx: ClientContext,
    mut dying: Dying,
    alive: Arc<AtomicBool>,
) {
    'reconnect: loop {
        if dying.is_dying() {
            break;
        }

        let info = info_rx.borrow().clone();
        info!(account = %account, endpoint = %info.endpoint, "dialing irc account");

        let stream = tokio::select! {
            _ = dying.recv() => break 'reconnect,
            result = dial(&info, ctx.network_timeout) => result,
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(account = %account, error = %e, "irc dial failed, retrying");
                tokio::select! {
                    _ = dying.recv() => break 'reconnect,
                    _ = tokio::time::sleep(ctx.network_timeout) => continue 'reconnect,
                }
            }
        };

        let mut framed = Framed::new(stream, RawCodec::new());
        let mut state = ConnState::new(&info);

        if !info.password.is_empty() {
            let _ = framed.send(RawMessage::new("PASS", vec![info.password.clone()])).await;
        }
        let _ = framed
            .send(RawMessage::new("NICK", vec![state.current_nick.clone()]))
            .await;
        let _ = framed
            .send(RawMessage::new(
                "USER",
                vec![
                    state.current_nick.clone(),
                    "0".to_owned(),
                    "0".to_owned(),
                    REALNAME.to_owned(),
                ],
            ))
            .await;

        let welcomed = auth(&mut framed, &mut state, ctx.network_timeout).await;

        if !welcomed {
            warn!(account = %account, "irc registration failed, retrying");
            tokio::select! {
                _ = dying.recv() => break 'reconnect,
                _ = tokio::time::sleep(ctx.network_timeout) => continue 'reconnect,
            }
        }

        info!(account = %account, nick = %state.current_nick, "irc registration complete");
        reconcile_channels(&mut framed, &info, &mut state).await;
        send_identify(&mut framed, &info).await;

        let mut current_info = info.clone();
        let outcome = forward(
            &account,
            &mut framed,
            &mut outgoing_rx,
            &mut info_rx,
            &ctx,
            &mut state,
            &mut current_info,
            &mut dying,
        )
        .await;

        match outcome {
            ForwardOutcome::Dying => break 'reconnect,
            ForwardOutcome::RestartRequired | ForwardOutcome::ConnectionLost => continue 'reconnect,
        }
    }

    alive.store(false, Ordering::SeqCst);
    debug!(account = %account, "irc account client stopped");
}

type IrcFramed = Framed<IrcStream, RawCodec>;

/// Dial/Auth handshake: reply to PING, handle 433 by appending `_`, adopt
/// the welcomed nick on 001 (§4.4.1.2).
async fn auth(framed: &mut IrcFramed, state: &mut ConnState, network_timeout: Duration) -> bool {
    let deadline = tokio::time::sleep(network_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return false,
            line = framed.next() => {
                match line {
                    Some(Ok(raw)) => {
                        match raw.command.as_str() {
                            "PING" => {
                                let _ = framed.send(RawMessage::new("PONG", raw.params.iter().cloned().collect::<Vec<_>>())).await;
                            }
                            "433" => {
                                state.current_nick.push('_');
                                let _ = framed.send(RawMessage::new("NICK", vec![state.current_nick.clone()])).await;
                            }
                            "001" => {
                                if let Some(nick) = raw.params.first() {
                                    state.current_nick = nick.clone();
                                }
                                return true;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => debug!(error = %e, "discarding unparsable irc line during auth"),
                    None => return false,
                }
            }
        }
    }
}

/// Recompute `joins = desired \ active` / `parts = active \ desired` and
/// send them (§4.4.1.1).
async fn reconcile_channels(framed: &mut IrcFramed, info: &AccountInfo, state: &mut ConnState) {
    let desired = info.channel_names();

    let joins: Vec<&String> = desired.difference(&state.active_channels).collect();
    let parts: Vec<&String> = state.active_channels.difference(&desired).collect();

    if !joins.is_empty() {
        let names = joins.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
        let _ = framed.send(RawMessage::new("JOIN", vec![names])).await;
    }
    if !parts.is_empty() {
        let names = parts.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",");
        let _ = framed.send(RawMessage::new("PART", vec![names])).await;
    }
}

/// Send a nickserv-style `IDENTIFY` when an identity/password pair is
/// configured: on welcome, and again whenever the identity changes in
/// place (§4.4.1.2).
async fn send_identify(framed: &mut IrcFramed, info: &AccountInfo) {
    if !info.identity.is_empty() && !info.password.is_empty() {
        let _ = framed
            .send(RawMessage::new(
                "PRIVMSG",
                vec!["NickServ".to_owned(), format!("IDENTIFY {}", info.password)],
            ))
            .await;
    }
}

/// Attempt to reclaim the configured nick, GHOSTing first if credentials
/// are configured (§4.4.1.2).
async fn reclaim_nick(framed: &mut IrcFramed, info: &AccountInfo, state: &ConnState) {
    if state.current_nick == state.configured_nick {
        return;
    }
    if !info.identity.is_empty() && !info.password.is_empty() {
        let _ = framed
            .send(RawMessage::new(
                "PRIVMSG",
                vec![
                    "NickServ".to_owned(),
                    format!("GHOST {} {}", state.configured_nick, info.password),
                ],
            ))
            .await;
    }
    let _ = framed
        .send(RawMessage::new("NICK", vec![state.configured_nick.clone()]))
        .await;
}

/// The Forward state: multiplex incoming lines, outgoing plugin messages,
/// info-change reconciliation, keepalive, and shutdown (§4.4.1, §5).
#[allow(clippy::too_many_arguments)]
async fn forward(
    account: &str,
    framed: &mut IrcFramed,
    outgoing_rx: &mut mpsc::Receiver<BotMessage>,
    info_rx: &mut watch::Receiver<AccountInfo>,
    ctx: &ClientContext,
    state: &mut ConnState,
    current_info: &mut AccountInfo,
    dying: &mut Dying,
) -> ForwardOutcome {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = dying.recv() => {
                let _ = framed.send(RawMessage::new("QUIT", vec!["leaving".to_owned()])).await;
                let _ = tokio::time::timeout(ctx.network_timeout, framed.flush()).await;
                return ForwardOutcome::Dying;
            }
            line = framed.next() => {
                match line {
                    Some(Ok(raw)) => {
                        if handle_line(account, &raw, framed, ctx, state).await.is_err() {
                            return ForwardOutcome::ConnectionLost;
                        }
                    }
                    Some(Err(e)) => debug!(account = %account, error = %e, "discarding unparsable irc line"),
                    None => return ForwardOutcome::ConnectionLost,
                }
            }
            Some(msg) = outgoing_rx.recv() => {
                let line = msg.format();
                match RawMessage::parse(&line) {
                    Ok(raw) => {
                        if framed.send(raw).await.is_err() {
                            return ForwardOutcome::ConnectionLost;
                        }
                        let id = msg.id.unwrap_or(0);
                        if framed.send(RawMessage::new("PING", vec![format!("sent:{id}")])).await.is_err() {
                            return ForwardOutcome::ConnectionLost;
                        }
                    }
                    Err(e) => warn!(account = %account, error = %e, "failed to format outbound message"),
                }
            }
            changed = info_rx.changed() => {
                if changed.is_err() {
                    return ForwardOutcome::ConnectionLost;
                }
                let new_info = info_rx.borrow().clone();
                if current_info.requires_irc_restart(&new_info) {
                    *current_info = new_info;
                    return ForwardOutcome::RestartRequired;
                }
                let identity_changed = current_info.identity != new_info.identity;
                *current_info = new_info.clone();
                reconcile_channels(framed, &new_info, state).await;
                reclaim_nick(framed, &new_info, state).await;
                if identity_changed {
                    send_identify(framed, &new_info).await;
                }
            }
            _ = keepalive.tick() => {
                if framed.send(RawMessage::new("PING", vec![now_token()])).await.is_err() {
                    return ForwardOutcome::ConnectionLost;
                }
            }
        }
    }
}

/// Handle one parsed wire line in the Forward state (§4.4.1, §4.4.1.1,
/// §4.4.1.2). Returns `Err` if the reply write failed and the connection
/// should be considered lost.
async fn handle_line(
    account: &str,
    raw: &RawMessage,
    framed: &mut IrcFramed,
    ctx: &ClientContext,
    state: &mut ConnState,
) -> Result<(), ()> {
    match raw.command.as_str() {
        "PING" => {
            framed
                .send(RawMessage::new("PONG", raw.params.iter().cloned().collect::<Vec<_>>()))
                .await
                .map_err(|_| ())?;
            return Ok(());
        }
        "JOIN" => {
            if is_self(raw, &state.current_nick) {
                for chan in raw.trailing().unwrap_or_default().split(',') {
                    state.active_channels.insert(chan.to_owned());
                }
            }
        }
        "PART" => {
            if is_self(raw, &state.current_nick) {
                for chan in raw.params.first().map(String::as_str).unwrap_or_default().split(',') {
                    state.active_channels.remove(chan);
                }
            }
        }
        "NICK" => {
            if is_self(raw, &state.current_nick) {
                if let Some(new_nick) = raw.trailing().or_else(|| raw.params.first().map(String::as_str)) {
                    state.current_nick = new_nick.to_owned();
                }
            }
        }
        _ => {}
    }

    let mut msg = match build_bot_message(raw, account, &state.current_nick, ctx.bang) {
        Some(msg) => msg,
        None => return Ok(()),
    };

    if msg.command == "PONG" {
        msg.text = msg.params.last().cloned();
    }

    if ctx.inbound.send(msg).await.is_err() {
        warn!(account = %account, "inbound channel closed, dropping line");
    }
    Ok(())
}

fn is_self(raw: &RawMessage, current_nick: &str) -> bool {
    matches!(&raw.prefix, Some(mup_proto::Prefix::Nickname(nick, _, _)) if nick == current_nick)
}

fn build_bot_message(
    raw: &RawMessage,
    account: &str,
    as_nick: &str,
    bang: Option<char>,
) -> Option<BotMessage> {
    let line = raw.format();
    BotMessage::parse_incoming(&line, account, as_nick, bang).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_starts_with_configured_nick() {
        let info = AccountInfo {
            kind: "irc".into(),
            endpoint: "irc.example.org:6667".into(),
            host: String::new(),
            tls: false,
            tls_insecure: false,
            nick: "mup".into(),
            identity: String::new(),
            password: String::new(),
            channels: Vec::new(),
        };
        let state = ConnState::new(&info);
        assert_eq!(state.current_nick, "mup");
        assert_eq!(state.configured_nick, "mup");
        assert!(state.active_channels.is_empty());
    }

    #[test]
    fn test_is_self_matches_prefix_nick() {
        let raw = RawMessage::parse(":mup!~u@h JOIN :#chan").unwrap();
        assert!(is_self(&raw, "mup"));
        assert!(!is_self(&raw, "other"));
    }

    #[test]
    fn test_build_bot_message_pong_marker_gets_text() {
        let raw = RawMessage::parse("PONG :sent:42").unwrap();
        let mut msg = build_bot_message(&raw, "one", "mup", Some('!')).unwrap();
        if msg.command == "PONG" {
            msg.text = msg.params.last().cloned();
        }
        assert_eq!(msg.text.as_deref(), Some("sent:42"));
    }

    #[test]
    fn test_build_bot_message_privmsg_addressed() {
        let raw = RawMessage::parse(":nick!~u@h PRIVMSG #chan :mup: hi").unwrap();
        let msg = build_bot_message(&raw, "one", "mup", Some('!')).unwrap();
        assert_eq!(msg.bot_text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_requires_restart_on_host_change() {
        let a = AccountInfo {
            kind: "irc".into(),
            endpoint: "irc.example.org:6667".into(),
            host: String::new(),
            tls: false,
            tls_insecure: false,
            nick: "mup".into(),
            identity: String::new(),
            password: String::new(),
            channels: Vec::new(),
        };
        let mut b = a.clone();
        b.nick = "mup2".into();
        assert!(!a.requires_irc_restart(&b));
        b.endpoint = "irc.other.org:6667".into();
        assert!(a.requires_irc_restart(&b));
    }
}
