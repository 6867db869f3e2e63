pub mod proto;

use std::collections::HashMap;

use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, trace, warn};

use self::proto::{parse_message, parse_params, parse_prefix, parse_tags, IrcMessage};

pub const TMI_HOST: &str = "irc.chat.twitch.tv";
pub const TMI_PORT: u16 = 6667;

/// Anonymous logins need a PASS line but no real credential.
const ANONYMOUS_PASS: &str = "SCHMOOPIIE";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
const JOIN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(240);

/// One PRIVMSG as delivered to the controller.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: String,
    pub sender: String,
    pub tags: HashMap<String, String>,
    pub text: String,
}

/// Events emitted by the client task.
#[derive(Debug)]
pub enum IrcEvent {
    /// Registration completed; the client accepts join requests.
    Ready,
    Joined { channel: String },
    JoinFailed { channel: String },
    Message(ChatMessage),
    /// The connection is gone. The client never reconnects on its own.
    Disconnected { reason: String },
}

/// Requests accepted by the client task while connected.
#[derive(Debug)]
pub enum IrcRequest {
    Join(Vec<String>),
    Quit,
}

#[derive(Debug, Error)]
pub enum IrcError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("server requested reconnect")]
    ServerReconnect,
}

/// Normalize a channel name to the wire form: lowercase with a leading `#`.
/// Returns `None` for names that are empty after trimming.
pub fn normalize_channel(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('#').to_ascii_lowercase();
    (!trimmed.is_empty()).then(|| format!("#{trimmed}"))
}

/// Twitch's convention for anonymous read-only nicks.
pub fn random_justinfan_nick() -> String {
    let digits: u32 = rand::thread_rng().gen_range(10_000..100_000_000);
    format!("justinfan{digits}")
}

/// Seam between the controller and the network: tests substitute a scripted
/// source, production connects to TMI.
pub trait ChatSource: Send + Sync {
    fn spawn(
        &self,
        events: mpsc::Sender<IrcEvent>,
        requests: mpsc::Receiver<IrcRequest>,
    ) -> JoinHandle<()>;
}

/// Production source: one task per connection attempt against TMI.
#[derive(Debug, Default)]
pub struct TmiConnector;

impl ChatSource for TmiConnector {
    fn spawn(
        &self,
        events: mpsc::Sender<IrcEvent>,
        requests: mpsc::Receiver<IrcRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_client(events, requests))
    }
}

async fn run_client(events: mpsc::Sender<IrcEvent>, mut requests: mpsc::Receiver<IrcRequest>) {
    let reason = match client_session(&events, &mut requests).await {
        Ok(()) => "connection closed".to_string(),
        Err(err) => err.to_string(),
    };
    let _ = events.send(IrcEvent::Disconnected { reason }).await;
}

struct LineWriter {
    half: OwnedWriteHalf,
}

impl LineWriter {
    async fn send(&mut self, line: &str) -> Result<(), IrcError> {
        trace!(target: "matrix_relay::irc", tx = line, "irc send");
        self.half.write_all(line.as_bytes()).await?;
        self.half.write_all(b"\r\n").await?;
        Ok(())
    }
}

async fn client_session(
    events: &mpsc::Sender<IrcEvent>,
    requests: &mut mpsc::Receiver<IrcRequest>,
) -> Result<(), IrcError> {
    let nick = random_justinfan_nick();
    debug!(host = TMI_HOST, port = TMI_PORT, nick = %nick, "connecting to TMI");

    let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect((TMI_HOST, TMI_PORT)))
        .await
        .map_err(|_| IrcError::Timeout("connection"))??;
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut writer = LineWriter { half: write_half };

    writer
        .send("CAP REQ :twitch.tv/tags twitch.tv/commands")
        .await?;
    writer.send(&format!("PASS {ANONYMOUS_PASS}")).await?;
    writer.send(&format!("NICK {nick}")).await?;

    // Registration: wait for the 001 welcome, answering pings meanwhile.
    let deadline = Instant::now() + REGISTRATION_TIMEOUT;
    loop {
        let line = time::timeout_at(deadline, lines.next_line())
            .await
            .map_err(|_| IrcError::Timeout("registration"))??
            .ok_or_else(|| {
                IrcError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed during registration",
                ))
            })?;
        trace!(target: "matrix_relay::irc", rx = %line, "irc read");
        let msg = parse_message(&line);
        match msg.command.as_deref() {
            Some("001") => break,
            Some("PING") => {
                let pong = format!("PONG {}", msg.params.as_deref().unwrap_or(""));
                writer.send(pong.trim_end()).await?;
            }
            Some("NOTICE") => {
                let (_, notice) = parse_params(msg.params.as_deref().unwrap_or(""));
                if notice.contains("authentication failed")
                    || notice.contains("Improperly formatted auth")
                {
                    writer.send("QUIT :Can't authenticate, aborting.").await.ok();
                    return Err(IrcError::AuthRejected(notice));
                }
            }
            _ => {}
        }
    }

    info!(nick = %nick, "TMI registration complete");
    if events.send(IrcEvent::Ready).await.is_err() {
        return Ok(());
    }

    let mut pending_joins: HashMap<String, Instant> = HashMap::new();
    let mut last_activity = Instant::now();

    loop {
        let keepalive_at = last_activity + KEEPALIVE_IDLE;
        let join_deadline = pending_joins.values().min().copied();

        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                last_activity = Instant::now();
                trace!(target: "matrix_relay::irc", rx = %line, "irc read");
                if handle_line(&line, &nick, events, &mut writer, &mut pending_joins).await? {
                    return Ok(());
                }
            }
            request = requests.recv() => {
                match request {
                    Some(IrcRequest::Join(channels)) => {
                        for channel in channels {
                            writer.send(&format!("JOIN {channel}")).await?;
                            pending_joins
                                .entry(channel)
                                .or_insert_with(|| Instant::now() + JOIN_CONFIRM_TIMEOUT);
                        }
                    }
                    Some(IrcRequest::Quit) | None => {
                        writer.send("QUIT :Goodbye.").await.ok();
                        return Ok(());
                    }
                }
            }
            _ = time::sleep_until(keepalive_at) => {
                writer.send("PING :matrix-relay keepalive").await?;
                last_activity = Instant::now();
            }
            _ = sleep_until_opt(join_deadline), if join_deadline.is_some() => {
                let now = Instant::now();
                let expired: Vec<String> = pending_joins
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(channel, _)| channel.clone())
                    .collect();
                for channel in expired {
                    pending_joins.remove(&channel);
                    warn!(channel = %channel, "join not confirmed in time");
                    if events
                        .send(IrcEvent::JoinFailed { channel })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handle one post-registration line. Returns `Ok(true)` when the session
/// should end cleanly.
async fn handle_line(
    line: &str,
    nick: &str,
    events: &mpsc::Sender<IrcEvent>,
    writer: &mut LineWriter,
    pending_joins: &mut HashMap<String, Instant>,
) -> Result<bool, IrcError> {
    let msg = parse_message(line);
    match msg.command.as_deref() {
        Some("PING") => {
            let pong = format!("PONG {}", msg.params.as_deref().unwrap_or(""));
            writer.send(pong.trim_end()).await?;
        }
        Some("PRIVMSG") => {
            if let Some(message) = chat_message(&msg) {
                if events.send(IrcEvent::Message(message)).await.is_err() {
                    return Ok(true);
                }
            }
        }
        Some("JOIN") => {
            if let Some(channel) = own_channel_event(&msg, nick) {
                pending_joins.remove(&channel);
                if events.send(IrcEvent::Joined { channel }).await.is_err() {
                    return Ok(true);
                }
            }
        }
        Some("PART") => {
            if let Some(channel) = own_channel_event(&msg, nick) {
                warn!(channel = %channel, nick = %nick, "kicked out of channel");
            }
        }
        Some("RECONNECT") => return Err(IrcError::ServerReconnect),
        _ => {}
    }
    Ok(false)
}

/// For JOIN/PART echoes: the channel, when the prefix names our own nick.
fn own_channel_event(msg: &IrcMessage, nick: &str) -> Option<String> {
    let prefix = parse_prefix(msg.prefix.as_deref()?);
    if prefix.name != nick {
        return None;
    }
    let (middles, trailing) = parse_params(msg.params.as_deref()?);
    let channel = middles.into_iter().next().unwrap_or(trailing);
    channel.starts_with('#').then_some(channel)
}

fn chat_message(msg: &IrcMessage) -> Option<ChatMessage> {
    let prefix = parse_prefix(msg.prefix.as_deref()?);
    if prefix.name.is_empty() {
        return None;
    }
    let (middles, text) = parse_params(msg.params.as_deref()?);
    let channel = middles.into_iter().next()?;
    let tags = msg
        .tags
        .as_deref()
        .map(parse_tags)
        .unwrap_or_default();
    Some(ChatMessage {
        channel,
        sender: prefix.name.to_ascii_lowercase(),
        tags,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_channel_adds_hash_and_lowercases() {
        assert_eq!(normalize_channel("Chan"), Some("#chan".to_string()));
        assert_eq!(normalize_channel("#Chan "), Some("#chan".to_string()));
        assert_eq!(normalize_channel("  "), None);
        assert_eq!(normalize_channel("#"), None);
    }

    #[test]
    fn justinfan_nick_shape() {
        let nick = random_justinfan_nick();
        let digits = nick.strip_prefix("justinfan").unwrap();
        assert!(!digits.is_empty());
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn chat_message_extracts_sender_and_tags() {
        let msg = parse_message(
            "@emotes=25:0-4 :Alice!alice@alice.tmi.twitch.tv PRIVMSG #chan :Kappa",
        );
        let chat = chat_message(&msg).unwrap();
        assert_eq!(chat.channel, "#chan");
        assert_eq!(chat.sender, "alice");
        assert_eq!(chat.text, "Kappa");
        assert_eq!(chat.tags.get("emotes").map(String::as_str), Some("25:0-4"));
    }

    #[test]
    fn join_echo_must_name_our_nick() {
        let msg = parse_message(":justinfan1!j@j.tmi.twitch.tv JOIN #chan");
        assert_eq!(
            own_channel_event(&msg, "justinfan1"),
            Some("#chan".to_string())
        );
        assert_eq!(own_channel_event(&msg, "justinfan2"), None);
    }

    #[test]
    fn join_echo_accepts_trailing_form() {
        let msg = parse_message(":justinfan1!j@j.tmi.twitch.tv JOIN :#chan");
        assert_eq!(
            own_channel_event(&msg, "justinfan1"),
            Some("#chan".to_string())
        );
    }
}
