use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{PRODUCT_NAME, VERSION};

/// Control verbs forwarded to the controller. `TELNET` and help are
/// session-local and never leave the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    On,
    Off,
    Clear,
    Pause,
    Resume,
    Join(Vec<String>),
}

/// `Ok` text renders as `OK <text>`, `Err` as `ERR <text>`.
pub type CommandReply = Result<String, String>;

/// One command awaiting the controller's verdict.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<CommandReply>,
}

#[derive(Debug, Error)]
pub enum CommandServerError {
    #[error("unable to bind command interface: {0}")]
    Bind(std::io::Error),
}

const HELP_LINES: [&str; 9] = [
    "  ** Command list **",
    "     ? - Shows this message.",
    "    ON - Starts operation.",
    "   OFF - Stops operation.",
    " CLEAR - Clears all queues and the matrix display.",
    " PAUSE - Stops sending images to the matrix display, emote collection stays active.",
    "RESUME - Resumes sending images to the matrix display. The backlog is drained.",
    "TELNET - CR LF line breaks and backspace editing for the lifetime of the connection.",
    "JOIN :<#chan>{,<#chan>{,...}} - Joins <#chan>.",
];

/// Line-oriented TCP command interface. At most one session is active; a
/// new connection preempts the previous one.
pub struct CommandServer {
    listener: TcpListener,
}

impl CommandServer {
    /// Binding failure is fatal to the process; the caller escalates.
    pub async fn bind(port: u16) -> Result<Self, CommandServerError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(CommandServerError::Bind)?;
        info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(port),
            "command interface listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self, commands: mpsc::Sender<CommandRequest>) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(commands))
    }

    async fn accept_loop(self, commands: mpsc::Sender<CommandRequest>) {
        let mut active: Option<(Arc<Notify>, JoinHandle<()>)> = None;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "command accept failed");
                    continue;
                }
            };

            // Single client: ask the previous session to close and wait for
            // it so its socket is down before the new banner goes out.
            if let Some((closed, handle)) = active.take() {
                closed.notify_one();
                let _ = handle.await;
            }

            info!(peer = %peer, "command connection opened");
            let closed = Arc::new(Notify::new());
            let handle = tokio::spawn(run_session(
                stream,
                peer,
                commands.clone(),
                closed.clone(),
            ));
            active = Some((closed, handle));
        }
    }
}

fn banner(peer: &SocketAddr) -> String {
    format!(
        "{PRODUCT_NAME} v{VERSION}\nType '?' to obtain available commands.\nHello {}!",
        peer.ip()
    )
}

/// Send one logical message, expanding LF to CRLF in telnet mode. Multi-line
/// messages are a single write.
async fn send_lines(
    writer: &mut OwnedWriteHalf,
    telnet: bool,
    msg: &str,
) -> std::io::Result<()> {
    trace!(target: "matrix_relay::command", tx = msg, "remote send");
    let payload = if telnet {
        format!("{}\r\n", msg.replace('\n', "\r\n"))
    } else {
        format!("{msg}\n")
    };
    writer.write_all(payload.as_bytes()).await
}

/// Apply backspace (0x08) rubout editing the way a raw telnet client sends
/// it: each BS removes the character before it.
fn interpret_backspaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        if c == '\u{8}' {
            out.pop();
        } else {
            out.push(c);
        }
    }
    out
}

/// What one input line means.
#[derive(Debug, PartialEq, Eq)]
enum ParsedLine {
    Empty,
    Telnet,
    Help,
    Control(ControlCommand),
    BadJoin,
    Unknown,
}

fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Empty;
    }
    let (verb, rest) = match trimmed.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (trimmed, ""),
    };
    match verb.to_ascii_lowercase().as_str() {
        "telnet" => ParsedLine::Telnet,
        "?" | "h" | "help" => ParsedLine::Help,
        "on" => ParsedLine::Control(ControlCommand::On),
        "off" => ParsedLine::Control(ControlCommand::Off),
        "clear" => ParsedLine::Control(ControlCommand::Clear),
        "pause" => ParsedLine::Control(ControlCommand::Pause),
        "resume" => ParsedLine::Control(ControlCommand::Resume),
        "join" => {
            // Channel list arrives IRC-style as a trailing parameter.
            let channels: Vec<String> = rest
                .strip_prefix(':')
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if channels.is_empty() {
                ParsedLine::BadJoin
            } else {
                ParsedLine::Control(ControlCommand::Join(channels))
            }
        }
        _ => ParsedLine::Unknown,
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    commands: mpsc::Sender<CommandRequest>,
    closed: Arc<Notify>,
) {
    if let Err(err) = session_loop(stream, peer, commands, closed).await {
        debug!(peer = %peer, error = %err, "command session ended with error");
    }
    info!(peer = %peer, "command connection closed");
}

async fn session_loop(
    stream: TcpStream,
    peer: SocketAddr,
    commands: mpsc::Sender<CommandRequest>,
    closed: Arc<Notify>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut telnet = false;

    send_lines(&mut writer, telnet, &banner(&peer)).await?;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
            _ = closed.notified() => {
                debug!(peer = %peer, "session preempted by new connection");
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let line = if telnet {
            interpret_backspaces(&line)
        } else {
            line
        };
        trace!(target: "matrix_relay::command", rx = %line, "remote read");

        match parse_line(&line) {
            ParsedLine::Empty => {}
            ParsedLine::Telnet => {
                telnet = true;
                send_lines(&mut writer, telnet, "OK TELNET mode").await?;
                send_lines(&mut writer, telnet, &banner(&peer)).await?;
            }
            ParsedLine::Help => {
                send_lines(&mut writer, telnet, &HELP_LINES.join("\n")).await?
            }
            ParsedLine::BadJoin => send_lines(&mut writer, telnet, "ERR Bad syntax").await?,
            ParsedLine::Unknown => {
                send_lines(&mut writer, telnet, "ERR Unknown command").await?
            }
            ParsedLine::Control(command) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = CommandRequest {
                    command,
                    reply: reply_tx,
                };
                let reply = if commands.send(request).await.is_ok() {
                    reply_rx
                        .await
                        .unwrap_or_else(|_| Err("Controller gone".to_string()))
                } else {
                    Err("Controller gone".to_string())
                };
                let response = match reply {
                    Ok(text) => format!("OK {text}"),
                    Err(text) => format!("ERR {text}"),
                };
                send_lines(&mut writer, telnet, &response).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backspaces_rub_out_previous_chars() {
        assert_eq!(interpret_backspaces("ON\u{8}\u{8}OFF"), "OFF");
        assert_eq!(interpret_backspaces("\u{8}\u{8}ok"), "ok");
        assert_eq!(interpret_backspaces("clean"), "clean");
    }

    #[test]
    fn verbs_parse_case_insensitively() {
        assert_eq!(parse_line("on"), ParsedLine::Control(ControlCommand::On));
        assert_eq!(parse_line("OFF"), ParsedLine::Control(ControlCommand::Off));
        assert_eq!(
            parse_line("Clear"),
            ParsedLine::Control(ControlCommand::Clear)
        );
        assert_eq!(parse_line("?"), ParsedLine::Help);
        assert_eq!(parse_line("help"), ParsedLine::Help);
        assert_eq!(parse_line("TELNET"), ParsedLine::Telnet);
        assert_eq!(parse_line(""), ParsedLine::Empty);
        assert_eq!(parse_line("  "), ParsedLine::Empty);
        assert_eq!(parse_line("bogus"), ParsedLine::Unknown);
    }

    #[test]
    fn join_requires_trailing_channel_list() {
        assert_eq!(
            parse_line("JOIN :#a,#b"),
            ParsedLine::Control(ControlCommand::Join(vec![
                "#a".to_string(),
                "#b".to_string()
            ]))
        );
        assert_eq!(parse_line("JOIN"), ParsedLine::BadJoin);
        assert_eq!(parse_line("JOIN #a"), ParsedLine::BadJoin);
        assert_eq!(parse_line("JOIN :"), ParsedLine::BadJoin);
    }
}
