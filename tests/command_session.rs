//! Command-interface protocol tests against a real TCP socket, with a stub
//! controller answering on the far side of the command channel.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use matrix_relay::command::{CommandRequest, CommandServer, ControlCommand};

const IO_WAIT: Duration = Duration::from_secs(2);

/// Answers every control command the way a healthy controller would.
fn spawn_stub_controller(mut commands: mpsc::Receiver<CommandRequest>) {
    tokio::spawn(async move {
        while let Some(request) = commands.recv().await {
            let reply = match request.command {
                ControlCommand::On => Ok("Operation started".to_string()),
                ControlCommand::Off => Ok("Operation stopped".to_string()),
                ControlCommand::Clear => Ok("Cleared".to_string()),
                ControlCommand::Pause => Err("Not running".to_string()),
                ControlCommand::Resume => Err("Not paused".to_string()),
                ControlCommand::Join(channels) => {
                    let names: Vec<String> = channels
                        .iter()
                        .map(|c| c.trim_start_matches('#').to_string())
                        .collect();
                    Ok(format!("Joining {}", names.join(",")))
                }
            };
            let _ = request.reply.send(reply);
        }
    });
}

async fn start_server() -> SocketAddr {
    let server = CommandServer::bind(0).await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (commands_tx, commands_rx) = mpsc::channel(16);
    spawn_stub_controller(commands_rx);
    server.spawn(commands_tx);
    SocketAddr::from(([127, 0, 0, 1], port))
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// One LF-terminated line, stripped. Returns `None` on EOF.
    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(IO_WAIT, self.reader.read_line(&mut line))
            .await
            .expect("line within deadline")
            .unwrap();
        (n > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// One raw line including its terminator, for CRLF assertions.
    async fn read_raw_line(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        loop {
            let byte = timeout(IO_WAIT, self.reader.read_u8())
                .await
                .expect("byte within deadline")
                .unwrap();
            buf.push(byte);
            if byte == b'\n' {
                return buf;
            }
        }
    }

    async fn read_banner(&mut self) {
        let product = self.read_line().await.unwrap();
        assert!(
            product.starts_with("Matrix Relay v"),
            "unexpected banner line: {product}"
        );
        assert_eq!(
            self.read_line().await.unwrap(),
            "Type '?' to obtain available commands."
        );
        assert!(self
            .read_line()
            .await
            .unwrap()
            .starts_with("Hello "));
    }
}

#[tokio::test]
async fn banner_then_commands_round_trip() {
    let addr = start_server().await;
    let mut client = Client::connect(addr).await;
    client.read_banner().await;

    client.send("on").await;
    assert_eq!(client.read_line().await.unwrap(), "OK Operation started");

    // Case-insensitive verbs, empty lines ignored.
    client.send("").await;
    client.send("OfF").await;
    assert_eq!(client.read_line().await.unwrap(), "OK Operation stopped");

    client.send("pause").await;
    assert_eq!(client.read_line().await.unwrap(), "ERR Not running");

    client.send("join :#a,#b").await;
    assert_eq!(client.read_line().await.unwrap(), "OK Joining a,b");

    client.send("join nope").await;
    assert_eq!(client.read_line().await.unwrap(), "ERR Bad syntax");

    client.send("frobnicate").await;
    assert_eq!(client.read_line().await.unwrap(), "ERR Unknown command");
}

#[tokio::test]
async fn help_is_multi_line() {
    let addr = start_server().await;
    let mut client = Client::connect(addr).await;
    client.read_banner().await;

    client.send("?").await;
    assert_eq!(client.read_line().await.unwrap(), "  ** Command list **");
    let mut saw_join = false;
    for _ in 0..8 {
        let line = client.read_line().await.unwrap();
        saw_join |= line.starts_with("JOIN");
    }
    assert!(saw_join, "help should document JOIN");
}

#[tokio::test]
async fn telnet_mode_switches_line_endings_and_rebanners() {
    let addr = start_server().await;
    let mut client = Client::connect(addr).await;
    client.read_banner().await;

    client.send("telnet").await;
    let ok = client.read_raw_line().await;
    assert_eq!(ok, b"OK TELNET mode\r\n");
    // The banner is emitted a second time, CRLF-terminated.
    for _ in 0..3 {
        let line = client.read_raw_line().await;
        assert!(line.ends_with(b"\r\n"), "banner line without CRLF");
    }

    // Backspaces rub out previous characters: "ON" erased, "OFF" executes.
    client.send("ON\u{8}\u{8}OFF").await;
    let reply = client.read_raw_line().await;
    assert_eq!(reply, b"OK Operation stopped\r\n");
}

#[tokio::test]
async fn new_connection_preempts_previous_session() {
    let addr = start_server().await;
    let mut first = Client::connect(addr).await;
    first.read_banner().await;

    let mut second = Client::connect(addr).await;
    // The first socket closes before the second session starts talking.
    assert_eq!(first.read_line().await, None, "first session should be closed");
    second.read_banner().await;

    // Exactly one banner: the next thing the second client sees is a
    // command response, not another banner.
    second.send("clear").await;
    assert_eq!(second.read_line().await.unwrap(), "OK Cleared");

    // The survivor still works after the preempted socket is gone.
    drop(first);
    second.send("on").await;
    assert_eq!(second.read_line().await.unwrap(), "OK Operation started");
}
