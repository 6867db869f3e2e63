use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analyzer::{self, AnalyzerConfig};
use crate::cache::ImageCache;
use crate::command::{CommandReply, CommandRequest, ControlCommand};
use crate::display::{
    DisplayClient, DisplayHealth, SendOutcome, SlotMirror, SlotStatus, PROBE_INTERVAL,
};
use crate::irc::{self, ChatMessage, ChatSource, IrcEvent, IrcRequest};
use crate::keys::{ImageKey, BUILTIN_FORBIDDEN_EMOTES};
use crate::ranking::RankingBuffer;

const IRC_EVENT_BUFFER: usize = 256;
const IRC_REQUEST_BUFFER: usize = 16;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of the whole operation. Only the controller mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Off,
    Starting,
    On,
    Paused,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Channels joined when operation starts, raw CLI form.
    pub startup_channels: Vec<String>,
    /// Twitch emote ids (and emoji code point strings) never displayed.
    pub forbidden_emotes: HashSet<String>,
    /// Lowercase senders whose messages are ignored.
    pub forbidden_users: HashSet<String>,
    pub no_summation: bool,
    /// Start operation immediately instead of waiting for an `ON` command.
    pub autostart: bool,
}

struct IrcLink {
    events: mpsc::Receiver<IrcEvent>,
    requests: mpsc::Sender<IrcRequest>,
    task: JoinHandle<()>,
}

/// Exponential backoff for IRC reconnection, 1 s doubling to a 30 s cap
/// with 10% jitter.
#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let exp = RETRY_BASE
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(RETRY_CAP);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        exp.mul_f64(jitter)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Owns every piece of shared mutable state and wires the components
/// together: chat in, ranked image uploads out, commands steering both.
pub struct Controller {
    state: OperationState,
    channels: Vec<String>,
    ranking: RankingBuffer,
    mirror: SlotMirror,
    health: DisplayHealth,
    forbidden: HashSet<String>,
    forbidden_users: HashSet<String>,
    analyzer_config: AnalyzerConfig,
    autostart: bool,
    display: DisplayClient,
    cache: ImageCache,
    chat_source: Arc<dyn ChatSource>,
    irc: Option<IrcLink>,
    irc_ready: bool,
    backoff: Backoff,
    next_retry: Option<Instant>,
}

enum Tick {
    Command(CommandRequest),
    CommandsClosed,
    Irc(Option<IrcEvent>),
    Probe,
    Retry,
    Shutdown,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        display: DisplayClient,
        cache: ImageCache,
        chat_source: Arc<dyn ChatSource>,
    ) -> Self {
        let channels: Vec<String> = {
            let mut seen = HashSet::new();
            config
                .startup_channels
                .iter()
                .filter_map(|raw| irc::normalize_channel(raw))
                .filter(|c| seen.insert(c.clone()))
                .collect()
        };
        let mut forbidden = BUILTIN_FORBIDDEN_EMOTES.clone();
        forbidden.extend(config.forbidden_emotes);

        Self {
            state: OperationState::Off,
            channels,
            ranking: RankingBuffer::new(),
            mirror: SlotMirror::default(),
            health: DisplayHealth::default(),
            forbidden,
            forbidden_users: config.forbidden_users,
            analyzer_config: AnalyzerConfig {
                no_summation: config.no_summation,
            },
            autostart: config.autostart,
            display,
            cache,
            chat_source,
            irc: None,
            irc_ready: false,
            backoff: Backoff::default(),
            next_retry: None,
        }
    }

    /// Run until shutdown is requested. Commands arrive from the command
    /// server; dropping the sender only disables the command interface.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CommandRequest>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        if self.autostart {
            info!("starting operation");
            self.start_operation();
        }

        let mut probe_timer = time::interval(PROBE_INTERVAL);
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            let probe_due = self.probe_wanted();
            let retry_at = self.next_retry;
            let irc_active = self.irc.is_some();

            let tick = tokio::select! {
                request = commands.recv(), if commands_open => match request {
                    Some(request) => Tick::Command(request),
                    None => Tick::CommandsClosed,
                },
                event = recv_irc(&mut self.irc), if irc_active => Tick::Irc(event),
                _ = probe_timer.tick(), if probe_due => Tick::Probe,
                _ = sleep_until_opt(retry_at), if retry_at.is_some() => Tick::Retry,
                _ = &mut shutdown => Tick::Shutdown,
            };

            match tick {
                Tick::Command(request) => {
                    let reply = self.handle_command(request.command).await;
                    let _ = request.reply.send(reply);
                }
                Tick::CommandsClosed => commands_open = false,
                Tick::Irc(Some(event)) => self.handle_irc_event(event).await,
                Tick::Irc(None) => {
                    // The client task is gone without a Disconnected event;
                    // treat it the same way.
                    self.handle_irc_event(IrcEvent::Disconnected {
                        reason: "client task ended".to_string(),
                    })
                    .await;
                }
                Tick::Probe => self.probe_display().await,
                Tick::Retry => {
                    self.next_retry = None;
                    self.connect_irc();
                }
                Tick::Shutdown => break,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.state = OperationState::Stopping;
        self.next_retry = None;
        if let Some(link) = self.irc.take() {
            let _ = link.requests.send(IrcRequest::Quit).await;
            if time::timeout(SHUTDOWN_GRACE, link.task).await.is_err() {
                debug!("irc task did not stop within grace period");
            }
        }
        self.state = OperationState::Off;
    }

    async fn handle_command(&mut self, command: ControlCommand) -> CommandReply {
        match command {
            ControlCommand::On => match self.state {
                OperationState::Off => {
                    info!("starting operation");
                    self.start_operation();
                    Ok("Operation started".to_string())
                }
                _ => Err("Already running".to_string()),
            },
            ControlCommand::Off => {
                if self.state != OperationState::Off {
                    info!("stopping operation");
                    self.stop_operation().await;
                }
                Ok("Operation stopped".to_string())
            }
            ControlCommand::Clear => {
                self.ranking.clear();
                if self.state == OperationState::Off {
                    return Ok("Cleared".to_string());
                }
                match self.display.clear().await {
                    Ok(()) => {
                        self.mirror.record_clear();
                        self.health.record_success();
                        Ok("Cleared".to_string())
                    }
                    Err(err) => {
                        self.health.record_failure("clear", &err);
                        Err("Clearing display failed".to_string())
                    }
                }
            }
            ControlCommand::Pause => match self.state {
                OperationState::On => {
                    info!("display paused");
                    self.state = OperationState::Paused;
                    Ok("Paused".to_string())
                }
                _ => Err("Not running".to_string()),
            },
            ControlCommand::Resume => match self.state {
                OperationState::Paused => {
                    info!("display resumed");
                    self.state = OperationState::On;
                    self.drain_backlog().await;
                    Ok("Resumed".to_string())
                }
                _ => Err("Not paused".to_string()),
            },
            ControlCommand::Join(raw) => self.handle_join(raw).await,
        }
    }

    async fn handle_join(&mut self, raw: Vec<String>) -> CommandReply {
        if !matches!(self.state, OperationState::On | OperationState::Paused) {
            return Err("Not running".to_string());
        }
        let requested: Vec<String> = raw
            .iter()
            .filter_map(|c| irc::normalize_channel(c))
            .collect();
        if requested.is_empty() {
            return Err("Bad syntax".to_string());
        }

        // Idempotent on channels already in the set.
        let fresh: Vec<String> = requested
            .iter()
            .filter(|c| !self.channels.contains(c))
            .cloned()
            .collect();
        self.channels.extend(fresh.iter().cloned());

        if !fresh.is_empty() && self.irc_ready {
            if let Some(link) = &self.irc {
                let _ = link.requests.send(IrcRequest::Join(fresh)).await;
            }
        }

        let names: Vec<&str> = requested
            .iter()
            .map(|c| c.trim_start_matches('#'))
            .collect();
        Ok(format!("Joining {}", names.join(",")))
    }

    fn start_operation(&mut self) {
        self.state = OperationState::Starting;
        self.backoff.reset();
        self.connect_irc();
    }

    async fn stop_operation(&mut self) {
        // Backlog drops on OFF; fetched files stay cached on disk.
        self.ranking.clear();
        self.next_retry = None;
        self.irc_ready = false;
        if let Some(link) = self.irc.take() {
            let _ = link.requests.send(IrcRequest::Quit).await;
            if time::timeout(SHUTDOWN_GRACE, link.task).await.is_err() {
                debug!("irc task did not stop within grace period");
            }
        }
        self.state = OperationState::Off;
    }

    fn connect_irc(&mut self) {
        let (event_tx, event_rx) = mpsc::channel(IRC_EVENT_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(IRC_REQUEST_BUFFER);
        let task = self.chat_source.spawn(event_tx, request_rx);
        self.irc = Some(IrcLink {
            events: event_rx,
            requests: request_tx,
            task,
        });
        self.irc_ready = false;
    }

    async fn handle_irc_event(&mut self, event: IrcEvent) {
        match event {
            IrcEvent::Ready => {
                self.irc_ready = true;
                self.backoff.reset();
                if !self.channels.is_empty() {
                    if let Some(link) = &self.irc {
                        let _ = link
                            .requests
                            .send(IrcRequest::Join(self.channels.clone()))
                            .await;
                    }
                }
                if self.state == OperationState::Starting {
                    self.state = OperationState::On;
                    info!("operation running");
                }
            }
            IrcEvent::Joined { channel } => {
                info!(channel = %channel, "successfully joined channel");
            }
            IrcEvent::JoinFailed { channel } => {
                warn!(channel = %channel, "failed to join channel");
            }
            IrcEvent::Message(message) => self.handle_chat(message).await,
            IrcEvent::Disconnected { reason } => {
                self.irc = None;
                self.irc_ready = false;
                if matches!(
                    self.state,
                    OperationState::Starting | OperationState::On | OperationState::Paused
                ) {
                    let delay = self.backoff.next_delay();
                    warn!(reason = %reason, retry_in = ?delay, "chat connection lost");
                    self.next_retry = Some(Instant::now() + delay);
                }
            }
        }
    }

    async fn handle_chat(&mut self, message: ChatMessage) {
        if !matches!(self.state, OperationState::On | OperationState::Paused) {
            return;
        }
        if self.forbidden_users.contains(&message.sender) {
            return;
        }
        let tokens = analyzer::extract_tokens(
            &message.tags,
            &message.text,
            &self.forbidden,
            &self.analyzer_config,
        );
        for key in tokens {
            self.handle_token(key).await;
        }
    }

    /// One token from chat. The image is resolved before it is ranked, so
    /// everything in the backlog is already on disk by the time a slot
    /// frees up.
    async fn handle_token(&mut self, key: ImageKey) {
        let hit = match self.cache.resolve(&key).await {
            Ok(hit) => hit,
            Err(err) if err.is_terminal() => {
                self.forbid(&key);
                return;
            }
            Err(err) => {
                warn!(key = %key.fingerprint(), error = %err, "image fetch failed, dropping token");
                return;
            }
        };

        let fast_path = self.state == OperationState::On
            && self.health.is_reachable()
            && self.mirror.free_slots() > 0;
        if !fast_path {
            self.ranking.bump(&key);
            return;
        }

        let bytes = match tokio::fs::read(&hit.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %hit.path.display(), error = %err, "Cache miss. This isn't supposed to happen!");
                return;
            }
        };
        match self.display.send_image(bytes, hit.content_type, false).await {
            Ok(SendOutcome::Accepted) => {
                self.health.record_success();
                self.mirror.record_upload();
                debug!(key = %key.fingerprint(), "uploaded to display");
            }
            Ok(SendOutcome::Busy) => {
                // The device disagrees with the mirror; trust the device
                // until the next probe.
                self.mirror.apply_status(SlotStatus {
                    free: 0,
                    capacity: self.mirror.capacity(),
                });
                self.ranking.bump(&key);
            }
            Ok(SendOutcome::Rejected) => self.forbid(&key),
            Err(err) => {
                self.health.record_failure("upload", &err);
                self.ranking.bump(&key);
            }
        }
    }

    /// Pop ranked entries into free slots until something stops us.
    async fn drain_backlog(&mut self) {
        while self.state == OperationState::On
            && self.health.is_reachable()
            && self.mirror.free_slots() > 0
        {
            let Some(entry) = self.ranking.take() else {
                break;
            };

            let hit = match self.cache.resolve(&entry.key).await {
                Ok(hit) => hit,
                Err(err) if err.is_terminal() => {
                    self.forbid(&entry.key);
                    continue;
                }
                Err(err) => {
                    // Ranked entries were resolved on the way in, so this
                    // can only mean the cache was tampered with.
                    warn!(key = %entry.key.fingerprint(), error = %err, "Cache miss. This isn't supposed to happen!");
                    continue;
                }
            };
            let bytes = match tokio::fs::read(&hit.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %hit.path.display(), error = %err, "Cache miss. This isn't supposed to happen!");
                    continue;
                }
            };

            match self.display.send_image(bytes, hit.content_type, false).await {
                Ok(SendOutcome::Accepted) => {
                    self.health.record_success();
                    self.mirror.record_upload();
                    debug!(key = %entry.key.fingerprint(), "uploaded to display");
                }
                Ok(SendOutcome::Busy) => {
                    self.ranking.reinsert(entry);
                    break;
                }
                Ok(SendOutcome::Rejected) => self.forbid(&entry.key),
                Err(err) => {
                    self.health.record_failure("upload", &err);
                    self.ranking.reinsert(entry);
                    break;
                }
            }
        }
    }

    fn probe_wanted(&self) -> bool {
        if matches!(self.state, OperationState::Off | OperationState::Stopping) {
            return false;
        }
        self.mirror.capacity() == 0 || self.mirror.in_flight() > 0 || !self.ranking.is_empty()
    }

    async fn probe_display(&mut self) {
        match self.display.probe().await {
            Ok(status) => {
                self.mirror.apply_status(status);
                self.health.record_success();
                self.drain_backlog().await;
            }
            Err(err) => {
                self.health.record_failure("probe", &err);
            }
        }
    }

    fn forbid(&mut self, key: &ImageKey) {
        let token = key.ban_token();
        info!(token = %token, "adding to forbidden list");
        self.forbidden.insert(token);
    }
}

async fn recv_irc(irc: &mut Option<IrcLink>) -> Option<IrcEvent> {
    match irc {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
