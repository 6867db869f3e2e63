use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use thiserror::Error;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use matrix_relay::cache::{self, ImageCache, ReqwestFetchBackend};
use matrix_relay::command::{CommandServer, CommandServerError};
use matrix_relay::controller::{Controller, ControllerConfig};
use matrix_relay::display::{DisplayClient, ReqwestDisplayBackend};
use matrix_relay::irc::TmiConnector;
use matrix_relay::keys::BUILTIN_FORBIDDEN_NAMES;
use matrix_relay::telemetry::{self, LogConfig, LogLevel};
use matrix_relay::{PRODUCT_NAME, VERSION};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

const LICENSE_NOTICE: &str = "\
Matrix Relay: connects the Matrix Reloaded LED panel display to Twitch chat

This program is free software: you can redistribute it and/or modify it under \
the terms of the GNU Affero General Public License as published by the Free \
Software Foundation, either version 3 of the License, or (at your option) any \
later version.

This program is distributed in the hope that it will be useful, but WITHOUT \
ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS \
FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more \
details. <https://www.gnu.org/licenses/>";

#[derive(Parser, Debug)]
#[command(
    name = "matrix-relay",
    version,
    about = "Bridges Twitch chat emotes and emojis onto a Matrix Reloaded LED display"
)]
struct Cli {
    #[arg(
        value_name = "chan",
        help = "Required if standalone. Twitch channel(s) to join. Format: <#chan>{,<#chan>{,...}}"
    )]
    chan: Option<String>,

    #[arg(
        long,
        default_value = "matrix-reloaded.local",
        help = "Matrix display hostname or IP address to connect to"
    )]
    matrix_hostname: String,

    #[arg(
        long,
        value_enum,
        help = "Defaults to info. trace prints IRC communications, which will expose credentials!"
    )]
    log_level: Option<LogLevel>,

    #[arg(
        short,
        long,
        help = "Only output warnings and errors. --log-level still overrides"
    )]
    quiet: bool,

    #[arg(short, long, help = "No output at all")]
    silent: bool,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "ID",
        help = "Comma-separated list of forbidden Twitch emote ids"
    )]
    forbidden_emotes: Vec<String>,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "NICK",
        help = "Comma-separated list of Twitch users to be ignored. Use this to ignore your bots"
    )]
    forbidden_users: Vec<String>,

    #[arg(
        short = 'u',
        long,
        help = "Don't count repetitions of the same emote/emoji in a message"
    )]
    no_summation: bool,

    #[arg(
        short,
        long,
        help = "Don't do anything until commanded. Requires --command-port"
    )]
    interactive: bool,

    #[arg(
        long,
        value_name = "PORT",
        help = "TCP port for the command interface. Disabled when not specified"
    )]
    command_port: Option<u16>,

    #[arg(long, help = "Delete the image cache directory and exit")]
    purge: bool,

    #[arg(long, help = "Show the license prompt and exit")]
    license: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Logging(#[from] telemetry::InitError),
    #[error("{0}")]
    Cache(#[from] cache::CacheError),
    #[error("{0}")]
    Display(#[from] matrix_relay::display::DisplayError),
    #[error("{0}")]
    CommandServer(#[from] CommandServerError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.license {
        println!("{LICENSE_NOTICE}");
        return ExitCode::SUCCESS;
    }

    if cli.interactive && cli.command_port.is_none() {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "--command-port must be specified with --interactive",
            )
            .exit();
    }
    if cli.chan.is_none() && !cli.interactive {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a channel to join must be supplied when --interactive is not used",
            )
            .exit();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    telemetry::init(&LogConfig {
        level: cli.log_level,
        quiet: cli.quiet,
        silent: cli.silent,
    })?;

    let cache_dir = cache::default_cache_dir();
    if cli.purge {
        cache::purge_dir(&cache_dir).await?;
        info!(dir = %cache_dir.display(), "cache purged");
        return Ok(());
    }

    info!(
        "{PRODUCT_NAME} v{VERSION} (built-in forbidden emotes: {})",
        BUILTIN_FORBIDDEN_NAMES.join(", ")
    );

    let cache = ImageCache::new(cache_dir, Arc::new(ReqwestFetchBackend::new()?)).await?;
    let display = DisplayClient::new(&cli.matrix_hostname, Arc::new(ReqwestDisplayBackend::new()?))?;

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let command_task = match cli.command_port {
        Some(port) => {
            let server = CommandServer::bind(port).await?;
            Some(server.spawn(commands_tx))
        }
        None => {
            drop(commands_tx);
            None
        }
    };

    let config = ControllerConfig {
        startup_channels: cli
            .chan
            .as_deref()
            .map(|list| list.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        forbidden_emotes: cli.forbidden_emotes.into_iter().collect::<HashSet<_>>(),
        forbidden_users: cli
            .forbidden_users
            .into_iter()
            .map(|nick| nick.trim().to_ascii_lowercase())
            .collect(),
        no_summation: cli.no_summation,
        autostart: !cli.interactive,
    };

    let controller = Controller::new(config, display, cache, Arc::new(TmiConnector));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let controller_task = tokio::spawn(controller.run(commands_rx, shutdown_rx));

    signal::ctrl_c().await.ok();
    info!("shutdown requested");
    let _ = shutdown_tx.send(());

    // A second signal, or a blown deadline, forces the exit: a stop request
    // must always complete.
    tokio::select! {
        result = timeout(SHUTDOWN_DEADLINE, controller_task) => {
            if result.is_err() {
                warn!("shutdown deadline exceeded, exiting anyway");
            }
        }
        _ = signal::ctrl_c() => {
            warn!("second interrupt, exiting immediately");
        }
    }

    if let Some(task) = command_task {
        task.abort();
    }
    Ok(())
}
