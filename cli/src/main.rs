#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use tunnel::{Local, LocalConfig, Proto, Server, ServerConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Calling `install_default` only once per process should always succeed");

    setup_logging(cli.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("Goodbye!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Local(args) => {
            let local = Local::bind(args.into_config()?).await?;
            run_until_interrupted(Arc::clone(&local).run(), move || local.stop()).await
        }
        Command::Server(args) => {
            let server = Server::bind(args.into_config()?).await?;
            run_until_interrupted(Arc::clone(&server).run(), move || server.stop()).await
        }
    }
}

/// Drives the peer until it stops on its own or Ctrl-C asks it to.
async fn run_until_interrupted(
    run: impl Future<Output = Result<()>> + Send + 'static,
    stop: impl FnOnce(),
) -> Result<()> {
    let mut task = tokio::spawn(run);

    tokio::select! {
        res = &mut task => res.context("peer task panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Received Ctrl-C, shutting down");
            stop();
            task.await.context("peer task panicked")?
        }
    }
}

fn setup_logging(debug: bool) {
    let default_directives = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A tunneling proxy that relays TCP streams over rotating WebSockets.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Default the log filter to debug instead of info (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the local peer: a SOCKS5 / HTTP proxy forwarding over tunnels.
    Local(LocalArgs),
    /// Run the publicly reachable peer that terminates tunnels.
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct LocalArgs {
    /// Address to listen on.
    #[arg(
        short,
        long,
        env = "SIDETRACK_LISTEN",
        default_value = "tcp://0.0.0.0:3810"
    )]
    listen: String,

    /// Remote server(s) to tunnel through, separated by comma.
    #[arg(
        short,
        long,
        env = "SIDETRACK_REMOTES",
        default_value = "ws://127.0.0.1:3811/ws"
    )]
    remotes: String,

    /// Shared password for the envelope codec.
    #[arg(short, long, env = "SIDETRACK_PASSWORD")]
    password: Option<SecretString>,

    /// Protocol spoken to applications on the listener.
    #[arg(
        short = 't',
        long,
        env = "SIDETRACK_PROTO",
        default_value = "socks5",
        value_parser = parse_proto
    )]
    proto: Proto,

    /// Rotate each tunnel's WebSocket after this long, e.g. "56s" or "2m".
    /// Keep it below the remote host's upgrade timeout.
    #[arg(long, env = "SIDETRACK_TTL", default_value = "56s")]
    ttl: humantime::Duration,

    /// JSON config file; takes precedence over the individual flags.
    #[arg(short, long, env = "SIDETRACK_CONFIG")]
    config: Option<PathBuf>,
}

impl LocalArgs {
    fn into_config(self) -> Result<LocalConfig> {
        if let Some(path) = self.config {
            return load_config(&path);
        }

        Ok(LocalConfig {
            listen: self.listen,
            remotes: self.remotes,
            password: self
                .password
                .context("--password is required unless --config is given")?,
            proto: self.proto,
            ttl_secs: self.ttl.as_secs(),
        })
    }
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on.
    #[arg(
        short,
        long,
        env = "SIDETRACK_LISTEN",
        default_value = "tcp://0.0.0.0:3811"
    )]
    listen: String,

    /// Shared password for the envelope codec.
    #[arg(short, long, env = "SIDETRACK_PASSWORD")]
    password: Option<SecretString>,

    /// JSON config file; takes precedence over the individual flags.
    #[arg(short, long, env = "SIDETRACK_CONFIG")]
    config: Option<PathBuf>,
}

impl ServerArgs {
    fn into_config(self) -> Result<ServerConfig> {
        if let Some(path) = self.config {
            return load_config(&path);
        }

        Ok(ServerConfig {
            listen: self.listen,
            password: self
                .password
                .context("--password is required unless --config is given")?,
        })
    }
}

fn parse_proto(s: &str) -> Result<Proto, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn load_config<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
