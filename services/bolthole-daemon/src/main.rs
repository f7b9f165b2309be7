//! Bolthole Daemon - the workstation-side endpoint of the data plane
//!
//! Drives one datachannel to a target through the bastion: stdin lines
//! become plugin frames, stream messages from the target land on stdout.
//! Richer plugin frontends (database proxies, kube API, web) attach
//! through the same datachannel surface.

mod exitcode;
mod zli;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bolthole_cch::{CchError, DaemonCch, DaemonCchConfig};
use bolthole_crypto::PublicKey;
use bolthole_datachannel::{
    DataChannel, DataChannelConfig, DataChannelError, PluginEvent, PluginHandle, PluginInput,
};
use bolthole_transport::{Transport, TransportError, WebsocketTransport};

use exitcode::exit_status;
use zli::{ZliCertProvider, ZliConfigError};

/// Bolthole Daemon - open an authorised tunnel to a target
#[derive(Parser, Debug)]
#[command(name = "bolthole-daemon", version)]
struct Args {
    /// Target's public key (its registered identity)
    #[arg(long, env = "BOLTHOLE_TARGET_ID")]
    target_id: String,

    /// Connection node websocket URL
    #[arg(long, env = "BOLTHOLE_CONNECTION_URL")]
    connection_url: String,

    /// Workstation config written by the login flow
    #[arg(long, env = "BOLTHOLE_ZLI_CONFIG")]
    config_path: PathBuf,

    /// Opening action for the session
    #[arg(long, default_value = "shell/open")]
    action: String,

    /// Attach to a session the target already holds open
    #[arg(long)]
    attach: bool,

    /// Log filter
    #[arg(long, env = "BOLTHOLE_LOG", default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("cancelled by user")]
    Cancelled,

    #[error(transparent)]
    ZliConfig(#[from] ZliConfigError),

    #[error(transparent)]
    DataChannel(#[from] DataChannelError),

    #[error(transparent)]
    Cch(#[from] CchError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = run(args).await;
    if let Err(e) = &result {
        error!(error = %e, "session failed");
    }

    // The one place a typed error becomes a process exit code.
    ExitCode::from(exit_status(&result) as u8)
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let config = zli::load(&args.config_path)?;
    let keypair = zli::keypair(&config)?;

    let transport: Arc<dyn Transport> =
        Arc::new(WebsocketTransport::connect(args.connection_url.clone()));
    let cch = Arc::new(DaemonCch::new(
        DaemonCchConfig::new(keypair, PublicKey::new(args.target_id.clone())),
        ZliCertProvider::new(args.config_path.clone()),
    ));

    let (handle, event_tx, input_rx) = PluginHandle::pair(64);
    spawn_stdin_pump(args.action.clone(), event_tx);
    spawn_stdout_pump(input_rx);

    let mut channel_config = DataChannelConfig::new(args.action.clone());
    channel_config.attach = args.attach;
    let channel = DataChannel::open(transport, cch, handle, channel_config).await?;
    info!(channel_id = %channel.id(), target_id = %args.target_id, "session established");

    tokio::select! {
        outcome = channel.done() => Ok(outcome?),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, closing session");
            channel.close();
            let _ = channel.done().await;
            Err(DaemonError::Cancelled)
        }
    }
}

/// stdin lines become plugin frames; EOF closes the plugin and starts the
/// drain-on-close path.
fn spawn_stdin_pump(action: String, event_tx: tokio::sync::mpsc::Sender<PluginEvent>) {
    tokio::spawn(async move {
        let input_action = format!("{}/input", action.split('/').next().unwrap_or("shell"));
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = PluginEvent::Output {
                        action: input_action.clone(),
                        payload: line.into_bytes(),
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    return;
                }
            }
        }
    });
}

/// Stream content from the target lands on stdout verbatim
fn spawn_stdout_pump(mut input_rx: tokio::sync::mpsc::Receiver<PluginInput>) {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(input) = input_rx.recv().await {
            let bytes = match input {
                PluginInput::Stream(stream) => stream.content,
                PluginInput::Response { payload, .. } => payload,
            };
            if stdout.write_all(&bytes).await.is_err() {
                return;
            }
            let _ = stdout.flush().await;
        }
    });
}
