//! Bolthole Agent - the target-side endpoint of the data plane
//!
//! Startup order: load config, register if needed (or forced), report any
//! qualified shutdown from the previous process generation, connect the
//! transport, run the control channel under the control monitor, and
//! persist the shutdown reason on the way out so the next generation can
//! report it.

mod spawner;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bolthole_bastion::{
    register, BastionClient, IdentityTokenCache, RegistrationOptions, ReportReporter, RestartReport,
};
use bolthole_config::{
    AgentConfig, ClusterBackend, ConfigBackend, ConfigDoc, ConfigError, FileBackend,
};
use bolthole_control::{
    is_qualified_shutdown, ControlChannel, ControlChannelConfig, ControlMonitor, MonitorOutcome,
    DEFAULT_HEART_RATE,
};
use bolthole_crypto::KeyPair;
use bolthole_transport::{Transport, WebsocketTransport};

use spawner::AgentChannelSpawner;
use state::agent_state;

/// Bolthole Agent - zero-trust access to this target
#[derive(Parser, Debug)]
#[command(name = "bolthole-agent", version)]
struct Args {
    /// Bastion service URL
    #[arg(long, env = "BOLTHOLE_SERVICE_URL")]
    service_url: String,

    /// One-shot activation token for registration
    #[arg(long, env = "BOLTHOLE_ACTIVATION_TOKEN")]
    activation_token: Option<String>,

    /// API key used to mint an activation token when none is supplied
    #[arg(long, env = "BOLTHOLE_API_KEY")]
    api_key: Option<String>,

    /// Environment this target registers into
    #[arg(long, env = "BOLTHOLE_ENVIRONMENT_ID", default_value = "")]
    environment_id: String,

    /// Name this target registers under
    #[arg(long, env = "BOLTHOLE_TARGET_NAME", default_value = "")]
    target_name: String,

    /// Config directory (file backend)
    #[arg(long, env = "BOLTHOLE_CONFIG_DIR", default_value = "/etc/bolthole")]
    config_dir: PathBuf,

    /// Re-register even when already registered
    #[arg(short = 'f', long)]
    force_register: bool,

    /// Register and exit without serving
    #[arg(long)]
    register_only: bool,

    /// Log filter
    #[arg(long, env = "BOLTHOLE_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let target_name = if args.target_name.is_empty() {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "bolthole-target".to_string())
    } else {
        args.target_name.clone()
    };

    let mut store = config_store(&args, &target_name).await?;
    let client = BastionClient::new(&args.service_url);

    let mut config = store.fetch().await.context("reading agent config")?;
    if args.force_register || !config.is_registered() {
        let options = RegistrationOptions {
            service_url: args.service_url.clone(),
            activation_token: args.activation_token.clone(),
            api_key: args.api_key.clone(),
            environment_id: args.environment_id.clone(),
            target_name: target_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        config = register(&client, store.as_mut(), &options)
            .await
            .context("registering with bastion")?;
        info!(target_id = %config.target_id, "registration complete");
    } else {
        info!(target_id = %config.target_id, "already registered");
    }

    if args.register_only {
        return Ok(());
    }

    run_agent(args, store, client, config).await
}

/// Kubernetes pods persist through a namespaced Secret, plain hosts
/// through the config directory.
async fn config_store(
    args: &Args,
    target_name: &str,
) -> anyhow::Result<Box<dyn ConfigBackend<AgentConfig>>> {
    if std::env::var("KUBERNETES_SERVICE_HOST").is_ok() {
        let backend: ClusterBackend<AgentConfig> = ClusterBackend::new(target_name)
            .await
            .context("connecting to the cluster api")?;
        Ok(Box::new(backend))
    } else {
        let backend: FileBackend<AgentConfig> = FileBackend::new(&args.config_dir);
        Ok(Box::new(backend))
    }
}

async fn run_agent(
    args: Args,
    mut store: Box<dyn ConfigBackend<AgentConfig>>,
    client: BastionClient,
    config: AgentConfig,
) -> anyhow::Result<()> {
    let keypair =
        KeyPair::from_base64(&config.private_key).context("decoding persisted key pair")?;
    let tokens = Arc::new(IdentityTokenCache::new(
        BastionClient::new(&args.service_url),
        keypair.clone(),
        Some(config.agent_identity_token.clone()),
    ));

    report_previous_shutdown(&client, &tokens, store.as_mut(), &config).await;

    let connection_url = client
        .connection_service_url()
        .await
        .context("resolving connection service url")?;
    let transport: Arc<dyn Transport> =
        Arc::new(WebsocketTransport::connect(websocket_url(&connection_url)));

    let spawner = Arc::new(
        AgentChannelSpawner::new(transport.clone(), keypair.clone(), &config)
            .map_err(|e| anyhow::anyhow!("building datachannel spawner: {e}"))?,
    );
    let (control, mut handles) = ControlChannel::start(
        ControlChannelConfig::new(config.target_id.clone(), config.target_id.clone()),
        transport.clone(),
        spawner,
    );

    // Runtime errors go to the bastion without ever blocking the monitor.
    let mut runtime_errors = std::mem::replace(
        &mut handles.runtime_errors,
        tokio::sync::mpsc::unbounded_channel().1,
    );
    let reporter_client = BastionClient::new(&args.service_url);
    let reporter_tokens = tokens.clone();
    let reporter_transport = transport.clone();
    let reporter_config = config.clone();
    tokio::spawn(async move {
        while let Some(runtime_error) = runtime_errors.recv().await {
            warn!(error = %runtime_error, "runtime error");
            let report = bolthole_bastion::ErrorReport {
                reporter: ReportReporter {
                    target_id: reporter_config.target_id.clone(),
                    agent_public_key: reporter_config.public_key.clone(),
                },
                timestamp: Utc::now(),
                message: runtime_error.to_string(),
                state: agent_state(&reporter_config.target_id, reporter_transport.is_up()),
            };
            match reporter_tokens.get().await {
                Ok(token) => {
                    if let Err(e) = reporter_client.report_error(&token, &report).await {
                        warn!(error = %e, "failed to ship error report");
                    }
                }
                Err(e) => warn!(error = %e, "no identity token for error report"),
            }
        }
    });

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let monitor = ControlMonitor::new(DEFAULT_HEART_RATE);
    let outcome = monitor.run(&control, &mut handles, &cancel).await;

    let reason = match &outcome {
        MonitorOutcome::Restart { reason } => reason.clone(),
        MonitorOutcome::Shutdown => "process termination".to_string(),
    };
    info!(%reason, "agent shutting down");

    control.close();
    control.join().await;
    persist_shutdown(store.as_mut(), &reason, &config, transport.is_up()).await;
    Ok(())
}

/// If the last generation died for a qualifying reason, tell the bastion
/// before serving again, then clear the record.
async fn report_previous_shutdown(
    client: &BastionClient,
    tokens: &IdentityTokenCache,
    store: &mut dyn ConfigBackend<AgentConfig>,
    config: &AgentConfig,
) {
    if !is_qualified_shutdown(&config.shutdown_reason) {
        return;
    }

    let report = RestartReport {
        target_id: config.target_id.clone(),
        agent_public_key: config.public_key.clone(),
        timestamp: Utc::now(),
        message: config.shutdown_reason.clone(),
        state: config.shutdown_state.clone(),
    };
    match tokens.get().await {
        Ok(token) => match client.report_restart(&token, &report).await {
            Ok(()) => info!(reason = %config.shutdown_reason, "reported qualified shutdown"),
            Err(e) => {
                warn!(error = %e, "failed to report qualified shutdown");
                return;
            }
        },
        Err(e) => {
            warn!(error = %e, "no identity token for restart report");
            return;
        }
    }

    persist_shutdown(store, "", config, true).await;
}

/// Record the shutdown reason and state for the next generation, riding
/// out optimistic-concurrency conflicts with a refetch.
async fn persist_shutdown(
    store: &mut dyn ConfigBackend<AgentConfig>,
    reason: &str,
    config: &AgentConfig,
    connection_up: bool,
) {
    for _ in 0..3 {
        let mut fresh = match store.fetch().await {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(error = %e, "could not read config to persist shutdown");
                return;
            }
        };
        fresh.shutdown_reason = reason.to_string();
        fresh.shutdown_state = if reason.is_empty() {
            Default::default()
        } else {
            agent_state(&config.target_id, connection_up)
        };

        match store.save(&fresh).await {
            Ok(()) => return,
            Err(ConfigError::ChangedSinceFetch) => continue,
            Err(e) => {
                error!(error = %e, "could not persist shutdown record");
                return;
            }
        }
    }
    error!("gave up persisting shutdown record after repeated conflicts");
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received");
        cancel.cancel();
    });
}

fn websocket_url(connection_url: &str) -> String {
    if let Some(rest) = connection_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = connection_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        connection_url.to_string()
    }
}
