use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use hark_agent::{AgentConfig, AgentProcess};
use hark_server::peer_auth::{PeerAuth, SocketResolver, DEFAULT_IDENTITY_SOCKET};
use hark_server::{serve_http, serve_ws, Relay, RelayDeps};
use hark_speech::stt::SttClient;
use hark_speech::tts::TtsClient;
use hark_types::config::{EXIT_CHILD_FAILURE, EXIT_CONFIG};
use hark_types::{RelayConfig, ServerSettings};

/// Hark -- voice-to-agent relay server.
#[derive(Parser, Debug)]
#[command(name = "hark-server", version, about)]
struct Cli {
    /// Directory where the agent will operate (falls back to WORK_DIR)
    folder: Option<PathBuf>,

    /// Increase logging verbosity (RUST_LOG=debug)
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = match ServerSettings::from_env() {
        Ok(settings) => settings,
        Err(message) => {
            tracing::error!(%message, "missing required configuration");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let work_dir = match cli.folder.or_else(|| settings.work_dir.clone()) {
        Some(dir) => dir,
        None => {
            tracing::error!("no working directory given (argument or WORK_DIR)");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };
    let work_dir = match work_dir.canonicalize() {
        Ok(dir) if dir.is_dir() => dir,
        _ => {
            tracing::error!(dir = %work_dir.display(), "working directory is not a directory");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let auth = Arc::new(PeerAuth::new(
        settings.allowed_nodes.clone(),
        Box::new(SocketResolver::new(DEFAULT_IDENTITY_SOCKET)),
    ));
    if auth.enabled() {
        tracing::info!(nodes = settings.allowed_nodes.len(), "peer gate enabled");
    } else {
        tracing::info!("peer gate disabled (ALLOWED_NODES empty)");
    }

    let (agent_tx, agent_rx) = mpsc::unbounded_channel();
    let agent = AgentProcess::new(AgentConfig::new(&work_dir), agent_tx);
    if let Err(e) = agent.start().await {
        // Not fatal at boot; the first submission retries the launch.
        tracing::warn!(error = %e, "agent did not start at boot");
    }

    let (relay, mut fatal_rx) = Relay::start(RelayDeps {
        stt: SttClient::new(settings.stt_api_key.clone()),
        tts: TtsClient::new(settings.stt_api_key.clone()),
        auth,
        agent,
        agent_updates: agent_rx,
        work_dir: work_dir.clone(),
        relay_config: RelayConfig::default(),
        upload_cap: hark_server::service::DEFAULT_UPLOAD_CAP,
    });

    tracing::info!(
        http_port = settings.port_http,
        ws_port = settings.port_ws,
        work_dir = %work_dir.display(),
        "relay starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http = {
        let relay = Arc::clone(&relay);
        let shutdown = shutdown_rx.clone();
        let port = settings.port_http;
        tokio::spawn(async move { serve_http(relay, port, shutdown).await })
    };
    let ws = {
        let relay = Arc::clone(&relay);
        let shutdown = shutdown_rx.clone();
        let port = settings.port_ws;
        tokio::spawn(async move { serve_ws(relay, port, shutdown).await })
    };

    let mut code = ExitCode::SUCCESS;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
        _ = fatal_rx.wait_for(|&fatal| fatal) => {
            tracing::error!("agent failed unrecoverably, exiting");
            code = ExitCode::from(EXIT_CHILD_FAILURE as u8);
        }
        result = http => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "HTTP server failed");
                code = ExitCode::FAILURE;
            }
        }
        result = ws => {
            if let Ok(Err(e)) = result {
                tracing::error!(error = %e, "WebSocket server failed");
                code = ExitCode::FAILURE;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    relay.shutdown().await;
    code
}
