use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use gangway::config::Config;
use gangway::layout::{HeadlessWorkspace, Workspace};
use gangway::logging::{self, LogConfig, LogLevel};
use gangway::observer::TracingObserver;
use gangway::session::manager::WorkspaceFactory;
use gangway::session::{HostEntry, SessionDeps, SessionManager};
use gangway::signaling::{
    HttpSignaling, RendezvousClient, RendezvousMessage, RendezvousSignaling, RoutedSignaling,
    SignalingBackend,
};
use gangway::transport::webrtc::WebRtcConnector;
use tokio::sync::mpsc;

const DISENGAGE_CEILING: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "gangway", about = "Keeps a terminal session to a remote host alive over WebRTC")]
struct Cli {
    /// `host:port` of the host's signaling endpoint.
    #[arg(long)]
    addr: Option<String>,

    /// Rendezvous fingerprint of the host.
    #[arg(long)]
    fingerprint: Option<String>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long, env = "GANGWAY_TOKEN", hide_env_values = true, default_value = "")]
    token: String,

    #[arg(long, help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());

    if cli.addr.is_none() && cli.fingerprint.is_none() {
        bail!("either --addr or --fingerprint is required");
    }

    let (rendezvous, mut inbound) = match config.rendezvous() {
        Some(rendezvous_config) => {
            let (client, inbound) = RendezvousClient::spawn(&rendezvous_config)
                .context("failed to start the rendezvous client")?;
            (Some(client), Some(inbound))
        }
        None => (None, None),
    };
    if cli.addr.is_none() && rendezvous.is_none() {
        bail!("--fingerprint needs peerbook.email and peerbook.fingerprint in the configuration");
    }

    let http = HttpSignaling::new().context("failed to build the HTTP client")?;
    let relay = rendezvous
        .clone()
        .map(|client| Arc::new(RendezvousSignaling::new(client)) as Arc<dyn SignalingBackend>);
    let deps = SessionDeps {
        connector: Arc::new(WebRtcConnector::new()),
        signaling: Arc::new(RoutedSignaling::new(http, relay)),
        observer: Arc::new(TracingObserver),
    };
    let max_tabs = config.ui.max_tabs;
    let workspaces: WorkspaceFactory =
        Arc::new(move || Box::new(HeadlessWorkspace::new(max_tabs)) as Box<dyn Workspace>);

    let mut manager = SessionManager::from_config(&config, cli.token.clone(), deps, workspaces);
    if let Some(client) = rendezvous {
        manager.set_rendezvous(client);
    }

    let mut host = HostEntry::new(cli.addr.clone(), cli.user.clone());
    if let Some(fingerprint) = &cli.fingerprint {
        host = host.with_fingerprint(fingerprint.clone());
    }
    if let Some(name) = &cli.name {
        host = host.with_name(name.clone());
    }
    let id = host.id.clone();
    manager.add_host(host);
    let session = manager.activate(&id).context("session stopped before connecting")?;
    let mut status = session.subscribe();

    loop {
        tokio::select! {
            message = next_rendezvous(&mut inbound) => match message {
                Some(message) => manager.handle_rendezvous(message),
                None => {
                    tracing::warn!("rendezvous channel closed");
                    inbound = None;
                }
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                tracing::info!(
                    state = ?current.state,
                    boarding = current.boarding,
                    authenticated = current.authenticated,
                    generation = current.generation,
                    "session status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                tracing::info!("interrupted, disengaging");
                if !manager.disengage_all(DISENGAGE_CEILING).await {
                    tracing::warn!("some sessions did not disengage in time");
                }
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn next_rendezvous(
    inbound: &mut Option<mpsc::UnboundedReceiver<RendezvousMessage>>,
) -> Option<RendezvousMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
