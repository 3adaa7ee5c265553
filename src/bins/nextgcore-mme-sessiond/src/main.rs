//! NextGCore MME Session Core daemon
//!
//! Runs the session/bearer lifecycle manager and the EMM-CN coordinator
//! behind one event loop.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use nextgcore_mme_sessiond::sm::{self, MmeSm, DEFAULT_WORKERS};
use nextgcore_mme_sessiond::{
    BearerManager, ChannelDispatch, EmmCnCoordinator, InMemoryUeRepository, MmeConfig, MmeEvent,
    OutboundMessage, TokioTimerService,
};

/// Depth of the inbound event and outbound peer channels
const CHANNEL_DEPTH: usize = 1024;

/// NextGCore MME Session Core
#[derive(Parser, Debug)]
#[command(name = "nextgcore-mme-sessiond")]
#[command(author = "NextGCore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "EPC MME session and bearer lifecycle core")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nextgcore/mme.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable color output
    #[arg(long)]
    no_color: bool,

    /// Run in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

/// Session core application state
pub struct SessionApp {
    /// Running flag
    running: Arc<AtomicBool>,
    config: MmeConfig,
    events_tx: mpsc::Sender<MmeEvent>,
    events_rx: Option<mpsc::Receiver<MmeEvent>>,
}

impl SessionApp {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_DEPTH);
        Self {
            running: Arc::new(AtomicBool::new(true)),
            config: MmeConfig::default(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Load and validate the configuration
    pub fn init(&mut self, config_path: &str) -> Result<()> {
        log::info!("Initializing MME session core...");
        self.config = load_config(config_path)?;
        let gummei = self.config.gummei();
        log::info!(
            "GUMMEI {} mme_gid={} mme_code={}, max_ue={}, non-EPS service control {:?}",
            gummei.plmn_id,
            gummei.mme_gid,
            gummei.mme_code,
            self.config.max_ue,
            self.config.non_eps_service_control
        );
        Ok(())
    }

    /// Run until the running flag clears
    pub async fn run(&mut self) -> Result<()> {
        let events_rx = self
            .events_rx
            .take()
            .context("session core already started")?;
        let (peers_tx, peers_rx) = mpsc::channel(CHANNEL_DEPTH);

        let repo = Arc::new(InMemoryUeRepository::new(self.config.max_ue));
        let dispatch = Arc::new(ChannelDispatch::new(self.events_tx.clone(), peers_tx));
        let timers = Arc::new(TokioTimerService::new(
            tokio::runtime::Handle::current(),
            self.events_tx.clone(),
        ));
        let manager = BearerManager::new(
            repo.clone(),
            dispatch.clone(),
            timers,
            self.config.clone(),
        );
        let emm_cn = EmmCnCoordinator::new(repo, dispatch, self.config.clone());
        let sm = Arc::new(MmeSm::new(manager, emm_cn));

        let peers = tokio::spawn(drain_peers(peers_rx));
        log::info!("MME session core running...");
        sm::run(sm, events_rx, DEFAULT_WORKERS, self.running_flag()).await;
        peers.abort();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        log::info!("Shutting down MME session core...");
        self.stop();
        log::info!("MME session core shutdown complete");
    }

    /// Signal the application to stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Get the running flag for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Default for SessionApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration from YAML; a missing file falls back to the defaults
fn load_config(config_path: &str) -> Result<MmeConfig> {
    log::info!("Loading configuration from: {}", config_path);
    let content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Could not read config file '{}': {}. Using defaults.", config_path, e);
            return Ok(MmeConfig::default());
        }
    };
    MmeConfig::from_str(&content)
        .with_context(|| format!("invalid configuration '{}'", config_path))
}

/// Outbound messages are handed to the peer paths; without them attached
/// they are only logged.
async fn drain_peers(mut rx: mpsc::Receiver<OutboundMessage>) {
    while let Some(msg) = rx.recv().await {
        log::debug!("[peer] {}", msg.name());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    let mut logger = env_logger::Builder::new();
    logger.filter_level(log_level).format_timestamp_millis();
    if args.no_color {
        logger.write_style(env_logger::WriteStyle::Never);
    }
    logger.init();

    log::info!("NextGCore MME session core v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration: {}", args.config);
    if args.daemon {
        log::debug!("daemon mode requested");
    }

    let mut app = SessionApp::new();

    // Setup signal handlers
    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    app.init(&args.config)?;
    app.run().await?;
    app.shutdown();

    log::info!("NextGCore MME session core terminated");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
