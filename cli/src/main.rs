//! hearthd: the hearth background daemon.
//!
//! Start order: env/config load, PID file claim, store open, worker pool,
//! gap-detection sweep, RPC socket bind. SIGHUP reloads LLM settings;
//! SIGTERM / SIGINT drain with a five-second deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{PidFile, ReloadableLlm};
use hearth::explore::{NullFactIntegration, NullKnowledgeGraph};
use hearth::llm::OpenAiEmbedder;
use hearth::{ChatOpenAi, Daemon, DaemonConfig, DaemonDeps, NullStimulus};

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const GAP_SWEEP_EVERY: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "hearthd", about = "Durable-memory daemon for a conversational coding CLI")]
struct Args {
    /// Data directory override (default: platform data dir + hearth).
    #[arg(long, env = "HEARTH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Bind a TCP address instead of the Unix socket (loopback debugging).
    #[arg(long)]
    tcp: Option<String>,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

fn chat_client(config: &DaemonConfig) -> Arc<ChatOpenAi> {
    Arc::new(ChatOpenAi::from_settings(
        config.llm_base_url.as_deref(),
        config.chat_model.clone(),
    ))
}

fn utility_client(config: &DaemonConfig) -> Arc<ChatOpenAi> {
    Arc::new(ChatOpenAi::from_settings(
        config.llm_base_url.as_deref(),
        config.utility_model.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    config::load_and_apply(None)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let data_dir = match args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            dir
        }
        None => config::data_dir()?,
    };
    let daemon_config = DaemonConfig::from_env(data_dir.clone());

    let _pid = PidFile::acquire(&daemon_config.pid_path())?;

    let chat = ReloadableLlm::new(chat_client(&daemon_config));
    let utility = ReloadableLlm::new(utility_client(&daemon_config));
    let embedder = Arc::new(OpenAiEmbedder::from_settings(
        daemon_config.llm_base_url.as_deref(),
        daemon_config.embed_model.clone(),
        daemon_config.embed_dim,
    ));

    let daemon = Daemon::open(
        daemon_config.clone(),
        DaemonDeps {
            chat_llm: chat.clone(),
            utility_llm: utility.clone(),
            embedder,
            facts: Arc::new(NullFactIntegration),
            graph: Arc::new(NullKnowledgeGraph),
            stimulus: Arc::new(NullStimulus),
        },
    )?;
    daemon.start_workers().await;
    tracing::info!(data_dir = %data_dir.display(), "hearthd started");

    // Periodic gap detection seeds curiosity tasks from the knowledge graph.
    let gap_daemon = daemon.clone();
    let gap_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(GAP_SWEEP_EVERY);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            match gap_daemon.explorer.spawn_gap_tasks("global").await {
                Ok(0) => {}
                Ok(n) => tracing::info!(created = n, "gap detection seeded curiosity tasks"),
                Err(e) => tracing::warn!("gap detection failed: {}", e),
            }
        }
    });

    let shutdown = CancellationToken::new();
    let server = {
        let daemon = daemon.clone();
        let shutdown = shutdown.clone();
        match args.tcp {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                tracing::info!(%addr, "listening on tcp");
                tokio::spawn(async move { serve::run_tcp(daemon, listener, shutdown).await })
            }
            None => {
                let socket = daemon_config.socket_path();
                tokio::spawn(async move { serve::run_unix(daemon, &socket, shutdown).await })
            }
        }
    };

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                // Reload LLM endpoint and model names; storage settings need
                // a restart.
                if let Err(e) = config::load_and_apply(None) {
                    tracing::warn!("config reload failed: {}", e);
                    continue;
                }
                let fresh = DaemonConfig::from_env(data_dir.clone());
                chat.swap(chat_client(&fresh));
                utility.swap(utility_client(&fresh));
                if fresh.embed_model != daemon_config.embed_model
                    || fresh.embed_dim != daemon_config.embed_dim
                {
                    tracing::warn!("embedding settings changed; restart required to apply");
                }
                tracing::info!(
                    chat = %fresh.chat_model,
                    utility = %fresh.utility_model,
                    "config reloaded"
                );
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    tracing::info!("shutting down");
    shutdown.cancel();
    gap_task.abort();
    if tokio::time::timeout(DRAIN_DEADLINE, daemon.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("drain deadline exceeded; exiting with work in flight");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
    tracing::info!("bye");
    Ok(())
}
