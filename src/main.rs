#![allow(missing_docs)]

//! Dayflow binary: the `start` daemon plus one-shot workflow commands.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use dayflow::cancel::CancelSignal;
use dayflow::clock::SystemClock;
use dayflow::config::DayflowConfig;
use dayflow::connectors::http::{HttpItemSource, HttpTaskManager};
use dayflow::connectors::oauth::HttpTokenRefresher;
use dayflow::connectors::ItemSource;
use dayflow::core::{Collaborators, Core};
use dayflow::embed::OllamaEmbedder;
use dayflow::llm::anthropic::AnthropicChatter;
use dayflow::llm::Chatter;
use dayflow::nudge::deliver::SmtpMailer;
use dayflow::store::Store;
use dayflow::sync::ConflictChoice;
use dayflow::types::{Provider, UserId};
use dayflow::vector::HttpVectorStore;

#[derive(Debug, Parser)]
#[command(name = "dayflow", about = "Personal productivity backend", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon: nudge scheduler until interrupted.
    Start,
    /// Run one ingestion pipeline and print the report.
    Ingest {
        /// User identifier.
        #[arg(long)]
        user: String,
        /// Source: calendar | mail | task_manager.
        #[arg(long)]
        source: String,
    },
    /// Generate the plan for a date and print it.
    Plan {
        /// User identifier.
        #[arg(long)]
        user: String,
        /// Date (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,
    },
    /// Run one task-manager sync cycle.
    Sync {
        /// User identifier.
        #[arg(long)]
        user: String,
    },
    /// Print the sync status summary.
    Status {
        /// User identifier.
        #[arg(long)]
        user: String,
    },
    /// Resolve a sync conflict.
    Resolve {
        /// User identifier.
        #[arg(long)]
        user: String,
        /// Task identifier.
        #[arg(long)]
        task: String,
        /// Winning side: local | external.
        #[arg(long)]
        choice: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets come from the environment (optionally via .env).
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = DayflowConfig::load()?;

    let _logging_guard = if matches!(cli.command, Command::Start) {
        Some(dayflow::logging::init_production(Path::new(
            &config.core.logs_dir,
        ))?)
    } else {
        dayflow::logging::init_cli();
        None
    };

    let store = Store::open(&config.core.db_path)
        .await
        .context("failed to open task store")?;
    let core = build_core(store, config).context("failed to assemble core")?;

    match cli.command {
        Command::Start => run_daemon(core).await,
        Command::Ingest { user, source } => {
            let provider = Provider::parse(&source).map_err(|e| anyhow::anyhow!("{e}"))?;
            let report = core
                .run_ingest(&UserId::from(user.as_str()), provider, &CancelSignal::never())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Plan { user, date } => {
            let plan = core
                .generate_plan(&UserId::from(user.as_str()), date, &CancelSignal::never())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Sync { user } => {
            let report = core
                .sync_task_manager(&UserId::from(user.as_str()), &CancelSignal::never())
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{report:?}");
            Ok(())
        }
        Command::Status { user } => {
            let summary = core
                .sync_status(&UserId::from(user.as_str()))
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Resolve { user, task, choice } => {
            let choice = ConflictChoice::parse(&choice).map_err(|e| anyhow::anyhow!("{e}"))?;
            let task = core
                .resolve_conflict(
                    &UserId::from(user.as_str()),
                    &task,
                    choice,
                    &CancelSignal::never(),
                )
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
    }
}

/// Build the core with production collaborators from config + env.
fn build_core(store: Store, config: DayflowConfig) -> Result<Core> {
    let chatter: Option<Arc<dyn Chatter>> = match std::env::var(&config.llm.api_key_env) {
        Ok(api_key) if !api_key.is_empty() => Some(Arc::new(AnthropicChatter::new(
            &config.llm.base_url,
            &config.llm.model,
            &api_key,
        ))),
        _ => {
            info!(
                var = %config.llm.api_key_env,
                "no LLM api key, running with rule-based extraction and deterministic plans"
            );
            None
        }
    };

    let embedder = Some(Arc::new(OllamaEmbedder::new(
        &config.embedding.base_url,
        &config.embedding.model,
        config.embedding.dims,
    )) as Arc<dyn dayflow::embed::Embedder>);
    let vectors = Some(Arc::new(HttpVectorStore::new(
        &config.vector.base_url,
        &config.vector.collection,
    )) as Arc<dyn dayflow::vector::VectorStore>);

    let base = |env_key: &str, default: &str| {
        std::env::var(env_key).unwrap_or_else(|_| default.to_owned())
    };
    let mut sources: HashMap<Provider, Arc<dyn ItemSource>> = HashMap::new();
    sources.insert(
        Provider::Calendar,
        Arc::new(HttpItemSource::new(&base(
            "DAYFLOW_CALENDAR_BASE_URL",
            "http://127.0.0.1:8181/calendar",
        ))),
    );
    sources.insert(
        Provider::Mail,
        Arc::new(HttpItemSource::new(&base(
            "DAYFLOW_MAIL_BASE_URL",
            "http://127.0.0.1:8181/mail",
        ))),
    );
    let task_manager_base = base("DAYFLOW_TASKS_BASE_URL", "http://127.0.0.1:8181/taskmgr");
    sources.insert(
        Provider::TaskManager,
        Arc::new(HttpItemSource::new(&task_manager_base)),
    );

    let refresher = Arc::new(HttpTokenRefresher::new(
        &base("DAYFLOW_OAUTH_TOKEN_URL", "http://127.0.0.1:8181/oauth/token"),
        &base("DAYFLOW_OAUTH_CLIENT_ID", "dayflow"),
        &std::env::var("DAYFLOW_OAUTH_CLIENT_SECRET").unwrap_or_default(),
    ));

    let mailer = if config.email.email_enabled {
        match SmtpMailer::new(&config.email.smtp_host, config.email.smtp_port) {
            Ok(m) => Some(Arc::new(m) as Arc<dyn dayflow::nudge::deliver::Mailer>),
            Err(e) => {
                error!(error = %e, "smtp relay unavailable, email delivery disabled");
                None
            }
        }
    } else {
        None
    };

    let collab = Collaborators {
        chatter,
        embedder,
        vectors,
        sources,
        task_manager: Arc::new(HttpTaskManager::new(&task_manager_base)),
        refresher,
        mailer,
        clock: Arc::new(SystemClock),
    };
    Core::new(store, config, collab).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Run the background loops until SIGINT.
async fn run_daemon(core: Core) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = core.spawn_scheduler(shutdown_rx.clone());
    let sync_cadence = core.spawn_sync_cadence(shutdown_rx);
    info!("dayflow started; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = scheduler.await;
    if let Some(handle) = sync_cadence {
        let _ = handle.await;
    }
    Ok(())
}
