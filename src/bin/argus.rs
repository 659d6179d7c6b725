//! argus CLI — operator interface to the event-analysis services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argus::analyze::Analyzer;
use argus::cache::Cache;
use argus::config::Config;
use argus::db::Db;
use argus::http::{self, AppState};
use argus::llm::gemini::GeminiClient;
use argus::llm::LlmGateway;
use argus::model::NewEvent;
use argus::processor::{Processor, ProcessorConfig};
use argus::prompts::PromptLibrary;
use argus::telemetry::{init_telemetry, TelemetryConfig};
use argus::triage::TriageOrchestrator;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::{info, warn};

const DB_CONNECT_ATTEMPTS: u32 = 10;
const DB_CONNECT_DELAY: Duration = Duration::from_secs(3);
/// Load-balancer drain window between flipping readiness and stopping.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "argus", about = "Real-time security-event analysis platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue processor (consume, persist, aggregate)
    Processor,
    /// Run the analyzer HTTP API (analyze, triage, queries)
    Analyzer,
    /// Event operations
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// Publish an event to the primary queue
    Submit {
        /// Event source (e.g. "firewall")
        source: String,
        /// Event type (e.g. "connection_blocked")
        event_type: String,
        /// Severity: info, warn, err, critical
        #[arg(long, default_value = "info")]
        severity: String,
        /// JSON payload object
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show recently stored events
    Tail {
        /// Maximum events to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Processor => cmd_processor().await,
        Command::Analyzer => cmd_analyzer().await,
        Command::Events { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            match action {
                EventsAction::Submit {
                    source,
                    event_type,
                    severity,
                    payload,
                } => cmd_events_submit(&db, &config, source, event_type, severity, payload).await,
                EventsAction::Tail { limit } => cmd_events_tail(&db, limit).await,
            }
        }
    }
}

async fn cmd_processor() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "argus-processor".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(
        Db::connect_with_retry(
            config.database_url.expose_secret(),
            DB_CONNECT_ATTEMPTS,
            DB_CONNECT_DELAY,
        )
        .await?,
    );
    db.migrate().await?;

    let processor = Processor::new(
        Arc::clone(&db),
        ProcessorConfig {
            events_queue: config.events_queue.clone(),
            dlq_queue: config.dlq_queue.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            visibility_timeout_secs: config.visibility_timeout_secs,
            bucket_width: config.bucket_width(),
            ..ProcessorConfig::default()
        },
    );
    let ready = processor.readiness();

    let probes = tokio::spawn(serve_probes(config.http_port, Arc::clone(&ready)));

    let runner = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run().await })
    };

    info!(port = config.http_port, "starting processor service");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    ready.store(false, Ordering::SeqCst);
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    processor.shutdown();
    runner.await??;
    probes.abort();

    info!("shutdown complete");
    Ok(())
}

async fn serve_probes(port: u16, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, http::probe_router(ready)).await?;
    Ok(())
}

async fn cmd_analyzer() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "argus-analyzer".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Arc::new(
        Db::connect_with_retry(
            config.database_url.expose_secret(),
            DB_CONNECT_ATTEMPTS,
            DB_CONNECT_DELAY,
        )
        .await?,
    );

    let cache = Arc::new(Cache::new());
    let prompts = Arc::new(PromptLibrary::load()?);

    let gateway = match &config.gemini_api_key {
        Some(key) => {
            let client = GeminiClient::new(key)?;
            info!("gemini client initialized");
            Some(Arc::new(LlmGateway::new(Arc::new(client))))
        }
        None => {
            warn!("GEMINI_API_KEY not set, analysis will return a stub response");
            None
        }
    };

    let ready = Arc::new(AtomicBool::new(true));
    let analyzer = Analyzer::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        gateway.clone(),
        Arc::clone(&prompts),
        config.max_events,
    );
    let triage = Arc::new(TriageOrchestrator::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        gateway,
        Arc::clone(&prompts),
        config.bucket_width(),
    ));

    let state = Arc::new(AppState {
        db,
        analyzer,
        triage,
        ready: Arc::clone(&ready),
        max_events: config.max_events,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "starting analyzer service");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal(ready))
        .await?;

    info!("shutdown complete");
    Ok(())
}

/// Flip readiness first so load balancers stop routing here, wait out the
/// drain window, then let the server close.
async fn shutdown_signal(ready: Arc<AtomicBool>) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    ready.store(false, Ordering::SeqCst);
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
}

async fn cmd_events_submit(
    db: &Db,
    config: &Config,
    source: String,
    event_type: String,
    severity: String,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw)?,
        None => serde_json::Map::new(),
    };

    let event = NewEvent {
        source,
        severity,
        kind: event_type,
        payload,
    }
    .into_event()?;

    db.create_queue(&config.events_queue).await?;
    let message = serde_json::to_value(&event)?;
    let msg_id = tokio::time::timeout(
        PUBLISH_TIMEOUT,
        db.send_to_queue(&config.events_queue, &message),
    )
    .await
    .map_err(|_| anyhow::anyhow!("publish timed out"))??;

    println!(
        "Published: {} (severity: {}, msg_id: {})",
        event.id, event.severity, msg_id
    );
    Ok(())
}

async fn cmd_events_tail(db: &Db, limit: i64) -> anyhow::Result<()> {
    let events = db.fetch_events(None, limit).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!(
        "{:<34}  {:<20}  {:<8}  {:<14}  TYPE",
        "ID", "TIMESTAMP", "SEV", "SOURCE"
    );
    println!("{}", "-".repeat(100));
    for event in &events {
        println!(
            "{:<34}  {:<20}  {:<8}  {:<14}  {}",
            event.id,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.severity,
            event.source,
            event.kind
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}
