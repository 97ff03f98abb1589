use std::sync::Arc;

use clap::Parser;
use chorus_core::{AgentRegistry, ChorusConfig, HttpToolExecutor, LlmRouter};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use chorus_server::auth::StaticTokenVerifier;
use chorus_server::delivery::ConnectionHub;
use chorus_server::http::{self, AppState};
use chorus_server::queue::PgQueue;
use chorus_server::store::PgStore;
use chorus_server::subsystems::consumer::{self, Consumer};
use chorus_server::subsystems::dispatch::Dispatcher;
use chorus_server::subsystems::reaper;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "chorus.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ChorusConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.health {
        let pool = match chorus_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        };
        match chorus_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL health check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Chorus DB health check passed");
        return Ok(());
    }

    let pool = match chorus_core::db::open(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(AgentRegistry::standard(
        &config.llm.default_model,
        &config.llm.classifier_model,
    ));
    let tools = Arc::new(HttpToolExecutor::new(&config.tools)?);
    let router = Arc::new(LlmRouter::new(&config.llm, tools)?);

    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(
        pool.clone(),
        config.queue.visibility_timeout_seconds,
        config.queue.max_receive_count,
    ));
    let hub = Arc::new(ConnectionHub::new());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        router,
        hub.clone(),
        registry.clone(),
        config.dispatch.clone(),
    ));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Queue consumer
    let worker = Arc::new(Consumer::new(
        queue.clone(),
        store.clone(),
        dispatcher,
        config.queue.clone(),
    ));
    let consumer_handle = tokio::spawn(consumer::run_consumer(worker, tx.subscribe()));

    // TTL reaper
    tokio::spawn(reaper::run_reaper_loop(
        store.clone(),
        config.reaper.clone(),
        tx.subscribe(),
    ));

    let state = Arc::new(AppState {
        store,
        queue,
        hub,
        registry,
        verifier: Arc::new(StaticTokenVerifier::from_config(&config.auth)),
        config,
    });
    http::start_http_server(state, tx.subscribe()).await?;

    // Let in-flight dispatches finish before exiting
    if let Err(e) = consumer_handle.await {
        tracing::warn!("Queue consumer task ended abnormally: {}", e);
    }

    Ok(())
}
