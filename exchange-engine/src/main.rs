//! Meridian exchange engine binary
//!
//! Runs the singleton processing loop, optionally alongside the HTTP API,
//! until an OS termination signal arrives. A second signal forces
//! immediate termination.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::decimal::dec;
use dotenv::dotenv;
use matching_engine::{
    EngineConfig, InProcessWake, PgWakeChannel, ProcessingEngine, WakeChannel,
};
use order_store::{
    AdvisoryLocks, InMemoryLockRegistry, InMemoryOrderRepository, OrderLifecycle,
    OrderRepository, PostgresAdvisoryLocks, PostgresOrderRepository,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wallet_ledger::{
    InMemoryWalletRepository, LedgerConfig, LedgerService, PostgresWalletRepository,
};

/// Meridian exchange engine CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the processing loop
    Start {
        /// Steal a stuck engine lock (operator recovery after a crash)
        #[arg(long)]
        force: bool,

        /// Also serve the HTTP API
        #[arg(long)]
        api: bool,

        /// Run against in-memory stores with demo data (no database)
        #[arg(long)]
        demo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "meridian={level},exchange_engine={level},matching_engine={level},order_store={level},wallet_ledger={level},exchange_api={level}",
            level = cli.log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Start { force, api, demo } => start(force, api, demo).await,
    }
}

struct Services {
    repo: Arc<dyn OrderRepository>,
    locks: Arc<dyn AdvisoryLocks>,
    wake: Arc<dyn WakeChannel>,
    ledger: Arc<LedgerService>,
}

async fn start(force: bool, api: bool, demo: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting Meridian exchange engine...");

    let services = if demo {
        build_in_memory().await?
    } else {
        build_postgres().await?
    };

    let engine_config = EngineConfig::from_env()?;
    let engine = Arc::new(ProcessingEngine::new(
        services.repo.clone(),
        services.locks.clone(),
        services.wake.clone(),
        engine_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(force, shutdown_rx).await })
    };

    let api_handle = if api {
        let state = Arc::new(exchange_api::AppState {
            lifecycle: Arc::new(OrderLifecycle::new(services.repo.clone())),
            ledger: services.ledger.clone(),
            wake: services.wake.clone(),
        });
        let config = exchange_api::ApiConfig::from_env();
        let shutdown = shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let app = exchange_api::router(state);
            let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
            info!("Starting API server on {}", addr);

            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind API server: {}", e);
                    return;
                }
            };

            let mut shutdown = shutdown;
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // First signal: graceful shutdown. Second signal: force exit.
    shutdown_signal().await;
    info!("Shutdown signal received, stopping engine...");
    let _ = shutdown_tx.send(true);

    tokio::select! {
        result = engine_handle => {
            match result {
                Ok(Ok(())) => info!("Engine stopped cleanly"),
                Ok(Err(e)) => error!("Engine exited with error: {}", e),
                Err(e) => error!("Engine task panicked: {}", e),
            }
        }
        _ = shutdown_signal() => {
            warn!("Second shutdown signal, terminating immediately");
            std::process::exit(1);
        }
    }

    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    info!("Shutting down");
    Ok(())
}

async fn build_postgres() -> Result<Services, Box<dyn std::error::Error>> {
    let ledger_config = LedgerConfig::from_env();
    let pool = common::db::connect(&ledger_config.database_url, ledger_config.db_pool_size).await?;
    common::db::run_migrations(&pool).await?;
    info!("Database migrations applied");

    let wallets = Arc::new(PostgresWalletRepository::new(pool.clone()));
    let repo: Arc<dyn OrderRepository> = Arc::new(PostgresOrderRepository::new(pool.clone()));
    let locks: Arc<dyn AdvisoryLocks> =
        Arc::new(PostgresAdvisoryLocks::connect(&ledger_config.database_url).await?);

    let engine_config = EngineConfig::from_env()?;
    let wake: Arc<dyn WakeChannel> =
        Arc::new(PgWakeChannel::new(pool, engine_config.wake_channel.clone()));

    Ok(Services {
        repo,
        locks,
        wake,
        ledger: Arc::new(LedgerService::with_repository(wallets)),
    })
}

async fn build_in_memory() -> Result<Services, Box<dyn std::error::Error>> {
    info!("Running with in-memory stores and demo data");

    let wallets = Arc::new(InMemoryWalletRepository::new());
    let repo = Arc::new(InMemoryOrderRepository::new(wallets.clone()));
    let registry = InMemoryLockRegistry::new();
    let locks: Arc<dyn AdvisoryLocks> = Arc::new(registry.session());
    let wake: Arc<dyn WakeChannel> = Arc::new(InProcessWake::new());
    let ledger = Arc::new(LedgerService::with_repository(wallets));

    seed_demo_data(repo.clone(), &ledger).await?;

    Ok(Services {
        repo,
        locks,
        wake,
        ledger,
    })
}

/// Create demo reference data, two funded accounts, and a starting book
async fn seed_demo_data(
    repo: Arc<InMemoryOrderRepository>,
    ledger: &LedgerService,
) -> Result<(), Box<dyn std::error::Error>> {
    use common::model::order::Side;

    let btc = repo.create_currency("BTC", "Bitcoin").await?;
    let usd = repo.create_currency("USD", "US Dollar").await?;
    let pair = repo.create_pair(btc.id, usd.id).await?;

    let alice = uuid::Uuid::new_v4();
    let bob = uuid::Uuid::new_v4();
    info!("Demo accounts: alice = {}, bob = {}", alice, bob);

    ledger.deposit(alice, usd.id, dec!(100000)).await?;
    ledger.deposit(alice, btc.id, dec!(10)).await?;
    ledger.deposit(bob, usd.id, dec!(100000)).await?;
    ledger.deposit(bob, btc.id, dec!(10)).await?;

    let lifecycle = OrderLifecycle::new(repo);

    // Alice bids, Bob asks; the top of book does not cross yet
    lifecycle
        .submit(alice, pair.id, Side::Buy, dec!(1), dec!(20000))
        .await?;
    lifecycle
        .submit(alice, pair.id, Side::Buy, dec!(1), dec!(19500))
        .await?;
    lifecycle
        .submit(bob, pair.id, Side::Sell, dec!(1), dec!(21000))
        .await?;
    lifecycle
        .submit(bob, pair.id, Side::Sell, dec!(1), dec!(21500))
        .await?;

    info!("Demo data created on pair {}", pair.id);
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
