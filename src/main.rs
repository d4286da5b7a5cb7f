use intrapnl::api::{self, AppState, PersistenceClient};
use intrapnl::bus::{
    InProcessBus, CALCULATION_GROUP, MARKET_TOPIC, TRADES_TOPIC, TRADE_MEMORY_GROUP,
    TRADE_PERSISTENCE_GROUP,
};
use intrapnl::config::Config;
use intrapnl::db::init_db;
use intrapnl::memory::TradeMemory;
use intrapnl::pipeline::{
    CalculationService, MemoryFeed, PersistenceService, StoreTradeHistory, TradeHistory,
    TradeRouter,
};
use intrapnl::retry::{retry_with_backoff, RetryPolicy};
use intrapnl::Repository;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Store connection with startup retries; fatal after the last attempt.
    let database_path = config.database_path.clone();
    let pool = match retry_with_backoff(RetryPolicy::default(), "connect store", || {
        init_db(&database_path)
    })
    .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    let repo = Repository::new(pool);

    let bus = InProcessBus::new(config.bus_partitions);
    let cancel = CancellationToken::new();

    // C1: trade memory buffer and its feed.
    let memory = Arc::new(Mutex::new(TradeMemory::new(
        config.memory_retention_ms,
        config.queried_range_retention_ms,
    )));
    let memory_feed = Arc::new(MemoryFeed::new(
        Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_MEMORY_GROUP).await),
        memory.clone(),
    ));

    // C2: trade persistence pipeline.
    let persistence = Arc::new(PersistenceService::new(
        Arc::new(bus.subscribe(TRADES_TOPIC, TRADE_PERSISTENCE_GROUP).await),
        repo.clone(),
        Duration::from_millis(config.batch_interval_ms),
    ));

    // C3: range-query router. With no remote persistence service the
    // fallback reads the store directly.
    let wait_timeout = Duration::from_millis(config.wait_timeout_ms);
    let history: Arc<dyn TradeHistory> = match &config.persistence_service_url {
        Some(url) => Arc::new(PersistenceClient::new(url.clone(), wait_timeout)),
        None => Arc::new(StoreTradeHistory::new(repo.clone())),
    };
    let router = Arc::new(TradeRouter::new(memory.clone(), history, wait_timeout));

    // C4: calculation pipeline, fetching trades through the router.
    let calculation = Arc::new(CalculationService::new(
        Arc::new(bus.subscribe(MARKET_TOPIC, CALCULATION_GROUP).await),
        repo.clone(),
        router.clone(),
        config.trading_fee_per_mwh,
        config.market_buffer_size,
    ));

    let feed_handle = {
        let feed = memory_feed.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { feed.run(cancel).await })
    };
    let persistence_handle = {
        let persistence = persistence.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { persistence.run(cancel).await })
    };
    let calculation_handle = {
        let calculation = calculation.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { calculation.run(cancel).await })
    };

    // RPC server: trades RPC routed through C3, PnL summary, health.
    let app = api::create_router(AppState {
        trades: router.clone(),
        repo: repo.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.rpc_port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = serve_result {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }

    // Drain: consumers stop polling, C2 runs its final flush, store closes.
    cancel.cancel();
    let _ = feed_handle.await;
    let _ = persistence_handle.await;
    let _ = calculation_handle.await;
    repo.close().await;

    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}
