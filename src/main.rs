use anyhow::{bail, Result};
use perpetuum::application::circuit_breaker::CircuitBreaker;
use perpetuum::application::executor::TradeExecutor;
use perpetuum::application::position_engine::PositionEngine;
use perpetuum::application::reconciler::Reconciler;
use perpetuum::application::risk_gate::RiskGate;
use perpetuum::application::scheduler::TradingScheduler;
use perpetuum::application::stop_loss::StopLossSupervisor;
use perpetuum::application::trading_engine::TradingEngine;
use perpetuum::config::Config;
use perpetuum::domain::ports::{AlertSink, ExchangeAdapter, MarketDataProvider, SignalSource};
use perpetuum::infrastructure::mock::{HoldSignalSource, SimulatedMarketData};
use perpetuum::infrastructure::observability::alerts::LogAlertSink;
use perpetuum::infrastructure::observability::metrics::PrometheusMetrics;
use perpetuum::infrastructure::paper::backend::PaperBackend;
use perpetuum::infrastructure::persistence::database::Database;
use perpetuum::infrastructure::persistence::repositories::{
    SqliteOrderStore, SqlitePositionStore, SqliteTradeHistory,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    info!(
        "Starting perpetuum (paper: {}, symbols: {:?}, cycle: {}s)",
        config.paper.paper_trading, config.trading.symbols, config.trading.cycle_interval_seconds
    );

    let database = Database::new(&config.trading.database_url).await?;
    let position_store = Arc::new(SqlitePositionStore::new(database.pool.clone()));
    let order_store = Arc::new(SqliteOrderStore::new(database.pool.clone()));
    let trade_history = Arc::new(SqliteTradeHistory::new(database.pool.clone()));

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);

    // Market data and the decision engine are external collaborators.
    // Without live wiring the binary runs a paper dry loop: simulated
    // ticks, hold-only signals.
    let market_data: Arc<dyn MarketDataProvider> =
        Arc::new(SimulatedMarketData::new(&config.trading.symbols));
    let signal_source: Arc<dyn SignalSource> = Arc::new(HoldSignalSource);

    let exchange: Arc<dyn ExchangeAdapter> = if config.paper.paper_trading {
        Arc::new(PaperBackend::new(
            market_data.clone(),
            config.to_paper_config(),
        ))
    } else {
        bail!("Live trading requires an exchange adapter; only paper mode ships in this build")
    };

    let positions = Arc::new(PositionEngine::new(
        position_store.clone(),
        config.to_engine_config(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        config.to_breaker_config(),
        alerts.clone(),
    ));
    let executor = Arc::new(TradeExecutor::new(
        exchange.clone(),
        positions.clone(),
        order_store,
        trade_history,
        metrics.clone(),
        config.to_executor_config(),
    ));
    breaker.set_closer(executor.clone()).await;

    let risk_gate = Arc::new(RiskGate::new(
        config.to_risk_limits(),
        positions.clone(),
        breaker.clone(),
    ));
    let supervisor = Arc::new(StopLossSupervisor::new(
        executor.clone(),
        positions.clone(),
        alerts.clone(),
        config.to_supervisor_config(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        exchange,
        positions.clone(),
        position_store,
        alerts,
        config.to_reconciler_config(),
    ));

    let engine = Arc::new(TradingEngine::new(
        config.to_trading_engine_config(),
        market_data,
        signal_source,
        risk_gate,
        executor,
        supervisor,
        reconciler.clone(),
        positions,
        breaker.clone(),
        metrics,
    ));

    let reset_task = breaker.clone().spawn_daily_reset();
    let reconcile_task = reconciler.clone().spawn_periodic();

    let scheduler = TradingScheduler::new(config.to_scheduler_config(), engine);
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.stop(true).await;
    reset_task.abort();
    reconcile_task.abort();

    info!("Shutdown complete");
    Ok(())
}
