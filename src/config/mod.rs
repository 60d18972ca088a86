//! Configuration loading from environment variables, organized by
//! domain: Trading, Risk, and Paper.

mod paper_env_config;
mod risk_env_config;
mod trading_env_config;

pub use paper_env_config::PaperEnvConfig;
pub use risk_env_config::RiskEnvConfig;
pub use trading_env_config::TradingEnvConfig;

use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::executor::ExecutorConfig;
use crate::application::position_engine::PositionEngineConfig;
use crate::application::reconciler::ReconcilerConfig;
use crate::application::risk_gate::RiskLimits;
use crate::application::scheduler::SchedulerConfig;
use crate::application::stop_loss::SupervisorConfig;
use crate::application::trading_engine::TradingEngineConfig;
use crate::domain::trading::money::chf_to_usd;
use crate::infrastructure::paper::backend::PaperConfig;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match env::var(key) {
        Ok(raw) => {
            Decimal::from_str(&raw).with_context(|| format!("Invalid decimal for {key}: {raw}"))
        }
        Err(_) => Ok(default),
    }
}

/// Aggregated application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub trading: TradingEnvConfig,
    pub risk: RiskEnvConfig,
    pub paper: PaperEnvConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            trading: TradingEnvConfig::from_env().context("Failed to load trading config")?,
            risk: RiskEnvConfig::from_env().context("Failed to load risk config")?,
            paper: PaperEnvConfig::from_env().context("Failed to load paper config")?,
        })
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.trading.cycle_interval_seconds),
            align_to_interval: self.trading.align_to_interval,
            max_retries: self.trading.max_retries,
            retry_delay: Duration::from_secs(self.trading.retry_delay_seconds),
            graceful_stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn to_engine_config(&self) -> PositionEngineConfig {
        PositionEngineConfig {
            capital_chf: self.trading.starting_capital_chf,
            chf_to_usd_rate: self.trading.chf_to_usd_rate,
            max_position_size_pct: self.risk.max_position_size_pct,
            max_total_exposure_pct: self.risk.max_total_exposure_pct,
            min_leverage: self.risk.min_leverage,
            max_leverage: self.risk.max_leverage,
            per_symbol_leverage: self.risk.per_symbol_leverage.clone(),
            daily_loss_limit_chf: self.risk.circuit_breaker_loss_chf,
            max_retries: self.trading.max_retries,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn to_risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_positions: self.risk.max_positions,
            min_confidence: self.risk.min_confidence,
            max_position_size_pct: self.risk.max_position_size_pct,
            max_total_exposure_pct: self.risk.max_total_exposure_pct,
            min_leverage: self.risk.min_leverage,
            max_leverage: self.risk.max_leverage,
            per_symbol_leverage: self.risk.per_symbol_leverage.clone(),
            min_stop_loss_pct: self.risk.min_stop_loss_pct,
            max_stop_loss_pct: self.risk.max_stop_loss_pct,
            capital_chf: self.trading.starting_capital_chf,
        }
    }

    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            starting_balance_chf: self.trading.starting_capital_chf,
            daily_loss_limit_chf: self.risk.circuit_breaker_loss_chf,
            reset_time_utc: self.risk.reset_time_utc,
        }
    }

    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.trading.max_retries,
            retry_delay: Duration::from_secs(1),
            rate_limit_buffer: Duration::from_millis(self.trading.rate_limit_buffer_ms),
            balance_cache_ttl: Duration::from_secs(self.trading.balance_cache_ttl_seconds),
            chf_to_usd_rate: self.trading.chf_to_usd_rate,
            default_leverage: self.risk.min_leverage,
            enable_api_breaker: true,
            api_breaker_failure_threshold: 5,
            api_breaker_recovery_timeout: Duration::from_secs(60),
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            layer2_interval: Duration::from_secs(self.risk.layer2_interval_seconds),
            layer3_interval: Duration::from_secs(self.risk.layer3_interval_seconds),
            emergency_threshold: self.risk.emergency_threshold_pct,
        }
    }

    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            periodic_interval: Duration::from_secs(self.risk.reconciliation_interval_seconds),
            discrepancy_threshold: self.risk.discrepancy_threshold,
        }
    }

    pub fn to_trading_engine_config(&self) -> TradingEngineConfig {
        TradingEngineConfig {
            symbols: self.trading.symbols.clone(),
            capital_chf: self.trading.starting_capital_chf,
            chf_to_usd_rate: self.trading.chf_to_usd_rate,
        }
    }

    /// Paper balances are held in USDT; the configured CHF balance is
    /// converted once at startup.
    pub fn to_paper_config(&self) -> PaperConfig {
        PaperConfig {
            initial_balance: chf_to_usd(
                self.paper.initial_balance_chf,
                self.trading.chf_to_usd_rate,
            ),
            taker_fee_pct: self.paper.taker_fee_pct,
            slippage_enabled: self.paper.slippage_enabled,
            partial_fills_enabled: self.paper.partial_fills_enabled,
            latency_ms: (50, 150),
        }
    }
}
