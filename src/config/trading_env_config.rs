use super::{env_decimal, env_parse, env_string};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Cycle cadence, capital, and symbol universe.
#[derive(Debug, Clone)]
pub struct TradingEnvConfig {
    pub cycle_interval_seconds: u64,
    pub align_to_interval: bool,
    pub starting_capital_chf: Decimal,
    pub chf_to_usd_rate: Decimal,
    pub symbols: Vec<String>,
    pub database_url: String,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub rate_limit_buffer_ms: u64,
    pub balance_cache_ttl_seconds: u64,
}

impl TradingEnvConfig {
    pub fn from_env() -> Result<Self> {
        let symbols = env_string(
            "SYMBOLS",
            "BTC/USDT:USDT,ETH/USDT:USDT,SOL/USDT:USDT,BNB/USDT:USDT,ADA/USDT:USDT,DOGE/USDT:USDT",
        )
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

        Ok(Self {
            cycle_interval_seconds: env_parse("TRADING_CYCLE_INTERVAL_SECONDS", 180u64)?,
            align_to_interval: env_parse("ALIGN_TO_INTERVAL", true)?,
            starting_capital_chf: env_decimal("STARTING_CAPITAL_CHF", dec!(2626.96))?,
            chf_to_usd_rate: env_decimal("CHF_TO_USD_RATE", dec!(1.10))?,
            symbols,
            database_url: env_string("DATABASE_URL", "sqlite://data/perpetuum.db"),
            max_retries: env_parse("MAX_RETRIES", 3u32)?,
            retry_delay_seconds: env_parse("RETRY_DELAY_SECONDS", 5u64)?,
            rate_limit_buffer_ms: env_parse("RATE_LIMIT_BUFFER_MS", 100u64)?,
            balance_cache_ttl_seconds: env_parse("BALANCE_CACHE_TTL_SECONDS", 60u64)?,
        })
    }
}
