use super::{env_decimal, env_parse, env_string};
use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

/// Risk limits, circuit breaker, stop-loss layers, and reconciliation.
#[derive(Debug, Clone)]
pub struct RiskEnvConfig {
    pub max_positions: usize,
    pub max_position_size_pct: Decimal,
    pub max_total_exposure_pct: Decimal,
    pub min_confidence: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
    pub per_symbol_leverage: HashMap<String, u32>,
    pub min_stop_loss_pct: Decimal,
    pub max_stop_loss_pct: Decimal,
    pub circuit_breaker_loss_chf: Decimal,
    pub reset_time_utc: NaiveTime,
    pub layer2_interval_seconds: u64,
    pub layer3_interval_seconds: u64,
    pub emergency_threshold_pct: Decimal,
    pub reconciliation_interval_seconds: u64,
    pub discrepancy_threshold: Decimal,
}

impl RiskEnvConfig {
    pub fn from_env() -> Result<Self> {
        let reset_raw = env_string("RESET_TIME_UTC", "00:00");
        let reset_time_utc = NaiveTime::parse_from_str(&reset_raw, "%H:%M")
            .with_context(|| format!("Invalid RESET_TIME_UTC: {reset_raw}"))?;

        let leverage_raw = env_string(
            "PER_SYMBOL_LEVERAGE",
            "BTC/USDT:USDT=40,ETH/USDT:USDT=40,SOL/USDT:USDT=25,BNB/USDT:USDT=25,ADA/USDT:USDT=20,DOGE/USDT:USDT=20",
        );
        let per_symbol_leverage = parse_leverage_map(&leverage_raw)?;

        Ok(Self {
            max_positions: env_parse("MAX_POSITIONS", 6usize)?,
            max_position_size_pct: env_decimal("MAX_POSITION_SIZE_PCT", dec!(0.20))?,
            max_total_exposure_pct: env_decimal("MAX_TOTAL_EXPOSURE_PCT", dec!(0.80))?,
            min_confidence: env_decimal("MIN_CONFIDENCE", dec!(0.60))?,
            min_leverage: env_parse("MIN_LEVERAGE", 5u32)?,
            max_leverage: env_parse("MAX_LEVERAGE", 40u32)?,
            per_symbol_leverage,
            min_stop_loss_pct: env_decimal("MIN_STOP_LOSS_PCT", dec!(0.01))?,
            max_stop_loss_pct: env_decimal("MAX_STOP_LOSS_PCT", dec!(0.10))?,
            circuit_breaker_loss_chf: env_decimal("CIRCUIT_BREAKER_LOSS_CHF", dec!(-183.89))?,
            reset_time_utc,
            layer2_interval_seconds: env_parse("LAYER2_INTERVAL_SECONDS", 2u64)?,
            layer3_interval_seconds: env_parse("LAYER3_INTERVAL_SECONDS", 1u64)?,
            emergency_threshold_pct: env_decimal("EMERGENCY_THRESHOLD_PCT", dec!(0.15))?,
            reconciliation_interval_seconds: env_parse("RECONCILIATION_INTERVAL_SECONDS", 300u64)?,
            discrepancy_threshold: env_decimal("DISCREPANCY_THRESHOLD", dec!(0.00001))?,
        })
    }
}

/// Parses "SYMBOL=LEV,SYMBOL=LEV" pairs.
pub(super) fn parse_leverage_map(raw: &str) -> Result<HashMap<String, u32>> {
    let mut map = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (symbol, leverage) = pair
            .split_once('=')
            .with_context(|| format!("Invalid PER_SYMBOL_LEVERAGE entry: {pair}"))?;
        let leverage: u32 = leverage
            .trim()
            .parse()
            .with_context(|| format!("Invalid leverage in entry: {pair}"))?;
        map.insert(symbol.trim().to_string(), leverage);
    }
    Ok(map)
}
