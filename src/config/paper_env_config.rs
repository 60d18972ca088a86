use super::{env_decimal, env_parse};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Paper-trading simulator settings.
#[derive(Debug, Clone)]
pub struct PaperEnvConfig {
    pub paper_trading: bool,
    pub initial_balance_chf: Decimal,
    pub taker_fee_pct: Decimal,
    pub slippage_enabled: bool,
    pub partial_fills_enabled: bool,
}

impl PaperEnvConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            paper_trading: env_parse("PAPER_TRADING", true)?,
            initial_balance_chf: env_decimal("PAPER_INITIAL_BALANCE_CHF", dec!(10000))?,
            taker_fee_pct: env_decimal("PAPER_TAKER_FEE_PCT", dec!(0.001))?,
            slippage_enabled: env_parse("PAPER_SLIPPAGE_ENABLED", true)?,
            partial_fills_enabled: env_parse("PAPER_PARTIAL_FILLS_ENABLED", true)?,
        })
    }
}
