use crate::application::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::application::position_engine::PositionEngine;
use crate::domain::trading::types::Signal;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Approved,
    Rejected,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSeverity {
    Info,
    Warning,
    Error,
}

/// One row of the check matrix.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    pub severity: CheckSeverity,
}

/// Outcome of validating one signal. Rejections are values: callers
/// inspect `approved` and `rejection_reasons`.
#[derive(Debug, Clone)]
pub struct RiskValidation {
    pub status: ValidationStatus,
    pub approved: bool,
    pub checks: Vec<RiskCheck>,
    pub rejection_reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub position_count: usize,
    pub total_exposure_pct: Decimal,
    pub daily_pnl_chf: Decimal,
    pub circuit_breaker_tripped: bool,
}

impl RiskValidation {
    fn add_rejection(&mut self, check: &'static str, message: String) {
        self.rejection_reasons.push(format!("{check}: {message}"));
        self.checks.push(RiskCheck {
            name: check,
            passed: false,
            message,
            severity: CheckSeverity::Error,
        });
        self.approved = false;
        self.status = ValidationStatus::Rejected;
    }

    fn add_pass(&mut self, check: &'static str, message: String) {
        self.checks.push(RiskCheck {
            name: check,
            passed: true,
            message,
            severity: CheckSeverity::Info,
        });
    }

    fn add_warning(&mut self, check: &'static str, message: String) {
        self.warnings.push(message.clone());
        self.checks.push(RiskCheck {
            name: check,
            passed: true,
            message,
            severity: CheckSeverity::Warning,
        });
        if self.status != ValidationStatus::Rejected {
            self.status = ValidationStatus::Warning;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_positions: usize,
    pub min_confidence: Decimal,
    pub max_position_size_pct: Decimal,
    pub max_total_exposure_pct: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
    pub per_symbol_leverage: HashMap<String, u32>,
    pub min_stop_loss_pct: Decimal,
    pub max_stop_loss_pct: Decimal,
    pub capital_chf: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        let per_symbol_leverage = HashMap::from([
            ("BTC/USDT:USDT".to_string(), 40),
            ("ETH/USDT:USDT".to_string(), 40),
            ("SOL/USDT:USDT".to_string(), 25),
            ("BNB/USDT:USDT".to_string(), 25),
            ("ADA/USDT:USDT".to_string(), 20),
            ("DOGE/USDT:USDT".to_string(), 20),
        ]);
        Self {
            max_positions: 6,
            min_confidence: dec!(0.60),
            max_position_size_pct: dec!(0.20),
            max_total_exposure_pct: dec!(0.80),
            min_leverage: 5,
            max_leverage: 40,
            per_symbol_leverage,
            min_stop_loss_pct: dec!(0.01),
            max_stop_loss_pct: dec!(0.10),
            capital_chf: dec!(2626.96),
        }
    }
}

/// Pre-trade validation of signals against the limit matrix.
///
/// The circuit breaker check runs first and short-circuits the rest; the
/// remaining checks are independent and all reported. A missing
/// stop-loss is a warning here, not a rejection (the executor refuses to
/// open without one).
pub struct RiskGate {
    limits: RiskLimits,
    engine: Arc<PositionEngine>,
    breaker: Arc<CircuitBreaker>,
}

impl RiskGate {
    pub fn new(limits: RiskLimits, engine: Arc<PositionEngine>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            limits,
            engine,
            breaker,
        }
    }

    pub async fn validate(&self, signal: &Signal) -> RiskValidation {
        let open_positions = self.engine.open_positions(None).await.unwrap_or_default();
        let position_count = open_positions.len();

        let exposure_pct = match self.engine.open_value_chf().await {
            Ok(value) if !self.limits.capital_chf.is_zero() => value / self.limits.capital_chf,
            _ => Decimal::ZERO,
        };

        let daily_pnl = self
            .engine
            .daily_pnl(chrono::Utc::now().date_naive())
            .await
            .map(|s| s.total_pnl_chf)
            .unwrap_or(Decimal::ZERO);

        // Read-only here: the trading engine pushes fresh P&L into the
        // breaker after closes; re-pushing stale realized losses from
        // this path would instantly re-trip a manually reset breaker.
        let breaker_status = self.breaker.status().await;
        let breaker_tripped = breaker_status.state != BreakerState::Active;

        let mut validation = RiskValidation {
            status: ValidationStatus::Approved,
            approved: true,
            checks: Vec::new(),
            rejection_reasons: Vec::new(),
            warnings: Vec::new(),
            position_count,
            total_exposure_pct: exposure_pct,
            daily_pnl_chf: daily_pnl,
            circuit_breaker_tripped: breaker_tripped,
        };

        // Circuit breaker first: a halted system short-circuits the rest.
        if breaker_tripped {
            validation.add_rejection(
                "Circuit Breaker",
                format!(
                    "Trading halted (state {}), daily P&L CHF {:.2}",
                    breaker_status.state, daily_pnl
                ),
            );
            self.log_outcome(signal, &validation);
            return validation;
        }
        validation.add_pass("Circuit Breaker", format!("Daily P&L CHF {daily_pnl:.2}"));

        self.check_position_count(&mut validation, position_count);
        self.check_confidence(&mut validation, signal);
        self.check_position_size(&mut validation, signal);
        self.check_total_exposure(&mut validation, signal, exposure_pct);
        self.check_leverage(&mut validation, signal);
        self.check_stop_loss(&mut validation, signal);

        self.log_outcome(signal, &validation);
        validation
    }

    fn log_outcome(&self, signal: &Signal, validation: &RiskValidation) {
        info!(
            "RiskGate: {} {:?} -> {:?} (checks: {}, rejections: {})",
            signal.symbol,
            signal.decision,
            validation.status,
            validation.checks.len(),
            validation.rejection_reasons.len()
        );
    }

    fn check_position_count(&self, validation: &mut RiskValidation, count: usize) {
        if count >= self.limits.max_positions {
            validation.add_rejection(
                "Position Count",
                format!(
                    "Maximum concurrent positions ({}) reached",
                    self.limits.max_positions
                ),
            );
        } else {
            validation.add_pass(
                "Position Count",
                format!("{} / {} positions", count, self.limits.max_positions),
            );
        }
    }

    fn check_confidence(&self, validation: &mut RiskValidation, signal: &Signal) {
        if signal.confidence < self.limits.min_confidence {
            validation.add_rejection(
                "Confidence",
                format!(
                    "Signal confidence {} below minimum {}",
                    signal.confidence, self.limits.min_confidence
                ),
            );
        } else {
            validation.add_pass(
                "Confidence",
                format!("{} (min: {})", signal.confidence, self.limits.min_confidence),
            );
        }
    }

    fn check_position_size(&self, validation: &mut RiskValidation, signal: &Signal) {
        if signal.size_pct > self.limits.max_position_size_pct {
            validation.add_rejection(
                "Position Size",
                format!(
                    "Position size {} exceeds maximum {}",
                    signal.size_pct, self.limits.max_position_size_pct
                ),
            );
        } else {
            validation.add_pass(
                "Position Size",
                format!(
                    "{} (max: {})",
                    signal.size_pct, self.limits.max_position_size_pct
                ),
            );
        }
    }

    fn check_total_exposure(
        &self,
        validation: &mut RiskValidation,
        signal: &Signal,
        current_exposure_pct: Decimal,
    ) {
        let new_exposure = current_exposure_pct + signal.size_pct;
        if new_exposure > self.limits.max_total_exposure_pct {
            validation.add_rejection(
                "Total Exposure",
                format!(
                    "Total exposure {} would exceed maximum {}",
                    new_exposure, self.limits.max_total_exposure_pct
                ),
            );
        } else {
            validation.add_pass(
                "Total Exposure",
                format!(
                    "{} (max: {})",
                    new_exposure, self.limits.max_total_exposure_pct
                ),
            );
        }
    }

    fn check_leverage(&self, validation: &mut RiskValidation, signal: &Signal) {
        let Some(leverage) = signal.leverage else {
            return;
        };
        let max_leverage = self
            .limits
            .per_symbol_leverage
            .get(&signal.symbol)
            .copied()
            .unwrap_or(self.limits.max_leverage);

        if leverage < self.limits.min_leverage || leverage > max_leverage {
            validation.add_rejection(
                "Leverage",
                format!(
                    "Leverage {}x outside allowed range {}-{}x for {}",
                    leverage, self.limits.min_leverage, max_leverage, signal.symbol
                ),
            );
        } else {
            validation.add_pass(
                "Leverage",
                format!(
                    "{}x (range: {}-{}x)",
                    leverage, self.limits.min_leverage, max_leverage
                ),
            );
        }
    }

    fn check_stop_loss(&self, validation: &mut RiskValidation, signal: &Signal) {
        let Some(stop_loss_pct) = signal.stop_loss_pct else {
            validation.add_warning("Stop-Loss", "No stop-loss specified".to_string());
            return;
        };
        if stop_loss_pct < self.limits.min_stop_loss_pct
            || stop_loss_pct > self.limits.max_stop_loss_pct
        {
            validation.add_rejection(
                "Stop-Loss",
                format!(
                    "Stop-loss {} outside allowed range {}-{}",
                    stop_loss_pct, self.limits.min_stop_loss_pct, self.limits.max_stop_loss_pct
                ),
            );
        } else {
            validation.add_pass(
                "Stop-Loss",
                format!(
                    "{} (range: {}-{})",
                    stop_loss_pct, self.limits.min_stop_loss_pct, self.limits.max_stop_loss_pct
                ),
            );
        }
    }
}
