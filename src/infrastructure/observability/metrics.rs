//! Prometheus metrics for the trading core.
//!
//! All metrics use the `perpetuum_` prefix; `export` renders the
//! registry in text format for a push gateway or log scraper.

use crate::domain::ports::MetricsSink;
use prometheus::{
    core::{AtomicF64, GenericGauge},
    CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    orders_total: CounterVec,
    order_latency_seconds: Histogram,
    trades_total: CounterVec,
    fees_paid_total: GenericGauge<AtomicF64>,
    cycles_total: CounterVec,
    cycle_duration_seconds: Histogram,
    positions_open: GenericGauge<AtomicF64>,
    daily_pnl_chf: GenericGauge<AtomicF64>,
    circuit_breaker_status: GenericGauge<AtomicF64>,
}

impl PrometheusMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_total = CounterVec::new(
            Opts::new("perpetuum_orders_total", "Orders by side and outcome"),
            &["side", "outcome"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let order_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "perpetuum_order_latency_seconds",
                "Submit-to-ack latency per order",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(order_latency_seconds.clone()))?;

        let trades_total = CounterVec::new(
            Opts::new("perpetuum_trades_total", "Fills by trade kind"),
            &["kind"],
        )?;
        registry.register(Box::new(trades_total.clone()))?;

        let fees_paid_total = Gauge::with_opts(Opts::new(
            "perpetuum_fees_paid_total",
            "Cumulative trading fees in USDT",
        ))?;
        registry.register(Box::new(fees_paid_total.clone()))?;

        let cycles_total = CounterVec::new(
            Opts::new("perpetuum_cycles_total", "Trading cycles executed"),
            &["outcome"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "perpetuum_cycle_duration_seconds",
                "Trading cycle wall time",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;

        let positions_open = Gauge::with_opts(Opts::new(
            "perpetuum_positions_open",
            "Number of open positions",
        ))?;
        registry.register(Box::new(positions_open.clone()))?;

        let daily_pnl_chf =
            Gauge::with_opts(Opts::new("perpetuum_daily_pnl_chf", "Daily P&L in CHF"))?;
        registry.register(Box::new(daily_pnl_chf.clone()))?;

        let circuit_breaker_status = Gauge::with_opts(Opts::new(
            "perpetuum_circuit_breaker_status",
            "Circuit breaker status (0=active, 1=tripped)",
        ))?;
        registry.register(Box::new(circuit_breaker_status.clone()))?;

        Ok(Self {
            registry,
            orders_total,
            order_latency_seconds,
            trades_total,
            fees_paid_total,
            cycles_total,
            cycle_duration_seconds,
            positions_open,
            daily_pnl_chf,
            circuit_breaker_status,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_order(&self, _symbol: &str, side: &str, success: bool, latency_ms: Decimal) {
        let outcome = if success { "ok" } else { "failed" };
        self.orders_total.with_label_values(&[side, outcome]).inc();
        self.order_latency_seconds
            .observe(latency_ms.to_f64().unwrap_or(0.0) / 1000.0);
    }

    fn record_trade(&self, kind: &str, fees: Decimal, _realized_pnl: Option<Decimal>) {
        self.trades_total.with_label_values(&[kind]).inc();
        self.fees_paid_total.add(fees.to_f64().unwrap_or(0.0));
    }

    fn record_cycle(&self, duration: Duration, _signals: usize, executed: usize) {
        let outcome = if executed > 0 { "executed" } else { "idle" };
        self.cycles_total.with_label_values(&[outcome]).inc();
        self.cycle_duration_seconds.observe(duration.as_secs_f64());
    }

    fn set_open_positions(&self, count: u64) {
        self.positions_open.set(count as f64);
    }

    fn set_daily_pnl_chf(&self, pnl: Decimal) {
        self.daily_pnl_chf.set(pnl.to_f64().unwrap_or(0.0));
    }

    fn set_circuit_breaker_tripped(&self, tripped: bool) {
        self.circuit_breaker_status
            .set(if tripped { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_export_contains_registered_metrics() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_order("BTC/USDT:USDT", "BUY", true, dec!(12.5));
        metrics.record_trade("entry_long", dec!(0.5), None);
        metrics.set_open_positions(3);
        metrics.set_circuit_breaker_tripped(true);

        let exported = metrics.export();
        assert!(exported.contains("perpetuum_orders_total"));
        assert!(exported.contains("perpetuum_positions_open 3"));
        assert!(exported.contains("perpetuum_circuit_breaker_status 1"));
    }
}
