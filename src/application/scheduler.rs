use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One cycle of the decision-and-execution pipeline.
#[async_trait]
pub trait TradingCycle: Send + Sync {
    async fn run_cycle(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Delay the first tick to the next wall-clock multiple of
    /// `interval` since UTC midnight.
    pub align_to_interval: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub graceful_stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(180),
            align_to_interval: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            graceful_stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the scheduler for status reporting.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub cycle_count: u64,
    pub error_count: u64,
    pub last_cycle: Option<DateTime<Utc>>,
    pub next_cycle: Option<DateTime<Utc>>,
    pub seconds_until_next: Option<f64>,
}

struct SchedulerShared {
    config: SchedulerConfig,
    cycle: Arc<dyn TradingCycle>,
    state: RwLock<SchedulerState>,
    cycle_count: AtomicU64,
    error_count: AtomicU64,
    last_cycle: RwLock<Option<DateTime<Utc>>>,
    next_cycle: RwLock<Option<DateTime<Utc>>>,
}

/// Fixed-cadence, interval-aligned cycle driver.
///
/// Exactly one cycle body runs at a time. A cycle that overruns its
/// interval triggers a "behind schedule" warning and the driver realigns
/// to the next interval boundary. Cycle failures count, transition the
/// driver to `Error`, and auto-recover after `retry_delay`.
pub struct TradingScheduler {
    shared: Arc<SchedulerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TradingScheduler {
    pub fn new(config: SchedulerConfig, cycle: Arc<dyn TradingCycle>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                cycle,
                state: RwLock::new(SchedulerState::Idle),
                cycle_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_cycle: RwLock::new(None),
                next_cycle: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        {
            let mut state = self.shared.state.write().await;
            if *state == SchedulerState::Running {
                warn!("Scheduler: Already running");
                return;
            }
            *state = SchedulerState::Running;
        }
        self.shared.cycle_count.store(0, Ordering::SeqCst);
        self.shared.error_count.store(0, Ordering::SeqCst);

        let first_cycle = if self.shared.config.align_to_interval {
            let next = next_aligned_time(Utc::now(), self.shared.config.interval);
            info!(
                "Scheduler: Aligning to interval boundary, first cycle at {}",
                next.format("%H:%M:%S")
            );
            next
        } else {
            Utc::now()
        };
        *self.shared.next_cycle.write().await = Some(first_cycle);

        info!(
            "Scheduler: Started (interval {:?}, align {})",
            self.shared.config.interval, self.shared.config.align_to_interval
        );

        let shared = Arc::clone(&self.shared);
        *self.task.lock().await = Some(tokio::spawn(shared.run_loop()));
    }

    /// Stops the scheduler. Graceful stop waits up to
    /// `graceful_stop_timeout` for the in-flight cycle, then cancels.
    pub async fn stop(&self, graceful: bool) {
        info!("Scheduler: Stopping (graceful: {graceful})");
        {
            let mut state = self.shared.state.write().await;
            if *state != SchedulerState::Running && *state != SchedulerState::Paused {
                warn!("Scheduler: Not running (state: {})", state);
                return;
            }
            *state = SchedulerState::Stopped;
        }

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if graceful {
                if tokio::time::timeout(self.shared.config.graceful_stop_timeout, &mut handle)
                    .await
                    .is_err()
                {
                    warn!("Scheduler: Graceful shutdown timeout, forcing stop");
                    handle.abort();
                }
            } else {
                handle.abort();
            }
        }

        info!(
            "Scheduler: Stopped (cycles: {}, errors: {})",
            self.shared.cycle_count.load(Ordering::SeqCst),
            self.shared.error_count.load(Ordering::SeqCst)
        );
    }

    pub async fn pause(&self) {
        let mut state = self.shared.state.write().await;
        if *state == SchedulerState::Running {
            info!("Scheduler: Paused");
            *state = SchedulerState::Paused;
        }
    }

    pub async fn resume(&self) {
        let mut state = self.shared.state.write().await;
        if *state == SchedulerState::Paused {
            info!("Scheduler: Resumed");
            *state = SchedulerState::Running;
            *self.shared.next_cycle.write().await = Some(
                Utc::now()
                    + ChronoDuration::from_std(self.shared.config.interval)
                        .unwrap_or(ChronoDuration::zero()),
            );
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = *self.shared.state.read().await;
        let next_cycle = *self.shared.next_cycle.read().await;
        let seconds_until_next = match (state, next_cycle) {
            (SchedulerState::Running, Some(next)) => Some(
                next.signed_duration_since(Utc::now())
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0,
            ),
            _ => None,
        };
        SchedulerStatus {
            state,
            cycle_count: self.shared.cycle_count.load(Ordering::SeqCst),
            error_count: self.shared.error_count.load(Ordering::SeqCst),
            last_cycle: *self.shared.last_cycle.read().await,
            next_cycle,
            seconds_until_next,
        }
    }
}

impl SchedulerShared {
    async fn run_loop(self: Arc<Self>) {
        info!("Scheduler: Loop started");

        if self.config.align_to_interval
            && let Some(next) = *self.next_cycle.read().await
        {
            sleep_until(next).await;
        }

        loop {
            match *self.state.read().await {
                SchedulerState::Running | SchedulerState::Error => {}
                SchedulerState::Paused => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                _ => break,
            }

            let cycle_start = Utc::now();
            let cycle_number = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
            info!("=== Trading Cycle #{cycle_number} START ===");

            match self.execute_cycle_with_retry(cycle_number).await {
                Ok(()) => {
                    *self.last_cycle.write().await = Some(cycle_start);
                }
                Err(e) => {
                    error!("Scheduler: Trading cycle #{cycle_number} failed: {e}");
                    self.error_count.fetch_add(1, Ordering::SeqCst);
                    // Recover on the next cycle
                    self.set_state_if_running(SchedulerState::Error).await;
                    tokio::time::sleep(self.config.retry_delay).await;
                    self.set_state_if(SchedulerState::Error, SchedulerState::Running)
                        .await;
                }
            }

            let duration = Utc::now().signed_duration_since(cycle_start);
            info!(
                "=== Trading Cycle #{cycle_number} END (duration: {:.2}s) ===",
                duration.num_milliseconds() as f64 / 1000.0
            );

            let interval =
                ChronoDuration::from_std(self.config.interval).unwrap_or(ChronoDuration::zero());
            let mut next = cycle_start + interval;
            let now = Utc::now();

            if next <= now {
                // Behind schedule: skip to the next interval boundary
                let behind = now.signed_duration_since(next).num_milliseconds() as f64 / 1000.0;
                warn!(
                    "Scheduler: Cycle #{cycle_number} took too long (behind by {:.1}s)",
                    behind
                );
                next = next_aligned_time(now, self.config.interval);
            }
            *self.next_cycle.write().await = Some(next);
            sleep_until(next).await;
        }

        info!("Scheduler: Loop stopped");
    }

    async fn execute_cycle_with_retry(&self, cycle_number: u64) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.cycle.run_cycle().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.max_retries => {
                    warn!(
                        "Scheduler: Cycle #{cycle_number} attempt {}/{} failed: {e}. Retrying in {:?}",
                        attempt + 1,
                        self.config.max_retries,
                        self.config.retry_delay
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn set_state_if_running(&self, to: SchedulerState) {
        let mut state = self.state.write().await;
        if *state == SchedulerState::Running {
            *state = to;
        }
    }

    async fn set_state_if(&self, from: SchedulerState, to: SchedulerState) {
        let mut state = self.state.write().await;
        if *state == from {
            *state = to;
        }
    }
}

async fn sleep_until(target: DateTime<Utc>) {
    let wait = target.signed_duration_since(Utc::now());
    if let Ok(wait) = wait.to_std() {
        tokio::time::sleep(wait).await;
    }
}

/// Next wall-clock multiple of `interval` since UTC midnight, strictly
/// after `now`. For a 180 s interval: 10:01:30 -> 10:03:00, and exactly
/// 10:03:00 -> 10:06:00.
pub fn next_aligned_time(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_secs = interval.as_secs().max(1) as i64;
    let midnight = now
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let since_midnight = now.signed_duration_since(midnight).num_seconds();
    let intervals_passed = since_midnight / interval_secs;
    midnight + ChronoDuration::seconds((intervals_passed + 1) * interval_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicBool;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_alignment_mid_interval() {
        let next = next_aligned_time(utc(10, 1, 30), Duration::from_secs(180));
        assert_eq!(next, utc(10, 3, 0));
    }

    #[test]
    fn test_alignment_just_before_boundary() {
        let next = next_aligned_time(utc(10, 2, 59), Duration::from_secs(180));
        assert_eq!(next, utc(10, 3, 0));
    }

    #[test]
    fn test_alignment_on_boundary_advances() {
        let next = next_aligned_time(utc(10, 3, 0), Duration::from_secs(180));
        assert_eq!(next, utc(10, 6, 0));
    }

    #[test]
    fn test_alignment_behind_schedule_boundary() {
        // A cycle ending at 10:09:20 realigns to 10:12:00
        let next = next_aligned_time(utc(10, 9, 20), Duration::from_secs(180));
        assert_eq!(next, utc(10, 12, 0));
    }

    struct CountingCycle {
        runs: AtomicU64,
        in_flight: AtomicBool,
        overlap_seen: AtomicBool,
    }

    impl CountingCycle {
        fn new() -> Self {
            Self {
                runs: AtomicU64::new(0),
                in_flight: AtomicBool::new(false),
                overlap_seen: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TradingCycle for CountingCycle {
        async fn run_cycle(&self) -> Result<()> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlap_seen.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cycles_run_sequentially() {
        let cycle = Arc::new(CountingCycle::new());
        let scheduler = TradingScheduler::new(
            SchedulerConfig {
                interval: Duration::from_millis(30),
                align_to_interval: false,
                retry_delay: Duration::from_millis(10),
                ..Default::default()
            },
            cycle.clone(),
        );

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop(false).await;

        let runs = cycle.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected at least 2 cycles, got {runs}");
        assert!(!cycle.overlap_seen.load(Ordering::SeqCst));
        assert_eq!(scheduler.status().await.state, SchedulerState::Stopped);
    }

    struct FailingCycle;

    #[async_trait]
    impl TradingCycle for FailingCycle {
        async fn run_cycle(&self) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_failures_counted_and_scheduling_continues() {
        let scheduler = TradingScheduler::new(
            SchedulerConfig {
                interval: Duration::from_millis(20),
                align_to_interval: false,
                max_retries: 1,
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(FailingCycle),
        );

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = scheduler.status().await;
        scheduler.stop(false).await;

        assert!(status.error_count >= 2, "errors: {}", status.error_count);
        assert!(status.cycle_count >= 2);
    }

    #[tokio::test]
    async fn test_pause_suspends_cycles() {
        let cycle = Arc::new(CountingCycle::new());
        let scheduler = TradingScheduler::new(
            SchedulerConfig {
                interval: Duration::from_millis(20),
                align_to_interval: false,
                ..Default::default()
            },
            cycle.clone(),
        );

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.pause().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused_at = cycle.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        // At most one in-flight cycle completes after pausing
        assert!(cycle.runs.load(Ordering::SeqCst) <= paused_at + 1);

        scheduler.resume().await;
        assert_eq!(scheduler.status().await.state, SchedulerState::Running);
        scheduler.stop(false).await;
    }
}
