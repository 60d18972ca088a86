use crate::domain::ports::{AlertLevel, AlertSink};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Alert sink that routes alerts into the structured log stream. The
/// production deployment points a log shipper at these; wiring a chat
/// or pager sink means implementing `AlertSink` next to this one.
#[derive(Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => info!("ALERT: {message}"),
            AlertLevel::Warning => warn!("ALERT: {message}"),
            AlertLevel::Critical => error!("ALERT [CRITICAL]: {message}"),
        }
    }
}
