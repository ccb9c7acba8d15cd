use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use drummond_core::{DrummondError, Signal};

use crate::{CycleMeta, NotificationSink};

/// Render a signal as a human-readable chat line.
pub fn format_signal(signal: &Signal) -> String {
    format!(
        "**{}** {} @ {} (stop {}, target {}, rr {:.2}, confidence {:.0}%)\nstate {} / HTF {:?}",
        signal.signal_type.name(),
        signal.symbol,
        signal.entry,
        signal.stop,
        signal.target,
        signal.rr_ratio,
        signal.confidence * 100.0,
        signal.trading_state.name(),
        signal.htf_trend,
    )
}

/// Unfiltered console sink; emits through the log pipeline.
pub struct ConsoleSink;

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, signal: &Signal, meta: &CycleMeta) -> Result<(), DrummondError> {
        tracing::info!(
            cycle = %meta.cycle_id,
            symbol = %signal.symbol,
            signal_type = signal.signal_type.name(),
            entry = %signal.entry,
            stop = %signal.stop,
            target = %signal.target,
            confidence = signal.confidence,
            "signal"
        );
        Ok(())
    }
}

/// Webhook sink posting the structured signal as JSON.
pub struct WebhookSink {
    client: Client,
    url: String,
    threshold: f64,
}

impl WebhookSink {
    pub fn new(url: String, threshold: f64) -> Self {
        Self {
            client: Client::new(),
            url,
            threshold,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn min_confidence(&self) -> f64 {
        self.threshold
    }

    async fn deliver(&self, signal: &Signal, meta: &CycleMeta) -> Result<(), DrummondError> {
        let payload = json!({
            "cycle_id": meta.cycle_id,
            "generated_at": meta.timestamp,
            "signal": signal,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DrummondError::Unavailable(format!("webhook: {e}")))?;
        map_status(response.status())
    }
}

/// Chat sink posting a formatted message to a chat webhook.
pub struct ChatSink {
    client: Client,
    webhook_url: String,
    threshold: f64,
}

impl ChatSink {
    pub fn new(webhook_url: String, threshold: f64) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
            threshold,
        }
    }
}

#[async_trait]
impl NotificationSink for ChatSink {
    fn name(&self) -> &str {
        "chat"
    }

    fn min_confidence(&self) -> f64 {
        self.threshold
    }

    async fn deliver(&self, signal: &Signal, _meta: &CycleMeta) -> Result<(), DrummondError> {
        if self.webhook_url.is_empty() {
            tracing::debug!("chat webhook not configured, skipping notification");
            return Ok(());
        }
        let payload = json!({
            "content": format_signal(signal),
            "username": "Drummond Signals",
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DrummondError::Unavailable(format!("chat: {e}")))?;
        map_status(response.status())
    }
}

/// 429 and 5xx are transient; other failures are the payload's fault.
fn map_status(status: reqwest::StatusCode) -> Result<(), DrummondError> {
    if status.is_success() {
        Ok(())
    } else if status.as_u16() == 429 || status.is_server_error() {
        Err(DrummondError::Unavailable(format!("status {status}")))
    } else {
        Err(DrummondError::InvalidInput(format!("status {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use drummond_core::{Interval, MarketState, SignalType, TrendDirection};
    use rust_decimal_macros::dec;

    #[test]
    fn status_mapping_matches_retry_policy() {
        assert!(map_status(reqwest::StatusCode::OK).is_ok());
        assert!(map_status(reqwest::StatusCode::TOO_MANY_REQUESTS)
            .unwrap_err()
            .is_retriable());
        assert!(map_status(reqwest::StatusCode::BAD_GATEWAY)
            .unwrap_err()
            .is_retriable());
        assert!(!map_status(reqwest::StatusCode::BAD_REQUEST)
            .unwrap_err()
            .is_retriable());
    }

    #[test]
    fn formatted_message_names_the_levels() {
        let signal = Signal {
            symbol: "AAPL".to_string(),
            timeframe: Interval::Min30,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap(),
            signal_type: SignalType::Long,
            entry: dec!(99.6),
            stop: dec!(99.4),
            target: dec!(102.5),
            confidence: 0.72,
            signal_strength: 0.7,
            rr_ratio: 14.5,
            htf_trend: TrendDirection::Up,
            trading_state: MarketState::Trend,
            patterns: vec![],
            zones_count: 1,
            metadata: serde_json::Value::Null,
        };
        let text = format_signal(&signal);
        assert!(text.contains("LONG"));
        assert!(text.contains("AAPL"));
        assert!(text.contains("99.6"));
        assert!(text.contains("102.5"));
        assert!(text.contains("72%"));
    }
}
