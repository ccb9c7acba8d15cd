//! Signal fan-out: a sink trait over console/chat/webhook deliveries with
//! per-sink confidence thresholds, token-bucket rate limits (drop-oldest on
//! overflow) and bounded retry on transient failures.

pub mod retry;
pub mod sinks;

pub use retry::retry_with_backoff;
pub use sinks::{ChatSink, ConsoleSink, WebhookSink};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use drummond_core::{DrummondError, Signal};

/// Cycle metadata attached to every delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMeta {
    pub cycle_id: String,
    pub timestamp: DateTime<Utc>,
    pub symbols_processed: u32,
}

/// One delivery channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Signals below this confidence are filtered before queuing.
    fn min_confidence(&self) -> f64 {
        0.0
    }

    async fn deliver(&self, signal: &Signal, meta: &CycleMeta) -> Result<(), DrummondError>;
}

/// Token-bucket limit: sustained rate plus burst headroom.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    /// Chat default: 1 message/sec, burst 5.
    pub fn chat_default() -> Self {
        Self {
            per_second: 1.0,
            burst: 5,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            tokens: limit.burst as f64,
            capacity: limit.burst as f64,
            refill_per_sec: limit.per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_to_next(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64((1.0 - self.tokens).max(0.0) / self.refill_per_sec)
    }
}

/// Per-sink outcome of one fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct SinkDelivery {
    pub sink: String,
    pub sent: usize,
    pub filtered: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Router summary returned to the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutSummary {
    pub deliveries: Vec<SinkDelivery>,
}

impl FanoutSummary {
    pub fn total_sent(&self) -> usize {
        self.deliveries.iter().map(|d| d.sent).sum()
    }

    pub fn total_dropped(&self) -> usize {
        self.deliveries.iter().map(|d| d.dropped).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.deliveries.iter().map(|d| d.failed).sum()
    }
}

struct RoutedSink {
    sink: Box<dyn NotificationSink>,
    bucket: Option<Mutex<TokenBucket>>,
    queue_capacity: usize,
}

const DEFAULT_QUEUE_CAPACITY: usize = 32;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Fans signals out to every configured sink.
#[derive(Default)]
pub struct NotificationRouter {
    sinks: Vec<RoutedSink>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn NotificationSink>, rate: Option<RateLimit>) -> Self {
        self.sinks.push(RoutedSink {
            sink,
            bucket: rate.map(|r| Mutex::new(TokenBucket::new(r))),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        });
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        if let Some(last) = self.sinks.last_mut() {
            last.queue_capacity = capacity.max(1);
        }
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver `signals` to every sink: threshold filter, then drop-oldest
    /// down to the queue capacity, then rate-limited sends with bounded
    /// retry on transient errors.
    pub async fn fan_out(&self, signals: &[Signal], meta: &CycleMeta) -> FanoutSummary {
        let mut deliveries = Vec::with_capacity(self.sinks.len());
        for routed in &self.sinks {
            deliveries.push(self.fan_out_one(routed, signals, meta).await);
        }
        FanoutSummary { deliveries }
    }

    async fn fan_out_one(
        &self,
        routed: &RoutedSink,
        signals: &[Signal],
        meta: &CycleMeta,
    ) -> SinkDelivery {
        let threshold = routed.sink.min_confidence();
        let eligible: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.confidence >= threshold)
            .collect();
        let filtered = signals.len() - eligible.len();

        // Overflow drops the oldest entries first.
        let dropped = eligible.len().saturating_sub(routed.queue_capacity);
        let queued = &eligible[dropped..];
        if dropped > 0 {
            tracing::warn!(
                sink = routed.sink.name(),
                dropped,
                "notification queue overflow, dropping oldest"
            );
        }

        let mut sent = 0;
        let mut failed = 0;
        for signal in queued {
            if let Some(bucket) = &routed.bucket {
                loop {
                    let wait = {
                        let mut bucket = bucket.lock().await;
                        if bucket.try_take() {
                            None
                        } else {
                            Some(bucket.time_to_next())
                        }
                    };
                    match wait {
                        None => break,
                        Some(delay) => tokio::time::sleep(delay).await,
                    }
                }
            }
            let outcome = retry_with_backoff(RETRY_ATTEMPTS, RETRY_BASE_DELAY, |_| {
                routed.sink.deliver(signal, meta)
            })
            .await;
            match outcome {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        sink = routed.sink.name(),
                        symbol = %signal.symbol,
                        error = %e,
                        "notification delivery failed"
                    );
                }
            }
        }

        SinkDelivery {
            sink: routed.sink.name().to_string(),
            sent,
            filtered,
            dropped,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use drummond_core::{Interval, MarketState, SignalType, TrendDirection};
    use rust_decimal_macros::dec;

    struct RecordingSink {
        threshold: f64,
        delivered: Arc<AtomicUsize>,
        fail_first: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn min_confidence(&self) -> f64 {
            self.threshold
        }

        async fn deliver(&self, _signal: &Signal, _meta: &CycleMeta) -> Result<(), DrummondError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(DrummondError::Unavailable("429".to_string()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn signal(symbol: &str, confidence: f64) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            timeframe: Interval::Min30,
            timestamp: Utc::now(),
            signal_type: SignalType::Long,
            entry: dec!(100),
            stop: dec!(98),
            target: dec!(104),
            confidence,
            signal_strength: confidence,
            rr_ratio: 2.0,
            htf_trend: TrendDirection::Up,
            trading_state: MarketState::Trend,
            patterns: vec![],
            zones_count: 0,
            metadata: serde_json::Value::Null,
        }
    }

    fn meta() -> CycleMeta {
        CycleMeta {
            cycle_id: "cycle-1".to_string(),
            timestamp: Utc::now(),
            symbols_processed: 2,
        }
    }

    #[tokio::test]
    async fn threshold_filters_low_confidence() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = NotificationRouter::new().with_sink(
            Box::new(RecordingSink {
                threshold: 0.5,
                delivered: Arc::clone(&delivered),
                fail_first: Arc::new(AtomicUsize::new(0)),
            }),
            None,
        );

        let summary = router
            .fan_out(&[signal("AAPL", 0.8), signal("MSFT", 0.3)], &meta())
            .await;
        assert_eq!(summary.total_sent(), 1);
        assert_eq!(summary.deliveries[0].filtered, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = NotificationRouter::new()
            .with_sink(
                Box::new(RecordingSink {
                    threshold: 0.0,
                    delivered: Arc::clone(&delivered),
                    fail_first: Arc::new(AtomicUsize::new(0)),
                }),
                None,
            )
            .with_queue_capacity(2);

        let signals: Vec<Signal> = (0..5).map(|i| signal(&format!("S{i}"), 0.9)).collect();
        let summary = router.fan_out(&signals, &meta()).await;
        assert_eq!(summary.deliveries[0].dropped, 3);
        assert_eq!(summary.total_sent(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = NotificationRouter::new().with_sink(
            Box::new(RecordingSink {
                threshold: 0.0,
                delivered: Arc::clone(&delivered),
                fail_first: Arc::new(AtomicUsize::new(2)),
            }),
            None,
        );

        let summary = router.fan_out(&[signal("AAPL", 0.9)], &meta()).await;
        assert_eq!(summary.total_sent(), 1);
        assert_eq!(summary.total_failed(), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn burst_allows_immediate_sends() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let router = NotificationRouter::new().with_sink(
            Box::new(RecordingSink {
                threshold: 0.0,
                delivered: Arc::clone(&delivered),
                fail_first: Arc::new(AtomicUsize::new(0)),
            }),
            Some(RateLimit {
                per_second: 1000.0,
                burst: 5,
            }),
        );

        let signals: Vec<Signal> = (0..5).map(|i| signal(&format!("S{i}"), 0.9)).collect();
        let summary = router.fan_out(&signals, &meta()).await;
        assert_eq!(summary.total_sent(), 5);
    }
}
