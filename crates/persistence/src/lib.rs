//! Persistence adapters for the typed port: a SQLite store for production
//! use and an in-memory store for tests and offline runs.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryPersistence;
pub use sqlite::SqliteStore;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    use drummond_core::{
        Bar, CycleRun, CycleStatus, Interval, LatencyBreakdown, MarketState, MetricPoint,
        PersistencePort, Signal, SignalOutcome, SignalRecord, SignalType, TrendDirection,
    };

    fn signal(symbol: &str, minutes: i64) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            timeframe: Interval::Min30,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
                + Duration::minutes(minutes),
            signal_type: SignalType::Long,
            entry: dec!(100),
            stop: dec!(98),
            target: dec!(104),
            confidence: 0.7,
            signal_strength: 0.65,
            rr_ratio: 2.0,
            htf_trend: TrendDirection::Up,
            trading_state: MarketState::Trend,
            patterns: vec![],
            zones_count: 1,
            metadata: serde_json::Value::Null,
        }
    }

    fn cycle_run(id: &str, minutes: i64, status: CycleStatus) -> CycleRun {
        CycleRun {
            id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
                + Duration::minutes(minutes),
            status,
            symbols_processed: 5,
            symbols_updated: 4,
            signals_generated: 2,
            bars_stored: 40,
            latency: LatencyBreakdown {
                data_refresh_ms: 120,
                analysis_ms: 300,
                signal_ms: 20,
                notify_ms: 50,
                total_ms: 490,
            },
            errors: vec!["XYZ: unavailable".to_string()],
        }
    }

    #[tokio::test]
    async fn sqlite_signal_lifecycle_roundtrips() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();

        let id = store
            .insert_signal(&SignalRecord::new(signal("AAPL", 0)))
            .await
            .unwrap();
        store
            .insert_signal(&SignalRecord::new(signal("MSFT", 120)))
            .await
            .unwrap();

        // Only the older signal is due for evaluation.
        let due = store
            .pending_signals(signal("AAPL", 60).timestamp)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].signal.symbol, "AAPL");
        assert_eq!(due[0].signal.entry, dec!(100));

        let evaluated_at = signal("AAPL", 600).timestamp;
        store
            .update_signal_outcome(id, SignalOutcome::Win, Some(4.0), evaluated_at)
            .await
            .unwrap();

        let settled = store
            .evaluated_signals(evaluated_at - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].outcome, SignalOutcome::Win);
        assert_eq!(settled[0].actual_pnl_pct, Some(4.0));

        assert!(store.pending_signals(evaluated_at).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn sqlite_cycle_runs_return_newest_first() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store
            .insert_cycle_run(&cycle_run("cycle-1", 0, CycleStatus::Completed))
            .await
            .unwrap();
        store
            .insert_cycle_run(&cycle_run("cycle-2", 15, CycleStatus::Partial))
            .await
            .unwrap();

        let runs = store.recent_cycle_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "cycle-2");
        assert_eq!(runs[0].status, CycleStatus::Partial);
        assert_eq!(runs[0].latency.total_ms, 490);
        assert_eq!(runs[0].errors.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_bar_upsert_replaces_by_key() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let bar = Bar {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap(),
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: 1000,
        };
        assert_eq!(
            store
                .upsert_bars("AAPL", Interval::Min30, &[bar])
                .await
                .unwrap(),
            1
        );
        let revised = Bar {
            close: dec!(100.7),
            ..bar
        };
        store
            .upsert_bars("AAPL", Interval::Min30, &[revised])
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bars")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn sqlite_metrics_insert() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store
            .insert_metric(&MetricPoint {
                timestamp: Utc::now(),
                name: "cycle_latency_ms".to_string(),
                value: 512.0,
            })
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metrics")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn memory_adapter_mirrors_semantics() {
        let store = MemoryPersistence::new();
        let id = store
            .insert_signal(&SignalRecord::new(signal("AAPL", 0)))
            .await
            .unwrap();
        store
            .update_signal_outcome(id, SignalOutcome::Loss, Some(-2.0), Utc::now())
            .await
            .unwrap();
        assert!(store
            .pending_signals(Utc::now())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.evaluated_signals(Utc::now() - Duration::hours(1)).await.unwrap()[0].outcome,
            SignalOutcome::Loss
        );
    }
}
