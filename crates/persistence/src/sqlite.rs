use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use drummond_core::{
    Bar, CycleRun, CycleStatus, DrummondError, Interval, LatencyBreakdown, MetricPoint,
    PersistencePort, Signal, SignalOutcome, SignalRecord,
};

/// SQLite adapter for the persistence port. Bars are upserted by
/// (symbol, interval, timestamp); signals and cycle runs are insert-only
/// events, with the signal body carried as a JSON column.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage_err(e: sqlx::Error) -> DrummondError {
    DrummondError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> DrummondError {
    DrummondError::Storage(format!("json: {e}"))
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, DrummondError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_tables(&self) -> Result<(), DrummondError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                signal_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                signal_json TEXT NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'PENDING',
                actual_pnl_pct REAL,
                evaluation_timestamp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_runs (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL,
                symbols_processed INTEGER NOT NULL,
                symbols_updated INTEGER NOT NULL,
                signals_generated INTEGER NOT NULL,
                bars_stored INTEGER NOT NULL,
                latency_json TEXT NOT NULL,
                errors_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                name TEXT NOT NULL,
                value REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DrummondError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DrummondError::Storage(format!("timestamp {raw:?}: {e}")))
}

fn signal_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SignalRecord, DrummondError> {
    let signal_json: String = row.get("signal_json");
    let signal: Signal = serde_json::from_str(&signal_json).map_err(json_err)?;
    let outcome_raw: String = row.get("outcome");
    let outcome = SignalOutcome::parse(&outcome_raw)
        .ok_or_else(|| DrummondError::Storage(format!("unknown outcome {outcome_raw:?}")))?;
    let evaluation_timestamp: Option<String> = row.get("evaluation_timestamp");
    Ok(SignalRecord {
        id: Some(row.get::<i64, _>("id")),
        signal,
        outcome,
        actual_pnl_pct: row.get("actual_pnl_pct"),
        evaluation_timestamp: evaluation_timestamp
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
    })
}

#[async_trait]
impl PersistencePort for SqliteStore {
    async fn upsert_bars(
        &self,
        symbol: &str,
        interval: Interval,
        bars: &[Bar],
    ) -> Result<u64, DrummondError> {
        let mut written = 0u64;
        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO bars (symbol, interval, timestamp, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, interval, timestamp) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )
            .bind(symbol)
            .bind(interval.name())
            .bind(bar.timestamp.to_rfc3339())
            .bind(bar.open.to_f64().unwrap_or(0.0))
            .bind(bar.high.to_f64().unwrap_or(0.0))
            .bind(bar.low.to_f64().unwrap_or(0.0))
            .bind(bar.close.to_f64().unwrap_or(0.0))
            .bind(bar.volume as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
            written += 1;
        }
        Ok(written)
    }

    async fn insert_signal(&self, record: &SignalRecord) -> Result<i64, DrummondError> {
        let signal_json = serde_json::to_string(&record.signal).map_err(json_err)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO signals (symbol, timestamp, signal_type, confidence, signal_json, outcome)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.signal.symbol)
        .bind(record.signal.timestamp.to_rfc3339())
        .bind(record.signal.signal_type.name())
        .bind(record.signal.confidence)
        .bind(&signal_json)
        .bind(record.outcome.name())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(id)
    }

    async fn update_signal_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_pnl_pct: Option<f64>,
        evaluated_at: DateTime<Utc>,
    ) -> Result<(), DrummondError> {
        let updated = sqlx::query(
            "UPDATE signals SET outcome = ?, actual_pnl_pct = ?, evaluation_timestamp = ? WHERE id = ?",
        )
        .bind(outcome.name())
        .bind(actual_pnl_pct)
        .bind(evaluated_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if updated.rows_affected() == 0 {
            return Err(DrummondError::NotFound(format!("signal {id}")));
        }
        Ok(())
    }

    async fn pending_signals(
        &self,
        emitted_before: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError> {
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE outcome = 'PENDING' AND timestamp <= ? ORDER BY id",
        )
        .bind(emitted_before.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(signal_record_from_row).collect()
    }

    async fn evaluated_signals(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>, DrummondError> {
        let rows = sqlx::query(
            "SELECT * FROM signals WHERE outcome != 'PENDING' AND evaluation_timestamp >= ? ORDER BY id",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(signal_record_from_row).collect()
    }

    async fn insert_cycle_run(&self, run: &CycleRun) -> Result<(), DrummondError> {
        let latency_json = serde_json::to_string(&run.latency).map_err(json_err)?;
        let errors_json = serde_json::to_string(&run.errors).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO cycle_runs (
                id, timestamp, status, symbols_processed, symbols_updated,
                signals_generated, bars_stored, latency_json, errors_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.timestamp.to_rfc3339())
        .bind(run.status.name())
        .bind(run.symbols_processed as i64)
        .bind(run.symbols_updated as i64)
        .bind(run.signals_generated as i64)
        .bind(run.bars_stored as i64)
        .bind(&latency_json)
        .bind(&errors_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn recent_cycle_runs(&self, limit: u32) -> Result<Vec<CycleRun>, DrummondError> {
        let rows = sqlx::query("SELECT * FROM cycle_runs ORDER BY timestamp DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                let status_raw: String = row.get("status");
                let status = CycleStatus::parse(&status_raw).ok_or_else(|| {
                    DrummondError::Storage(format!("unknown status {status_raw:?}"))
                })?;
                let timestamp: String = row.get("timestamp");
                let latency_json: String = row.get("latency_json");
                let errors_json: String = row.get("errors_json");
                let latency: LatencyBreakdown =
                    serde_json::from_str(&latency_json).map_err(json_err)?;
                let errors: Vec<String> =
                    serde_json::from_str(&errors_json).map_err(json_err)?;
                Ok(CycleRun {
                    id: row.get("id"),
                    timestamp: parse_timestamp(&timestamp)?,
                    status,
                    symbols_processed: row.get::<i64, _>("symbols_processed") as u32,
                    symbols_updated: row.get::<i64, _>("symbols_updated") as u32,
                    signals_generated: row.get::<i64, _>("signals_generated") as u32,
                    bars_stored: row.get::<i64, _>("bars_stored") as u64,
                    latency,
                    errors,
                })
            })
            .collect()
    }

    async fn insert_metric(&self, point: &MetricPoint) -> Result<(), DrummondError> {
        sqlx::query("INSERT INTO metrics (timestamp, name, value) VALUES (?, ?, ?)")
            .bind(point.timestamp.to_rfc3339())
            .bind(&point.name)
            .bind(point.value)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
