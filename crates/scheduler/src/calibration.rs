use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use bar_store::BarStore;
use drummond_core::{
    Bar, DrummondError, PersistencePort, Signal, SignalOutcome, SignalType,
};

/// Resolve a settled signal against the bars that followed it: target first
/// is a WIN, stop first a LOSS (the stop wins inside a single bar), neither
/// within the window is NEUTRAL, and too few bars leaves it PENDING.
pub fn evaluate_signal(signal: &Signal, bars: &[Bar], window_bars: usize) -> (SignalOutcome, Option<f64>) {
    if !signal.signal_type.is_entry() {
        return (SignalOutcome::Neutral, None);
    }
    let start = bars.partition_point(|b| b.timestamp <= signal.timestamp);
    let following = &bars[start..];
    if following.is_empty() {
        return (SignalOutcome::Pending, None);
    }

    let long = signal.signal_type == SignalType::Long;
    let window = &following[..following.len().min(window_bars)];
    for bar in window {
        let stopped = if long {
            bar.low <= signal.stop
        } else {
            bar.high >= signal.stop
        };
        if stopped {
            return (SignalOutcome::Loss, pnl_pct(signal, signal.stop));
        }
        let hit_target = if long {
            bar.high >= signal.target
        } else {
            bar.low <= signal.target
        };
        if hit_target {
            return (SignalOutcome::Win, pnl_pct(signal, signal.target));
        }
    }

    if following.len() < window_bars {
        return (SignalOutcome::Pending, None);
    }
    let last_close = window[window.len() - 1].close;
    (SignalOutcome::Neutral, pnl_pct(signal, last_close))
}

fn pnl_pct(signal: &Signal, exit: rust_decimal::Decimal) -> Option<f64> {
    if signal.entry.is_zero() {
        return None;
    }
    let direction = if signal.signal_type == SignalType::Long {
        1.0
    } else {
        -1.0
    };
    ((exit - signal.entry) / signal.entry)
        .to_f64()
        .map(|r| r * direction * 100.0)
}

/// One calibration bucket: a confidence band or a signal type.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationBucket {
    pub label: String,
    pub count: usize,
    pub wins: usize,
    pub losses: usize,
    pub neutral: usize,
    pub win_rate: f64,
    pub avg_confidence: f64,
    pub avg_pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub evaluated: usize,
    pub by_confidence: Vec<CalibrationBucket>,
    pub by_type: Vec<CalibrationBucket>,
}

/// Settles pending signal outcomes once their evaluation window has
/// elapsed and reports realized accuracy by confidence band and type.
pub struct OutcomeEvaluator {
    persistence: Arc<dyn PersistencePort>,
    window_bars: usize,
}

impl OutcomeEvaluator {
    pub fn new(persistence: Arc<dyn PersistencePort>, window_bars: usize) -> Self {
        Self {
            persistence,
            window_bars,
        }
    }

    /// Evaluate every pending signal against the bars now in the store.
    /// Returns how many outcomes settled.
    pub async fn evaluate_pending(
        &self,
        store: &BarStore,
        now: DateTime<Utc>,
    ) -> Result<usize, DrummondError> {
        let pending = self.persistence.pending_signals(now).await?;
        let mut settled = 0usize;
        for record in pending {
            let Some(id) = record.id else {
                continue;
            };
            let signal = &record.signal;
            let Some(series) = store.full_series(&signal.symbol, signal.timeframe) else {
                continue;
            };
            let (outcome, pnl) = evaluate_signal(signal, series.bars(), self.window_bars);
            if outcome == SignalOutcome::Pending {
                continue;
            }
            self.persistence
                .update_signal_outcome(id, outcome, pnl, now)
                .await?;
            settled += 1;
        }
        if settled > 0 {
            tracing::info!(settled, "signal outcomes settled");
        }
        Ok(settled)
    }

    /// Realized performance of signals evaluated at or after `since`.
    pub async fn report(&self, since: DateTime<Utc>) -> Result<CalibrationReport, DrummondError> {
        let evaluated = self.persistence.evaluated_signals(since).await?;

        let mut by_confidence: BTreeMap<String, Vec<&drummond_core::SignalRecord>> =
            BTreeMap::new();
        let mut by_type: BTreeMap<String, Vec<&drummond_core::SignalRecord>> = BTreeMap::new();
        for record in &evaluated {
            by_confidence
                .entry(confidence_band(record.signal.confidence))
                .or_default()
                .push(record);
            by_type
                .entry(record.signal.signal_type.name().to_string())
                .or_default()
                .push(record);
        }

        Ok(CalibrationReport {
            evaluated: evaluated.len(),
            by_confidence: by_confidence
                .into_iter()
                .map(|(label, records)| bucket(label, &records))
                .collect(),
            by_type: by_type
                .into_iter()
                .map(|(label, records)| bucket(label, &records))
                .collect(),
        })
    }
}

fn confidence_band(confidence: f64) -> String {
    let floor = (confidence * 10.0).floor() / 10.0;
    format!("{:.1}-{:.1}", floor, floor + 0.1)
}

fn bucket(label: String, records: &[&drummond_core::SignalRecord]) -> CalibrationBucket {
    let wins = records
        .iter()
        .filter(|r| r.outcome == SignalOutcome::Win)
        .count();
    let losses = records
        .iter()
        .filter(|r| r.outcome == SignalOutcome::Loss)
        .count();
    let neutral = records
        .iter()
        .filter(|r| r.outcome == SignalOutcome::Neutral)
        .count();
    let decided = wins + losses;
    let avg_confidence =
        records.iter().map(|r| r.signal.confidence).sum::<f64>() / records.len().max(1) as f64;
    let avg_pnl_pct = {
        let with_pnl: Vec<f64> = records.iter().filter_map(|r| r.actual_pnl_pct).collect();
        if with_pnl.is_empty() {
            0.0
        } else {
            with_pnl.iter().sum::<f64>() / with_pnl.len() as f64
        }
    };
    CalibrationBucket {
        label,
        count: records.len(),
        wins,
        losses,
        neutral,
        win_rate: if decided > 0 {
            wins as f64 / decided as f64
        } else {
            0.0
        },
        avg_confidence,
        avg_pnl_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use drummond_core::{Interval, MarketState, SignalRecord, TrendDirection};
    use persistence::MemoryPersistence;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap() + Duration::minutes(30 * i)
    }

    fn long_signal(confidence: f64) -> Signal {
        Signal {
            symbol: "AAPL".to_string(),
            timeframe: Interval::Min30,
            timestamp: ts(0),
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

    fn bar(i: i64, high: Decimal, low: Decimal) -> Bar {
        Bar {
            timestamp: ts(i),
            open: (high + low) / dec!(2),
            high,
            low,
            close: (high + low) / dec!(2),
            volume: 100,
        }
    }

    #[test]
    fn target_first_is_a_win() {
        let bars = vec![
            bar(0, dec!(101), dec!(99)),
            bar(1, dec!(102), dec!(100)),
            bar(2, dec!(104.5), dec!(101)),
        ];
        let (outcome, pnl) = evaluate_signal(&long_signal(0.7), &bars, 10);
        assert_eq!(outcome, SignalOutcome::Win);
        assert!((pnl.unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn stop_wins_within_a_single_bar() {
        // One bar spans both levels: conservative resolution is a loss.
        let bars = vec![bar(0, dec!(101), dec!(99)), bar(1, dec!(105), dec!(97))];
        let (outcome, pnl) = evaluate_signal(&long_signal(0.7), &bars, 10);
        assert_eq!(outcome, SignalOutcome::Loss);
        assert!((pnl.unwrap() + 2.0).abs() < 1e-9);
    }

    #[test]
    fn neither_level_within_window_is_neutral() {
        let bars: Vec<Bar> = (0..6).map(|i| bar(i, dec!(101), dec!(99))).collect();
        let (outcome, _) = evaluate_signal(&long_signal(0.7), &bars, 5);
        assert_eq!(outcome, SignalOutcome::Neutral);
    }

    #[test]
    fn short_window_stays_pending() {
        let bars = vec![bar(0, dec!(101), dec!(99)), bar(1, dec!(101), dec!(99))];
        let (outcome, _) = evaluate_signal(&long_signal(0.7), &bars, 10);
        assert_eq!(outcome, SignalOutcome::Pending);
    }

    #[test]
    fn bars_at_or_before_emission_are_ignored() {
        // The signal bar itself spans the target; only later bars count.
        let bars = vec![bar(0, dec!(105), dec!(99)), bar(1, dec!(101), dec!(99.5))];
        let (outcome, _) = evaluate_signal(&long_signal(0.7), &bars, 1);
        assert_eq!(outcome, SignalOutcome::Neutral);
    }

    #[tokio::test]
    async fn pending_signals_settle_and_report_by_bucket() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = BarStore::new();

        // Signal emitted at ts(0); afterwards price runs to the target.
        let winner = long_signal(0.72);
        persistence
            .insert_signal(&SignalRecord::new(winner))
            .await
            .unwrap();
        let mut loser = long_signal(0.55);
        loser.symbol = "MSFT".to_string();
        persistence
            .insert_signal(&SignalRecord::new(loser))
            .await
            .unwrap();

        let winner_bars: Vec<Bar> = (0..6).map(|i| bar(i, dec!(104.5), dec!(100))).collect();
        let loser_bars: Vec<Bar> = (0..6).map(|i| bar(i, dec!(101), dec!(97.5))).collect();
        store.append_bars("AAPL", Interval::Min30, winner_bars);
        store.append_bars("MSFT", Interval::Min30, loser_bars);

        let evaluator = OutcomeEvaluator::new(Arc::clone(&persistence) as Arc<dyn PersistencePort>, 5);
        let settled = evaluator.evaluate_pending(&store, ts(10)).await.unwrap();
        assert_eq!(settled, 2);

        let report = evaluator.report(ts(0)).await.unwrap();
        assert_eq!(report.evaluated, 2);
        let high_band = report
            .by_confidence
            .iter()
            .find(|b| b.label == "0.7-0.8")
            .unwrap();
        assert_eq!(high_band.wins, 1);
        let low_band = report
            .by_confidence
            .iter()
            .find(|b| b.label == "0.5-0.6")
            .unwrap();
        assert_eq!(low_band.losses, 1);
        let longs = report.by_type.iter().find(|b| b.label == "LONG").unwrap();
        assert_eq!(longs.count, 2);
        assert!((longs.win_rate - 0.5).abs() < 1e-9);
    }
}
