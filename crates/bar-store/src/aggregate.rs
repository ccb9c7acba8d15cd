use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use drummond_core::{Bar, BarSeries, DrummondError, Interval};

/// Fold a lower-interval series into `target` buckets computed in the
/// exchange timezone: open = first open, high = max, low = min, close =
/// last close, volume = sum, timestamp = bucket start. The trailing bucket
/// is withheld until the source bars span it completely.
pub fn aggregate(lower: &BarSeries, target: Interval, tz: Tz) -> Result<BarSeries, DrummondError> {
    let source = lower.interval();
    if target.minutes() <= source.minutes() {
        return Err(DrummondError::InvalidInput(format!(
            "cannot aggregate {} into {}",
            source, target
        )));
    }
    if target.minutes() % source.minutes() != 0 {
        return Err(DrummondError::InvalidInput(format!(
            "{} does not divide evenly into {}",
            source, target
        )));
    }

    let mut out: Vec<Bar> = Vec::new();
    let mut current: Option<(DateTime<Utc>, Vec<&Bar>)> = None;

    for bar in lower.bars() {
        let bucket = target.bucket_start(bar.timestamp, tz);
        match &mut current {
            Some((start, members)) if *start == bucket => members.push(bar),
            _ => {
                if let Some((start, members)) = current.take() {
                    out.push(fold_bucket(start, &members));
                }
                current = Some((bucket, vec![bar]));
            }
        }
    }

    // Trailing bucket: only emit once the source bars reach the bucket end.
    if let Some((start, members)) = current {
        let covered_to = members
            .last()
            .map(|b| b.timestamp + source.duration())
            .unwrap_or(start);
        if covered_to >= start + target.duration() {
            out.push(fold_bucket(start, &members));
        } else {
            tracing::debug!(
                symbol = lower.symbol(),
                bucket = %start,
                "withholding partial {} bucket",
                target
            );
        }
    }

    BarSeries::from_bars(lower.symbol(), target, out)
}

fn fold_bucket(start: DateTime<Utc>, members: &[&Bar]) -> Bar {
    let open = members[0].open;
    let close = members[members.len() - 1].close;
    let high = members
        .iter()
        .map(|b| b.high)
        .fold(Decimal::MIN, |a, b| a.max(b));
    let low = members
        .iter()
        .map(|b| b.low)
        .fold(Decimal::MAX, |a, b| a.min(b));
    let volume = members.iter().map(|b| b.volume).sum();
    Bar {
        timestamp: start,
        open,
        high,
        low,
        close,
        volume,
    }
}
