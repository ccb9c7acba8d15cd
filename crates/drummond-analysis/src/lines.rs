use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use drummond_core::{BarSeries, DrummondLine, DrummondZone, Interval, LineConfig, ZoneKind};

use crate::pldot::quantize;

/// Lines below this strength are discarded before zone aggregation.
const MIN_LINE_STRENGTH: f64 = 0.05;

/// Project support/resistance lines forward from recent swing extremes.
///
/// A bar whose high dominates the `swing_lookback` bars on each side emits a
/// resistance line at its high; mirror for support at swing lows. Lines run
/// `projection_gap` bars forward at strength 1.0 and decay with the
/// configured half-life after that.
pub fn detect_lines(series: &BarSeries, config: &LineConfig) -> Vec<DrummondLine> {
    let bars = series.bars();
    let k = config.swing_lookback;
    if bars.len() < 2 * k + 1 {
        return Vec::new();
    }
    let interval = series.interval().duration();
    let last_idx = bars.len() - 1;

    let mut lines = Vec::new();
    for i in k..bars.len() - k {
        let neighborhood = &bars[i - k..=i + k];
        let is_swing_high = neighborhood
            .iter()
            .enumerate()
            .all(|(j, b)| j == k || b.high < bars[i].high);
        let is_swing_low = neighborhood
            .iter()
            .enumerate()
            .all(|(j, b)| j == k || b.low > bars[i].low);

        for (hit, price, kind) in [
            (is_swing_high, bars[i].high, ZoneKind::Resistance),
            (is_swing_low, bars[i].low, ZoneKind::Support),
        ] {
            if !hit {
                continue;
            }
            let projected_idx = i + config.projection_gap;
            let projected_timestamp = bars
                .get(projected_idx)
                .map(|b| b.timestamp)
                .unwrap_or_else(|| {
                    bars[last_idx].timestamp
                        + interval * (projected_idx - last_idx) as i32
                });
            let bars_past = last_idx.saturating_sub(projected_idx) as f64;
            let strength = 0.5f64.powf(bars_past / config.strength_half_life);
            if strength < MIN_LINE_STRENGTH {
                continue;
            }
            lines.push(DrummondLine {
                origin_timestamp: bars[i].timestamp,
                origin_price: price,
                projected_timestamp,
                projected_price: price,
                kind,
                strength,
            });
        }
    }
    lines
}

/// Merge overlapping lines of the same kind into disjoint zones.
///
/// Two lines merge when their projected prices sit within
/// `max(zone_tolerance_pct x price, envelope_width)`. The merged center is
/// the strength-weighted mean, the bounds span the contributors, and the
/// strength is the capped sum.
pub fn aggregate_zones(
    lines: &[DrummondLine],
    interval: Interval,
    envelope_width: Decimal,
    config: &LineConfig,
    scale: u32,
) -> Vec<DrummondZone> {
    let mut zones = Vec::new();
    for kind in [ZoneKind::Support, ZoneKind::Resistance] {
        let mut members: Vec<&DrummondLine> =
            lines.iter().filter(|l| l.kind == kind).collect();
        if members.is_empty() {
            continue;
        }
        members.sort_by(|a, b| a.projected_price.cmp(&b.projected_price));

        let mut group: Vec<&DrummondLine> = vec![members[0]];
        for line in members.into_iter().skip(1) {
            let anchor = group[group.len() - 1].projected_price;
            let tolerance =
                (line.projected_price * config.zone_tolerance_pct).max(envelope_width);
            if line.projected_price - anchor <= tolerance {
                group.push(line);
            } else {
                zones.push(fold_zone(&group, kind, interval, config, scale));
                group = vec![line];
            }
        }
        zones.push(fold_zone(&group, kind, interval, config, scale));
    }

    merge_overlaps(zones, config)
}

fn fold_zone(
    group: &[&DrummondLine],
    kind: ZoneKind,
    interval: Interval,
    config: &LineConfig,
    scale: u32,
) -> DrummondZone {
    let total_strength: f64 = group.iter().map(|l| l.strength).sum();
    let weighted: f64 = group
        .iter()
        .map(|l| price_f64(l.projected_price) * l.strength)
        .sum();
    let center = if total_strength > 0.0 {
        quantize(
            Decimal::from_f64(weighted / total_strength).unwrap_or(group[0].projected_price),
            scale,
        )
    } else {
        group[0].projected_price
    };
    let lower = group
        .iter()
        .map(|l| l.projected_price)
        .min()
        .unwrap_or(center);
    let upper = group
        .iter()
        .map(|l| l.projected_price)
        .max()
        .unwrap_or(center);
    DrummondZone {
        center_price: center,
        lower_price: lower,
        upper_price: upper,
        strength: total_strength.min(config.max_zone_strength),
        kind,
        contributing_timeframes: vec![interval],
    }
}

/// Zones of the same kind must be disjoint per timestamp; re-merge any
/// survivors whose intervals still touch.
fn merge_overlaps(mut zones: Vec<DrummondZone>, config: &LineConfig) -> Vec<DrummondZone> {
    zones.sort_by(|a, b| {
        (a.kind == ZoneKind::Resistance, a.lower_price)
            .cmp(&(b.kind == ZoneKind::Resistance, b.lower_price))
    });
    let mut out: Vec<DrummondZone> = Vec::with_capacity(zones.len());
    for zone in zones {
        match out.last_mut() {
            Some(prev) if prev.kind == zone.kind && zone.lower_price <= prev.upper_price => {
                let combined = prev.strength + zone.strength;
                let prev_weight = prev.strength / combined.max(f64::EPSILON);
                let center_f = price_f64(prev.center_price) * prev_weight
                    + price_f64(zone.center_price) * (1.0 - prev_weight);
                prev.center_price =
                    Decimal::from_f64(center_f).unwrap_or(prev.center_price);
                prev.upper_price = prev.upper_price.max(zone.upper_price);
                prev.strength = combined.min(config.max_zone_strength);
            }
            _ => out.push(zone),
        }
    }
    out
}

fn price_f64(price: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    price.to_f64().unwrap_or(0.0)
}
