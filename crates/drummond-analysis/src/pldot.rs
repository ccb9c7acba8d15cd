use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use drummond_core::{BarSeries, EnvelopeBand, EnvelopeConfig, PLdotPoint, PldotConfig};

/// Quantize to the configured price scale with banker's rounding.
pub fn quantize(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointNearestEven)
}

/// Three-bar smoothed point-of-control for every bar index >= 2.
///
/// value(i) = mean(mean(close), mean(high), mean(low)) over bars i-2..=i.
/// Windows whose bars sit further apart than the configured maximum gap are
/// omitted; the slope restarts after an omission.
pub fn compute_pldot(series: &BarSeries, config: &PldotConfig, scale: u32) -> Vec<PLdotPoint> {
    let bars = series.bars();
    if bars.len() < 3 {
        return Vec::new();
    }
    let max_gap = series.interval().duration() * config.max_gap_intervals as i32;
    let three = Decimal::from(3);

    let mut points = Vec::with_capacity(bars.len() - 2);
    let mut prev_value: Option<Decimal> = None;

    for i in 2..bars.len() {
        let window = &bars[i - 2..=i];
        let gapped = window
            .windows(2)
            .any(|pair| pair[1].timestamp - pair[0].timestamp > max_gap);
        if gapped {
            prev_value = None;
            continue;
        }

        let avg_close = (window[0].close + window[1].close + window[2].close) / three;
        let avg_high = (window[0].high + window[1].high + window[2].high) / three;
        let avg_low = (window[0].low + window[1].low + window[2].low) / three;
        let value = quantize((avg_close + avg_high + avg_low) / three, scale);

        let slope = match prev_value {
            Some(prev) => value - prev,
            None => Decimal::ZERO,
        };
        let projected_timestamp = bars
            .get(i + config.displacement as usize)
            .map(|b| b.timestamp);

        points.push(PLdotPoint {
            timestamp: window[2].timestamp,
            value,
            projected_timestamp,
            projected_value: value,
            slope,
            displacement: config.displacement,
        });
        prev_value = Some(value);
    }
    points
}

/// Envelope bands centered on each PLdot. Width is the configured multiple
/// of the population standard deviation of the trailing `period` PLdot
/// values, re-quantized to the price scale.
pub fn compute_envelopes(
    pldots: &[PLdotPoint],
    config: &EnvelopeConfig,
    scale: u32,
) -> Vec<EnvelopeBand> {
    let mut bands = Vec::with_capacity(pldots.len());
    for (i, point) in pldots.iter().enumerate() {
        let start = (i + 1).saturating_sub(config.period);
        let window: Vec<f64> = pldots[start..=i]
            .iter()
            .filter_map(|p| p.value.to_f64())
            .collect();
        let width_f = config.multiplier * population_stddev(&window);
        let half = quantize(
            Decimal::from_f64(width_f / 2.0).unwrap_or(Decimal::ZERO),
            scale,
        );
        bands.push(EnvelopeBand {
            timestamp: point.timestamp,
            center: point.value,
            upper: point.value + half,
            lower: point.value - half,
            width: half * Decimal::from(2),
        });
    }
    bands
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use drummond_core::{Bar, Interval};
    use rust_decimal_macros::dec;

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap() + Duration::minutes(30 * i)
    }

    fn uptrend_series() -> BarSeries {
        // E1: closes 100..=105, high = close + 1, low = close - 1.
        let bars: Vec<Bar> = (0..6)
            .map(|i| {
                let close = dec!(100) + Decimal::from(i);
                Bar {
                    timestamp: ts(i as i64),
                    open: close,
                    high: close + dec!(1),
                    low: close - dec!(1),
                    close,
                    volume: 100,
                }
            })
            .collect();
        BarSeries::from_bars("AAPL", Interval::Min30, bars).unwrap()
    }

    #[test]
    fn monotone_uptrend_values_and_slope() {
        let series = uptrend_series();
        let points = compute_pldot(&series, &PldotConfig::default(), 4);
        assert_eq!(points.len(), 4);
        let values: Vec<Decimal> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![dec!(101), dec!(102), dec!(103), dec!(104)]);
        assert_eq!(points[0].slope, Decimal::ZERO);
        assert!(points[1..].iter().all(|p| p.slope == dec!(1)));
    }

    #[test]
    fn displacement_projects_one_bar_forward() {
        let series = uptrend_series();
        let points = compute_pldot(&series, &PldotConfig::default(), 4);
        assert_eq!(points[0].projected_timestamp, Some(ts(3)));
        assert_eq!(points[0].projected_value, points[0].value);
        // Last dot has no next bar yet.
        assert_eq!(points[3].projected_timestamp, None);
    }

    #[test]
    fn exactly_three_bars_produce_one_point() {
        let series = uptrend_series();
        let three = BarSeries::from_bars("AAPL", Interval::Min30, series.bars()[..3].to_vec())
            .unwrap();
        let points = compute_pldot(&three, &PldotConfig::default(), 4);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, dec!(101));
    }

    #[test]
    fn banker_rounding_at_scale() {
        // Flat bars pinned exactly on the scale-4 midpoint: half-even
        // rounding sends 1.00015 up to the even digit and 1.00025 down.
        for (close, expected) in [(dec!(1.00015), dec!(1.0002)), (dec!(1.00025), dec!(1.0002))] {
            let bars: Vec<Bar> = (0..3)
                .map(|i| Bar {
                    timestamp: ts(i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1,
                })
                .collect();
            let series = BarSeries::from_bars("AAPL", Interval::Min30, bars).unwrap();
            let points = compute_pldot(&series, &PldotConfig::default(), 4);
            assert_eq!(points[0].value, expected);
        }
    }

    #[test]
    fn oversized_gap_omits_point() {
        let mut bars: Vec<Bar> = uptrend_series().bars().to_vec();
        // Push the final bar far past the allowed gap.
        let last = bars.len() - 1;
        bars[last].timestamp = ts(40);
        let series = BarSeries::from_bars("AAPL", Interval::Min30, bars).unwrap();
        let points = compute_pldot(&series, &PldotConfig::default(), 4);
        // Bars 2..4 produce points; windows containing the displaced final
        // bar are omitted.
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn envelope_bounds_ordered_and_rising_center() {
        let series = uptrend_series();
        let points = compute_pldot(&series, &PldotConfig::default(), 4);
        let bands = compute_envelopes(&points, &EnvelopeConfig::default(), 4);
        assert_eq!(bands.len(), points.len());
        for band in &bands {
            assert!(band.lower <= band.center && band.center <= band.upper);
            assert_eq!(band.width, band.upper - band.lower);
        }
        for pair in bands.windows(2) {
            assert!(pair[1].center > pair[0].center);
        }
        // First band has a single-value window: zero width.
        assert_eq!(bands[0].width, Decimal::ZERO);
        // Full three-value window: stddev of {102,103,104} = sqrt(2/3).
        let expected = 1.5 * (2.0f64 / 3.0).sqrt();
        let got = bands[3].width.to_f64().unwrap();
        assert!((got - expected).abs() < 1e-3);
    }

    #[test]
    fn zero_volume_still_produces_pldot() {
        let mut bars: Vec<Bar> = uptrend_series().bars().to_vec();
        for bar in &mut bars {
            bar.volume = 0;
        }
        let series = BarSeries::from_bars("AAPL", Interval::Min30, bars).unwrap();
        assert_eq!(compute_pldot(&series, &PldotConfig::default(), 4).len(), 4);
    }
}
