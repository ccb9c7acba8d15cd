use sha2::{Digest, Sha256};

use drummond_core::Bar;

/// Fingerprint a parameter set. Callers pass each parameter rendered to a
/// stable string; ordering matters.
pub fn params_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Fingerprint an input bar window: the last `tail` bars hashed in full,
/// plus the series length and a rolling checksum over every bar so that
/// edits anywhere in the series change the key.
pub fn data_fingerprint(bars: &[Bar], tail: usize) -> String {
    let mut rolling: u64 = 0;
    for bar in bars {
        rolling = rolling
            .wrapping_mul(31)
            .wrapping_add(bar.timestamp.timestamp_millis() as u64)
            .wrapping_add(bar.close.mantissa() as u64)
            .wrapping_add(bar.volume);
    }

    let mut hasher = Sha256::new();
    hasher.update((bars.len() as u64).to_le_bytes());
    hasher.update(rolling.to_le_bytes());
    let start = bars.len().saturating_sub(tail.max(1));
    for bar in &bars[start..] {
        hasher.update(bar.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(bar.open.mantissa().to_le_bytes());
        hasher.update(bar.high.mantissa().to_le_bytes());
        hasher.update(bar.low.mantissa().to_le_bytes());
        hasher.update(bar.close.mantissa().to_le_bytes());
        hasher.update(bar.volume.to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn bars(closes: &[Decimal]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
                    + Duration::minutes(30 * i as i64),
                open: close,
                high: close + dec!(1),
                low: close - dec!(1),
                close,
                volume: 100,
            })
            .collect()
    }

    #[test]
    fn identical_inputs_identical_fingerprints() {
        let a = bars(&[dec!(100), dec!(101), dec!(102)]);
        let b = bars(&[dec!(100), dec!(101), dec!(102)]);
        assert_eq!(data_fingerprint(&a, 3), data_fingerprint(&b, 3));
    }

    #[test]
    fn edit_outside_tail_changes_fingerprint() {
        let a = bars(&[dec!(100), dec!(101), dec!(102), dec!(103)]);
        let mut b = a.clone();
        b[0].close = dec!(99);
        assert_ne!(data_fingerprint(&a, 2), data_fingerprint(&b, 2));
    }

    #[test]
    fn params_order_matters() {
        assert_ne!(
            params_fingerprint(&["3", "1.5"]),
            params_fingerprint(&["1.5", "3"])
        );
    }
}
