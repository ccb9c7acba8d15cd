use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use drummond_core::SamplerConfig;

/// Decides which timesteps land on the equity curve: always on trade
/// opens/closes, otherwise every N bars or on a significant equity move.
/// Disabling the sampler records every timestep.
pub struct EquitySampler {
    config: SamplerConfig,
    bar_count: usize,
    last_sampled: Option<Decimal>,
}

impl EquitySampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            bar_count: 0,
            last_sampled: None,
        }
    }

    /// Advance one timestep and decide whether to sample.
    pub fn observe(&mut self, equity: Decimal, trade_event: bool) -> bool {
        self.bar_count += 1;
        if !self.config.enabled {
            self.last_sampled = Some(equity);
            return true;
        }
        let sample = trade_event
            || self.bar_count % self.config.interval_bars.max(1) == 0
            || self.significant_change(equity);
        if sample {
            self.last_sampled = Some(equity);
        }
        sample
    }

    fn significant_change(&self, equity: Decimal) -> bool {
        let Some(last) = self.last_sampled else {
            return false;
        };
        if last.is_zero() {
            return false;
        }
        let change = ((equity - last) / last)
            .to_f64()
            .unwrap_or(0.0)
            .abs();
        change >= self.config.min_change_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quiet_run_samples_on_the_interval_only() {
        // 1000 flat bars, no trades: at most 1000/10 samples from the
        // sampler itself (session endpoints are the driver's concern).
        let mut sampler = EquitySampler::new(SamplerConfig::default());
        let mut samples = 0;
        for _ in 0..1000 {
            if sampler.observe(dec!(100000), false) {
                samples += 1;
            }
        }
        assert_eq!(samples, 100);
    }

    #[test]
    fn trade_events_always_sample() {
        let mut sampler = EquitySampler::new(SamplerConfig::default());
        assert!(sampler.observe(dec!(100000), true));
        assert!(!sampler.observe(dec!(100000), false));
    }

    #[test]
    fn significant_move_forces_a_sample() {
        let mut sampler = EquitySampler::new(SamplerConfig::default());
        assert!(sampler.observe(dec!(100000), true));
        // +0.5%: below the 1% threshold.
        assert!(!sampler.observe(dec!(100500), false));
        // +1.2% from the last sampled value.
        assert!(sampler.observe(dec!(101200), false));
    }

    #[test]
    fn disabled_sampler_records_everything() {
        let mut sampler = EquitySampler::new(SamplerConfig {
            enabled: false,
            ..SamplerConfig::default()
        });
        for _ in 0..5 {
            assert!(sampler.observe(dec!(100000), false));
        }
    }
}
