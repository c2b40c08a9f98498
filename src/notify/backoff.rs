//! Retry delay schedule: exponential, jittered, capped.

use chrono::Duration;
use rand::Rng;

use crate::config::DeliveryConfig;

/// Delay before retry number `attempt` (1-based: the delay scheduled after
/// the first failed attempt is `backoff(cfg, 1)`).
pub fn delay(cfg: &DeliveryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = cfg.backoff_base_secs.saturating_mul(1u64 << exp);
    let capped = base.min(cfg.backoff_cap_secs) as f64;

    // Spread retries out so a flapping channel is not hit by every job at once
    let jitter = cfg.jitter_frac.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    Duration::milliseconds((capped * factor * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(jitter: f64) -> DeliveryConfig {
        DeliveryConfig {
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            jitter_frac: jitter,
            ..DeliveryConfig::default()
        }
    }

    #[test]
    fn test_doubles_without_jitter() {
        let c = cfg(0.0);
        assert_eq!(delay(&c, 1).num_seconds(), 30);
        assert_eq!(delay(&c, 2).num_seconds(), 60);
        assert_eq!(delay(&c, 3).num_seconds(), 120);
    }

    #[test]
    fn test_caps_at_configured_maximum() {
        let c = cfg(0.0);
        assert_eq!(delay(&c, 10).num_seconds(), 3600);
        assert_eq!(delay(&c, 30).num_seconds(), 3600);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let c = cfg(0.2);
        for _ in 0..100 {
            let d = delay(&c, 2).num_milliseconds();
            assert!((48_000..=72_000).contains(&d), "delay {d}ms out of bounds");
        }
    }
}
