//! # Timing Helpers
//! Jitter and backoff primitives shared by the fetch pipeline and the
//! scheduler. All delays are randomized so the outbound traffic never
//! settles into a fixed cadence.

use std::time::Duration;

use rand::Rng;

/// Full-jitter exponential backoff for attempt `attempt` (0-based).
///
/// The result always lies in `[base, min(cap, base * 2^attempt)]`.
pub fn backoff(attempt: u32, base_secs: f64, cap_secs: f64) -> Duration {
    let ceiling = cap_secs.min(base_secs * 2f64.powi(attempt as i32));
    let secs = if ceiling > base_secs {
        rand::rng().random_range(base_secs..=ceiling)
    } else {
        base_secs
    };
    Duration::from_secs_f64(secs)
}

/// Default backoff used by fetch retries: base 3s, cap 90s.
pub fn fetch_backoff(attempt: u32) -> Duration {
    backoff(attempt, 3.0, 90.0)
}

/// Jitter for the scan interval. `base=60` lands in roughly 45–90s with
/// occasional longer pauses (15% chance of an exponential extra), floored
/// at 20s.
pub fn scan_jitter(base_interval_secs: f64) -> Duration {
    let mut rng = rand::rng();
    let base_jitter = rng.random_range(-0.25..0.35) * base_interval_secs;
    let extra = if rng.random::<f64>() < 0.15 {
        // Exponential sample with mean 8s via inverse transform.
        let u: f64 = rng.random();
        -8.0 * (1.0 - u).ln()
    } else {
        0.0
    };
    let secs = (base_interval_secs + base_jitter + extra).max(20.0);
    Duration::from_secs_f64(secs)
}

/// Gaussian delay around `base_secs` (Box-Muller); floored at 20% of base.
pub fn human_delay(base_secs: f64, sigma_ratio: f64) -> Duration {
    let mut rng = rand::rng();
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    let secs = (base_secs + z * base_secs * sigma_ratio).max(base_secs * 0.2);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_envelope() {
        for attempt in 0..8 {
            for _ in 0..200 {
                let d = backoff(attempt, 3.0, 90.0).as_secs_f64();
                let ceiling = 90f64.min(3.0 * 2f64.powi(attempt as i32));
                assert!(d >= 3.0 - 1e-9, "attempt {attempt}: {d} below base");
                assert!(d <= ceiling + 1e-9, "attempt {attempt}: {d} above ceiling");
            }
        }
    }

    #[test]
    fn scan_jitter_has_a_floor() {
        for _ in 0..500 {
            assert!(scan_jitter(10.0) >= Duration::from_secs(20));
        }
    }

    #[test]
    fn scan_jitter_spreads_around_base() {
        let base = 60.0;
        for _ in 0..500 {
            let d = scan_jitter(base).as_secs_f64();
            // -25% .. +35% plus an occasional exponential tail.
            assert!(d >= base * 0.75 - 1e-9);
        }
    }

    #[test]
    fn human_delay_never_collapses_to_zero() {
        for _ in 0..500 {
            assert!(human_delay(4.0, 0.25) >= Duration::from_secs_f64(0.8));
        }
    }
}
