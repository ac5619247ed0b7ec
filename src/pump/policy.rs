//! Increment policy: whether a metric is due and what its next value is.
//!
//! Pure apart from the injected [`RandomSource`].

use crate::types::MetricConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform integer generator over an inclusive range.
pub trait RandomSource: Send {
    /// Only called with `min < max`.
    fn draw_inclusive(&mut self, min: i64, max: i64) -> i64;
}

/// Draws from the thread-local generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn draw_inclusive(&mut self, min: i64, max: i64) -> i64 {
        rand::thread_rng().gen_range(min..=max)
    }
}

/// Reproducible generator for simulations.
#[derive(Debug, Clone)]
pub struct SeededRandom(StdRng);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for SeededRandom {
    fn draw_inclusive(&mut self, min: i64, max: i64) -> i64 {
        self.0.gen_range(min..=max)
    }
}

/// Outcome of evaluating one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `max_step == 0`.
    Disabled,
    /// Interval not yet elapsed since the last successful increment.
    Waiting { remaining_ms: i64 },
    /// Write `value` and stamp the metric with `at_ms`.
    Fire { step: i64, value: i64, at_ms: i64 },
}

/// Draw a step in `[min, max]`; a reversed or empty range yields `min`.
pub fn draw_step(min: i64, max: i64, rng: &mut dyn RandomSource) -> i64 {
    if max <= min {
        return min;
    }
    rng.draw_inclusive(min, max)
}

/// Clamp `candidate` to `cap` when a cap is set.
///
/// This is deliberately not a plain `min(candidate, cap)`: a value already
/// above the cap (only reachable through a manual set) is kept as is rather
/// than lowered to the cap, so a tick never decreases a metric.
pub fn apply_cap(current: i64, candidate: i64, cap: i64) -> i64 {
    if cap > 0 {
        candidate.min(cap.max(current))
    } else {
        candidate
    }
}

pub fn evaluate(
    config: &MetricConfig,
    current: i64,
    now_ms: i64,
    rng: &mut dyn RandomSource,
) -> Decision {
    if config.max_step == 0 {
        return Decision::Disabled;
    }

    let elapsed_ms = now_ms.saturating_sub(config.last_tick_at_ms.unwrap_or(0));
    let interval_ms = config.interval_seconds.saturating_mul(1000);
    if elapsed_ms < interval_ms {
        return Decision::Waiting {
            remaining_ms: interval_ms - elapsed_ms,
        };
    }

    let step = draw_step(config.min_step, config.max_step, rng);
    let value = apply_cap(current, current.saturating_add(step), config.cap);
    Decision::Fire {
        step,
        value,
        at_ms: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Always answers the top of the range.
    struct Highest;

    impl RandomSource for Highest {
        fn draw_inclusive(&mut self, _min: i64, max: i64) -> i64 {
            max
        }
    }

    fn config(min: i64, max: i64, interval: i64, cap: i64, last: Option<i64>) -> MetricConfig {
        MetricConfig {
            min_step: min,
            max_step: max,
            interval_seconds: interval,
            cap,
            last_tick_at_ms: last,
        }
    }

    #[test]
    fn zero_max_step_is_disabled_at_any_elapsed_time() {
        let cfg = config(5, 0, 1, 0, None);
        for now in [0, 1_000, i64::MAX / 2] {
            assert_eq!(evaluate(&cfg, 10, now, &mut Highest), Decision::Disabled);
        }
    }

    #[test]
    fn waits_until_interval_elapses() {
        let cfg = config(1, 1, 10, 0, Some(20_000));
        assert_eq!(
            evaluate(&cfg, 0, 29_999, &mut Highest),
            Decision::Waiting { remaining_ms: 1 }
        );
        assert_eq!(
            evaluate(&cfg, 0, 30_000, &mut Highest),
            Decision::Fire {
                step: 1,
                value: 1,
                at_ms: 30_000
            }
        );
    }

    #[test]
    fn never_ticked_counts_from_epoch() {
        let cfg = config(1, 1, 10, 0, None);
        assert!(matches!(
            evaluate(&cfg, 0, 5_000, &mut Highest),
            Decision::Waiting { .. }
        ));
        assert!(matches!(
            evaluate(&cfg, 0, 1_700_000_000_000, &mut Highest),
            Decision::Fire { .. }
        ));
    }

    #[test]
    fn draws_stay_within_bounds() {
        let mut rng = SeededRandom::new(7);
        let cfg = config(3, 9, 1, 0, None);
        for _ in 0..500 {
            match evaluate(&cfg, 100, 60_000, &mut rng) {
                Decision::Fire { step, value, .. } => {
                    assert!((3..=9).contains(&step));
                    assert!((103..=109).contains(&value));
                }
                other => panic!("expected fire, got {other:?}"),
            }
        }
    }

    #[test]
    fn reversed_range_clamps_to_min_step() {
        let cfg = config(8, 2, 1, 0, None);
        assert_eq!(
            evaluate(&cfg, 0, 60_000, &mut Highest),
            Decision::Fire {
                step: 8,
                value: 8,
                at_ms: 60_000
            }
        );
    }

    #[test]
    fn cap_is_idempotent() {
        let cfg = config(5, 5, 1, 12, None);
        let mut current = 0;
        for _ in 0..10 {
            if let Decision::Fire { value, .. } = evaluate(&cfg, current, 60_000, &mut Highest) {
                assert!(value >= current);
                assert!(value <= 12);
                current = value;
            }
        }
        assert_eq!(current, 12);
        // Still fires at the cap, writing the same value.
        assert_eq!(
            evaluate(&cfg, 12, 60_000, &mut Highest),
            Decision::Fire {
                step: 5,
                value: 12,
                at_ms: 60_000
            }
        );
    }

    #[test]
    fn cap_never_lowers_a_manual_overshoot() {
        assert_eq!(apply_cap(50, 55, 20), 50);
        assert_eq!(apply_cap(10, 25, 20), 20);
        assert_eq!(apply_cap(10, 25, 0), 25);
    }
}
