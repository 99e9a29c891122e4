//! Fire-time generation for open-model arrival processes.
//!
//! A [`RateGenerator`] turns elapsed phase time into the nanosecond
//! timestamps at which new sessions are due. The contract is deliberately
//! narrow: [`compute_next_fire_time`](RateGenerator::compute_next_fire_time)
//! reports every fire time that is due at or before the given elapsed time —
//! one callback per event, never a collapsed burst — and returns the next
//! fire time strictly in the future, which the caller uses as its wake-up
//! deadline. Passing a large elapsed jump (a stalled scheduler catching up)
//! therefore yields exactly the events the rate function owed over that
//! window.
//!
//! Nanosecond granularity is a correctness requirement, not an optimization:
//! at 10,000 events/sec the inter-arrival spacing is exactly 100,000 ns, and
//! truncating to milliseconds would collapse ten events onto one boundary.
//!
//! # Variants
//!
//! Deterministic schedules are closed-form: for a constant rate `r` the nth
//! fire time is `ceil(n / r * 1e9)`; for a linear ramp the fire count up to
//! time `t` is the area under the rate line and the generator inverts that
//! integral (falling back to the constant formula when the ramp is flat).
//! Stochastic (Poisson) schedules draw exponential inter-arrivals from a
//! seeded RNG with the instantaneous rate as the mean; the two families are
//! independent code paths with independently tested math.
//!
//! Each generator owns its cursor; it is owned by one phase instance and
//! touched by one thread at a time.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Ramps flatter than this are treated as constant-rate to keep the
/// integral inversion away from a division by zero.
const FLAT_RAMP_EPS: f64 = 1e-6;

/// Schedules the fire times of one arrival process.
#[derive(Debug)]
pub struct RateGenerator {
    kind: Kind,
    fired: u64,
    prev_emitted_ns: i64,
    last_computed_ns: i64,
}

#[derive(Debug)]
enum Kind {
    Constant {
        rate: f64,
    },
    Ramp {
        initial: f64,
        target: f64,
        duration_ns: f64,
    },
    PoissonConstant {
        rate: f64,
        rng: SmallRng,
        next_ns: f64,
    },
    PoissonRamp {
        initial: f64,
        target: f64,
        duration_ns: f64,
        rng: SmallRng,
        next_ns: f64,
    },
}

impl RateGenerator {
    /// Constant arrival rate of `rate` events per second.
    pub fn constant_rate(rate: f64) -> Self {
        assert!(rate > 0.0, "rate must be positive");
        Self::deterministic(Kind::Constant { rate })
    }

    /// Rate ramping linearly from `initial` to `target` events per second
    /// over `duration`, continuing at `target` past the end.
    pub fn ramp_rate(initial: f64, target: f64, duration: Duration) -> Self {
        assert!(initial >= 0.0 && target >= 0.0, "rates must not be negative");
        assert!(initial > 0.0 || target > 0.0, "ramp must reach a positive rate");
        assert!(!duration.is_zero(), "ramp duration must be positive");
        Self::deterministic(Kind::Ramp { initial, target, duration_ns: duration.as_nanos() as f64 })
    }

    /// Poisson arrivals with constant mean rate, reproducible per `seed`.
    pub fn poisson_constant_rate(seed: u64, rate: f64) -> Self {
        assert!(rate > 0.0, "rate must be positive");
        let mut rng = SmallRng::seed_from_u64(seed);
        let next_ns = exponential_gap_ns(&mut rng, rate);
        Self::sequential(Kind::PoissonConstant { rate, rng, next_ns })
    }

    /// Poisson arrivals whose mean rate ramps linearly from `initial` to
    /// `target` over `duration`, reproducible per `seed`.
    pub fn poisson_ramp_rate(seed: u64, initial: f64, target: f64, duration: Duration) -> Self {
        assert!(initial >= 0.0 && target >= 0.0, "rates must not be negative");
        assert!(initial > 0.0 || target > 0.0, "ramp must reach a positive rate");
        assert!(!duration.is_zero(), "ramp duration must be positive");
        let duration_ns = duration.as_nanos() as f64;
        let mut rng = SmallRng::seed_from_u64(seed);
        let next_ns = ramp_exponential_gap_ns(&mut rng, 0.0, initial, target, duration_ns);
        Self::sequential(Kind::PoissonRamp { initial, target, duration_ns, rng, next_ns })
    }

    fn deterministic(kind: Kind) -> Self {
        RateGenerator { kind, fired: 0, prev_emitted_ns: 0, last_computed_ns: 0 }
    }

    fn sequential(kind: Kind) -> Self {
        let first = match &kind {
            Kind::PoissonConstant { next_ns, .. } | Kind::PoissonRamp { next_ns, .. } => {
                saturating_ceil(*next_ns).max(1)
            }
            _ => unreachable!(),
        };
        RateGenerator { kind, fired: 0, prev_emitted_ns: 0, last_computed_ns: first }
    }

    /// Reports, via `on_fire`, every fire time due at or before `elapsed_ns`
    /// (nanoseconds since phase start) and returns the next fire time,
    /// strictly greater than `elapsed_ns`.
    pub fn compute_next_fire_time<F: FnMut(i64)>(&mut self, elapsed_ns: i64, mut on_fire: F) -> i64 {
        let mut next = self.pending_fire_time();
        while next <= elapsed_ns {
            self.fired += 1;
            self.prev_emitted_ns = next;
            self.advance_cursor();
            on_fire(next);
            next = self.pending_fire_time();
        }
        self.last_computed_ns = next;
        next
    }

    /// The most recently computed upcoming fire time. Before the first
    /// [`compute_next_fire_time`](Self::compute_next_fire_time) call this is
    /// 0 for the deterministic variants and the pre-drawn first arrival for
    /// the Poisson ones.
    pub fn last_computed_fire_time_ns(&self) -> i64 {
        self.last_computed_ns
    }

    /// Number of fire times reported so far.
    pub fn fire_count(&self) -> u64 {
        self.fired
    }

    /// Next scheduled fire time, clamped to stay strictly after the previous
    /// emission so that fire times always strictly increase.
    fn pending_fire_time(&self) -> i64 {
        let raw = match &self.kind {
            Kind::Constant { rate } => constant_fire_time(*rate, self.fired + 1),
            Kind::Ramp { initial, target, duration_ns } => {
                ramp_fire_time(*initial, *target, *duration_ns, self.fired + 1)
            }
            Kind::PoissonConstant { next_ns, .. } | Kind::PoissonRamp { next_ns, .. } => {
                saturating_ceil(*next_ns)
            }
        };
        raw.max(self.prev_emitted_ns.saturating_add(1))
    }

    /// Moves the cursor past the fire time just emitted. Closed-form
    /// variants advance through `fired` alone; Poisson variants accumulate
    /// a fresh draw.
    fn advance_cursor(&mut self) {
        match &mut self.kind {
            Kind::Constant { .. } | Kind::Ramp { .. } => {}
            Kind::PoissonConstant { rate, rng, next_ns } => {
                *next_ns += exponential_gap_ns(rng, *rate);
            }
            Kind::PoissonRamp { initial, target, duration_ns, rng, next_ns } => {
                *next_ns += ramp_exponential_gap_ns(rng, *next_ns, *initial, *target, *duration_ns);
            }
        }
    }
}

/// `ceil(n / rate * 1e9)`.
fn constant_fire_time(rate: f64, n: u64) -> i64 {
    saturating_ceil(n as f64 * NANOS_PER_SEC / rate)
}

/// Inverts the fire-count integral of a linear ramp.
///
/// With `r0` the initial rate and `k` the slope (both per nanosecond), the
/// count up to `t <= duration` is `F(t) = r0*t + k*t^2/2`; past the ramp the
/// count grows linearly at the target rate. The nth fire time is the root of
/// `F(t) = n` in the matching regime.
fn ramp_fire_time(initial: f64, target: f64, duration_ns: f64, n: u64) -> i64 {
    if (target - initial).abs() < FLAT_RAMP_EPS {
        return constant_fire_time(initial, n);
    }
    let r0 = initial / NANOS_PER_SEC;
    let rt = target / NANOS_PER_SEC;
    let k = (rt - r0) / duration_ns;
    let ramp_total = r0 * duration_ns + k * duration_ns * duration_ns / 2.0;
    let n = n as f64;
    if n <= ramp_total {
        let disc = (r0 * r0 + 2.0 * k * n).max(0.0);
        saturating_ceil((-r0 + disc.sqrt()) / k)
    } else if rt > 0.0 {
        saturating_ceil(duration_ns + (n - ramp_total) / rt)
    } else {
        // Ramped down to zero: no further arrivals.
        i64::MAX
    }
}

/// One exponential inter-arrival with mean `1/rate`, in nanoseconds.
fn exponential_gap_ns(rng: &mut SmallRng, rate: f64) -> f64 {
    // Inverse CDF of the exponential distribution; the draw is clamped away
    // from zero so ln() stays finite.
    let u: f64 = rng.gen::<f64>().max(1e-20);
    -u.ln() / rate * NANOS_PER_SEC
}

/// One inter-arrival of an inhomogeneous Poisson process whose rate ramps
/// linearly until `duration_ns` and holds the target afterwards.
///
/// Solves `integral of rate over [at, at+x] = -ln(u)` for `x`; when the
/// integral crosses the ramp end the remainder is drawn at the target rate.
fn ramp_exponential_gap_ns(
    rng: &mut SmallRng,
    at_ns: f64,
    initial: f64,
    target: f64,
    duration_ns: f64,
) -> f64 {
    if (target - initial).abs() < FLAT_RAMP_EPS {
        return exponential_gap_ns(rng, initial);
    }
    let rt = target / NANOS_PER_SEC;
    if at_ns >= duration_ns {
        if rt <= 0.0 {
            return f64::INFINITY;
        }
        return exponential_gap_ns(rng, target);
    }
    let events = {
        let u: f64 = rng.gen::<f64>().max(1e-20);
        -u.ln()
    };
    let r0 = initial / NANOS_PER_SEC;
    let k = (rt - r0) / duration_ns;
    let r_at = r0 + k * at_ns;
    let left = duration_ns - at_ns;
    let ramp_remainder = r_at * left + k * left * left / 2.0;
    if events <= ramp_remainder {
        let disc = (r_at * r_at + 2.0 * k * events).max(0.0);
        (-r_at + disc.sqrt()) / k
    } else if rt > 0.0 {
        left + (events - ramp_remainder) / rt
    } else {
        f64::INFINITY
    }
}

fn saturating_ceil(value: f64) -> i64 {
    // f64 -> i64 casts saturate, which is exactly what an unreachable fire
    // time should do.
    value.ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Steps a generator the way a phase does: elapsed = the previously
    /// computed fire time.
    fn step(generator: &mut RateGenerator) -> Vec<i64> {
        let mut fires = Vec::new();
        let elapsed = generator.last_computed_fire_time_ns();
        generator.compute_next_fire_time(elapsed, |t| fires.push(t));
        fires
    }

    mod constant {
        use super::*;

        #[test]
        fn first_call_at_zero_emits_nothing() {
            let mut generator = RateGenerator::constant_rate(1000.0);
            assert!(step(&mut generator).is_empty());
        }

        #[test]
        fn fires_match_closed_form() {
            let mut generator = RateGenerator::constant_rate(1000.0);
            step(&mut generator);
            for i in 1..=10i64 {
                let fires = step(&mut generator);
                assert_eq!(fires, vec![i * 1_000_000]);
            }
        }

        #[test]
        fn catch_up_emits_every_missed_fire() {
            let mut generator = RateGenerator::constant_rate(10_000.0);
            let mut fires = Vec::new();
            let next = generator.compute_next_fire_time(1_000_000, |t| fires.push(t));
            assert_eq!(fires.len(), 10);
            for pair in fires.windows(2) {
                assert!(pair[1] > pair[0]);
                assert_eq!(pair[1] - pair[0], 100_000);
            }
            assert!(next > 1_000_000);
        }

        #[test]
        fn nanosecond_spacing_never_collapses_to_milliseconds() {
            let mut generator = RateGenerator::constant_rate(10_000.0);
            let mut fires = Vec::new();
            generator.compute_next_fire_time(10_000_000, |t| fires.push(t));
            assert_eq!(fires.len(), 100);
            for pair in fires.windows(2) {
                assert_eq!(pair[1] - pair[0], 100_000);
            }
        }

        #[test]
        fn count_over_duration_is_rate_times_duration() {
            let mut generator = RateGenerator::constant_rate(100.0);
            let mut count = 0u64;
            let next = generator.compute_next_fire_time(1_000_000_000, |_| count += 1);
            assert!((99..=101).contains(&count), "count was {count}");
            assert_eq!(count, generator.fire_count());
            assert!(next > 1_000_000_000);
        }

        #[test]
        fn fires_are_never_in_the_future() {
            for rate in [100.0, 1_000.0, 10_000.0, 100_000.0] {
                let mut generator = RateGenerator::constant_rate(rate);
                for _ in 0..200 {
                    let elapsed = generator.last_computed_fire_time_ns();
                    generator.compute_next_fire_time(elapsed, |t| {
                        assert!(t <= elapsed, "rate {rate}: fire {t} past elapsed {elapsed}");
                    });
                }
            }
        }
    }

    mod ramp {
        use super::*;

        #[test]
        fn fires_are_strictly_increasing() {
            let mut generator =
                RateGenerator::ramp_rate(100.0, 1000.0, Duration::from_secs(10));
            let mut prev = -1i64;
            for _ in 0..200 {
                let elapsed = generator.last_computed_fire_time_ns();
                generator.compute_next_fire_time(elapsed, |t| {
                    assert!(t > prev);
                    prev = t;
                });
            }
        }

        #[test]
        fn fires_are_never_in_the_future() {
            let mut generator =
                RateGenerator::ramp_rate(100.0, 10_000.0, Duration::from_secs(10));
            for _ in 0..200 {
                let elapsed = generator.last_computed_fire_time_ns();
                generator.compute_next_fire_time(elapsed, |t| assert!(t <= elapsed));
            }
        }

        #[test]
        fn count_matches_rate_integral() {
            // Average of 0..100 over 10s is 50/s: 500 fires.
            let mut generator = RateGenerator::ramp_rate(0.0, 100.0, Duration::from_secs(10));
            let mut count = 0u64;
            generator.compute_next_fire_time(10_000_000_000, |_| count += 1);
            assert!((499..=501).contains(&count), "count was {count}");
        }

        #[test]
        fn ramp_down_count_matches_rate_integral() {
            let mut generator = RateGenerator::ramp_rate(100.0, 0.0, Duration::from_secs(10));
            let mut count = 0u64;
            generator.compute_next_fire_time(10_000_000_000, |_| count += 1);
            assert!((499..=501).contains(&count), "count was {count}");
        }

        #[test]
        fn flat_ramp_falls_back_to_constant_schedule() {
            let mut ramp = RateGenerator::ramp_rate(50.0, 50.0, Duration::from_secs(10));
            let mut constant = RateGenerator::constant_rate(50.0);
            for _ in 0..20 {
                assert_eq!(step(&mut ramp), step(&mut constant));
            }
        }

        #[test]
        fn extends_past_duration_at_target_rate() {
            // 15 fires during the 1s ramp (avg 15/s), then 20/s.
            let mut generator = RateGenerator::ramp_rate(10.0, 20.0, Duration::from_secs(1));
            let mut count = 0u64;
            generator.compute_next_fire_time(2_000_000_000, |_| count += 1);
            assert!((34..=36).contains(&count), "count was {count}");
        }
    }

    mod poisson {
        use super::*;

        #[test]
        fn same_seed_reproduces_the_schedule() {
            let mut a = RateGenerator::poisson_constant_rate(7, 1000.0);
            let mut b = RateGenerator::poisson_constant_rate(7, 1000.0);
            let mut fires_a = Vec::new();
            let mut fires_b = Vec::new();
            a.compute_next_fire_time(100_000_000, |t| fires_a.push(t));
            b.compute_next_fire_time(100_000_000, |t| fires_b.push(t));
            assert!(!fires_a.is_empty());
            assert_eq!(fires_a, fires_b);
        }

        #[test]
        fn stepping_propagates_positive_increasing_fires() {
            let mut generator = RateGenerator::poisson_constant_rate(11, 1000.0);
            let mut prev = 0i64;
            for _ in 0..20 {
                let fires = step(&mut generator);
                assert!(!fires.is_empty());
                for t in fires {
                    assert!(t > prev, "fire {t} not after {prev}");
                    prev = t;
                }
            }
        }

        #[test]
        fn mean_inter_arrival_matches_rate() {
            let rate = 1000.0;
            let mut generator = RateGenerator::poisson_constant_rate(42, rate);
            let mut fires = Vec::new();
            generator.compute_next_fire_time(3_000_000_000, |t| fires.push(t));
            let gaps: Vec<f64> =
                fires.windows(2).map(|pair| (pair[1] - pair[0]) as f64).collect();
            assert!(gaps.len() > 1000);
            let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
            let expected = NANOS_PER_SEC / rate;
            assert!(
                (mean - expected).abs() < expected * 0.1,
                "mean {mean} vs expected {expected}"
            );
        }

        #[test]
        fn inter_arrivals_pass_kolmogorov_smirnov() {
            let rate = 1000.0;
            let mut generator = RateGenerator::poisson_constant_rate(42, rate);
            let mut fires = Vec::new();
            generator.compute_next_fire_time(3_000_000_000, |t| fires.push(t));
            let mut gaps: Vec<f64> =
                fires.windows(2).map(|pair| (pair[1] - pair[0]) as f64).collect();
            gaps.sort_by(|a, b| a.partial_cmp(b).unwrap());

            let n = gaps.len() as f64;
            let lambda = rate / NANOS_PER_SEC;
            let mut d_max = 0.0f64;
            for (i, gap) in gaps.iter().enumerate() {
                let cdf = 1.0 - (-lambda * gap).exp();
                let above = (i + 1) as f64 / n - cdf;
                let below = cdf - i as f64 / n;
                d_max = d_max.max(above).max(below);
            }
            // 1% significance critical value for the KS statistic.
            let critical = 1.63 / n.sqrt();
            assert!(d_max < critical, "KS statistic {d_max} over {critical}");
        }

        #[test]
        fn ramp_variant_count_tracks_the_integral() {
            // Average of 100..1000 over 10s is 550/s: ~5500 fires.
            let mut generator = RateGenerator::poisson_ramp_rate(
                13,
                100.0,
                1000.0,
                Duration::from_secs(10),
            );
            let mut count = 0u64;
            let next = generator.compute_next_fire_time(10_000_000_000, |_| count += 1);
            assert!(
                (4950..=6050).contains(&count),
                "count {count} far from expected 5500"
            );
            assert!(next > 10_000_000_000);
        }

        #[test]
        fn ramp_variant_fires_strictly_increase() {
            let mut generator =
                RateGenerator::poisson_ramp_rate(29, 10.0, 100.0, Duration::from_secs(5));
            let mut prev = 0i64;
            generator.compute_next_fire_time(5_000_000_000, |t| {
                assert!(t > prev);
                prev = t;
            });
        }

        #[test]
        fn flat_poisson_ramp_draws_at_the_initial_rate() {
            let mut generator =
                RateGenerator::poisson_ramp_rate(3, 200.0, 200.0, Duration::from_secs(5));
            let mut count = 0u64;
            generator.compute_next_fire_time(5_000_000_000, |_| count += 1);
            // 200/s over 5s: ~1000 fires, sd ~32.
            assert!((850..=1150).contains(&count), "count was {count}");
        }
    }
}
