// ===============================
// src/rng.rs
// ===============================
//
// Sumber random untuk Processor (delay & outcome), bisa diganti di test.
// - ThreadRandom : thread_rng per panggilan (jangan simpan ThreadRng melewati .await)
// - SeededRandom : StdRng dengan seed, untuk run yang bisa diulang (PROCESS_RNG_SEED)
// - FixedRandom  : delay & outcome dipaku, untuk test
//
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

pub trait Randomness: Send + Sync {
    /// Durasi uniform dalam interval tertutup [min, max].
    fn delay(&self, min: Duration, max: Duration) -> Duration;
    /// true dengan peluang `p`.
    fn fails(&self, p: f64) -> bool;
}

fn draw_delay<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

fn draw_fail<R: Rng + ?Sized>(rng: &mut R, p: f64) -> bool {
    if p.is_nan() || p <= 0.0 {
        return false;
    }
    rng.gen_bool(p.min(1.0))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl Randomness for ThreadRandom {
    fn delay(&self, min: Duration, max: Duration) -> Duration {
        draw_delay(&mut rand::thread_rng(), min, max)
    }

    fn fails(&self, p: f64) -> bool { draw_fail(&mut rand::thread_rng(), p) }
}

#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self { Self(Mutex::new(StdRng::seed_from_u64(seed))) }
}

impl Randomness for SeededRandom {
    fn delay(&self, min: Duration, max: Duration) -> Duration { draw_delay(&mut *self.0.lock(), min, max) }

    fn fails(&self, p: f64) -> bool { draw_fail(&mut *self.0.lock(), p) }
}

/// Outcome & delay tetap. `fail = None` berarti ikut peluang 0/1 saja (p >= 1 gagal).
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    pub delay: Duration,
    pub fail: Option<bool>,
}

impl FixedRandom {
    pub fn succeed(delay: Duration) -> Self { Self { delay, fail: Some(false) } }

    pub fn fail(delay: Duration) -> Self { Self { delay, fail: Some(true) } }

    /// Ikuti p apa adanya: p >= 1 selalu gagal, selain itu selalu sukses.
    pub fn by_probability(delay: Duration) -> Self { Self { delay, fail: None } }
}

impl Randomness for FixedRandom {
    fn delay(&self, _min: Duration, _max: Duration) -> Duration { self.delay }

    fn fails(&self, p: f64) -> bool { self.fail.unwrap_or(p >= 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_in_closed_range() {
        let r = ThreadRandom;
        let (lo, hi) = (Duration::from_millis(500), Duration::from_millis(2000));
        for _ in 0..1000 {
            let d = r.delay(lo, hi);
            assert!(d >= lo && d <= hi, "{d:?}");
        }
        assert_eq!(r.delay(hi, hi), hi);
    }

    #[test]
    fn extreme_probabilities_are_deterministic() {
        let r = SeededRandom::new(7);
        assert!((0..500).all(|_| r.fails(1.0)));
        assert!((0..500).all(|_| !r.fails(0.0)));
        assert!(!r.fails(f64::NAN));
    }

    #[test]
    fn seeded_is_repeatable() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        let lo = Duration::from_millis(1);
        let hi = Duration::from_millis(1000);
        for _ in 0..50 {
            assert_eq!(a.delay(lo, hi), b.delay(lo, hi));
            assert_eq!(a.fails(0.3), b.fails(0.3));
        }
    }

    #[test]
    fn fixed_follows_override() {
        let d = Duration::from_millis(3);
        assert!(FixedRandom::fail(d).fails(0.0));
        assert!(!FixedRandom::succeed(d).fails(1.0));
        assert!(FixedRandom::by_probability(d).fails(1.0));
        assert!(!FixedRandom::by_probability(d).fails(0.1));
        assert_eq!(FixedRandom::succeed(d).delay(Duration::ZERO, Duration::from_secs(9)), d);
    }
}
