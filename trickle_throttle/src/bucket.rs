//! Leaky bucket throttle
//!
//! Recorded usage fills a bucket that drains at a fixed rate. Admission is
//! immediate while the bucket has room and waits once it is full. Usage may
//! be recorded after the fact without a capacity check, so the bucket can
//! transiently sit above its limit; the next admission pays that debt down.

use std::num::NonZeroU32;

use crate::{Admission, Clock, Error, RealClock, TICKS_PER_SECOND};

#[derive(Debug)]
/// A throttle type.
///
/// The bucket enforces a sustained `rate` with a burst bounded by `limit`.
/// All arithmetic lives in the non-waiting [`Ledger`]; this shell only
/// enforces the waits the ledger computes, through whichever wait primitive
/// the execution model calls for.
pub struct LeakyBucket<C = RealClock> {
    ledger: Ledger,
    /// The clock that `LeakyBucket` will use.
    clock: C,
}

impl<C> LeakyBucket<C>
where
    C: Clock,
{
    pub(crate) fn with_clock(rate: NonZeroU32, limit: NonZeroU32, clock: C) -> Self {
        Self {
            ledger: Ledger::new(rate, limit),
            clock,
        }
    }

    pub(crate) fn blocking_reserve(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self.ledger.reserve(self.clock.ticks_elapsed(), min, max)? {
            Admission::Ready(granted) => Ok(granted),
            Admission::Wait { ticks, granted } => {
                self.clock.wait_blocking(ticks);
                Ok(granted)
            }
        }
    }

    pub(crate) fn blocking_drain(&mut self) {
        let ticks = self.ledger.drain(self.clock.ticks_elapsed());
        if ticks > 0 {
            self.clock.wait_blocking(ticks);
        }
    }

    pub(crate) fn blocking_commit(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        let granted = self.blocking_reserve(min, max)?;
        self.ledger.record(granted);
        Ok(granted)
    }

    pub(crate) fn record(&mut self, amount: u64) {
        self.ledger.record(amount);
    }

    pub(crate) fn total(&self) -> u64 {
        self.ledger.total
    }

    pub(crate) fn admit(&mut self, min: u64, max: u64) -> Result<Admission, Error> {
        self.ledger.reserve(self.clock.ticks_elapsed(), min, max)
    }

    pub(crate) fn drain_ticks(&mut self) -> u64 {
        self.ledger.drain(self.clock.ticks_elapsed())
    }
}

impl<C> LeakyBucket<C>
where
    C: Clock + Send + Sync,
{
    pub(crate) async fn reserve(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self.ledger.reserve(self.clock.ticks_elapsed(), min, max)? {
            Admission::Ready(granted) => Ok(granted),
            Admission::Wait { ticks, granted } => {
                self.clock.wait(ticks).await;
                Ok(granted)
            }
        }
    }

    pub(crate) async fn drain(&mut self) {
        let ticks = self.ledger.drain(self.clock.ticks_elapsed());
        if ticks > 0 {
            self.clock.wait(ticks).await;
        }
    }

    pub(crate) async fn commit(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        let granted = self.reserve(min, max).await?;
        self.ledger.record(granted);
        Ok(granted)
    }
}

/// The non-waiting interior of the bucket, about which the property tests
/// below make their claims. Amounts are units, durations are clock ticks.
#[derive(Debug)]
struct Ledger {
    /// Decay rate in units per second.
    rate: f64,
    /// Maximum outstanding usage past which admission must wait.
    limit: f64,
    /// Current outstanding usage. Never negative; may transiently exceed
    /// `limit` after a forced record.
    used: f64,
    /// Tick stamp of the last decay.
    last_update: u64,
    /// All units ever recorded.
    total: u64,
}

impl Ledger {
    fn new(rate: NonZeroU32, limit: NonZeroU32) -> Self {
        Self {
            rate: f64::from(rate.get()),
            limit: f64::from(limit.get()),
            used: 0.0,
            last_update: 0,
            total: 0,
        }
    }

    /// Decay outstanding usage by the time elapsed since the last decay,
    /// floored at zero. Idempotent when no time has passed.
    fn decay(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_update);
        let drained = self.rate * (elapsed as f64 / TICKS_PER_SECOND as f64);
        self.used = (self.used - drained).max(0.0);
        self.last_update = now;
    }

    /// Decide admission for a request of `min..=max` units at time `now`.
    ///
    /// The first check runs against stale usage: capacity that was free at
    /// the last decay is still free now, and skipping the decay keeps the
    /// hot path cheap. Only when the stale view has no room is usage
    /// refreshed and, failing that too, a wait computed. The wait covers
    /// the portion of the backlog that must drain for `min` to fit, capped
    /// at the whole backlog. After the wait the grant is exactly `min`,
    /// with no re-check.
    ///
    /// Admission does not mutate usage; the caller records consumption
    /// separately.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn reserve(&mut self, now: u64, min: u64, max: u64) -> Result<Admission, Error> {
        if min > max {
            return Err(Error::Bounds { min, max });
        }

        let available = self.limit - self.used;
        if available >= min as f64 {
            return Ok(Admission::Ready(grant(available, max)));
        }

        self.decay(now);

        let available = self.limit - self.used;
        if available >= min as f64 {
            return Ok(Admission::Ready(grant(available, max)));
        }

        let deficit = (min as f64 - available).min(self.used);
        let ticks = (deficit / self.rate * TICKS_PER_SECOND as f64).ceil() as u64;
        if ticks == 0 {
            return Ok(Admission::Ready(min));
        }
        Ok(Admission::Wait {
            ticks,
            granted: min,
        })
    }

    /// Ticks until the whole backlog has drained, zero for an empty
    /// bucket. Usage is not reset here; the wait assumes decay proceeds at
    /// `rate` throughout, which the next decay call observes.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn drain(&mut self, now: u64) -> u64 {
        if self.used == 0.0 {
            return 0;
        }
        self.decay(now);
        (self.used / self.rate * TICKS_PER_SECOND as f64).ceil() as u64
    }

    /// Record usage that already happened. No wait, no capacity check.
    fn record(&mut self, amount: u64) {
        self.used += amount as f64;
        self.total = self.total.saturating_add(amount);
    }
}

/// Grant as much of `available` as `max` allows. Callers have established
/// `available >= min`; flooring cannot take the grant below an integral
/// minimum.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn grant(available: f64, max: u64) -> u64 {
    (available.floor() as u64).min(max)
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    };

    use async_trait::async_trait;
    use proptest::{collection, prelude::*};

    use super::{Ledger, grant};
    use crate::{Admission, Clock, LeakyBucket, RealClock, TICKS_PER_SECOND};

    fn nz(value: u32) -> NonZeroU32 {
        NonZeroU32::new(value).unwrap()
    }

    const fn secs(s: u64) -> u64 {
        s * TICKS_PER_SECOND
    }

    /// A clock whose time only moves when the bucket sleeps on it, plus a
    /// record of every sleep.
    #[derive(Debug, Clone, Default)]
    struct MockClock(Arc<MockInner>);

    #[derive(Debug, Default)]
    struct MockInner {
        now: AtomicU64,
        sleeps: Mutex<Vec<u64>>,
    }

    impl MockClock {
        fn now(&self) -> u64 {
            self.0.now.load(Ordering::Relaxed)
        }

        fn advance(&self, ticks: u64) {
            self.0.now.fetch_add(ticks, Ordering::Relaxed);
        }

        fn sleeps(&self) -> Vec<u64> {
            self.0.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for MockClock {
        fn ticks_elapsed(&self) -> u64 {
            self.now()
        }

        async fn wait(&self, ticks: u64) {
            self.wait_blocking(ticks);
        }

        fn wait_blocking(&self, ticks: u64) {
            self.0.sleeps.lock().unwrap().push(ticks);
            self.advance(ticks);
        }
    }

    // A bucket with rate 1 and limit 200, driven through grants under, at
    // and over the limit. Expected values follow the decay and deficit
    // formulas exactly.
    #[test]
    fn trace_under_at_and_over_the_limit() {
        let clock = MockClock::default();
        let mut bucket = LeakyBucket::with_clock(nz(1), nz(200), clock.clone());

        // Under the limit: full maximum granted, no sleep.
        assert_eq!(bucket.blocking_commit(10, 150).unwrap(), 150);
        assert_eq!(clock.now(), 0);
        assert!(clock.sleeps().is_empty());

        // Only 50 units remain below the limit.
        assert_eq!(bucket.blocking_commit(10, 150).unwrap(), 50);
        assert_eq!(clock.now(), 0);
        assert!(clock.sleeps().is_empty());

        // Over the limit: sleep for the 10-unit deficit, grant the minimum.
        assert_eq!(bucket.blocking_commit(10, 100).unwrap(), 10);
        assert_eq!(clock.now(), secs(10));
        assert_eq!(clock.sleeps(), vec![secs(10)]);

        // 50 seconds pass externally; decay brings usage from 210 to 150.
        clock.advance(secs(50));
        bucket.ledger.decay(clock.now());
        assert!((bucket.ledger.used - 150.0).abs() < 1e-9);

        // A request far over the limit waits for the capped deficit
        // (min(300 - 50, 150) = 150) and grants exactly the minimum.
        assert_eq!(bucket.blocking_commit(300, 350).unwrap(), 300);
        assert_eq!(clock.now(), secs(210));
        assert_eq!(clock.sleeps(), vec![secs(10), secs(150)]);

        // Usage now sits at 450 with 150 seconds of decay pending: the
        // next small request pays min(10 - (200 - 300), 300) = 110.
        assert_eq!(bucket.blocking_commit(10, 20).unwrap(), 10);
        assert_eq!(clock.now(), secs(320));
        assert_eq!(clock.sleeps(), vec![secs(10), secs(150), secs(110)]);

        assert_eq!(bucket.total(), 150 + 50 + 10 + 300 + 10);
    }

    // The deficit is capped at the backlog, so a request larger than the
    // limit against an empty bucket rides straight through and is trued up
    // by its own record. Pins the formula `min(min - available, used)`.
    #[test]
    fn oversized_request_clears_empty_bucket() {
        let mut ledger = Ledger::new(nz(1), nz(200));
        match ledger.reserve(0, 300, 350).unwrap() {
            Admission::Ready(granted) => assert_eq!(granted, 300),
            Admission::Wait { .. } => panic!("empty bucket must not wait"),
        }
    }

    #[test]
    fn bounds_error_on_inverted_request() {
        let mut ledger = Ledger::new(nz(10), nz(100));
        assert!(ledger.reserve(0, 20, 10).is_err());
    }

    #[test]
    fn drain_waits_out_the_backlog() {
        let mut ledger = Ledger::new(nz(10), nz(100));
        assert_eq!(ledger.drain(0), 0);
        ledger.record(100);
        assert_eq!(ledger.drain(0), secs(10));
        // Drain does not reset usage; a later decay observes the wait.
        ledger.decay(secs(10));
        assert!(ledger.used.abs() < 1e-9);
    }

    #[test]
    fn reserve_does_not_mutate_usage() {
        let mut ledger = Ledger::new(nz(10), nz(100));
        ledger.record(40);
        let before = ledger.used;
        let _ = ledger.reserve(0, 10, 50).unwrap();
        assert!((ledger.used - before).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn async_commit_paces_virtual_time() {
        let mut bucket = LeakyBucket::with_clock(nz(100), nz(100), RealClock::default());

        // Burst capacity goes through untimed.
        assert_eq!(bucket.commit(100, 100).await.unwrap(), 100);

        // The next request must wait for its deficit at 100 units/second.
        let start = tokio::time::Instant::now();
        assert_eq!(bucket.commit(50, 50).await.unwrap(), 50);
        assert!(start.elapsed() >= tokio::time::Duration::from_millis(500));
    }

    #[derive(Debug, Clone)]
    struct Op {
        min: u64,
        spread: u64,
        advance: u64,
        commit: bool,
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        collection::vec(
            (0u64..5_000, 0u64..5_000, 0u64..=secs(4), any::<bool>()).prop_map(
                |(min, spread, advance, commit)| Op {
                    min,
                    spread,
                    advance,
                    commit,
                },
            ),
            1..100,
        )
    }

    proptest! {
        // Grants always land in `[min, max]`, waits never exceed the time
        // the whole backlog needs to drain, usage never goes negative and
        // the running total accounts for every recorded unit.
        #[test]
        fn admission_is_sound(
            rate in 1u32..1_000_000,
            limit in 1u32..10_000_000,
            ops in ops()
        ) {
            let mut ledger = Ledger::new(nz(rate), nz(limit));
            let mut now: u64 = 0;
            let mut recorded: u64 = 0;

            for op in ops {
                now += op.advance;
                let max = op.min + op.spread;
                let granted = match ledger.reserve(now, op.min, max).unwrap() {
                    Admission::Ready(granted) => granted,
                    Admission::Wait { ticks, granted } => {
                        let backlog =
                            (ledger.used / ledger.rate * TICKS_PER_SECOND as f64).ceil() as u64;
                        prop_assert!(
                            ticks <= backlog,
                            "wait {ticks} exceeded full-drain bound {backlog}"
                        );
                        now += ticks;
                        granted
                    }
                };
                prop_assert!(granted >= op.min, "granted {granted} below minimum {}", op.min);
                prop_assert!(granted <= max, "granted {granted} above maximum {max}");
                if op.commit {
                    ledger.record(granted);
                    recorded += granted;
                }
                prop_assert!(ledger.used >= 0.0);
            }

            prop_assert_eq!(ledger.total, recorded);
        }

        // With no intervening records, decay lowers usage by exactly
        // rate * elapsed, floored at zero.
        #[test]
        fn conservation_under_decay(
            rate in 1u32..1_000_000,
            seed in 0u64..1_000_000,
            start in 0u64..=secs(1_000),
            delta in 0u64..=secs(1_000)
        ) {
            let mut ledger = Ledger::new(nz(rate), nz(1));
            ledger.record(seed);
            ledger.decay(start);
            let before = ledger.used;

            ledger.decay(start + delta);

            let expected =
                (before - f64::from(rate) * (delta as f64 / TICKS_PER_SECOND as f64)).max(0.0);
            let tolerance = 1e-9 * before.max(1.0);
            prop_assert!(
                (ledger.used - expected).abs() <= tolerance,
                "used {} drifted from expected {expected}",
                ledger.used
            );
        }

        // Flooring the stale available capacity cannot push a grant below
        // an integral minimum.
        #[test]
        fn grant_respects_bounds(available in 0u64..u32::MAX as u64, max in 0u64..u32::MAX as u64) {
            let g = grant(available as f64, max);
            prop_assert!(g <= max);
            prop_assert!(g <= available);
        }
    }
}
