//! The trickle throttle mechanism
//!
//! This library supplies the capacity sources that pace byte-stream I/O for
//! the rest of the trickle project. A capacity source answers two questions:
//! "may I move this many units now, and if not, how long must I wait?" and
//! "please account for units that already moved." Two sources exist: a
//! [`LeakyBucket`] that enforces a sustained rate with a bounded burst, and
//! an [`Unlimited`] source that grants everything instantly while keeping
//! the same accounting. Both are reached through the [`Throttle`] enum so
//! that callers need not branch on whether a limit is configured.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use tokio::time::{self, Duration, Instant};

pub mod bucket;
pub mod unlimited;

pub use bucket::LeakyBucket;
pub use unlimited::Unlimited;

/// The number of clock ticks in one second. A tick is one microsecond.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of a throttle.
#[serde(rename_all = "snake_case")]
pub enum Config {
    /// A throttle that grants every request immediately and in full.
    Unlimited,
    /// A throttle that paces admission to a fixed rate with a bounded burst.
    Bucket {
        /// Sustained rate in units per second.
        rate: NonZeroU32,
        /// Burst capacity in units. Defaults to half a second of traffic at
        /// `rate`, floored at one unit.
        #[serde(default)]
        burst: Option<NonZeroU32>,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self::Unlimited
    }
}

/// Errors produced by [`Throttle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested minimum exceeds the requested maximum.
    #[error("minimum request {min} exceeds maximum {max}")]
    Bounds {
        /// The requested minimum amount.
        min: u64,
        /// The requested maximum amount.
        max: u64,
    },
}

/// Outcome of a non-waiting admission request, see [`Throttle::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request is admitted now for the contained number of units.
    Ready(u64),
    /// The caller must wait before the request is admitted.
    Wait {
        /// Ticks the caller must wait.
        ticks: u64,
        /// Units admitted once the wait has elapsed. No re-check is
        /// performed after the wait; the grant stands.
        granted: u64,
    },
}

#[async_trait]
/// The `Clock` used for every throttle
///
/// Both the tick source and the wait primitives are substitutable so that
/// tests can run against deterministic time. The bucket arithmetic is
/// defined once; only the wait primitive differs between the cooperative
/// and the thread-blocking execution models.
pub trait Clock {
    /// The number of ticks elapsed since the clock was created
    fn ticks_elapsed(&self) -> u64;
    /// Suspend the calling task for `ticks` amount of time
    async fn wait(&self, ticks: u64);
    /// Block the calling thread for `ticks` amount of time
    fn wait_blocking(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of ticks since `Clock` was created.
    ///
    /// # Panics
    ///
    /// Function will panic if the number of ticks elapsed is greater than u64::MAX.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let now = Instant::now();
        let ticks_since: u128 = now.duration_since(self.start).as_micros();
        assert!(
            ticks_since <= u128::from(u64::MAX),
            "584,554 years elapsed since last call!"
        );
        ticks_since as u64
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }

    fn wait_blocking(&self, ticks: u64) {
        std::thread::sleep(Duration::from_micros(ticks));
    }
}

/// The throttle mechanism
///
/// One instance governs one direction of one stream. State mutations are
/// not internally synchronized; drive a given throttle from a single
/// logical flow.
#[derive(Debug)]
pub enum Throttle<C = RealClock> {
    /// Admission is governed by a leaky bucket with respect to the clock.
    Bucket(LeakyBucket<C>),
    /// Admission is unconditional; only accounting is performed.
    Unlimited(Unlimited),
}

impl Throttle<RealClock> {
    /// Create a new instance of `Throttle` with a real-time clock
    #[must_use]
    pub fn new_with_config(config: Config) -> Self {
        match config {
            Config::Bucket { rate, burst } => Throttle::Bucket(LeakyBucket::with_clock(
                rate,
                burst.unwrap_or_else(|| default_burst(rate)),
                RealClock::default(),
            )),
            Config::Unlimited => Throttle::Unlimited(Unlimited::new()),
        }
    }
}

impl<C> Throttle<C> {
    /// Create a throttle that never waits, for the "no limit configured"
    /// case.
    #[must_use]
    pub fn unlimited() -> Self {
        Throttle::Unlimited(Unlimited::new())
    }
}

/// Half a second of traffic at `rate`, floored at one unit.
fn default_burst(rate: NonZeroU32) -> NonZeroU32 {
    NonZeroU32::new(rate.get() / 2).unwrap_or(NonZeroU32::MIN)
}

impl<C> Throttle<C>
where
    C: Clock,
{
    /// Create a throttle around a leaky bucket driven by the given clock.
    pub fn bucket_with_clock(rate: NonZeroU32, burst: Option<NonZeroU32>, clock: C) -> Self {
        Throttle::Bucket(LeakyBucket::with_clock(
            rate,
            burst.unwrap_or_else(|| default_burst(rate)),
            clock,
        ))
    }

    /// Reserve between `min` and `max` units, blocking the calling thread
    /// until at least `min` units are free. Nothing is recorded; pair with
    /// [`Throttle::record`] once the actual transferred amount is known.
    ///
    /// # Errors
    ///
    /// Returns an error if `min` exceeds `max`.
    pub fn blocking_reserve(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self {
            Throttle::Bucket(inner) => inner.blocking_reserve(min, max),
            Throttle::Unlimited(inner) => inner.reserve(min, max),
        }
    }

    /// Block the calling thread until outstanding usage has fully drained.
    pub fn blocking_drain(&mut self) {
        match self {
            Throttle::Bucket(inner) => inner.blocking_drain(),
            Throttle::Unlimited(_) => (),
        }
    }

    /// Reserve between `min` and `max` units, blocking as needed, and
    /// immediately record the granted amount as used.
    ///
    /// # Errors
    ///
    /// Returns an error if `min` exceeds `max`.
    pub fn blocking_commit(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self {
            Throttle::Bucket(inner) => inner.blocking_commit(min, max),
            Throttle::Unlimited(inner) => inner.commit(min, max),
        }
    }

    /// Record usage of an amount that has already been consumed. Never
    /// waits and performs no capacity check; outstanding usage may
    /// transiently exceed the burst limit until the next admission decays
    /// and waits it back down.
    pub fn record(&mut self, amount: u64) {
        match self {
            Throttle::Bucket(inner) => inner.record(amount),
            Throttle::Unlimited(inner) => inner.record(amount),
        }
    }

    /// All units ever recorded against this throttle.
    #[must_use]
    pub fn total(&self) -> u64 {
        match self {
            Throttle::Bucket(inner) => inner.total(),
            Throttle::Unlimited(inner) => inner.total(),
        }
    }

    /// Whether this throttle admits everything unconditionally.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Throttle::Unlimited(_))
    }

    /// The non-waiting admission request, for callers that enforce waits
    /// themselves (poll-driven adapters). A returned [`Admission::Wait`]
    /// obliges the caller to wait the given ticks, after which the grant
    /// stands without re-checking.
    ///
    /// # Errors
    ///
    /// Returns an error if `min` exceeds `max`.
    pub fn admit(&mut self, min: u64, max: u64) -> Result<Admission, Error> {
        match self {
            Throttle::Bucket(inner) => inner.admit(min, max),
            Throttle::Unlimited(inner) => inner.admit(min, max),
        }
    }

    /// Ticks until outstanding usage has fully drained, zero for an empty
    /// bucket or an unlimited throttle. The caller enforces the wait.
    pub fn drain_ticks(&mut self) -> u64 {
        match self {
            Throttle::Bucket(inner) => inner.drain_ticks(),
            Throttle::Unlimited(_) => 0,
        }
    }
}

impl<C> Throttle<C>
where
    C: Clock + Send + Sync,
{
    /// Reserve between `min` and `max` units, suspending the calling task
    /// until at least `min` units are free. Nothing is recorded; pair with
    /// [`Throttle::record`] once the actual transferred amount is known.
    ///
    /// # Errors
    ///
    /// Returns an error if `min` exceeds `max`.
    pub async fn reserve(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self {
            Throttle::Bucket(inner) => inner.reserve(min, max).await,
            Throttle::Unlimited(inner) => inner.reserve(min, max),
        }
    }

    /// Suspend the calling task until outstanding usage has fully drained.
    pub async fn drain(&mut self) {
        match self {
            Throttle::Bucket(inner) => inner.drain().await,
            Throttle::Unlimited(_) => (),
        }
    }

    /// Reserve between `min` and `max` units, suspending as needed, and
    /// immediately record the granted amount as used.
    ///
    /// # Errors
    ///
    /// Returns an error if `min` exceeds `max`.
    pub async fn commit(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        match self {
            Throttle::Bucket(inner) => inner.commit(min, max).await,
            Throttle::Unlimited(inner) => inner.commit(min, max),
        }
    }
}
