//! The unlimited throttle
//!
//! Grants every request instantly and in full while keeping the same
//! running total as the bucket, so a stream wrapper can be built uniformly
//! whether or not a limit was configured.

use crate::{Admission, Error};

#[derive(Debug, Default, Clone, Copy)]
/// A capacity source with no capacity ceiling. Never waits.
pub struct Unlimited {
    total: u64,
}

impl Unlimited {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reserve(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        if min > max {
            return Err(Error::Bounds { min, max });
        }
        Ok(max)
    }

    pub(crate) fn commit(&mut self, min: u64, max: u64) -> Result<u64, Error> {
        let granted = self.reserve(min, max)?;
        self.record(granted);
        Ok(granted)
    }

    pub(crate) fn record(&mut self, amount: u64) {
        self.total = self.total.saturating_add(amount);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn admit(&mut self, min: u64, max: u64) -> Result<Admission, Error> {
        self.reserve(min, max).map(Admission::Ready)
    }
}
