//! Single-flight guard shared by the periodic loops.
//!
//! Both the publish-check worker and the generation scheduler take a guard
//! before doing work; an overlapping tick sees the flag held and skips.
//! Correctness never depends on this (the store's atomic claims do that);
//! it only stops redundant work from piling up behind a slow tick.

use std::sync::atomic::{AtomicBool, Ordering};

pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Returns a guard if no other flight is in progress. The flag is
    /// released when the guard drops.
    pub fn try_enter(&self) -> Option<FlightGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightGuard { flag: &self.busy })
        } else {
            None
        }
    }
}

pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_enter_is_rejected_until_release() {
        let flight = SingleFlight::new();
        let guard = flight.try_enter();
        assert!(guard.is_some());
        assert!(flight.try_enter().is_none());
        drop(guard);
        assert!(flight.try_enter().is_some());
    }
}
