// src/sync/semaphore.rs
//! Counting admission semaphore
//!
//! `acquire` never grants partially. `relaxed_acquire` grants whatever is
//! free (at least one unit) and hands the shortfall back to the caller, who
//! decides whether to retry for the remainder.
//!
//! Waiters are woken one at a time on release and re-check their condition;
//! wake order is unspecified and starvation of large requests is possible.
//!
//! Usage is published on the `vplatform_semaphore_used` gauge, labelled with
//! the semaphore's name.

use crate::observability::METRIC_SEMAPHORE_USED;
use crate::utils::errors::{PlatformError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// Counting gate with capacity `max`
pub struct Semaphore {
    /// Units currently in use
    used: Mutex<usize>,

    /// Signalled on every release
    cond: Condvar,

    /// Capacity
    max: usize,

    /// Metric label
    name: String,
}

impl Semaphore {
    /// Create a semaphore with `max` units of capacity
    pub fn new(max: usize) -> Self {
        Self::named("default", max)
    }

    /// Create a semaphore whose usage gauge is labelled `name`
    pub fn named(name: impl Into<String>, max: usize) -> Self {
        Self {
            used: Mutex::new(0),
            cond: Condvar::new(),
            max,
            name: name.into(),
        }
    }

    /// Block until `n` units are free, then take all of them
    ///
    /// Fails immediately when `n` exceeds the capacity, since such a request
    /// could never be satisfied.
    pub fn acquire(&self, n: usize) -> Result<()> {
        if n > self.max {
            return Err(PlatformError::CapacityExceeded(format!(
                "requested {} units from a semaphore of capacity {}",
                n, self.max
            )));
        }

        let mut used = self.used.lock();
        while n > self.max - *used {
            trace!("Waiting for {} units ({}/{} used)", n, *used, self.max);
            self.cond.wait(&mut used);
        }
        *used += n;
        self.record_usage(*used);
        Ok(())
    }

    /// Block until any unit is free, take up to `n`, return the shortfall
    ///
    /// A zero-capacity semaphore never has a free unit, so the whole request
    /// comes back as shortfall instead of blocking.
    pub fn relaxed_acquire(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        if self.max == 0 {
            warn!("Relaxed acquire of {} units on zero-capacity semaphore {}", n, self.name);
            return n;
        }

        let mut used = self.used.lock();
        while *used == self.max {
            trace!("Waiting for any free unit ({}/{} used)", *used, self.max);
            self.cond.wait(&mut used);
        }
        let taken = n.min(self.max - *used);
        *used += taken;
        self.record_usage(*used);
        n - taken
    }

    /// Take `n` units without blocking; returns whether they were granted
    pub fn try_acquire(&self, n: usize) -> bool {
        let mut used = self.used.lock();
        if n > self.max - *used {
            return false;
        }
        *used += n;
        self.record_usage(*used);
        true
    }

    /// Give back `n` units and wake one waiter
    ///
    /// Callers must release exactly what they acquired. Over-release is
    /// clamped at zero and logged.
    pub fn release(&self, n: usize) {
        let mut used = self.used.lock();
        if n > *used {
            warn!("Releasing {} units but only {} in use", n, *used);
            *used = 0;
        } else {
            *used -= n;
        }
        self.record_usage(*used);
        self.cond.notify_one();
    }

    /// Acquire `n` units, returned automatically when the permit drops
    pub fn permit(&self, n: usize) -> Result<SemaphorePermit<'_>> {
        self.acquire(n)?;
        Ok(SemaphorePermit {
            semaphore: self,
            units: n,
        })
    }

    /// Units currently in use
    pub fn used(&self) -> usize {
        *self.used.lock()
    }

    /// Units currently free
    pub fn available(&self) -> usize {
        self.max - *self.used.lock()
    }

    /// Capacity
    pub fn max(&self) -> usize {
        self.max
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record_usage(&self, used: usize) {
        metrics::gauge!(METRIC_SEMAPHORE_USED, "semaphore" => self.name.clone()).set(used as f64);
    }
}

/// RAII guard over acquired semaphore units
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
    units: usize,
}

impl SemaphorePermit<'_> {
    /// Units held by this permit
    pub fn units(&self) -> usize {
        self.units
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(self.units);
    }
}
