//! Run-wide bound on model calls in flight.
//!
//! Stage pools nest (a founder task fans out feedback or review calls), so
//! pool sizes alone do not bound concurrent model calls. Every call made
//! through [`LimitedProvider`] holds one slot of a shared [`CallLimiter`].

use std::sync::{Condvar, Mutex};

use anyhow::Result;

use crate::io::provider::Provider;

/// Counting semaphore over model calls.
pub struct CallLimiter {
    capacity: usize,
    active: Mutex<usize>,
    slot_free: Condvar,
}

impl CallLimiter {
    /// `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: Mutex::new(0),
            slot_free: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a slot is free. The slot is released when the permit drops.
    pub fn acquire(&self) -> CallPermit<'_> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        while *active >= self.capacity {
            active = self
                .slot_free
                .wait(active)
                .unwrap_or_else(|p| p.into_inner());
        }
        *active += 1;
        CallPermit { limiter: self }
    }

    fn release(&self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        *active = active.saturating_sub(1);
        self.slot_free.notify_one();
    }
}

/// One held slot of a [`CallLimiter`].
pub struct CallPermit<'l> {
    limiter: &'l CallLimiter,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// A provider whose every `generate` call holds a limiter slot.
pub struct LimitedProvider<'a> {
    pub inner: &'a dyn Provider,
    pub limiter: &'a CallLimiter,
}

impl Provider for LimitedProvider<'_> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn natively_structured(&self) -> bool {
        self.inner.natively_structured()
    }

    fn generate(&self, prompt: &str, system: &str) -> Result<String> {
        let _permit = self.limiter.acquire();
        self.inner.generate(prompt, system)
    }
}
