// SPDX-License-Identifier: GPL-3.0-only

//! Reference-counted wrapper that disposes its payload exactly once

use super::{Disposable, lock_recover};
use crate::errors::{LifecycleError, LifecycleResult};
use std::sync::Mutex;
use tracing::trace;

struct CountState {
    count: usize,
    disposed: bool,
}

/// Shares a disposable payload between several holders.
///
/// The count starts at one for the creator. Every holder that calls
/// [`add_ref`](Self::add_ref) must later call [`dispose`](Self::dispose);
/// the call that brings the count to zero disposes the payload.
pub struct RefCounted<T: Disposable> {
    payload: T,
    state: Mutex<CountState>,
}

impl<T: Disposable> RefCounted<T> {
    /// Wrap a payload with a reference count of one
    pub fn new(payload: T) -> Self {
        Self::with_count(payload, 1)
    }

    /// Wrap a payload with an explicit initial count (clamped to at least one)
    pub fn with_count(payload: T, count: usize) -> Self {
        Self {
            payload,
            state: Mutex::new(CountState {
                count: count.max(1),
                disposed: false,
            }),
        }
    }

    /// Take another reference to the payload.
    ///
    /// Fails with [`LifecycleError::Disposed`] once the payload is gone.
    pub fn add_ref(&self) -> LifecycleResult<()> {
        let mut state = lock_recover(&self.state);
        if state.disposed {
            return Err(LifecycleError::Disposed);
        }
        state.count += 1;
        trace!(count = state.count, "Reference added");
        Ok(())
    }

    /// The wrapped payload.
    ///
    /// Only meaningful while the caller holds a reference.
    pub fn get(&self) -> &T {
        &self.payload
    }

    /// Current number of outstanding references
    pub fn ref_count(&self) -> usize {
        lock_recover(&self.state).count
    }

    /// Whether the payload has been disposed
    pub fn is_disposed(&self) -> bool {
        lock_recover(&self.state).disposed
    }
}

impl<T: Disposable> Disposable for RefCounted<T> {
    /// Release one reference. Once the payload is disposed further calls do
    /// nothing.
    fn dispose(&self) {
        {
            let mut state = lock_recover(&self.state);
            if state.disposed {
                return;
            }
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            state.disposed = true;
        }

        trace!("Last reference released, disposing payload");
        self.payload.dispose();
    }
}
