// SPDX-License-Identifier: GPL-3.0-only

//! Single-assignment future
//!
//! A [`FutureResult`] is resolved exactly once, with a value, an error, or a
//! cancellation. Consumers either block on [`get`](FutureResult::get) or
//! `.await` it.

use super::lock_recover;
use crate::errors::{LifecycleError, LifecycleResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

enum Slot<T> {
    Pending,
    Value(T),
    Failed(LifecycleError),
    Cancelled,
}

struct Shared<T> {
    slot: Mutex<(Slot<T>, Vec<Waker>)>,
    done: Condvar,
}

/// Handle to a single-assignment result.
///
/// Clones share the same slot; any clone may resolve it and any clone may
/// wait on it. The first writer wins and later writers get `false` back.
pub struct FutureResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> FutureResult<T> {
    /// Create an unresolved future
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new((Slot::Pending, Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    /// Create a future that is already resolved with `value`
    pub fn immediate(value: T) -> Self {
        let future = Self::new();
        future.set_value(value);
        future
    }

    /// Create a future that has already failed with `error`
    pub fn failed(error: impl Into<LifecycleError>) -> Self {
        let future = Self::new();
        future.set_exception(error);
        future
    }

    /// Resolve with a value. Returns `false` if already resolved.
    pub fn set_value(&self, value: T) -> bool {
        self.resolve(Slot::Value(value))
    }

    /// Resolve with an error. Returns `false` if already resolved.
    pub fn set_exception(&self, error: impl Into<LifecycleError>) -> bool {
        self.resolve(Slot::Failed(error.into()))
    }

    /// Mark as cancelled. Returns `false` if already resolved.
    pub fn set_cancelled(&self) -> bool {
        self.resolve(Slot::Cancelled)
    }

    /// Whether the future has been resolved in any way
    pub fn is_done(&self) -> bool {
        !matches!(lock_recover(&self.shared.slot).0, Slot::Pending)
    }

    /// Whether the future was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(lock_recover(&self.shared.slot).0, Slot::Cancelled)
    }

    fn resolve(&self, outcome: Slot<T>) -> bool {
        let wakers = {
            let mut slot = lock_recover(&self.shared.slot);
            if !matches!(slot.0, Slot::Pending) {
                return false;
            }
            slot.0 = outcome;
            std::mem::take(&mut slot.1)
        };

        self.shared.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> FutureResult<T> {
    /// Block until resolved
    pub fn get(&self) -> LifecycleResult<T> {
        let mut slot = lock_recover(&self.shared.slot);
        while matches!(slot.0, Slot::Pending) {
            slot = self
                .shared
                .done
                .wait(slot)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        Self::outcome(&slot.0)
    }

    /// Block until resolved or until `timeout` expires
    pub fn get_timeout(&self, timeout: Duration) -> LifecycleResult<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock_recover(&self.shared.slot);
        while matches!(slot.0, Slot::Pending) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::Timeout(timeout));
            }
            slot = self
                .shared
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        Self::outcome(&slot.0)
    }

    /// The value, if the future resolved successfully
    pub fn try_get(&self) -> Option<T> {
        match &lock_recover(&self.shared.slot).0 {
            Slot::Value(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn outcome(slot: &Slot<T>) -> LifecycleResult<T> {
        match slot {
            Slot::Value(value) => Ok(value.clone()),
            Slot::Failed(error) => Err(error.clone()),
            Slot::Cancelled => Err(LifecycleError::Cancelled),
            Slot::Pending => unreachable!("outcome read before resolution"),
        }
    }
}

impl<T: Clone> Future for FutureResult<T> {
    type Output = LifecycleResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = lock_recover(&self.shared.slot);
        if matches!(slot.0, Slot::Pending) {
            if !slot.1.iter().any(|waker| waker.will_wake(cx.waker())) {
                slot.1.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(Self::outcome(&slot.0))
    }
}

impl<T> Default for FutureResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FutureResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match lock_recover(&self.shared.slot).0 {
            Slot::Pending => "pending",
            Slot::Value(_) => "value",
            Slot::Failed(_) => "failed",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("FutureResult").field("state", &state).finish()
    }
}
