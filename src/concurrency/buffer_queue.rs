// SPDX-License-Identifier: GPL-3.0-only

//! Closable producer/consumer queue
//!
//! Unlike a plain channel, closing can happen from either side, and every
//! value that is pushed but never popped is handed to an "unused element"
//! callback so managed resources are not leaked in the queue.

use super::lock_recover;
use crate::errors::{LifecycleError, LifecycleResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Callback receiving values that were pushed but never consumed
pub type UnusedElementFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Queue slot: a value or the end-of-stream marker
enum Entry<T> {
    Value(T),
    Closed,
}

/// Thread-safe, closable blocking queue.
///
/// After [`close`](Self::close) a closed marker always sits in the queue, so
/// threads already blocked in [`pop`](Self::pop) and any later callers see
/// [`LifecycleError::QueueClosed`] instead of hanging.
pub struct BufferQueue<T> {
    entries: Mutex<VecDeque<Entry<T>>>,
    available: Condvar,
    closed: AtomicBool,
    unused: UnusedElementFn<T>,
}

impl<T> BufferQueue<T> {
    /// Create a queue that silently drops unused elements
    pub fn new() -> Self {
        Self::with_unused_handler(|_| {})
    }

    /// Create a queue that routes unused elements to `handler`
    pub fn with_unused_handler<F>(handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            unused: Box::new(handler),
        }
    }

    /// Push a value.
    ///
    /// Never fails: once the queue is closed the value goes straight to the
    /// unused element handler.
    pub fn push(&self, value: T) {
        let rejected = {
            let mut entries = lock_recover(&self.entries);
            if self.closed.load(Ordering::SeqCst) {
                Some(value)
            } else {
                entries.push_back(Entry::Value(value));
                None
            }
        };

        match rejected {
            Some(value) => (self.unused)(value),
            None => self.available.notify_one(),
        }
    }

    /// Block until a value is available or the queue is closed
    pub fn pop(&self) -> LifecycleResult<T> {
        let mut entries = lock_recover(&self.entries);
        loop {
            if let Some(entry) = entries.pop_front() {
                return Self::take_entry(&mut entries, entry);
            }
            entries = self
                .available
                .wait(entries)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until a value is available, the queue is closed, or `timeout`
    /// expires
    pub fn pop_timeout(&self, timeout: Duration) -> LifecycleResult<T> {
        let deadline = Instant::now() + timeout;
        let mut entries = lock_recover(&self.entries);
        loop {
            if let Some(entry) = entries.pop_front() {
                return Self::take_entry(&mut entries, entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::Timeout(timeout));
            }
            entries = self
                .available
                .wait_timeout(entries, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    /// Remove one pending value without blocking, routing it to the unused
    /// element handler. Does nothing if the queue is empty or closed.
    pub fn drop_next(&self) {
        let discarded = {
            let mut entries = lock_recover(&self.entries);
            match entries.pop_front() {
                Some(Entry::Value(value)) => Some(value),
                Some(Entry::Closed) => {
                    entries.push_front(Entry::Closed);
                    None
                }
                None => None,
            }
        };

        if let Some(value) = discarded {
            (self.unused)(value);
        }
    }

    /// Close the queue.
    ///
    /// Pending values are drained to the unused element handler and every
    /// waiting consumer is woken. Idempotent.
    pub fn close(&self) {
        let remaining = {
            let mut entries = lock_recover(&self.entries);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let remaining: Vec<T> = entries
                .drain(..)
                .filter_map(|entry| match entry {
                    Entry::Value(value) => Some(value),
                    Entry::Closed => None,
                })
                .collect();
            entries.push_back(Entry::Closed);
            remaining
        };

        self.available.notify_all();

        for value in remaining {
            (self.unused)(value);
        }
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of values waiting to be consumed
    pub fn len(&self) -> usize {
        lock_recover(&self.entries)
            .iter()
            .filter(|entry| matches!(entry, Entry::Value(_)))
            .count()
    }

    /// Whether no values are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_entry(entries: &mut VecDeque<Entry<T>>, entry: Entry<T>) -> LifecycleResult<T> {
        match entry {
            Entry::Value(value) => Ok(value),
            Entry::Closed => {
                // The marker goes back so the next consumer sees it too.
                entries.push_front(Entry::Closed);
                Err(LifecycleError::QueueClosed)
            }
        }
    }
}

impl<T: Clone> BufferQueue<T> {
    /// Copy of the next value, without removing it.
    ///
    /// Returns `None` if the queue is empty or closed.
    pub fn peek(&self) -> Option<T> {
        match lock_recover(&self.entries).front() {
            Some(Entry::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BufferQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("pending", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
