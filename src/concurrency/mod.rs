// SPDX-License-Identifier: GPL-3.0-only

//! Generic asynchronous primitives used by the device lifecycle
//!
//! ```text
//! ┌──────────────┐   owns    ┌──────────────┐
//! │   Lifetime   │ ────────► │  Disposable  │  ← requests, handler threads,
//! └──────┬───────┘           └──────────────┘    child lifetimes
//!        │ child
//!        ▼
//! ┌──────────────┐
//! │   Lifetime   │
//! └──────────────┘
//!
//! RefCounted<T>   shared payload, disposed when the last reference goes
//! BufferQueue<T>  closable producer/consumer channel
//! FutureResult<T> single-assignment result (blocking get or .await)
//! ```
//!
//! Every type here guards its state with one mutex and never calls out to
//! foreign code (disposables, callbacks) while holding it.

mod buffer_queue;
mod future_result;
mod lifetime;
mod ref_count;

pub use buffer_queue::BufferQueue;
pub use future_result::FutureResult;
pub use lifetime::{Disposable, Lifetime};
pub use ref_count::RefCounted;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if another thread panicked while
/// holding it.
///
/// All state guarded in this crate is updated atomically per critical
/// section, so the data behind a poisoned lock is still consistent.
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
