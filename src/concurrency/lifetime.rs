// SPDX-License-Identifier: GPL-3.0-only

//! Hierarchical, idempotent resource disposal
//!
//! A [`Lifetime`] owns a set of [`Disposable`]s and optionally belongs to a
//! parent. Disposing a node disposes everything it owns exactly once,
//! including child lifetimes, and detaches the node from its parent so
//! long-lived parents do not accumulate dead children.

use super::lock_recover;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

/// Something that releases resources when disposed.
///
/// Implementations must tolerate being disposed more than once.
pub trait Disposable: Send + Sync {
    /// Release the resources held by this object
    fn dispose(&self);
}

/// Disposable backed by a closure, run at most once
struct DisposeFn {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Disposable for DisposeFn {
    fn dispose(&self) {
        let action = lock_recover(&self.action).take();
        if let Some(action) = action {
            action();
        }
    }
}

struct LifetimeState {
    disposed: bool,
    owned: Vec<Arc<dyn Disposable>>,
}

struct LifetimeInner {
    state: Mutex<LifetimeState>,
    parent: Option<Weak<LifetimeInner>>,
}

impl LifetimeInner {
    fn dispose_and_detach(self: &Arc<Self>) {
        let owned = {
            let mut state = lock_recover(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.owned)
        };

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.remove(self);
        }

        trace!(count = owned.len(), "Disposing lifetime");

        // Most recently added first, mirroring drop order of a scope.
        for disposable in owned.into_iter().rev() {
            disposable.dispose();
        }
    }

    fn remove(&self, child: &Arc<LifetimeInner>) {
        let child_ptr = Arc::as_ptr(child) as *const ();
        let mut state = lock_recover(&self.state);
        state
            .owned
            .retain(|owned| Arc::as_ptr(owned) as *const () != child_ptr);
    }
}

impl Disposable for LifetimeInner {
    fn dispose(&self) {
        // Children are registered with their parent as `Arc<LifetimeInner>`,
        // so this is only reached through the parent's owned list. The
        // parent has already let go of us, so no detach is needed.
        let owned = {
            let mut state = lock_recover(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.owned)
        };
        for disposable in owned.into_iter().rev() {
            disposable.dispose();
        }
    }
}

/// A node in a tree of disposal scopes.
///
/// Cloning a `Lifetime` yields another handle to the same node.
///
/// ```
/// use camera_lifecycle::concurrency::Lifetime;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let root = Lifetime::new();
/// let child = root.child();
/// let count = Arc::new(AtomicUsize::new(0));
/// let c = Arc::clone(&count);
/// child.add_fn(move || {
///     c.fetch_add(1, Ordering::SeqCst);
/// });
///
/// root.dispose();
/// root.dispose();
/// assert_eq!(count.load(Ordering::SeqCst), 1);
/// assert!(child.is_disposed());
/// ```
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<LifetimeInner>,
}

impl Lifetime {
    /// Create a new root lifetime
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LifetimeInner {
                state: Mutex::new(LifetimeState {
                    disposed: false,
                    owned: Vec::new(),
                }),
                parent: None,
            }),
        }
    }

    /// Create a lifetime owned by this one.
    ///
    /// If this lifetime is already disposed, the child is disposed
    /// immediately.
    pub fn child(&self) -> Lifetime {
        let child = Lifetime {
            inner: Arc::new(LifetimeInner {
                state: Mutex::new(LifetimeState {
                    disposed: false,
                    owned: Vec::new(),
                }),
                parent: Some(Arc::downgrade(&self.inner)),
            }),
        };
        self.add(Arc::clone(&child.inner));
        child
    }

    /// Register a disposable with this lifetime and return it unchanged.
    ///
    /// If the lifetime is already disposed, the disposable is disposed right
    /// away instead of being retained.
    pub fn add<T: Disposable + 'static>(&self, disposable: Arc<T>) -> Arc<T> {
        let dispose_now = {
            let mut state = lock_recover(&self.inner.state);
            if state.disposed {
                true
            } else {
                state.owned.push(disposable.clone() as Arc<dyn Disposable>);
                false
            }
        };

        if dispose_now {
            disposable.dispose();
        }
        disposable
    }

    /// Register a closure to run when this lifetime is disposed
    pub fn add_fn<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(Arc::new(DisposeFn {
            action: Mutex::new(Some(Box::new(action))),
        }));
    }

    /// Dispose this lifetime and everything it owns.
    ///
    /// Idempotent: only the first call has any effect.
    pub fn dispose(&self) {
        self.inner.dispose_and_detach();
    }

    /// Whether this lifetime has been disposed
    pub fn is_disposed(&self) -> bool {
        lock_recover(&self.inner.state).disposed
    }

    /// Number of disposables currently owned (including child lifetimes)
    pub fn owned_count(&self) -> usize {
        lock_recover(&self.inner.state).owned.len()
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for Lifetime {
    fn dispose(&self) {
        Lifetime::dispose(self);
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_recover(&self.inner.state);
        f.debug_struct("Lifetime")
            .field("disposed", &state.disposed)
            .field("owned", &state.owned.len())
            .finish()
    }
}
