// SPDX-License-Identifier: GPL-3.0-only

//! A caller's pending request for an open device

use crate::concurrency::{Disposable, FutureResult, Lifetime};
use crate::errors::LifecycleError;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Couples the caller-facing future with a cancellation scope.
///
/// The request's lifetime is a child of the caller's lifetime. Disposing
/// either one cancels the future if it is still unresolved.
pub struct DeviceRequest<D> {
    id: Uuid,
    lifetime: Lifetime,
    future: FutureResult<D>,
}

impl<D: Send + 'static> DeviceRequest<D> {
    /// Create a request scoped to `caller_lifetime`
    pub fn new(caller_lifetime: &Lifetime) -> Arc<Self> {
        let id = Uuid::new_v4();
        let lifetime = caller_lifetime.child();
        let future = FutureResult::new();

        let cancel = future.clone();
        lifetime.add_fn(move || {
            if cancel.set_cancelled() {
                debug!(request = %id, "Device request cancelled");
            }
        });

        Arc::new(Self {
            id,
            lifetime,
            future,
        })
    }
}

impl<D> DeviceRequest<D> {
    /// Unique id, used for logging
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Scope of this request
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Caller-facing future
    pub fn future(&self) -> FutureResult<D> {
        self.future.clone()
    }

    /// Resolve the request with an open device.
    ///
    /// Returns `false` if the request was already resolved or cancelled.
    pub fn set(&self, device: D) -> bool {
        self.future.set_value(device)
    }

    /// Fail the request without closing it
    pub fn set_exception(&self, error: impl Into<LifecycleError>) -> bool {
        self.future.set_exception(error)
    }

    /// Close the request, cancelling the future if it is still pending
    pub fn close(&self) {
        self.lifetime.dispose();
    }

    /// Fail the request with `error`, then close it
    pub fn close_with_error(&self, error: impl Into<LifecycleError>) {
        self.future.set_exception(error);
        self.lifetime.dispose();
    }

    /// Whether the request's scope has ended
    pub fn is_closed(&self) -> bool {
        self.lifetime.is_disposed()
    }
}

impl<D: Send> Disposable for DeviceRequest<D> {
    fn dispose(&self) {
        self.close();
    }
}

impl<D> std::fmt::Debug for DeviceRequest<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRequest")
            .field("id", &self.id)
            .field("future", &self.future)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeviceError;

    #[test]
    fn test_closing_caller_lifetime_cancels() {
        let caller = Lifetime::new();
        let request: Arc<DeviceRequest<u32>> = DeviceRequest::new(&caller);
        let future = request.future();

        caller.dispose();

        assert!(request.is_closed());
        assert!(future.is_cancelled());
        assert!(!request.set(4));
    }

    #[test]
    fn test_close_after_resolution_keeps_value() {
        let caller = Lifetime::new();
        let request = DeviceRequest::new(&caller);
        assert!(request.set(9u32));

        request.close();
        assert_eq!(request.future().get(), Ok(9));
    }

    #[test]
    fn test_close_with_error() {
        let caller = Lifetime::new();
        let request: Arc<DeviceRequest<u32>> = DeviceRequest::new(&caller);
        request.close_with_error(DeviceError::OpenInterrupted);

        assert_eq!(
            request.future().get(),
            Err(LifecycleError::Device(DeviceError::OpenInterrupted))
        );
        // Closing the request does not end the caller's scope.
        assert!(!caller.is_disposed());
        assert_eq!(caller.owned_count(), 0);
    }
}
