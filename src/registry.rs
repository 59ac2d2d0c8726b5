//! Device discovery and connect-with-retry.

use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::backend::{AccessMode, DeviceBackend, DeviceDescriptor};
use crate::config::RetryPolicy;
use crate::error::DeviceError;
use crate::session::DeviceSession;

/// How [`DeviceRegistry::connect`] opens a device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectOptions {
    /// Requested access mode.
    pub access: AccessMode,
    /// Retry schedule for transient handle/open failures.
    pub retry: RetryPolicy,
}

/// Enumerates devices on one backend.
#[derive(Debug)]
pub struct DeviceRegistry<B: DeviceBackend> {
    backend: Arc<B>,
}

impl<B: DeviceBackend> Clone for DeviceRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: DeviceBackend> DeviceRegistry<B> {
    /// Registry over `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// The backend sessions from this registry use.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// List reachable devices in enumeration order.
    ///
    /// An empty list is a normal result.
    pub fn discover(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let devices = self
            .backend
            .enumerate()
            .map_err(DeviceError::EnumerationFailed)?;
        if devices.is_empty() {
            warn!(backend = self.backend.name(), "no devices found");
        } else {
            info!(backend = self.backend.name(), count = devices.len(), "devices found");
            for device in &devices {
                info!(%device, "discovered");
            }
        }
        Ok(devices)
    }

    /// Descriptor at `index` in a fresh enumeration.
    pub fn descriptor(&self, index: u32) -> Result<DeviceDescriptor, DeviceError> {
        let devices = self.discover()?;
        let available = devices.len();
        devices
            .into_iter()
            .find(|d| d.index == index)
            .ok_or(DeviceError::NotFound { index, available })
    }

    /// A new `Uninitialized` session on this registry's backend.
    pub fn session(&self) -> DeviceSession<B> {
        DeviceSession::new(Arc::clone(&self.backend))
    }

    /// Connect to device `index` and start streaming.
    ///
    /// Handle-creation and open failures are retried per `options.retry`,
    /// re-enumerating before each attempt. Permission and call-order errors
    /// are returned immediately.
    pub fn connect(&self, index: u32, options: &ConnectOptions) -> Result<DeviceSession<B>, DeviceError> {
        let attempts = options.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let descriptor = self.descriptor(index)?;
            let mut session = self.session();
            match session.connect(&descriptor, options.access) {
                Ok(()) => return Ok(session),
                Err(err) => {
                    if let Err(teardown) = session.teardown() {
                        warn!(error = %teardown, "cleanup after failed connect reported errors");
                    }
                    let retryable = matches!(
                        err,
                        DeviceError::HandleCreateFailed(_) | DeviceError::OpenFailed(_)
                    );
                    if !retryable || attempt >= attempts {
                        return Err(err);
                    }
                    let delay = options.retry.backoff(attempt);
                    warn!(attempt, attempts, ?delay, error = %err, "connect failed, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeCall};
    use crate::backend::BackendError;
    use crate::session::SessionState;
    use std::time::Duration;

    fn fast_retry(attempts: u32) -> ConnectOptions {
        ConnectOptions {
            access: AccessMode::Exclusive,
            retry: RetryPolicy {
                attempts,
                initial_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                max_backoff: Duration::from_millis(1),
            },
        }
    }

    #[test]
    fn test_discover_with_no_devices_is_empty_success() {
        let registry = DeviceRegistry::new(Arc::new(FakeBackend::new()));
        let devices = registry.discover().expect("discover should succeed");
        assert!(devices.is_empty());
    }

    #[test]
    fn test_discover_enumeration_failure() {
        let backend = FakeBackend::with_default_devices();
        backend.fail_next(FakeCall::Enumerate, BackendError::LoadLibrary);
        let registry = DeviceRegistry::new(Arc::new(backend));
        let err = registry.discover().expect_err("discover must fail");
        assert!(matches!(err, DeviceError::EnumerationFailed(BackendError::LoadLibrary)));
    }

    #[test]
    fn test_descriptor_not_found() {
        let registry = DeviceRegistry::new(Arc::new(FakeBackend::with_default_devices()));
        let err = registry.descriptor(7).expect_err("index 7 does not exist");
        assert!(matches!(err, DeviceError::NotFound { index: 7, available: 2 }));
    }

    #[test]
    fn test_connect_streams() {
        let registry = DeviceRegistry::new(Arc::new(FakeBackend::with_default_devices()));
        let session = registry.connect(1, &fast_retry(1)).expect("connect should succeed");
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_connect_retries_transient_handle_failures() {
        let backend = FakeBackend::with_default_devices();
        backend.fail_times(FakeCall::CreateHandle, BackendError::Resource, 2);
        let registry = DeviceRegistry::new(Arc::new(backend.clone()));

        let session = registry.connect(0, &fast_retry(3)).expect("third attempt should succeed");
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(backend.calls(FakeCall::CreateHandle), 3);
        assert_eq!(backend.calls(FakeCall::Enumerate), 3);
    }

    #[test]
    fn test_connect_gives_up_after_configured_attempts() {
        let backend = FakeBackend::with_default_devices();
        backend.fail_times(FakeCall::Open, BackendError::Resource, 5);
        let registry = DeviceRegistry::new(Arc::new(backend.clone()));

        let err = registry.connect(0, &fast_retry(2)).expect_err("connect must fail");
        assert!(matches!(err, DeviceError::OpenFailed(_)));
        assert_eq!(backend.calls(FakeCall::Open), 2);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_connect_never_retries_permission_denied() {
        let backend = FakeBackend::with_default_devices();
        backend.fail_times(FakeCall::CreateHandle, BackendError::AccessDenied, 5);
        let registry = DeviceRegistry::new(Arc::new(backend.clone()));

        let err = registry.connect(0, &fast_retry(5)).expect_err("connect must fail");
        assert!(matches!(err, DeviceError::PermissionDenied { .. }));
        assert_eq!(backend.calls(FakeCall::CreateHandle), 1);
    }

    #[test]
    fn test_connect_never_retries_vendor_call_order() {
        let backend = FakeBackend::with_default_devices();
        backend.fail_times(FakeCall::CreateHandle, BackendError::CallOrder, 5);
        let registry = DeviceRegistry::new(Arc::new(backend.clone()));

        let err = registry.connect(0, &fast_retry(5)).expect_err("connect must fail");
        assert!(matches!(err, DeviceError::CallOrderViolation { .. }));
        assert_eq!(backend.calls(FakeCall::CreateHandle), 1);
    }
}
