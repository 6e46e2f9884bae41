//! Exclusive access to the serial link.
//!
//! The controller sits on one serial line that both the control loop and
//! the job worker need. [`DeviceArbiter::with_device_link`] serializes every
//! conversation: lock, open, run the closure, close, unlock. The link is
//! closed on every exit path, including a panic inside the closure.

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::{ProtocolClient, ProtocolError, ProtocolResult};

/// A physical (or simulated) connection to the controller.
pub trait DeviceLink: Send {
    fn open(&mut self, device: &str) -> ProtocolResult<()>;
    fn close(&mut self);
    fn protocol(&mut self) -> &mut dyn ProtocolClient;
}

pub struct DeviceArbiter {
    device: String,
    link: Mutex<Box<dyn DeviceLink>>,
}

/// Closes the link when dropped, so unwinding out of the closure still
/// leaves the line closed before the mutex guard is released.
struct OpenLink<'a>(&'a mut Box<dyn DeviceLink>);

impl Drop for OpenLink<'_> {
    fn drop(&mut self) {
        self.0.close();
        debug!("device link closed");
    }
}

impl DeviceArbiter {
    pub fn new(device: impl Into<String>, link: Box<dyn DeviceLink>) -> Self {
        Self {
            device: device.into(),
            link: Mutex::new(link),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Run `f` with the link opened and held exclusively.
    ///
    /// If the link cannot be opened the lock is released and `f` is never
    /// called. No retry happens here; callers decide.
    pub async fn with_device_link<T, F>(&self, f: F) -> ProtocolResult<T>
    where
        F: FnOnce(&mut dyn ProtocolClient) -> T,
    {
        let mut guard = self.link.lock().await;

        if let Err(e) = guard.open(&self.device) {
            warn!(device = %self.device, error = %e, "device link open failed");
            return Err(e);
        }
        debug!(device = %self.device, "device link opened");

        let mut open = OpenLink(&mut *guard);
        let client = open.0.protocol();
        // Serial I/O blocks; hand the worker thread's other tasks off while
        // it runs. A current-thread runtime has nobody to hand them to.
        let out = match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| f(client)),
            _ => f(client),
        };
        Ok(out)
    }

    /// [`with_device_link`](Self::with_device_link) for closures that
    /// already return a protocol result.
    pub async fn request<T, F>(&self, f: F) -> ProtocolResult<T>
    where
        F: FnOnce(&mut dyn ProtocolClient) -> ProtocolResult<T>,
    {
        self.with_device_link(f).await.and_then(|r| r)
    }
}

impl std::fmt::Debug for DeviceArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArbiter")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Map an open failure for callers that only have the device name.
pub fn open_error(device: &str, reason: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Open {
        device: device.to_string(),
        reason: reason.to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
