//! Allocation contexts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::device::Device;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct ContextInner {
    id: u64,
    device: Device,
}

/// Resource-ownership scope binding allocations and queues to a device.
///
/// Cloning shares the same context; equality is identity.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(device: &Device) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                device: device.clone(),
            }),
        }
    }

    /// The device this context allocates on.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .finish()
    }
}
