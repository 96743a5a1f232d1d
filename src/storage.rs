//! Static selection of where container elements live.
//!
//! [`Matrix`](crate::matrix::Matrix) and [`Vector`](crate::vector::Vector)
//! take a storage tag parameter. [`Host`] keeps elements in a `Vec<T>`;
//! [`OnDevice`] keeps them in accelerator memory. The tag picks the backing
//! type at compile time, so there is no runtime branching on storage kind.

use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::element::Element;
use crate::runtime::{Buffer, BufferAllocator, BufferRange, Context, Device, DeviceVec, Result};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Host {}
    impl Sealed for super::OnDevice {}
}

/// Lifecycle classification of a container's backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationState {
    /// Zero extent, no buffer.
    Unallocated,
    /// Buffer allocated, contents undefined.
    Uninitialized,
    /// Every element has been written at least once.
    Initialized,
}

/// Operations every backing store offers.
pub trait ElementContainer {
    /// Number of elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> AllocationState;
}

/// A storage tag.
pub trait Storage: sealed::Sealed + 'static {
    /// Backing store of a matrix.
    type MatrixData<T: Element>: ElementContainer;
    /// Backing store of a vector.
    type VectorData<T: Element>: ElementContainer;

    const NAME: &'static str;
}

/// Elements live in host memory.
#[derive(Debug)]
pub enum Host {}

/// Elements live in accelerator memory.
#[derive(Debug)]
pub enum OnDevice {}

impl Storage for Host {
    type MatrixData<T: Element> = Vec<T>;
    type VectorData<T: Element> = Vec<T>;

    const NAME: &'static str = "host";
}

impl Storage for OnDevice {
    type MatrixData<T: Element> = DeviceAllocation<T>;
    type VectorData<T: Element> = DeviceVectorData<T>;

    const NAME: &'static str = "device";
}

impl<T> ElementContainer for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn state(&self) -> AllocationState {
        if Vec::is_empty(self) {
            AllocationState::Unallocated
        } else {
            AllocationState::Initialized
        }
    }
}

/// A raw device buffer owned by exactly one matrix.
///
/// Allocated with `len` elements and released with the same `len` on
/// drop. A zero-length allocation holds no buffer and releases nothing.
pub struct DeviceAllocation<T: Element> {
    buffer: Option<Buffer>,
    len: usize,
    device: Option<Device>,
    context: Option<Context>,
    initialized: bool,
    _elem: PhantomData<T>,
}

impl<T: Element> DeviceAllocation<T> {
    /// No device, no buffer.
    pub(crate) fn unallocated() -> Self {
        Self {
            buffer: None,
            len: 0,
            device: None,
            context: None,
            initialized: false,
            _elem: PhantomData,
        }
    }

    /// Allocate `len` elements in `context`.
    ///
    /// On failure nothing is recorded and nothing needs releasing.
    pub(crate) fn allocate(len: usize, context: &Context) -> Result<Self> {
        let buffer = if len > 0 {
            Some(BufferAllocator::<T>::new(context).allocate(len)?)
        } else {
            None
        };
        Ok(Self {
            buffer,
            len,
            device: Some(context.device().clone()),
            context: Some(context.clone()),
            initialized: false,
            _elem: PhantomData,
        })
    }

    pub(crate) fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub(crate) fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub(crate) fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub(crate) fn range(&self) -> Option<BufferRange<'_, T>> {
        self.buffer
            .as_ref()
            .map(|buffer| BufferRange::new(buffer, 0, self.len))
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }
}

impl<T: Element> ElementContainer for DeviceAllocation<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn state(&self) -> AllocationState {
        match (&self.buffer, self.initialized) {
            (None, _) => AllocationState::Unallocated,
            (Some(_), false) => AllocationState::Uninitialized,
            (Some(_), true) => AllocationState::Initialized,
        }
    }
}

impl<T: Element> Drop for DeviceAllocation<T> {
    fn drop(&mut self) {
        let (Some(buffer), Some(context)) = (self.buffer.take(), self.context.as_ref()) else {
            return;
        };
        let id = buffer.id();
        match BufferAllocator::<T>::new(context).deallocate(buffer, self.len) {
            Ok(()) => debug!(buffer = id, len = self.len, "Released matrix storage"),
            Err(err) => warn!(buffer = id, error = %err, "Failed to release matrix storage"),
        }
    }
}

impl<T: Element> fmt::Debug for DeviceAllocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("len", &self.len)
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}

/// The runtime's [`DeviceVec`] plus the device the vector is bound to.
///
/// The buffer belongs to the `DeviceVec`; releasing it is its job.
pub struct DeviceVectorData<T: Element> {
    vec: DeviceVec<T>,
    device: Option<Device>,
    initialized: bool,
}

impl<T: Element> DeviceVectorData<T> {
    pub(crate) fn unbound() -> Self {
        Self {
            vec: DeviceVec::new(),
            device: None,
            initialized: false,
        }
    }

    pub(crate) fn bind(vec: DeviceVec<T>, device: &Device) -> Self {
        Self {
            vec,
            device: Some(device.clone()),
            initialized: false,
        }
    }

    pub(crate) fn vec(&self) -> &DeviceVec<T> {
        &self.vec
    }

    pub(crate) fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }
}

impl<T: Element> ElementContainer for DeviceVectorData<T> {
    fn len(&self) -> usize {
        self.vec.len()
    }

    fn state(&self) -> AllocationState {
        match (self.vec.buffer(), self.initialized) {
            (None, _) => AllocationState::Unallocated,
            (Some(_), false) => AllocationState::Uninitialized,
            (Some(_), true) => AllocationState::Initialized,
        }
    }
}

impl<T: Element> fmt::Debug for DeviceVectorData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceVectorData")
            .field("len", &self.vec.len())
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::stub_devices;

    #[test]
    fn test_host_state() {
        assert_eq!(Vec::<f32>::new().state(), AllocationState::Unallocated);
        assert_eq!(vec![1.0f32].state(), AllocationState::Initialized);
    }

    #[test]
    fn test_allocation_lifecycle() {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));

        let mut alloc = DeviceAllocation::<f32>::allocate(8, &ctx).unwrap();
        assert_eq!(alloc.state(), AllocationState::Uninitialized);
        assert_eq!(alloc.device(), Some(ctx.device()));
        alloc.mark_initialized();
        assert_eq!(alloc.state(), AllocationState::Initialized);
        assert_eq!(ctx.device().memory_stats().bytes_in_use, 32);

        drop(alloc);
        assert_eq!(ctx.device().memory_stats().bytes_in_use, 0);
        assert_eq!(ctx.device().memory_stats().releases, 1);
    }

    #[test]
    fn test_zero_allocation_releases_nothing() {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));

        let alloc = DeviceAllocation::<f64>::allocate(0, &ctx).unwrap();
        assert_eq!(alloc.state(), AllocationState::Unallocated);
        drop(alloc);
        drop(DeviceAllocation::<f64>::unallocated());

        let stats = ctx.device().memory_stats();
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.releases, 0);
    }
}
