//! Dense vectors on the host or on an accelerator.
//!
//! The device flavour is layered over the runtime's [`DeviceVec`], which
//! owns and releases the buffer; the vector records the device it is bound
//! to alongside. Device operations that take a queue are synchronous, as
//! for [`Matrix`](crate::matrix::Matrix).

use std::fmt;
use std::ops::{Index, IndexMut};

use tracing::debug;

use crate::element::Element;
use crate::runtime::{BufferRange, CommandQueue, Context, Device, DeviceVec, Result};
use crate::storage::{AllocationState, DeviceVectorData, ElementContainer, Host, OnDevice, Storage};
use crate::transfer;

/// A dense vector of `T` with storage `S`.
pub struct Vector<T: Element, S: Storage = Host> {
    data: S::VectorData<T>,
}

/// A vector in host memory.
pub type HostVector<T> = Vector<T, Host>;

/// A vector in device memory.
pub type DeviceVector<T> = Vector<T, OnDevice>;

impl<T: Element, S: Storage> Vector<T, S> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn state(&self) -> AllocationState {
        self.data.state()
    }
}

// ─── Host ──────────────────────────────────────────────────────────────────

impl<T: Element> Vector<T, Host> {
    /// Zero-filled vector.
    pub fn new(len: usize) -> Self {
        Self::from_elem(len, <T as bytemuck::Zeroable>::zeroed())
    }

    pub fn from_elem(len: usize, value: T) -> Self {
        Self {
            data: vec![value; len],
        }
    }

    pub fn from_vec(data: Vec<T>) -> Self {
        Self { data }
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        self.data.get(i)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Element> Index<usize> for Vector<T, Host> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        &self.data[i]
    }
}

impl<T: Element> IndexMut<usize> for Vector<T, Host> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        &mut self.data[i]
    }
}

impl<T: Element> From<Vec<T>> for Vector<T, Host> {
    fn from(data: Vec<T>) -> Self {
        Self::from_vec(data)
    }
}

impl<T: Element> FromIterator<T> for Vector<T, Host> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<T: Element> Clone for Vector<T, Host> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Element> PartialEq for Vector<T, Host> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T: Element> Default for Vector<T, Host> {
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

// ─── Device ────────────────────────────────────────────────────────────────

impl<T: Element> Vector<T, OnDevice> {
    /// An empty vector bound to no device. Allocates nothing.
    pub fn empty() -> Self {
        Self {
            data: DeviceVectorData::unbound(),
        }
    }

    /// Allocate an uninitialized vector of `len` elements in `context`.
    pub fn new(len: usize, context: &Context) -> Result<Self> {
        let vec = DeviceVec::with_len(len, context)?;
        debug!(len, device = %context.device(), "Created device vector");
        Ok(Self {
            data: DeviceVectorData::bind(vec, context.device()),
        })
    }

    /// Allocate `len` elements on the queue's device, all equal to `value`.
    /// Blocks until the fill has completed.
    pub fn from_elem(len: usize, value: T, queue: &CommandQueue) -> Result<Self> {
        let vec = DeviceVec::with_value(len, value, queue)?;
        queue.finish()?;
        let mut data = DeviceVectorData::bind(vec, queue.device());
        data.mark_initialized();
        Ok(Self { data })
    }

    /// Allocate a vector of `host`'s length on the queue's device and copy
    /// `host` into it.
    pub fn from_host(host: &HostVector<T>, queue: &CommandQueue) -> Result<Self> {
        let mut v = Self::new(host.len(), queue.context())?;
        v.copy_from_host(host, queue)?;
        Ok(v)
    }

    /// Overwrite this vector with the contents of `host`.
    ///
    /// # Panics
    ///
    /// If this vector is not bound to the queue's device, or the lengths differ.
    pub fn copy_from_host(&mut self, host: &HostVector<T>, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device vector");
        assert_same_len(self.len(), host.len(), "copy_from_host");

        if let Some(range) = self.as_range() {
            transfer::copy_to_device(host.as_slice(), range, queue)?;
        }
        queue.finish()?;
        self.data.mark_initialized();
        Ok(())
    }

    /// Copy this vector into `host`.
    ///
    /// # Panics
    ///
    /// If this vector is not bound to the queue's device, or the lengths differ.
    pub fn copy_to_host(&self, host: &mut HostVector<T>, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device vector");
        assert_same_len(self.len(), host.len(), "copy_to_host");

        if let Some(range) = self.as_range() {
            transfer::copy_to_host(range, host.as_mut_slice(), queue)?;
        }
        queue.finish()
    }

    /// Copy this vector into a new host vector of the same length.
    pub fn to_host_vector(&self, queue: &CommandQueue) -> Result<HostVector<T>> {
        let mut host = HostVector::new(self.len());
        self.copy_to_host(&mut host, queue)?;
        Ok(host)
    }

    /// Set every element to `value`.
    ///
    /// # Panics
    ///
    /// If this vector is not bound to the queue's device.
    pub fn fill(&mut self, value: T, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device vector");

        if let Some(range) = self.as_range() {
            transfer::fill(range, value, queue)?;
        }
        queue.finish()?;
        self.data.mark_initialized();
        Ok(())
    }

    /// Exchange the contents of two vectors element by element.
    ///
    /// # Panics
    ///
    /// If the lengths differ, or either vector is not bound to the queue's device.
    pub fn swap(&mut self, other: &mut Self, queue: &CommandQueue) -> Result<()> {
        assert_same_len(self.len(), other.len(), "swap");
        transfer::assert_affinity(self.device(), queue, "device vector");
        transfer::assert_affinity(other.device(), queue, "other device vector");

        if let (Some(a), Some(b)) = (self.as_range(), other.as_range()) {
            transfer::swap_ranges(a, b, queue)?;
        }
        queue.finish()
    }

    /// Allocate a new vector on the queue's device holding a copy of this one.
    ///
    /// # Panics
    ///
    /// If this vector is not bound to the queue's device.
    pub fn duplicate(&self, queue: &CommandQueue) -> Result<Self> {
        transfer::assert_affinity(self.device(), queue, "device vector");

        let mut copy = Self::new(self.len(), queue.context())?;
        if let (Some(src), Some(dst)) = (self.as_range(), copy.as_range()) {
            transfer::copy_within_device(src, dst, queue)?;
        }
        queue.finish()?;
        if self.data.is_initialized() {
            copy.data.mark_initialized();
        }
        Ok(copy)
    }

    /// The device this vector is bound to; `None` for [`Vector::empty`].
    pub fn device(&self) -> Option<&Device> {
        self.data.device()
    }

    pub fn context(&self) -> Option<&Context> {
        self.data.vec().context()
    }

    /// The runtime vector holding the elements, for kernels enqueued
    /// directly against this vector.
    pub fn device_vec(&self) -> &DeviceVec<T> {
        self.data.vec()
    }

    pub fn as_range(&self) -> Option<BufferRange<'_, T>> {
        self.data.vec().as_range()
    }
}

impl<T: Element> Default for Vector<T, OnDevice> {
    fn default() -> Self {
        Self::empty()
    }
}

#[track_caller]
fn assert_same_len(lhs: usize, rhs: usize, what: &str) {
    transfer::assert_same_extent((lhs, 1), (rhs, 1), what);
}

impl<T: Element, S: Storage> fmt::Debug for Vector<T, S>
where
    S::VectorData<T>: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vector")
            .field("storage", &S::NAME)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::stub_devices;

    fn queue() -> CommandQueue {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));
        CommandQueue::for_context(&ctx).unwrap()
    }

    #[test]
    fn test_host_vector_basics() {
        let v: HostVector<i64> = (0..4).collect();
        assert_eq!(v.len(), 4);
        assert_eq!(v[3], 3);
        assert_eq!(v.get(4), None);
        assert_eq!(HostVector::<f32>::new(2).as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn test_states() {
        let queue = queue();

        let empty = DeviceVector::<f32>::empty();
        assert_eq!(empty.state(), AllocationState::Unallocated);
        assert!(empty.device().is_none());

        let v = DeviceVector::<f32>::new(3, queue.context()).unwrap();
        assert_eq!(v.state(), AllocationState::Uninitialized);

        let w = DeviceVector::from_elem(3, 1.0f32, &queue).unwrap();
        assert_eq!(w.state(), AllocationState::Initialized);
        assert_eq!(w.device(), Some(queue.device()));
    }

    #[test]
    fn test_half_precision() {
        use half::f16;

        let queue = queue();
        let host: HostVector<f16> = [1.0f32, 2.5, -3.0].iter().map(|&x| f16::from_f32(x)).collect();

        let dev = DeviceVector::from_host(&host, &queue).unwrap();
        assert_eq!(dev.to_host_vector(&queue).unwrap(), host);
    }

    #[test]
    fn test_duplicate() {
        let queue = queue();
        let a = DeviceVector::from_host(&HostVector::from_vec(vec![1u64, 2, 3]), &queue).unwrap();
        let b = a.duplicate(&queue).unwrap();
        assert_eq!(b.to_host_vector(&queue).unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(queue.context().device().memory_stats().live_buffers, 2);
    }
}
