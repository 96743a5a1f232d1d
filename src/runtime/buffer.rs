//! Device buffers.
//!
//! [`Buffer`] is a raw handle: dropping it does not free anything. Whoever
//! obtained it from [`BufferAllocator::allocate`] must hand it back through
//! [`BufferAllocator::deallocate`]. [`DeviceVec`] is the runtime's own
//! owning vector built on top of that pair.

use std::fmt;
use std::marker::PhantomData;
use std::mem;

use tracing::{debug, warn};

use super::backend::BufferId;
use super::context::Context;
use super::device::Device;
use super::queue::CommandQueue;
use super::{Result, RuntimeError};
use crate::element::Element;

/// Raw handle to a device allocation.
pub struct Buffer {
    id: BufferId,
    size: usize,
    device: Device,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("device", &self.device.id())
            .finish()
    }
}

/// Typed allocator for buffers of `T` in a context.
pub struct BufferAllocator<T> {
    context: Context,
    _elem: PhantomData<T>,
}

impl<T: Element> BufferAllocator<T> {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            _elem: PhantomData,
        }
    }

    /// Allocate room for `count` elements.
    pub fn allocate(&self, count: usize) -> Result<Buffer> {
        let bytes = byte_len::<T>(count)?;
        let device = self.context.device();
        let id = device.backend().allocate(bytes)?;
        Ok(Buffer {
            id,
            size: bytes,
            device: device.clone(),
        })
    }

    /// Return a buffer that held `count` elements.
    pub fn deallocate(&self, buffer: Buffer, count: usize) -> Result<()> {
        let expected = byte_len::<T>(count)?;
        if expected != buffer.size {
            warn!(
                buffer = buffer.id,
                expected,
                actual = buffer.size,
                "Deallocation size does not match allocation"
            );
        }
        buffer.device.backend().release(buffer.id)
    }
}

/// Bytes needed for `count` elements of `T`.
pub(crate) fn byte_len<T>(count: usize) -> Result<usize> {
    count
        .checked_mul(mem::size_of::<T>())
        .ok_or(RuntimeError::SizeOverflow {
            count,
            elem_size: mem::size_of::<T>(),
        })
}

/// A typed element range within a buffer: the `range` argument of the
/// transfer primitives.
pub struct BufferRange<'a, T> {
    buffer: &'a Buffer,
    offset: usize,
    len: usize,
    _elem: PhantomData<T>,
}

impl<'a, T: Element> BufferRange<'a, T> {
    /// Elements `[offset, offset + len)` of `buffer`.
    pub fn new(buffer: &'a Buffer, offset: usize, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
            _elem: PhantomData,
        }
    }

    /// Every whole element of `buffer`.
    pub fn whole(buffer: &'a Buffer) -> Self {
        Self::new(buffer, 0, buffer.size() / mem::size_of::<T>().max(1))
    }

    pub fn buffer(&self) -> &'a Buffer {
        self.buffer
    }

    /// Offset in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn byte_offset(&self) -> Result<usize> {
        byte_len::<T>(self.offset)
    }

    pub(crate) fn byte_len(&self) -> Result<usize> {
        byte_len::<T>(self.len)
    }
}

impl<T> Clone for BufferRange<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BufferRange<'_, T> {}

impl<T> fmt::Debug for BufferRange<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRange")
            .field("buffer", &self.buffer.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Owning vector of `T` in device memory.
///
/// Frees its buffer when dropped. An empty vector holds no buffer and no
/// context.
pub struct DeviceVec<T: Element> {
    buffer: Option<Buffer>,
    len: usize,
    context: Option<Context>,
    _elem: PhantomData<T>,
}

impl<T: Element> DeviceVec<T> {
    /// Empty vector, no allocation.
    pub fn new() -> Self {
        Self {
            buffer: None,
            len: 0,
            context: None,
            _elem: PhantomData,
        }
    }

    /// Uninitialized vector of `len` elements in `context`.
    pub fn with_len(len: usize, context: &Context) -> Result<Self> {
        let buffer = if len > 0 {
            Some(BufferAllocator::<T>::new(context).allocate(len)?)
        } else {
            None
        };
        Ok(Self {
            buffer,
            len,
            context: Some(context.clone()),
            _elem: PhantomData,
        })
    }

    /// Vector of `len` copies of `value`.
    ///
    /// The fill is enqueued on `queue` but not drained.
    pub fn with_value(len: usize, value: T, queue: &CommandQueue) -> Result<Self> {
        let vec = Self::with_len(len, queue.context())?;
        if let Some(range) = vec.as_range() {
            crate::transfer::fill(range, value, queue)?;
        }
        Ok(vec)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing buffer, `None` when empty.
    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// The whole vector as a transfer range, `None` when empty.
    pub fn as_range(&self) -> Option<BufferRange<'_, T>> {
        self.buffer
            .as_ref()
            .map(|buffer| BufferRange::new(buffer, 0, self.len))
    }
}

impl<T: Element> Default for DeviceVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Drop for DeviceVec<T> {
    fn drop(&mut self) {
        let (Some(buffer), Some(context)) = (self.buffer.take(), self.context.as_ref()) else {
            return;
        };
        let id = buffer.id();
        match BufferAllocator::<T>::new(context).deallocate(buffer, self.len) {
            Ok(()) => debug!(buffer = id, len = self.len, "Dropped device vector"),
            Err(err) => warn!(buffer = id, error = %err, "Failed to release device vector"),
        }
    }
}

impl<T: Element> fmt::Debug for DeviceVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceVec")
            .field("len", &self.len)
            .field("buffer", &self.buffer)
            .finish()
    }
}
