//! Per-device driver seam.
//!
//! [`DeviceBackend`] is the minimum a driver must offer for the containers:
//! raw byte buffers plus write/read/fill/copy/swap. Every call is
//! synchronous from the backend's point of view; asynchrony comes from the
//! command queue worker that issues them.
//!
//! [`EmulatedBackend`] keeps buffers in host memory under a fixed capacity
//! budget, so out-of-memory and release accounting behave like a real card.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::device::DeviceInfo;
use super::{Result, RuntimeError};

/// Opaque buffer identifier, unique per process.
pub type BufferId = u64;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique buffer ID.
pub(crate) fn new_buffer_id() -> BufferId {
    NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Memory accounting snapshot for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Capacity in bytes.
    pub capacity: usize,
    /// Bytes currently allocated.
    pub bytes_in_use: usize,
    /// Buffers currently alive.
    pub live_buffers: usize,
    /// Successful allocation calls since creation.
    pub allocations: u64,
    /// Successful releases since creation.
    pub releases: u64,
}

impl MemoryStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_in_use as f64 / self.capacity as f64
    }
}

/// Driver interface for one device.
pub trait DeviceBackend: fmt::Debug + Send + Sync {
    /// Static device description.
    fn info(&self) -> &DeviceInfo;

    /// Allocate `bytes` of device memory.
    fn allocate(&self, bytes: usize) -> Result<BufferId>;

    /// Release a buffer. Releasing an unknown buffer is an error.
    fn release(&self, buffer: BufferId) -> Result<()>;

    /// Copy host bytes into `buffer` at `offset`.
    fn write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()>;

    /// Read `len` bytes from `buffer` at `offset`.
    fn read(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Repeat `pattern` over `len` bytes starting at `offset`.
    /// `len` is a multiple of `pattern.len()`.
    fn fill(&self, buffer: BufferId, offset: usize, len: usize, pattern: &[u8]) -> Result<()>;

    /// Copy `len` bytes between two buffers on this device.
    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Exchange `len` bytes between two ranges on this device.
    fn swap(
        &self,
        a: BufferId,
        a_offset: usize,
        b: BufferId,
        b_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Memory accounting snapshot.
    fn memory_stats(&self) -> MemoryStats;
}

/// Emulated device state.
#[derive(Debug, Default)]
struct EmulatedMemory {
    buffers: HashMap<BufferId, Vec<u8>>,
    bytes_in_use: usize,
    allocations: u64,
    releases: u64,
    /// One-shot fault for the next command.
    pending_fault: Option<String>,
}

impl EmulatedMemory {
    fn take_fault(&mut self) -> Result<()> {
        match self.pending_fault.take() {
            Some(msg) => Err(RuntimeError::CommandFailed(msg)),
            None => Ok(()),
        }
    }

    fn range_mut(&mut self, buffer: BufferId, offset: usize, len: usize) -> Result<&mut [u8]> {
        let data = self
            .buffers
            .get_mut(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))?;
        check_bounds(offset, len, data.len())?;
        Ok(&mut data[offset..offset + len])
    }

    fn range(&self, buffer: BufferId, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self
            .buffers
            .get(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))?;
        check_bounds(offset, len, data.len())?;
        Ok(&data[offset..offset + len])
    }
}

pub(crate) fn check_bounds(offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RuntimeError::OutOfBounds { offset, len, size }),
    }
}

/// Host-memory device with a fixed capacity.
#[derive(Debug)]
pub struct EmulatedBackend {
    info: DeviceInfo,
    memory: Mutex<EmulatedMemory>,
}

impl EmulatedBackend {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            memory: Mutex::new(EmulatedMemory::default()),
        }
    }

    /// Make the next executed command fail with `message`.
    pub fn inject_fault(&self, message: impl Into<String>) {
        self.lock().pending_fault = Some(message.into());
    }

    fn lock(&self) -> MutexGuard<'_, EmulatedMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceBackend for EmulatedBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let mut mem = self.lock();
        let available = self.info.total_memory.saturating_sub(mem.bytes_in_use);
        if bytes > available {
            return Err(RuntimeError::OutOfMemory {
                device: self.info.name.clone(),
                requested: bytes,
                available,
            });
        }

        let id = new_buffer_id();
        mem.buffers.insert(id, vec![0u8; bytes]);
        mem.bytes_in_use += bytes;
        mem.allocations += 1;
        debug!(device = self.info.ordinal, buffer = id, bytes, "Allocated device buffer");
        Ok(id)
    }

    fn release(&self, buffer: BufferId) -> Result<()> {
        let mut mem = self.lock();
        let data = mem
            .buffers
            .remove(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))?;
        mem.releases += 1;
        mem.bytes_in_use = mem.bytes_in_use.saturating_sub(data.len());
        debug!(
            device = self.info.ordinal,
            buffer,
            bytes = data.len(),
            "Released device buffer"
        );
        Ok(())
    }

    fn write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        let mut mem = self.lock();
        mem.take_fault()?;
        mem.range_mut(buffer, offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn read(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut mem = self.lock();
        mem.take_fault()?;
        Ok(mem.range(buffer, offset, len)?.to_vec())
    }

    fn fill(&self, buffer: BufferId, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        let mut mem = self.lock();
        mem.take_fault()?;
        let dst = mem.range_mut(buffer, offset, len)?;
        if pattern.is_empty() {
            return Ok(());
        }
        for chunk in dst.chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        let mut mem = self.lock();
        mem.take_fault()?;
        let staged = mem.range(src, src_offset, len)?.to_vec();
        mem.range_mut(dst, dst_offset, len)?.copy_from_slice(&staged);
        Ok(())
    }

    fn swap(
        &self,
        a: BufferId,
        a_offset: usize,
        b: BufferId,
        b_offset: usize,
        len: usize,
    ) -> Result<()> {
        let mut mem = self.lock();
        mem.take_fault()?;
        let staged_a = mem.range(a, a_offset, len)?.to_vec();
        let staged_b = mem.range(b, b_offset, len)?.to_vec();
        mem.range_mut(a, a_offset, len)?.copy_from_slice(&staged_b);
        mem.range_mut(b, b_offset, len)?.copy_from_slice(&staged_a);
        Ok(())
    }

    fn memory_stats(&self) -> MemoryStats {
        let mem = self.lock();
        MemoryStats {
            capacity: self.info.total_memory,
            bytes_in_use: mem.bytes_in_use,
            live_buffers: mem.buffers.len(),
            allocations: mem.allocations,
            releases: mem.releases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(capacity: usize) -> EmulatedBackend {
        EmulatedBackend::new(DeviceInfo {
            ordinal: 0,
            name: "test".to_string(),
            total_memory: capacity,
            compute_units: 1,
        })
    }

    #[test]
    fn test_allocate_and_release() {
        let dev = backend(4096);

        let a = dev.allocate(1024).unwrap();
        let b = dev.allocate(3072).unwrap();
        assert_eq!(dev.memory_stats().bytes_in_use, 4096);

        // Device is full.
        assert!(matches!(
            dev.allocate(1),
            Err(RuntimeError::OutOfMemory { available: 0, .. })
        ));

        dev.release(a).unwrap();
        assert_eq!(dev.memory_stats().live_buffers, 1);
        dev.allocate(512).unwrap();

        dev.release(b).unwrap();
        assert_eq!(dev.release(b), Err(RuntimeError::InvalidBuffer(b)));

        // The rejected double release is not counted.
        let stats = dev.memory_stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.releases, 2);
    }

    #[test]
    fn test_utilization() {
        let dev = backend(4096);
        assert_eq!(dev.memory_stats().utilization(), 0.0);

        dev.allocate(2048).unwrap();
        assert!((dev.memory_stats().utilization() - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_fill_copy_swap() {
        let dev = backend(1024);
        let a = dev.allocate(8).unwrap();
        let b = dev.allocate(8).unwrap();

        dev.fill(a, 0, 8, &[1, 2]).unwrap();
        assert_eq!(dev.read(a, 0, 8).unwrap(), vec![1, 2, 1, 2, 1, 2, 1, 2]);

        dev.write(b, 4, &[9, 9, 9, 9]).unwrap();
        dev.swap(a, 0, b, 0, 8).unwrap();
        assert_eq!(dev.read(a, 0, 8).unwrap(), vec![0, 0, 0, 0, 9, 9, 9, 9]);
        assert_eq!(dev.read(b, 0, 8).unwrap(), vec![1, 2, 1, 2, 1, 2, 1, 2]);

        dev.copy(b, 0, a, 2, 4).unwrap();
        assert_eq!(dev.read(a, 0, 8).unwrap(), vec![0, 0, 1, 2, 1, 2, 9, 9]);
    }

    #[test]
    fn test_out_of_bounds() {
        let dev = backend(1024);
        let a = dev.allocate(8).unwrap();
        assert_eq!(
            dev.read(a, 4, 8),
            Err(RuntimeError::OutOfBounds {
                offset: 4,
                len: 8,
                size: 8
            })
        );
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let dev = backend(1024);
        let a = dev.allocate(4).unwrap();

        dev.inject_fault("ECC error");
        assert_eq!(
            dev.write(a, 0, &[1, 2, 3, 4]),
            Err(RuntimeError::CommandFailed("ECC error".to_string()))
        );
        dev.write(a, 0, &[1, 2, 3, 4]).unwrap();
    }
}
