//! [`DeviceBackend`] over the CUDA driver API via `cudarc`.
//!
//! Buffers are plain `CudaSlice<u8>` allocations on the context's default
//! stream. Every call synchronizes the stream before returning, matching
//! the synchronous contract of the trait. Fill, copy and swap are staged
//! through host memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cudarc::driver::sys::{CUdevice_attribute, CUresult};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DriverError};
use tracing::{debug, info};

use super::backend::{check_bounds, new_buffer_id, BufferId, DeviceBackend, MemoryStats};
use super::device::DeviceInfo;
use super::{Result, RuntimeError};

/// Number of CUDA devices visible to this process.
pub fn device_count() -> Result<usize> {
    let count = CudaContext::device_count().map_err(driver_error)?;
    Ok(usize::try_from(count).unwrap_or(0))
}

#[derive(Default)]
struct CudaMemory {
    buffers: HashMap<BufferId, CudaSlice<u8>>,
    bytes_in_use: usize,
    allocations: u64,
    releases: u64,
}

/// One CUDA device.
pub struct CudaBackend {
    info: DeviceInfo,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    memory: Mutex<CudaMemory>,
}

impl CudaBackend {
    pub fn new(ordinal: usize) -> Result<Self> {
        let context = CudaContext::new(ordinal).map_err(driver_error)?;
        let stream = context.default_stream();

        let name = context.name().map_err(driver_error)?;
        let compute_units = context
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map_err(driver_error)?;
        context.bind_to_thread().map_err(driver_error)?;
        let (_free, total) = cudarc::driver::result::mem_get_info().map_err(driver_error)?;

        let info = DeviceInfo {
            ordinal,
            name,
            total_memory: total,
            compute_units: u32::try_from(compute_units).unwrap_or(0),
        };
        info!(
            ordinal,
            name = %info.name,
            total_memory = info.total_memory,
            "CUDA device opened"
        );

        Ok(Self {
            info,
            context,
            stream,
            memory: Mutex::new(CudaMemory::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CudaMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slice<'a>(mem: &'a CudaMemory, buffer: BufferId) -> Result<&'a CudaSlice<u8>> {
        mem.buffers
            .get(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))
    }

    fn slice_mut<'a>(mem: &'a mut CudaMemory, buffer: BufferId) -> Result<&'a mut CudaSlice<u8>> {
        mem.buffers
            .get_mut(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))
    }

    fn read_locked(
        &self,
        mem: &CudaMemory,
        buffer: BufferId,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let slice = Self::slice(mem, buffer)?;
        check_bounds(offset, len, slice.len())?;
        let mut host = vec![0u8; len];
        if len > 0 {
            self.stream
                .memcpy_dtoh(&slice.slice(offset..offset + len), &mut host)
                .map_err(driver_error)?;
            self.stream.synchronize().map_err(driver_error)?;
        }
        Ok(host)
    }

    fn write_locked(
        &self,
        mem: &mut CudaMemory,
        buffer: BufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let slice = Self::slice_mut(mem, buffer)?;
        check_bounds(offset, data.len(), slice.len())?;
        if !data.is_empty() {
            let mut view = slice.slice_mut(offset..offset + data.len());
            self.stream.memcpy_htod(data, &mut view).map_err(driver_error)?;
            self.stream.synchronize().map_err(driver_error)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("info", &self.info)
            .field("ordinal", &self.context.ordinal())
            .finish()
    }
}

impl DeviceBackend for CudaBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, bytes: usize) -> Result<BufferId> {
        let slice = self.stream.alloc_zeros::<u8>(bytes).map_err(|err| {
            if err.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
                let available = cudarc::driver::result::mem_get_info()
                    .map(|(free, _)| free)
                    .unwrap_or(0);
                RuntimeError::OutOfMemory {
                    device: self.info.name.clone(),
                    requested: bytes,
                    available,
                }
            } else {
                driver_error(err)
            }
        })?;

        let id = new_buffer_id();
        let mut mem = self.lock();
        mem.buffers.insert(id, slice);
        mem.bytes_in_use += bytes;
        mem.allocations += 1;
        debug!(buffer = id, bytes, "CUDA buffer allocated");
        Ok(id)
    }

    fn release(&self, buffer: BufferId) -> Result<()> {
        let mut mem = self.lock();
        let slice = mem
            .buffers
            .remove(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))?;
        mem.bytes_in_use -= slice.len();
        mem.releases += 1;
        Ok(())
    }

    fn write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<()> {
        let mut mem = self.lock();
        self.write_locked(&mut mem, buffer, offset, data)
    }

    fn read(&self, buffer: BufferId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mem = self.lock();
        self.read_locked(&mem, buffer, offset, len)
    }

    fn fill(&self, buffer: BufferId, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() {
            return Ok(());
        }
        let host: Vec<u8> = pattern.iter().copied().cycle().take(len).collect();
        let mut mem = self.lock();
        self.write_locked(&mut mem, buffer, offset, &host)
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
        let staged = self.read_locked(&mem, src, src_offset, len)?;
        self.write_locked(&mut mem, dst, dst_offset, &staged)
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
        let from_a = self.read_locked(&mem, a, a_offset, len)?;
        let from_b = self.read_locked(&mem, b, b_offset, len)?;
        self.write_locked(&mut mem, a, a_offset, &from_b)?;
        self.write_locked(&mut mem, b, b_offset, &from_a)
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

fn driver_error(err: DriverError) -> RuntimeError {
    RuntimeError::Backend(err.to_string())
}
