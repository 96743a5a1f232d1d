//! Accelerator runtime handles consumed by the device containers.
//!
//! - [`device`]: device descriptions, identity handles and platform discovery
//! - [`backend`]: the per-device driver seam and the emulated (host-memory) device
//! - [`context`]: allocation scopes bound to a device
//! - [`queue`]: in-order command queues executed on a worker thread
//! - [`buffer`]: raw buffer handles, the typed allocator and [`DeviceVec`]
//! - `cuda` (feature `cuda`): the same seam over `cudarc`
//!
//! Nothing in here decides *when* to synchronize; the containers in
//! [`crate::matrix`] and [`crate::vector`] own that policy.

pub mod backend;
pub mod buffer;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod queue;

use thiserror::Error;

pub use backend::{BufferId, DeviceBackend, EmulatedBackend, MemoryStats};
pub use buffer::{Buffer, BufferAllocator, BufferRange, DeviceVec};
pub use context::Context;
pub use device::{Device, DeviceId, DeviceInfo, Platform};
pub use queue::{CommandQueue, PendingRead, TransferStats};

/// Errors raised by the runtime: allocation, enqueue and drain failures.
///
/// `Clone` so that a failure recorded by the queue worker can be handed
/// both to a waiting read and to the next `finish()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("No accelerator device available")]
    NoDevice,

    #[error("Out of device memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: String,
        requested: usize,
        available: usize,
    },

    #[error("Requested size overflows: {count} elements of {elem_size} bytes")]
    SizeOverflow { count: usize, elem_size: usize },

    #[error("Matrix extent {rows}x{cols} overflows")]
    ExtentOverflow { rows: usize, cols: usize },

    #[error("Buffer {0} is not allocated on this device")]
    InvalidBuffer(BufferId),

    #[error("Access out of bounds: offset {offset} + len {len} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Device mismatch: buffer on {buffer_device}, queue on {queue_device}")]
    DeviceMismatch {
        buffer_device: String,
        queue_device: String,
    },

    #[error("Device command failed: {0}")]
    CommandFailed(String),

    #[error("Command queue closed")]
    QueueClosed,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RuntimeError>;
