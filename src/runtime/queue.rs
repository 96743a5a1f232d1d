//! In-order command queues.
//!
//! Each queue owns a worker thread that executes submitted commands one at
//! a time, in submission order, against the device backend. `enqueue_*`
//! calls return as soon as the command is queued; [`CommandQueue::finish`]
//! blocks until everything submitted before it has executed.
//!
//! There is no timeout anywhere in here. A command that never completes
//! stalls `finish()` forever.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::backend::{check_bounds, BufferId, DeviceBackend};
use super::buffer::Buffer;
use super::context::Context;
use super::device::Device;
use super::{Result, RuntimeError};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(0);

/// A command executed by the queue worker.
enum Command {
    Write {
        buffer: BufferId,
        offset: usize,
        data: Vec<u8>,
    },
    Read {
        buffer: BufferId,
        offset: usize,
        len: usize,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Fill {
        buffer: BufferId,
        offset: usize,
        len: usize,
        pattern: Vec<u8>,
    },
    Copy {
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    },
    Swap {
        a: BufferId,
        a_offset: usize,
        b: BufferId,
        b_offset: usize,
        len: usize,
    },
    /// Completes once every earlier command has run; carries the first
    /// failure since the previous marker.
    Marker {
        reply: oneshot::Sender<Option<RuntimeError>>,
    },
}

/// Snapshot of the traffic submitted through a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub total_h2d_bytes: u64,
    pub total_d2h_bytes: u64,
    pub total_h2d_transfers: u64,
    pub total_d2h_transfers: u64,
    pub total_fills: u64,
    pub total_copies: u64,
    pub total_swaps: u64,
    pub total_drains: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    h2d_bytes: AtomicU64,
    d2h_bytes: AtomicU64,
    h2d_transfers: AtomicU64,
    d2h_transfers: AtomicU64,
    fills: AtomicU64,
    copies: AtomicU64,
    swaps: AtomicU64,
    drains: AtomicU64,
}

/// Handle to an enqueued device→host read.
#[must_use = "the read result is only available through `wait`"]
pub struct PendingRead {
    rx: oneshot::Receiver<Result<Vec<u8>>>,
}

impl PendingRead {
    /// Block until the read has executed and return its bytes.
    ///
    /// The queue is in order, so every command enqueued before the read
    /// has also completed when this returns.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx.blocking_recv().map_err(|_| RuntimeError::QueueClosed)?
    }
}

/// An in-order queue bound to one context/device pair.
pub struct CommandQueue {
    id: u64,
    context: Context,
    device: Device,
    sender: Option<mpsc::UnboundedSender<Command>>,
    worker: Option<JoinHandle<()>>,
    stats: StatCounters,
}

impl CommandQueue {
    /// Create a queue for `device` within `context`.
    pub fn new(context: &Context, device: &Device) -> Result<Self> {
        if context.device() != device {
            return Err(RuntimeError::DeviceMismatch {
                buffer_device: context.device().to_string(),
                queue_device: device.to_string(),
            });
        }

        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let backend = Arc::clone(device.backend());
        let worker = std::thread::Builder::new()
            .name(format!("accel-queue-{id}"))
            .spawn(move || run_worker(backend, receiver))
            .map_err(|e| RuntimeError::Backend(format!("spawning queue worker: {e}")))?;

        debug!(queue = id, device = %device, "Created command queue");

        Ok(Self {
            id,
            context: context.clone(),
            device: device.clone(),
            sender: Some(sender),
            worker: Some(worker),
            stats: StatCounters::default(),
        })
    }

    /// Create a queue on the device of `context`.
    pub fn for_context(context: &Context) -> Result<Self> {
        Self::new(context, context.device())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Enqueue a host→device copy of `data` into `buffer` at `offset` bytes.
    pub fn enqueue_write_buffer(
        &self,
        buffer: &Buffer,
        offset: usize,
        data: Vec<u8>,
    ) -> Result<()> {
        self.check_buffer(buffer, offset, data.len())?;
        let len = data.len() as u64;
        self.submit(Command::Write {
            buffer: buffer.id(),
            offset,
            data,
        })?;
        self.stats.h2d_bytes.fetch_add(len, Ordering::Relaxed);
        self.stats.h2d_transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a device→host read of `len` bytes.
    pub fn enqueue_read_buffer(
        &self,
        buffer: &Buffer,
        offset: usize,
        len: usize,
    ) -> Result<PendingRead> {
        self.check_buffer(buffer, offset, len)?;
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Read {
            buffer: buffer.id(),
            offset,
            len,
            reply,
        })?;
        self.stats.d2h_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.stats.d2h_transfers.fetch_add(1, Ordering::Relaxed);
        Ok(PendingRead { rx })
    }

    /// Enqueue a fill of `len` bytes with a repeated `pattern`.
    pub fn enqueue_fill_buffer(
        &self,
        buffer: &Buffer,
        pattern: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_buffer(buffer, offset, len)?;
        if !pattern.is_empty() && len % pattern.len() != 0 {
            return Err(RuntimeError::CommandFailed(format!(
                "fill length {len} is not a multiple of pattern size {}",
                pattern.len()
            )));
        }
        self.submit(Command::Fill {
            buffer: buffer.id(),
            offset,
            len,
            pattern: pattern.to_vec(),
        })?;
        self.stats.fills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a device-side copy between two buffers.
    pub fn enqueue_copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_buffer(src, src_offset, len)?;
        self.check_buffer(dst, dst_offset, len)?;
        self.submit(Command::Copy {
            src: src.id(),
            src_offset,
            dst: dst.id(),
            dst_offset,
            len,
        })?;
        self.stats.copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue an exchange of `len` bytes between two buffer ranges.
    pub fn enqueue_swap_buffers(
        &self,
        a: &Buffer,
        a_offset: usize,
        b: &Buffer,
        b_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.check_buffer(a, a_offset, len)?;
        self.check_buffer(b, b_offset, len)?;
        self.submit(Command::Swap {
            a: a.id(),
            a_offset,
            b: b.id(),
            b_offset,
            len,
        })?;
        self.stats.swaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block until every command submitted so far has executed.
    ///
    /// Returns the first command failure since the previous drain.
    pub fn finish(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Marker { reply })?;
        self.stats.drains.fetch_add(1, Ordering::Relaxed);

        let failure = rx.blocking_recv().map_err(|_| RuntimeError::QueueClosed)?;
        debug!(queue = self.id, ok = failure.is_none(), "Queue drained");
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Traffic submitted through this queue.
    pub fn stats(&self) -> TransferStats {
        let s = &self.stats;
        TransferStats {
            total_h2d_bytes: s.h2d_bytes.load(Ordering::Relaxed),
            total_d2h_bytes: s.d2h_bytes.load(Ordering::Relaxed),
            total_h2d_transfers: s.h2d_transfers.load(Ordering::Relaxed),
            total_d2h_transfers: s.d2h_transfers.load(Ordering::Relaxed),
            total_fills: s.fills.load(Ordering::Relaxed),
            total_copies: s.copies.load(Ordering::Relaxed),
            total_swaps: s.swaps.load(Ordering::Relaxed),
            total_drains: s.drains.load(Ordering::Relaxed),
        }
    }

    fn check_buffer(&self, buffer: &Buffer, offset: usize, len: usize) -> Result<()> {
        if buffer.device() != &self.device {
            return Err(RuntimeError::DeviceMismatch {
                buffer_device: buffer.device().to_string(),
                queue_device: self.device.to_string(),
            });
        }
        check_bounds(offset, len, buffer.size())
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or(RuntimeError::QueueClosed)?
            .send(command)
            .map_err(|_| RuntimeError::QueueClosed)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker run out the remaining commands.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(queue = self.id, "Queue worker panicked");
            }
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}

fn run_worker(backend: Arc<dyn DeviceBackend>, mut receiver: mpsc::UnboundedReceiver<Command>) {
    let mut first_failure: Option<RuntimeError> = None;

    while let Some(command) = receiver.blocking_recv() {
        let outcome = match command {
            Command::Write {
                buffer,
                offset,
                data,
            } => backend.write(buffer, offset, &data),
            Command::Read {
                buffer,
                offset,
                len,
                reply,
            } => {
                // Read failures go to the reader, not to the next drain.
                let _ = reply.send(backend.read(buffer, offset, len));
                Ok(())
            }
            Command::Fill {
                buffer,
                offset,
                len,
                pattern,
            } => backend.fill(buffer, offset, len, &pattern),
            Command::Copy {
                src,
                src_offset,
                dst,
                dst_offset,
                len,
            } => backend.copy(src, src_offset, dst, dst_offset, len),
            Command::Swap {
                a,
                a_offset,
                b,
                b_offset,
                len,
            } => backend.swap(a, a_offset, b, b_offset, len),
            Command::Marker { reply } => {
                let _ = reply.send(first_failure.take());
                continue;
            }
        };

        if let Err(err) = outcome {
            warn!(error = %err, "Device command failed");
            first_failure.get_or_insert(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::EmulatedBackend;
    use crate::runtime::buffer::BufferAllocator;
    use crate::runtime::device::stub_devices;

    fn setup() -> (Arc<EmulatedBackend>, Context, CommandQueue) {
        let backend = Arc::new(EmulatedBackend::new(stub_devices().remove(0)));
        let device = Device::new(backend.clone());
        let context = Context::new(&device);
        let queue = CommandQueue::new(&context, &device).unwrap();
        (backend, context, queue)
    }

    #[test]
    fn test_commands_execute_in_order() {
        let (_backend, context, queue) = setup();
        let buffer = BufferAllocator::<u8>::new(&context).allocate(4).unwrap();

        queue.enqueue_fill_buffer(&buffer, &[7], 0, 4).unwrap();
        queue.enqueue_write_buffer(&buffer, 1, vec![1, 2]).unwrap();
        let read = queue.enqueue_read_buffer(&buffer, 0, 4).unwrap();

        assert_eq!(read.wait().unwrap(), vec![7, 1, 2, 7]);
        queue.finish().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_fills, 1);
        assert_eq!(stats.total_h2d_bytes, 2);
        assert_eq!(stats.total_d2h_bytes, 4);
        assert_eq!(stats.total_drains, 1);
    }

    #[test]
    fn test_failure_surfaces_on_finish_once() {
        let (backend, context, queue) = setup();
        let buffer = BufferAllocator::<u8>::new(&context).allocate(4).unwrap();

        backend.inject_fault("device lost");
        queue.enqueue_fill_buffer(&buffer, &[1], 0, 4).unwrap();
        assert_eq!(
            queue.finish(),
            Err(RuntimeError::CommandFailed("device lost".to_string()))
        );

        // The failure was reported; the next drain is clean.
        queue.finish().unwrap();
    }

    #[test]
    fn test_enqueue_rejects_foreign_buffer() {
        let (_backend, _context, queue) = setup();
        let other = Device::emulated(stub_devices().remove(1));
        let other_ctx = Context::new(&other);
        let buffer = BufferAllocator::<u8>::new(&other_ctx).allocate(4).unwrap();

        assert!(matches!(
            queue.enqueue_fill_buffer(&buffer, &[0], 0, 4),
            Err(RuntimeError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn test_enqueue_rejects_out_of_bounds() {
        let (_backend, context, queue) = setup();
        let buffer = BufferAllocator::<u8>::new(&context).allocate(4).unwrap();

        assert!(matches!(
            queue.enqueue_write_buffer(&buffer, 2, vec![0; 4]),
            Err(RuntimeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_queue_requires_context_device() {
        let (_backend, context, _queue) = setup();
        let other = Device::emulated(stub_devices().remove(1));
        assert!(CommandQueue::new(&context, &other).is_err());
    }
}
