//! Host ↔ device transfer engine.
//!
//! The primitives here only *enqueue* work. Draining is the caller's job:
//! the containers in [`crate::matrix`] and [`crate::vector`] always follow
//! an enqueue with `queue.finish()`, which is what gives them their
//! synchronous contract. The one exception is [`copy_to_host`], which has
//! to wait for its read to land before it can write the host slice.
//!
//! The `assert_*` guards are the precondition checks shared by both
//! containers. They panic instead of returning an error. A mismatch is a
//! caller bug, and they run before anything is enqueued.

use tracing::debug;

use crate::element::Element;
use crate::runtime::{BufferRange, CommandQueue, Device, Result};

/// Panic unless a container bound to `bound` may be used through `queue`.
#[track_caller]
pub fn assert_affinity(bound: Option<&Device>, queue: &CommandQueue, what: &str) {
    match bound {
        Some(device) if device == queue.device() => {}
        Some(device) => panic!(
            "device mismatch: {what} is bound to {device} but the queue targets {}",
            queue.device()
        ),
        None => panic!(
            "device mismatch: {what} is not bound to a device but the queue targets {}",
            queue.device()
        ),
    }
}

/// Panic unless two extents match exactly.
#[track_caller]
pub fn assert_same_extent(lhs: (usize, usize), rhs: (usize, usize), what: &str) {
    assert!(
        lhs == rhs,
        "size mismatch: {what}: {}x{} vs {}x{}",
        lhs.0,
        lhs.1,
        rhs.0,
        rhs.1
    );
}

/// Enqueue a copy of `src` into `dst`.
///
/// # Panics
///
/// If `src` and `dst` differ in length.
pub fn copy_to_device<T: Element>(
    src: &[T],
    dst: BufferRange<'_, T>,
    queue: &CommandQueue,
) -> Result<()> {
    assert_eq!(src.len(), dst.len(), "size mismatch: host source vs device range");
    if src.is_empty() {
        return Ok(());
    }
    debug!(elements = src.len(), "Enqueue H2D copy");
    let bytes: &[u8] = bytemuck::cast_slice(src);
    queue.enqueue_write_buffer(dst.buffer(), dst.byte_offset()?, bytes.to_vec())
}

/// Copy `src` into `dst`, returning once the data has arrived.
///
/// # Panics
///
/// If `src` and `dst` differ in length.
pub fn copy_to_host<T: Element>(
    src: BufferRange<'_, T>,
    dst: &mut [T],
    queue: &CommandQueue,
) -> Result<()> {
    assert_eq!(src.len(), dst.len(), "size mismatch: device range vs host destination");
    if dst.is_empty() {
        return Ok(());
    }
    debug!(elements = dst.len(), "Enqueue D2H copy");
    let bytes = queue
        .enqueue_read_buffer(src.buffer(), src.byte_offset()?, src.byte_len()?)?
        .wait()?;
    bytemuck::cast_slice_mut::<T, u8>(dst).copy_from_slice(&bytes);
    Ok(())
}

/// Enqueue a fill of every element of `dst` with `value`.
pub fn fill<T: Element>(dst: BufferRange<'_, T>, value: T, queue: &CommandQueue) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    debug!(elements = dst.len(), "Enqueue fill");
    queue.enqueue_fill_buffer(
        dst.buffer(),
        bytemuck::bytes_of(&value),
        dst.byte_offset()?,
        dst.byte_len()?,
    )
}

/// Enqueue an element-wise exchange of two equally long ranges.
///
/// # Panics
///
/// If the ranges differ in length.
pub fn swap_ranges<T: Element>(
    a: BufferRange<'_, T>,
    b: BufferRange<'_, T>,
    queue: &CommandQueue,
) -> Result<()> {
    assert_eq!(a.len(), b.len(), "size mismatch: swap ranges");
    if a.is_empty() {
        return Ok(());
    }
    debug!(elements = a.len(), "Enqueue swap");
    queue.enqueue_swap_buffers(
        a.buffer(),
        a.byte_offset()?,
        b.buffer(),
        b.byte_offset()?,
        a.byte_len()?,
    )
}

/// Enqueue a device-side copy of `src` into `dst`.
///
/// # Panics
///
/// If the ranges differ in length.
pub fn copy_within_device<T: Element>(
    src: BufferRange<'_, T>,
    dst: BufferRange<'_, T>,
    queue: &CommandQueue,
) -> Result<()> {
    assert_eq!(src.len(), dst.len(), "size mismatch: device copy ranges");
    if src.is_empty() {
        return Ok(());
    }
    debug!(elements = src.len(), "Enqueue D2D copy");
    queue.enqueue_copy_buffer(
        src.buffer(),
        dst.buffer(),
        src.byte_offset()?,
        dst.byte_offset()?,
        src.byte_len()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::stub_devices;
    use crate::runtime::{BufferAllocator, Context};

    fn queue() -> CommandQueue {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));
        CommandQueue::for_context(&ctx).unwrap()
    }

    #[test]
    fn test_upload_download() {
        let queue = queue();
        let buffer = BufferAllocator::<i32>::new(queue.context()).allocate(4).unwrap();
        let range = BufferRange::<i32>::whole(&buffer);

        copy_to_device(&[1, 2, 3, 4], range, &queue).unwrap();
        let mut out = [0i32; 4];
        copy_to_host(range, &mut out, &queue).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_partial_ranges() {
        let queue = queue();
        let buffer = BufferAllocator::<f32>::new(queue.context()).allocate(6).unwrap();

        fill(BufferRange::new(&buffer, 0, 6), 0.0f32, &queue).unwrap();
        fill(BufferRange::new(&buffer, 2, 3), 9.0f32, &queue).unwrap();
        copy_within_device(
            BufferRange::<f32>::new(&buffer, 2, 1),
            BufferRange::new(&buffer, 5, 1),
            &queue,
        )
        .unwrap();
        queue.finish().unwrap();

        let mut out = [0.0f32; 6];
        copy_to_host(BufferRange::whole(&buffer), &mut out, &queue).unwrap();
        assert_eq!(out, [0.0, 0.0, 9.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_swap_ranges() {
        let queue = queue();
        let alloc = BufferAllocator::<u32>::new(queue.context());
        let a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(3).unwrap();

        copy_to_device(&[1, 2, 3], BufferRange::whole(&a), &queue).unwrap();
        copy_to_device(&[7, 8, 9], BufferRange::whole(&b), &queue).unwrap();
        swap_ranges(BufferRange::<u32>::whole(&a), BufferRange::whole(&b), &queue).unwrap();

        let mut out = [0u32; 3];
        copy_to_host(BufferRange::whole(&a), &mut out, &queue).unwrap();
        assert_eq!(out, [7, 8, 9]);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_length_mismatch_panics() {
        let queue = queue();
        let buffer = BufferAllocator::<f32>::new(queue.context()).allocate(4).unwrap();
        let _ = copy_to_device(&[1.0f32; 3], BufferRange::whole(&buffer), &queue);
    }

    #[test]
    #[should_panic(expected = "device mismatch")]
    fn test_affinity_guard() {
        let queue = queue();
        let other = Device::emulated(stub_devices().remove(1));
        assert_affinity(Some(&other), &queue, "matrix");
    }
}
