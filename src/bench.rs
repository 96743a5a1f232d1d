//! Transfer-engine timing harness behind `accel-dense bench`.
//!
//! Times the synchronous container operations on two `f32` device
//! vectors. Every timed call drains the queue, so the measured span covers
//! the device work and not just the enqueue.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::runtime::{CommandQueue, Result};
use crate::vector::{DeviceVector, HostVector};

/// Mean timings for one vector length.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub device: String,
    pub size: usize,
    pub bytes: usize,
    pub iterations: usize,
    pub fill_us: f64,
    pub upload_us: f64,
    pub download_us: f64,
    pub swap_us: f64,
    /// Whether the last download read back the fill value.
    pub verified: bool,
}

#[derive(Default)]
struct Totals {
    fill: Duration,
    upload: Duration,
    download: Duration,
    swap: Duration,
}

fn timed<R>(total: &mut Duration, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let out = f();
    *total += start.elapsed();
    out
}

fn mean_us(total: Duration, iterations: usize) -> f64 {
    total.as_secs_f64() * 1e6 / iterations as f64
}

/// Run `iterations` rounds of fill, upload, download and swap on vectors
/// of `size` elements. At least one round is always run.
pub fn run_size(
    size: usize,
    iterations: usize,
    value: f32,
    queue: &CommandQueue,
) -> Result<BenchReport> {
    let iterations = iterations.max(1);

    let mut a = DeviceVector::from_elem(size, value, queue)?;
    let mut b = DeviceVector::from_elem(size, value, queue)?;
    let upload_src = HostVector::from_elem(size, value);
    let mut download_dst = HostVector::<f32>::new(size);

    let mut totals = Totals::default();
    for _ in 0..iterations {
        timed(&mut totals.fill, || a.fill(value, queue))?;
        timed(&mut totals.upload, || b.copy_from_host(&upload_src, queue))?;
        timed(&mut totals.download, || a.copy_to_host(&mut download_dst, queue))?;
        timed(&mut totals.swap, || a.swap(&mut b, queue))?;
    }

    let verified = download_dst.iter().all(|&x| x == value);
    debug!(size, iterations, verified, "Bench size complete");

    Ok(BenchReport {
        device: queue.device().name().to_string(),
        size,
        bytes: size * std::mem::size_of::<f32>(),
        iterations,
        fill_us: mean_us(totals.fill, iterations),
        upload_us: mean_us(totals.upload, iterations),
        download_us: mean_us(totals.download, iterations),
        swap_us: mean_us(totals.swap, iterations),
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::stub_devices;
    use crate::runtime::{Context, Device};

    fn queue() -> CommandQueue {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));
        CommandQueue::for_context(&ctx).unwrap()
    }

    #[test]
    fn test_run_size_reports_and_releases() {
        let queue = queue();
        let report = run_size(1024, 2, 200.0, &queue).unwrap();

        assert_eq!(report.size, 1024);
        assert_eq!(report.bytes, 4096);
        assert_eq!(report.iterations, 2);
        assert!(report.verified);

        let stats = queue.device().memory_stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.allocations, stats.releases);
    }

    #[test]
    fn test_zero_iterations_runs_once() {
        let queue = queue();
        let report = run_size(4, 0, 1.0, &queue).unwrap();
        assert_eq!(report.iterations, 1);
        assert_eq!(queue.stats().total_swaps, 1);
    }

    #[test]
    fn test_oversized_run_fails_cleanly() {
        let queue = queue();
        // 64 MiB device, two 32 MiB + 4 byte vectors.
        let err = run_size(8 * 1024 * 1024 + 1, 1, 1.0, &queue).unwrap_err();
        assert!(matches!(err, crate::runtime::RuntimeError::OutOfMemory { .. }));
        assert_eq!(queue.device().memory_stats().live_buffers, 0);
    }
}
