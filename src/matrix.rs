//! Dense matrices on the host or on an accelerator.
//!
//! `Matrix<T, L, S>` is one type for both backings: `S = Host` stores the
//! elements in a `Vec<T>`, `S = OnDevice` in a device buffer owned by the
//! matrix. For an `m × n` matrix, element `(i, j)` is at `i * n + j` for
//! [`RowMajor`] and at `i + j * m` for [`ColumnMajor`](crate::layout::ColumnMajor).
//!
//! Every device operation that takes a queue is synchronous. It checks
//! its preconditions, enqueues its commands and drains the queue before
//! returning, so no caller ever sees a matrix with a write still in flight.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use tracing::debug;

use crate::element::Element;
use crate::layout::{Layout, RowMajor};
use crate::runtime::{Buffer, BufferRange, CommandQueue, Context, Device, Result, RuntimeError};
use crate::storage::{AllocationState, DeviceAllocation, ElementContainer, Host, OnDevice, Storage};
use crate::transfer;

/// A dense `rows × cols` matrix of `T` with layout `L` and storage `S`.
pub struct Matrix<T: Element, L: Layout = RowMajor, S: Storage = Host> {
    rows: usize,
    cols: usize,
    data: S::MatrixData<T>,
    _layout: PhantomData<L>,
}

/// A matrix in host memory.
pub type HostMatrix<T, L = RowMajor> = Matrix<T, L, Host>;

/// A matrix in device memory.
pub type DeviceMatrix<T, L = RowMajor> = Matrix<T, L, OnDevice>;

impl<T: Element, L: Layout, S: Storage> Matrix<T, L, S> {
    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn size(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of backing elements under the layout rule.
    pub fn storage_size(&self) -> usize {
        self.data.len()
    }

    pub fn state(&self) -> AllocationState {
        self.data.state()
    }
}

fn checked_storage_size<L: Layout>(rows: usize, cols: usize) -> Result<usize> {
    L::storage_size(rows, cols).ok_or(RuntimeError::ExtentOverflow { rows, cols })
}

// ─── Host ──────────────────────────────────────────────────────────────────

impl<T: Element, L: Layout> Matrix<T, L, Host> {
    /// Zero-filled matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::from_elem(rows, cols, <T as bytemuck::Zeroable>::zeroed())
    }

    /// Matrix with every element equal to `value`.
    ///
    /// # Panics
    ///
    /// If `rows * cols` overflows.
    pub fn from_elem(rows: usize, cols: usize, value: T) -> Self {
        let len = L::storage_size(rows, cols).expect("matrix extent overflows");
        Self::from_vec(rows, cols, vec![value; len])
    }

    /// Wrap `data`, already laid out according to `L`.
    ///
    /// # Panics
    ///
    /// If `data.len()` differs from `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Self {
        assert_eq!(
            L::storage_size(rows, cols),
            Some(data.len()),
            "size mismatch: {rows}x{cols} matrix from {} elements",
            data.len()
        );
        Self {
            rows,
            cols,
            data,
            _layout: PhantomData,
        }
    }

    /// Matrix with element `(i, j)` set to `f(i, j)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut m = Self::new(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                m.data[L::index(i, j, rows, cols)] = f(i, j);
            }
        }
        m
    }

    pub fn get(&self, i: usize, j: usize) -> Option<&T> {
        if i < self.rows && j < self.cols {
            self.data.get(L::index(i, j, self.rows, self.cols))
        } else {
            None
        }
    }

    pub fn set(&mut self, i: usize, j: usize, value: T) {
        self[(i, j)] = value;
    }

    /// Elements in layout order.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Element, L: Layout> Index<(usize, usize)> for Matrix<T, L, Host> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &T {
        assert!(i < self.rows && j < self.cols, "index ({i}, {j}) out of bounds");
        &self.data[L::index(i, j, self.rows, self.cols)]
    }
}

impl<T: Element, L: Layout> IndexMut<(usize, usize)> for Matrix<T, L, Host> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        assert!(i < self.rows && j < self.cols, "index ({i}, {j}) out of bounds");
        &mut self.data[L::index(i, j, self.rows, self.cols)]
    }
}

impl<T: Element, L: Layout> Clone for Matrix<T, L, Host> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.clone(),
            _layout: PhantomData,
        }
    }
}

impl<T: Element, L: Layout> PartialEq for Matrix<T, L, Host> {
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.data == other.data
    }
}

impl<T: Element, L: Layout> Default for Matrix<T, L, Host> {
    fn default() -> Self {
        Self::from_vec(0, 0, Vec::new())
    }
}

// ─── Device ────────────────────────────────────────────────────────────────

impl<T: Element, L: Layout> Matrix<T, L, OnDevice> {
    /// A 0×0 matrix bound to no device. Allocates nothing.
    pub fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            data: DeviceAllocation::unallocated(),
            _layout: PhantomData,
        }
    }

    /// Allocate an uninitialized `rows × cols` matrix in `context`.
    pub fn new(rows: usize, cols: usize, context: &Context) -> Result<Self> {
        let len = checked_storage_size::<L>(rows, cols)?;
        let data = DeviceAllocation::allocate(len, context)?;
        debug!(rows, cols, layout = L::NAME, device = %context.device(), "Created device matrix");
        Ok(Self {
            rows,
            cols,
            data,
            _layout: PhantomData,
        })
    }

    /// Allocate a `rows × cols` matrix on the queue's device with every
    /// element set to `value`. Blocks until the fill has completed.
    pub fn from_elem(rows: usize, cols: usize, value: T, queue: &CommandQueue) -> Result<Self> {
        let mut m = Self::new(rows, cols, queue.context())?;
        m.fill(value, queue)?;
        Ok(m)
    }

    /// Allocate a matrix of `host`'s extent on the queue's device and copy
    /// `host` into it.
    pub fn from_host(host: &HostMatrix<T, L>, queue: &CommandQueue) -> Result<Self> {
        let mut m = Self::new(host.rows(), host.cols(), queue.context())?;
        m.copy_from_host(host, queue)?;
        Ok(m)
    }

    /// Overwrite this matrix with the contents of `host`.
    ///
    /// # Panics
    ///
    /// If this matrix is not bound to the queue's device, or the extents differ.
    pub fn copy_from_host(&mut self, host: &HostMatrix<T, L>, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device matrix");
        transfer::assert_same_extent(self.size(), host.size(), "copy_from_host");

        if let Some(range) = self.data.range() {
            transfer::copy_to_device(host.as_slice(), range, queue)?;
        }
        queue.finish()?;
        self.data.mark_initialized();
        Ok(())
    }

    /// Copy this matrix into `host`.
    ///
    /// # Panics
    ///
    /// If this matrix is not bound to the queue's device, or the extents differ.
    pub fn copy_to_host(&self, host: &mut HostMatrix<T, L>, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device matrix");
        transfer::assert_same_extent(self.size(), host.size(), "copy_to_host");

        if let Some(range) = self.data.range() {
            transfer::copy_to_host(range, host.as_mut_slice(), queue)?;
        }
        queue.finish()
    }

    /// Copy this matrix into a new host matrix of the same extent.
    pub fn to_host_matrix(&self, queue: &CommandQueue) -> Result<HostMatrix<T, L>> {
        let mut host = HostMatrix::<T, L>::new(self.rows, self.cols);
        self.copy_to_host(&mut host, queue)?;
        Ok(host)
    }

    /// Set every element to `value`.
    ///
    /// # Panics
    ///
    /// If this matrix is not bound to the queue's device.
    pub fn fill(&mut self, value: T, queue: &CommandQueue) -> Result<()> {
        transfer::assert_affinity(self.device(), queue, "device matrix");

        if let Some(range) = self.data.range() {
            transfer::fill(range, value, queue)?;
        }
        queue.finish()?;
        self.data.mark_initialized();
        Ok(())
    }

    /// Exchange the contents of two matrices element by element.
    ///
    /// Each side keeps its own buffer and state classification.
    ///
    /// # Panics
    ///
    /// If the extents differ, or either matrix is not bound to the queue's device.
    pub fn swap(&mut self, other: &mut Self, queue: &CommandQueue) -> Result<()> {
        transfer::assert_same_extent(self.size(), other.size(), "swap");
        transfer::assert_affinity(self.device(), queue, "device matrix");
        transfer::assert_affinity(other.device(), queue, "other device matrix");

        if let (Some(a), Some(b)) = (self.data.range(), other.data.range()) {
            transfer::swap_ranges(a, b, queue)?;
        }
        queue.finish()
    }

    /// Allocate a new matrix on the queue's device holding a copy of this one.
    ///
    /// # Panics
    ///
    /// If this matrix is not bound to the queue's device.
    pub fn duplicate(&self, queue: &CommandQueue) -> Result<Self> {
        transfer::assert_affinity(self.device(), queue, "device matrix");

        let mut copy = Self::new(self.rows, self.cols, queue.context())?;
        if let (Some(src), Some(dst)) = (self.data.range(), copy.data.range()) {
            transfer::copy_within_device(src, dst, queue)?;
        }
        queue.finish()?;
        if self.data.is_initialized() {
            copy.data.mark_initialized();
        }
        Ok(copy)
    }

    /// The device this matrix lives on; `None` for [`Matrix::empty`].
    pub fn device(&self) -> Option<&Device> {
        self.data.device()
    }

    /// The context owning the allocation.
    pub fn context(&self) -> Option<&Context> {
        self.data.context()
    }

    /// Backing buffer, for kernels enqueued directly against this matrix.
    pub fn buffer(&self) -> Option<&Buffer> {
        self.data.buffer()
    }

    /// The whole backing store as a transfer range.
    pub fn as_range(&self) -> Option<BufferRange<'_, T>> {
        self.data.range()
    }
}

impl<T: Element, L: Layout> Default for Matrix<T, L, OnDevice> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Element, L: Layout, S: Storage> fmt::Debug for Matrix<T, L, S>
where
    S::MatrixData<T>: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("layout", &L::NAME)
            .field("storage", &S::NAME)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ColumnMajor;
    use crate::runtime::device::stub_devices;

    fn queue() -> CommandQueue {
        let ctx = Context::new(&Device::emulated(stub_devices().remove(0)));
        CommandQueue::for_context(&ctx).unwrap()
    }

    #[test]
    fn test_host_layout() {
        let m = HostMatrix::<i32>::from_fn(2, 3, |i, j| (i * 10 + j) as i32);
        assert_eq!(m.as_slice(), &[0, 1, 2, 10, 11, 12]);

        let c = HostMatrix::<i32, ColumnMajor>::from_fn(2, 3, |i, j| (i * 10 + j) as i32);
        assert_eq!(c.as_slice(), &[0, 10, 1, 11, 2, 12]);
        assert_eq!(c[(1, 2)], 12);
        assert_eq!(c.get(2, 0), None);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_host_from_vec_checks_len() {
        let _ = HostMatrix::<f32>::from_vec(2, 2, vec![0.0; 3]);
    }

    #[test]
    fn test_states() {
        let queue = queue();

        let empty = DeviceMatrix::<f32>::empty();
        assert_eq!(empty.state(), AllocationState::Unallocated);
        assert!(empty.device().is_none());

        let mut m = DeviceMatrix::<f32>::new(2, 2, queue.context()).unwrap();
        assert_eq!(m.state(), AllocationState::Uninitialized);
        assert_eq!(m.storage_size(), 4);

        m.fill(1.0, &queue).unwrap();
        assert_eq!(m.state(), AllocationState::Initialized);
    }

    #[test]
    fn test_column_major_round_trip() {
        let queue = queue();
        let host = HostMatrix::<f64, ColumnMajor>::from_fn(3, 2, |i, j| (i + 2 * j) as f64);

        let dev = DeviceMatrix::<f64, ColumnMajor>::from_host(&host, &queue).unwrap();
        let back = dev.to_host_matrix(&queue).unwrap();
        assert_eq!(back, host);
        assert_eq!(back[(2, 1)], 4.0);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let queue = queue();
        let a = DeviceMatrix::<u32>::from_elem(2, 2, 5, &queue).unwrap();
        let mut b = a.duplicate(&queue).unwrap();
        assert_eq!(b.state(), AllocationState::Initialized);

        b.fill(6, &queue).unwrap();
        assert_eq!(a.to_host_matrix(&queue).unwrap().as_slice(), &[5; 4]);
        assert_eq!(b.to_host_matrix(&queue).unwrap().as_slice(), &[6; 4]);
    }

    #[test]
    fn test_extent_overflow() {
        let queue = queue();
        let err = DeviceMatrix::<f32>::new(usize::MAX, 2, queue.context()).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::ExtentOverflow {
                rows: usize::MAX,
                cols: 2
            }
        );
    }
}
