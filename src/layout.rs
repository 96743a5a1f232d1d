//! Storage layouts: how a (rows × cols) matrix maps onto a flat buffer.
//!
//! For a row-major matrix element `(i, j)` lives at `i * cols + j`; for a
//! column-major one at `i + j * rows`. Both need exactly `rows * cols`
//! slots.

use std::fmt;

/// Element ordering of a dense matrix, fixed at compile time.
pub trait Layout: fmt::Debug + Send + Sync + 'static {
    /// Human-readable name.
    const NAME: &'static str;

    /// Number of elements backing a `rows × cols` matrix, or `None` on
    /// overflow.
    fn storage_size(rows: usize, cols: usize) -> Option<usize> {
        rows.checked_mul(cols)
    }

    /// Flat index of element `(i, j)`.
    fn index(i: usize, j: usize, rows: usize, cols: usize) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowMajor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnMajor;

impl Layout for RowMajor {
    const NAME: &'static str = "row-major";

    fn index(i: usize, j: usize, _rows: usize, cols: usize) -> usize {
        i * cols + j
    }
}

impl Layout for ColumnMajor {
    const NAME: &'static str = "column-major";

    fn index(i: usize, j: usize, rows: usize, _cols: usize) -> usize {
        i + j * rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_size() {
        assert_eq!(RowMajor::storage_size(3, 4), Some(12));
        assert_eq!(ColumnMajor::storage_size(0, 7), Some(0));
        assert_eq!(RowMajor::storage_size(usize::MAX, 2), None);
    }

    #[test]
    fn test_index() {
        // 2 × 3
        assert_eq!(RowMajor::index(1, 2, 2, 3), 5);
        assert_eq!(ColumnMajor::index(1, 2, 2, 3), 5);
        assert_eq!(RowMajor::index(1, 0, 2, 3), 3);
        assert_eq!(ColumnMajor::index(1, 0, 2, 3), 1);
    }
}
