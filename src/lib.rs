//! accel-dense: dense matrices and vectors resident on accelerator devices.
//!
//! Containers are parameterized by a storage tag. The host flavour is an
//! ordinary `Vec`-backed container; the device flavour owns a buffer on one
//! accelerator and moves data through a command queue, draining it before
//! each operation returns.
//!
//! - [`library`]: process-wide setup/teardown guard for the math backend
//! - [`matrix`] / [`vector`]: the containers
//! - [`transfer`]: enqueue primitives and the shared precondition checks
//! - [`runtime`]: devices, contexts, queues and buffers
//! - [`storage`], [`layout`], [`element`]: the static parameters
//! - [`bench`]: transfer timing harness used by the `bench` subcommand

pub mod bench;
pub mod config;
pub mod element;
pub mod layout;
pub mod library;
pub mod matrix;
pub mod runtime;
pub mod storage;
pub mod transfer;
pub mod vector;

pub use element::Element;
pub use layout::{ColumnMajor, Layout, RowMajor};
pub use library::{Library, LibraryError, MathBackend};
pub use matrix::{DeviceMatrix, HostMatrix, Matrix};
pub use runtime::{CommandQueue, Context, Device, Platform, RuntimeError};
pub use storage::{AllocationState, Host, OnDevice, Storage};
pub use vector::{DeviceVector, HostVector, Vector};
