//! Element types storable in device containers.

use std::fmt;

use half::{bf16, f16};

/// A plain-old-data scalar that can be copied byte-for-byte between host
/// and device memory.
pub trait Element: bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl Element for u8 {}
impl Element for i32 {}
impl Element for u32 {}
impl Element for i64 {}
impl Element for u64 {}
impl Element for f32 {}
impl Element for f64 {}
impl Element for f16 {}
impl Element for bf16 {}
