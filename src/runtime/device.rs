//! Accelerator device discovery and identity.
//!
//! A [`Device`] is a cheap, clonable handle around one driver backend.
//! Equality is identity: two handles compare equal only if they refer to
//! the same discovered device, which is what the container affinity
//! checks rely on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::backend::{DeviceBackend, EmulatedBackend, MemoryStats};
use super::{Result, RuntimeError};
use crate::config::{BackendKind, PlatformConfig};

/// Static description of a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Index within its platform.
    pub ordinal: usize,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Total device memory in bytes.
    pub total_memory: usize,

    /// Number of compute units (SMs, CUs, EUs).
    pub compute_units: u32,
}

/// Process-unique device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Handle to a device and its driver backend.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    backend: Arc<dyn DeviceBackend>,
}

impl Device {
    /// Wrap a backend as a newly discovered device.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            id: DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)),
            backend,
        }
    }

    /// Convenience constructor for an emulated device.
    pub fn emulated(info: DeviceInfo) -> Self {
        Self::new(Arc::new(EmulatedBackend::new(info)))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        self.backend.info()
    }

    pub fn name(&self) -> &str {
        &self.backend.info().name
    }

    /// Current memory accounting of the backend.
    pub fn memory_stats(&self) -> MemoryStats {
        self.backend.memory_stats()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id)
    }
}

/// The set of devices visible to this process.
#[derive(Debug, Clone)]
pub struct Platform {
    devices: Vec<Device>,
    default_device: usize,
}

impl Platform {
    /// Build a platform of emulated devices.
    pub fn emulated(infos: &[DeviceInfo]) -> Self {
        let devices = infos.iter().cloned().map(Device::emulated).collect();
        Self {
            devices,
            default_device: 0,
        }
    }

    /// Build the platform described by configuration.
    pub fn from_config(config: &PlatformConfig) -> Result<Self> {
        let mut platform = match config.backend {
            BackendKind::Emulated => {
                let infos: Vec<DeviceInfo> = config
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(ordinal, d)| d.to_info(ordinal))
                    .collect();
                Self::emulated(&infos)
            }
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => Self::cuda()?,
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => {
                return Err(RuntimeError::Backend(
                    "built without the `cuda` feature".to_string(),
                ))
            }
        };
        platform.default_device = config.default_device;

        info!(
            devices = platform.devices.len(),
            default = config.default_device,
            "Platform initialized"
        );
        Ok(platform)
    }

    /// Probe all CUDA devices.
    #[cfg(feature = "cuda")]
    pub fn cuda() -> Result<Self> {
        let count = super::cuda::device_count()?;
        let devices = (0..count)
            .map(|ordinal| {
                super::cuda::CudaBackend::new(ordinal)
                    .map(|backend| Device::new(Arc::new(backend)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            devices,
            default_device: 0,
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The configured default device.
    pub fn default_device(&self) -> Result<Device> {
        self.devices
            .get(self.default_device)
            .cloned()
            .ok_or(RuntimeError::NoDevice)
    }
}

/// Emulated stand-ins for a small two-GPU workstation, used by tests and
/// as the default configuration.
pub fn stub_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo {
            ordinal: 0,
            name: "Emulated GTX 1070".to_string(),
            total_memory: 64 * 1024 * 1024,
            compute_units: 15,
        },
        DeviceInfo {
            ordinal: 1,
            name: "Emulated GTX 1070".to_string(),
            total_memory: 64 * 1024 * 1024,
            compute_units: 15,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity() {
        let infos = stub_devices();
        let a = Device::emulated(infos[0].clone());
        let b = Device::emulated(infos[0].clone());

        // Same description, different devices.
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.info(), b.info());
    }

    #[test]
    fn test_platform_default_device() {
        let platform = Platform::emulated(&stub_devices());
        assert_eq!(platform.devices().len(), 2);
        assert_eq!(platform.default_device().unwrap(), platform.devices()[0]);

        let empty = Platform::emulated(&[]);
        assert_eq!(empty.default_device().unwrap_err(), RuntimeError::NoDevice);
    }

    #[test]
    fn test_platform_from_config() {
        let config = PlatformConfig::default();
        let platform = Platform::from_config(&config).unwrap();
        assert_eq!(platform.devices().len(), config.devices.len());
        assert_eq!(platform.devices()[1].info().ordinal, 1);
    }
}
