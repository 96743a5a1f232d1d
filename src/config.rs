//! Runtime configuration for accel-dense.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! It describes which devices the platform exposes and how the transfer
//! benchmark is run.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::runtime::device::{stub_devices, DeviceInfo};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "accel-dense", about = "Dense matrices and vectors on accelerator devices")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "accel.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List the devices of the configured platform.
    Devices,

    /// Time fill, upload, download and swap of device vectors.
    Bench {
        /// Vector lengths to measure, overriding the configuration.
        #[arg(long, value_delimiter = ',')]
        sizes: Option<Vec<usize>>,

        /// Repetitions per size, overriding the configuration.
        #[arg(long)]
        iterations: Option<usize>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device platform.
    pub platform: PlatformConfig,

    /// Benchmark settings.
    pub bench: BenchConfig,
}

/// Which driver backs the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host-memory devices described by [`PlatformConfig::devices`].
    #[default]
    Emulated,
    /// Every CUDA device on the machine (feature `cuda`).
    Cuda,
}

/// One emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Device memory capacity in bytes.
    pub memory_bytes: usize,

    pub compute_units: u32,
}

impl DeviceConfig {
    pub fn to_info(&self, ordinal: usize) -> DeviceInfo {
        DeviceInfo {
            ordinal,
            name: self.name.clone(),
            total_memory: self.memory_bytes,
            compute_units: self.compute_units,
        }
    }
}

impl From<DeviceInfo> for DeviceConfig {
    fn from(info: DeviceInfo) -> Self {
        Self {
            name: info.name,
            memory_bytes: info.total_memory,
            compute_units: info.compute_units,
        }
    }
}

/// Device platform settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub backend: BackendKind,

    /// Emulated devices. Ignored by the CUDA backend, which probes instead.
    pub devices: Vec<DeviceConfig>,

    /// Index of the device used when none is named.
    pub default_device: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Emulated,
            devices: stub_devices().into_iter().map(DeviceConfig::from).collect(),
            default_device: 0,
        }
    }
}

/// Transfer benchmark settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Vector lengths, in elements.
    pub sizes: Vec<usize>,

    /// Repetitions per size; the report carries the mean.
    pub iterations: usize,

    /// Value the vectors are filled with.
    pub fill_value: f32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            // Powers of two from 1 to 256Ki elements.
            sizes: (0..19).map(|p| 1usize << p).collect(),
            iterations: 5,
            fill_value: 200.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.platform.backend, BackendKind::Emulated);
        assert_eq!(cfg.platform.devices.len(), 2);
        assert_eq!(
            cfg.bench.sizes,
            vec![
                1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16_384, 32_768,
                65_536, 131_072, 262_144,
            ]
        );
        assert_eq!(cfg.bench.fill_value, 200.0);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"platform": {{"devices": [{{"name": "tiny", "memory_bytes": 4096, "compute_units": 1}}]}}}}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.platform.devices.len(), 1);
        assert_eq!(cfg.platform.devices[0].to_info(0).total_memory, 4096);
        assert_eq!(cfg.platform.default_device, 0);
        assert_eq!(cfg.bench.iterations, 5);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.bench.iterations, BenchConfig::default().iterations);
    }

    #[test]
    fn test_backend_kind_names() {
        let kind: BackendKind = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(kind, BackendKind::Cuda);
    }

    #[test]
    fn test_cli_bench_sizes() {
        let cli = Cli::parse_from(["accel-dense", "bench", "--sizes", "1,16,256"]);
        assert_eq!(
            cli.command,
            Command::Bench {
                sizes: Some(vec![1, 16, 256]),
                iterations: None
            }
        );
    }
}
