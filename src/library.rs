//! Process-wide lifecycle of the accelerator math backend.
//!
//! The math backend (a BLAS for device buffers) has global setup and
//! teardown functions. [`Library`] is the scoped guard around them: the
//! first live guard runs setup, and dropping the last one runs teardown.
//! Guards are counted, so nested or overlapping scopes are safe. The
//! backend stays ready for as long as any guard is alive.
//!
//! [`Library::for_platform`] picks the backend matching the configured
//! device platform: [`EmulatedBlas`] for emulated devices, a cuBLAS handle
//! (feature `cuda`) for CUDA devices.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{BackendKind, PlatformConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    #[error("Math backend setup failed: {0}")]
    SetupFailed(String),
}

/// Global setup/teardown hooks of a math backend.
pub trait MathBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the backend from uninitialized to ready.
    fn setup(&self) -> Result<(), LibraryError>;

    /// Release everything `setup` acquired.
    fn teardown(&self);
}

/// Backend paired with the emulated devices. Holds no resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmulatedBlas;

impl MathBackend for EmulatedBlas {
    fn name(&self) -> &str {
        "emulated-blas"
    }

    fn setup(&self) -> Result<(), LibraryError> {
        Ok(())
    }

    fn teardown(&self) {}
}

/// cuBLAS handle on one CUDA device, created by `setup` and dropped by
/// `teardown`.
#[cfg(feature = "cuda")]
pub struct Cublas {
    ordinal: usize,
    handle: Mutex<Option<cudarc::cublas::CudaBlas>>,
}

#[cfg(feature = "cuda")]
impl Cublas {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            handle: Mutex::new(None),
        }
    }
}

#[cfg(feature = "cuda")]
impl MathBackend for Cublas {
    fn name(&self) -> &str {
        "cublas"
    }

    fn setup(&self) -> Result<(), LibraryError> {
        let context = cudarc::driver::CudaContext::new(self.ordinal)
            .map_err(|err| LibraryError::SetupFailed(err.to_string()))?;
        let blas = cudarc::cublas::CudaBlas::new(context.default_stream())
            .map_err(|err| LibraryError::SetupFailed(format!("{err:?}")))?;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(blas);
        Ok(())
    }

    fn teardown(&self) {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct Registry {
    active: Option<Arc<dyn MathBackend>>,
    guards: usize,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    active: None,
    guards: 0,
});

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the math backend ready while alive.
#[must_use = "the backend is torn down as soon as the guard is dropped"]
pub struct Library {
    backend: Arc<dyn MathBackend>,
}

impl Library {
    /// Initialize the default backend.
    pub fn new() -> Result<Self, LibraryError> {
        Self::with_backend(EmulatedBlas)
    }

    /// Initialize the backend that matches `config.backend`.
    ///
    /// A CUDA platform gets a cuBLAS handle on its default device. Without
    /// the `cuda` feature that is a setup failure.
    pub fn for_platform(config: &PlatformConfig) -> Result<Self, LibraryError> {
        match config.backend {
            BackendKind::Emulated => Self::new(),
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => Self::with_backend(Cublas::new(config.default_device)),
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => Err(LibraryError::SetupFailed(
                "built without the `cuda` feature".to_string(),
            )),
        }
    }

    /// Initialize `backend` unless a backend is already active, in which
    /// case the new guard shares the active one.
    ///
    /// A setup failure is fatal for the scope: no guard is created and
    /// the backend stays uninitialized.
    pub fn with_backend(backend: impl MathBackend + 'static) -> Result<Self, LibraryError> {
        let mut reg = registry();

        if let Some(active) = reg.active.clone() {
            reg.guards += 1;
            debug!(backend = active.name(), guards = reg.guards, "Math backend already active");
            return Ok(Self { backend: active });
        }

        backend.setup()?;
        let backend: Arc<dyn MathBackend> = Arc::new(backend);
        info!(backend = backend.name(), "Math backend initialized");
        reg.active = Some(Arc::clone(&backend));
        reg.guards = 1;
        Ok(Self { backend })
    }

    /// Name of the backend this guard keeps alive.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Whether a backend is currently ready.
    pub fn is_ready() -> bool {
        registry().active.is_some()
    }

    /// Number of live guards.
    pub fn active_guards() -> usize {
        registry().guards
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        let mut reg = registry();
        reg.guards = reg.guards.saturating_sub(1);
        if reg.guards == 0 {
            if let Some(backend) = reg.active.take() {
                backend.teardown();
                info!(backend = backend.name(), "Math backend torn down");
            }
        }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Library state is process-global.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[derive(Clone, Default)]
    struct CountingBackend {
        setups: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
    }

    impl MathBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn setup(&self) -> Result<(), LibraryError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingBackend;

    impl MathBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        fn setup(&self) -> Result<(), LibraryError> {
            Err(LibraryError::SetupFailed("no platform".to_string()))
        }

        fn teardown(&self) {
            panic!("teardown without setup");
        }
    }

    #[test]
    fn test_guard_lifecycle() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let backend = CountingBackend::default();

        assert!(!Library::is_ready());
        {
            let lib = Library::with_backend(backend.clone()).unwrap();
            assert!(Library::is_ready());
            assert_eq!(lib.backend_name(), "counting");
        }
        assert!(!Library::is_ready());
        assert_eq!(backend.setups.load(Ordering::SeqCst), 1);
        assert_eq!(backend.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_guards_share_setup() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let backend = CountingBackend::default();

        let outer = Library::with_backend(backend.clone()).unwrap();
        let inner = Library::with_backend(backend.clone()).unwrap();
        assert_eq!(Library::active_guards(), 2);

        drop(outer);
        assert!(Library::is_ready());
        assert_eq!(backend.teardowns.load(Ordering::SeqCst), 0);

        drop(inner);
        assert!(!Library::is_ready());
        assert_eq!(backend.setups.load(Ordering::SeqCst), 1);
        assert_eq!(backend.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_setup_failure_leaves_backend_uninitialized() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        let err = Library::with_backend(FailingBackend).unwrap_err();
        assert_eq!(err, LibraryError::SetupFailed("no platform".to_string()));
        assert!(!Library::is_ready());
        assert_eq!(Library::active_guards(), 0);

        // A later setup still works.
        let lib = Library::new().unwrap();
        assert_eq!(lib.backend_name(), "emulated-blas");
    }

    #[test]
    fn test_backend_follows_platform_config() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        let lib = Library::for_platform(&PlatformConfig::default()).unwrap();
        assert_eq!(lib.backend_name(), "emulated-blas");
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_platform_without_feature_fails_setup() {
        let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

        let config = PlatformConfig {
            backend: BackendKind::Cuda,
            ..PlatformConfig::default()
        };
        let err = Library::for_platform(&config).unwrap_err();
        assert!(matches!(err, LibraryError::SetupFailed(_)));
        assert!(!Library::is_ready());
    }
}
