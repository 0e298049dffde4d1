//! Driver registry and the dynamic-library extension point.
//!
//! The registry maps a driver name to a [`DriverDescriptor`] (name, description,
//! parameter descriptors) and a factory. Built-in drivers are registered by
//! [`DriverRegistry::new`]; more can be added in code with
//! [`register`](DriverRegistry::register) or from a shared library with
//! [`load_library`](DriverRegistry::load_library).
//!
//! # Shared-library drivers
//!
//! A library exports two Rust-ABI symbols, and must be built with the same
//! compiler and `cadence-driver` version as the server:
//!
//! ```rust,ignore
//! #[unsafe(no_mangle)]
//! pub fn cadence_driver_descriptor() -> DriverDescriptor { ... }
//!
//! #[unsafe(no_mangle)]
//! pub fn cadence_driver_initialize(
//!     ctx: &DriverContext,
//!     params: &ResolvedParams,
//! ) -> cadence_driver::Result<Arc<dyn Driver>> { ... }
//! ```

use crate::cpal_driver::{CpalDriver, cpal_params};
use crate::driver::{Driver, DriverContext};
use crate::dummy::{DummyDriver, dummy_params};
use crate::{DriverError, Result};
use cadence_core::{DriverParam, ParamDescriptor, ResolvedParams, resolve_params};
use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Symbol returning the library's [`DriverDescriptor`].
pub const DESCRIPTOR_SYMBOL: &[u8] = b"cadence_driver_descriptor";

/// Symbol building a driver from resolved parameters.
pub const INITIALIZE_SYMBOL: &[u8] = b"cadence_driver_initialize";

type DescriptorFn = fn() -> DriverDescriptor;
type InitializeFn = fn(&DriverContext, &ResolvedParams) -> Result<Arc<dyn Driver>>;

/// Builds an opened driver from resolved parameters.
pub type DriverFactory =
    Arc<dyn Fn(&DriverContext, &ResolvedParams) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Describes a driver in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptor {
    /// Unique name (lowercase, no spaces).
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Accepted parameters with their defaults.
    pub params: Vec<ParamDescriptor>,
}

struct RegistryEntry {
    descriptor: DriverDescriptor,
    factory: DriverFactory,
}

/// A resolved driver: its descriptor, its factory, and the library it came from.
///
/// For library drivers the module keeps the library mapped; every driver it
/// built must be dropped before the module is.
pub struct DriverModule {
    descriptor: DriverDescriptor,
    factory: DriverFactory,
    library: Option<Library>,
}

impl std::fmt::Debug for DriverModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverModule")
            .field("descriptor", &self.descriptor)
            .field("dynamic", &self.library.is_some())
            .finish_non_exhaustive()
    }
}

impl DriverModule {
    /// The driver's descriptor.
    pub fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    /// Whether the driver came from a shared library.
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }

    /// Validates `params` against the descriptor and builds an opened driver.
    pub fn initialize(&self, ctx: &DriverContext, params: &[DriverParam]) -> Result<Arc<dyn Driver>> {
        let resolved = resolve_params(&self.descriptor.params, params)?;
        (self.factory)(ctx, &resolved)
    }

    /// Unmaps the library, if any.
    pub fn unload(self) {
        if let Some(library) = self.library {
            tracing::debug!(driver = %self.descriptor.name, "unloading driver library");
            if let Err(err) = library.close() {
                tracing::warn!(error = %err, "driver library did not unload cleanly");
            }
        }
    }
}

/// Registry of available drivers.
pub struct DriverRegistry {
    entries: Vec<RegistryEntry>,
    search_dirs: Vec<PathBuf>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .field("search_dirs", &self.search_dirs)
            .finish()
    }
}

impl DriverRegistry {
    /// Creates a registry with the built-in drivers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtin_drivers();
        registry
    }

    /// Creates a registry with no drivers.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            search_dirs: Vec::new(),
        }
    }

    fn register_builtin_drivers(&mut self) {
        self.register(
            DriverDescriptor {
                name: "dummy".to_string(),
                description: "Timer-paced driver without hardware".to_string(),
                params: dummy_params(),
            },
            |ctx, params| Ok(Arc::new(DummyDriver::from_params(ctx, params)?)),
        );

        self.register(
            DriverDescriptor {
                name: "cpal".to_string(),
                description: "Hardware audio through cpal (ALSA, CoreAudio, WASAPI)".to_string(),
                params: cpal_params(),
            },
            |ctx, params| Ok(Arc::new(CpalDriver::from_params(ctx, params)?)),
        );
    }

    /// Registers a driver, replacing any driver with the same name.
    pub fn register<F>(&mut self, descriptor: DriverDescriptor, factory: F)
    where
        F: Fn(&DriverContext, &ResolvedParams) -> Result<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        self.entries.retain(|e| e.descriptor.name != descriptor.name);
        self.entries.push(RegistryEntry {
            descriptor,
            factory: Arc::new(factory),
        });
    }

    /// Adds a directory searched for `cadence_<name>` libraries.
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    /// Descriptors of every registered driver.
    pub fn descriptors(&self) -> impl Iterator<Item = &DriverDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    /// Descriptor of the driver called `name`.
    pub fn descriptor(&self, name: &str) -> Option<&DriverDescriptor> {
        self.descriptors().find(|d| d.name == name)
    }

    /// Names of every registered driver.
    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.descriptor.name.as_str())
            .collect()
    }

    /// Resolves `name` to a driver module.
    ///
    /// Registered drivers win; otherwise each search directory is tried for the
    /// platform's `cadence_<name>` library file.
    pub fn load(&self, name: &str) -> Result<DriverModule> {
        if let Some(entry) = self.entries.iter().find(|e| e.descriptor.name == name) {
            return Ok(DriverModule {
                descriptor: entry.descriptor.clone(),
                factory: Arc::clone(&entry.factory),
                library: None,
            });
        }
        let file = libloading::library_filename(format!("cadence_{name}"));
        for dir in &self.search_dirs {
            let path = dir.join(&file);
            if path.exists() {
                return Self::load_library(&path);
            }
        }
        Err(DriverError::UnknownDriver(name.to_string()))
    }

    /// Loads a driver from the shared library at `path`.
    #[allow(unsafe_code)]
    pub fn load_library(path: &Path) -> Result<DriverModule> {
        let load_err = |reason: String| DriverError::Load {
            path: path.to_path_buf(),
            reason,
        };

        // SAFETY: loading runs the library's initializers; driver libraries are
        // trusted server extensions.
        let library = unsafe { Library::new(path) }.map_err(|e| load_err(e.to_string()))?;

        // SAFETY: the symbol types match the documented driver library ABI.
        let (describe, initialize) = unsafe {
            let describe = *library
                .get::<DescriptorFn>(DESCRIPTOR_SYMBOL)
                .map_err(|e| load_err(e.to_string()))?;
            let initialize = *library
                .get::<InitializeFn>(INITIALIZE_SYMBOL)
                .map_err(|e| load_err(e.to_string()))?;
            (describe, initialize)
        };

        let descriptor = describe();
        tracing::info!(
            driver = %descriptor.name,
            path = %path.display(),
            "driver library loaded"
        );
        Ok(DriverModule {
            descriptor,
            factory: Arc::new(initialize),
            library: Some(library),
        })
    }
}
