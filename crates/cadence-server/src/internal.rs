//! In-process clients loaded from modules.
//!
//! A module reference names a built-in module (`inprocess`, `null`), a module
//! registered in code, or a shared library. Libraries are found either by
//! path or as `cadence_client_<name>` in the registry's search directories,
//! and export two Rust-ABI symbols:
//!
//! ```rust,ignore
//! #[unsafe(no_mangle)]
//! pub fn cadence_client_descriptor() -> ClientModuleDescriptor { ... }
//!
//! #[unsafe(no_mangle)]
//! pub fn cadence_client_initialize(
//!     ctx: &ClientContext,
//!     params: &ResolvedParams,
//! ) -> Result<Arc<dyn InternalClient>, String> { ... }
//! ```

use crate::InternalClientError;
use cadence_core::{
    ClientCallbacks, ClientStatus, DriverParam, Engine, EngineControl, GraphManager,
    MAX_BUFFER_SIZE, Notification, ParamDescriptor, ParamError, ParamValue, PortDirection, PortId,
    RefNum, ResolvedParams, resolve_params,
};
use libloading::Library;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Symbol returning a client library's [`ClientModuleDescriptor`].
pub const CLIENT_DESCRIPTOR_SYMBOL: &[u8] = b"cadence_client_descriptor";

/// Symbol building a client from resolved parameters.
pub const CLIENT_INITIALIZE_SYMBOL: &[u8] = b"cadence_client_initialize";

/// Initialization arguments for an internal client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitArgs {
    /// Free-form string of `key=value` tokens; a bare `key` means `key=true`.
    Blob(String),
    /// Structured parameters.
    Params(Vec<DriverParam>),
}

impl Default for InitArgs {
    fn default() -> Self {
        InitArgs::Params(Vec::new())
    }
}

impl InitArgs {
    /// Converts either encoding into a parameter list.
    pub fn to_params(&self) -> Vec<DriverParam> {
        match self {
            InitArgs::Params(params) => params.clone(),
            InitArgs::Blob(blob) => blob
                .split_whitespace()
                .map(|token| match token.split_once('=') {
                    Some((name, value)) => {
                        DriverParam::new(name, ParamValue::Str(value.to_string()))
                    }
                    None => DriverParam::new(token, ParamValue::Bool(true)),
                })
                .collect(),
        }
    }
}

/// What a module gets to build a client.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// The graph the client reads and writes.
    pub graph: Arc<GraphManager>,
    /// Shared engine settings.
    pub control: Arc<EngineControl>,
}

/// An in-process client built by a module.
///
/// `initialize` runs with the engine lock held, right after the client got its
/// reference number; it registers ports. `process` runs on the client's thread
/// once per cycle. `finish` runs before the client is closed.
pub trait InternalClient: Send + Sync {
    /// Registers the client's ports.
    fn initialize(&self, _engine: &mut Engine, _refnum: RefNum) -> cadence_core::Result<()> {
        Ok(())
    }

    /// Whether the client processes audio.
    fn has_process(&self) -> bool {
        false
    }

    /// Processes one cycle.
    fn process(&self, _frames: u32) {}

    /// Receives an engine notification.
    fn notify(&self, _notification: &Notification) {}

    /// Last call before the client is closed.
    fn finish(&self) {}
}

/// Adapts an [`InternalClient`] to the engine's callback interface.
struct InternalCallbacks(Arc<dyn InternalClient>);

impl ClientCallbacks for InternalCallbacks {
    fn has_process(&self) -> bool {
        self.0.has_process()
    }

    fn process(&self, frames: u32) {
        self.0.process(frames);
    }

    fn notify(&self, notification: &Notification) {
        self.0.notify(notification);
    }
}

/// Builds a client from resolved parameters.
pub type ClientFactory = Arc<
    dyn Fn(&ClientContext, &ResolvedParams) -> Result<Arc<dyn InternalClient>, String>
        + Send
        + Sync,
>;

type DescriptorFn = fn() -> ClientModuleDescriptor;
type InitializeFn = fn(&ClientContext, &ResolvedParams) -> Result<Arc<dyn InternalClient>, String>;

/// Describes an internal client module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientModuleDescriptor {
    /// Module name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Accepted parameters with their defaults.
    pub params: Vec<ParamDescriptor>,
}

/// Errors raised while resolving or instantiating a client module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// No module with this reference is registered or installed.
    #[error("unknown client module: {0}")]
    Unknown(String),

    /// A client library could not be loaded.
    #[error("cannot load client library {}: {reason}", .path.display())]
    Load {
        /// Library path.
        path: PathBuf,
        /// Loader message.
        reason: String,
    },

    /// The initialization arguments were rejected.
    #[error("invalid client argument: {0}")]
    Params(#[from] ParamError),

    /// The module's factory failed.
    #[error("client initialization failed: {0}")]
    Init(String),
}

impl ModuleError {
    /// Status bit reported for this failure.
    pub fn status(&self) -> ClientStatus {
        match self {
            ModuleError::Unknown(_) | ModuleError::Load { .. } => ClientStatus::LOAD_FAILURE,
            ModuleError::Params(_) | ModuleError::Init(_) => ClientStatus::INIT_FAILURE,
        }
    }
}

/// A resolved client module.
pub struct ClientModule {
    descriptor: ClientModuleDescriptor,
    factory: ClientFactory,
    library: Option<Library>,
}

impl std::fmt::Debug for ClientModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientModule")
            .field("descriptor", &self.descriptor)
            .field("dynamic", &self.library.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientModule {
    /// The module's descriptor.
    pub fn descriptor(&self) -> &ClientModuleDescriptor {
        &self.descriptor
    }

    /// Whether the module came from a shared library.
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }

    /// Validates `args` and builds a client.
    pub fn instantiate(
        &self,
        ctx: &ClientContext,
        args: &InitArgs,
    ) -> Result<Arc<dyn InternalClient>, ModuleError> {
        let resolved = resolve_params(&self.descriptor.params, &args.to_params())?;
        (self.factory)(ctx, &resolved).map_err(ModuleError::Init)
    }

    fn unload(self) {
        if let Some(library) = self.library {
            tracing::debug!(module = %self.descriptor.name, "unloading client library");
            if let Err(err) = library.close() {
                tracing::warn!(error = %err, "client library did not unload cleanly");
            }
        }
    }

    /// Keeps a shared library mapped for the rest of the process.
    fn leak(self) {
        if let Some(library) = self.library {
            std::mem::forget(library);
        }
    }
}

struct RegistryEntry {
    descriptor: ClientModuleDescriptor,
    factory: ClientFactory,
}

/// Registry of internal client modules.
pub struct InternalClientRegistry {
    entries: Vec<RegistryEntry>,
    search_dirs: Vec<PathBuf>,
}

impl Default for InternalClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InternalClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalClientRegistry")
            .field("modules", &self.names())
            .field("search_dirs", &self.search_dirs)
            .finish()
    }
}

impl InternalClientRegistry {
    /// Creates a registry with the built-in modules.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(
            ClientModuleDescriptor {
                name: "inprocess".to_string(),
                description: "Copies each input port to its output port".to_string(),
                params: vec![ParamDescriptor::new(
                    "channels",
                    'c',
                    ParamValue::UInt(1),
                    "Number of in/out port pairs",
                )],
            },
            |ctx, params| {
                let channels = params.uint32("channels").unwrap_or(1);
                Ok(Arc::new(PassThrough::new(ctx, channels)))
            },
        );
        registry.register(
            ClientModuleDescriptor {
                name: "null".to_string(),
                description: "Client without ports or processing".to_string(),
                params: Vec::new(),
            },
            |_, _| Ok(Arc::new(NullClient)),
        );
        registry
    }

    /// Creates a registry with no modules.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            search_dirs: Vec::new(),
        }
    }

    /// Registers a module, replacing any module with the same name.
    pub fn register<F>(&mut self, descriptor: ClientModuleDescriptor, factory: F)
    where
        F: Fn(&ClientContext, &ResolvedParams) -> Result<Arc<dyn InternalClient>, String>
            + Send
            + Sync
            + 'static,
    {
        self.entries.retain(|e| e.descriptor.name != descriptor.name);
        self.entries.push(RegistryEntry {
            descriptor,
            factory: Arc::new(factory),
        });
    }

    /// Adds a directory searched for `cadence_client_<name>` libraries.
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    /// Names of every registered module.
    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.descriptor.name.as_str())
            .collect()
    }

    /// Descriptor of the module called `name`.
    pub fn descriptor(&self, name: &str) -> Option<&ClientModuleDescriptor> {
        self.entries
            .iter()
            .map(|e| &e.descriptor)
            .find(|d| d.name == name)
    }

    /// Resolves a module reference: a registered name, a library path, or a
    /// library name in the search directories.
    pub fn load(&self, module_ref: &str) -> Result<ClientModule, ModuleError> {
        if let Some(entry) = self.entries.iter().find(|e| e.descriptor.name == module_ref) {
            return Ok(ClientModule {
                descriptor: entry.descriptor.clone(),
                factory: Arc::clone(&entry.factory),
                library: None,
            });
        }
        let path = Path::new(module_ref);
        if path.components().count() > 1 || path.extension().is_some() {
            return Self::load_library(path);
        }
        let file = libloading::library_filename(format!("cadence_client_{module_ref}"));
        for dir in &self.search_dirs {
            let candidate = dir.join(&file);
            if candidate.exists() {
                return Self::load_library(&candidate);
            }
        }
        Err(ModuleError::Unknown(module_ref.to_string()))
    }

    /// Loads a client module from the shared library at `path`.
    #[allow(unsafe_code)]
    pub fn load_library(path: &Path) -> Result<ClientModule, ModuleError> {
        let load_err = |reason: String| ModuleError::Load {
            path: path.to_path_buf(),
            reason,
        };

        // SAFETY: loading runs the library's initializers; client libraries are
        // trusted server extensions.
        let library = unsafe { Library::new(path) }.map_err(|e| load_err(e.to_string()))?;

        // SAFETY: the symbol types match the documented client library ABI.
        let (describe, initialize) = unsafe {
            let describe = *library
                .get::<DescriptorFn>(CLIENT_DESCRIPTOR_SYMBOL)
                .map_err(|e| load_err(e.to_string()))?;
            let initialize = *library
                .get::<InitializeFn>(CLIENT_INITIALIZE_SYMBOL)
                .map_err(|e| load_err(e.to_string()))?;
            (describe, initialize)
        };

        let descriptor = describe();
        tracing::info!(
            module = %descriptor.name,
            path = %path.display(),
            "client library loaded"
        );
        Ok(ClientModule {
            descriptor,
            factory: Arc::new(initialize),
            library: Some(library),
        })
    }
}

/// An internal client loaded into the server.
///
/// Field order matters: the client is dropped before the module that built it.
pub(crate) struct LoadedClient {
    name: String,
    client: Arc<dyn InternalClient>,
    module: ClientModule,
}

impl std::fmt::Debug for LoadedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedClient")
            .field("name", &self.name)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

impl LoadedClient {
    /// Resolves the module and builds the client.
    pub(crate) fn load(
        registry: &InternalClientRegistry,
        ctx: &ClientContext,
        module_ref: &str,
        args: &InitArgs,
    ) -> Result<Self, InternalClientError> {
        let fail = |err: ModuleError| {
            tracing::error!(module = module_ref, error = %err, "internal client load failed");
            InternalClientError::new(err.status())
        };
        let module = registry.load(module_ref).map_err(fail)?;
        let client = module.instantiate(ctx, args).map_err(fail)?;
        Ok(Self {
            name: module_ref.to_string(),
            client,
            module,
        })
    }

    /// Callbacks to register with the engine.
    pub(crate) fn callbacks(&self) -> Arc<dyn ClientCallbacks> {
        Arc::new(InternalCallbacks(Arc::clone(&self.client)))
    }

    /// Lets the client register its ports.
    pub(crate) fn initialize(&self, engine: &mut Engine, refnum: RefNum) -> cadence_core::Result<()> {
        self.client.initialize(engine, refnum)
    }

    /// Runs the client's finish hook.
    pub(crate) fn finish(&self) {
        self.client.finish();
    }

    /// Drops the client, then unmaps its module.
    pub(crate) fn unload(self) {
        let LoadedClient { name, client, module } = self;
        drop(client);
        tracing::debug!(module = %name, "internal client unloaded");
        module.unload();
    }

    /// Drops the client but keeps its module mapped, for a client whose thread
    /// may still be running module code.
    pub(crate) fn abandon(self) {
        let LoadedClient { name, client, module } = self;
        drop(client);
        tracing::warn!(module = %name, "client thread still running; module left loaded");
        module.leak();
    }
}

/// Built-in `inprocess` module: copies `in_N` to `out_N` every cycle.
struct PassThrough {
    channels: u32,
    graph: Arc<GraphManager>,
    ports: Mutex<Vec<(PortId, PortId)>>,
    scratch: Mutex<Vec<f32>>,
}

impl PassThrough {
    fn new(ctx: &ClientContext, channels: u32) -> Self {
        Self {
            channels,
            graph: Arc::clone(&ctx.graph),
            ports: Mutex::new(Vec::new()),
            scratch: Mutex::new(vec![0.0; MAX_BUFFER_SIZE as usize]),
        }
    }
}

impl InternalClient for PassThrough {
    fn initialize(&self, engine: &mut Engine, refnum: RefNum) -> cadence_core::Result<()> {
        let mut ports = Vec::new();
        for i in 1..=self.channels {
            let input = engine.port_register(refnum, &format!("in_{i}"), PortDirection::Input)?;
            let output = engine.port_register(refnum, &format!("out_{i}"), PortDirection::Output)?;
            ports.push((input, output));
        }
        *self.ports.lock() = ports;
        Ok(())
    }

    fn has_process(&self) -> bool {
        true
    }

    fn process(&self, frames: u32) {
        let (Some(ports), Some(mut scratch)) = (self.ports.try_lock(), self.scratch.try_lock())
        else {
            return;
        };
        let frames = (frames as usize).min(scratch.len());
        let buf = &mut scratch[..frames];
        for (input, output) in ports.iter() {
            if self.graph.try_mix_input(*input, buf) {
                self.graph.try_write_buffer(*output, buf);
            }
        }
    }
}

/// Built-in `null` module.
struct NullClient;

impl InternalClient for NullClient {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_args_become_params() {
        let args = InitArgs::Blob("channels=2 verbose".to_string());
        assert_eq!(
            args.to_params(),
            vec![
                DriverParam::new("channels", ParamValue::Str("2".to_string())),
                DriverParam::new("verbose", ParamValue::Bool(true)),
            ]
        );
        assert!(InitArgs::Blob(String::new()).to_params().is_empty());
    }

    #[test]
    fn builtins_registered() {
        let registry = InternalClientRegistry::new();
        assert_eq!(registry.names(), vec!["inprocess", "null"]);
        assert!(!registry.load("null").unwrap().is_dynamic());
    }

    #[test]
    fn unknown_module_is_load_failure() {
        let err = InternalClientRegistry::new().load("nope").unwrap_err();
        assert!(matches!(err, ModuleError::Unknown(_)));
        assert_eq!(err.status(), ClientStatus::LOAD_FAILURE);
    }

    #[test]
    fn missing_library_path_is_load_failure() {
        let err = InternalClientRegistry::new()
            .load("/nonexistent/libcadence_client_x.so")
            .unwrap_err();
        assert!(matches!(err, ModuleError::Load { .. }));
    }

    #[test]
    fn bad_argument_is_init_failure() {
        let ctx = ClientContext {
            graph: Arc::new(GraphManager::new(64)),
            control: Arc::new(EngineControl::new(&cadence_core::EngineSettings::default())),
        };
        let module = InternalClientRegistry::new().load("inprocess").unwrap();
        let err = module
            .instantiate(&ctx, &InitArgs::Blob("channels=two".to_string()))
            .err()
            .unwrap();
        assert!(matches!(err, ModuleError::Params(_)));
        assert_eq!(err.status(), ClientStatus::INIT_FAILURE);
    }
}
