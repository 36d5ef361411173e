//! Context modules and the process-wide module registry.
//!
//! A context module is an optional, per-context adapter that may contribute
//! a [`DeviceFactory`]. Modules are registered statically with
//! [`inventory::submit!`]:
//!
//! ```ignore
//! inventory::submit! {
//!     ModuleRegistration::new("bus", BusModule::construct)
//! }
//! ```
//!
//! The first call to [`ModuleRegistry::global`] collects every submission
//! into a name-ordered table. Registration is therefore complete before any
//! context reads it, and a duplicate name is reported instead of silently
//! shadowing another module.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::DevicesChangedCallback;
use crate::error::{CamlinkError, Result};
use crate::factory::DeviceFactory;

/// Per-context adapter that may contribute a device factory.
pub trait ContextModule: Send + Sync {
    /// Unique, non-empty name. Also the key of the module's settings sub-tree.
    fn name(&self) -> &str;

    /// One-time setup from the module's settings sub-tree (`None` when the
    /// key is absent). Returns whether the module is enabled.
    fn initialize(&mut self, settings: Option<&Value>) -> Result<bool>;

    /// Build this module's device factory, if it has one.
    fn create_device_factory(
        &self,
        callback: DevicesChangedCallback,
    ) -> Result<Option<Box<dyn DeviceFactory>>>;
}

/// Builds a module given its registered name.
pub type ModuleConstructor = fn(&str) -> Result<Box<dyn ContextModule>>;

/// A static registration entry.
pub struct ModuleRegistration {
    pub name: &'static str,
    pub constructor: ModuleConstructor,
}

impl ModuleRegistration {
    pub const fn new(name: &'static str, constructor: ModuleConstructor) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(ModuleRegistration);

/// Name-ordered table of module constructors.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleConstructor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constructor under `name`.
    ///
    /// Returns the registry size after insertion. The value only orders
    /// registration; it is not an index.
    pub fn register(&mut self, name: &str, constructor: ModuleConstructor) -> Result<usize> {
        if name.is_empty() {
            return Err(CamlinkError::EmptyModuleName);
        }
        if self.modules.contains_key(name) {
            return Err(CamlinkError::DuplicateModule(name.to_string()));
        }
        self.modules.insert(name.to_string(), constructor);
        Ok(self.modules.len())
    }

    /// Collect every [`ModuleRegistration`] linked into the binary.
    pub fn from_inventory() -> Result<Self> {
        let mut registry = Self::new();
        for entry in inventory::iter::<ModuleRegistration> {
            registry.register(entry.name, entry.constructor)?;
        }
        Ok(registry)
    }

    /// The process-wide registry, built on first use.
    pub fn global() -> Result<&'static ModuleRegistry> {
        static GLOBAL: OnceLock<Result<ModuleRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(Self::from_inventory).as_ref().map_err(Clone::clone)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names, in iteration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Construct and initialize every module, in name order.
    ///
    /// Each module receives `settings[name]`. A module that fails to
    /// construct or initialize is logged and left out, as is one that
    /// declines. Only enabled modules are returned.
    pub fn instantiate_all(&self, settings: &Value) -> Vec<Box<dyn ContextModule>> {
        let mut enabled = Vec::new();
        for (name, constructor) in &self.modules {
            let mut module = match constructor(name) {
                Ok(m) => m,
                Err(e) => {
                    warn!("failed to create context module '{name}': {e}");
                    continue;
                }
            };
            if module.name().is_empty() {
                warn!("context module registered as '{name}': {}", CamlinkError::EmptyModuleName);
                continue;
            }
            match module.initialize(settings.get(name)) {
                Ok(true) => {
                    info!("context module '{name}' enabled");
                    enabled.push(module);
                }
                Ok(false) => debug!("context module '{name}' disabled"),
                Err(e) => warn!("failed to initialize context module '{name}': {e}"),
            }
        }
        enabled
    }
}
