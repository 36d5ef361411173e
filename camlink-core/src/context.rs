//! The device context: merged catalog over every factory.
//!
//! ```text
//!   ContextBuilder::build()
//!     ├─ BackendDeviceFactory          (always first)
//!     └─ ModuleRegistry::instantiate_all
//!          └─ module.create_device_factory()   (name order)
//!
//!   every factory ──(removed, added)──► ChangeSignal ──► subscribers
//! ```
//!
//! User-injected devices are held weakly: once the caller drops its last
//! [`DeviceRef`], the device disappears from queries without an explicit
//! removal.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::{DeviceInfo, DeviceRef, DevicesChangedCallback};
use crate::error::{CamlinkError, Result};
use crate::factory::{BackendDeviceFactory, DeviceFactory, DeviceWatcher, SimulatedBackend};
use crate::mask::ProductLine;
use crate::registry::{ContextModule, ModuleRegistry};
use crate::signal::{ChangeSignal, Subscription};

/// Settings key of the default device-selection mask.
pub const DEVICE_MASK_KEY: &str = "device-mask";

/// Read `device-mask` from the settings tree. Malformed values fall back to
/// [`ProductLine::ANY`] with a warning.
fn configured_mask(settings: &Value) -> ProductLine {
    match settings.get(DEVICE_MASK_KEY) {
        None => ProductLine::ANY,
        Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(bits) => ProductLine::from_bits_retain(bits),
            None => {
                warn!(
                    "{}",
                    CamlinkError::Config(format!("'{DEVICE_MASK_KEY}' must be a u32, got {v}"))
                );
                ProductLine::ANY
            }
        },
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Configures and constructs a [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    settings: Option<Value>,
    backend: Option<Arc<dyn DeviceWatcher>>,
    registry: Option<ModuleRegistry>,
}

impl ContextBuilder {
    pub fn settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Hardware backend to enumerate. Defaults to an empty simulated one.
    pub fn backend(mut self, backend: Arc<dyn DeviceWatcher>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Module registry to instantiate. Defaults to [`ModuleRegistry::global`].
    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Assemble the factories.
    ///
    /// Fails only when the global registry itself is invalid. Module and
    /// factory failures are logged and the offending component left out.
    pub fn build(self) -> Result<Context> {
        let settings = match self.settings {
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(v) if v.is_object() => v,
            Some(v) => {
                warn!("context settings must be an object, ignoring {v}");
                Value::Object(Default::default())
            }
        };
        let device_mask = configured_mask(&settings);

        let signal = ChangeSignal::new();
        let forward: DevicesChangedCallback = {
            let signal = signal.clone();
            Arc::new(move |removed: &[DeviceRef], added: &[DeviceRef]| {
                signal.raise(removed, added)
            })
        };

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(SimulatedBackend::new()));
        let mut factories: Vec<Box<dyn DeviceFactory>> =
            vec![Box::new(BackendDeviceFactory::new(backend, forward.clone()))];

        let modules = match self.registry {
            Some(registry) => registry.instantiate_all(&settings),
            None => ModuleRegistry::global()?.instantiate_all(&settings),
        };
        for module in &modules {
            match module.create_device_factory(forward.clone()) {
                Ok(Some(factory)) => {
                    debug!("module '{}' added factory '{}'", module.name(), factory.name());
                    factories.push(factory);
                }
                Ok(None) => {}
                Err(e) => warn!("module '{}' failed to create its factory: {e}", module.name()),
            }
        }

        info!(
            factories = factories.len(),
            modules = modules.len(),
            "context created (device mask {:#x})",
            device_mask.bits()
        );

        Ok(Context {
            settings,
            device_mask,
            factories,
            modules,
            user_devices: Mutex::new(BTreeMap::new()),
            signal,
        })
    }
}

// ── Context ──────────────────────────────────────────────────────

/// Aggregates device factories and user-injected devices.
pub struct Context {
    settings: Value,
    device_mask: ProductLine,
    factories: Vec<Box<dyn DeviceFactory>>,
    modules: Vec<Box<dyn ContextModule>>,
    user_devices: Mutex<BTreeMap<String, Weak<DeviceInfo>>>,
    signal: ChangeSignal,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// A context over the global module registry and an empty backend.
    pub fn new(settings: Value) -> Result<Self> {
        Self::builder().settings(settings).build()
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Default mask read from `device-mask`.
    pub fn device_mask(&self) -> ProductLine {
        self.device_mask
    }

    /// Factory names, in enumeration order.
    pub fn factory_names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Names of the enabled modules.
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Every visible device passing `requested` combined with the
    /// configured mask, followed by live user-injected devices.
    ///
    /// An address is listed at most once per call.
    pub fn query_devices(&self, requested: ProductLine) -> Vec<DeviceRef> {
        let mask = ProductLine::combine(requested, self.device_mask);
        let mut seen = HashSet::new();
        let mut list = Vec::new();

        for factory in &self.factories {
            for dev in factory.query_devices(mask) {
                if !seen.insert(dev.address().to_string()) {
                    debug!("{}: duplicate address {} skipped", factory.name(), dev.address());
                    continue;
                }
                info!("  {}", dev.address());
                list.push(dev);
            }
        }

        {
            let mut users = self.user_devices.lock();
            users.retain(|_, weak| weak.strong_count() > 0);
            for (address, weak) in users.iter() {
                let Some(dev) = weak.upgrade() else { continue };
                if !dev.is_alive() || !seen.insert(address.clone()) {
                    continue;
                }
                info!("  {address}");
                list.push(dev);
            }
        }

        info!(
            "found {} devices (mask {:#x} requested & {:#x} from settings)",
            list.len(),
            requested.bits(),
            self.device_mask.bits()
        );
        list
    }

    /// Inject a device. Fails if a live device with the same address is
    /// already present; otherwise notifies subscribers with `added: [dev]`.
    pub fn add_device(&self, dev: &DeviceRef) -> Result<()> {
        {
            let mut users = self.user_devices.lock();
            let present = users
                .get(dev.address())
                .and_then(Weak::upgrade)
                .is_some_and(|d| d.is_alive());
            if present {
                return Err(CamlinkError::DuplicateDevice(dev.address().to_string()));
            }
            users.insert(dev.address().to_string(), Arc::downgrade(dev));
        }
        self.signal.raise(&[], std::slice::from_ref(dev));
        Ok(())
    }

    /// Remove an injected device by address.
    ///
    /// Removing an unknown address, or one whose device has already been
    /// dropped, does nothing. Otherwise subscribers see `removed: [dev]`.
    pub fn remove_device(&self, dev: &DeviceRef) {
        let stored = {
            let mut users = self.user_devices.lock();
            match users.remove(dev.address()) {
                Some(weak) => weak.upgrade(),
                None => return,
            }
        };
        if let Some(stored) = stored {
            self.signal.raise(std::slice::from_ref(&stored), &[]);
        }
    }

    /// Register for `(removed, added)` events from every factory and from
    /// [`add_device`](Self::add_device)/[`remove_device`](Self::remove_device).
    pub fn on_device_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[DeviceRef], &[DeviceRef]) + Send + Sync + 'static,
    {
        self.signal.subscribe(Arc::new(callback))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device_mask", &self.device_mask)
            .field("factories", &self.factory_names())
            .field("modules", &self.module_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::device::DeviceOrigin;
    use crate::factory::BackendDevice;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(ctx: &Context) -> (Log, Subscription) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let sub = ctx.on_device_changes(move |removed, added| {
            for d in removed {
                sink.lock().push(format!("-{}", d.address()));
            }
            for d in added {
                sink.lock().push(format!("+{}", d.address()));
            }
        });
        (log, sub)
    }

    fn bare(settings: Value) -> Context {
        Context::builder()
            .settings(settings)
            .registry(ModuleRegistry::new())
            .build()
            .unwrap()
    }

    fn cam(id: &str, line: ProductLine) -> BackendDevice {
        BackendDevice {
            id: id.into(),
            vendor_id: 0x1d6b,
            product_id: 0x0104,
            product_line: line,
        }
    }

    /// Always reports the same fixed list, ignoring the mask.
    struct Fixed(Vec<DeviceRef>);

    impl DeviceFactory for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn query_devices(&self, _mask: ProductLine) -> Vec<DeviceRef> {
            self.0.clone()
        }
    }

    struct FixedModule;

    impl ContextModule for FixedModule {
        fn name(&self) -> &str {
            "fixed"
        }
        fn initialize(&mut self, _settings: Option<&Value>) -> Result<bool> {
            Ok(true)
        }
        fn create_device_factory(
            &self,
            _callback: DevicesChangedCallback,
        ) -> Result<Option<Box<dyn DeviceFactory>>> {
            let dup = Arc::new(DeviceInfo::new(
                "usb:1-1",
                ProductLine::STEREO,
                DeviceOrigin::Software,
            ));
            Ok(Some(Box::new(Fixed(vec![dup]))))
        }
    }

    struct FailingModule;

    impl ContextModule for FailingModule {
        fn name(&self) -> &str {
            "failing"
        }
        fn initialize(&mut self, _settings: Option<&Value>) -> Result<bool> {
            Ok(true)
        }
        fn create_device_factory(
            &self,
            _callback: DevicesChangedCallback,
        ) -> Result<Option<Box<dyn DeviceFactory>>> {
            Err(CamlinkError::Transport("cannot open".into()))
        }
    }

    fn fixed_module(_name: &str) -> Result<Box<dyn ContextModule>> {
        Ok(Box::new(FixedModule))
    }

    fn failing_module(_name: &str) -> Result<Box<dyn ContextModule>> {
        Ok(Box::new(FailingModule))
    }

    #[test]
    fn add_then_remove_fires_exactly_twice() {
        let ctx = bare(json!({}));
        let (log, _sub) = record(&ctx);
        let x = DeviceInfo::software("X");

        ctx.add_device(&x).unwrap();
        ctx.remove_device(&x);
        ctx.remove_device(&x);

        assert_eq!(*log.lock(), ["+X", "-X"]);
    }

    #[test]
    fn duplicate_live_device_is_rejected() {
        let ctx = bare(json!({}));
        let a = DeviceInfo::software("dup");
        let b = DeviceInfo::software("dup");
        ctx.add_device(&a).unwrap();
        let err = ctx.add_device(&b).unwrap_err();
        assert!(matches!(err, CamlinkError::DuplicateDevice(addr) if addr == "dup"));
    }

    #[test]
    fn dropped_user_device_can_be_replaced() {
        let ctx = bare(json!({}));
        let (log, _sub) = record(&ctx);
        {
            let a = DeviceInfo::software("re");
            ctx.add_device(&a).unwrap();
        }
        assert!(ctx.query_devices(ProductLine::SW_ONLY).is_empty());

        let b = DeviceInfo::software("re");
        ctx.add_device(&b).unwrap();
        assert_eq!(ctx.query_devices(ProductLine::ANY).len(), 1);

        // Removing after the owner let go is silent.
        let c = DeviceInfo::software("gone");
        ctx.add_device(&c).unwrap();
        let stale = DeviceInfo::software("gone");
        drop(c);
        ctx.remove_device(&stale);
        assert_eq!(*log.lock(), ["+re", "+re", "+gone"]);
    }

    #[test]
    fn backend_devices_are_filtered_by_combined_mask() {
        let backend = Arc::new(SimulatedBackend::with_devices(vec![
            cam("1-1", ProductLine::STEREO),
            cam("1-2", ProductLine::TRACKING),
        ]));
        let ctx = Context::builder()
            .settings(json!({ "device-mask": ProductLine::DEPTH.bits() }))
            .backend(backend)
            .registry(ModuleRegistry::new())
            .build()
            .unwrap();

        assert_eq!(ctx.device_mask(), ProductLine::DEPTH);
        let all = ctx.query_devices(ProductLine::ANY);
        let addrs: Vec<&str> = all.iter().map(|d| d.address()).collect();
        assert_eq!(addrs, ["usb:1-1"]);
        assert!(ctx.query_devices(ProductLine::TRACKING).is_empty());
    }

    #[test]
    fn backend_changes_reach_subscribers() {
        let backend = Arc::new(SimulatedBackend::new());
        let ctx = Context::builder()
            .backend(backend.clone())
            .registry(ModuleRegistry::new())
            .build()
            .unwrap();
        let (log, sub) = record(&ctx);

        backend.plug(cam("9-9", ProductLine::LIDAR));
        backend.unplug("9-9");
        drop(sub);
        backend.plug(cam("9-8", ProductLine::LIDAR));

        assert_eq!(*log.lock(), ["+usb:9-9", "-usb:9-9"]);
    }

    #[test]
    fn same_address_from_two_factories_is_listed_once() {
        let backend = Arc::new(SimulatedBackend::with_devices(vec![cam(
            "1-1",
            ProductLine::STEREO,
        )]));
        let mut registry = ModuleRegistry::new();
        registry.register("fixed", fixed_module).unwrap();
        registry.register("failing", failing_module).unwrap();

        let ctx = Context::builder()
            .backend(backend)
            .registry(registry)
            .build()
            .unwrap();
        assert_eq!(ctx.factory_names(), ["backend", "fixed"]);
        assert_eq!(ctx.module_names(), ["failing", "fixed"]);

        let list = ctx.query_devices(ProductLine::ANY);
        assert_eq!(list.len(), 1);
        assert!(!list[0].is_software_only());
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let ctx = bare(json!({ "device-mask": "everything" }));
        assert_eq!(ctx.device_mask(), ProductLine::ANY);
        let ctx = bare(json!([1, 2]));
        assert_eq!(ctx.device_mask(), ProductLine::ANY);
    }

    #[test]
    fn software_devices_are_listed_after_factories() {
        let backend = Arc::new(SimulatedBackend::with_devices(vec![cam(
            "2-1",
            ProductLine::STEREO,
        )]));
        let ctx = Context::builder()
            .backend(backend)
            .registry(ModuleRegistry::new())
            .build()
            .unwrap();
        let sw = DeviceInfo::software("sw/1");
        ctx.add_device(&sw).unwrap();

        let list = ctx.query_devices(ProductLine::ANY);
        let addrs: Vec<&str> = list.iter().map(|d| d.address()).collect();
        assert_eq!(addrs, ["usb:2-1", "sw/1"]);
    }
}
