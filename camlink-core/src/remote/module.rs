//! The `bus` context module.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::watcher::BusDeviceFactory;
use crate::bus::{DomainId, MAX_DOMAIN_ID, Participant};
use crate::device::DevicesChangedCallback;
use crate::error::{CamlinkError, Result};
use crate::factory::DeviceFactory;
use crate::registry::{ContextModule, ModuleRegistration};

/// Name of the module and of its settings sub-tree.
pub const BUS_MODULE_NAME: &str = "bus";

/// `settings["bus"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BusSettings {
    pub domain: DomainId,
    pub participant_name: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            domain: 0,
            participant_name: "camlink".to_string(),
        }
    }
}

/// Contributes a [`BusDeviceFactory`] on the configured domain.
///
/// Enabled when its settings key is absent (defaults) or an object.
/// Any other value disables it.
pub struct BusModule {
    name: String,
    settings: BusSettings,
}

impl BusModule {
    pub fn construct(name: &str) -> Result<Box<dyn ContextModule>> {
        Ok(Box::new(Self {
            name: name.to_string(),
            settings: BusSettings::default(),
        }))
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }
}

impl ContextModule for BusModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, settings: Option<&Value>) -> Result<bool> {
        let settings = match settings {
            None => BusSettings::default(),
            Some(v) if v.is_object() => BusSettings::deserialize(v)?,
            Some(v) => {
                debug!("'{}' settings are not an object ({v}); disabled", self.name);
                return Ok(false);
            }
        };
        if settings.domain > MAX_DOMAIN_ID {
            return Err(CamlinkError::Config(format!(
                "{}.domain {} out of range (max {MAX_DOMAIN_ID})",
                self.name, settings.domain
            )));
        }
        self.settings = settings;
        Ok(true)
    }

    fn create_device_factory(
        &self,
        callback: DevicesChangedCallback,
    ) -> Result<Option<Box<dyn DeviceFactory>>> {
        let participant = Participant::new(self.settings.domain, &self.settings.participant_name)?;
        Ok(Some(Box::new(BusDeviceFactory::new(participant, callback)?)))
    }
}

inventory::submit! {
    ModuleRegistration::new(BUS_MODULE_NAME, BusModule::construct)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn module() -> Box<dyn ContextModule> {
        BusModule::construct(BUS_MODULE_NAME).unwrap()
    }

    #[test]
    fn absent_settings_enable_with_defaults() {
        let mut m = module();
        assert!(m.initialize(None).unwrap());
        assert_eq!(m.name(), "bus");
    }

    #[test]
    fn object_settings_are_parsed() {
        let mut m = BusModule {
            name: "bus".into(),
            settings: BusSettings::default(),
        };
        let v = json!({ "domain": 7, "participant-name": "host-a" });
        assert!(m.initialize(Some(&v)).unwrap());
        assert_eq!(m.settings().domain, 7);
        assert_eq!(m.settings().participant_name, "host-a");
    }

    #[test]
    fn non_object_settings_disable() {
        let mut m = module();
        assert!(!m.initialize(Some(&json!(false))).unwrap());
        assert!(!m.initialize(Some(&json!("on"))).unwrap());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let mut m = module();
        let err = m.initialize(Some(&json!({ "domain": 500 }))).unwrap_err();
        assert!(matches!(err, CamlinkError::Config(_)));
        let err = m.initialize(Some(&json!({ "domain": "x" }))).unwrap_err();
        assert!(matches!(err, CamlinkError::Config(_)));
    }
}
