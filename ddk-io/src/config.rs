//! Host construction and JSON configuration.
//!
//! [`DevHostBuilder`] collects drivers and options, then starts the host and
//! publishes the platform devices named in the configuration under the root.
//!
//! # Example
//!
//! ```
//! use ddk_io::DevHost;
//!
//! let config = r#"{
//!     "name": "board",
//!     "devices": [
//!         { "name": "uart0", "props": [ { "key": 768, "value": 1 } ] },
//!         { "name": "gpio", "invisible": true }
//!     ]
//! }"#;
//!
//! let host = DevHost::builder().json_data(config).build()?;
//! assert_eq!(host.name(), "board");
//! assert!(host.find("uart0").is_some());
//! host.shutdown()?;
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::device::DeviceAddArgs;
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Error, Result};
use crate::host::DevHost;
use crate::props::{DeviceProp, PropertyTable};
use crate::protocol::Protocol;

const DEFAULT_NAME: &str = "devhost";

/// Host configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub autobind: Option<bool>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// A platform device published under the root at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    /// Protocol id; the device publishes it with empty ops.
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub props: Vec<DeviceProp>,
    #[serde(default)]
    pub invisible: bool,
    #[serde(default)]
    pub non_bindable: bool,
}

impl HostConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: HostConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> Result<()> {
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.name.is_empty() {
                return Err(Error::Config(format!("device {i} has an empty name")));
            }
            if self.devices[..i].iter().any(|d| d.name == dev.name) {
                return Err(Error::Config(format!("duplicate device {}", dev.name)));
            }
        }
        Ok(())
    }
}

impl From<&DeviceConfig> for DeviceAddArgs {
    fn from(dev: &DeviceConfig) -> Self {
        let mut args = DeviceAddArgs::new(&dev.name)
            .props(PropertyTable::new(dev.props.clone()))
            .invisible(dev.invisible)
            .non_bindable(dev.non_bindable);
        if let Some(id) = dev.protocol {
            args = args.protocol(Protocol::new(id, ()));
        }
        args
    }
}

/// Builder for [`DevHost`].
pub struct DevHostBuilder {
    name: Option<String>,
    autobind: Option<bool>,
    drivers: Vec<Arc<dyn Driver>>,
    config_file: Option<String>,
    json_data: Option<String>,
}

impl DevHostBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            autobind: None,
            drivers: Vec::new(),
            config_file: None,
            json_data: None,
        }
    }

    /// Host name. Overrides the configuration's name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Register a driver. Drivers are tried in the order they are added.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Offer visible devices to drivers automatically. Defaults to `true`.
    pub fn autobind(mut self, autobind: bool) -> Self {
        self.autobind = Some(autobind);
        self
    }

    /// Path to a JSON host configuration.
    pub fn config_file(mut self, path: &str) -> Self {
        self.config_file = Some(path.to_string());
        self
    }

    /// JSON host configuration given inline, instead of a file.
    pub fn json_data(mut self, json: &str) -> Self {
        self.json_data = Some(json.to_string());
        self
    }

    /// Validate the drivers and configuration, start the host, and publish
    /// the configured devices.
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] if both a file and inline JSON are given, or the
    ///   configuration is inconsistent
    /// * [`Error::Json`] / [`Error::Io`] if the configuration cannot be read
    /// * [`Error::InvalidArgument`] if a driver is rejected by the registry
    pub fn build(self) -> Result<DevHost> {
        let config = match (&self.config_file, &self.json_data) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "config_file and json_data are mutually exclusive".to_string(),
                ));
            }
            (Some(path), None) => HostConfig::from_file(path)?,
            (None, Some(json)) => HostConfig::from_json(json)?,
            (None, None) => HostConfig::default(),
        };

        let mut registry = DriverRegistry::new();
        for driver in self.drivers {
            registry.register(driver)?;
        }

        let name = self
            .name
            .or(config.name.clone())
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        let autobind = self.autobind.or(config.autobind).unwrap_or(true);

        let host = DevHost::start(&name, autobind, registry)?;
        let root = host.root();
        for dev in &config.devices {
            let id = host.add_device(root, dev.into())?;
            debug!("configured device {} is {id}", dev.name);
        }
        info!(
            "host {name}: {} configured devices, autobind {autobind}",
            config.devices.len()
        );
        Ok(host)
    }
}

impl Default for DevHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use crate::props::keys;

    #[test]
    fn test_parse_full() {
        let config = HostConfig::from_json(
            r#"{
                "name": "host0",
                "autobind": false,
                "devices": [
                    { "name": "pci-00:1f.2", "protocol": 4,
                      "props": [ { "key": 1, "value": 4 }, { "key": 257, "value": 1 } ],
                      "invisible": false, "non_bindable": true }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.name.as_deref(), Some("host0"));
        assert_eq!(config.autobind, Some(false));
        let dev = &config.devices[0];
        assert_eq!(dev.protocol, Some(4));
        assert_eq!(dev.props[1], DeviceProp::new(keys::BIND_PCI_DID, 1));
        assert!(dev.non_bindable);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            HostConfig::from_json(r#"{ "name": "x", "colour": "red" }"#),
            Err(Error::Json(_))
        ));
        assert!(HostConfig::from_json(r#"{ "devices": [ { "name": "a", "irq": 3 } ] }"#).is_err());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let err = HostConfig::from_json(r#"{ "devices": [ { "name": "a" }, { "name": "a" } ] }"#)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_build_publishes_devices() {
        let host = DevHostBuilder::new()
            .name("override")
            .json_data(
                r#"{ "name": "cfg", "devices": [
                    { "name": "a" }, { "name": "b", "invisible": true } ] }"#,
            )
            .build()
            .unwrap();
        assert_eq!(host.name(), "override");
        let a = host.find("a").unwrap();
        let b = host.find("b").unwrap();
        assert_eq!(host.state(a).unwrap(), DeviceState::Visible);
        assert_eq!(host.state(b).unwrap(), DeviceState::Bound);
        assert_eq!(host.parent(a).unwrap(), Some(host.root()));
        host.shutdown().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let result = DevHostBuilder::new()
            .config_file("/nonexistent/ddk-io-host.json")
            .build();
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_file_and_json_exclusive() {
        let result = DevHostBuilder::new()
            .config_file("host.json")
            .json_data("{}")
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
