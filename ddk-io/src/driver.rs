//! Drivers and the driver registry.
//!
//! A [`Driver`] pairs a validated [`BindProgram`] with a bind hook. When the
//! program matches a device, the host runs the hook on its control thread with
//! a [`BindContext`]; the hook publishes exactly one device through it.
//!
//! ```
//! use ddk_io::binding::{BindInst, BindProgram, Cond};
//! use ddk_io::device::DeviceAddArgs;
//! use ddk_io::driver::{BindContext, Driver};
//! use ddk_io::props::keys;
//!
//! struct Ahci {
//!     program: BindProgram,
//! }
//!
//! impl Driver for Ahci {
//!     fn name(&self) -> &str {
//!         "ahci"
//!     }
//!
//!     fn bind_program(&self) -> &BindProgram {
//!         &self.program
//!     }
//!
//!     fn bind(&self, ctx: &mut BindContext<'_>) -> ddk_io::Result<()> {
//!         ctx.add_device(DeviceAddArgs::new("ahci"))?;
//!         Ok(())
//!     }
//! }
//!
//! let program = BindProgram::new(
//!     "acme",
//!     "1.0",
//!     vec![BindInst::match_if(Cond::Eq, keys::BIND_PCI_CLASS, 1)],
//! )?;
//! let driver = Ahci { program };
//! assert_eq!(driver.bind_program().len(), 1);
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::sync::Arc;

use log::{error, info};

use crate::binding::BindProgram;
use crate::device::{DeviceAddArgs, DeviceId};
use crate::error::{Error, Result};
use crate::host::DevHost;

pub trait Driver: Send + Sync {
    /// Unique name within a host.
    fn name(&self) -> &str;

    fn bind_program(&self) -> &BindProgram;

    /// Bind to `ctx.parent()`.
    ///
    /// Must publish exactly one device with [`BindContext::add_device`] on
    /// success. Returning an error removes any device already published and
    /// leaves the parent unbound. Must not block on long-running work; start
    /// that on a worker and publish invisible.
    fn bind(&self, ctx: &mut BindContext<'_>) -> Result<()>;
}

/// Handed to [`Driver::bind`].
pub struct BindContext<'a> {
    host: &'a DevHost,
    parent: DeviceId,
    driver: &'a str,
    created: Option<DeviceId>,
}

impl<'a> BindContext<'a> {
    pub(crate) fn new(host: &'a DevHost, parent: DeviceId, driver: &'a str) -> Self {
        Self {
            host,
            parent,
            driver,
            created: None,
        }
    }

    /// The device being bound to.
    pub fn parent(&self) -> DeviceId {
        self.parent
    }

    pub fn host(&self) -> &DevHost {
        self.host
    }

    /// Publish this driver's device under the parent.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if this bind already published a device, plus any
    /// error from [`DevHost::add_device`].
    pub fn add_device(&mut self, args: DeviceAddArgs) -> Result<DeviceId> {
        if let Some(existing) = self.created {
            return Err(Error::BadState(format!(
                "driver {} already published {existing}",
                self.driver
            )));
        }
        let id = self
            .host
            .add_device_for(self.parent, args, Some(self.driver))?;
        self.created = Some(id);
        Ok(id)
    }

    pub(crate) fn created(&self) -> Option<DeviceId> {
        self.created
    }
}

/// Drivers known to a host, in registration order.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an empty or duplicate name, or a bind
    /// program without a vendor. The registry is unchanged on error.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<()> {
        let name = driver.name();
        if name.is_empty() {
            error!("rejecting driver with empty name");
            return Err(Error::InvalidArgument("driver name is empty".to_string()));
        }
        if self.get(name).is_some() {
            error!("rejecting duplicate driver {name}");
            return Err(Error::InvalidArgument(format!(
                "driver {name} already registered"
            )));
        }
        let program = driver.bind_program();
        if program.vendor().is_empty() {
            error!("rejecting driver {name}: bind program has no vendor");
            return Err(Error::InvalidArgument(format!(
                "driver {name}: bind program has no vendor"
            )));
        }
        info!(
            "registered driver {name} ({} {}, {} directives)",
            program.vendor(),
            program.version(),
            program.len()
        );
        self.drivers.push(driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.iter()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.drivers.iter().map(|d| d.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindInst;

    struct Named {
        name: &'static str,
        program: BindProgram,
    }

    impl Driver for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn bind_program(&self) -> &BindProgram {
            &self.program
        }

        fn bind(&self, _ctx: &mut BindContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn driver(name: &'static str, vendor: &str) -> Arc<dyn Driver> {
        Arc::new(Named {
            name,
            program: BindProgram::new(vendor, "1", vec![BindInst::match_always()]).unwrap(),
        })
    }

    #[test]
    fn test_register_in_order() {
        let mut reg = DriverRegistry::new();
        reg.register(driver("a", "v")).unwrap();
        reg.register(driver("b", "v")).unwrap();
        let names: Vec<_> = reg.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(reg.get("b").is_some());
        assert!(reg.get("c").is_none());
    }

    #[test]
    fn test_register_rejects() {
        let mut reg = DriverRegistry::new();
        reg.register(driver("a", "v")).unwrap();
        assert!(matches!(
            reg.register(driver("a", "v")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(reg.register(driver("", "v")).is_err());
        assert!(reg.register(driver("b", "")).is_err());
        assert_eq!(reg.len(), 1);
    }
}
