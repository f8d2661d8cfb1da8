//! User-space driver host core.
//!
//! This crate provides the pieces a driver host is built from: bind programs
//! that match drivers to devices, a device tree with a strict lifecycle, typed
//! protocol capabilities between parent and child devices, and an
//! asynchronous transaction pipeline with zero-copy clones and exactly-once
//! completion.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use ddk_io::binding::{BindInst, BindProgram, Cond};
//! use ddk_io::device::DeviceAddArgs;
//! use ddk_io::driver::{BindContext, Driver};
//! use ddk_io::props::{DeviceProp, keys};
//! use ddk_io::{DevHost, Result};
//!
//! struct Serial {
//!     program: BindProgram,
//! }
//!
//! impl Driver for Serial {
//!     fn name(&self) -> &str {
//!         "serial"
//!     }
//!
//!     fn bind_program(&self) -> &BindProgram {
//!         &self.program
//!     }
//!
//!     fn bind(&self, ctx: &mut BindContext<'_>) -> Result<()> {
//!         ctx.add_device(DeviceAddArgs::new("ttyS0"))?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let program = BindProgram::new(
//!         "acme",
//!         "1.0",
//!         vec![BindInst::match_if(Cond::Eq, keys::BIND_PLATFORM_DEV_VID, 0x10)],
//!     )?;
//!     let host = DevHost::builder()
//!         .name("quickstart")
//!         .driver(Arc::new(Serial { program }))
//!         .build()?;
//!
//!     let uart = host.add_device(
//!         host.root(),
//!         DeviceAddArgs::new("uart").props(vec![DeviceProp::new(keys::BIND_PLATFORM_DEV_VID, 0x10)]),
//!     )?;
//!     host.settle()?;
//!     assert_eq!(host.bound_driver(uart)?.as_deref(), Some("serial"));
//!
//!     host.shutdown()
//! }
//! ```
//!
//! # Modules
//!
//! - [`props`] - Device property tables
//! - [`binding`] - Bind programs and their evaluator
//! - [`device`] - Device nodes, lifecycle states, and device hooks
//! - [`driver`] - Driver trait and registry
//! - [`protocol`] - Protocol capabilities and handles
//! - [`host`] - The device host coordinator
//! - [`config`] - Host builder and JSON configuration
//! - [`txn`] - I/O transactions
//! - [`buffer`] - Shared, physically paged I/O buffers
//! - [`phys_iter`] - Scatter-gather iteration
//! - [`interrupt`] - Interrupt handles and dispatch threads
//! - [`thread`] - Worker threads
//! - [`complete`] - Callback-to-future utilities
//! - [`error`] - Error and status types

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod binding;
pub mod buffer;
pub mod complete;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod phys_iter;
pub mod props;
pub mod protocol;
pub mod thread;
pub mod txn;

// Re-exports
pub use binding::{BindMode, BindProgram, BindResult, evaluate};
pub use buffer::{IoBuffer, PhysMap, SimPhysMap};
pub use complete::{CompletionReceiver, CompletionSender, block_on, completion};
pub use config::{DevHostBuilder, HostConfig};
pub use device::{DeviceAddArgs, DeviceEvent, DeviceId, DeviceOps, DeviceState};
pub use driver::{BindContext, Driver, DriverRegistry};
pub use error::{Error, Result, Status};
pub use host::DevHost;
pub use interrupt::{Interrupt, InterruptThread};
pub use phys_iter::PhysIter;
pub use props::{DeviceProp, PropertyTable};
pub use protocol::{Protocol, ProtocolHandle, ProtocolId};
pub use thread::{JoinHandle, WorkerHandle, WorkerThread};
pub use txn::{Completion, Opcode, Transaction, TxnId};

/// Lock a host-internal mutex.
///
/// A poisoned lock means a driver hook panicked; the host treats that like a
/// driver crash and keeps going with the data as it stands.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
