//! The device host.
//!
//! [`DevHost`] is the coordinator: it owns the device tree and the driver
//! registry, matches drivers to devices, routes transactions to device hooks,
//! and tears devices down. It is an explicit context object; clones share one
//! host and it lives from [`DevHostBuilder::build`] to [`DevHost::shutdown`].
//!
//! # Threads
//!
//! Each host runs one control thread. Autobind, manual bind requests, and the
//! driver bind hooks they trigger all run there, one at a time. Everything
//! else (I/O, visibility, removal, queries) runs on the caller's thread.
//!
//! The tree lock is never held while driver code runs.
//!
//! # Example
//!
//! ```
//! use ddk_io::device::DeviceAddArgs;
//! use ddk_io::{DevHost, DeviceState};
//!
//! let host = DevHost::builder().name("doc").build()?;
//! let dev = host.add_device(host.root(), DeviceAddArgs::new("widget").invisible(true))?;
//! assert_eq!(host.state(dev)?, DeviceState::Bound);
//!
//! host.make_visible(dev)?;
//! assert!(host.make_visible(dev).is_err());
//!
//! host.remove(dev)?;
//! assert_eq!(host.state(dev)?, DeviceState::Removed);
//! host.shutdown()?;
//! # Ok::<(), ddk_io::Error>(())
//! ```
//!
//! [`DevHostBuilder::build`]: crate::config::DevHostBuilder::build

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, info, warn};

use crate::binding::BindMode;
use crate::complete::{CompletionReceiver, completion};
use crate::config::DevHostBuilder;
use crate::device::{
    DeviceAddArgs, DeviceContext, DeviceEvent, DeviceId, DeviceOps, DeviceState, DeviceTree, Node,
};
use crate::driver::{BindContext, Driver, DriverRegistry};
use crate::error::{Error, Result, Status};
use crate::lock;
use crate::props::{PropertyLookup, PropertyTable, keys};
use crate::protocol::ProtocolHandle;
use crate::thread::{WorkerHandle, WorkerThread};
use crate::txn::{Completion, InflightSet, Transaction};

struct HostInner {
    name: String,
    autobind: bool,
    tree: Mutex<DeviceTree>,
    drivers: Mutex<DriverRegistry>,
    control: WorkerHandle,
    worker: Mutex<Option<WorkerThread>>,
    pending: Mutex<usize>,
    idle: Condvar,
    watchers: Mutex<Vec<mpsc::Sender<DeviceEvent>>>,
    stopped: AtomicBool,
    /// Devices claimed by a running `remove`, and the thread running it.
    removals: Mutex<HashMap<DeviceId, ThreadId>>,
    removal_done: Condvar,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        let tree = self.tree.get_mut().unwrap_or_else(PoisonError::into_inner);
        let forced: usize = tree
            .nodes()
            .map(|node| node.inflight.close_and_force(Status::IoNotPresent))
            .sum();
        if forced > 0 {
            warn!("host {} dropped with {forced} transactions in flight", self.name);
        }
    }
}

/// Handle to a device host.
#[derive(Clone)]
pub struct DevHost {
    inner: Arc<HostInner>,
}

/// Outcome of offering one device to one driver.
enum BindAttempt {
    NoMatch,
    Bound(DeviceId),
    Rejected(Error),
}

/// A device's properties as the bind evaluator sees them.
struct BindView<'a> {
    props: &'a PropertyTable,
    protocol: Option<u32>,
    mode: BindMode,
}

impl PropertyLookup for BindView<'_> {
    fn lookup(&self, key: u32) -> Option<u32> {
        self.props.get(key).or_else(|| match key {
            keys::BIND_PROTOCOL => self.protocol,
            keys::BIND_AUTOBIND => Some(u32::from(self.mode == BindMode::Autobind)),
            _ => None,
        })
    }
}

/// One step of a subtree removal, in postorder.
enum RemoveStep {
    /// This call owns the device and tears it down.
    Remove {
        dev: DeviceId,
        name: String,
        ops: Arc<dyn DeviceOps>,
        inflight: Arc<InflightSet>,
        parent: Option<DeviceId>,
    },
    /// Another thread is already removing the device.
    Await(DeviceId),
}

/// Decrements the control-queue counter when a posted task ends.
struct TaskGuard<'a>(&'a DevHost);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.0.task_done();
    }
}

impl DevHost {
    pub fn builder() -> DevHostBuilder {
        DevHostBuilder::new()
    }

    pub(crate) fn start(name: &str, autobind: bool, drivers: DriverRegistry) -> Result<Self> {
        let worker = WorkerThread::spawn(&format!("{name}-ctl"))?;
        let root = Node::new(DeviceAddArgs::new("root").non_bindable(true), None);
        let host = DevHost {
            inner: Arc::new(HostInner {
                name: name.to_string(),
                autobind,
                tree: Mutex::new(DeviceTree::new(root)),
                drivers: Mutex::new(drivers),
                control: worker.handle(),
                worker: Mutex::new(Some(worker)),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                watchers: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                removals: Mutex::new(HashMap::new()),
                removal_done: Condvar::new(),
            }),
        };
        info!(
            "host {name} started with {} drivers",
            lock(&host.inner.drivers).len()
        );
        Ok(host)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The root device. Platform devices are published under it.
    pub fn root(&self) -> DeviceId {
        lock(&self.inner.tree).root()
    }

    pub fn is_autobind(&self) -> bool {
        self.inner.autobind
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    // ---- drivers ----

    /// Register a driver and offer it every unbound visible device.
    pub fn register_driver(&self, driver: Arc<dyn Driver>) -> Result<()> {
        lock(&self.inner.drivers).register(driver.clone())?;
        if !self.inner.autobind {
            return Ok(());
        }
        self.post(move |host| {
            let candidates: Vec<DeviceId> = {
                let tree = lock(&host.inner.tree);
                tree.ids().filter(|id| tree.get(*id).is_ok_and(Node::is_bindable)).collect()
            };
            for id in candidates {
                host.offer(id, &driver);
            }
        })
    }

    pub fn driver_names(&self) -> Vec<String> {
        lock(&self.inner.drivers)
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    // ---- tree ----

    /// Publish a device under `parent`.
    ///
    /// A visible, bindable device is queued for autobind.
    ///
    /// # Errors
    ///
    /// * [`Error::DeviceNotFound`] if `parent` does not exist
    /// * [`Error::BadState`] if `parent` is being removed or the host is
    ///   shutting down
    /// * [`Error::InvalidArgument`] for an empty name
    pub fn add_device(&self, parent: DeviceId, args: DeviceAddArgs) -> Result<DeviceId> {
        self.add_device_for(parent, args, None)
    }

    pub(crate) fn add_device_for(
        &self,
        parent: DeviceId,
        args: DeviceAddArgs,
        created_by: Option<&str>,
    ) -> Result<DeviceId> {
        if self.is_stopped() {
            return Err(Error::BadState(format!("host {} is shut down", self.name())));
        }
        if args.name().is_empty() {
            return Err(Error::InvalidArgument("device name is empty".to_string()));
        }
        let (id, name, state, bindable) = {
            let mut tree = lock(&self.inner.tree);
            let p = tree.get(parent)?;
            if !p.state.is_live() {
                return Err(Error::BadState(format!("parent {parent} is {:?}", p.state)));
            }
            let node = Node::new(args, Some(parent));
            let (name, state, bindable) = (node.name.clone(), node.state, node.is_bindable());
            let id = tree.insert(node);
            tree.get_mut(parent)?.children.push(id);
            (id, name, state, bindable)
        };
        match created_by {
            Some(driver) => info!("driver {driver} published {name} ({id}) under {parent}, {state:?}"),
            None => info!("published {name} ({id}) under {parent}, {state:?}"),
        }
        self.emit(id, &name, state);
        if bindable {
            self.schedule_autobind(id);
        }
        Ok(id)
    }

    /// Make an invisible device visible. Happens at most once per device.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] unless the device is `Bound`.
    pub fn make_visible(&self, id: DeviceId) -> Result<()> {
        let (name, bindable) = {
            let mut tree = lock(&self.inner.tree);
            let node = tree.get_mut(id)?;
            if node.state != DeviceState::Bound {
                return Err(Error::BadState(format!(
                    "{} ({id}) is {:?}, not invisible",
                    node.name, node.state
                )));
            }
            node.state = DeviceState::Visible;
            (node.name.clone(), node.is_bindable())
        };
        info!("{name} ({id}) is visible");
        self.emit(id, &name, DeviceState::Visible);
        if bindable {
            self.schedule_autobind(id);
        }
        Ok(())
    }

    /// Remove a device and everything below it, children first.
    ///
    /// Protocol handles to the removed devices fail from the moment this is
    /// called. Each device's `unbind` hook runs, then its outstanding
    /// transactions complete with [`Status::IoNotPresent`], then the node is
    /// freed and `release` runs.
    ///
    /// Removals are serialized per subtree: parts of the subtree that another
    /// thread is already removing are waited for, so a parent is never
    /// released before its children. Removing a device that another thread is
    /// already removing waits until it is `Removed`. Called from a hook of the
    /// removal that owns the device, it returns at once.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] for unknown ids, [`Error::BadState`] for the
    /// root.
    pub fn remove(&self, id: DeviceId) -> Result<()> {
        let me = thread::current().id();
        let steps = {
            let mut tree = lock(&self.inner.tree);
            if id == tree.root() {
                return Err(Error::BadState("the root device cannot be removed".to_string()));
            }
            tree.get(id)?;
            let mut removals = lock(&self.inner.removals);
            if removals.get(&id) == Some(&me) {
                return Ok(());
            }
            let mut steps = Vec::new();
            for dev in tree.subtree_postorder(id) {
                let node = tree.get_mut(dev)?;
                if node.state == DeviceState::Removing {
                    if removals.get(&dev) != Some(&me) {
                        steps.push(RemoveStep::Await(dev));
                    }
                    continue;
                }
                node.state = DeviceState::Removing;
                node.live.revoke();
                removals.insert(dev, me);
                steps.push(RemoveStep::Remove {
                    dev,
                    name: node.name.clone(),
                    ops: node.ops.clone(),
                    inflight: node.inflight.clone(),
                    parent: node.parent,
                });
            }
            steps
        };

        for step in &steps {
            if let RemoveStep::Remove { dev, name, .. } = step {
                debug!("removing {name} ({dev})");
                self.emit(*dev, name, DeviceState::Removing);
            }
        }

        for step in steps {
            match step {
                RemoveStep::Await(dev) => self.await_removal(dev),
                RemoveStep::Remove {
                    dev,
                    name,
                    ops,
                    inflight,
                    parent,
                } => {
                    self.remove_one(dev, &name, ops, inflight, parent);
                    self.finish_removal(dev);
                }
            }
        }
        Ok(())
    }

    fn remove_one(
        &self,
        dev: DeviceId,
        name: &str,
        ops: Arc<dyn DeviceOps>,
        inflight: Arc<InflightSet>,
        parent: Option<DeviceId>,
    ) {
        let ctx = DeviceContext {
            host: self,
            id: dev,
            parent,
        };
        ops.unbind(&ctx);

        let forced = inflight.close_and_force(Status::IoNotPresent);
        if forced > 0 {
            warn!("{name} ({dev}) removed with {forced} transactions in flight");
        }

        let node = {
            let mut tree = lock(&self.inner.tree);
            let node = tree.remove(dev);
            let slot = parent.and_then(|p| tree.get_mut(p).ok());
            if let Some(p) = slot.filter(|p| p.bound_child == Some(dev)) {
                p.bind_state = DeviceState::Unbound;
                p.bound_driver = None;
                p.bound_child = None;
            }
            node
        };
        drop(node);
        ops.release();
        info!("removed {name} ({dev})");
        self.emit(dev, name, DeviceState::Removed);
    }

    fn finish_removal(&self, dev: DeviceId) {
        lock(&self.inner.removals).remove(&dev);
        self.inner.removal_done.notify_all();
    }

    /// Block until another thread's removal of `dev` has finished.
    fn await_removal(&self, dev: DeviceId) {
        let mut removals = lock(&self.inner.removals);
        if removals.contains_key(&dev) {
            debug!("waiting for {dev} to finish removal");
        }
        while removals.contains_key(&dev) {
            removals = self
                .inner
                .removal_done
                .wait(removals)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Current lifecycle state. Ids of removed devices report `Removed`.
    pub fn state(&self, id: DeviceId) -> Result<DeviceState> {
        let tree = lock(&self.inner.tree);
        match tree.get(id) {
            Ok(node) => Ok(node.state),
            Err(_) if tree.was_removed(id) => Ok(DeviceState::Removed),
            Err(e) => Err(e),
        }
    }

    /// State of the device's bind slot: `Unbound`, `Matching`, or `Bound`.
    pub fn bind_state(&self, id: DeviceId) -> Result<DeviceState> {
        Ok(lock(&self.inner.tree).get(id)?.bind_state)
    }

    /// Name of the driver bound to the device, if any.
    pub fn bound_driver(&self, id: DeviceId) -> Result<Option<String>> {
        Ok(lock(&self.inner.tree).get(id)?.bound_driver.clone())
    }

    pub fn device_name(&self, id: DeviceId) -> Result<String> {
        Ok(lock(&self.inner.tree).get(id)?.name.clone())
    }

    pub fn parent(&self, id: DeviceId) -> Result<Option<DeviceId>> {
        Ok(lock(&self.inner.tree).get(id)?.parent)
    }

    pub fn children(&self, id: DeviceId) -> Result<Vec<DeviceId>> {
        Ok(lock(&self.inner.tree).get(id)?.children.clone())
    }

    pub fn props(&self, id: DeviceId) -> Result<PropertyTable> {
        Ok(lock(&self.inner.tree).get(id)?.props.clone())
    }

    /// Look up a live device by name.
    pub fn find(&self, name: &str) -> Option<DeviceId> {
        let tree = lock(&self.inner.tree);
        tree.ids()
            .find(|id| tree.get(*id).is_ok_and(|n| n.name == name))
    }

    /// Number of live devices, including the root.
    pub fn device_count(&self) -> usize {
        lock(&self.inner.tree).len()
    }

    /// Subscribe to lifecycle events from now on.
    pub fn watch(&self) -> mpsc::Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.inner.watchers).push(tx);
        rx
    }

    fn emit(&self, id: DeviceId, name: &str, state: DeviceState) {
        let event = DeviceEvent {
            id,
            name: name.to_string(),
            state,
        };
        lock(&self.inner.watchers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ---- binding ----

    /// Bind the named driver to `id`, evaluating its program in manual mode.
    ///
    /// The receiver resolves to the device the driver published, or to
    /// [`Error::NoMatch`], [`Error::AlreadyBound`], [`Error::DriverNotFound`],
    /// or the error the bind hook returned.
    pub fn bind_device(&self, id: DeviceId, driver: &str) -> CompletionReceiver<DeviceId> {
        let (tx, rx) = completion::<DeviceId>();
        let Some(driver) = lock(&self.inner.drivers).get(driver) else {
            tx.error(Error::DriverNotFound(driver.to_string()));
            return rx;
        };
        // If the control thread is gone the sender drops and the receiver
        // resolves to Cancelled.
        let _ = self.post(move |host| {
            let result = match host.try_driver(id, &driver, BindMode::Manual) {
                Ok(BindAttempt::Bound(child)) => Ok(child),
                Ok(BindAttempt::NoMatch) => Err(Error::NoMatch(id)),
                Ok(BindAttempt::Rejected(e)) | Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(
                    "manual bind of {} to {id} failed: {e} (status {})",
                    driver.name(),
                    e.status()
                );
            }
            tx.complete(result);
        });
        rx
    }

    /// Block until the control thread has run everything posted so far,
    /// including work posted by the binds it ran.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when called from the control thread.
    pub fn settle(&self) -> Result<()> {
        if self.inner.control.is_current() {
            return Err(Error::BadState(
                "settle called on the control thread".to_string(),
            ));
        }
        let mut pending = lock(&self.inner.pending);
        while *pending > 0 {
            pending = self
                .inner
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&DevHost) + Send + 'static,
    {
        *lock(&self.inner.pending) += 1;
        let weak = Arc::downgrade(&self.inner);
        let sent = self.inner.control.send(move || {
            if let Some(inner) = weak.upgrade() {
                let host = DevHost { inner };
                let _guard = TaskGuard(&host);
                f(&host);
            }
        });
        if sent.is_err() {
            self.task_done();
        }
        sent
    }

    fn task_done(&self) {
        let mut pending = lock(&self.inner.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.inner.idle.notify_all();
        }
    }

    fn schedule_autobind(&self, id: DeviceId) {
        if !self.inner.autobind || self.is_stopped() {
            return;
        }
        if let Err(e) = self.post(move |host| host.autobind(id)) {
            debug!("autobind of {id} not scheduled: {e}");
        }
    }

    /// Offer `id` to every driver in registration order until one binds.
    fn autobind(&self, id: DeviceId) {
        let drivers: Vec<Arc<dyn Driver>> = lock(&self.inner.drivers).iter().cloned().collect();
        for driver in &drivers {
            if self.offer(id, driver) {
                return;
            }
        }
        debug!("no driver bound {id}");
    }

    /// Try one driver in autobind mode. Returns whether the device is no
    /// longer available for binding.
    fn offer(&self, id: DeviceId, driver: &Arc<dyn Driver>) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.try_driver(id, driver, BindMode::Autobind) {
            Ok(BindAttempt::Bound(_)) => true,
            Ok(BindAttempt::NoMatch) => false,
            Ok(BindAttempt::Rejected(e)) => {
                warn!(
                    "driver {} rejected {id}: {e} (status {})",
                    driver.name(),
                    e.status()
                );
                false
            }
            Err(e) => {
                debug!("{id} no longer bindable: {e}");
                true
            }
        }
    }

    /// Evaluate `driver`'s program against `id` and run its bind hook on a
    /// match.
    ///
    /// `Err` means the device itself is not eligible; a failing hook is
    /// [`BindAttempt::Rejected`] and leaves the device unbound.
    fn try_driver(
        &self,
        id: DeviceId,
        driver: &Arc<dyn Driver>,
        mode: BindMode,
    ) -> Result<BindAttempt> {
        let name = driver.name();
        {
            let mut tree = lock(&self.inner.tree);
            let node = tree.get_mut(id)?;
            if node.state != DeviceState::Visible || node.non_bindable {
                return Err(Error::BadState(format!(
                    "{} ({id}) is not bindable",
                    node.name
                )));
            }
            if node.bind_state != DeviceState::Unbound {
                return Err(Error::AlreadyBound(id));
            }
            let view = BindView {
                props: &node.props,
                protocol: node.protocol_id(),
                mode,
            };
            let outcome = driver.bind_program().evaluate(&view, mode);
            if !outcome.is_match() {
                debug!(
                    "driver {name} does not match {id} (directive {:?})",
                    outcome.directive
                );
                return Ok(BindAttempt::NoMatch);
            }
            debug!(
                "driver {name} matches {id} at directive {:?}",
                outcome.directive
            );
            node.bind_state = DeviceState::Matching;
        }

        let mut ctx = BindContext::new(self, id, name);
        let result = driver.bind(&mut ctx);
        let created = ctx.created();

        match (result, created) {
            (Ok(()), Some(child)) => {
                let mut tree = lock(&self.inner.tree);
                // The driver may already be removing its device again.
                let child_live = tree.get(child).is_ok_and(|n| n.state.is_live());
                if let Ok(node) = tree.get_mut(id) {
                    if child_live {
                        node.bind_state = DeviceState::Bound;
                        node.bound_driver = Some(name.to_string());
                        node.bound_child = Some(child);
                    } else {
                        node.bind_state = DeviceState::Unbound;
                    }
                }
                drop(tree);
                if !child_live {
                    return Ok(BindAttempt::Rejected(Error::BadState(format!(
                        "driver {name} removed {child} before bind returned"
                    ))));
                }
                info!("driver {name} bound to {id}, published {child}");
                Ok(BindAttempt::Bound(child))
            }
            (result, created) => {
                if let Some(child) = created {
                    if let Err(e) = self.remove(child) {
                        debug!("cleanup of {child} after failed bind: {e}");
                    }
                }
                if let Ok(node) = lock(&self.inner.tree).get_mut(id) {
                    node.bind_state = DeviceState::Unbound;
                    node.bound_driver = None;
                    node.bound_child = None;
                }
                let err = match result {
                    Ok(()) => Error::BadState(format!(
                        "driver {name} bound {id} without publishing a device"
                    )),
                    Err(e) => e,
                };
                Ok(BindAttempt::Rejected(err))
            }
        }
    }

    // ---- protocols ----

    /// Get a typed handle to protocol `proto_id` of device `dev`.
    ///
    /// The device's primary protocol is checked first, then its dispatcher.
    /// The handle does not keep the device alive.
    ///
    /// # Errors
    ///
    /// * [`Error::PeerClosed`] if the device is being removed
    /// * [`Error::NotSupported`] if the device does not publish the protocol
    /// * [`Error::InvalidArgument`] if the ops are not a `P`
    pub fn get_protocol<P>(&self, dev: DeviceId, proto_id: u32) -> Result<ProtocolHandle<P>>
    where
        P: Any + Send + Sync,
    {
        let dispatcher = {
            let tree = lock(&self.inner.tree);
            let node = tree.get(dev)?;
            if !node.state.is_live() {
                return Err(Error::PeerClosed);
            }
            if let Some(proto) = node.protocol.as_ref().filter(|p| p.id() == proto_id) {
                return ProtocolHandle::new(proto, node.live.clone());
            }
            if let Some(proto) = node.protocol_cache.get(&proto_id) {
                return ProtocolHandle::new(proto, node.live.clone());
            }
            node.dispatcher.clone().ok_or(Error::NotSupported)?
        };

        let proto = dispatcher
            .get_protocol(proto_id)
            .ok_or(Error::NotSupported)?;

        let mut tree = lock(&self.inner.tree);
        let node = tree.get_mut(dev)?;
        if !node.state.is_live() {
            return Err(Error::PeerClosed);
        }
        let proto = node
            .protocol_cache
            .entry(proto_id)
            .or_insert(proto)
            .clone();
        ProtocolHandle::new(&proto, node.live.clone())
    }

    // ---- I/O ----

    /// Queue a transaction to a device. Never blocks.
    ///
    /// The result arrives only through the transaction's completion:
    /// [`Status::IoNotPresent`] for devices that are being or have been
    /// removed, [`Status::NotFound`] for unknown ids, otherwise whatever the
    /// device's `queue` hook delivers.
    pub fn queue(&self, id: DeviceId, txn: Transaction) {
        let target = {
            let tree = lock(&self.inner.tree);
            match tree.get(id) {
                Ok(node) if node.state.is_live() => {
                    Ok((node.ops.clone(), node.inflight.clone(), node.parent))
                }
                Ok(_) => Err(Status::IoNotPresent),
                Err(_) if tree.was_removed(id) => Err(Status::IoNotPresent),
                Err(_) => Err(Status::NotFound),
            }
        };
        let (ops, inflight, parent) = match target {
            Ok(target) => target,
            Err(status) => {
                debug!("{} to {id} refused: {status}", txn.id());
                txn.complete(status, 0);
                return;
            }
        };
        if !inflight.insert(&txn) {
            debug!("{} to {id} raced removal", txn.id());
            txn.complete(Status::IoNotPresent, 0);
            return;
        }
        let ctx = DeviceContext {
            host: self,
            id,
            parent,
        };
        ops.queue(&ctx, txn);
    }

    /// Queue `txn` and wait for its completion for at most `timeout`.
    ///
    /// Replaces any callback registered on `txn`. When the timer wins this
    /// returns `Err(Error::Status(Status::TimedOut))`; the transaction still
    /// completes exactly once later, unobserved.
    pub fn queue_wait(
        &self,
        id: DeviceId,
        mut txn: Transaction,
        timeout: Duration,
    ) -> Result<Completion> {
        let rx = txn.completion();
        self.queue(id, txn);
        rx.wait_timeout(timeout)
            .unwrap_or(Err(Error::Status(Status::TimedOut)))
    }

    /// Transactions queued to `id` that have not completed.
    pub fn inflight(&self, id: DeviceId) -> Result<usize> {
        Ok(lock(&self.inner.tree).get(id)?.inflight.len())
    }

    fn visible_ops(&self, id: DeviceId) -> Result<Arc<dyn DeviceOps>> {
        let tree = lock(&self.inner.tree);
        let node = tree.get(id)?;
        if node.state != DeviceState::Visible {
            return Err(Error::BadState(format!(
                "{} ({id}) is {:?}",
                node.name, node.state
            )));
        }
        Ok(node.ops.clone())
    }

    pub fn open(&self, id: DeviceId, flags: u32) -> Result<()> {
        self.visible_ops(id)?.open(flags)?;
        if let Ok(node) = lock(&self.inner.tree).get_mut(id) {
            node.open_count += 1;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`Error::BadState`] if the device is not open.
    pub fn close(&self, id: DeviceId, flags: u32) -> Result<()> {
        if self.open_count(id)? == 0 {
            return Err(Error::BadState(format!("{id} is not open")));
        }
        let ops = lock(&self.inner.tree).get(id)?.ops.clone();
        ops.close(flags)?;
        if let Ok(node) = lock(&self.inner.tree).get_mut(id) {
            node.open_count = node.open_count.saturating_sub(1);
        }
        Ok(())
    }

    pub fn open_count(&self, id: DeviceId) -> Result<u32> {
        Ok(lock(&self.inner.tree).get(id)?.open_count)
    }

    pub fn read(&self, id: DeviceId, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.visible_ops(id)?.read(buf, offset)
    }

    pub fn write(&self, id: DeviceId, buf: &[u8], offset: u64) -> Result<usize> {
        self.visible_ops(id)?.write(buf, offset)
    }

    pub fn ioctl(&self, id: DeviceId, op: u32, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.visible_ops(id)?.ioctl(op, input, output)
    }

    pub fn get_size(&self, id: DeviceId) -> Result<u64> {
        Ok(self.visible_ops(id)?.get_size())
    }

    // ---- shutdown ----

    /// Drain the control thread, remove every device, and stop the control
    /// thread. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.inner.control.is_current() {
            self.settle()?;
        }
        let top = self.children(self.root())?;
        for dev in top {
            if let Err(e) = self.remove(dev) {
                debug!("shutdown: {dev}: {e}");
            }
        }
        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            worker.join()?;
        }
        info!("host {} shut down", self.name());
        Ok(())
    }
}

impl std::fmt::Debug for DevHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevHost")
            .field("name", &self.inner.name)
            .field("autobind", &self.inner.autobind)
            .field("devices", &self.device_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindInst, BindProgram, Cond};
    use crate::device::DeviceAddArgs;
    use crate::protocol::{PROTOCOL_BLOCK, PROTOCOL_PCI, Protocol};
    use crate::txn::Opcode;

    struct TestDriver {
        name: &'static str,
        program: BindProgram,
        fail: bool,
        invisible: bool,
    }

    impl Driver for TestDriver {
        fn name(&self) -> &str {
            self.name
        }

        fn bind_program(&self) -> &BindProgram {
            &self.program
        }

        fn bind(&self, ctx: &mut BindContext<'_>) -> Result<()> {
            ctx.add_device(DeviceAddArgs::new(self.name).invisible(self.invisible))?;
            if self.fail {
                return Err(Error::Status(Status::IoRefused));
            }
            Ok(())
        }
    }

    fn pci_driver(name: &'static str, fail: bool) -> Arc<dyn Driver> {
        Arc::new(TestDriver {
            name,
            program: BindProgram::new(
                "test",
                "1",
                vec![BindInst::match_if(Cond::Eq, keys::BIND_PROTOCOL, PROTOCOL_PCI)],
            )
            .unwrap(),
            fail,
            invisible: true,
        })
    }

    /// Publishes its device and removes it again before returning.
    struct Vanishing {
        program: BindProgram,
    }

    impl Driver for Vanishing {
        fn name(&self) -> &str {
            "vanishing"
        }

        fn bind_program(&self) -> &BindProgram {
            &self.program
        }

        fn bind(&self, ctx: &mut BindContext<'_>) -> Result<()> {
            let child = ctx.add_device(DeviceAddArgs::new("vanishing"))?;
            ctx.host().remove(child)
        }
    }

    fn vanishing_driver() -> Arc<dyn Driver> {
        Arc::new(Vanishing {
            program: BindProgram::new(
                "test",
                "1",
                vec![BindInst::match_if(Cond::Eq, keys::BIND_PROTOCOL, PROTOCOL_PCI)],
            )
            .unwrap(),
        })
    }

    fn host(drivers: Vec<Arc<dyn Driver>>) -> DevHost {
        let mut builder = DevHost::builder().name("unit");
        for d in drivers {
            builder = builder.driver(d);
        }
        builder.build().unwrap()
    }

    fn pci_device(host: &DevHost, name: &str) -> DeviceId {
        host.add_device(
            host.root(),
            DeviceAddArgs::new(name).protocol(Protocol::new(PROTOCOL_PCI, ())),
        )
        .unwrap()
    }

    #[test]
    fn test_autobind_uses_protocol_id() {
        let host = host(vec![pci_driver("pci-drv", false)]);
        let dev = pci_device(&host, "pci0");
        host.settle().unwrap();
        assert_eq!(host.bind_state(dev).unwrap(), DeviceState::Bound);
        assert_eq!(host.bound_driver(dev).unwrap().as_deref(), Some("pci-drv"));
        assert_eq!(host.children(dev).unwrap().len(), 1);
        host.shutdown().unwrap();
    }

    #[test]
    fn test_autobind_key_follows_mode() {
        let table = PropertyTable::empty();
        let view = |mode| BindView {
            props: &table,
            protocol: Some(PROTOCOL_PCI),
            mode,
        };
        assert_eq!(view(BindMode::Autobind).lookup(keys::BIND_AUTOBIND), Some(1));
        assert_eq!(view(BindMode::Manual).lookup(keys::BIND_AUTOBIND), Some(0));
        assert_eq!(view(BindMode::Manual).lookup(keys::BIND_PROTOCOL), Some(PROTOCOL_PCI));

        // The device's own properties win.
        let table = PropertyTable::new(vec![crate::props::DeviceProp::new(keys::BIND_AUTOBIND, 7)]);
        let view = BindView {
            props: &table,
            protocol: None,
            mode: BindMode::Autobind,
        };
        assert_eq!(view.lookup(keys::BIND_AUTOBIND), Some(7));
        assert_eq!(view.lookup(keys::BIND_PROTOCOL), None);
    }

    #[test]
    fn test_rejection_tries_next_driver() {
        let host = host(vec![pci_driver("bad", true), pci_driver("good", false)]);
        let dev = pci_device(&host, "pci0");
        host.settle().unwrap();
        assert_eq!(host.bound_driver(dev).unwrap().as_deref(), Some("good"));
        let children = host.children(dev).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(host.device_name(children[0]).unwrap(), "good");
        // The failed driver's device was cleaned up.
        assert!(host.find("bad").is_none());
        host.shutdown().unwrap();
    }

    #[test]
    fn test_driver_removing_its_device_is_not_bound() {
        let host = host(vec![vanishing_driver(), pci_driver("good", false)]);
        let dev = pci_device(&host, "pci0");
        host.settle().unwrap();
        assert_eq!(host.bound_driver(dev).unwrap().as_deref(), Some("good"));
        let children = host.children(dev).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(host.device_name(children[0]).unwrap(), "good");

        let manual = DevHost::builder()
            .autobind(false)
            .driver(vanishing_driver())
            .build()
            .unwrap();
        let dev = pci_device(&manual, "pci1");
        assert!(matches!(
            manual.bind_device(dev, "vanishing").wait(),
            Err(Error::BadState(_))
        ));
        assert_eq!(manual.bind_state(dev).unwrap(), DeviceState::Unbound);
        assert!(manual.find("vanishing").is_none());
        manual.shutdown().unwrap();
        host.shutdown().unwrap();
    }

    #[test]
    fn test_manual_bind_and_already_bound() {
        let host = DevHost::builder()
            .name("manual")
            .autobind(false)
            .driver(pci_driver("pci-drv", false))
            .build()
            .unwrap();
        let dev = pci_device(&host, "pci0");
        host.settle().unwrap();
        assert_eq!(host.bind_state(dev).unwrap(), DeviceState::Unbound);

        let child = host.bind_device(dev, "pci-drv").wait().unwrap();
        assert_eq!(host.parent(child).unwrap(), Some(dev));
        assert!(matches!(
            host.bind_device(dev, "pci-drv").wait(),
            Err(Error::AlreadyBound(_))
        ));
        assert!(matches!(
            host.bind_device(dev, "nope").wait(),
            Err(Error::DriverNotFound(_))
        ));
        host.shutdown().unwrap();
    }

    #[test]
    fn test_manual_bind_no_match() {
        let host = DevHost::builder()
            .autobind(false)
            .driver(pci_driver("pci-drv", false))
            .build()
            .unwrap();
        let dev = host
            .add_device(host.root(), DeviceAddArgs::new("usb0"))
            .unwrap();
        assert!(matches!(
            host.bind_device(dev, "pci-drv").wait(),
            Err(Error::NoMatch(_))
        ));
        host.shutdown().unwrap();
    }

    #[test]
    fn test_removing_child_unbinds_parent() {
        let host = host(vec![pci_driver("pci-drv", false)]);
        let dev = pci_device(&host, "pci0");
        host.settle().unwrap();
        let child = host.children(dev).unwrap()[0];
        host.remove(child).unwrap();
        assert_eq!(host.bind_state(dev).unwrap(), DeviceState::Unbound);
        assert_eq!(host.bound_driver(dev).unwrap(), None);
        host.shutdown().unwrap();
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let host = host(vec![]);
        assert!(matches!(host.remove(host.root()), Err(Error::BadState(_))));
        host.shutdown().unwrap();
    }

    #[test]
    fn test_add_under_removed_parent_fails() {
        let host = host(vec![]);
        let dev = host
            .add_device(host.root(), DeviceAddArgs::new("a"))
            .unwrap();
        host.remove(dev).unwrap();
        assert!(host.add_device(dev, DeviceAddArgs::new("b")).is_err());
        assert!(host.add_device(host.root(), DeviceAddArgs::new("")).is_err());
        host.shutdown().unwrap();
    }

    #[test]
    fn test_queue_default_ops_not_supported() {
        let host = host(vec![]);
        let dev = host
            .add_device(host.root(), DeviceAddArgs::new("plain"))
            .unwrap();
        let txn = Transaction::alloc(Opcode::Read, 512).unwrap();
        let c = host
            .queue_wait(dev, txn, Duration::from_secs(5))
            .unwrap();
        assert_eq!(c.status, Status::NotSupported);
        assert_eq!(host.inflight(dev).unwrap(), 0);
        host.shutdown().unwrap();
    }

    #[test]
    fn test_queue_to_removed_device() {
        let host = host(vec![]);
        let dev = host
            .add_device(host.root(), DeviceAddArgs::new("gone"))
            .unwrap();
        host.remove(dev).unwrap();
        let txn = Transaction::alloc(Opcode::Write, 512).unwrap();
        let c = host.queue_wait(dev, txn, Duration::from_secs(5)).unwrap();
        assert_eq!(c.status, Status::IoNotPresent);
        host.shutdown().unwrap();
    }

    #[test]
    fn test_open_close_counts() {
        let host = host(vec![]);
        let dev = host
            .add_device(host.root(), DeviceAddArgs::new("blk").invisible(true))
            .unwrap();
        assert!(matches!(host.open(dev, 0), Err(Error::BadState(_))));
        host.make_visible(dev).unwrap();
        host.open(dev, 0).unwrap();
        host.open(dev, 0).unwrap();
        assert_eq!(host.open_count(dev).unwrap(), 2);
        host.close(dev, 0).unwrap();
        host.close(dev, 0).unwrap();
        assert!(host.close(dev, 0).is_err());
        assert!(matches!(host.read(dev, &mut [0u8; 4], 0), Err(Error::NotSupported)));
        assert_eq!(host.get_size(dev).unwrap(), 0);
        host.shutdown().unwrap();
    }

    #[test]
    fn test_protocol_not_published() {
        let host = host(vec![]);
        let dev = pci_device(&host, "pci0");
        assert!(host.get_protocol::<()>(dev, PROTOCOL_PCI).is_ok());
        assert!(matches!(
            host.get_protocol::<()>(dev, PROTOCOL_BLOCK),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            host.get_protocol::<u32>(dev, PROTOCOL_PCI),
            Err(Error::InvalidArgument(_))
        ));
        host.shutdown().unwrap();
    }

    #[test]
    fn test_settle_rejected_on_control_thread() {
        let host = host(vec![]);
        let (tx, rx) = completion::<bool>();
        host.post(move |h| tx.success(h.settle().is_err())).unwrap();
        assert!(rx.wait().unwrap());
        host.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_removes_everything() {
        let host = host(vec![]);
        let a = host
            .add_device(host.root(), DeviceAddArgs::new("a"))
            .unwrap();
        host.add_device(a, DeviceAddArgs::new("b")).unwrap();
        assert_eq!(host.device_count(), 3);
        host.shutdown().unwrap();
        assert_eq!(host.device_count(), 1);
        assert!(host.add_device(host.root(), DeviceAddArgs::new("late")).is_err());
        host.shutdown().unwrap();
    }
}
