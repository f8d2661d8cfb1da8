//! Device nodes and the device tree.
//!
//! Devices live in an arena owned by the host and are named by [`DeviceId`]s.
//! A parent owns the ids of its children; a child stores only its parent's
//! id. Ids are generational, so an id held after its device has been removed
//! never aliases a newer device that reuses the slot.
//!
//! # States
//!
//! ```text
//!  parent bind slot:  Unbound ──► Matching ──► Bound
//!                        ▲            │
//!                        └── failed ──┘
//!
//!  node:  Bound (invisible) ──► Visible
//!               │                  │
//!               └──────┬───────────┘
//!                      ▼
//!                  Removing ──► Removed
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result, Status};
use crate::host::DevHost;
use crate::props::{DeviceProp, PropertyTable};
use crate::protocol::{Liveness, Protocol, ProtocolDispatch};
use crate::txn::{InflightSet, Transaction};

/// Stable identifier of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

impl DeviceId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// No driver bound to the device.
    Unbound,
    /// A driver's bind hook is running against the device.
    Matching,
    /// Published but invisible; only the creating driver may use it.
    Bound,
    Visible,
    Removing,
    Removed,
}

impl DeviceState {
    /// Whether the node still accepts I/O.
    pub fn is_live(self) -> bool {
        matches!(self, DeviceState::Bound | DeviceState::Visible)
    }
}

/// Lifecycle notification delivered to [`DevHost::watch`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub id: DeviceId,
    pub name: String,
    pub state: DeviceState,
}

/// Where a hook is running: the host, the device, and its parent.
pub struct DeviceContext<'a> {
    pub(crate) host: &'a DevHost,
    pub(crate) id: DeviceId,
    pub(crate) parent: Option<DeviceId>,
}

impl DeviceContext<'_> {
    pub fn host(&self) -> &DevHost {
        self.host
    }

    pub fn device(&self) -> DeviceId {
        self.id
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Queue `txn` to the parent device.
    ///
    /// Without a parent the transaction completes with
    /// [`Status::NotSupported`].
    pub fn forward(&self, txn: Transaction) {
        match self.parent {
            Some(parent) => self.host.queue(parent, txn),
            None => txn.complete(Status::NotSupported, 0),
        }
    }
}

/// Hooks a driver implements for the devices it publishes.
///
/// Every hook has a default, so a device implements only what it supports.
/// Hooks run on the caller's thread, never under a host lock, and must not
/// block on long-running work.
#[allow(unused_variables)]
pub trait DeviceOps: Send + Sync {
    fn open(&self, flags: u32) -> Result<()> {
        Ok(())
    }

    fn close(&self, flags: u32) -> Result<()> {
        Ok(())
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Err(Error::NotSupported)
    }

    /// Generic control request. Returns bytes written to `output`.
    fn ioctl(&self, op: u32, input: &[u8], output: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn get_size(&self) -> u64 {
        0
    }

    /// Accept a transaction. Must not block; the result goes through the
    /// transaction's completion.
    fn queue(&self, ctx: &DeviceContext<'_>, txn: Transaction) {
        txn.complete(Status::NotSupported, 0);
    }

    /// Removal has started. Protocol handles to this device are already dead.
    fn unbind(&self, ctx: &DeviceContext<'_>) {}

    /// Removal finished; the node is gone.
    fn release(&self) {}
}

/// Ops for devices that only carry properties, such as the root and platform
/// devices from the host configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOps;

impl DeviceOps for NoOps {}

/// Arguments for publishing a device.
///
/// ```
/// use ddk_io::device::DeviceAddArgs;
/// use ddk_io::props::{DeviceProp, keys};
///
/// let args = DeviceAddArgs::new("ahci")
///     .props(vec![DeviceProp::new(keys::BIND_PCI_CLASS, 1)])
///     .invisible(true);
/// assert_eq!(args.name(), "ahci");
/// ```
pub struct DeviceAddArgs {
    pub(crate) name: String,
    pub(crate) props: PropertyTable,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) dispatcher: Option<Arc<dyn ProtocolDispatch>>,
    pub(crate) ops: Arc<dyn DeviceOps>,
    pub(crate) invisible: bool,
    pub(crate) non_bindable: bool,
}

impl DeviceAddArgs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            props: PropertyTable::empty(),
            protocol: None,
            dispatcher: None,
            ops: Arc::new(NoOps),
            invisible: false,
            non_bindable: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn props(mut self, props: impl Into<PropertyTable>) -> Self {
        self.props = props.into();
        self
    }

    pub fn prop(mut self, key: u32, value: u32) -> Self {
        let mut props: Vec<DeviceProp> = self.props.as_slice().to_vec();
        props.push(DeviceProp::new(key, value));
        self.props = PropertyTable::new(props);
        self
    }

    /// The device's primary protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Answers protocol requests for ids other than the primary one.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ProtocolDispatch>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn ops(mut self, ops: Arc<dyn DeviceOps>) -> Self {
        self.ops = ops;
        self
    }

    /// Publish invisible; the driver calls `make_visible` once initialized.
    pub fn invisible(mut self, invisible: bool) -> Self {
        self.invisible = invisible;
        self
    }

    /// Never offer the device to drivers.
    pub fn non_bindable(mut self, non_bindable: bool) -> Self {
        self.non_bindable = non_bindable;
        self
    }
}

pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) props: PropertyTable,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) dispatcher: Option<Arc<dyn ProtocolDispatch>>,
    pub(crate) protocol_cache: HashMap<u32, Protocol>,
    pub(crate) ops: Arc<dyn DeviceOps>,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    pub(crate) state: DeviceState,
    pub(crate) non_bindable: bool,
    /// State of this node's own bind slot.
    pub(crate) bind_state: DeviceState,
    pub(crate) bound_driver: Option<String>,
    /// Device published by the driver bound to this node.
    pub(crate) bound_child: Option<DeviceId>,
    pub(crate) open_count: u32,
    pub(crate) inflight: Arc<InflightSet>,
    pub(crate) live: Liveness,
}

impl Node {
    pub(crate) fn new(args: DeviceAddArgs, parent: Option<DeviceId>) -> Self {
        let state = if args.invisible {
            DeviceState::Bound
        } else {
            DeviceState::Visible
        };
        Self {
            name: args.name,
            props: args.props,
            protocol: args.protocol,
            dispatcher: args.dispatcher,
            protocol_cache: HashMap::new(),
            ops: args.ops,
            parent,
            children: Vec::new(),
            state,
            non_bindable: args.non_bindable,
            bind_state: DeviceState::Unbound,
            bound_driver: None,
            bound_child: None,
            open_count: 0,
            inflight: InflightSet::new(),
            live: Liveness::new(),
        }
    }

    pub(crate) fn protocol_id(&self) -> Option<u32> {
        self.protocol.as_ref().map(Protocol::id)
    }

    /// Whether autobind may offer this node to drivers.
    pub(crate) fn is_bindable(&self) -> bool {
        self.state == DeviceState::Visible
            && !self.non_bindable
            && self.bind_state == DeviceState::Unbound
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Generational arena of device nodes.
pub(crate) struct DeviceTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: DeviceId,
}

impl DeviceTree {
    pub(crate) fn new(root: Node) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: DeviceId {
                index: 0,
                generation: 0,
            },
        };
        tree.root = tree.insert(root);
        tree
    }

    pub(crate) fn root(&self) -> DeviceId {
        self.root
    }

    pub(crate) fn insert(&mut self, node: Node) -> DeviceId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                DeviceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                DeviceId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub(crate) fn get(&self, id: DeviceId) -> Result<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(Error::DeviceNotFound(id))
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Result<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(Error::DeviceNotFound(id))
    }

    /// Whether `id` was issued by this tree and has since been removed.
    pub(crate) fn was_removed(&self, id: DeviceId) -> bool {
        match self.slots.get(id.index as usize) {
            Some(slot) => {
                id.generation < slot.generation
                    || (id.generation == slot.generation && slot.node.is_none())
            }
            None => false,
        }
    }

    /// Take a node out of the arena and detach it from its parent.
    pub(crate) fn remove(&mut self, id: DeviceId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        if let Some(parent) = node.parent.and_then(|p| self.get_mut(p).ok()) {
            parent.children.retain(|c| *c != id);
        }
        Some(node)
    }

    /// `id` and all of its descendants, children before parents.
    pub(crate) fn subtree_postorder(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        self.postorder(id, &mut out);
        out
    }

    fn postorder(&self, id: DeviceId, out: &mut Vec<DeviceId>) {
        if let Ok(node) = self.get(id) {
            for child in &node.children {
                self.postorder(*child, out);
            }
            out.push(id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// Ids of live nodes, in slot order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(index, slot)| DeviceId {
                index: index as u32,
                generation: slot.generation,
            })
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().filter_map(|slot| slot.node.as_ref())
    }
}
