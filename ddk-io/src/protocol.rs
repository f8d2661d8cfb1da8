//! Typed protocol capabilities.
//!
//! A device may publish a table of operations (its *protocol*) identified by
//! a numeric id. Children ask the parent for a protocol by id and get back a
//! [`ProtocolHandle`], a weak, typed reference that stops working as soon as
//! the publishing device starts going away.
//!
//! Ops are stored type-erased and recovered by downcast. Publish trait objects
//! by wrapping them in an `Arc`, as [`InterruptProtocolOps`] does.
//!
//! [`InterruptProtocolOps`]: crate::interrupt::InterruptProtocolOps

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};

/// Numeric protocol identity.
pub type ProtocolId = u32;

pub const PROTOCOL_DEVICE: ProtocolId = 0x7072_0001;
pub const PROTOCOL_MISC: ProtocolId = 0x7072_0002;
pub const PROTOCOL_BLOCK: ProtocolId = 0x7072_0003;
pub const PROTOCOL_PCI: ProtocolId = 0x7072_0004;
pub const PROTOCOL_USB: ProtocolId = 0x7072_0005;
pub const PROTOCOL_PLATFORM_DEV: ProtocolId = 0x7072_0006;
pub const PROTOCOL_INTERRUPT: ProtocolId = 0x7072_0007;
pub const PROTOCOL_ETHERNET: ProtocolId = 0x7072_0008;

type Ops = Arc<dyn Any + Send + Sync>;

/// A published protocol: an id and a type-erased ops table.
#[derive(Clone)]
pub struct Protocol {
    id: ProtocolId,
    ops: Ops,
}

impl Protocol {
    pub fn new<P: Any + Send + Sync>(id: ProtocolId, ops: P) -> Self {
        Self {
            id,
            ops: Arc::new(ops),
        }
    }

    pub fn id(&self) -> ProtocolId {
        self.id
    }

    /// Whether the ops table is a `P`.
    pub fn is<P: Any>(&self) -> bool {
        self.ops.is::<P>()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Protocol({:#x})", self.id)
    }
}

/// Answers protocol requests beyond the device's primary protocol.
///
/// Installed per device with
/// [`DeviceAddArgs::dispatcher`](crate::device::DeviceAddArgs::dispatcher).
pub trait ProtocolDispatch: Send + Sync {
    fn get_protocol(&self, id: ProtocolId) -> Option<Protocol>;
}

/// Liveness flag shared by a device node and every handle derived from it.
#[derive(Debug, Clone)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Typed, non-owning reference to a parent's protocol.
///
/// Every use goes through [`with`](Self::with), which fails with
/// [`Error::PeerClosed`] once the publishing device is being removed.
pub struct ProtocolHandle<P> {
    id: ProtocolId,
    ops: Weak<dyn Any + Send + Sync>,
    live: Liveness,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Any + Send + Sync> ProtocolHandle<P> {
    /// Type-check `proto` and bind it to the publisher's liveness.
    pub(crate) fn new(proto: &Protocol, live: Liveness) -> Result<Self> {
        if !proto.is::<P>() {
            return Err(Error::InvalidArgument(format!(
                "protocol {:#x} is not a {}",
                proto.id,
                std::any::type_name::<P>()
            )));
        }
        Ok(Self {
            id: proto.id,
            ops: Arc::downgrade(&proto.ops),
            live,
            _marker: PhantomData,
        })
    }

    pub fn id(&self) -> ProtocolId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.live.is_live() && self.ops.strong_count() > 0
    }

    /// Run `f` against the ops.
    ///
    /// The ops stay alive for the duration of the call even if removal starts
    /// concurrently.
    pub fn with<R>(&self, f: impl FnOnce(&P) -> R) -> Result<R> {
        if !self.live.is_live() {
            return Err(Error::PeerClosed);
        }
        let ops = self.ops.upgrade().ok_or(Error::PeerClosed)?;
        let ops = ops.downcast_ref::<P>().ok_or(Error::NotSupported)?;
        Ok(f(ops))
    }
}

impl<P> Clone for ProtocolHandle<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ops: self.ops.clone(),
            live: self.live.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for ProtocolHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandle")
            .field("id", &format_args!("{:#x}", self.id))
            .field("live", &self.live.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adder(u32);

    #[test]
    fn test_typed_access() {
        let proto = Protocol::new(PROTOCOL_MISC, Adder(3));
        let h = ProtocolHandle::<Adder>::new(&proto, Liveness::new()).unwrap();
        assert_eq!(h.with(|a| a.0 + 1).unwrap(), 4);
        assert!(ProtocolHandle::<u64>::new(&proto, Liveness::new()).is_err());
    }

    #[test]
    fn test_revoked_handle_fails() {
        let proto = Protocol::new(PROTOCOL_MISC, Adder(3));
        let live = Liveness::new();
        let h = ProtocolHandle::<Adder>::new(&proto, live.clone()).unwrap();
        live.revoke();
        assert!(!h.is_valid());
        assert!(matches!(h.with(|a| a.0), Err(Error::PeerClosed)));
    }

    #[test]
    fn test_dropped_ops_fail() {
        let proto = Protocol::new(PROTOCOL_MISC, Adder(3));
        let h = ProtocolHandle::<Adder>::new(&proto, Liveness::new()).unwrap();
        drop(proto);
        assert!(matches!(h.with(|a| a.0), Err(Error::PeerClosed)));
    }
}
