//! Asynchronous I/O transactions.
//!
//! A [`Transaction`] is a window `[offset, offset + length)` over an
//! [`IoBuffer`], plus an opcode, a device offset, 48 bytes of
//! protocol-specific payload, and a single completion slot.
//!
//! # Lifecycle
//!
//! ```text
//!  issuer                 layer A                     layer B
//!    │  queue(txn) ──────►  │
//!    │                      │ clone_partial + chain_to
//!    │                      │  queue(clone) ──────────► │
//!    │                      │                           │ complete(Ok, n)
//!    │                      │ ◄──── clone callback ──── │
//!    │ ◄── Completion ───── │ original.complete(Ok, n)
//! ```
//!
//! Completion consumes the transaction, so the owner can complete it at most
//! once. A transaction that is dropped without being completed completes
//! itself with [`Status::Internal`], and a device removal force-completes the
//! transactions queued to it with [`Status::IoNotPresent`]. Either way the
//! issuer observes exactly one [`Completion`].
//!
//! Completion runs on whichever thread finishes the work. Issuers that want a
//! future use [`Transaction::completion`].
//!
//! # Example
//!
//! ```
//! use ddk_io::{Opcode, Status, Transaction};
//!
//! let mut txn = Transaction::alloc(Opcode::Read, 4096)?;
//! let done = txn.completion();
//!
//! let clone = txn.clone_partial(0, 2048)?.chain_to(txn);
//! clone.complete(Status::Ok, 2048);
//!
//! let c = done.wait()?;
//! assert_eq!((c.status, c.actual), (Status::Ok, 2048));
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::buffer::IoBuffer;
use crate::complete::{CompletionReceiver, completion};
use crate::error::{Error, Result, Status};
use crate::lock;

/// Bytes of protocol-specific payload carried by each transaction.
pub const PDATA_SIZE: usize = 48;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique transaction identifier. Clones get their own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(u64);

impl TxnId {
    fn next() -> Self {
        TxnId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Read,
    Write,
    /// Protocol-defined operation.
    Custom(u32),
}

/// The single result delivered for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: TxnId,
    pub status: Status,
    pub actual: usize,
}

type Callback = Box<dyn FnOnce(Completion) + Send>;

enum SlotState {
    Pending(Option<Callback>),
    Completed(Completion),
    /// Completed by the host on behalf of a removed device.
    Forced(Completion),
}

/// Completion slot shared between a transaction and the in-flight sets of
/// the devices it is queued to.
pub(crate) struct CompletionSlot {
    id: TxnId,
    state: Mutex<SlotState>,
    trackers: Mutex<Vec<Weak<InflightSet>>>,
}

impl CompletionSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: TxnId::next(),
            state: Mutex::new(SlotState::Pending(None)),
            trackers: Mutex::new(Vec::new()),
        })
    }

    fn set_callback(&self, cb: Callback) {
        let mut state = lock(&self.state);
        match &mut *state {
            SlotState::Pending(slot) => *slot = Some(cb),
            _ => debug!("{}: callback set after completion, ignored", self.id),
        }
    }

    fn has_callback(&self) -> bool {
        matches!(&*lock(&self.state), SlotState::Pending(Some(_)))
    }

    fn is_pending(&self) -> bool {
        matches!(&*lock(&self.state), SlotState::Pending(_))
    }

    /// Deliver the result if nothing has been delivered yet.
    ///
    /// Returns `false` when the slot was already completed; the call is then a
    /// no-op. A second non-forced completion is a bug in the caller and trips a
    /// debug assertion.
    fn fire(&self, status: Status, actual: usize, forced: bool) -> bool {
        let c = Completion {
            id: self.id,
            status,
            actual,
        };
        let cb = {
            let mut state = lock(&self.state);
            match &mut *state {
                SlotState::Pending(cb) => {
                    let cb = cb.take();
                    *state = if forced {
                        SlotState::Forced(c)
                    } else {
                        SlotState::Completed(c)
                    };
                    cb
                }
                SlotState::Forced(prev) => {
                    debug!(
                        "{}: completion {:?} after forced {:?} dropped",
                        self.id, status, prev.status
                    );
                    return false;
                }
                SlotState::Completed(_) => {
                    debug_assert!(forced, "{} completed twice", self.id);
                    return false;
                }
            }
        };

        let trackers: Vec<_> = lock(&self.trackers).drain(..).collect();
        for set in trackers.iter().filter_map(Weak::upgrade) {
            set.remove(self.id);
        }

        if let Some(cb) = cb {
            cb(c);
        }
        true
    }
}

/// Transactions currently queued to one device.
///
/// Removal closes the set and force-completes everything left in it.
pub(crate) struct InflightSet {
    inner: Mutex<InflightInner>,
}

#[derive(Default)]
struct InflightInner {
    closed: bool,
    entries: HashMap<TxnId, Weak<CompletionSlot>>,
}

impl InflightSet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InflightInner::default()),
        })
    }

    /// Track `txn`. Returns `false` once the set has been closed.
    pub(crate) fn insert(self: &Arc<Self>, txn: &Transaction) -> bool {
        lock(&txn.slot.trackers).push(Arc::downgrade(self));
        let mut inner = lock(&self.inner);
        if inner.closed {
            return false;
        }
        inner
            .entries
            .insert(txn.slot.id, Arc::downgrade(&txn.slot));
        true
    }

    fn remove(&self, id: TxnId) {
        lock(&self.inner).entries.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Close the set and complete every pending transaction with `status`.
    ///
    /// Returns the number of transactions this call completed.
    pub(crate) fn close_and_force(&self, status: Status) -> usize {
        let drained: Vec<_> = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            inner.entries.drain().map(|(_, slot)| slot).collect()
        };
        drained
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|slot| slot.fire(status, 0, true))
            .count()
    }
}

/// An asynchronous I/O request.
///
/// `Transaction` is `Send`: it moves between layers and threads by value. It
/// is not `Clone`; use [`clone_txn`](Self::clone_txn) or
/// [`clone_partial`](Self::clone_partial) to create an independent view over
/// the same buffer.
pub struct Transaction {
    slot: Arc<CompletionSlot>,
    opcode: Opcode,
    flags: u32,
    target: u64,
    buffer: IoBuffer,
    offset: usize,
    length: usize,
    protocol: u32,
    pdata: [u8; PDATA_SIZE],
}

impl Transaction {
    /// Create a transaction over `buffer[offset..offset + length]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the window does not fit in the
    /// buffer.
    pub fn new(buffer: IoBuffer, opcode: Opcode, offset: usize, length: usize) -> Result<Self> {
        check_window(offset, length, 0, buffer.len())?;
        Ok(Self {
            slot: CompletionSlot::new(),
            opcode,
            flags: 0,
            target: 0,
            buffer,
            offset,
            length,
            protocol: 0,
            pdata: [0; PDATA_SIZE],
        })
    }

    /// Allocate a fresh buffer of `length` bytes and cover all of it.
    pub fn alloc(opcode: Opcode, length: usize) -> Result<Self> {
        let buffer = IoBuffer::alloc(length)?;
        Self::new(buffer, opcode, 0, length)
    }

    #[inline]
    pub fn id(&self) -> TxnId {
        self.slot.id
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    /// Device byte offset the request addresses.
    #[inline]
    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn set_target(&mut self, target: u64) {
        self.target = target;
    }

    /// The shared buffer behind this transaction.
    #[inline]
    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    /// Start of the window, as an absolute buffer offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Protocol tag of the payload.
    #[inline]
    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    #[inline]
    pub fn protocol_data(&self) -> &[u8; PDATA_SIZE] {
        &self.pdata
    }

    /// Replace the protocol payload. Unused trailing bytes are zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `data` exceeds [`PDATA_SIZE`].
    pub fn set_protocol_data(&mut self, protocol: u32, data: &[u8]) -> Result<()> {
        if data.len() > PDATA_SIZE {
            return Err(Error::InvalidArgument(format!(
                "protocol data is {} bytes, limit {}",
                data.len(),
                PDATA_SIZE
            )));
        }
        self.protocol = protocol;
        self.pdata = [0; PDATA_SIZE];
        self.pdata[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Shrink the window to `[offset, offset + length)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the new window lies inside
    /// the current one.
    pub fn narrow(&mut self, offset: usize, length: usize) -> Result<()> {
        check_window(offset, length, self.offset, self.offset + self.length)?;
        self.offset = offset;
        self.length = length;
        Ok(())
    }

    /// Copy `data` into the window at `at` (relative to the window start).
    ///
    /// Returns the number of bytes copied; the copy stops at the window end.
    pub fn copy_to(&self, at: usize, data: &[u8]) -> usize {
        if at >= self.length {
            return 0;
        }
        let n = data.len().min(self.length - at);
        self.buffer.write(self.offset + at, &data[..n])
    }

    /// Copy from the window at `at` (relative to the window start) into `out`.
    pub fn copy_from(&self, at: usize, out: &mut [u8]) -> usize {
        if at >= self.length {
            return 0;
        }
        let n = out.len().min(self.length - at);
        self.buffer.read(self.offset + at, &mut out[..n])
    }

    /// Run `f` over the bytes of the window.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.buffer
            .with(|data| f(&data[self.offset..self.offset + self.length]))
    }

    /// Register the completion callback, replacing any previous one.
    ///
    /// The callback runs exactly once, on the thread that completes the
    /// transaction. It must not block.
    pub fn on_complete<F>(&mut self, f: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.slot.set_callback(Box::new(f));
    }

    /// Register a one-shot channel as the completion callback.
    pub fn completion(&mut self) -> CompletionReceiver<Completion> {
        let (tx, rx) = completion::<Completion>();
        self.on_complete(move |c| tx.success(c));
        rx
    }

    /// Create a full clone: same window, opcode, target and payload, sharing
    /// the buffer. The clone has its own id and no callback.
    pub fn clone_txn(&self) -> Transaction {
        Transaction {
            slot: CompletionSlot::new(),
            opcode: self.opcode,
            flags: self.flags,
            target: self.target,
            buffer: self.buffer.clone(),
            offset: self.offset,
            length: self.length,
            protocol: self.protocol,
            pdata: self.pdata,
        }
    }

    /// Clone a sub-window `[offset, offset + length)` (absolute buffer
    /// offsets).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the window lies inside this
    /// transaction's current window.
    pub fn clone_partial(&self, offset: usize, length: usize) -> Result<Transaction> {
        check_window(offset, length, self.offset, self.offset + self.length)?;
        let mut clone = self.clone_txn();
        clone.offset = offset;
        clone.length = length;
        Ok(clone)
    }

    /// Route this transaction's completion into `original`.
    ///
    /// When `self` completes (or is dropped, or force-completed), `original`
    /// completes with the same status and actual length.
    pub fn chain_to(mut self, original: Transaction) -> Transaction {
        debug!("{} chained to {}", self.id(), original.id());
        self.on_complete(move |c| original.complete(c.status, c.actual));
        self
    }

    /// Deliver the result. Consumes the transaction.
    pub fn complete(self, status: Status, actual: usize) {
        debug_assert!(
            status != Status::Ok || actual <= self.length,
            "{}: actual {} exceeds window {}",
            self.id(),
            actual,
            self.length
        );
        self.slot.fire(status, actual, false);
    }

    /// Whether the completion has been delivered, for instance by a forced
    /// removal of a device the transaction was queued to.
    pub fn is_completed(&self) -> bool {
        !self.slot.is_pending()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.slot.is_pending() {
            return;
        }
        if self.slot.has_callback() {
            warn!("{} dropped without completion", self.slot.id);
        }
        self.slot.fire(Status::Internal, 0, false);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.slot.id)
            .field("opcode", &self.opcode)
            .field("target", &self.target)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn check_window(offset: usize, length: usize, lo: usize, hi: usize) -> Result<()> {
    let end = offset
        .checked_add(length)
        .ok_or_else(|| Error::InvalidArgument("window overflows".to_string()))?;
    if offset < lo || end > hi {
        return Err(Error::InvalidArgument(format!(
            "window [{offset}, {end}) outside [{lo}, {hi})"
        )));
    }
    Ok(())
}
