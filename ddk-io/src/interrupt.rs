//! Interrupt handles and dispatch threads.
//!
//! A driver obtains an [`Interrupt`] from its parent's interrupt protocol and
//! hands it to an [`InterruptThread`]. The thread blocks in
//! [`Interrupt::wait`]; each return leaves the line masked until the handler
//! (or deferred work) calls [`Interrupt::complete`].
//!
//! ```text
//!           trigger ──► pending ──► wait() returns, line masked
//!                                       │
//!                                   handler(ctx)
//!                                       │
//!                   IrqAction::Complete │ IrqAction::KeepMasked
//!                         complete() ◄──┴──► worker calls complete() later
//! ```
//!
//! Shutdown is out of band: [`Interrupt::signal`] wakes the waiter with
//! [`Error::Cancelled`]. The signal is sticky, so a waiter that arrives late
//! still observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::lock;
use crate::thread::{JoinHandle, WorkerHandle, spawn};

#[derive(Debug, Default)]
struct IrqState {
    masked: bool,
    pending: bool,
    signaled: bool,
    waiting: bool,
}

struct IrqInner {
    vector: u32,
    state: Mutex<IrqState>,
    cond: Condvar,
}

/// A hardware interrupt line.
///
/// Clones refer to the same line. Only one thread may wait at a time.
#[derive(Clone)]
pub struct Interrupt {
    inner: Arc<IrqInner>,
}

impl Interrupt {
    pub fn new(vector: u32) -> Self {
        Self {
            inner: Arc::new(IrqInner {
                vector,
                state: Mutex::new(IrqState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn vector(&self) -> u32 {
        self.inner.vector
    }

    /// Block until the line fires, then mask it.
    ///
    /// # Errors
    ///
    /// * [`Error::Cancelled`] once [`signal`](Self::signal) has been called
    /// * [`Error::BadState`] if another thread is already waiting
    pub fn wait(&self) -> Result<()> {
        let mut st = lock(&self.inner.state);
        if st.waiting {
            return Err(Error::BadState(format!(
                "interrupt {} already has a waiter",
                self.inner.vector
            )));
        }
        st.waiting = true;
        loop {
            if st.signaled {
                st.waiting = false;
                return Err(Error::Cancelled);
            }
            if st.pending && !st.masked {
                st.pending = false;
                st.masked = true;
                st.waiting = false;
                return Ok(());
            }
            st = self
                .inner
                .cond
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Unmask the line. A trigger that arrived while masked is delivered to
    /// the next wait.
    pub fn complete(&self) {
        lock(&self.inner.state).masked = false;
        self.inner.cond.notify_all();
    }

    /// Wake the waiter for shutdown.
    pub fn signal(&self) {
        lock(&self.inner.state).signaled = true;
        self.inner.cond.notify_all();
    }

    /// Raise the line. Called by the interrupt source.
    pub fn trigger(&self) {
        lock(&self.inner.state).pending = true;
        self.inner.cond.notify_all();
    }

    pub fn is_masked(&self) -> bool {
        lock(&self.inner.state).masked
    }

    pub fn is_signaled(&self) -> bool {
        lock(&self.inner.state).signaled
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner.state);
        f.debug_struct("Interrupt")
            .field("vector", &self.inner.vector)
            .field("state", &*st)
            .finish()
    }
}

/// Capability published by devices that own interrupt lines.
///
/// Registered as protocol ops of type [`InterruptProtocolOps`] under
/// [`PROTOCOL_INTERRUPT`](crate::protocol::PROTOCOL_INTERRUPT).
pub trait InterruptProtocol: Send + Sync {
    /// Map interrupt `index` of this device.
    fn map_interrupt(&self, index: u32) -> Result<Interrupt>;
}

/// Ops type under which interrupt capabilities are published.
pub type InterruptProtocolOps = Arc<dyn InterruptProtocol>;

/// A fixed set of interrupt lines, indexed from zero.
#[derive(Debug, Clone)]
pub struct InterruptController {
    lines: Vec<Interrupt>,
}

impl InterruptController {
    /// Lines `0..count` with vectors `base..base + count`.
    pub fn new(base: u32, count: u32) -> Self {
        Self {
            lines: (0..count).map(|i| Interrupt::new(base + i)).collect(),
        }
    }

    /// Raise line `index`.
    pub fn trigger(&self, index: u32) -> Result<()> {
        self.line(index)?.trigger();
        Ok(())
    }

    fn line(&self, index: u32) -> Result<&Interrupt> {
        self.lines
            .get(index as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("no interrupt {index}")))
    }
}

impl InterruptProtocol for InterruptController {
    fn map_interrupt(&self, index: u32) -> Result<Interrupt> {
        self.line(index).cloned()
    }
}

/// What the dispatch thread does after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqAction {
    /// Unmask now.
    Complete,
    /// Leave the line masked; deferred work calls [`Interrupt::complete`].
    KeepMasked,
}

/// Passed to the interrupt handler on every delivery.
pub struct IrqContext<'a> {
    irq: &'a Interrupt,
    worker: Option<&'a WorkerHandle>,
    count: u64,
}

impl IrqContext<'_> {
    pub fn interrupt(&self) -> &Interrupt {
        self.irq
    }

    /// 1-based number of this delivery.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Hand long-running work to the worker attached at spawn time.
    ///
    /// # Errors
    ///
    /// [`Error::NotSupported`] without a worker, [`Error::PeerClosed`] if the
    /// worker has exited.
    pub fn defer<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.worker {
            Some(worker) => worker.send(f),
            None => Err(Error::NotSupported),
        }
    }
}

/// Dedicated thread that waits on one interrupt and runs a handler.
pub struct InterruptThread {
    irq: Interrupt,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<u64>>,
}

impl InterruptThread {
    /// Start dispatching `irq` to `handler`.
    pub fn spawn<F>(name: &str, irq: Interrupt, handler: F) -> Result<Self>
    where
        F: FnMut(&IrqContext<'_>) -> IrqAction + Send + 'static,
    {
        Self::spawn_inner(name, irq, None, handler)
    }

    /// Like [`spawn`](Self::spawn), with a worker for [`IrqContext::defer`].
    pub fn spawn_with_worker<F>(
        name: &str,
        irq: Interrupt,
        worker: WorkerHandle,
        handler: F,
    ) -> Result<Self>
    where
        F: FnMut(&IrqContext<'_>) -> IrqAction + Send + 'static,
    {
        Self::spawn_inner(name, irq, Some(worker), handler)
    }

    fn spawn_inner<F>(
        name: &str,
        irq: Interrupt,
        worker: Option<WorkerHandle>,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(&IrqContext<'_>) -> IrqAction + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_irq = irq.clone();
        let thread_stop = stop.clone();
        let join = spawn(name, move || {
            let mut count = 0u64;
            loop {
                match thread_irq.wait() {
                    Ok(()) if thread_stop.load(Ordering::Acquire) => break,
                    Ok(()) => {
                        count += 1;
                        let ctx = IrqContext {
                            irq: &thread_irq,
                            worker: worker.as_ref(),
                            count,
                        };
                        if handler(&ctx) == IrqAction::Complete {
                            thread_irq.complete();
                        }
                    }
                    Err(Error::Cancelled) => {
                        debug!("interrupt {} signaled", thread_irq.vector());
                        break;
                    }
                    Err(e) => {
                        warn!("interrupt {} wait failed: {e}", thread_irq.vector());
                        break;
                    }
                }
            }
            count
        })?;
        Ok(Self {
            irq,
            stop,
            join: Some(join),
        })
    }

    /// Signal the interrupt and wait for the thread to exit.
    ///
    /// Returns the number of interrupts handled.
    pub fn shutdown(mut self) -> Result<u64> {
        self.stop_and_join().map(|n| n.unwrap_or(0))
    }

    fn stop_and_join(&mut self) -> Result<Option<u64>> {
        self.stop.store(true, Ordering::Release);
        self.irq.signal();
        match self.join.take() {
            Some(join) if join.thread().id() != thread::current().id() => join.join().map(Some),
            _ => Ok(None),
        }
    }
}

impl Drop for InterruptThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            warn!("interrupt thread for {} failed: {e}", self.irq.vector());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complete::completion;
    use crate::thread::WorkerThread;
    use std::time::Duration;

    #[test]
    fn test_wait_masks_and_complete_unmasks() {
        let irq = Interrupt::new(5);
        irq.trigger();
        irq.wait().unwrap();
        assert!(irq.is_masked());

        // Trigger while masked stays pending until complete.
        irq.trigger();
        let waiter = irq.clone();
        let (tx, rx) = completion::<()>();
        let t = thread::spawn(move || {
            waiter.wait().unwrap();
            tx.success(());
        });
        assert!(rx.wait_timeout(Duration::from_millis(30)).is_none());
        irq.complete();
        t.join().unwrap();
        assert!(irq.is_masked());
    }

    #[test]
    fn test_signal_is_sticky() {
        let irq = Interrupt::new(1);
        irq.signal();
        assert!(matches!(irq.wait(), Err(Error::Cancelled)));
        assert!(matches!(irq.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_controller_maps_lines() {
        let ctl = InterruptController::new(32, 2);
        let ops: InterruptProtocolOps = Arc::new(ctl.clone());
        assert_eq!(ops.map_interrupt(1).unwrap().vector(), 33);
        assert!(ops.map_interrupt(2).is_err());
        assert!(ctl.trigger(7).is_err());
    }

    #[test]
    fn test_thread_handles_and_shuts_down() {
        let irq = Interrupt::new(9);
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = InterruptThread::spawn("irq9", irq.clone(), move |ctx| {
            tx.send(ctx.count()).unwrap();
            IrqAction::Complete
        })
        .unwrap();

        for expect in 1..=3 {
            irq.trigger();
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expect);
        }
        assert_eq!(thread.shutdown().unwrap(), 3);
    }

    #[test]
    fn test_deferred_completion() {
        let irq = Interrupt::new(4);
        let worker = WorkerThread::spawn("irq-worker").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let thread =
            InterruptThread::spawn_with_worker("irq4", irq.clone(), worker.handle(), move |ctx| {
                let line = ctx.interrupt().clone();
                let tx = tx.clone();
                ctx.defer(move || {
                    tx.send(line.is_masked()).unwrap();
                    line.complete();
                })
                .unwrap();
                IrqAction::KeepMasked
            })
            .unwrap();

        irq.trigger();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        irq.trigger();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(thread.shutdown().unwrap(), 2);
        worker.join().unwrap();
    }
}
