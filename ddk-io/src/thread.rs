//! Worker threads with message passing.
//!
//! A [`WorkerThread`] is a named OS thread that runs closures posted to it, in
//! order, one at a time. The device host runs its control thread this way:
//! every lifecycle change is a message on that thread, so driver hooks never
//! race each other.
//!
//! Other threads talk to a worker through a [`WorkerHandle`], which is cheap to
//! clone and can be sent anywhere.
//!
//! # Example
//!
//! ```
//! use ddk_io::WorkerThread;
//!
//! let worker = WorkerThread::spawn("worker")?;
//! let answer = worker.handle().call(|| 6 * 7).wait()?;
//! assert_eq!(answer, 42);
//! worker.join()?;
//! # Ok::<(), ddk_io::Error>(())
//! ```

use std::sync::mpsc;
use std::thread::{self, ThreadId};

use log::{debug, trace};

use crate::complete::{CompletionReceiver, completion};
use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send>;

enum Msg {
    Run(Task),
    Stop,
}

/// Spawn a named OS thread running `f`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the OS refuses to create the thread.
pub fn spawn<F, T>(name: &str, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
    Ok(JoinHandle { handle })
}

/// Owner of a message-loop thread.
///
/// Dropping the owner stops the loop after the messages already queued and
/// waits for the thread, unless the drop happens on the worker itself.
pub struct WorkerThread {
    handle: WorkerHandle,
    join: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Start a worker named `name`.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Msg>();
        let thread_name = name.to_string();
        let join = spawn(name, move || {
            debug!("worker {thread_name} started");
            while let Ok(msg) = rx.recv() {
                match msg {
                    Msg::Run(task) => task(),
                    Msg::Stop => break,
                }
            }
            debug!("worker {thread_name} exiting");
        })?;
        let handle = WorkerHandle {
            tx,
            id: join.thread().id(),
        };
        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    /// Get a handle for posting work to this thread.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanic`] if a posted closure panicked.
    pub fn join(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        let _ = self.handle.tx.send(Msg::Stop);
        match self.join.take() {
            Some(join) if !self.handle.is_current() => join.join(),
            _ => Ok(()),
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            debug!("worker join failed: {e}");
        }
    }
}

/// Cloneable, thread-safe handle to a [`WorkerThread`].
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Msg>,
    id: ThreadId,
}

impl WorkerHandle {
    /// Post a closure. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerClosed`] if the worker has exited.
    pub fn send<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("posting task to {:?}", self.id);
        self.tx
            .send(Msg::Run(Box::new(f)))
            .map_err(|_| Error::PeerClosed)
    }

    /// Post a closure and get its result through a completion.
    ///
    /// The receiver resolves to [`Error::Cancelled`] if the worker exits (or
    /// the closure panics) before the result is sent.
    pub fn call<F, T>(&self, f: F) -> CompletionReceiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = completion::<T>();
        // On failure the closure, and the sender with it, is dropped.
        let _ = self.send(move || tx.success(f()));
        rx
    }

    /// Whether the caller is running on this worker.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish()
    }
}

/// Handle to a spawned thread.
pub struct JoinHandle<T> {
    handle: thread::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Wait for the thread to finish and return its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanic`] if the thread panicked.
    pub fn join(self) -> Result<T> {
        self.handle.join().map_err(|_| Error::ThreadPanic)
    }

    /// Check if the thread has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Get the underlying OS thread handle.
    pub fn thread(&self) -> &thread::Thread {
        self.handle.thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_messages_run_in_order() {
        let worker = WorkerThread::spawn("order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            worker.handle().send(move || log.lock().unwrap().push(i)).unwrap();
        }
        worker.handle().call(|| ()).wait().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        worker.join().unwrap();
    }

    #[test]
    fn test_is_current() {
        let worker = WorkerThread::spawn("current").unwrap();
        let h = worker.handle();
        assert!(!h.is_current());
        let inner = h.clone();
        assert!(h.call(move || inner.is_current()).wait().unwrap());
    }

    #[test]
    fn test_send_after_shutdown() {
        let worker = WorkerThread::spawn("gone").unwrap();
        let h = worker.handle();
        worker.join().unwrap();
        assert!(matches!(h.send(|| ()), Err(Error::PeerClosed)));
        assert!(matches!(h.call(|| 1).wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_panic_reported_on_shutdown() {
        let worker = WorkerThread::spawn("panics").unwrap();
        worker.handle().send(|| panic!("boom")).unwrap();
        assert!(matches!(worker.join(), Err(Error::ThreadPanic)));
    }

    #[test]
    fn test_spawn_join() {
        let h = spawn("joined", || "done").unwrap();
        assert_eq!(h.thread().name(), Some("joined"));
        assert_eq!(h.join().unwrap(), "done");
    }
}
