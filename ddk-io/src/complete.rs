//! One-shot completion channels.
//!
//! Driver-facing APIs deliver their results through a single call made from
//! whatever thread finishes the work. This module turns that into a future:
//! the producer holds a [`CompletionSender`], the consumer awaits (or
//! [`block_on`]s) the matching [`CompletionReceiver`].
//!
//! # Pattern
//!
//! 1. Create a completion pair with [`completion()`]
//! 2. Move the sender into the code that finishes the work
//! 3. Call exactly one of [`success`](CompletionSender::success),
//!    [`error`](CompletionSender::error) or
//!    [`complete`](CompletionSender::complete)
//! 4. Await the receiver
//!
//! Dropping the sender without sending resolves the receiver to
//! [`Error::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures_channel::oneshot;

use crate::error::{Error, Result};

/// Sender half of a completion pair.
///
/// Every method consumes the sender, so a result is sent at most once.
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> CompletionSender<T> {
    /// Send a result.
    pub fn complete(self, result: Result<T>) {
        // Ignore send error - receiver may have been dropped
        let _ = self.tx.send(result);
    }

    /// Send a successful value.
    pub fn success(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    /// Send an error.
    pub fn error(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    /// Whether the receiving side is gone.
    pub fn is_canceled(&self) -> bool {
        self.tx.is_canceled()
    }
}

/// Receiver half of a completion pair.
///
/// Implements `Future` - await this to get the result.
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> CompletionReceiver<T> {
    /// Block the current thread until the result arrives.
    pub fn wait(self) -> Result<T> {
        block_on(self)
    }

    /// Block for at most `timeout`.
    ///
    /// Returns `None` if the timer wins. The receiver is consumed either way;
    /// a result sent later is discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T>> {
        block_on_timeout(self, timeout)
    }

    /// Non-blocking check for a result.
    pub fn try_recv(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(_) => Some(Err(Error::Cancelled)),
        }
    }
}

impl<T> Future for CompletionReceiver<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a completion sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

/// Wakes the thread that is blocked in [`block_on`].
struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Block on a future, parking the current thread while it is pending.
///
/// Completions are produced by other threads (workers, interrupt threads,
/// the host's control thread), which unpark this one through the waker.
///
/// Must not be called from a bind hook or the control thread: the control
/// thread would stall every device it serves.
///
/// # Example
///
/// ```
/// use ddk_io::complete::{block_on, completion};
///
/// let (tx, rx) = completion::<u32>();
/// std::thread::spawn(move || tx.success(7));
/// assert_eq!(block_on(rx).unwrap(), 7);
/// ```
pub fn block_on<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    let mut future = std::pin::pin!(future);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(result) => return result,
            Poll::Pending => thread::park(),
        }
    }
}

/// Like [`block_on`], but give up after `timeout`.
///
/// The future is dropped when the timer wins. This is how an issuer races a
/// completion against its own deadline; there is no way to cancel the work
/// itself.
pub fn block_on_timeout<F: Future>(future: F, timeout: Duration) -> Option<F::Output> {
    let deadline = Instant::now() + timeout;
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    let mut future = std::pin::pin!(future);

    loop {
        if let Poll::Ready(result) = future.as_mut().poll(&mut cx) {
            return Some(result);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::park_timeout(deadline - now);
    }
}
