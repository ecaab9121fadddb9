//! Lightweight process/mailbox runtime (§4.1).
//!
//! Generalizes the concurrency idiom the teacher's connection handling
//! actually uses throughout `connection.rs`/`server.rs`/the connection
//! registry — a `tokio::spawn`'d task per unit of concurrency, talking to
//! its owner through an `mpsc::Sender` — into a single named primitive, since
//! the spec treats "process" as its own leaf component rather than an
//! incidental implementation detail. The crate declares `kameo` as an actor
//! framework but never calls into it anywhere; this module is the real
//! pattern made explicit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::XmppError;

/// Default mailbox capacity (§4.1: "exceeds 10 000 undelivered messages").
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10_000;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Opaque process identity, returned by [`spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid#{}", self.0)
    }
}

/// The sending half of a process's mailbox — `send` never blocks; it fails
/// with [`XmppError::QueueLimit`] only once the bounded channel is full
/// (§4.1: a pending `receive` absorbs the send directly, which is exactly
/// `tokio::sync::mpsc`'s behavior when a receiver is already polling).
#[derive(Debug)]
pub struct Mailbox<M> {
    pid: Pid,
    tx: mpsc::Sender<M>,
}

// Written by hand rather than `#[derive(Clone)]`: the derive would add an
// `M: Clone` bound, but cloning a mailbox handle only clones the channel
// sender, never a message — message types here are routinely not `Clone`.
impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Mailbox {
            pid: self.pid,
            tx: self.tx.clone(),
        }
    }
}

impl<M> Mailbox<M> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// `send(pid, msg)` (§4.1). Non-blocking: fails immediately rather than
    /// waiting for room in the queue.
    pub fn send(&self, msg: M) -> Result<(), XmppError> {
        self.tx.try_send(msg).map_err(|_| XmppError::QueueLimit)
    }
}

/// The receiving half, held by the process body. At most one outstanding
/// `receive` per process is a caller obligation (§4.1 contract) — `&mut self`
/// here makes concurrent calls a borrow-checker error rather than a runtime one.
pub struct Inbox<M> {
    rx: mpsc::Receiver<M>,
}

impl<M> Inbox<M> {
    /// `receive(self)` (§4.1): suspend until a message is available.
    pub async fn receive(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests that assert the *absence* of a
    /// delivery without waiting on a timeout.
    pub fn try_receive(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

/// Create a mailbox pair without spawning a body — used when the owner wants
/// to drive its own receive loop inline rather than via [`spawn`].
pub fn mailbox<M>(capacity: usize) -> (Mailbox<M>, Inbox<M>) {
    let pid = Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Mailbox { pid, tx }, Inbox { rx })
}

/// `spawn(body)` (§4.1): create a new process with its own mailbox and run
/// `body` concurrently. The body receives its own [`Pid`] and [`Inbox`].
/// Exceptions (panics) inside `body` are caught at the task boundary and
/// reported via the returned [`JoinHandle`]'s `Err`, terminating only that
/// process — they are not propagated to the spawner.
pub fn spawn<M, F, Fut>(capacity: usize, body: F) -> (Mailbox<M>, JoinHandle<()>)
where
    M: Send + 'static,
    F: FnOnce(Pid, Inbox<M>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (mailbox, inbox) = mailbox(capacity);
    let pid = mailbox.pid();
    let handle = tokio::spawn(async move {
        body(pid, inbox).await;
    });
    (mailbox, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_receive_is_fifo_per_sender() {
        let (mbox, mut inbox) = mailbox::<u32>(DEFAULT_MAILBOX_CAPACITY);
        mbox.send(1).unwrap();
        mbox.send(2).unwrap();
        mbox.send(3).unwrap();
        assert_eq!(inbox.receive().await, Some(1));
        assert_eq!(inbox.receive().await, Some(2));
        assert_eq!(inbox.receive().await, Some(3));
    }

    #[tokio::test]
    async fn receive_suspends_until_a_send_arrives() {
        let (mbox, mut inbox) = mailbox::<u32>(4);
        let recv_task = tokio::spawn(async move { inbox.receive().await });
        tokio::task::yield_now().await;
        mbox.send(42).unwrap();
        assert_eq!(recv_task.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn send_fails_past_capacity_with_no_pending_receive() {
        let (mbox, _inbox) = mailbox::<u32>(1);
        mbox.send(1).unwrap();
        let err = mbox.send(2).unwrap_err();
        assert!(matches!(err, XmppError::QueueLimit));
    }

    #[tokio::test]
    async fn spawn_runs_body_concurrently_with_its_own_pid() {
        let (reply_tx, mut reply_rx) = mailbox::<Pid>(4);
        let (mbox, _handle) = spawn::<(), _, _>(4, move |pid, mut inbox| async move {
            reply_tx.send(pid).ok();
            let _ = inbox.receive().await;
        });
        let observed = reply_rx.receive().await.unwrap();
        assert_eq!(observed, mbox.pid());
    }
}
