// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Request/reply channel engines.
//!
//! A channel binds one socket to a pair of helper tasks (sender,
//! receiver) and hands promises to callers. `ChannelCore` holds the
//! lifecycle every engine shares: the pending-request FIFO and its
//! condition, the alive flags, and close-once semantics. The two
//! engines layered on it differ only in how replies find their promise:
//! [`PipelinedReqChannel`] by request order, [`MuxReqChannel`] by
//! correlation id.

mod mux;
mod pipelined;

pub use mux::{IdSource, MuxReqChannel, PrefixedId, WrappingI32, WrappingU32};
pub use pipelined::{PipelinedReqChannel, Reply};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;

use crate::error::Error;
use crate::net::Stream;
use crate::sync::Condition;

/// Which half of the worker pair a wrapper is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Worker {
    Sender,
    Receiver,
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Worker::Sender => f.write_str("sender"),
            Worker::Receiver => f.write_str("receiver"),
        }
    }
}

/// State shared by both channel engines. `R` is the pending-queue item:
/// raw bytes for the pipelined engine, (id, bytes) for the mux engine.
pub(crate) struct ChannelCore<R> {
    stream: Stream,
    pending: RefCell<VecDeque<R>>,
    cond: Condition,
    alive: Cell<bool>,
    sender_alive: Cell<bool>,
    receiver_alive: Cell<bool>,
    closed: Cell<bool>,
}

impl<R> ChannelCore<R> {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            pending: RefCell::new(VecDeque::new()),
            cond: Condition::new(),
            alive: Cell::new(true),
            sender_alive: Cell::new(false),
            receiver_alive: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub fn mark_dead(&self) {
        self.alive.set(false);
    }

    pub fn start_workers(&self) {
        self.sender_alive.set(true);
        self.receiver_alive.set(true);
    }

    /// Queue an outbound item and poke the sender.
    pub fn push_pending(&self, item: R) {
        self.pending.borrow_mut().push_back(item);
        self.cond.notify();
    }

    pub fn notify(&self) {
        self.cond.notify();
    }

    /// Park until at least one request is pending. Fails with
    /// [`Error::PipeClosed`] once the channel is dead, so a sender
    /// blocked on an empty queue exits when failure fans out.
    pub async fn wait_requests(&self) -> Result<(), Error> {
        loop {
            if !self.alive.get() {
                return Err(Error::PipeClosed);
            }
            if !self.pending.borrow().is_empty() {
                return Ok(());
            }
            self.cond.wait().await?;
        }
    }

    /// Drain everything queued so far.
    pub fn take_pending(&self) -> Vec<R> {
        self.pending.borrow_mut().drain(..).collect()
    }

    /// Record a worker exit; when both are gone, close the socket.
    /// Close runs exactly once.
    pub fn worker_exited(&self, which: Worker) {
        match which {
            Worker::Sender => self.sender_alive.set(false),
            Worker::Receiver => self.receiver_alive.set(false),
        }
        if !self.sender_alive.get() && !self.receiver_alive.get() && !self.closed.replace(true) {
            log::debug!("both channel workers gone, closing socket");
            self.stream.close();
        }
    }
}

/// Hook the worker wrappers use to kill a channel: engines fan failure
/// out to their outstanding promises and track the worker flags.
pub(crate) trait ChannelHandle {
    fn mark_dead_and_fan_out(&self);
    fn worker_exited(&self, which: Worker);
}

/// Wrap a driver's sender or receiver loop: classify its exit, mark the
/// channel dead, fan failure out, and close the socket once both
/// workers are gone. Eof, cancellation, and pipe-closed are clean
/// exits; anything else is logged.
pub(crate) async fn run_worker<H, F>(handle: H, which: Worker, body: F) -> Result<(), Error>
where
    H: ChannelHandle,
    F: Future<Output = Result<(), Error>>,
{
    let result = body.await;
    match &result {
        Ok(()) => log::debug!("channel {which} finished"),
        Err(e) if e.is_clean_exit() => log::debug!("channel {which} closed: {e}"),
        Err(e) => log::error!("channel {which} failed: {e}"),
    }
    handle.mark_dead_and_fan_out();
    handle.worker_exited(which);
    Ok(())
}
