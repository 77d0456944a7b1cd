// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multiplexed request/reply with correlation identifiers.
//!
//! Each request carries an id allocated by the channel's `IdSource`;
//! replies are matched by id, so the peer may answer in any order.
//! Unknown or duplicate reply ids are dropped silently.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;

use crate::error::Error;
use crate::hub::Hub;
use crate::net::Stream;
use crate::sync::Promise;

use super::{run_worker, ChannelCore, ChannelHandle, Worker};

/// Correlation-id generator. The only contract is uniqueness over the
/// ids still outstanding on this channel.
pub trait IdSource {
    fn next_id(&mut self) -> Vec<u8>;
}

/// 20-byte ids: a 16-byte (pid, random, unix-seconds) prefix plus a
/// per-channel counter, reseeding the prefix when the counter wraps.
pub struct PrefixedId {
    prefix: [u8; 16],
    counter: u32,
}

impl PrefixedId {
    pub fn new() -> Self {
        let mut source = Self {
            prefix: [0; 16],
            counter: 0,
        };
        source.reseed();
        source
    }

    fn reseed(&mut self) {
        let pid = std::process::id();
        let entropy: u32 = rand::random();
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.prefix[0..4].copy_from_slice(&pid.to_be_bytes());
        self.prefix[4..8].copy_from_slice(&entropy.to_be_bytes());
        self.prefix[8..16].copy_from_slice(&secs.to_be_bytes());
    }
}

impl Default for PrefixedId {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for PrefixedId {
    fn next_id(&mut self) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        if self.counter == 0 {
            self.reseed();
            self.counter = 1;
        }
        let mut id = Vec::with_capacity(20);
        id.extend_from_slice(&self.prefix);
        id.extend_from_slice(&self.counter.to_be_bytes());
        id
    }
}

/// Big-endian wrapping u32, for protocols with a 32-bit id field.
#[derive(Default)]
pub struct WrappingU32 {
    counter: u32,
}

impl WrappingU32 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for WrappingU32 {
    fn next_id(&mut self) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        self.counter.to_be_bytes().to_vec()
    }
}

/// Little-endian wrapping i32, matching wire formats that frame the
/// request id as a signed 32-bit integer.
#[derive(Default)]
pub struct WrappingI32 {
    counter: i32,
}

impl WrappingI32 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for WrappingI32 {
    fn next_id(&mut self) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        self.counter.to_le_bytes().to_vec()
    }
}

struct MuxInner<T> {
    core: ChannelCore<(Vec<u8>, Vec<u8>)>,
    requests: RefCell<IndexMap<Vec<u8>, Promise<T>>>,
    ids: RefCell<Box<dyn IdSource>>,
}

/// Correlation-id request/reply engine. The pending queue carries
/// (id, payload) pairs so driver framing stays uniform for requests
/// and pushes alike.
pub struct MuxReqChannel<T> {
    inner: Rc<MuxInner<T>>,
}

impl<T> Clone for MuxReqChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> MuxReqChannel<T> {
    pub fn new(stream: Stream, ids: Box<dyn IdSource>) -> Self {
        Self {
            inner: Rc::new(MuxInner {
                core: ChannelCore::new(stream),
                requests: RefCell::new(IndexMap::new()),
                ids: RefCell::new(ids),
            }),
        }
    }

    /// Spawn the worker pair around a driver's sender and receiver
    /// loops. Must be called from inside a hub task.
    pub fn start<S, R>(&self, sender: S, receiver: R)
    where
        S: Future<Output = Result<(), Error>> + 'static,
        R: Future<Output = Result<(), Error>> + 'static,
    {
        let hub = Hub::current();
        self.inner.core.start_workers();
        hub.spawn_helper(run_worker(self.clone(), Worker::Sender, sender));
        hub.spawn_helper(run_worker(self.clone(), Worker::Receiver, receiver));
    }

    pub fn stream(&self) -> Stream {
        self.inner.core.stream().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.core.is_alive()
    }

    /// Allocate an id, register a promise under it, and queue the
    /// request. An id collision with an outstanding request is a driver
    /// bug in the channel's `IdSource`.
    pub fn request(&self, payload: Vec<u8>) -> Result<Promise<T>, Error> {
        if !self.inner.core.is_alive() {
            return Err(Error::PipeClosed);
        }
        let id = self.inner.ids.borrow_mut().next_id();
        let promise = Promise::new();
        {
            let mut requests = self.inner.requests.borrow_mut();
            assert!(
                !requests.contains_key(&id),
                "correlation id already outstanding"
            );
            requests.insert(id.clone(), promise.clone());
        }
        self.inner.core.push_pending((id, payload));
        Ok(promise)
    }

    /// Fire-and-forget: allocates an id for uniform framing but
    /// registers no promise.
    pub fn push(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self.inner.core.is_alive() {
            return Err(Error::PipeClosed);
        }
        let id = self.inner.ids.borrow_mut().next_id();
        self.inner.core.push_pending((id, payload));
        Ok(())
    }

    /// Receiver-side: resolve the promise registered under `id`. Late
    /// or duplicate replies are dropped.
    pub fn produce(&self, id: &[u8], frame: T) {
        let promise = self.inner.requests.borrow_mut().shift_remove(id);
        match promise {
            Some(promise) => promise.set(frame),
            None => log::debug!("dropping reply for unknown correlation id"),
        }
    }

    /// Park until at least one request is queued.
    pub async fn wait_requests(&self) -> Result<(), Error> {
        self.inner.core.wait_requests().await
    }

    /// Drain all queued (id, payload) pairs for the sender loop.
    pub fn take_pending(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner.core.take_pending()
    }

    /// Fail every registered promise, oldest first, and wake a sender
    /// blocked on the empty queue.
    fn stop_producing(&self) {
        let drained: Vec<(Vec<u8>, Promise<T>)> =
            self.inner.requests.borrow_mut().drain(..).collect();
        for (_, promise) in drained {
            promise.fail(Error::PipeClosed);
        }
        self.inner.core.notify();
    }
}

impl<T: Clone + 'static> ChannelHandle for MuxReqChannel<T> {
    fn mark_dead_and_fan_out(&self) {
        self.inner.core.mark_dead();
        self.stop_producing();
    }

    fn worker_exited(&self, which: Worker) {
        self.inner.core.worker_exited(which);
    }
}
