// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Order-preserving request/reply over a byte stream.
//!
//! Replies complete promises in the exact order requests were accepted.
//! A request declares up front whether its reply is a single frame or a
//! fixed number of frames; the receiver feeds parsed frames through
//! `produce` and the engine does the matching.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use crate::error::Error;
use crate::hub::Hub;
use crate::net::Stream;
use crate::sync::Promise;

use super::{run_worker, ChannelCore, ChannelHandle, Worker};

/// A pipelined reply: one frame delivered verbatim, or the fixed-size
/// group a multi-frame request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    One(T),
    Many(Vec<T>),
}

struct PipelinedInner<T> {
    core: ChannelCore<Vec<u8>>,
    /// Reply records, in request order.
    producing: RefCell<VecDeque<(Option<u32>, Promise<Reply<T>>)>>,
    /// Frames accumulated for the reply at the head of `producing`.
    cur_producing: RefCell<Vec<T>>,
}

/// Order-preserving request/reply engine. Cheap to clone; the sender
/// and receiver loops of a protocol driver each hold one.
pub struct PipelinedReqChannel<T> {
    inner: Rc<PipelinedInner<T>>,
}

impl<T> Clone for PipelinedReqChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> PipelinedReqChannel<T> {
    pub fn new(stream: Stream) -> Self {
        Self {
            inner: Rc::new(PipelinedInner {
                core: ChannelCore::new(stream),
                producing: RefCell::new(VecDeque::new()),
                cur_producing: RefCell::new(Vec::new()),
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

    /// Queue an encoded request. `num_frames` of `None` means the reply
    /// is a single frame; `Some(n)` collects exactly `n` frames. Fails
    /// synchronously once the channel is dead.
    pub fn request(
        &self,
        payload: Vec<u8>,
        num_frames: Option<u32>,
    ) -> Result<Promise<Reply<T>>, Error> {
        if !self.inner.core.is_alive() {
            return Err(Error::PipeClosed);
        }
        let promise = Promise::new();
        self.inner
            .producing
            .borrow_mut()
            .push_back((num_frames, promise.clone()));
        self.inner.core.push_pending(payload);
        Ok(promise)
    }

    /// Fire-and-forget: queue bytes without a reply record.
    pub fn push(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self.inner.core.is_alive() {
            return Err(Error::PipeClosed);
        }
        self.inner.core.push_pending(payload);
        Ok(())
    }

    /// Receiver-side: attribute one parsed frame to the head reply
    /// record, completing its promise when the frame count is reached.
    pub fn produce(&self, frame: T) -> Result<(), Error> {
        if !self.inner.core.is_alive() {
            return Err(Error::PipeClosed);
        }
        let completed = {
            let mut cur = self.inner.cur_producing.borrow_mut();
            let mut producing = self.inner.producing.borrow_mut();
            let num = match producing.front() {
                Some((num, _)) => *num,
                None => return Err(Error::Protocol("reply with no outstanding request")),
            };
            cur.push(frame);
            match num {
                None => {
                    let (_, promise) = producing.pop_front().expect("head checked above");
                    let frame = cur.pop().expect("frame pushed above");
                    cur.clear();
                    Some((promise, Reply::One(frame)))
                }
                Some(n) if cur.len() >= n as usize => {
                    let (_, promise) = producing.pop_front().expect("head checked above");
                    Some((promise, Reply::Many(std::mem::take(&mut *cur))))
                }
                Some(_) => None,
            }
        };
        if let Some((promise, reply)) = completed {
            promise.set(reply);
        }
        Ok(())
    }

    /// Park until at least one request is queued.
    pub async fn wait_requests(&self) -> Result<(), Error> {
        self.inner.core.wait_requests().await
    }

    /// Drain all queued request bytes for the sender loop.
    pub fn take_pending(&self) -> Vec<Vec<u8>> {
        self.inner.core.take_pending()
    }

    /// Fail every outstanding reply record with [`Error::PipeClosed`]
    /// and wake a sender blocked on the empty queue.
    fn stop_producing(&self) {
        let drained: Vec<(Option<u32>, Promise<Reply<T>>)> =
            self.inner.producing.borrow_mut().drain(..).collect();
        self.inner.cur_producing.borrow_mut().clear();
        for (_, promise) in drained {
            promise.fail(Error::PipeClosed);
        }
        self.inner.core.notify();
    }
}

impl<T: Clone + 'static> ChannelHandle for PipelinedReqChannel<T> {
    fn mark_dead_and_fan_out(&self) {
        self.inner.core.mark_dead();
        self.stop_producing();
    }

    fn worker_exited(&self, which: Worker) {
        self.inner.core.worker_exited(which);
    }
}
