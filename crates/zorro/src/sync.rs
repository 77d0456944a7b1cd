// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative synchronisation primitives: promise, condition, lock.
//!
//! All three park tasks through the hub's ready queue, so waiters wake
//! in FIFO order. None of these types are `Send`; they belong to the
//! thread of the hub that created their waiters.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::hub::{Hub, TaskId, Wake};

enum PromiseState<T> {
    Pending { waiters: Vec<TaskId> },
    Value(T),
    Failed(Error),
}

/// Single-assignment result cell with any number of waiters.
///
/// Once completed the state never changes; every waiter observes the
/// same value or error. Completing twice is a programming error and
/// panics.
pub struct Promise<T> {
    inner: Rc<RefCell<PromiseState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(PromiseState::Pending {
                waiters: Vec::new(),
            })),
        }
    }

    /// Resolve the promise and wake every waiter.
    pub fn set(&self, value: T) {
        self.complete(PromiseState::Value(value));
    }

    /// Fail the promise and wake every waiter.
    pub fn fail(&self, err: Error) {
        self.complete(PromiseState::Failed(err));
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.borrow(), PromiseState::Pending { .. })
    }

    fn complete(&self, state: PromiseState<T>) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(&*inner, PromiseState::Pending { .. }) {
                panic!("promise completed twice");
            }
            match std::mem::replace(&mut *inner, state) {
                PromiseState::Pending { waiters } => waiters,
                _ => unreachable!(),
            }
        };
        if waiters.is_empty() {
            return;
        }
        let hub = Hub::current();
        for id in waiters {
            hub.queue_task(id, Wake::Notify);
        }
    }
}

impl<T: 'static> Promise<T> {
    /// Run `f` as a user task and route its result into a new promise.
    pub fn spawn<F>(f: F) -> Promise<T>
    where
        F: Future<Output = Result<T, Error>> + 'static,
    {
        let promise = Promise::new();
        let p = promise.clone();
        Hub::current().spawn(async move {
            match f.await {
                Ok(value) => p.set(value),
                Err(err) => p.fail(err),
            }
            Ok(())
        });
        promise
    }
}

impl<T: Clone> Promise<T> {
    /// Wait for the result.
    pub fn get(&self) -> PromiseGet<T> {
        PromiseGet {
            inner: self.inner.clone(),
            timeout: None,
            deadline: None,
            parked: false,
        }
    }

    /// Wait for the result, giving up after `timeout`. A timeout raises
    /// [`Error::Timeout`] but leaves the promise pending, so a later
    /// `get` still observes the eventual completion.
    pub fn get_timeout(&self, timeout: Duration) -> PromiseGet<T> {
        PromiseGet {
            inner: self.inner.clone(),
            timeout: Some(timeout),
            deadline: None,
            parked: false,
        }
    }
}

/// Future returned by [`Promise::get`] / [`Promise::get_timeout`].
pub struct PromiseGet<T> {
    inner: Rc<RefCell<PromiseState<T>>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    parked: bool,
}

impl<T: Clone + 'static> Future for PromiseGet<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let hub = Hub::current();
        let id = hub.current_id();
        if let Some(err) = hub.take_throw(id) {
            return Poll::Ready(Err(err));
        }
        loop {
            match &*this.inner.borrow() {
                PromiseState::Value(v) => return Poll::Ready(Ok(v.clone())),
                PromiseState::Failed(e) => return Poll::Ready(Err(e.clone())),
                PromiseState::Pending { .. } => {}
            }
            if this.parked {
                this.parked = false;
                match hub.take_wake(id) {
                    Some(Wake::Timeout) => return Poll::Ready(Err(Error::Timeout)),
                    // Stray wake with nothing resolved: park again.
                    _ => {}
                }
            }
            if let PromiseState::Pending { waiters } = &mut *this.inner.borrow_mut() {
                waiters.push(id);
            }
            let inner = this.inner.clone();
            hub.push_hook(
                id,
                Box::new(move || {
                    if let PromiseState::Pending { waiters } = &mut *inner.borrow_mut() {
                        waiters.retain(|&w| w != id);
                    }
                }),
            );
            if let Some(timeout) = this.timeout {
                let deadline = *this.deadline.get_or_insert_with(|| Instant::now() + timeout);
                hub.park_timer(id, deadline);
            }
            this.parked = true;
            return Poll::Pending;
        }
    }
}

/// FIFO condition variable. `notify` wakes the longest-parked waiter;
/// a timed wait wakes spuriously when the deadline passes, so callers
/// re-check their predicate in a loop.
#[derive(Clone, Default)]
pub struct Condition {
    waiters: Rc<RefCell<VecDeque<TaskId>>>,
}

impl Condition {
    pub fn new() -> Self {
        Self {
            waiters: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Wake the head waiter, if any.
    pub fn notify(&self) {
        let head = self.waiters.borrow().front().copied();
        let Some(id) = head else { return };
        if let Some(hub) = Hub::try_current() {
            hub.queue_task(id, Wake::Notify);
        }
    }

    pub fn wait(&self) -> CondWait {
        CondWait {
            waiters: self.waiters.clone(),
            timeout: None,
            parked: false,
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> CondWait {
        CondWait {
            waiters: self.waiters.clone(),
            timeout: Some(timeout),
            parked: false,
        }
    }
}

/// Future returned by [`Condition::wait`] / [`Condition::wait_timeout`].
pub struct CondWait {
    waiters: Rc<RefCell<VecDeque<TaskId>>>,
    timeout: Option<Duration>,
    parked: bool,
}

impl Future for CondWait {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let hub = Hub::current();
        let id = hub.current_id();
        if let Some(err) = hub.take_throw(id) {
            return Poll::Ready(Err(err));
        }
        if this.parked {
            hub.take_wake(id);
            return Poll::Ready(Ok(()));
        }
        this.waiters.borrow_mut().push_back(id);
        let waiters = this.waiters.clone();
        hub.push_hook(
            id,
            Box::new(move || {
                waiters.borrow_mut().retain(|&w| w != id);
            }),
        );
        if let Some(timeout) = this.timeout {
            hub.park_timer(id, Instant::now() + timeout);
        }
        this.parked = true;
        Poll::Pending
    }
}

/// FIFO-fair mutual exclusion. The guard releases on drop.
#[derive(Default)]
pub struct Lock {
    locked: Cell<bool>,
    cond: Condition,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            locked: Cell::new(false),
            cond: Condition::new(),
        }
    }

    pub async fn acquire(&self) -> Result<LockGuard<'_>, Error> {
        while self.locked.get() {
            self.cond.wait().await?;
        }
        self.locked.set(true);
        Ok(LockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    fn release(&self) {
        self.locked.set(false);
        self.cond.notify();
    }
}

pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_in_hub<F>(body: impl FnOnce(Hub) -> F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let hub = Hub::new().unwrap();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        let fut = body(hub.clone());
        hub.add_task(async move {
            fut.await?;
            d.set(true);
            Ok(())
        });
        hub.run().unwrap();
        assert!(done.get(), "hub task did not complete cleanly");
    }

    #[test]
    fn promise_from_task_body() {
        let got = Rc::new(Cell::new(0));
        let g = got.clone();
        run_in_hub(move |_| async move {
            let p = Promise::spawn(async { Ok(123) });
            g.set(p.get().await?);
            Ok(())
        });
        assert_eq!(got.get(), 123);
    }

    #[test]
    fn promise_set_by_another_task() {
        let got = Rc::new(RefCell::new(String::new()));
        let g = got.clone();
        run_in_hub(move |hub| async move {
            let p: Promise<String> = Promise::new();
            let p2 = p.clone();
            hub.spawn(async move {
                p2.set("hello".to_string());
                Ok(())
            });
            *g.borrow_mut() = p.get().await?;
            Ok(())
        });
        assert_eq!(&*got.borrow(), "hello");
    }

    #[test]
    fn promise_timeout_leaves_value_retrievable() {
        let got = Rc::new(Cell::new(0));
        let g = got.clone();
        run_in_hub(move |hub| async move {
            let h = hub.clone();
            let p = Promise::spawn(async move {
                h.sleep(Duration::from_millis(60)).await?;
                Ok(234)
            });
            match p.get_timeout(Duration::from_millis(20)).await {
                Err(Error::Timeout) => {}
                other => panic!("expected timeout, got {other:?}"),
            }
            assert!(p.is_pending());
            g.set(p.get().await?);
            Ok(())
        });
        assert_eq!(got.get(), 234);
    }

    #[test]
    fn promise_failure_reaches_all_waiters() {
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        run_in_hub(move |hub| async move {
            let p: Promise<u32> = Promise::new();
            for _ in 0..3 {
                let p2 = p.clone();
                let s2 = s.clone();
                hub.spawn(async move {
                    match p2.get().await {
                        Err(Error::PipeClosed) => s2.set(s2.get() + 1),
                        other => panic!("expected PipeClosed, got {other:?}"),
                    }
                    Ok(())
                });
            }
            hub.sleep(Duration::from_millis(5)).await?;
            p.fail(Error::PipeClosed);
            Ok(())
        });
        assert_eq!(seen.get(), 3);
    }

    #[test]
    #[should_panic(expected = "promise completed twice")]
    fn promise_double_set_panics() {
        let p: Promise<u32> = Promise::new();
        p.set(1);
        p.set(2);
    }

    #[test]
    fn condition_notify_wakes_head() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run_in_hub(move |hub| async move {
            let cond = Condition::new();
            let c = cond.clone();
            let l2 = l.clone();
            hub.spawn(async move {
                l2.borrow_mut().push("hello");
                c.notify();
                Ok(())
            });
            cond.wait().await?;
            l.borrow_mut().push("woken");
            Ok(())
        });
        assert_eq!(*log.borrow(), vec!["hello", "woken"]);
    }

    #[test]
    fn condition_timeout_wakes_spuriously() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run_in_hub(move |hub| async move {
            let cond = Condition::new();
            let c = cond.clone();
            let l2 = l.clone();
            let h = hub.clone();
            hub.spawn(async move {
                l2.borrow_mut().push(1);
                h.sleep(Duration::from_millis(60)).await?;
                l2.borrow_mut().push(3);
                c.notify();
                Ok(())
            });
            cond.wait_timeout(Duration::from_millis(20)).await?;
            l.borrow_mut().push(2);
            cond.wait_timeout(Duration::from_millis(80)).await?;
            Ok(())
        });
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn lock_serialises_critical_sections() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run_in_hub(move |hub| async move {
            let lock = Rc::new(Lock::new());
            for (a, b, ms) in [(1, 2, 30u64), (3, 4, 10)] {
                let lock = lock.clone();
                let log = l.clone();
                let h = hub.clone();
                hub.spawn(async move {
                    let _guard = lock.acquire().await?;
                    log.borrow_mut().push(a);
                    h.sleep(Duration::from_millis(ms)).await?;
                    log.borrow_mut().push(b);
                    Ok(())
                });
            }
            hub.sleep(Duration::from_millis(80)).await?;
            Ok(())
        });
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn lock_waiters_acquire_in_fifo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        run_in_hub(move |hub| async move {
            let lock = Rc::new(Lock::new());
            let first = lock.acquire().await?;
            for i in 0..3 {
                let lock = lock.clone();
                let log = l.clone();
                hub.spawn(async move {
                    let _guard = lock.acquire().await?;
                    log.borrow_mut().push(i);
                    Ok(())
                });
            }
            hub.sleep(Duration::from_millis(5)).await?;
            drop(first);
            Ok(())
        });
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }
}
