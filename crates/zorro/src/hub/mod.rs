// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The hub: a single-threaded cooperative scheduler and I/O reactor.
//!
//! One hub owns a ready queue, a timer heap, a poller, and per-fd wait
//! queues. Tasks are stackless coroutines polled by the main loop; they
//! suspend only at the documented primitives (sleep, fd waits, promise
//! and condition waits) and run atomically in between. Foreign threads
//! interact through a [`HubController`] and the self-pipe only.

mod poller;
mod queue;
mod task;
mod wait;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::panic;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::Error;

use queue::{ReadyQueue, TimerHeap};
use task::{Hook, HubWaker, Injector, Task, TaskFuture};
use wait::Direction;

#[cfg(target_os = "linux")]
pub use poller::EpollPoller;
pub use poller::{Events, PollPoller, Poller};
pub use task::{TaskHandle, TaskKind};
pub use wait::{Sleep, WaitFd};

pub(crate) use task::{TaskId, Wake};

thread_local! {
    static CURRENT_HUB: RefCell<Option<Hub>> = RefCell::new(None);
}

/// Cross-thread shutdown flags plus the write end of the self-pipe.
/// Everything here is safe to touch from any thread.
pub(crate) struct Control {
    stopping: AtomicBool,
    stopped: AtomicBool,
    wakeup_fd: RawFd,
}

impl Control {
    /// Write one byte into the self-pipe so a blocked poll returns.
    /// A full pipe means a wakeup is already pending; ignore it.
    pub(crate) fn wakeup(&self) {
        unsafe {
            libc::write(self.wakeup_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

/// `Send + Sync` handle for foreign threads: stop, crash, wakeup.
/// All three take effect at the hub's next loop iteration.
#[derive(Clone)]
pub struct HubController {
    control: Arc<Control>,
}

impl HubController {
    /// Graceful shutdown: services are cancelled, user tasks drain.
    pub fn stop(&self) {
        self.control.stopping.store(true, Ordering::Release);
        self.control.wakeup();
    }

    /// Rude shutdown: the main loop exits at its next check.
    pub fn crash(&self) {
        self.control.stopped.store(true, Ordering::Release);
        self.control.wakeup();
    }

    pub fn wakeup(&self) {
        self.control.wakeup();
    }
}

pub(crate) struct HubShared {
    ready: RefCell<ReadyQueue>,
    timers: RefCell<TimerHeap>,
    pub(crate) tasks: RefCell<HashMap<TaskId, Task>>,
    readers: RefCell<HashMap<RawFd, VecDeque<TaskId>>>,
    writers: RefCell<HashMap<RawFd, VecDeque<TaskId>>>,
    poller: RefCell<Box<dyn Poller>>,
    start_tasks: RefCell<Vec<TaskFuture>>,
    next_id: Cell<TaskId>,
    current: Cell<Option<TaskId>>,
    running: Cell<bool>,
    services: Cell<usize>,
    users: Cell<usize>,
    helpers: Cell<usize>,
    control: Arc<Control>,
    control_rx: RawFd,
    injector: Arc<Injector>,
}

impl Drop for HubShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.control_rx);
        }
    }
}

/// Cheap handle to a hub. Not `Send`: a hub and everything scheduled on
/// it belong to one thread.
#[derive(Clone)]
pub struct Hub {
    shared: Rc<HubShared>,
}

impl Hub {
    /// Create a hub with the default poller for this OS.
    pub fn new() -> Result<Self, Error> {
        Self::with_poller(poller::default_poller()?)
    }

    /// Create a hub over an explicit poller backend.
    pub fn with_poller(mut poller: Box<dyn Poller>) -> Result<Self, Error> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        if let Err(e) = poller.register(fds[0], Events::IN) {
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(e.into());
        }
        let control = Arc::new(Control {
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wakeup_fd: fds[1],
        });
        Ok(Hub {
            shared: Rc::new(HubShared {
                ready: RefCell::new(ReadyQueue::new()),
                timers: RefCell::new(TimerHeap::new()),
                tasks: RefCell::new(HashMap::new()),
                readers: RefCell::new(HashMap::new()),
                writers: RefCell::new(HashMap::new()),
                poller: RefCell::new(poller),
                start_tasks: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                current: Cell::new(None),
                running: Cell::new(false),
                services: Cell::new(0),
                users: Cell::new(0),
                helpers: Cell::new(0),
                control: control.clone(),
                control_rx: fds[0],
                injector: Arc::new(Injector::new(control)),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Rc<HubShared>) -> Hub {
        Hub { shared }
    }

    /// The hub whose `run()` is driving the current thread.
    ///
    /// Panics outside a running hub; use [`Hub::try_current`] to probe.
    pub fn current() -> Hub {
        Self::try_current().expect("no hub is running on this thread")
    }

    pub fn try_current() -> Option<Hub> {
        CURRENT_HUB.with(|c| c.borrow().clone())
    }

    /// Thread-safe control handle for this hub.
    pub fn controller(&self) -> HubController {
        HubController {
            control: self.shared.control.clone(),
        }
    }

    // ---- spawning ----

    /// Spawn a user task. The hub's `run()` returns once every user task
    /// and service has finished.
    pub fn spawn<F>(&self, f: F) -> TaskHandle
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        self.spawn_task(Box::pin(f), TaskKind::User)
    }

    /// Spawn a service: a long-running loop cancelled on [`Hub::stop`].
    pub fn spawn_service<F>(&self, f: F) -> Result<TaskHandle, Error>
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        if self.shared.control.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(self.spawn_task(Box::pin(f), TaskKind::Service))
    }

    /// Spawn a helper: an internal worker cancelled once no user tasks
    /// or services remain.
    pub fn spawn_helper<F>(&self, f: F) -> TaskHandle
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        self.spawn_task(Box::pin(f), TaskKind::Helper)
    }

    /// Queue a user task to be spawned when `run()` starts.
    pub fn add_task<F>(&self, f: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        self.shared.start_tasks.borrow_mut().push(Box::pin(f));
    }

    fn spawn_task(&self, future: TaskFuture, kind: TaskKind) -> TaskHandle {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        self.shared.tasks.borrow_mut().insert(id, Task::new(kind, future));
        self.bump(kind, 1);
        self.queue_task(id, Wake::Start);
        TaskHandle {
            hub: Rc::downgrade(&self.shared),
            id,
        }
    }

    /// Handle to the task currently being polled.
    pub fn current_task(&self) -> TaskHandle {
        TaskHandle {
            hub: Rc::downgrade(&self.shared),
            id: self.current_id(),
        }
    }

    // ---- suspension primitives ----

    /// Suspend the current task for at least `dur`.
    pub fn sleep(&self, dur: Duration) -> Sleep {
        Sleep::new(self.clone(), Instant::now() + dur)
    }

    /// Suspend until `fd` is readable. Resumed with [`Error::Wait`] if
    /// the poller reports HUP or ERR instead.
    pub fn wait_read(&self, fd: RawFd) -> WaitFd {
        WaitFd::new(self.clone(), fd, Direction::Read)
    }

    /// Suspend until `fd` is writable.
    pub fn wait_write(&self, fd: RawFd) -> WaitFd {
        WaitFd::new(self.clone(), fd, Direction::Write)
    }

    // ---- shutdown ----

    /// Thread-safe poke: makes a blocked poll return promptly.
    pub fn wakeup(&self) {
        self.shared.control.wakeup();
    }

    /// Graceful shutdown. Idempotent. When called from inside a running
    /// hub the services are cancelled immediately; otherwise the flag is
    /// observed at the next loop iteration.
    pub fn stop(&self) {
        log::debug!("hub stop requested");
        self.shared.control.stopping.store(true, Ordering::Release);
        if self.shared.running.get() {
            self.cancel_kind(TaskKind::Service);
        } else {
            self.shared.control.wakeup();
        }
    }

    /// Rude stop: the main loop exits at its next check without draining.
    pub fn crash(&self) {
        log::debug!("hub crash requested");
        self.shared.control.stopped.store(true, Ordering::Release);
        self.shared.control.wakeup();
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.control.stopping.load(Ordering::Acquire)
    }

    // ---- main loop ----

    /// Spawn deferred tasks and run until all user tasks and services
    /// have finished (or `crash()` was invoked).
    pub fn run(&self) -> Result<(), Error> {
        assert!(!self.shared.running.get(), "hub is already running");
        self.shared.control.stopping.store(false, Ordering::Release);
        self.shared.control.stopped.store(false, Ordering::Release);
        self.shared.running.set(true);
        let _guard = CurrentHubGuard::enter(self.clone());
        log::debug!("hub starting");

        let deferred: Vec<TaskFuture> = self.shared.start_tasks.borrow_mut().drain(..).collect();
        for fut in deferred {
            self.spawn_task(fut, TaskKind::User);
        }

        let result = self.main_loop();

        self.shared.control.stopping.store(true, Ordering::Release);
        self.shared.control.stopped.store(true, Ordering::Release);
        self.shared.running.set(false);
        log::debug!("hub stopped");
        result
    }

    fn main_loop(&self) -> Result<(), Error> {
        loop {
            self.drain_injector();
            self.drain_ready();
            self.expire_timers();

            let control = &self.shared.control;
            if control.stopped.load(Ordering::Acquire) {
                log::debug!("breaking main loop");
                break;
            } else if control.stopping.load(Ordering::Acquire) && self.shared.services.get() > 0 {
                log::debug!("stopping services");
                self.cancel_kind(TaskKind::Service);
            } else if self.shared.users.get() == 0
                && self.shared.services.get() == 0
                && self.shared.helpers.get() > 0
            {
                log::debug!("no more active tasks, stopping helpers");
                self.cancel_kind(TaskKind::Helper);
            }
            if self.shared.users.get() == 0 && self.shared.services.get() == 0 {
                break;
            }
            if self.shared.ready.borrow().is_empty() {
                self.poll_io()?;
            }
        }
        Ok(())
    }

    fn drain_injector(&self) {
        for id in self.shared.injector.drain() {
            let exists = self.shared.tasks.borrow().contains_key(&id);
            if exists && !self.shared.ready.borrow().contains(id) {
                self.queue_task(id, Wake::Notify);
            }
        }
    }

    fn drain_ready(&self) {
        while !self.shared.control.stopped.load(Ordering::Acquire) {
            let next = self.shared.ready.borrow_mut().pop();
            match next {
                Some((id, wake)) => self.resume(id, wake),
                None => return,
            }
        }
    }

    fn resume(&self, id: TaskId, wake: Wake) {
        self.detach(id);
        let future = {
            let mut tasks = self.shared.tasks.borrow_mut();
            match tasks.get_mut(&id) {
                Some(task) => {
                    task.wake = Some(wake);
                    task.future.take()
                }
                None => return,
            }
        };
        let Some(mut future) = future else { return };

        let waker = Waker::from(Arc::new(HubWaker {
            id,
            injector: self.shared.injector.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        let prev = self.shared.current.replace(Some(id));
        let polled = panic::catch_unwind(panic::AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        self.shared.current.set(prev);

        match polled {
            Ok(Poll::Pending) => {
                if let Some(task) = self.shared.tasks.borrow_mut().get_mut(&id) {
                    task.future = Some(future);
                }
            }
            Ok(Poll::Ready(result)) => self.finish(id, result),
            Err(payload) => {
                log::error!("task panicked: {}", panic_message(payload.as_ref()));
                self.finish_silent(id);
            }
        }
    }

    fn finish(&self, id: TaskId, result: Result<(), Error>) {
        match &result {
            Ok(()) => {}
            Err(Error::Cancelled) => log::trace!("task exited on cancellation"),
            Err(e) => log::error!("exception in spawned task: {e}"),
        }
        self.finish_silent(id);
    }

    fn finish_silent(&self, id: TaskId) {
        self.detach(id);
        if let Some(task) = self.shared.tasks.borrow_mut().remove(&id) {
            self.bump(task.kind, -1);
        }
    }

    fn expire_timers(&self) {
        if self.shared.timers.borrow_mut().is_empty() {
            return;
        }
        let now = Instant::now();
        loop {
            let due = self.shared.timers.borrow_mut().pop_due(now);
            match due {
                Some(id) => self.queue_task(id, Wake::Timeout),
                None => break,
            }
        }
    }

    fn poll_io(&self) -> Result<(), Error> {
        let timeout_ms = {
            let mut timers = self.shared.timers.borrow_mut();
            match timers.min() {
                Some(deadline) => ceil_millis(deadline.saturating_duration_since(Instant::now())),
                None => -1,
            }
        };
        let mut events: Vec<(RawFd, Events)> = Vec::new();
        let res = self.shared.poller.borrow_mut().poll(timeout_ms, &mut events);
        if let Err(e) = res {
            // An interrupted poll counts as "no events".
            if matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ) {
                return Ok(());
            }
            return Err(e.into());
        }
        for (fd, ev) in events {
            if ev.intersects(Events::OUT) {
                let head = self.shared.writers.borrow().get(&fd).and_then(|q| q.front().copied());
                if let Some(id) = head {
                    self.queue_task(id, Wake::Write);
                }
            }
            if ev.intersects(Events::IN) {
                if fd == self.shared.control_rx {
                    self.drain_control();
                } else {
                    let head =
                        self.shared.readers.borrow().get(&fd).and_then(|q| q.front().copied());
                    if let Some(id) = head {
                        self.queue_task(id, Wake::Read);
                    }
                }
            }
            if ev.intersects(Events::HUP | Events::ERR) {
                let head = self.shared.readers.borrow().get(&fd).and_then(|q| q.front().copied());
                if let Some(id) = head {
                    self.queue_task(id, Wake::Err);
                }
                let head = self.shared.writers.borrow().get(&fd).and_then(|q| q.front().copied());
                if let Some(id) = head {
                    self.queue_task(id, Wake::Err);
                }
            }
        }
        Ok(())
    }

    fn drain_control(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.shared.control_rx,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < buf.len() as isize {
                break;
            }
        }
    }

    // ---- task bookkeeping ----

    /// Run and clear every cleanup hook the task installed since its last
    /// resume, removing it from all queues it is parked on.
    pub(crate) fn detach(&self, id: TaskId) {
        let hooks: Vec<Hook> = match self.shared.tasks.borrow_mut().get_mut(&id) {
            Some(task) => std::mem::take(&mut task.cleanup),
            None => return,
        };
        for hook in hooks {
            hook();
        }
    }

    /// Detach a task and append it to the ready queue.
    pub(crate) fn queue_task(&self, id: TaskId, wake: Wake) {
        self.detach(id);
        if !self.shared.tasks.borrow().contains_key(&id) {
            return;
        }
        let added = self.shared.ready.borrow_mut().push(id, wake);
        debug_assert!(added, "task queued twice");
        let shared = Rc::downgrade(&self.shared);
        self.push_hook(
            id,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.ready.borrow_mut().remove(id);
                }
            }),
        );
    }

    /// Deliver `err` at the task's next suspension point and wake it.
    pub(crate) fn throw_into(&self, id: TaskId, err: Error) {
        if !self.shared.tasks.borrow().contains_key(&id) {
            return;
        }
        self.queue_task(id, Wake::Notify);
        if let Some(task) = self.shared.tasks.borrow_mut().get_mut(&id) {
            task.throw = Some(err);
        }
    }

    /// Cancel every task of `kind`. Cancelled tasks are reclassified as
    /// user tasks so the loop keeps running until they actually exit.
    fn cancel_kind(&self, kind: TaskKind) {
        let ids: Vec<TaskId> = self
            .shared
            .tasks
            .borrow()
            .iter()
            .filter(|(_, t)| t.kind == kind)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            {
                let mut tasks = self.shared.tasks.borrow_mut();
                let Some(task) = tasks.get_mut(&id) else { continue };
                task.kind = TaskKind::User;
            }
            self.bump(kind, -1);
            self.bump(TaskKind::User, 1);
            self.throw_into(id, Error::Cancelled);
        }
    }

    fn bump(&self, kind: TaskKind, delta: isize) {
        let cell = match kind {
            TaskKind::Service => &self.shared.services,
            TaskKind::User => &self.shared.users,
            TaskKind::Helper => &self.shared.helpers,
        };
        cell.set((cell.get() as isize + delta).max(0) as usize);
    }

    pub(crate) fn push_hook(&self, id: TaskId, hook: Hook) {
        if let Some(task) = self.shared.tasks.borrow_mut().get_mut(&id) {
            task.cleanup.push(hook);
        }
    }

    pub(crate) fn current_id(&self) -> TaskId {
        self.shared
            .current
            .get()
            .expect("suspension primitive used outside a hub task")
    }

    pub(crate) fn take_wake(&self, id: TaskId) -> Option<Wake> {
        self.shared.tasks.borrow_mut().get_mut(&id).and_then(|t| t.wake.take())
    }

    pub(crate) fn take_throw(&self, id: TaskId) -> Option<Error> {
        self.shared.tasks.borrow_mut().get_mut(&id).and_then(|t| t.throw.take())
    }

    /// Park the current task on the timer heap; the hook tombstones the
    /// heap entry on detach.
    pub(crate) fn park_timer(&self, id: TaskId, deadline: Instant) {
        let slot = self.shared.timers.borrow_mut().add(deadline, id);
        self.push_hook(id, Box::new(move || slot.set(None)));
    }

    /// Park the current task at the tail of an fd wait queue and reflect
    /// the combined reader/writer interest to the poller.
    pub(crate) fn park_fd(&self, id: TaskId, fd: RawFd, dir: Direction) -> Result<(), Error> {
        let newly = !self.shared.readers.borrow().contains_key(&fd)
            && !self.shared.writers.borrow().contains_key(&fd);
        let map = match dir {
            Direction::Read => &self.shared.readers,
            Direction::Write => &self.shared.writers,
        };
        map.borrow_mut().entry(fd).or_default().push_back(id);
        if let Err(e) = self.update_mask(fd, newly) {
            let mut m = map.borrow_mut();
            if let Some(q) = m.get_mut(&fd) {
                q.retain(|&t| t != id);
                if q.is_empty() {
                    m.remove(&fd);
                }
            }
            return Err(e.into());
        }
        let shared = Rc::downgrade(&self.shared);
        self.push_hook(
            id,
            Box::new(move || {
                let Some(shared) = shared.upgrade() else { return };
                let hub = Hub::from_shared(shared);
                let map = match dir {
                    Direction::Read => &hub.shared.readers,
                    Direction::Write => &hub.shared.writers,
                };
                {
                    let mut m = map.borrow_mut();
                    if let Some(q) = m.get_mut(&fd) {
                        q.retain(|&t| t != id);
                        if q.is_empty() {
                            m.remove(&fd);
                        }
                    }
                }
                if let Err(e) = hub.update_mask(fd, false) {
                    log::warn!("failed to update poller mask for fd {fd}: {e}");
                }
            }),
        );
        Ok(())
    }

    /// Recompute the poller mask for `fd` from the wait queues:
    /// IN if readers, OUT if writers, unregister when both are empty.
    fn update_mask(&self, fd: RawFd, new: bool) -> io::Result<()> {
        let mut mask = Events::NONE;
        if self.shared.readers.borrow().contains_key(&fd) {
            mask |= Events::IN;
        }
        if self.shared.writers.borrow().contains_key(&fd) {
            mask |= Events::OUT;
        }
        let mut poller = self.shared.poller.borrow_mut();
        if new {
            poller.register(fd, mask)
        } else if !mask.is_empty() {
            poller.modify(fd, mask)
        } else {
            poller.unregister(fd)
        }
    }
}

struct CurrentHubGuard {
    prev: Option<Hub>,
}

impl CurrentHubGuard {
    fn enter(hub: Hub) -> Self {
        Self {
            prev: CURRENT_HUB.with(|c| c.replace(Some(hub))),
        }
    }
}

impl Drop for CurrentHubGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_HUB.with(|c| {
            *c.borrow_mut() = prev;
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Round a duration up to whole milliseconds for the poller.
fn ceil_millis(dur: Duration) -> i32 {
    let ms = dur.as_millis();
    let ms = if dur.as_nanos() > ms * 1_000_000 { ms + 1 } else { ms };
    ms.min(i32::MAX as u128) as i32
}
