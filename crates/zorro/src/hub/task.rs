// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation.
//!
//! A task is a boxed coroutine plus the bookkeeping the hub needs to park
//! and resume it: cleanup hooks (one per queue the task is parked on), a
//! wake-reason slot, and a pending-throw slot for cancellation.

use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::sync::{Arc, Mutex};
use std::task::Wake as StdWake;

use crate::error::Error;

use super::{Control, Hub, HubShared};

pub(crate) type TaskId = u64;

/// Boxed task body. Tasks live and die on the hub thread, so no `Send`
/// bound; an `Err` return is the task's terminal exception.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + 'static>>;

/// Detach hook: removes the task from one queue it is parked on. Hooks
/// must not suspend; they run synchronously during detach.
pub(crate) type Hook = Box<dyn FnOnce()>;

/// What a task is for. Shutdown handling checks this tag: services are
/// cancelled on `stop`, helpers once no user work remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Long-running loop accepting external input; cancelled on `stop`.
    Service,
    /// Ordinary user work; the hub exits once all of these are done.
    User,
    /// Internal worker (channel sender/receiver); cancelled after services.
    Helper,
}

/// Why a parked task was resumed. Suspension futures read this from the
/// task's wake slot on their post-park poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// First poll after spawn.
    Start,
    /// The fd the task was head reader of became readable.
    Read,
    /// The fd the task was head writer of became writable.
    Write,
    /// The poller reported HUP/ERR on the awaited fd.
    Err,
    /// A timer deadline fired.
    Timeout,
    /// Generic wakeup: condition notify, promise completion, injector.
    Notify,
}

pub(crate) struct Task {
    pub kind: TaskKind,
    /// Taken out while the task is being polled.
    pub future: Option<TaskFuture>,
    /// Hooks installed since the last resume; detach drains them.
    pub cleanup: Vec<Hook>,
    pub wake: Option<Wake>,
    /// Error delivered at the task's next suspension point.
    pub throw: Option<Error>,
}

impl Task {
    pub fn new(kind: TaskKind, future: TaskFuture) -> Self {
        Self {
            kind,
            future: Some(future),
            cleanup: Vec::new(),
            wake: None,
            throw: None,
        }
    }
}

/// Opaque handle to a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) hub: Weak<HubShared>,
    pub(crate) id: TaskId,
}

impl TaskHandle {
    /// Deliver `err` at the task's current (or next) suspension point.
    /// No-op if the task already finished.
    pub fn throw(&self, err: Error) {
        if let Some(shared) = self.hub.upgrade() {
            Hub::from_shared(shared).throw_into(self.id, err);
        }
    }

    /// Cooperatively cancel the task.
    pub fn cancel(&self) {
        self.throw(Error::Cancelled);
    }

    pub fn is_finished(&self) -> bool {
        match self.hub.upgrade() {
            Some(shared) => !shared.tasks.borrow().contains_key(&self.id),
            None => true,
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Cross-thread wake inbox. `std::task::Waker`s handed to task polls are
/// `Send`, so they cannot touch hub state directly; they drop the task id
/// here and kick the self-pipe, and the hub drains the inbox each
/// iteration.
pub(crate) struct Injector {
    pending: Mutex<Vec<TaskId>>,
    control: Arc<Control>,
}

impl Injector {
    pub fn new(control: Arc<Control>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            control,
        }
    }

    pub fn wake(&self, id: TaskId) {
        self.pending.lock().unwrap().push(id);
        self.control.wakeup();
    }

    pub fn drain(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

pub(crate) struct HubWaker {
    pub id: TaskId,
    pub injector: Arc<Injector>,
}

impl StdWake for HubWaker {
    fn wake(self: Arc<Self>) {
        self.injector.wake(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.injector.wake(self.id);
    }
}
