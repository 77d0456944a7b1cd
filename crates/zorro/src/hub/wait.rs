// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension futures: sleep and fd-readiness waits.
//!
//! Each future installs its cleanup hooks on first poll, before parking,
//! so a later detach reliably removes the task from every queue. The
//! post-park poll consumes the wake reason left by the hub.

use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::error::Error;

use super::task::Wake;
use super::Hub;

/// Which half of an fd wait queue a task parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Future returned by [`Hub::sleep`].
pub struct Sleep {
    hub: Hub,
    deadline: Instant,
    parked: bool,
}

impl Sleep {
    pub(crate) fn new(hub: Hub, deadline: Instant) -> Self {
        Self {
            hub,
            deadline,
            parked: false,
        }
    }
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.hub.current_id();
        if let Some(err) = this.hub.take_throw(id) {
            return Poll::Ready(Err(err));
        }
        if this.parked {
            match this.hub.take_wake(id) {
                Some(Wake::Timeout) | None => return Poll::Ready(Ok(())),
                // Stray wakeup before the deadline: park again. The old
                // heap entry was tombstoned when the task was detached.
                Some(_) => {}
            }
        }
        this.hub.park_timer(id, this.deadline);
        this.parked = true;
        Poll::Pending
    }
}

/// Future returned by [`Hub::wait_read`] / [`Hub::wait_write`].
pub struct WaitFd {
    hub: Hub,
    fd: RawFd,
    dir: Direction,
    parked: bool,
}

impl WaitFd {
    pub(crate) fn new(hub: Hub, fd: RawFd, dir: Direction) -> Self {
        Self {
            hub,
            fd,
            dir,
            parked: false,
        }
    }
}

impl Future for WaitFd {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.hub.current_id();
        if let Some(err) = this.hub.take_throw(id) {
            return Poll::Ready(Err(err));
        }
        if this.parked {
            // Readiness is level-triggered: anything but an error
            // condition completes the wait, and callers that race a
            // spurious wake just hit EAGAIN and wait again.
            return match this.hub.take_wake(id) {
                Some(Wake::Err) => Poll::Ready(Err(Error::Wait)),
                _ => Poll::Ready(Ok(())),
            };
        }
        if let Err(e) = this.hub.park_fd(id, this.fd, this.dir) {
            return Poll::Ready(Err(e));
        }
        this.parked = true;
        Poll::Pending
    }
}
