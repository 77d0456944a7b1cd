// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness pollers.
//!
//! `Poller` abstracts a level-triggered readiness primitive behind
//! register/modify/unregister/poll. `EpollPoller` is the Linux backend;
//! `PollPoller` is the portable poll(2) fallback. A negative timeout
//! blocks indefinitely.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// Readiness event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    pub const IN: Events = Events(1);
    pub const OUT: Events = Events(2);
    pub const HUP: Events = Events(4);
    pub const ERR: Events = Events(8);

    /// True if any bit of `other` is set in `self`.
    pub fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

/// Level-triggered readiness poller. The hub computes per-fd interest
/// masks; the poller just reflects them to the OS.
pub trait Poller {
    fn register(&mut self, fd: RawFd, events: Events) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()>;
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout_ms` (negative blocks forever) and append
    /// `(fd, events)` pairs to `out`. EINTR is returned to the caller,
    /// which treats it as "no events".
    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, Events)>) -> io::Result<()>;
}

/// Pick the best poller for the host OS.
pub(crate) fn default_poller() -> io::Result<Box<dyn Poller>> {
    #[cfg(target_os = "linux")]
    {
        let p = EpollPoller::new()?;
        log::info!("using epoll poller");
        Ok(Box::new(p))
    }
    #[cfg(not(target_os = "linux"))]
    {
        log::info!("using poll(2) poller");
        Ok(Box::new(PollPoller::new()))
    }
}

#[cfg(target_os = "linux")]
fn to_epoll(events: Events) -> u32 {
    let mut bits = 0u32;
    if events.intersects(Events::IN) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.intersects(Events::OUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

#[cfg(target_os = "linux")]
fn from_epoll(bits: u32) -> Events {
    let mut ev = Events::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        ev |= Events::IN;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ev |= Events::OUT;
    }
    if bits & libc::EPOLLHUP as u32 != 0 {
        ev |= Events::HUP;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        ev |= Events::ERR;
    }
    ev
}

/// Epoll-backed poller (Linux).
#[cfg(target_os = "linux")]
pub struct EpollPoller {
    epoll_fd: RawFd,
}

#[cfg(target_os = "linux")]
impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: Events) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Poller for EpollPoller {
    fn register(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT)
                && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, Events)>) -> io::Result<()> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for ev in events.iter().take(n as usize) {
            out.push((ev.u64 as RawFd, from_epoll(ev.events)));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn to_poll(events: Events) -> libc::c_short {
    let mut bits: libc::c_short = 0;
    if events.intersects(Events::IN) {
        bits |= libc::POLLIN;
    }
    if events.intersects(Events::OUT) {
        bits |= libc::POLLOUT;
    }
    bits
}

fn from_poll(bits: libc::c_short) -> Events {
    let mut ev = Events::NONE;
    if bits & libc::POLLIN != 0 {
        ev |= Events::IN;
    }
    if bits & libc::POLLOUT != 0 {
        ev |= Events::OUT;
    }
    if bits & libc::POLLHUP != 0 {
        ev |= Events::HUP;
    }
    if bits & libc::POLLERR != 0 {
        ev |= Events::ERR;
    }
    ev
}

/// poll(2)-backed poller. Rebuilds the pollfd array from the interest
/// table on every call; fine for the fd counts a single hub handles.
pub struct PollPoller {
    interest: HashMap<RawFd, Events>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self {
            interest: HashMap::new(),
        }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn register(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.interest.insert(fd, events);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, events: Events) -> io::Result<()> {
        self.interest.insert(fd, events);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interest.remove(&fd);
        Ok(())
    }

    fn poll(&mut self, timeout_ms: i32, out: &mut Vec<(RawFd, Events)>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .interest
            .iter()
            .map(|(&fd, &ev)| libc::pollfd {
                fd,
                events: to_poll(ev),
                revents: 0,
            })
            .collect();

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        for pfd in &fds {
            if pfd.revents != 0 {
                out.push((pfd.fd, from_poll(pfd.revents)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn check_pipe_readiness(poller: &mut dyn Poller) {
        let (read_fd, write_fd) = pipe_pair();
        poller.register(read_fd, Events::IN).unwrap();

        let mut out = Vec::new();
        poller.poll(0, &mut out).unwrap();
        assert!(out.is_empty());

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        poller.poll(100, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, read_fd);
        assert!(out[0].1.intersects(Events::IN));

        poller.unregister(read_fd).unwrap();
        close(read_fd);
        close(write_fd);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn epoll_pipe_readiness() {
        let mut p = EpollPoller::new().unwrap();
        check_pipe_readiness(&mut p);
    }

    #[test]
    fn poll_pipe_readiness() {
        let mut p = PollPoller::new();
        check_pipe_readiness(&mut p);
    }

    #[test]
    fn poll_hup_on_closed_writer() {
        let (read_fd, write_fd) = pipe_pair();
        let mut p = PollPoller::new();
        p.register(read_fd, Events::IN).unwrap();
        close(write_fd);

        let mut out = Vec::new();
        p.poll(100, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].1.intersects(Events::HUP) || out[0].1.intersects(Events::IN));
        close(read_fd);
    }

    #[test]
    fn event_mask_ops() {
        let m = Events::IN | Events::OUT;
        assert!(m.intersects(Events::IN));
        assert!(m.intersects(Events::OUT));
        assert!(!m.intersects(Events::HUP));
        assert!(Events::NONE.is_empty());
    }
}
