// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Nonblocking stream sockets for channel drivers.
//!
//! A `Stream` owns one TCP or Unix-domain socket in nonblocking CLOEXEC
//! mode. Connect is single-flight: EINPROGRESS parks the task on
//! writability and SO_ERROR is checked before the stream is handed out.
//! Reads of zero bytes and writes hitting EPIPE/ECONNRESET surface as
//! [`Error::Eof`]; EAGAIN/EINTR are retried around a fresh readiness wait.

use std::cell::Cell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::Error;
use crate::hub::Hub;

/// Options recognised by channel drivers when opening their socket.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    /// When set, connect over a Unix-domain socket instead of TCP.
    pub unix_socket_path: Option<PathBuf>,
    /// Chunk size for receiver reads.
    pub receive_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            unix_socket_path: None,
            receive_buffer_size: 16 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            unix_socket_path: Some(path.into()),
            ..Self::default()
        }
    }
}

struct StreamInner {
    fd: RawFd,
    closed: Cell<bool>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Shared handle to one nonblocking socket. A channel's sender and
/// receiver tasks hold clones; only the channel decides when to close.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<StreamInner>,
}

impl Stream {
    /// Wrap an already-nonblocking fd, taking ownership of it.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            inner: Rc::new(StreamInner {
                fd,
                closed: Cell::new(false),
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Connect per the config: Unix-domain when a path is set, TCP
    /// otherwise.
    pub async fn connect(config: &ChannelConfig) -> Result<Stream, Error> {
        match &config.unix_socket_path {
            Some(path) => Self::connect_unix(path).await,
            None => Self::connect_tcp(&config.host, config.port).await,
        }
    }

    pub async fn connect_tcp(host: &str, port: u16) -> Result<Stream, Error> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or_else(|| {
                Error::from(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                ))
            })?;
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = new_socket(family)?;
        let stream = Stream::from_raw_fd(fd);
        let (storage, len) = sockaddr_from_std(&addr);
        finish_connect(&stream, &storage as *const _ as *const libc::sockaddr, len).await?;
        Ok(stream)
    }

    pub async fn connect_unix(path: &Path) -> Result<Stream, Error> {
        let fd = new_socket(libc::AF_UNIX)?;
        let stream = Stream::from_raw_fd(fd);

        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = std::os::unix::ffi::OsStrExt::as_bytes(path.as_os_str());
        if bytes.len() >= addr.sun_path.len() {
            return Err(Error::from(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix socket path too long",
            )));
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let base = &addr as *const _ as usize;
        let path_offset = addr.sun_path.as_ptr() as usize - base;
        let len = (path_offset + bytes.len() + 1) as libc::socklen_t;
        finish_connect(&stream, &addr as *const _ as *const libc::sockaddr, len).await?;
        Ok(stream)
    }

    /// Read once, appending up to `max` bytes to `buf`. Zero bytes from
    /// the peer is [`Error::Eof`].
    pub async fn read(&self, buf: &mut Vec<u8>, max: usize) -> Result<usize, Error> {
        let hub = Hub::current();
        loop {
            hub.wait_read(self.fd()).await?;
            let old_len = buf.len();
            buf.resize(old_len + max, 0);
            let n = unsafe {
                libc::read(self.fd(), buf[old_len..].as_mut_ptr() as *mut libc::c_void, max)
            };
            if n > 0 {
                buf.truncate(old_len + n as usize);
                return Ok(n as usize);
            }
            buf.truncate(old_len);
            if n == 0 {
                return Err(Error::Eof);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => return Err(Error::Eof),
                _ => return Err(err.into()),
            }
        }
    }

    /// Write once after a writability wait; returns the bytes accepted.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let hub = Hub::current();
        loop {
            hub.wait_write(self.fd()).await?;
            // MSG_NOSIGNAL: a dead peer must surface as an error, not
            // SIGPIPE.
            let n = unsafe {
                libc::send(
                    self.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                return Err(Error::Eof);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(Error::Eof),
                _ => return Err(err.into()),
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.replace(true) {
            unsafe {
                libc::close(self.inner.fd);
            }
        }
    }
}

fn new_socket(family: libc::c_int) -> Result<RawFd, Error> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

async fn finish_connect(
    stream: &Stream,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Result<(), Error> {
    let fd = stream.fd();
    let ret = unsafe { libc::connect(fd, addr, len) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err.into());
    }
    Hub::current().wait_write(fd).await?;
    // Writability after EINPROGRESS only means the attempt finished;
    // SO_ERROR says whether it succeeded.
    let mut so_error: libc::c_int = 0;
    let mut opt_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error).into());
    }
    Ok(())
}

fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Connected pair of nonblocking Unix-domain sockets. The loopback
/// building block for channel tests.
pub fn socket_pair() -> Result<(Stream, Stream), Error> {
    let mut fds = [0i32; 2];
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok((Stream::from_raw_fd(fds[0]), Stream::from_raw_fd(fds[1])))
}

/// Put an externally-created fd into nonblocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
