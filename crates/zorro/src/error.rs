// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy shared by the hub, sync primitives, and channels.
//!
//! `Error` is `Clone` because channel death fans a single failure out to
//! every outstanding promise; OS errors are `Arc`-wrapped for that reason.

use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The channel's sender or receiver is gone and no reply can arrive.
    #[error("request/reply channel is closed")]
    PipeClosed,

    /// A timed `Promise::get` or `Condition::wait` deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The poller reported HUP or ERR on a descriptor a task was parked on.
    #[error("error condition on awaited file descriptor")]
    Wait,

    /// The task is being torn down by hub shutdown or an explicit cancel.
    #[error("task cancelled")]
    Cancelled,

    /// The peer closed the byte stream (read returned zero bytes, or a
    /// write hit EPIPE/ECONNRESET).
    #[error("end of stream")]
    Eof,

    /// Service spawn rejected because the hub is stopping.
    #[error("hub is shutting down")]
    ShuttingDown,

    /// The peer violated the framing the channel driver expects.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Any other OS-level failure.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Channel worker exits with these are clean; anything else is logged
    /// as a dirty exit.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Error::Eof | Error::Cancelled | Error::PipeClosed)
    }

    pub(crate) fn last_os_error() -> Error {
        std::io::Error::last_os_error().into()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
