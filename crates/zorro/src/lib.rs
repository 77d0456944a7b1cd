// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Zorro: a single-threaded cooperative runtime plus request/reply
//! channel engines.
//!
//! Components:
//! - hub — scheduler + I/O reactor: ready queue, timer heap, poller,
//!   task classes (service/user/helper), shutdown ladder
//! - sync — promise/condition/lock primitives parked on the hub
//! - net — nonblocking stream sockets with single-flight connect
//! - channel — pipelined (ordered) and multiplexed (id-correlated)
//!   request/reply engines over one socket each
//! - pool — bounded concurrency with per-call timeouts
//!
//! One hub per thread; tasks suspend only at the documented primitives
//! and run atomically in between. Foreign threads use [`HubController`].

pub mod channel;
pub mod error;
pub mod hub;
pub mod net;
pub mod pool;
pub mod sync;

pub use channel::{
    IdSource, MuxReqChannel, PipelinedReqChannel, PrefixedId, Reply, WrappingI32, WrappingU32,
};
pub use error::Error;
pub use hub::{Hub, HubController, TaskHandle, TaskKind};
pub use net::{socket_pair, ChannelConfig, Stream};
pub use pool::Pool;
pub use sync::{Condition, Lock, Promise};

/// Suspend the current task of the running hub for at least `dur`.
pub async fn sleep(dur: std::time::Duration) -> Result<(), Error> {
    Hub::current().sleep(dur).await
}
