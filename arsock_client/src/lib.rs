pub mod config;
pub mod connection;
pub mod demux;
pub mod dispatcher;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod promise;
pub mod reactor;
pub mod registry;
pub mod resolver;
pub mod socket;
pub mod tcp;
pub mod transport;

pub use config::{SecurityKeys, SocketConfig};
pub use promise::{ReplyFuture, ReplyPromise};
pub use reactor::{ItemId, PollLoop, PollLoopHandle, Reactor};
pub use resolver::{AddressChange, AddressResolver, ChangeKind, StaticResolver, WatchId};
pub use socket::AsyncRequestSocket;
pub use tcp::TcpTransport;
pub use transport::{Connection, Transport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `m`, recovering the guard if a panicking thread poisoned it. All
/// guarded state here stays consistent across a panic in a user callback.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
