use std::{sync::Arc, time::Duration};

use arsock_protocol::Result;
use bytes::Bytes;

use crate::reactor::{ItemId, Reactor};

/// Creates connection handles. Implementations must be usable from the poll
/// loop thread.
pub trait Transport: Send + Sync {
    fn create_connection(&self) -> Result<Arc<dyn Connection>>;
}

/// A message-oriented connection to one remote endpoint.
///
/// Every method takes `&self`; implementations serialize access internally.
/// Messages are lists of frames and are delivered whole or not at all.
pub trait Connection: Send + Sync {
    /// The handle this connection is registered under with the reactor.
    fn id(&self) -> ItemId;

    fn connect(&self, address: &str) -> Result<()>;

    fn set_security(&self, public_key: &str, secret_key: &str, peer_public_key: &str)
        -> Result<()>;

    /// True when at least one complete inbound message can be read.
    fn readable(&self) -> bool;

    /// True when a send would currently be accepted.
    fn writable(&self) -> bool;

    /// True once the link was lost after a successful connect. A broken
    /// connection is never reused; its owner rebuilds it.
    fn is_broken(&self) -> bool;

    fn send(&self, frames: Vec<Bytes>, timeout: Duration) -> Result<()>;

    /// Non-blocking read of one complete message.
    fn try_recv(&self) -> Result<Option<Vec<Bytes>>>;

    fn close(&self);
}

/// A connection registered with a reactor. Dropping it detaches the
/// connection from the reactor and closes it.
pub struct OwnedConnection {
    conn: Arc<dyn Connection>,
    reactor: Arc<dyn Reactor>,
}

impl OwnedConnection {
    pub fn new(conn: Arc<dyn Connection>, reactor: Arc<dyn Reactor>) -> Self {
        OwnedConnection { conn, reactor }
    }

    pub fn handle(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }
}

impl std::ops::Deref for OwnedConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl Drop for OwnedConnection {
    fn drop(&mut self) {
        self.reactor.remove_item(self.conn.id());
        self.conn.close();
    }
}
