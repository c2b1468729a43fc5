use std::sync::Arc;

use arsock_protocol::{envelope, ReplyStatus, Result, NO_ROUTE};
use tracing::{debug, info, warn};

use crate::{
    config::SocketConfig,
    demux::ReplyDemultiplexer,
    dispatcher::PendingRequest,
    reactor::Reactor,
    registry::TargetRegistry,
    transport::{Connection, OwnedConnection, Transport},
};

/// Outcome of [`ConnectionManager::get_connection`].
pub enum Lookup {
    Available(Arc<dyn Connection>),
    /// Another caller is connecting this target right now.
    Connecting,
    /// No address is known or the connect failed.
    Unavailable,
    /// The target was torn down.
    Closed,
}

/// Creates connections lazily and rebuilds them after address changes or a
/// lost link.
///
/// Only the poll loop calls into this type, except for teardown which goes
/// through the registry directly. Connects run with the target's lock
/// released, so application threads are never held up by a slow peer.
pub struct ConnectionManager {
    registry: Arc<TargetRegistry>,
    transport: Arc<dyn Transport>,
    reactor: Arc<dyn Reactor>,
    config: SocketConfig,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<TargetRegistry>,
        transport: Arc<dyn Transport>,
        reactor: Arc<dyn Reactor>,
        config: SocketConfig,
    ) -> Self {
        ConnectionManager {
            registry,
            transport,
            reactor,
            config,
        }
    }

    pub fn get_connection(&self, target: usize) -> Lookup {
        let state = match self.registry.get(target) {
            Some(state) => state,
            None => return Lookup::Unavailable,
        };

        loop {
            let (address, epoch) = {
                let mut inner = state.lock();
                if inner.closed {
                    return Lookup::Closed;
                }
                if inner.connecting {
                    return Lookup::Connecting;
                }
                if let Some(conn) = &inner.connection {
                    let broken = conn.is_broken();
                    if !inner.address_dirty && !broken {
                        return Lookup::Available(conn.handle());
                    }
                    let failed = inner.invalidate();
                    info!(
                        target_id = target,
                        key = %state.key(),
                        failed,
                        broken,
                        "dropping connection"
                    );
                }
                inner.address_dirty = false;

                if inner.resolved_address.is_empty() {
                    debug!(target_id = target, key = %state.key(), "no resolved address");
                    return Lookup::Unavailable;
                }
                inner.connecting = true;
                (inner.resolved_address.clone(), inner.epoch)
            };

            let opened = self.open(target, &address);

            let mut inner = state.lock();
            inner.connecting = false;
            if inner.closed {
                return Lookup::Closed;
            }
            if inner.epoch != epoch {
                debug!(target_id = target, address = %address, "address changed while connecting");
                continue;
            }
            return match opened {
                Ok(conn) => {
                    let handle = conn.handle();
                    inner.connection = Some(conn);
                    Lookup::Available(handle)
                }
                Err(err) => {
                    warn!(target_id = target, address = %address, error = %err, "connect failed");
                    Lookup::Unavailable
                }
            };
        }
    }

    /// True when dispatching to `target` would not stall again: its
    /// connection is writable, or it has to be rebuilt or resolved anyway.
    pub fn can_progress(&self, target: usize) -> bool {
        let state = match self.registry.get(target) {
            Some(state) => state,
            None => return true,
        };
        let conn = {
            let inner = state.lock();
            if inner.connecting {
                return false;
            }
            match &inner.connection {
                Some(conn) if !inner.closed && !inner.address_dirty => conn.handle(),
                _ => return true,
            }
        };
        conn.writable() || conn.is_broken()
    }

    fn open(&self, target: usize, address: &str) -> Result<OwnedConnection> {
        let conn = self.transport.create_connection()?;
        // owned from here on, so a failed setup still closes the handle
        let owned = OwnedConnection::new(conn.clone(), self.reactor.clone());

        if let Some((public, secret, peer)) =
            self.config.security.as_ref().and_then(|keys| keys.complete())
        {
            conn.set_security(public, secret, peer)?;
        }
        conn.connect(address)?;

        let demux = ReplyDemultiplexer::new(
            Arc::downgrade(&self.registry),
            target,
            Arc::downgrade(&conn),
        );
        let watched = Arc::downgrade(&conn);
        self.reactor.add_item(
            conn.id(),
            Arc::new(move || {
                watched
                    .upgrade()
                    .map_or(false, |c| c.readable() || c.is_broken())
            }),
            Arc::new(move || {
                demux.on_readable();
            }),
        );
        info!(target_id = target, address, item = %conn.id(), "connected");
        Ok(owned)
    }

    /// Registers the request's promise, tags the payload with its routing
    /// id and sends it. A failed send resolves the promise as unreachable.
    pub fn send_request(&self, conn: &Arc<dyn Connection>, request: PendingRequest) {
        let PendingRequest {
            target,
            promise,
            frames,
        } = request;
        let state = match self.registry.get(target) {
            Some(state) => state,
            None => {
                if let Some(promise) = promise {
                    promise.fail(ReplyStatus::HostUnreachable);
                }
                return;
            }
        };

        let routing_id = match promise {
            Some(promise) => match state.register_promise(promise) {
                Some(id) => id,
                None => return,
            },
            None => NO_ROUTE,
        };

        match conn.send(envelope::wrap(routing_id, frames), self.config.send_timeout()) {
            Ok(()) => debug!(target_id = target, routing_id, "request sent"),
            Err(err) => {
                warn!(target_id = target, routing_id, error = %err, "send failed");
                if routing_id != NO_ROUTE {
                    if let Some(promise) = state.take_promise(routing_id) {
                        promise.fail(ReplyStatus::HostUnreachable);
                    }
                }
            }
        }
    }

    /// Touches every target so address changes are acted on without traffic.
    pub fn keepalive(&self) {
        for target in 0..self.registry.len() {
            let _ = self.get_connection(target);
        }
    }
}
