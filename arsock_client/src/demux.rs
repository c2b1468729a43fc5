use std::sync::{Arc, Weak};

use arsock_protocol::{envelope, Reply, NO_ROUTE};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    registry::{TargetRegistry, TargetState},
    transport::Connection,
};

/// Inbound readiness callback for one target's connection. Matches each
/// reply to the pending promise registered under its routing id.
pub struct ReplyDemultiplexer {
    registry: Weak<TargetRegistry>,
    target: usize,
    connection: Weak<dyn Connection>,
}

impl ReplyDemultiplexer {
    pub fn new(registry: Weak<TargetRegistry>, target: usize, connection: Weak<dyn Connection>) -> Self {
        ReplyDemultiplexer {
            registry,
            target,
            connection,
        }
    }

    /// Reads replies until the connection has none left. Returns how many
    /// resolved a promise.
    ///
    /// If the link turned out to be broken, the connection is dropped from
    /// its target and every request still waiting on it fails as torn down.
    pub fn on_readable(&self) -> usize {
        let (registry, conn): (Arc<TargetRegistry>, Arc<dyn Connection>) =
            match (self.registry.upgrade(), self.connection.upgrade()) {
                (Some(registry), Some(conn)) => (registry, conn),
                _ => return 0,
            };
        let state = match registry.get(self.target) {
            Some(state) => state,
            None => return 0,
        };

        let mut resolved = 0;
        loop {
            match conn.try_recv() {
                Ok(Some(frames)) => {
                    if route(self.target, state, frames) {
                        resolved += 1;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(target_id = self.target, error = %err, "receive failed");
                    break;
                }
            }
        }

        if conn.is_broken() {
            if let Some(failed) = state.drop_broken(conn.id()) {
                info!(target_id = self.target, failed, "link lost, connection dropped");
            }
        }
        resolved
    }
}

fn route(target: usize, state: &TargetState, frames: Vec<Bytes>) -> bool {
    let (routing_id, payload) = match envelope::unwrap(frames) {
        Some(parts) => parts,
        None => {
            debug!(target_id = target, "dropping reply without routing id");
            return false;
        }
    };
    if routing_id == NO_ROUTE {
        debug!(target_id = target, "dropping unrouted reply");
        return false;
    }
    match state.take_promise(routing_id) {
        Some(promise) => {
            promise.fulfill(Reply::success(payload));
            true
        }
        None => {
            debug!(target_id = target, routing_id, "no pending request for reply");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockConnection,
        promise::{self, ReplyFuture},
        reactor::{PollLoop, Reactor},
        transport::OwnedConnection,
    };
    use arsock_protocol::ReplyStatus;
    use arsock_protocol::envelope::{encode_routing_id, wrap};
    use futures::FutureExt;

    struct Fixture {
        registry: Arc<TargetRegistry>,
        conn: Arc<MockConnection>,
        demux: ReplyDemultiplexer,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TargetRegistry::new(vec!["t".to_owned()], |_| {
            Some("tcp@10.0.0.1:1".to_owned())
        }));
        let conn = Arc::new(MockConnection::detached());
        let dyn_conn: Arc<dyn Connection> = conn.clone();
        let demux = ReplyDemultiplexer::new(Arc::downgrade(&registry), 0, Arc::downgrade(&dyn_conn));
        Fixture {
            registry,
            conn,
            demux,
        }
    }

    fn pending(registry: &TargetRegistry) -> (u64, ReplyFuture) {
        let (p, f) = promise::pair();
        let id = registry.get(0).unwrap().register_promise(p).unwrap();
        (id, f)
    }

    #[test]
    fn reply_resolves_matching_promise() {
        let fx = fixture();
        let (first, mut first_future) = pending(&fx.registry);
        let (second, second_future) = pending(&fx.registry);

        fx.conn
            .push_inbound(wrap(second, vec![Bytes::from_static(b"two")]));
        assert_eq!(1, fx.demux.on_readable());

        let reply = second_future.now_or_never().unwrap();
        assert!(reply.is_success());
        assert_eq!(vec![Bytes::from_static(b"two")], reply.frames);
        assert!((&mut first_future).now_or_never().is_none());
        assert_eq!(1, fx.registry.get(0).unwrap().pending_count());

        fx.conn.push_inbound(wrap(first, Vec::new()));
        assert_eq!(1, fx.demux.on_readable());
        assert!(first_future.now_or_never().unwrap().is_success());
    }

    #[test]
    fn malformed_and_unknown_replies_are_dropped() {
        let fx = fixture();
        let (_id, mut future) = pending(&fx.registry);

        fx.conn.push_inbound(Vec::new());
        fx.conn.push_inbound(vec![Bytes::from_static(b"bad")]);
        fx.conn.push_inbound(vec![encode_routing_id(NO_ROUTE)]);
        fx.conn.push_inbound(vec![encode_routing_id(999)]);

        assert_eq!(0, fx.demux.on_readable());
        assert!(!fx.conn.readable());
        assert!((&mut future).now_or_never().is_none());
        assert_eq!(1, fx.registry.get(0).unwrap().pending_count());
    }

    #[test]
    fn duplicate_reply_is_ignored() {
        let fx = fixture();
        let (id, future) = pending(&fx.registry);
        fx.conn.push_inbound(wrap(id, vec![Bytes::from_static(b"a")]));
        fx.conn.push_inbound(wrap(id, vec![Bytes::from_static(b"b")]));

        assert_eq!(1, fx.demux.on_readable());
        assert_eq!(
            vec![Bytes::from_static(b"a")],
            future.now_or_never().unwrap().frames
        );
    }

    #[test]
    fn dropped_connection_is_a_no_op() {
        let fx = fixture();
        let (_id, mut future) = pending(&fx.registry);
        fx.conn.push_inbound(wrap(1, Vec::new()));
        drop(fx.conn);

        assert_eq!(0, fx.demux.on_readable());
        assert!((&mut future).now_or_never().is_none());
    }

    #[test]
    fn lost_link_fails_waiting_requests() {
        let fx = fixture();
        let reactor: Arc<dyn Reactor> = Arc::new(PollLoop::new());
        fx.registry.get(0).unwrap().lock().connection =
            Some(OwnedConnection::new(fx.conn.clone(), reactor));
        let (_id, first) = pending(&fx.registry);
        let (_id, second) = pending(&fx.registry);

        // still healthy: nothing changes
        assert_eq!(0, fx.demux.on_readable());
        assert_eq!(2, fx.registry.get(0).unwrap().pending_count());

        fx.conn.break_link();
        assert_eq!(0, fx.demux.on_readable());
        for future in vec![first, second] {
            assert_eq!(ReplyStatus::TornDown, future.now_or_never().unwrap().status);
        }
        let target = fx.registry.get(0).unwrap();
        assert_eq!(0, target.pending_count());
        assert!(!target.is_connected());
        assert!(fx.conn.is_closed());
    }

    #[test]
    fn stale_broken_connection_leaves_the_current_one_alone() {
        let fx = fixture();
        let reactor: Arc<dyn Reactor> = Arc::new(PollLoop::new());
        let current = Arc::new(MockConnection::detached());
        fx.registry.get(0).unwrap().lock().connection =
            Some(OwnedConnection::new(current.clone(), reactor));
        let (_id, mut future) = pending(&fx.registry);

        fx.conn.break_link();
        fx.demux.on_readable();
        assert!((&mut future).now_or_never().is_none());
        assert!(fx.registry.get(0).unwrap().is_connected());
        assert!(!current.is_closed());
    }
}
