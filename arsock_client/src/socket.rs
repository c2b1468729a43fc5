use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use arsock_protocol::{Error, ErrorKind, Reply, Result};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    config::SocketConfig,
    connection::ConnectionManager,
    dispatcher::RequestDispatcher,
    promise::ReplyFuture,
    reactor::{ItemId, Reactor},
    registry::TargetRegistry,
    resolver::{self, AddressResolver, WatchId},
    transport::Transport,
};

static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Asynchronous request/reply socket over a fixed set of named targets.
///
/// Requests never block the caller: every request returns a [`ReplyFuture`]
/// that resolves once the correlated reply arrives, or with a failure status
/// when the target is unreachable, the send fails, the target's address
/// changes under it, or the socket is torn down. The socket does no I/O on
/// the calling thread; the reactor passed to [`AsyncRequestSocket::new`]
/// must be driven for requests to make progress.
///
/// Target 0 is the primary ("master") target.
pub struct AsyncRequestSocket {
    name: String,
    registry: Arc<TargetRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    resolver: Arc<dyn AddressResolver>,
    reactor: Arc<dyn Reactor>,
    watch: WatchId,
    keepalive: ItemId,
    cursor: AtomicUsize,
    torn_down: AtomicBool,
}

impl AsyncRequestSocket {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn AddressResolver>,
        reactor: Arc<dyn Reactor>,
        keys: Vec<String>,
        config: SocketConfig,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::new(
                ErrorKind::Config,
                "at least one target key is required",
            ));
        }
        let name = format!(
            "inproc://async_request_socket_{}",
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        // subscribe first: a change landing between the read and the seed
        // wins over the value read
        let registry = Arc::new(TargetRegistry::new(keys, |_| None));
        let watch = resolver::subscribe(&resolver, &registry);
        for state in registry.iter() {
            let epoch = state.epoch();
            let address = resolver.get(state.key()).filter(|a| !a.is_empty());
            if !state.seed_address(address, epoch) {
                debug!(key = %state.key(), "address changed while seeding");
            }
        }

        let keepalive_interval = config.keepalive_interval();
        let connections = Arc::new(ConnectionManager::new(
            registry.clone(),
            transport,
            reactor.clone(),
            config,
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(connections.clone(), reactor.clone()));

        let queue = Arc::downgrade(&dispatcher);
        let drain = Arc::downgrade(&dispatcher);
        reactor.add_item(
            dispatcher.id(),
            Arc::new(move || queue.upgrade().map_or(false, |d| d.has_work())),
            Arc::new(move || {
                if let Some(dispatcher) = drain.upgrade() {
                    dispatcher.drain();
                }
            }),
        );

        let keepalive = ItemId::next();
        let weak_connections = Arc::downgrade(&connections);
        reactor.add_timer(
            keepalive,
            keepalive_interval,
            Arc::new(move || {
                if let Some(connections) = weak_connections.upgrade() {
                    connections.keepalive();
                }
            }),
        );

        info!(name = %name, targets = registry.len(), "socket created");
        Ok(AsyncRequestSocket {
            name,
            registry,
            dispatcher,
            resolver,
            reactor,
            watch,
            keepalive,
            cursor: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Sends `frames` to one target. Fails fast, without queueing, when the
    /// target has no resolved address.
    pub fn request_to(&self, target: usize, frames: Vec<Bytes>, no_reply: bool) -> ReplyFuture {
        if self.is_torn_down() {
            return ReplyFuture::ready(Reply::torn_down());
        }
        match self.registry.get(target) {
            None => {
                warn!(socket = %self.name, target_id = target, "no such target");
                ReplyFuture::ready(Reply::host_unreachable())
            }
            Some(state) if !state.is_reachable() => {
                debug!(socket = %self.name, target_id = target, "target unreachable, failing fast");
                ReplyFuture::ready(Reply::host_unreachable())
            }
            Some(_) => self.dispatcher.send_to_target(target, frames, !no_reply),
        }
    }

    pub fn request_master(&self, frames: Vec<Bytes>, no_reply: bool) -> ReplyFuture {
        self.request_to(0, frames, no_reply)
    }

    /// Sends to the next reachable target in round-robin order. At most one
    /// sweep over all targets is made.
    pub fn request_any(&self, frames: Vec<Bytes>, no_reply: bool) -> ReplyFuture {
        if self.is_torn_down() {
            return ReplyFuture::ready(Reply::torn_down());
        }
        let count = self.registry.len();
        for _ in 0..count {
            let target = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            let reachable = self
                .registry
                .get(target)
                .map_or(false, |state| state.is_reachable());
            if reachable {
                return self.dispatcher.send_to_target(target, frames, !no_reply);
            }
        }
        debug!(socket = %self.name, "no reachable target");
        ReplyFuture::ready(Reply::host_unreachable())
    }

    /// Detaches from the reactor and the resolver, releases every connection
    /// and resolves every outstanding request as torn down. Later calls are
    /// no-ops.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reactor.remove_item(self.dispatcher.id());
        self.reactor.remove_timer(self.keepalive);
        self.resolver.unwatch(self.watch);

        let queued = self.dispatcher.close();
        let in_flight: usize = self.registry.iter().map(|state| state.shut_down()).sum();
        info!(socket = %self.name, queued, in_flight, "socket torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Process-unique name of this socket.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_count(&self) -> usize {
        self.registry.len()
    }

    pub fn target_key(&self, target: usize) -> Option<&str> {
        self.registry.get(target).map(|state| state.key())
    }

    pub fn resolved_address(&self, target: usize) -> Option<String> {
        self.registry.get(target).map(|state| state.resolved_address())
    }

    pub fn is_reachable(&self, target: usize) -> bool {
        self.registry
            .get(target)
            .map_or(false, |state| state.is_reachable())
    }

    pub fn is_connected(&self, target: usize) -> bool {
        self.registry
            .get(target)
            .map_or(false, |state| state.is_connected())
    }

    /// Requests sent to `target` and still waiting for a reply.
    pub fn pending_count(&self, target: usize) -> usize {
        self.registry
            .get(target)
            .map_or(0, |state| state.pending_count())
    }

    /// Requests accepted but not yet handed to a connection.
    pub fn queued_count(&self) -> usize {
        self.dispatcher.queued()
    }
}

impl Drop for AsyncRequestSocket {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockTransport,
        reactor::PollLoop,
        resolver::{ChangeListener, StaticResolver},
    };
    use arsock_protocol::ReplyStatus;
    use futures::FutureExt;

    fn socket(keys: &[&str], resolver: StaticResolver) -> (AsyncRequestSocket, Arc<PollLoop>) {
        let reactor = Arc::new(PollLoop::new());
        let socket = AsyncRequestSocket::new(
            Arc::new(MockTransport::new()),
            Arc::new(resolver),
            reactor.clone(),
            keys.iter().map(|k| k.to_string()).collect(),
            SocketConfig::default(),
        )
        .unwrap();
        (socket, reactor)
    }

    #[test]
    fn empty_key_list_is_rejected() {
        let err = AsyncRequestSocket::new(
            Arc::new(MockTransport::new()),
            Arc::new(StaticResolver::new()),
            Arc::new(PollLoop::new()),
            Vec::new(),
            SocketConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(ErrorKind::Config, err.kind());
    }

    #[test]
    fn names_are_unique() {
        let (a, _) = socket(&["m"], StaticResolver::new());
        let (b, _) = socket(&["m"], StaticResolver::new());
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("inproc://async_request_socket_"));
    }

    #[test]
    fn registers_queue_and_keepalive() {
        let (socket, reactor) = socket(&["m"], StaticResolver::new());
        assert_eq!(1, reactor.item_count());
        assert_eq!(1, reactor.timer_count());

        socket.teardown();
        assert_eq!(0, reactor.item_count());
        assert_eq!(0, reactor.timer_count());
    }

    #[test]
    fn unknown_target_fails_fast() {
        let (socket, _) = socket(
            &["m"],
            StaticResolver::with_addresses(vec![("m", "tcp@10.0.0.1:1")]),
        );
        let reply = socket.request_to(5, Vec::new(), false).now_or_never().unwrap();
        assert_eq!(ReplyStatus::HostUnreachable, reply.status);
        assert_eq!(0, socket.queued_count());
    }

    #[test]
    fn requests_after_teardown_are_torn_down() {
        let (socket, _) = socket(
            &["m"],
            StaticResolver::with_addresses(vec![("m", "tcp@10.0.0.1:1")]),
        );
        socket.teardown();
        socket.teardown();
        assert!(socket.is_torn_down());
        for reply in vec![
            socket.request_master(Vec::new(), false),
            socket.request_any(Vec::new(), false),
        ] {
            assert_eq!(ReplyStatus::TornDown, reply.now_or_never().unwrap().status);
        }
    }

    /// Moves a key to a new address right after handing out its old one.
    struct MovingResolver {
        inner: StaticResolver,
        moved: AtomicBool,
        to: &'static str,
    }

    impl AddressResolver for MovingResolver {
        fn watch(&self, keys: &[String], listener: ChangeListener) -> WatchId {
            self.inner.watch(keys, listener)
        }

        fn unwatch(&self, id: WatchId) {
            self.inner.unwatch(id)
        }

        fn get(&self, key: &str) -> Option<String> {
            let current = self.inner.get(key);
            if !self.moved.swap(true, Ordering::SeqCst) {
                self.inner.set(key, self.to);
            }
            current
        }
    }

    #[test]
    fn change_during_seeding_wins() {
        let resolver = MovingResolver {
            inner: StaticResolver::with_addresses(vec![("m", "tcp@10.0.0.1:1")]),
            moved: AtomicBool::new(false),
            to: "tcp@10.0.0.2:1",
        };
        let socket = AsyncRequestSocket::new(
            Arc::new(MockTransport::new()),
            Arc::new(resolver),
            Arc::new(PollLoop::new()),
            vec!["m".to_owned()],
            SocketConfig::default(),
        )
        .unwrap();
        assert_eq!(Some("tcp@10.0.0.2:1".to_owned()), socket.resolved_address(0));
    }

    #[test]
    fn introspection() {
        let (socket, _) = socket(
            &["m", "s"],
            StaticResolver::with_addresses(vec![("m", "tcp@10.0.0.1:1")]),
        );
        assert_eq!(2, socket.target_count());
        assert_eq!(Some("s"), socket.target_key(1));
        assert_eq!(Some("tcp@10.0.0.1:1".to_owned()), socket.resolved_address(0));
        assert!(socket.is_reachable(0));
        assert!(!socket.is_reachable(1));
        assert!(!socket.is_connected(0));
        assert_eq!(None, socket.target_key(2));
    }
}
