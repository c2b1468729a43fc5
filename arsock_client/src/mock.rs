//! Scriptable in-memory transport.
//!
//! Every connection records what was sent over it and replays whatever the
//! test pushes as inbound messages. Nothing touches the network.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arsock_protocol::{Error, ErrorKind, Result};
use bytes::Bytes;

use crate::{
    lock,
    reactor::ItemId,
    transport::{Connection, Transport},
};

/// Runs inside `connect`, before the connection records its address.
pub type ConnectHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Behaviour a transport shares with the connections it creates.
#[derive(Default)]
struct Script {
    refused: Mutex<HashSet<String>>,
    on_connect: Mutex<Option<ConnectHook>>,
}

#[derive(Default)]
pub struct MockTransport {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    script: Arc<Script>,
    create_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes later connects to `address` fail.
    pub fn refuse(&self, address: &str) {
        lock(&self.script.refused).insert(address.to_owned());
    }

    pub fn accept(&self, address: &str) {
        lock(&self.script.refused).remove(address);
    }

    /// Calls `hook` with the address of every later connect. It runs on the
    /// connecting thread, so it can stall the connect or change the world
    /// underneath it.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *lock(&self.script.on_connect) = Some(Arc::new(hook));
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }

    /// The most recent connection made to `address`.
    pub fn connection_to(&self, address: &str) -> Option<Arc<MockConnection>> {
        lock(&self.connections)
            .iter()
            .rev()
            .find(|c| c.address().as_deref() == Some(address))
            .cloned()
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(MockConnection::scripted(self.script.clone()));
        lock(&self.connections).push(conn.clone());
        Ok(conn)
    }
}

struct MockState {
    address: Option<String>,
    security: Option<(String, String, String)>,
    sent: Vec<Vec<Bytes>>,
    echoed: usize,
    inbound: VecDeque<Vec<Bytes>>,
    writable: bool,
    fail_sends: bool,
    broken: bool,
    closed: bool,
}

pub struct MockConnection {
    id: ItemId,
    script: Arc<Script>,
    state: Mutex<MockState>,
}

impl MockConnection {
    /// A connection that belongs to no transport.
    pub fn detached() -> Self {
        Self::scripted(Default::default())
    }

    fn scripted(script: Arc<Script>) -> Self {
        MockConnection {
            id: ItemId::next(),
            script,
            state: Mutex::new(MockState {
                address: None,
                security: None,
                sent: Vec::new(),
                echoed: 0,
                inbound: VecDeque::new(),
                writable: true,
                fail_sends: false,
                broken: false,
                closed: false,
            }),
        }
    }

    pub fn address(&self) -> Option<String> {
        lock(&self.state).address.clone()
    }

    pub fn security(&self) -> Option<(String, String, String)> {
        lock(&self.state).security.clone()
    }

    pub fn sent(&self) -> Vec<Vec<Bytes>> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state).sent.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn set_writable(&self, writable: bool) {
        lock(&self.state).writable = writable;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    /// Simulates the peer going away: the link stops carrying traffic in
    /// both directions and reports itself broken.
    pub fn break_link(&self) {
        lock(&self.state).broken = true;
    }

    pub fn push_inbound(&self, frames: Vec<Bytes>) {
        lock(&self.state).inbound.push_back(frames);
    }

    /// Queues every message sent since the last call as an inbound reply,
    /// routing id included. Returns how many were queued.
    pub fn echo_sent(&self) -> usize {
        let mut state = lock(&self.state);
        let fresh: Vec<Vec<Bytes>> = state.sent[state.echoed..].to_vec();
        state.echoed = state.sent.len();
        let count = fresh.len();
        state.inbound.extend(fresh);
        count
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ItemId {
        self.id
    }

    fn connect(&self, address: &str) -> Result<()> {
        let hook = lock(&self.script.on_connect).clone();
        if let Some(hook) = hook {
            hook(address);
        }
        if lock(&self.script.refused).contains(address) {
            return Err(Error::new(
                ErrorKind::Network,
                format!("connection to {} refused", address),
            ));
        }
        lock(&self.state).address = Some(address.to_owned());
        Ok(())
    }

    fn set_security(&self, public_key: &str, secret_key: &str, peer_public_key: &str) -> Result<()> {
        lock(&self.state).security = Some((
            public_key.to_owned(),
            secret_key.to_owned(),
            peer_public_key.to_owned(),
        ));
        Ok(())
    }

    fn readable(&self) -> bool {
        let state = lock(&self.state);
        !state.closed && !state.broken && !state.inbound.is_empty()
    }

    fn writable(&self) -> bool {
        let state = lock(&self.state);
        !state.closed && !state.broken && state.writable
    }

    fn is_broken(&self) -> bool {
        lock(&self.state).broken
    }

    fn send(&self, frames: Vec<Bytes>, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::new(ErrorKind::Closed, "connection closed"));
        }
        if state.broken {
            return Err(Error::new(ErrorKind::Closed, "link lost"));
        }
        if state.fail_sends {
            return Err(Error::new(ErrorKind::Network, "send failed"));
        }
        state.sent.push(frames);
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Vec<Bytes>>> {
        let mut state = lock(&self.state);
        if state.closed || state.broken {
            return Ok(None);
        }
        Ok(state.inbound.pop_front())
    }

    fn close(&self) {
        lock(&self.state).closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_addresses_fail_to_connect() {
        let transport = MockTransport::new();
        transport.refuse("tcp@10.0.0.1:1");
        let conn = transport.create_connection().unwrap();
        assert_eq!(
            ErrorKind::Network,
            conn.connect("tcp@10.0.0.1:1").unwrap_err().kind()
        );

        transport.accept("tcp@10.0.0.1:1");
        conn.connect("tcp@10.0.0.1:1").unwrap();
        assert!(transport.connection_to("tcp@10.0.0.1:1").is_some());
        assert_eq!(1, transport.create_count());
    }

    #[test]
    fn echo_replays_each_message_once() {
        let conn = MockConnection::detached();
        conn.send(vec![Bytes::from_static(b"a")], Duration::from_secs(1))
            .unwrap();
        assert_eq!(1, conn.echo_sent());
        assert_eq!(0, conn.echo_sent());
        assert_eq!(
            Some(vec![Bytes::from_static(b"a")]),
            conn.try_recv().unwrap()
        );
        assert_eq!(None, conn.try_recv().unwrap());
    }

    #[test]
    fn closed_connection_rejects_sends() {
        let conn = MockConnection::detached();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.writable());
        assert_eq!(
            ErrorKind::Closed,
            conn.send(Vec::new(), Duration::from_secs(1)).unwrap_err().kind()
        );
    }

    #[test]
    fn connect_hook_sees_every_address() {
        let transport = MockTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        transport.on_connect(move |address| lock(&record).push(address.to_owned()));

        transport.create_connection().unwrap().connect("tcp@10.0.0.1:1").unwrap();
        transport.create_connection().unwrap().connect("tcp@10.0.0.2:1").unwrap();
        assert_eq!(
            vec!["tcp@10.0.0.1:1".to_owned(), "tcp@10.0.0.2:1".to_owned()],
            *lock(&seen)
        );
    }

    #[test]
    fn broken_link_stops_traffic() {
        let conn = MockConnection::detached();
        conn.push_inbound(vec![Bytes::from_static(b"late")]);
        conn.break_link();
        assert!(conn.is_broken());
        assert!(!conn.readable());
        assert!(!conn.writable());
        assert_eq!(None, conn.try_recv().unwrap());
        assert!(conn.send(Vec::new(), Duration::from_secs(1)).is_err());
    }
}
