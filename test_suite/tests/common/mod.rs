#![allow(dead_code)]

use std::sync::Arc;

use arsock::mock::{MockConnection, MockTransport};
use arsock::*;
use bytes::Bytes;

pub struct Harness {
    pub transport: Arc<MockTransport>,
    pub resolver: Arc<StaticResolver>,
    pub poll: Arc<PollLoop>,
    pub socket: AsyncRequestSocket,
}

impl Harness {
    /// One target per `(key, address)`; `None` leaves the key unresolved.
    pub fn new(targets: &[(&str, Option<&str>)]) -> Self {
        Self::with_config(targets, SocketConfig::default())
    }

    pub fn with_config(targets: &[(&str, Option<&str>)], config: SocketConfig) -> Self {
        let resolver = Arc::new(StaticResolver::with_addresses(
            targets
                .iter()
                .filter_map(|(key, addr)| addr.map(|a| (key.to_string(), a.to_string()))),
        ));
        let transport = Arc::new(MockTransport::new());
        let poll = Arc::new(PollLoop::new());
        let socket = AsyncRequestSocket::new(
            transport.clone(),
            resolver.clone(),
            poll.clone(),
            targets.iter().map(|(key, _)| key.to_string()).collect(),
            config,
        )
        .unwrap();
        Harness {
            transport,
            resolver,
            poll,
            socket,
        }
    }

    pub fn cycle(&self) -> usize {
        self.poll.run_once()
    }

    pub fn conn(&self, address: &str) -> Arc<MockConnection> {
        self.transport
            .connection_to(address)
            .unwrap_or_else(|| panic!("no connection to {}", address))
    }
}

pub fn payload(s: &str) -> Vec<Bytes> {
    vec![Bytes::from(s.to_owned())]
}
