//! Plain TCP transport.
//!
//! Messages are carried with the multipart codec from
//! [`arsock_protocol::frame`]. Addresses may carry a `tcp@` or `tcp://`
//! scheme prefix. The stream stays non-blocking between calls so the poll
//! loop can check it; sends switch it to blocking with a write timeout.
//! A stream lost after a successful connect marks the connection broken and
//! is never re-established here. The connection manager replaces it.

use std::{
    collections::VecDeque,
    io::{ErrorKind as IoErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::Duration,
};

use arsock_protocol::{frame, Error, ErrorKind, Result};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    lock,
    reactor::ItemId,
    transport::{Connection, Transport},
};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Copy, Clone)]
pub struct TcpOpt {
    pub connect_timeout: Duration,
    pub nodelay: bool,
    pub ttl: Option<u32>,
}

impl Default for TcpOpt {
    fn default() -> Self {
        TcpOpt {
            connect_timeout: Duration::from_secs(3),
            nodelay: true,
            ttl: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TcpTransport {
    pub opt: TcpOpt,
}

impl TcpTransport {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_opt(opt: TcpOpt) -> Self {
        TcpTransport { opt }
    }
}

impl Transport for TcpTransport {
    fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(TcpConnection::new(self.opt)))
    }
}

/// Strips the scheme prefix and resolves `host:port`.
pub fn parse_address(address: &str) -> Result<SocketAddr> {
    let host_port = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("tcp@"))
        .unwrap_or(address);
    host_port
        .to_socket_addrs()
        .map_err(|err| Error::new(ErrorKind::Config, format!("bad address {}: {}", address, err)))?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Config, format!("address {} did not resolve", address)))
}

#[derive(Default)]
struct TcpState {
    stream: Option<TcpStream>,
    /// The stream was lost after a successful connect.
    broken: bool,
    read_buf: BytesMut,
    ready: VecDeque<Vec<Bytes>>,
}

impl TcpState {
    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.read_buf.clear();
    }

    fn mark_broken(&mut self) {
        self.drop_stream();
        self.broken = true;
    }

    /// Reads whatever is available without blocking and decodes every
    /// complete message into `ready`.
    fn fill(&mut self) -> Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        let mut chunk = [0u8; READ_CHUNK];
        let outcome = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Some(Ok(())),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == IoErrorKind::WouldBlock => break None,
                Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => break Some(Err(err)),
            }
        };
        loop {
            match frame::decode(&mut self.read_buf) {
                Ok(Some(frames)) => self.ready.push_back(frames),
                Ok(None) => break,
                Err(err) => {
                    self.mark_broken();
                    return Err(err);
                }
            }
        }
        // Some(_) means the stream is finished, cleanly or not
        if let Some(result) = outcome {
            debug!("peer closed the connection");
            self.mark_broken();
            result?;
        }
        Ok(())
    }
}

fn open_stream(peer: &SocketAddr, opt: &TcpOpt) -> Result<TcpStream> {
    let stream = TcpStream::connect_timeout(peer, opt.connect_timeout)?;
    stream.set_nodelay(opt.nodelay)?;
    if let Some(ttl) = opt.ttl {
        stream.set_ttl(ttl)?;
    }
    stream.set_nonblocking(true)?;
    Ok(stream)
}

pub struct TcpConnection {
    id: ItemId,
    opt: TcpOpt,
    state: Mutex<TcpState>,
}

impl TcpConnection {
    fn new(opt: TcpOpt) -> Self {
        TcpConnection {
            id: ItemId::next(),
            opt,
            state: Mutex::new(TcpState::default()),
        }
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ItemId {
        self.id
    }

    fn connect(&self, address: &str) -> Result<()> {
        let peer = parse_address(address)?;
        let stream = open_stream(&peer, &self.opt)?;

        let mut state = lock(&self.state);
        state.drop_stream();
        state.stream = Some(stream);
        state.broken = false;
        Ok(())
    }

    fn set_security(&self, _public_key: &str, _secret_key: &str, _peer_public_key: &str) -> Result<()> {
        warn!(item = %self.id, "plain tcp transport ignores security keys");
        Ok(())
    }

    fn readable(&self) -> bool {
        let mut state = lock(&self.state);
        if state.ready.is_empty() {
            if let Err(err) = state.fill() {
                warn!(item = %self.id, error = %err, "read failed, dropping stream");
            }
        }
        !state.ready.is_empty()
    }

    fn writable(&self) -> bool {
        lock(&self.state).stream.is_some()
    }

    fn is_broken(&self) -> bool {
        lock(&self.state).broken
    }

    fn send(&self, frames: Vec<Bytes>, timeout: Duration) -> Result<()> {
        let mut buf = BytesMut::new();
        frame::encode(&frames, &mut buf);

        let mut state = lock(&self.state);
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Closed, "not connected"))?;

        let result = (|| -> std::io::Result<()> {
            stream.set_nonblocking(false)?;
            stream.set_write_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            stream.write_all(&buf)?;
            stream.flush()?;
            stream.set_nonblocking(true)
        })();
        if let Err(err) = result {
            state.mark_broken();
            return Err(err.into());
        }
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Vec<Bytes>>> {
        let mut state = lock(&self.state);
        if state.ready.is_empty() {
            state.fill()?;
        }
        Ok(state.ready.pop_front())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.drop_stream();
        state.ready.clear();
    }
}
