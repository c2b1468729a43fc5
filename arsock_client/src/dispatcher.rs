//! Intra-process request queue and its drain state machine.
//!
//! Any thread may enqueue through [`RequestDispatcher::send_to_target`],
//! which only takes the push lock. The poll loop drains the queue in FIFO
//! order through [`RequestDispatcher::drain`]; an envelope that meets a
//! connection that is not writable, or still connecting, is parked in the
//! drain cursor and retried before anything else once it can make progress.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use arsock_protocol::{Reply, ReplyStatus};
use bytes::Bytes;
use tracing::debug;

use crate::{
    connection::{ConnectionManager, Lookup},
    lock,
    promise::{self, ReplyFuture, ReplyPromise},
    reactor::{ItemId, Reactor},
};

/// A request waiting in the queue.
#[derive(Debug)]
pub struct PendingRequest {
    pub target: usize,
    pub promise: Option<ReplyPromise>,
    pub frames: Vec<Bytes>,
}

impl PendingRequest {
    pub fn fail(self, status: ReplyStatus) {
        if let Some(promise) = self.promise {
            promise.fail(status);
        }
    }
}

pub struct RequestDispatcher {
    id: ItemId,
    /// The push lock. Never held together with a per-target lock.
    queue: Mutex<VecDeque<PendingRequest>>,
    /// Drain cursor: the envelope stalled behind an unwritable connection.
    stalled: Mutex<Option<PendingRequest>>,
    closed: AtomicBool,
    connections: Arc<ConnectionManager>,
    reactor: Arc<dyn Reactor>,
}

impl RequestDispatcher {
    pub fn new(connections: Arc<ConnectionManager>, reactor: Arc<dyn Reactor>) -> Self {
        RequestDispatcher {
            id: ItemId::next(),
            queue: Mutex::new(VecDeque::new()),
            stalled: Mutex::new(None),
            closed: AtomicBool::new(false),
            connections,
            reactor,
        }
    }

    /// The reactor handle of the queue.
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Enqueues a request and returns its future without waiting.
    ///
    /// Without `want_reply` the request is still sent, but no promise is
    /// registered and the returned future is already resolved.
    pub fn send_to_target(&self, target: usize, frames: Vec<Bytes>, want_reply: bool) -> ReplyFuture {
        if !want_reply {
            self.push(PendingRequest {
                target,
                promise: None,
                frames,
            });
            return ReplyFuture::ready(Reply::success(Vec::new()));
        }

        let (promise, future) = promise::pair();
        self.push(PendingRequest {
            target,
            promise: Some(promise),
            frames,
        });
        future
    }

    fn push(&self, request: PendingRequest) {
        {
            let mut queue = lock(&self.queue);
            if !self.closed.load(Ordering::Acquire) {
                queue.push_back(request);
                drop(queue);
                self.reactor.wake();
                return;
            }
        }
        request.fail(ReplyStatus::TornDown);
    }

    /// True when a drain would get somewhere: the parked envelope's
    /// connection has become usable, or nothing is parked and the queue is
    /// not empty.
    pub fn has_work(&self) -> bool {
        let parked = lock(&self.stalled).as_ref().map(|request| request.target);
        match parked {
            Some(target) => self.connections.can_progress(target),
            None => !lock(&self.queue).is_empty(),
        }
    }

    pub fn queued(&self) -> usize {
        let stalled = lock(&self.stalled).iter().count();
        stalled + lock(&self.queue).len()
    }

    /// Runs the drain state machine until the queue is empty or a connection
    /// is not writable.
    pub fn drain(&self) {
        let mut stalled = lock(&self.stalled);
        loop {
            let request = match stalled.take() {
                Some(request) => request,
                None => {
                    let next = lock(&self.queue).pop_front();
                    match next {
                        Some(request) => request,
                        None => return,
                    }
                }
            };

            match self.connections.get_connection(request.target) {
                Lookup::Closed => request.fail(ReplyStatus::TornDown),
                Lookup::Unavailable => {
                    debug!(target_id = request.target, "target unavailable, failing request");
                    request.fail(ReplyStatus::HostUnreachable);
                }
                Lookup::Connecting => {
                    debug!(target_id = request.target, "connect in progress, deferring");
                    *stalled = Some(request);
                    return;
                }
                Lookup::Available(conn) => {
                    if !conn.writable() {
                        debug!(target_id = request.target, "connection not writable, deferring");
                        *stalled = Some(request);
                        return;
                    }
                    self.connections.send_request(&conn, request);
                }
            }
        }
    }

    /// Refuses further requests and resolves everything still queued as
    /// torn down. Returns how many requests were failed.
    pub fn close(&self) -> usize {
        let mut stalled = lock(&self.stalled);
        let mut pending: Vec<PendingRequest> = {
            let mut queue = lock(&self.queue);
            self.closed.store(true, Ordering::Release);
            queue.drain(..).collect()
        };
        if let Some(request) = stalled.take() {
            pending.insert(0, request);
        }
        drop(stalled);

        let count = pending.len();
        for request in pending {
            request.fail(ReplyStatus::TornDown);
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
