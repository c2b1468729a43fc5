//! Fixed set of per-endpoint state.
//!
//! Each [`TargetState`] owns one mutex guarding its address, connection and
//! pending-promise table. Targets are created once and never added or
//! removed; index 0 is the primary.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use arsock_protocol::{ReplyStatus, NO_ROUTE};
use tracing::debug;

use crate::{lock, promise::ReplyPromise, reactor::ItemId, transport::OwnedConnection};

/// Pending promises of one target, keyed by routing id.
#[derive(Debug)]
pub(crate) struct PromiseTable {
    next_id: u64,
    pending: HashMap<u64, ReplyPromise>,
}

impl PromiseTable {
    fn new() -> Self {
        PromiseTable {
            next_id: NO_ROUTE.wrapping_add(1),
            pending: HashMap::new(),
        }
    }

    /// Stores the promise under a fresh id that is never [`NO_ROUTE`] and
    /// never collides with a pending id.
    pub(crate) fn register(&mut self, promise: ReplyPromise) -> u64 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != NO_ROUTE && !self.pending.contains_key(&id) {
                self.pending.insert(id, promise);
                return id;
            }
        }
    }

    pub(crate) fn take(&mut self, id: u64) -> Option<ReplyPromise> {
        self.pending.remove(&id)
    }

    /// Resolves every pending promise with `status` and returns how many.
    pub(crate) fn fail_all(&mut self, status: ReplyStatus) -> usize {
        let count = self.pending.len();
        for (_, promise) in self.pending.drain() {
            promise.fail(status);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) struct TargetInner {
    pub(crate) resolved_address: String,
    pub(crate) connection: Option<OwnedConnection>,
    pub(crate) address_dirty: bool,
    pub(crate) promises: PromiseTable,
    /// Set while a connect runs outside the lock.
    pub(crate) connecting: bool,
    /// Bumped on every address change.
    pub(crate) epoch: u64,
    /// Set once by teardown. A closed target accepts no new promises.
    pub(crate) closed: bool,
}

impl TargetInner {
    /// Releases the connection and fails every promise pending on it as
    /// torn down. Returns how many were failed.
    pub(crate) fn invalidate(&mut self) -> usize {
        let failed = self.promises.fail_all(ReplyStatus::TornDown);
        self.connection = None;
        failed
    }
}

pub struct TargetState {
    key: String,
    inner: Mutex<TargetInner>,
}

impl TargetState {
    fn new(key: String, address: Option<String>) -> Self {
        TargetState {
            key,
            inner: Mutex::new(TargetInner {
                resolved_address: address.unwrap_or_default(),
                connection: None,
                address_dirty: false,
                promises: PromiseTable::new(),
                connecting: false,
                epoch: 0,
                closed: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TargetInner> {
        lock(&self.inner)
    }

    /// Records an address change and marks the target for a lazy rebuild.
    /// `None` means the endpoint disappeared.
    pub fn set_address(&self, address: Option<String>) {
        let mut inner = self.lock();
        inner.resolved_address = address.unwrap_or_default();
        inner.address_dirty = true;
        inner.epoch = inner.epoch.wrapping_add(1);
        debug!(key = %self.key, address = %inner.resolved_address, "target address updated");
    }

    /// Stores an address read before any change notification could apply.
    /// Ignored if the address changed since `epoch` was taken.
    pub fn seed_address(&self, address: Option<String>, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.resolved_address = address.unwrap_or_default();
        true
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn resolved_address(&self) -> String {
        self.lock().resolved_address.clone()
    }

    /// A target is plausible while it has a resolved address.
    pub fn is_reachable(&self) -> bool {
        let inner = self.lock();
        !inner.closed && !inner.resolved_address.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().promises.len()
    }

    /// Registers a promise for an outbound request. On a closed target the
    /// promise is resolved as torn down right away and `None` is returned.
    pub(crate) fn register_promise(&self, promise: ReplyPromise) -> Option<u64> {
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            promise.fail(ReplyStatus::TornDown);
            return None;
        }
        Some(inner.promises.register(promise))
    }

    pub(crate) fn take_promise(&self, id: u64) -> Option<ReplyPromise> {
        self.lock().promises.take(id)
    }

    /// Drops the connection registered as `id` if its link is broken.
    /// Returns the number of promises failed, or `None` when `id` is not the
    /// current connection or is still healthy.
    pub(crate) fn drop_broken(&self, id: ItemId) -> Option<usize> {
        let mut inner = self.lock();
        let broken = inner
            .connection
            .as_ref()
            .map_or(false, |conn| conn.id() == id && conn.is_broken());
        if !broken {
            return None;
        }
        Some(inner.invalidate())
    }

    /// Closes the target: releases its connection and resolves every
    /// pending promise as torn down. Returns the number of promises failed.
    pub(crate) fn shut_down(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        inner.invalidate()
    }
}

pub struct TargetRegistry {
    targets: Vec<TargetState>,
}

impl TargetRegistry {
    /// Builds one target per key, seeding each address with `initial`.
    pub fn new<F>(keys: Vec<String>, initial: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets = keys
            .into_iter()
            .map(|key| {
                let address = initial(&key).filter(|a| !a.is_empty());
                TargetState::new(key, address)
            })
            .collect();
        TargetRegistry { targets }
    }

    pub fn get(&self, id: usize) -> Option<&TargetState> {
        self.targets.get(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetState> {
        self.targets.iter()
    }

    pub fn ids_for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.targets
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.key == key)
            .map(|(id, _)| id)
    }

    pub fn keys(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.key.clone()).collect()
    }
}
