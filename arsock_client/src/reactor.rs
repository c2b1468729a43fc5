//! The poll loop that drives queue draining, inbound replies and keep-alive.
//!
//! [`Reactor`] is the contract the socket consumes. [`PollLoop`] is a small
//! cooperative implementation: each [`PollLoop::run_once`] call checks every
//! registered item for readiness, invokes the callbacks of ready items, then
//! fires due timers. Callbacks always run with the loop's own lock released,
//! so they may add or remove items.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle, Thread},
    time::{Duration, Instant},
};

use arsock_protocol::Result;
use tracing::{debug, warn};

use crate::lock;

/// Process-unique handle for anything registered with a reactor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ItemId(u64);

impl ItemId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ItemId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

/// Non-blocking check: true when the item has input to process.
pub type Readiness = Arc<dyn Fn() -> bool + Send + Sync>;
pub type Callback = Arc<dyn Fn() + Send + Sync>;

pub trait Reactor: Send + Sync {
    fn add_item(&self, id: ItemId, readiness: Readiness, callback: Callback);
    fn remove_item(&self, id: ItemId);
    fn add_timer(&self, owner: ItemId, period: Duration, callback: Callback);
    fn remove_timer(&self, owner: ItemId);

    /// Hint that some item may have become ready.
    fn wake(&self) {}
}

struct Item {
    readiness: Readiness,
    callback: Callback,
}

struct Timer {
    period: Duration,
    next_due: Instant,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    items: HashMap<ItemId, Item>,
    timers: HashMap<ItemId, Timer>,
}

#[derive(Default)]
pub struct PollLoop {
    registry: Mutex<Registry>,
    parked: Mutex<Option<Thread>>,
}

impl PollLoop {
    pub fn new() -> Self {
        Default::default()
    }

    /// Runs one poll cycle and returns how many callbacks were invoked.
    pub fn run_once(&self) -> usize {
        let now = Instant::now();
        let (items, timers) = {
            let mut registry = lock(&self.registry);
            let items: Vec<(ItemId, Readiness, Callback)> = registry
                .items
                .iter()
                .map(|(id, item)| (*id, item.readiness.clone(), item.callback.clone()))
                .collect();
            let mut timers = Vec::new();
            for timer in registry.timers.values_mut() {
                if now >= timer.next_due {
                    timer.next_due = now + timer.period;
                    timers.push(timer.callback.clone());
                }
            }
            (items, timers)
        };

        let mut invoked = 0;
        for (id, readiness, callback) in items {
            // an earlier callback in this cycle may have removed it
            if !self.is_registered(id) {
                continue;
            }
            if readiness() {
                callback();
                invoked += 1;
            }
        }
        for callback in timers {
            callback();
            invoked += 1;
        }
        invoked
    }

    pub fn is_registered(&self, id: ItemId) -> bool {
        lock(&self.registry).items.contains_key(&id)
    }

    pub fn item_count(&self) -> usize {
        lock(&self.registry).items.len()
    }

    pub fn timer_count(&self) -> usize {
        lock(&self.registry).timers.len()
    }

    /// Drives the loop on a dedicated thread until the handle is stopped.
    /// When a cycle finds nothing to do the thread parks for at most `idle`.
    pub fn spawn(self: &Arc<Self>, idle: Duration) -> Result<PollLoopHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let this = self.clone();
        let stop_flag = stop.clone();
        let join = thread::Builder::new()
            .name("arsock-poll".to_owned())
            .spawn(move || {
                *lock(&this.parked) = Some(thread::current());
                debug!("poll loop started");
                while !stop_flag.load(Ordering::Acquire) {
                    if this.run_once() == 0 {
                        thread::park_timeout(idle);
                    }
                }
                *lock(&this.parked) = None;
                debug!("poll loop stopped");
            })?;

        Ok(PollLoopHandle {
            stop,
            join: Some(join),
        })
    }
}

impl Reactor for PollLoop {
    fn add_item(&self, id: ItemId, readiness: Readiness, callback: Callback) {
        let previous = lock(&self.registry)
            .items
            .insert(id, Item { readiness, callback });
        if previous.is_some() {
            warn!(item = %id, "reactor item registered twice, replacing");
        }
        self.wake();
    }

    fn remove_item(&self, id: ItemId) {
        lock(&self.registry).items.remove(&id);
    }

    fn add_timer(&self, owner: ItemId, period: Duration, callback: Callback) {
        lock(&self.registry).timers.insert(
            owner,
            Timer {
                period,
                next_due: Instant::now() + period,
                callback,
            },
        );
    }

    fn remove_timer(&self, owner: ItemId) {
        lock(&self.registry).timers.remove(&owner);
    }

    fn wake(&self) {
        if let Some(thread) = lock(&self.parked).as_ref() {
            thread.unpark();
        }
    }
}

/// Stops the spawned poll thread when dropped.
pub struct PollLoopHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PollLoopHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            join.thread().unpark();
            if join.join().is_err() {
                warn!("poll loop thread panicked");
            }
        }
    }
}

impl Drop for PollLoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
