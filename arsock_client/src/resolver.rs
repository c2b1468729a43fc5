//! Address resolution.
//!
//! [`AddressResolver`] is the naming/config service the socket watches.
//! [`subscribe`] adapts its change notifications onto the target registry:
//! every notification only records the new address and marks the target
//! dirty. Reconnection happens lazily in the connection manager.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
};

use strum_macros::Display;
use tracing::debug;

use crate::registry::TargetRegistry;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq)]
pub enum ChangeKind {
    #[strum(serialize = "added")]
    Added,
    #[strum(serialize = "removed")]
    Removed,
    #[strum(serialize = "modified")]
    Modified,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressChange {
    pub kind: ChangeKind,
    pub keys: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WatchId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub type ChangeListener = Arc<dyn Fn(&AddressChange) + Send + Sync>;

pub trait AddressResolver: Send + Sync {
    /// Starts delivering changes to any of `keys`. Listeners may be called
    /// from any thread.
    fn watch(&self, keys: &[String], listener: ChangeListener) -> WatchId;

    fn unwatch(&self, id: WatchId);

    fn get(&self, key: &str) -> Option<String>;
}

/// Applies one notification to the registry.
pub fn apply_change(registry: &TargetRegistry, resolver: &dyn AddressResolver, change: &AddressChange) {
    for key in &change.keys {
        let address = match change.kind {
            ChangeKind::Removed => None,
            ChangeKind::Added | ChangeKind::Modified => resolver.get(key),
        };
        for id in registry.ids_for_key(key) {
            if let Some(target) = registry.get(id) {
                debug!(target_id = id, key = %key, kind = %change.kind, "address change");
                target.set_address(address.clone());
            }
        }
    }
}

/// Watches every registry key. The listener holds weak references only, so
/// the resolver never keeps a dropped socket alive.
pub fn subscribe(resolver: &Arc<dyn AddressResolver>, registry: &Arc<TargetRegistry>) -> WatchId {
    let weak_registry: Weak<TargetRegistry> = Arc::downgrade(registry);
    let weak_resolver: Weak<dyn AddressResolver> = Arc::downgrade(resolver);
    let listener: ChangeListener = Arc::new(move |change: &AddressChange| {
        if let (Some(registry), Some(resolver)) = (weak_registry.upgrade(), weak_resolver.upgrade()) {
            apply_change(&registry, &*resolver, change);
        }
    });
    resolver.watch(&registry.keys(), listener)
}

struct Watcher {
    keys: HashSet<String>,
    listener: ChangeListener,
}

/// In-memory naming service. Setting or removing a key notifies every
/// watcher of that key.
#[derive(Default)]
pub struct StaticResolver {
    addresses: RwLock<HashMap<String, String>>,
    watchers: RwLock<HashMap<WatchId, Watcher>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_addresses<I, K, V>(addresses: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let resolver = Self::new();
        {
            let mut map = write(&resolver.addresses);
            for (k, v) in addresses {
                map.insert(k.into(), v.into());
            }
        }
        resolver
    }

    pub fn set(&self, key: &str, address: &str) {
        let previous = write(&self.addresses).insert(key.to_owned(), address.to_owned());
        let kind = match previous {
            None => ChangeKind::Added,
            Some(ref old) if old == address => return,
            Some(_) => ChangeKind::Modified,
        };
        self.notify(kind, key);
    }

    pub fn remove(&self, key: &str) {
        if write(&self.addresses).remove(key).is_some() {
            self.notify(ChangeKind::Removed, key);
        }
    }

    pub fn watcher_count(&self) -> usize {
        read(&self.watchers).len()
    }

    fn notify(&self, kind: ChangeKind, key: &str) {
        let listeners: Vec<ChangeListener> = read(&self.watchers)
            .values()
            .filter(|w| w.keys.contains(key))
            .map(|w| w.listener.clone())
            .collect();
        let change = AddressChange {
            kind,
            keys: vec![key.to_owned()],
        };
        for listener in listeners {
            listener(&change);
        }
    }
}

impl AddressResolver for StaticResolver {
    fn watch(&self, keys: &[String], listener: ChangeListener) -> WatchId {
        let id = WatchId::next();
        write(&self.watchers).insert(
            id,
            Watcher {
                keys: keys.iter().cloned().collect(),
                listener,
            },
        );
        id
    }

    fn unwatch(&self, id: WatchId) {
        write(&self.watchers).remove(&id);
    }

    fn get(&self, key: &str) -> Option<String> {
        read(&self.addresses).get(key).cloned()
    }
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
