//! One TFTP listener per local address, created on first use.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{Listener, ListenerSettings};
use crate::store::BufferStore;

struct Entry {
    generation: u64,
    shutdown: CancellationToken,
}

type Entries = Arc<Mutex<HashMap<IpAddr, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<IpAddr, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of running listeners keyed by local IP.
///
/// Holds at most one live entry per address. A listener that stops on its
/// own (bind failure, socket error, shutdown) removes its entry, so a later
/// [`ensure_listener`](Self::ensure_listener) starts a new one.
pub struct ListenerRegistry {
    entries: Entries,
    store: BufferStore,
    settings: ListenerSettings,
    generation: AtomicU64,
    created: AtomicUsize,
}

impl ListenerRegistry {
    /// Listeners created by this registry write completed files into `store`.
    pub fn new(store: BufferStore, settings: ListenerSettings) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            store,
            settings,
            generation: AtomicU64::new(0),
            created: AtomicUsize::new(0),
        }
    }

    /// Makes sure a listener is running on `ip`. Returns `true` when this
    /// call started it.
    ///
    /// The bind happens in the background; failures are logged and remove
    /// the entry again. Must be called from within a tokio runtime.
    pub fn ensure_listener(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        let mut entries = lock(&self.entries);
        if entries.contains_key(&ip) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        entries.insert(
            ip,
            Entry {
                generation,
                shutdown: shutdown.clone(),
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(address = %ip, "Registering TFTP listener");

        let addr = SocketAddr::new(ip, self.settings.port);
        let store = self.store.clone();
        let settings = self.settings.clone();
        let registry = self.entries.clone();
        tokio::spawn(async move {
            let result = match Listener::bind(addr, store, settings, shutdown).await {
                Ok(listener) => listener.run().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(address = %addr, error = %e, "TFTP listener failed");
            }

            let mut entries = lock(&registry);
            if entries.get(&ip).is_some_and(|e| e.generation == generation) {
                entries.remove(&ip);
                debug!(address = %ip, "Removed TFTP listener entry");
            }
        });
        true
    }

    /// Asks every registered listener to stop and returns how many were
    /// signalled.
    ///
    /// Does not wait for in-flight transfers and does not remove entries;
    /// each listener removes its own entry as it exits. Safe to call twice.
    pub fn stop_all(&self) -> usize {
        let entries = lock(&self.entries);
        for (ip, entry) in entries.iter() {
            debug!(address = %ip, "Stopping TFTP listener");
            entry.shutdown.cancel();
        }
        entries.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        lock(&self.entries).contains_key(&canonical(ip))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners started over the registry's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}
