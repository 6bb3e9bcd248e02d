#![forbid(unsafe_code)]

//! Keyed, lazily started sessions.
//!
//! A test harness typically wants one session per test assembly (or crate,
//! or suite) shared by every test in it. [`SessionRegistry`] starts a
//! session the first time a key is seen and hands the same instance to
//! every later caller. Concurrent first access starts exactly one session:
//! the map lock is held only long enough to find the key's slot, and the
//! slot lock serializes start for that key without blocking other keys.

use crate::error::StartError;
use crate::session::Session;
use crate::sync::lock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type Slot = Arc<Mutex<Option<Arc<Session>>>>;

/// Map from key to a shared, lazily started [`Session`].
pub struct SessionRegistry<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K> Default for SessionRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> SessionRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `key`, starting it with `start` if absent.
    ///
    /// `start` runs at most once per key while a live session is registered.
    /// If it fails nothing is stored and the next caller tries again.
    pub fn get_or_start<F>(&self, key: &K, start: F) -> Result<Arc<Session>, StartError>
    where
        F: FnOnce() -> Result<Session, StartError>,
    {
        let slot = {
            let mut slots = lock(&self.slots);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let mut entry = lock(&slot);
        if let Some(session) = entry.as_ref()
            && !session.is_disposed()
        {
            return Ok(Arc::clone(session));
        }

        debug!(key = ?key, "starting session for key");
        let session = Arc::new(start()?);
        *entry = Some(Arc::clone(&session));
        info!(key = ?key, "session registered");
        Ok(session)
    }

    /// [`get_or_start`](Self::get_or_start) with [`Session::start_default`].
    pub fn get_or_start_default(&self, key: &K) -> Result<Arc<Session>, StartError> {
        self.get_or_start(key, Session::start_default)
    }

    /// The live session for `key`, if one has been started.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<Session>> {
        let slot = lock(&self.slots).get(key).map(Arc::clone)?;
        let entry = lock(&slot);
        entry
            .as_ref()
            .filter(|session| !session.is_disposed())
            .map(Arc::clone)
    }

    /// Unregister `key` and return its session without disposing it.
    pub fn remove(&self, key: &K) -> Option<Arc<Session>> {
        let slot = lock(&self.slots).remove(key)?;
        let session = lock(&slot).take();
        session
    }

    /// Number of keys with a registered session.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).values().map(Arc::clone).collect();
        slots.iter().filter(|slot| lock(slot).is_some()).count()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister and dispose every session. Returns how many were disposed.
    pub fn dispose_all(&self) -> usize {
        let slots: Vec<(K, Slot)> = lock(&self.slots).drain().collect();
        let mut disposed = 0;
        for (key, slot) in slots {
            if let Some(session) = lock(&slot).take() {
                debug!(key = ?key, "disposing registered session");
                session.dispose();
                disposed += 1;
            }
        }
        disposed
    }
}

impl<K: fmt::Debug> fmt::Debug for SessionRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = lock(&self.slots);
        f.debug_struct("SessionRegistry")
            .field("keys", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
