//! Minor number registry
//!
//! Maps minor numbers to attached sessions. The registry's entry is the
//! session's "attached" reference: it is taken on attach and handed to
//! [`DeviceSession::disconnect`] on detach.

use crate::device::DeviceSession;
use crate::error::{Result, SessionError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SessionRegistry {
    base: u32,
    capacity: u32,
    sessions: Mutex<BTreeMap<u32, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<DeviceSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Publish a session under the lowest free minor
    pub fn register(&self, session: Arc<DeviceSession>) -> Result<u32> {
        let mut sessions = self.sessions();
        // An unvalidated range is clipped at u32::MAX
        let end = self.base.saturating_add(self.capacity);
        let minor = (self.base..end)
            .find(|minor| !sessions.contains_key(minor))
            .ok_or_else(|| {
                warn!("All {} minors starting at {} in use", self.capacity, self.base);
                SessionError::ResourceExhausted
            })?;

        session.assign_minor(minor);
        sessions.insert(minor, session);
        debug!("Registered minor {}", minor);
        Ok(minor)
    }

    /// Find a session and take a reference to it
    ///
    /// Lookup and acquisition happen under the registry lock, so a concurrent
    /// detach either runs entirely before (NotFound) or after (the caller
    /// holds a live reference).
    pub fn lookup_and_acquire(&self, minor: u32) -> Result<Arc<DeviceSession>> {
        self.sessions()
            .get(&minor)
            .cloned()
            .ok_or(SessionError::NotFound(minor))
    }

    /// Remove a session, returning the registry's reference
    pub fn unregister(&self, minor: u32) -> Option<Arc<DeviceSession>> {
        let session = self.sessions().remove(&minor);
        if session.is_some() {
            debug!("Unregistered minor {}", minor);
        }
        session
    }

    pub fn minors(&self) -> Vec<u32> {
        self.sessions().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Remove every session; used on shutdown
    pub(crate) fn drain(&self) -> Vec<Arc<DeviceSession>> {
        std::mem::take(&mut *self.sessions()).into_values().collect()
    }
}
