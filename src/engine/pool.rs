//! Session leasing
//!
//! [`SessionPool`] hands out engine sessions through [`SessionLease`], an RAII
//! guard that gives the session back when dropped. On release a live session
//! is reset and kept if the idle list has room, otherwise it is closed.
//! Concurrent leases are optionally bounded; acquisition blocks until a slot
//! frees.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::{EngineConnector, EngineError, EngineSession};
use crate::types::Value;

/// Pool sizing, `0` meaning "none kept" for idle and "unbounded" for active
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_idle: usize,
    pub max_active: usize,
}

struct PoolInner {
    idle: Vec<Box<dyn EngineSession>>,
    active: usize,
    limits: PoolLimits,
}

/// Leases engine sessions, reusing idle ones when configured to
pub struct SessionPool {
    connector: Arc<dyn EngineConnector>,
    inner: Mutex<PoolInner>,
    slot_freed: Condvar,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn EngineConnector>, limits: PoolLimits) -> Self {
        Self {
            connector,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                active: 0,
                limits,
            }),
            slot_freed: Condvar::new(),
        }
    }

    pub fn connector(&self) -> &Arc<dyn EngineConnector> {
        &self.connector
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limits(&self) -> PoolLimits {
        self.lock().limits
    }

    /// Replace the limits; surplus idle sessions are closed
    pub fn set_limits(&self, limits: PoolLimits) {
        let surplus = {
            let mut inner = self.lock();
            inner.limits = limits;
            let keep = inner.idle.len().min(limits.max_idle);
            inner.idle.split_off(keep)
        };
        // Raising max_active may unblock waiters
        self.slot_freed.notify_all();
        close_all(surplus);
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Open a connection and close it again straight away.
    pub fn check_reachable(&self) -> Result<(), EngineError> {
        let session = self.connector.open()?;
        if let Err(e) = session.close() {
            warn!("Reachability session did not close cleanly: {}", e);
        }
        Ok(())
    }

    /// Lease a session, blocking while the active limit is reached.
    pub fn acquire(&self) -> Result<SessionLease<'_>, EngineError> {
        let reused = {
            let mut inner = self.lock();
            while inner.limits.max_active > 0 && inner.active >= inner.limits.max_active {
                debug!(
                    "All {} engine sessions leased, waiting for one to free",
                    inner.active
                );
                inner = self
                    .slot_freed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            inner.active += 1;

            let mut reused = None;
            let mut dead = Vec::new();
            while let Some(session) = inner.idle.pop() {
                if session.is_alive() {
                    reused = Some(session);
                    break;
                }
                dead.push(session);
            }
            drop(inner);
            close_all(dead);
            reused
        };

        let session = match reused {
            Some(session) => {
                debug!("Reusing pooled {} session", self.connector.name());
                session
            }
            None => match self.connector.open() {
                Ok(session) => session,
                Err(e) => {
                    self.free_slot();
                    return Err(e);
                }
            },
        };

        Ok(SessionLease {
            pool: self,
            session,
            discard: false,
        })
    }

    /// Close every idle session, returning how many were closed
    pub fn drain(&self) -> usize {
        let idle = std::mem::take(&mut self.lock().idle);
        let count = idle.len();
        close_all(idle);
        if count > 0 {
            debug!("Drained {} idle engine session(s)", count);
        }
        count
    }

    fn free_slot(&self) {
        let mut inner = self.lock();
        inner.active = inner.active.saturating_sub(1);
        drop(inner);
        self.slot_freed.notify_one();
    }

    fn release(&self, mut session: Box<dyn EngineSession>, reusable: bool) {
        let has_room = reusable && session.is_alive() && {
            let inner = self.lock();
            inner.idle.len() < inner.limits.max_idle
        };

        // Reset outside the lock: it is an engine round trip
        let keep = has_room
            && match session.reset() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not reset engine session for reuse: {}", e);
                    false
                }
            };

        let mut inner = self.lock();
        inner.active = inner.active.saturating_sub(1);
        let rejected = if keep && inner.idle.len() < inner.limits.max_idle {
            inner.idle.push(session);
            None
        } else {
            Some(session)
        };
        drop(inner);
        self.slot_freed.notify_one();

        if let Some(session) = rejected {
            close_one(session);
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.drain();
    }
}

fn close_one(session: Box<dyn EngineSession>) {
    if let Err(e) = session.close() {
        warn!("Engine session did not close cleanly: {}", e);
    }
}

fn close_all(sessions: Vec<Box<dyn EngineSession>>) {
    for session in sessions {
        close_one(session);
    }
}

/// Exclusive use of one session until dropped
pub struct SessionLease<'a> {
    pool: &'a SessionPool,
    session: Box<dyn EngineSession>,
    discard: bool,
}

impl SessionLease<'_> {
    /// Close the session on release instead of pooling it
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl Deref for SessionLease<'_> {
    type Target = dyn EngineSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let session = std::mem::replace(&mut self.session, Box::new(Released));
        self.pool.release(session, !self.discard);
    }
}

/// Placeholder left inside a lease while it is being dropped
struct Released;

impl EngineSession for Released {
    fn set_option(&mut self, _: &str, _: &Value) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn evaluate(&mut self, _: &str) -> Result<Value, EngineError> {
        Err(EngineError::Closed)
    }
    fn load_file(&mut self, _: &Path) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn assign(&mut self, _: &str, _: &Value) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn read_value(&mut self, _: &str) -> Result<Option<Value>, EngineError> {
        Err(EngineError::Closed)
    }
    fn execute(&mut self, _: &Path) -> Result<bool, EngineError> {
        Err(EngineError::Closed)
    }
    fn working_dir(&mut self) -> Result<PathBuf, EngineError> {
        Err(EngineError::Closed)
    }
    fn change_dir(&mut self, _: &Path) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn save_image(&mut self, _: &Path) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn reset(&mut self) -> Result<(), EngineError> {
        Err(EngineError::Closed)
    }
    fn is_alive(&self) -> bool {
        false
    }
    fn close(self: Box<Self>) -> Result<(), EngineError> {
        Ok(())
    }
}
