use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::crawler::task::{AbortFlag, WebsiteId};

/// Tasks currently admitted, keyed by site
///
/// At most one task per site is registered at a time. The active counter
/// tracks admitted tasks that have not reached a terminal state yet.
#[derive(Debug, Default)]
pub struct Registry {
    tasks: Mutex<HashMap<WebsiteId, AbortFlag>>,
    active: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<WebsiteId, AbortFlag>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a fresh abort flag for a site not registered yet
    fn insert(&self, website_id: WebsiteId) -> Option<AbortFlag> {
        let mut tasks = self.tasks();
        if tasks.contains_key(&website_id) {
            return None;
        }
        let abort = AbortFlag::new();
        tasks.insert(website_id, abort.clone());
        Some(abort)
    }

    /// Register a site, returning whether it was not registered yet
    pub fn register(&self, website_id: WebsiteId) -> bool {
        self.insert(website_id).is_some()
    }

    pub fn unregister(&self, website_id: WebsiteId) {
        self.tasks().remove(&website_id);
    }

    pub fn is_registered(&self, website_id: WebsiteId) -> bool {
        self.tasks().contains_key(&website_id)
    }

    /// Register a site and take an active slot for it
    ///
    /// Both are given back when the returned guard is dropped.
    pub fn admit(self: &Arc<Self>, website_id: WebsiteId) -> Option<Admission> {
        let abort = self.insert(website_id)?;
        self.active.fetch_add(1, Ordering::SeqCst);

        Some(Admission {
            registry: self.clone(),
            website_id,
            abort,
            holds_slot: true,
        })
    }

    /// Number of admitted tasks not yet finished or paused
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Request a pause of one running task
    pub fn abort(&self, website_id: WebsiteId) -> bool {
        match self.tasks().get(&website_id) {
            Some(flag) => {
                flag.set();
                true
            }
            None => false,
        }
    }

    /// Request a pause of every running task, returning how many were asked
    pub fn abort_all(&self) -> usize {
        let tasks = self.tasks();
        for flag in tasks.values() {
            flag.set();
        }
        tasks.len()
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof that a task was admitted
///
/// Dropping it releases the active slot (unless already released) and
/// unregisters the site, on every exit path including panics.
#[derive(Debug)]
pub struct Admission {
    registry: Arc<Registry>,
    website_id: WebsiteId,
    abort: AbortFlag,
    holds_slot: bool,
}

impl Admission {
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Give back the active slot while keeping the site registered
    pub fn release_slot(&mut self) {
        if std::mem::take(&mut self.holds_slot) {
            self.registry.release_slot();
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release_slot();
        self.registry.unregister(self.website_id);
        debug!(website_id = self.website_id, "Task unregistered");
    }
}
