//! User / identity cache (C2).
//!
//! Caches remote-id -> (screen_name, display_name), shared process-wide
//! across sessions (see the ownership note in the data model: the
//! identity-cache table is process-global, behind the persistence
//! adapter). Every update fires a change event carrying the *prior* row
//! state before the row is actually mutated, so subscribers (the virtual
//! channel model, renaming nicknames) can diff old vs new.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

use crate::callbacks::CallbackList;
use crate::error::Result;

pub type RemoteId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityInfo {
    pub screen_name: String,
    pub display_name: String,
}

/// `(remote_id, old_info_or_nil, new_info)`, fired before the underlying
/// row is overwritten.
#[derive(Debug, Clone)]
pub struct IdentityChange {
    pub remote_id: RemoteId,
    pub old: Option<IdentityInfo>,
    pub new: IdentityInfo,
}

/// The narrow persistence interface the cache needs; implemented by the
/// real sqlite-backed adapter (C11) and trivially mockable in tests.
#[async_trait]
pub trait IdentityPersistence: Send + Sync {
    async fn upsert_identity(&self, remote_id: RemoteId, info: &IdentityInfo) -> Result<()>;
}

/// Narrow interface onto the cache used by callers (the virtual channel
/// model) that only ever need to record an update, never to query it —
/// avoids threading the `P: IdentityPersistence` type parameter through
/// every module that touches identity.
#[async_trait]
pub trait IdentityUpdater: Send + Sync {
    async fn update(&self, remote_id: RemoteId, screen_name: &str, display_name: &str) -> Result<()>;
}

pub struct IdentityCache<P: IdentityPersistence> {
    by_id: DashMap<RemoteId, IdentityInfo>,
    /// lowercased screen_name -> sole remote id, when unambiguous.
    by_name: DashMap<String, RemoteId>,
    /// lowercased screen_names known to collide across >1 remote id.
    collided: DashSet<String>,
    changes: parking_lot::Mutex<CallbackList<IdentityChange>>,
    store: Arc<P>,
}

impl<P: IdentityPersistence> IdentityCache<P> {
    pub fn new(store: Arc<P>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            collided: DashSet::new(),
            changes: parking_lot::Mutex::new(CallbackList::new()),
            store,
        }
    }

    pub fn on_change(&self, cb: impl crate::callbacks::Callback<IdentityChange> + 'static) {
        self.changes.lock().add_callback(cb);
    }

    fn reindex_name(&self, key: String, remote_id: RemoteId) {
        match self.by_name.get(&key).map(|v| *v) {
            None => {
                self.by_name.insert(key, remote_id);
            }
            Some(existing) if existing == remote_id => {}
            Some(_other) => {
                // two distinct remote ids now share this screen name: stop
                // resolving it rather than guess which one is current.
                self.collided.insert(key.clone());
                self.by_name.remove(&key);
            }
        }
    }

    fn unindex_name(&self, key: &str, remote_id: RemoteId) {
        if self.by_name.get(key).map(|v| *v) == Some(remote_id) {
            self.by_name.remove(key);
        }
    }

    /// Record an update to a remote identity, firing the change event
    /// before the in-memory row or the persisted row is touched.
    pub async fn update(
        &self,
        remote_id: RemoteId,
        screen_name: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<()> {
        let new = IdentityInfo {
            screen_name: screen_name.into(),
            display_name: display_name.into(),
        };
        let old = self.by_id.get(&remote_id).map(|r| r.clone());

        let event = IdentityChange {
            remote_id,
            old: old.clone(),
            new: new.clone(),
        };
        self.changes.lock().dispatch(&event).await?;

        if let Some(old) = &old {
            let old_key = old.screen_name.to_ascii_lowercase();
            let new_key = new.screen_name.to_ascii_lowercase();
            if old_key != new_key {
                self.unindex_name(&old_key, remote_id);
            }
        }
        self.reindex_name(new.screen_name.to_ascii_lowercase(), remote_id);
        self.by_id.insert(remote_id, new.clone());

        self.store.upsert_identity(remote_id, &new).await
    }

    pub fn lookup_by_id(&self, remote_id: RemoteId) -> Option<IdentityInfo> {
        self.by_id.get(&remote_id).map(|r| r.clone())
    }

    /// Case-insensitive; returns `None` when the name is ambiguous across
    /// more than one remote id (screen-name reuse collision).
    pub fn lookup_by_screen_name(&self, screen_name: &str) -> Option<(RemoteId, IdentityInfo)> {
        let key = screen_name.to_ascii_lowercase();
        if self.collided.contains(&key) {
            return None;
        }
        let id = *self.by_name.get(&key)?;
        self.by_id.get(&id).map(|info| (id, info.clone()))
    }
}

#[async_trait]
impl<P: IdentityPersistence + 'static> IdentityUpdater for IdentityCache<P> {
    async fn update(&self, remote_id: RemoteId, screen_name: &str, display_name: &str) -> Result<()> {
        IdentityCache::update(self, remote_id, screen_name, display_name).await
    }
}

/// Narrow read-only interface onto the cache, used by WHOIS/WHO/USERHOST
/// lookups that never need to record an update themselves.
pub trait IdentityLookup: Send + Sync {
    fn lookup_by_screen_name(&self, screen_name: &str) -> Option<(RemoteId, IdentityInfo)>;
}

impl<P: IdentityPersistence> IdentityLookup for IdentityCache<P> {
    fn lookup_by_screen_name(&self, screen_name: &str) -> Option<(RemoteId, IdentityInfo)> {
        IdentityCache::lookup_by_screen_name(self, screen_name)
    }
}
