//! Feed (C4): one per (account, feed-kind[, parameters]).
//!
//! Incrementally pulls a timeline against the remote API using a
//! persisted watermark, dispatching entries to subscribers in
//! chronological (ascending id) order and advancing the watermark only
//! after dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::{Entry, RemoteApi, TimelineParams};
use crate::callbacks::CallbackList;
use crate::error::{GatewayError, RemoteApiErrorKind, Result};
use crate::scheduler::FeedHandle;
use crate::throttle::{ErrorThrottler, ThrottleNotice};

/// The narrow interface a feed needs back into its owning session's
/// persisted variables — not a full session reference, per the design
/// note on breaking cyclic references between session, channels, and
/// feeds.
#[async_trait]
pub trait VarStore: Send + Sync {
    async fn get_var(&self, name: &str) -> Result<Option<String>>;
    async fn set_var(&self, name: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Home,
    Mentions,
    DirectMessages,
    UserTimeline(String),
    ListTimeline(String, String),
}

/// Convert a remote-reported unix-seconds reset time into a monotonic
/// [`Instant`] the scheduler's clock can compare against.
fn reset_instant(reset_unix: i64) -> Instant {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let delta = (reset_unix - now_unix).max(0) as u64;
    Instant::now() + Duration::from_secs(delta)
}

impl FeedKind {
    /// Watermark keys, per `spec.md` §6.
    pub fn watermark_key(&self) -> String {
        match self {
            FeedKind::Home => "home_last_status_id".to_string(),
            FeedKind::Mentions => "mentions_last_status_id".to_string(),
            FeedKind::DirectMessages => "direct_messages_last_id".to_string(),
            FeedKind::UserTimeline(user) => format!("last_status_id_@{user}"),
            FeedKind::ListTimeline(owner, name) => format!("last_status_id_@{owner}/{name}"),
        }
    }
}

/// One pull against the remote API, with watermark + error-throttling
/// state. Registered with the session's [`crate::scheduler::Scheduler`].
pub struct Feed {
    kind: FeedKind,
    api: Arc<dyn RemoteApi>,
    vars: Arc<dyn VarStore>,
    query_count: u32,
    watermark: Mutex<Option<u64>>,
    loading: AtomicBool,
    on_entry: Mutex<CallbackList<Entry>>,
    on_notice: Mutex<CallbackList<ThrottleNotice>>,
    throttler: Mutex<ErrorThrottler>,
    scheduler_handle: Mutex<Option<FeedHandle>>,
}

impl Feed {
    pub fn new(kind: FeedKind, api: Arc<dyn RemoteApi>, vars: Arc<dyn VarStore>, query_count: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            api,
            vars,
            query_count,
            watermark: Mutex::new(None),
            loading: AtomicBool::new(false),
            on_entry: Mutex::new(CallbackList::new()),
            on_notice: Mutex::new(CallbackList::new()),
            throttler: Mutex::new(ErrorThrottler::default()),
            scheduler_handle: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> &FeedKind {
        &self.kind
    }

    /// The highest remote entry id delivered so far, if any refresh has
    /// dispatched one yet (`!gc`'s per-feed watermark dump, `spec.md`
    /// §9's supplemented `!gc` diagnostic).
    pub fn watermark(&self) -> Option<u64> {
        *self.watermark.lock()
    }

    pub fn on_entry(&self, cb: impl crate::callbacks::Callback<Entry> + 'static) {
        self.on_entry.lock().add_callback(cb);
    }

    pub fn on_notice(&self, cb: impl crate::callbacks::Callback<ThrottleNotice> + 'static) {
        self.on_notice.lock().add_callback(cb);
    }

    pub fn set_scheduler_handle(&self, handle: FeedHandle) {
        *self.scheduler_handle.lock() = Some(handle);
    }

    /// Clear the in-memory and persisted watermark so the next refresh
    /// redelivers entries already seen (`!!`'s forced-refresh-with-reset,
    /// `spec.md` §4.8).
    pub async fn reset_watermark(&self) -> Result<()> {
        *self.watermark.lock() = None;
        self.vars.set_var(&self.kind.watermark_key(), "").await
    }

    /// Load the in-memory watermark lazily from the persisted UserVar the
    /// first time it's needed.
    async fn load_watermark_if_unset(&self) -> Result<Option<u64>> {
        if let Some(w) = *self.watermark.lock() {
            return Ok(Some(w));
        }
        let stored = self.vars.get_var(&self.kind.watermark_key()).await?;
        let parsed = stored.and_then(|s| s.parse::<u64>().ok());
        *self.watermark.lock() = parsed;
        Ok(parsed)
    }

    async fn fetch(&self, params: TimelineParams) -> Result<Vec<Entry>> {
        match &self.kind {
            FeedKind::Home => self.api.home_timeline(params).await,
            FeedKind::Mentions => self.api.mentions(params).await,
            FeedKind::DirectMessages => self.api.direct_messages(params).await,
            FeedKind::UserTimeline(user) => self.api.user_timeline(user, params).await,
            FeedKind::ListTimeline(owner, name) => self.api.list_timeline(owner, name, params).await,
        }
    }

    /// `refresh()` contract per `spec.md` §4.4.
    pub async fn refresh(self: &Arc<Self>) {
        if self.loading.swap(true, Ordering::SeqCst) {
            tracing::debug!(kind = ?self.kind, "refresh already in flight, skipping");
            return;
        }

        let result = self.do_refresh().await;
        self.loading.store(false, Ordering::SeqCst);

        let mut rate_limited_until = None;
        match result {
            Ok(_dispatched) => {
                if let Some(notice) = self.throttler.lock().ok() {
                    self.on_notice.lock().dispatch(&notice).await.ok();
                }
            }
            Err(e) => {
                // per spec's explicit ordering fix: error-throttler first,
                // then the raw error-back, then the scheduler reschedule.
                let notice = self.throttler.lock().error(e.to_string());
                if let Some(notice) = notice {
                    self.on_notice.lock().dispatch(&notice).await.ok();
                }
                tracing::warn!(kind = ?self.kind, error = %e, "feed refresh failed");
                if let GatewayError::RemoteApi(RemoteApiErrorKind::RateLimited { reset_unix }) = e {
                    rate_limited_until = Some(reset_instant(reset_unix));
                }
            }
        }

        if let Some(handle) = self.scheduler_handle.lock().as_ref() {
            // a rate-limit exhaustion pushes the next tick out to the
            // remote-reported reset time instead of pulling it to now
            // (`spec.md` §4.5/§7 kind-3, scenario 6).
            match rate_limited_until {
                Some(reset_at) => handle.wait_rate_limit(reset_at),
                None => handle.resched(),
            }
        }
    }

    async fn do_refresh(&self) -> Result<usize> {
        let since_id = self.load_watermark_if_unset().await?;
        let params = TimelineParams {
            since_id,
            count: self.query_count,
        };

        let mut entries = self.fetch(params).await?;
        // chronological (ascending id) order, same outcome as the
        // original's prepend-while-arriving-then-iterate.
        entries.sort_by_key(|e| e.id);

        let mut watermark = *self.watermark.lock();
        for entry in &entries {
            self.on_entry.lock().dispatch(entry).await?;
            if watermark.is_none_or(|w| entry.id > w) {
                watermark = Some(entry.id);
                *self.watermark.lock() = watermark;
                self.vars
                    .set_var(&self.kind.watermark_key(), &entry.id.to_string())
                    .await?;
            }
        }

        let remaining = self.api.rate_limit_snapshot().remaining;
        if remaining == 0 {
            return Err(GatewayError::RemoteApi(RemoteApiErrorKind::RateLimited {
                reset_unix: self.api.rate_limit_snapshot().reset_unix,
            }));
        }

        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::api::{RateLimitSnapshot, UserRecord};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MapVars {
        map: StdMutex<std::collections::HashMap<String, String>>,
    }

    #[async_trait]
    impl VarStore for MapVars {
        async fn get_var(&self, name: &str) -> Result<Option<String>> {
            Ok(self.map.lock().unwrap().get(name).cloned())
        }
        async fn set_var(&self, name: &str, value: &str) -> Result<()> {
            self.map.lock().unwrap().insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    fn mk_entry(id: u64) -> Entry {
        Entry {
            id,
            author: UserRecord {
                remote_id: 1,
                screen_name: "alice".into(),
                display_name: "Alice".into(),
            },
            text: format!("entry {id}"),
            created_at: Utc::now(),
            retweeted_status: None,
            in_reply_to_status_id: None,
        }
    }

    #[tokio::test]
    async fn dispatches_entries_in_ascending_id_order_and_persists_max_watermark() {
        let api = Arc::new(FakeApi::new());
        // push out of arrival order, as a real remote timeline API would
        // (newest first): id 5, then 3, then 9.
        api.home.lock().push_back(mk_entry(5));
        api.home.lock().push_back(mk_entry(3));
        api.home.lock().push_back(mk_entry(9));

        let vars = Arc::new(MapVars::default());
        let feed = Feed::new(FeedKind::Home, api, vars.clone(), 100);

        let seen = Arc::new(StdMutex::new(Vec::<u64>::new()));
        let seen2 = seen.clone();
        feed.on_entry(move |e: &Entry| {
            let seen2 = seen2.clone();
            let id = e.id;
            async move {
                seen2.lock().unwrap().push(id);
                Ok(())
            }
        });

        feed.refresh().await;

        assert_eq!(*seen.lock().unwrap(), vec![3, 5, 9]);
        let persisted = vars.get_var("home_last_status_id").await.unwrap();
        assert_eq!(persisted, Some("9".to_string()));
    }

    #[tokio::test]
    async fn concurrent_refresh_is_idempotent_while_loading() {
        let api = Arc::new(FakeApi::new());
        api.home.lock().push_back(mk_entry(1));
        let vars = Arc::new(MapVars::default());
        let feed = Feed::new(FeedKind::Home, api, vars, 100);

        // manually mark loading to simulate an in-flight refresh
        feed.loading.store(true, Ordering::SeqCst);
        feed.refresh().await;
        // loading flag was left true by our manual set and refresh()
        // should have bailed without touching it
        assert!(feed.loading.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reset_watermark_clears_in_memory_and_persisted_state() {
        let api = Arc::new(FakeApi::new());
        api.home.lock().push_back(mk_entry(5));
        let vars = Arc::new(MapVars::default());
        let feed = Feed::new(FeedKind::Home, api, vars.clone(), 100);

        feed.refresh().await;
        assert_eq!(feed.watermark(), Some(5));

        feed.reset_watermark().await.unwrap();
        assert_eq!(feed.watermark(), None);
        let persisted = vars.get_var("home_last_status_id").await.unwrap();
        assert_eq!(persisted, Some(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_refresh_pushes_the_next_tick_to_the_reset_time_instead_of_resched() {
        let api = Arc::new(FakeApi::new());
        api.home.lock().push_back(mk_entry(1));
        *api.rate_limit.lock() = RateLimitSnapshot {
            limit: 150,
            remaining: 0,
            reset_unix: (SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600) as i64,
        };
        let vars = Arc::new(MapVars::default());
        let feed = Feed::new(FeedKind::Home, api, vars, 100);

        let shots = Arc::new(StdMutex::new(0usize));
        let sched = crate::scheduler::Scheduler::new(Duration::from_millis(10));
        let feed_for_shot = feed.clone();
        let shots2 = shots.clone();
        let handle = sched.register(move || {
            let feed = feed_for_shot.clone();
            let shots2 = shots2.clone();
            async move {
                feed.refresh().await;
                *shots2.lock().unwrap() += 1;
            }
        });
        feed.set_scheduler_handle(handle);

        sched.start();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(*shots.lock().unwrap(), 1);
        assert_eq!(feed.watermark(), Some(1), "the one entry already fetched still dispatched");

        // a normal resched() would bring the next tick back to ~10ms away;
        // a rate limit should instead push it out past the reset time, so
        // nothing further happens for a long while.
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(*shots.lock().unwrap(), 1, "next tick was pushed out past the rate-limit reset, not pulled to now");

        sched.stop();
    }

    #[tokio::test]
    async fn watermark_key_matches_spec_for_each_kind() {
        assert_eq!(FeedKind::Home.watermark_key(), "home_last_status_id");
        assert_eq!(FeedKind::Mentions.watermark_key(), "mentions_last_status_id");
        assert_eq!(
            FeedKind::DirectMessages.watermark_key(),
            "direct_messages_last_id"
        );
        assert_eq!(
            FeedKind::UserTimeline("bob".into()).watermark_key(),
            "last_status_id_@bob"
        );
        assert_eq!(
            FeedKind::ListTimeline("bob".into(), "friends".into()).watermark_key(),
            "last_status_id_@bob/friends"
        );
    }
}
