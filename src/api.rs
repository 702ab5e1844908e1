//! The abstract remote microblog API and delegated-auth handshake.
//!
//! Both are explicitly out of scope as concrete implementations — only
//! their interfaces are pinned down here. Everything downstream (feeds,
//! the auth flow, channel member computation) is written against these
//! traits; a real HTTP-backed implementation is someone else's problem
//! and is never constructed by this crate's tests, which use an
//! in-memory fake.
//!
//! Pagination is a plain `async fn` returning a collected page rather
//! than a callback chain, the same way the rest of this crate favors
//! `async`/`await` over deferred/callback plumbing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::identity::RemoteId;

/// A remote user record, as returned by `show_user`, pagination, and
/// `verify_credentials`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub remote_id: RemoteId,
    pub screen_name: String,
    pub display_name: String,
}

/// An opaque entry obtained from the remote API. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: u64,
    pub author: UserRecord,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub retweeted_status: Option<Box<Entry>>,
    pub in_reply_to_status_id: Option<u64>,
}

/// One page of a cursor-paginated listing. `next_cursor == "0"` means
/// this was the final page, matching the remote's convention.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: String,
}

impl<T> Page<T> {
    pub fn is_last_page(&self) -> bool {
        self.next_cursor == "0"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineParams {
    pub since_id: Option<u64>,
    pub count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PostParams {
    pub in_reply_to_status_id: Option<u64>,
}

/// Rate-limit status exposed by the remote client, read after every
/// call (limit, remaining count, reset time).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix: i64,
}

/// The abstract remote microblog API. Every call can fail with a
/// [`crate::error::RemoteApiErrorKind`] wrapped in [`GatewayError::RemoteApi`](crate::error::GatewayError::RemoteApi).
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn home_timeline(&self, params: TimelineParams) -> Result<Vec<Entry>>;
    async fn mentions(&self, params: TimelineParams) -> Result<Vec<Entry>>;
    async fn direct_messages(&self, params: TimelineParams) -> Result<Vec<Entry>>;
    async fn user_timeline(&self, user: &str, params: TimelineParams) -> Result<Vec<Entry>>;
    async fn list_timeline(
        &self,
        owner: &str,
        name: &str,
        params: TimelineParams,
    ) -> Result<Vec<Entry>>;

    async fn friends_ids(&self, screen_name: &str, cursor: &str) -> Result<Page<RemoteId>>;
    async fn list_friends(&self, user: &str, cursor: &str) -> Result<Page<UserRecord>>;
    async fn list_members(&self, owner: &str, name: &str, cursor: &str) -> Result<Page<UserRecord>>;

    async fn follow_user(&self, nick: &str) -> Result<()>;
    async fn unfollow_user(&self, nick: &str) -> Result<()>;
    async fn show_user(&self, name: &str) -> Result<UserRecord>;

    async fn update(&self, text: &str, params: PostParams) -> Result<Entry>;
    async fn retweet(&self, id: u64) -> Result<Entry>;
    async fn send_direct_message(&self, text: &str, params: PostParams) -> Result<Entry>;

    async fn verify_credentials(&self) -> Result<UserRecord>;

    fn rate_limit_snapshot(&self) -> RateLimitSnapshot;
}

/// The three-legged delegated-authorization handshake, producing the
/// `(key, secret)` pair stored on the Account.
#[async_trait]
pub trait DelegatedAuth: Send + Sync {
    /// Step 1: obtain a request token pair.
    async fn request_token(&self) -> Result<(String, String)>;

    /// Step 2: the URL the user visits to authorize the request token
    /// and obtain a PIN.
    fn authorize_url(&self, request_token: &str) -> String;

    /// Step 3: exchange the request token + user-supplied PIN for a
    /// long-lived delegated token pair.
    async fn access_token(
        &self,
        request_token: &str,
        request_token_secret: &str,
        pin: &str,
    ) -> Result<(String, String)>;
}

#[cfg(test)]
pub mod fake {
    //! An in-memory [`RemoteApi`] used throughout this crate's tests.
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct FakeApi {
        pub home: Mutex<VecDeque<Entry>>,
        pub mentions_q: Mutex<VecDeque<Entry>>,
        pub posted: Mutex<Vec<(String, PostParams)>>,
        pub rate_limit: Mutex<RateLimitSnapshot>,
    }

    impl FakeApi {
        pub fn new() -> Self {
            Self {
                rate_limit: Mutex::new(RateLimitSnapshot {
                    limit: 150,
                    remaining: 150,
                    reset_unix: 0,
                }),
                ..Default::default()
            }
        }

        fn drain_since(q: &Mutex<VecDeque<Entry>>, params: TimelineParams) -> Vec<Entry> {
            let mut q = q.lock();
            let mut out = Vec::new();
            while let Some(front) = q.front() {
                if let Some(since) = params.since_id {
                    if front.id <= since {
                        q.pop_front();
                        continue;
                    }
                }
                out.push(q.pop_front().unwrap());
            }
            out
        }
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn home_timeline(&self, params: TimelineParams) -> Result<Vec<Entry>> {
            Ok(Self::drain_since(&self.home, params))
        }
        async fn mentions(&self, params: TimelineParams) -> Result<Vec<Entry>> {
            Ok(Self::drain_since(&self.mentions_q, params))
        }
        async fn direct_messages(&self, _params: TimelineParams) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        async fn user_timeline(&self, _user: &str, _params: TimelineParams) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        async fn list_timeline(
            &self,
            _owner: &str,
            _name: &str,
            _params: TimelineParams,
        ) -> Result<Vec<Entry>> {
            Ok(Vec::new())
        }
        async fn friends_ids(&self, _screen_name: &str, _cursor: &str) -> Result<Page<RemoteId>> {
            Ok(Page { items: Vec::new(), next_cursor: "0".into() })
        }
        async fn list_friends(&self, _user: &str, _cursor: &str) -> Result<Page<UserRecord>> {
            Ok(Page { items: Vec::new(), next_cursor: "0".into() })
        }
        async fn list_members(
            &self,
            _owner: &str,
            _name: &str,
            _cursor: &str,
        ) -> Result<Page<UserRecord>> {
            Ok(Page { items: Vec::new(), next_cursor: "0".into() })
        }
        async fn follow_user(&self, _nick: &str) -> Result<()> {
            Ok(())
        }
        async fn unfollow_user(&self, _nick: &str) -> Result<()> {
            Ok(())
        }
        async fn show_user(&self, name: &str) -> Result<UserRecord> {
            Ok(UserRecord {
                remote_id: 0,
                screen_name: name.to_string(),
                display_name: name.to_string(),
            })
        }
        async fn update(&self, text: &str, params: PostParams) -> Result<Entry> {
            self.posted.lock().push((text.to_string(), params.clone()));
            Ok(Entry {
                id: 1,
                author: UserRecord {
                    remote_id: 1,
                    screen_name: "me".into(),
                    display_name: "me".into(),
                },
                text: text.to_string(),
                created_at: Utc::now(),
                retweeted_status: None,
                in_reply_to_status_id: params.in_reply_to_status_id,
            })
        }
        async fn retweet(&self, id: u64) -> Result<Entry> {
            Ok(Entry {
                id,
                author: UserRecord {
                    remote_id: 1,
                    screen_name: "me".into(),
                    display_name: "me".into(),
                },
                text: String::new(),
                created_at: Utc::now(),
                retweeted_status: None,
                in_reply_to_status_id: None,
            })
        }
        async fn send_direct_message(&self, text: &str, params: PostParams) -> Result<Entry> {
            self.update(text, params).await
        }
        async fn verify_credentials(&self) -> Result<UserRecord> {
            Ok(UserRecord {
                remote_id: 1,
                screen_name: "me".into(),
                display_name: "me".into(),
            })
        }
        fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
            *self.rate_limit.lock()
        }
    }

    #[test]
    fn page_is_last_page_checks_zero_cursor() {
        let p: Page<i32> = Page { items: vec![], next_cursor: "0".into() };
        assert!(p.is_last_page());
        let p2: Page<i32> = Page { items: vec![], next_cursor: "123".into() };
        assert!(!p2.is_last_page());
    }
}
