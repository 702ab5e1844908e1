//! Concrete bindings for the two external collaborators `spec.md` §1
//! marks as deliberately out of scope: the remote microblog HTTP client
//! and the delegated-authorization handshake transport. `api.rs` pins
//! down only their interfaces; this module is the seam a deployment
//! plugs a real implementation into.
//!
//! What's here lets the daemon start, bind its listener, and run a
//! client all the way through IRC registration and the anonymous
//! `#new-user-setup` redirect without any remote service configured —
//! every call past that point fails as a throttleable remote-API error
//! (feeds) or a `MissingOAuthRegistration` signal (auth), exactly the
//! failure shapes `spec.md` §7 already defines handling for.

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{
    DelegatedAuth, Entry, Page, PostParams, RateLimitSnapshot, RemoteApi, TimelineParams, UserRecord,
};
use crate::auth::AuthProbe;
use crate::db::Account;
use crate::error::{GatewayError, RemoteApiErrorKind, Result};
use crate::identity::RemoteId;
use crate::session::RemoteApiFactory;

fn unreachable_remote() -> GatewayError {
    GatewayError::RemoteApi(RemoteApiErrorKind::Transient(
        "no remote API backend configured".to_string(),
    ))
}

/// A [`RemoteApi`] that reaches nothing. Every call returns a
/// throttleable transient error, so a feed's error throttler mutes it
/// after `MAX_SAME`/`MAX_DIFF` the same way it would a real outage.
#[derive(Default)]
pub struct UnconfiguredRemoteApi;

#[async_trait]
impl RemoteApi for UnconfiguredRemoteApi {
    async fn home_timeline(&self, _params: TimelineParams) -> Result<Vec<Entry>> {
        Err(unreachable_remote())
    }
    async fn mentions(&self, _params: TimelineParams) -> Result<Vec<Entry>> {
        Err(unreachable_remote())
    }
    async fn direct_messages(&self, _params: TimelineParams) -> Result<Vec<Entry>> {
        Err(unreachable_remote())
    }
    async fn user_timeline(&self, _user: &str, _params: TimelineParams) -> Result<Vec<Entry>> {
        Err(unreachable_remote())
    }
    async fn list_timeline(
        &self,
        _owner: &str,
        _name: &str,
        _params: TimelineParams,
    ) -> Result<Vec<Entry>> {
        Err(unreachable_remote())
    }
    async fn friends_ids(&self, _screen_name: &str, _cursor: &str) -> Result<Page<RemoteId>> {
        Err(unreachable_remote())
    }
    async fn list_friends(&self, _user: &str, _cursor: &str) -> Result<Page<UserRecord>> {
        Err(unreachable_remote())
    }
    async fn list_members(
        &self,
        _owner: &str,
        _name: &str,
        _cursor: &str,
    ) -> Result<Page<UserRecord>> {
        Err(unreachable_remote())
    }
    async fn follow_user(&self, _nick: &str) -> Result<()> {
        Err(unreachable_remote())
    }
    async fn unfollow_user(&self, _nick: &str) -> Result<()> {
        Err(unreachable_remote())
    }
    async fn show_user(&self, _name: &str) -> Result<UserRecord> {
        Err(unreachable_remote())
    }
    async fn update(&self, _text: &str, _params: PostParams) -> Result<Entry> {
        Err(unreachable_remote())
    }
    async fn retweet(&self, _id: u64) -> Result<Entry> {
        Err(unreachable_remote())
    }
    async fn send_direct_message(&self, _text: &str, _params: PostParams) -> Result<Entry> {
        Err(unreachable_remote())
    }
    async fn verify_credentials(&self) -> Result<UserRecord> {
        Err(unreachable_remote())
    }
    fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot { limit: 150, remaining: 150, reset_unix: 0 }
    }
}

/// Builds an [`UnconfiguredRemoteApi`] for every account, regardless of
/// its stored delegated token. Swap this out for a real HTTP-backed
/// factory once a concrete remote service is wired in.
pub struct UnconfiguredRemoteFactory;

impl RemoteApiFactory for UnconfiguredRemoteFactory {
    fn build(&self, _account: &Account) -> Arc<dyn RemoteApi> {
        Arc::new(UnconfiguredRemoteApi)
    }
}

/// Reports every credential as needing delegated-auth setup rather than
/// rejecting it outright, so a fresh connection is still routed into
/// `#new-user-setup` (per `spec.md` §4.9's `MissingOAuthRegistration`
/// path) instead of being dropped with `ERR_PASSWDMISMATCH`.
pub struct UnconfiguredAuthProbe;

#[async_trait]
impl AuthProbe for UnconfiguredAuthProbe {
    async fn verify_basic_auth(&self, _username: &str, _password: &str) -> Result<UserRecord> {
        Err(GatewayError::RemoteApi(RemoteApiErrorKind::MissingOAuthRegistration))
    }
    async fn verify_delegated_token(&self, _token: &str, _token_secret: &str) -> Result<UserRecord> {
        Err(GatewayError::RemoteApi(RemoteApiErrorKind::MissingOAuthRegistration))
    }
}

/// A [`DelegatedAuth`] transport with nowhere to send its requests. The
/// setup dialog (`auth::SetupSession`) surfaces `request_token`'s error
/// to the user and lets them retry with `restart` once a real handshake
/// endpoint is configured.
pub struct UnconfiguredDelegatedAuth;

#[async_trait]
impl DelegatedAuth for UnconfiguredDelegatedAuth {
    async fn request_token(&self) -> Result<(String, String)> {
        Err(unreachable_remote())
    }
    fn authorize_url(&self, request_token: &str) -> String {
        format!("https://example.invalid/authorize?oauth_token={request_token}")
    }
    async fn access_token(
        &self,
        _request_token: &str,
        _request_token_secret: &str,
        _pin: &str,
    ) -> Result<(String, String)> {
        Err(unreachable_remote())
    }
}
