//! Authentication flow (C10).
//!
//! Three probes attempted in order against a supplied `(nick, password)`
//! pair: a local Argon2 password-hash check, a remote basic-auth probe
//! (for accounts that haven't yet completed delegated authorization),
//! and a delegated-token `verify_credentials` probe for accounts that
//! already hold one. A `MissingOAuthRegistration` result at any probe
//! promotes the session into the anonymous delegated-auth setup flow
//! rather than failing outright; any other probe failure rejects the
//! login with `ERR_PASSWDMISMATCH` and the connection is dropped.
//!
//! The delegated-auth setup flow itself is a small conversational state
//! machine built the same way the rest of this crate's bot conversations
//! are: ask a question, wait for a reply, retry on mismatch. `restart`
//! is recognized at any point and rewinds to a fresh request token, the
//! one behavior this module borrows directly from the original's setup
//! dialog.

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::api::{DelegatedAuth, UserRecord};
use crate::dialog::MessageSink;
use crate::db::{Account, Database};
use crate::error::{GatewayError, RemoteApiErrorKind, Result};

/// The narrow, pre-authentication remote interface C10 needs: neither
/// probe requires a fully constructed [`crate::api::RemoteApi`] bound to
/// an account's token, since at this point no token may exist yet.
#[async_trait]
pub trait AuthProbe: Send + Sync {
    async fn verify_basic_auth(&self, username: &str, password: &str) -> Result<UserRecord>;
    async fn verify_delegated_token(&self, token: &str, token_secret: &str) -> Result<UserRecord>;
}

/// The result of [`authenticate`].
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Fully authenticated, with the confirmed remote identity.
    Authenticated { account: Account, remote: UserRecord },
    /// No usable credential could be confirmed remotely; the session
    /// should be promoted to anonymous and redirected into the
    /// delegated-auth setup flow (`#new-user-setup`).
    NeedsOAuthSetup { account: Account },
    /// The supplied password didn't match anything we could confirm.
    Rejected,
}

fn hash_password(password: &str) -> Result<String> {
    let bytes = Zeroizing::new(password.as_bytes().to_vec());
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(&bytes, &salt)
        .map(|h| h.to_string())
        .map_err(|e| GatewayError::Internal(format!("password hash error: {e}")))
}

fn verify_local_password(stored_hash: &str, password: &str) -> bool {
    let bytes = Zeroizing::new(password.as_bytes().to_vec());
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default().verify_password(&bytes, &parsed).is_ok(),
        Err(_) => false,
    }
}

/// Percent-encode per RFC 3986's unreserved set (`ALPHA / DIGIT / "-" /
/// "." / "_" / "~"`), the encoding OAuth1 signature base strings use.
fn oauth1_percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// A fresh `oauth_nonce` value: 32 random alphanumeric characters.
pub fn oauth1_nonce() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// The OAuth1 HMAC-SHA1 signature for a request: `method`, `base_url`
/// (no query string), every OAuth and request parameter to sign, the
/// consumer secret, and the token secret (empty before a token exists,
/// e.g. for `request_token`).
pub fn oauth1_signature(
    method: &str,
    base_url: &str,
    params: &[(&str, &str)],
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort_unstable();
    let param_str = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", oauth1_percent_encode(k), oauth1_percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let base = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        oauth1_percent_encode(base_url),
        oauth1_percent_encode(&param_str)
    );
    let key = format!(
        "{}&{}",
        oauth1_percent_encode(consumer_secret),
        oauth1_percent_encode(token_secret.unwrap_or(""))
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(base.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Run the three-stage probe pipeline for `(nick, password)`.
pub async fn authenticate(
    db: &Database,
    probe: &dyn AuthProbe,
    nick: &str,
    password: &str,
) -> Result<AuthOutcome> {
    if let Some(acct) = db.get_user(None, Some(nick), false).await? {
        if let Some(hash) = &acct.local_password_hash {
            return if verify_local_password(hash, password) {
                finish_with_token_probe(probe, acct).await
            } else {
                Ok(AuthOutcome::Rejected)
            };
        }
    }

    match probe.verify_basic_auth(nick, password).await {
        Ok(remote) => {
            let acct = db
                .get_user(Some(remote.remote_id), Some(nick), true)
                .await?
                .ok_or_else(|| GatewayError::Internal("get_user(create=true) returned no row".into()))?;
            let hash = hash_password(password)?;
            db.set_local_password_hash(acct.id, &hash).await?;
            finish_with_token_probe(probe, acct).await
        }
        Err(GatewayError::RemoteApi(RemoteApiErrorKind::MissingOAuthRegistration)) => {
            let acct = db
                .get_user(None, Some(nick), true)
                .await?
                .ok_or_else(|| GatewayError::Internal("get_user(create=true) returned no row".into()))?;
            Ok(AuthOutcome::NeedsOAuthSetup { account: acct })
        }
        Err(_) => Ok(AuthOutcome::Rejected),
    }
}

/// Stage 3: if the account already holds a delegated token, confirm it
/// is still good with `verify_credentials` before declaring success.
async fn finish_with_token_probe(probe: &dyn AuthProbe, acct: Account) -> Result<AuthOutcome> {
    match (&acct.delegated_token, &acct.delegated_token_secret) {
        (Some(token), Some(secret)) => match probe.verify_delegated_token(token, secret).await {
            Ok(remote) => Ok(AuthOutcome::Authenticated { account: acct, remote }),
            Err(GatewayError::RemoteApi(RemoteApiErrorKind::MissingOAuthRegistration)) => {
                Ok(AuthOutcome::NeedsOAuthSetup { account: acct })
            }
            Err(_) => Ok(AuthOutcome::Rejected),
        },
        _ => Ok(AuthOutcome::NeedsOAuthSetup { account: acct }),
    }
}

#[derive(Debug, Clone)]
enum SetupState {
    Idle,
    AwaitingPin { request_token: String, request_token_secret: String },
}

/// The conversational delegated-auth provisioning flow held by an
/// anonymous session on `#new-user-setup`: send the authorize URL, wait
/// for a PIN, exchange it for a long-lived token pair.
pub struct SetupSession {
    auth: Arc<dyn DelegatedAuth>,
    state: Mutex<SetupState>,
}

impl SetupSession {
    pub fn new(auth: Arc<dyn DelegatedAuth>) -> Arc<Self> {
        Arc::new(Self { auth, state: Mutex::new(SetupState::Idle) })
    }

    /// Request a fresh token pair and prompt the user to authorize it.
    /// Also the `restart` handler: a fresh call discards any in-flight
    /// token and starts over.
    pub async fn begin(&self, sink: &dyn MessageSink) -> Result<()> {
        let (token, secret) = self.auth.request_token().await?;
        let url = self.auth.authorize_url(&token);
        *self.state.lock() = SetupState::AwaitingPin {
            request_token: token,
            request_token_secret: secret,
        };
        sink.send_message(&format!(
            "Visit {url} to authorize this bot, then reply with: !login <PIN>"
        ))
        .await
    }

    /// Handle one line of conversation. Returns the access token pair
    /// once the exchange succeeds; the caller is responsible for
    /// persisting it and re-running [`authenticate`].
    pub async fn handle_pin(&self, pin: &str, sink: &dyn MessageSink) -> Result<Option<(String, String)>> {
        if pin.trim().eq_ignore_ascii_case("restart") {
            self.begin(sink).await?;
            return Ok(None);
        }

        let (token, secret) = match &*self.state.lock() {
            SetupState::AwaitingPin { request_token, request_token_secret } => {
                (request_token.clone(), request_token_secret.clone())
            }
            SetupState::Idle => {
                sink.send_message("Type !login <PIN> after authorizing, or 'restart' to get a new link.")
                    .await?;
                return Ok(None);
            }
        };

        match self.auth.access_token(&token, &secret, pin.trim()).await {
            Ok(pair) => {
                *self.state.lock() = SetupState::Idle;
                Ok(Some(pair))
            }
            Err(e) => {
                sink.send_message(&format!(
                    "That PIN didn't work ({e}). Try again or type 'restart' for a new link."
                ))
                .await?;
                Ok(None)
            }
        }
    }
}
