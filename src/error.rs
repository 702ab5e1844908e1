//! Unified error handling for passerd-rs.
//!
//! One flat error hierarchy for the whole daemon, with conversions from
//! the library errors we depend on and a single place that knows how to
//! turn a failure into an IRC numeric reply.

use thiserror::Error;

/// Why a remote-API call failed, for the three remote-API error kinds
/// distinguished in the error-handling design.
#[derive(Debug, Clone, Error)]
pub enum RemoteApiErrorKind {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("rate limit exhausted, resets at {reset_unix}")]
    RateLimited { reset_unix: i64 },
    #[error("missing delegated registration")]
    MissingOAuthRegistration,
}

/// Top-level error type threaded through handlers, feeds, and the
/// persistence adapter.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Kind 1: a handler wants a specific numeric reply sent back, with
    /// the numeric's positional arguments already formatted.
    #[error("protocol reply {numeric}: {args:?}")]
    ProtocolReply { numeric: u16, args: Vec<String> },

    /// Kinds 2-4: failures from the abstract remote microblog API.
    #[error("remote api error: {0}")]
    RemoteApi(#[from] RemoteApiErrorKind),

    /// Kind 5: local pre-check against LENGTH_LIMIT failed.
    #[error("message too long: {len} > {limit}")]
    MessageTooLong { len: usize, limit: usize },

    /// Kind 7: local password check or remote basic-auth probe failed.
    #[error("authentication failed for {nick}")]
    AuthFailed { nick: String },

    /// Database layer.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Socket I/O.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Kind 6: anything else. Logged, surfaced as one server notice, the
    /// connection survives.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Build a protocol-reply error for the given numeric and formatted
    /// trailing arguments (nick is prepended by the codec when sent).
    pub fn reply(numeric: u16, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        GatewayError::ProtocolReply {
            numeric,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// True for errors that should be reported to the user through the
    /// error throttler (C3) rather than as a direct numeric reply.
    pub fn is_throttleable(&self) -> bool {
        matches!(self, GatewayError::RemoteApi(_))
    }

    /// Convert into `(numeric, args)` for the IRC codec to render, if this
    /// error carries a protocol-level reply. Non-protocol errors return
    /// `None` — callers fall back to logging + a generic server notice.
    pub fn to_irc_reply(&self) -> Option<(u16, Vec<String>)> {
        match self {
            GatewayError::ProtocolReply { numeric, args } => Some((*numeric, args.clone())),
            GatewayError::MessageTooLong { .. } => {
                Some((404, vec!["Cannot send to channel (message too long)".into()]))
            }
            GatewayError::AuthFailed { .. } => Some((464, vec!["Password incorrect".into()])),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
