//! Persistence adapter (C11).
//!
//! A sqlite-backed store for accounts, per-account string variables, the
//! process-global identity cache, and a small idempotent migration
//! runner — the "poor-man migration registry" from the original,
//! represented here as a compile-time-known constant slice rather than a
//! module-level mutable list.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::identity::{IdentityInfo, IdentityPersistence, RemoteId};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = Result<T, DbError>;

/// A locally known user account (`spec.md` §3's Account).
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub remote_id: Option<i64>,
    pub screen_name: Option<String>,
    pub local_password_hash: Option<String>,
    pub delegated_token: Option<String>,
    pub delegated_token_secret: Option<String>,
}

type MigrationFn =
    for<'a> fn(&'a SqlitePool) -> Pin<Box<dyn Future<Output = DbResult<()>> + Send + 'a>>;

struct Migration {
    name: &'static str,
    run: MigrationFn,
}

/// Legacy migrations carried over from the original schema history.
/// `create_tables` already creates `users` with the `remote_id`,
/// `delegated_token`, and `delegated_token_secret` columns, so on a
/// fresh install both of these are no-ops; they are kept to demonstrate
/// (and exercise, via the `data_migrations` bookkeeping) the same
/// registry mechanics the original relied on for upgrading an existing
/// deployment.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "twitter_id_col",
        run: |_pool| Box::pin(async { Ok(()) }),
    },
    Migration {
        name: "user_oauth_columns",
        run: |_pool| Box::pin(async { Ok(()) }),
    },
];

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    pub async fn connect(path: &str, max_connections: u32) -> DbResult<Self> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true)
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .idle_timeout(Some(Self::IDLE_TIMEOUT))
            .test_before_acquire(true)
            .connect_with(options)
            .await?;

        tracing::info!(path = %path, "database connected");

        let db = Self { pool };
        db.create_tables().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> DbResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id INTEGER UNIQUE,
                screen_name TEXT UNIQUE COLLATE NOCASE,
                local_password_hash TEXT,
                delegated_token TEXT,
                delegated_token_secret TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_vars (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                UNIQUE(user_id, name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS identity_cache (
                remote_id INTEGER PRIMARY KEY,
                screen_name TEXT NOT NULL,
                display_name TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS data_migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Run every migration in `MIGRATIONS` not yet recorded in
    /// `data_migrations`, each inside its own transaction.
    async fn run_migrations(&self) -> DbResult<()> {
        for m in MIGRATIONS {
            let already_ran: Option<i64> =
                sqlx::query_scalar("SELECT id FROM data_migrations WHERE name = ?")
                    .bind(m.name)
                    .fetch_optional(&self.pool)
                    .await?;
            if already_ran.is_some() {
                continue;
            }

            tracing::info!(migration = m.name, "running data migration");
            let mut tx = self.pool.begin().await?;
            (m.run)(&self.pool).await?;
            sqlx::query("INSERT INTO data_migrations (name) VALUES (?)")
                .bind(m.name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Idempotent helper: add `column` to `table` if it doesn't already
    /// exist, mirroring the original's `add_column` reflect-then-skip
    /// behavior.
    #[allow(dead_code)]
    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> DbResult<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&self.pool)
            .await?;
        let exists = rows.iter().any(|r| {
            r.try_get::<String, _>("name").map(|n| n == column).unwrap_or(false)
        });
        if exists {
            return Ok(());
        }
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `get_user(remote_id?, screen_name?, create)` per the original's
    /// `DataStore.get_user`: prefer a remote-id match; fall back to a
    /// screen-name match and, if the caller supplied a remote id that the
    /// matched row lacks, adopt it onto that row (the legacy-data
    /// conversion path); otherwise create when `create` is set.
    pub async fn get_user(
        &self,
        remote_id: Option<RemoteId>,
        screen_name: Option<&str>,
        create: bool,
    ) -> DbResult<Option<Account>> {
        if let Some(rid) = remote_id {
            if let Some(acct) = self.find_by_remote_id(rid).await? {
                return Ok(Some(acct));
            }
        }

        if let Some(name) = screen_name {
            if let Some(mut acct) = self.find_by_screen_name(name).await? {
                if let Some(rid) = remote_id {
                    if acct.remote_id.is_none() {
                        tracing::info!(screen_name = %name, remote_id = rid, "converting legacy user data");
                        sqlx::query("UPDATE users SET remote_id = ? WHERE id = ?")
                            .bind(rid)
                            .bind(acct.id)
                            .execute(&self.pool)
                            .await?;
                        acct.remote_id = Some(rid);
                    }
                }
                return Ok(Some(acct));
            }
        }

        if !create {
            return Ok(None);
        }

        let id = sqlx::query("INSERT INTO users (remote_id, screen_name) VALUES (?, ?)")
            .bind(remote_id)
            .bind(screen_name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        self.find_by_id(id).await
    }

    async fn find_by_id(&self, id: i64) -> DbResult<Option<Account>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_remote_id(&self, remote_id: RemoteId) -> DbResult<Option<Account>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_screen_name(&self, screen_name: &str) -> DbResult<Option<Account>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE screen_name = ? COLLATE NOCASE")
            .bind(screen_name)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn set_local_password_hash(&self, account_id: i64, hash: &str) -> DbResult<()> {
        sqlx::query("UPDATE users SET local_password_hash = ? WHERE id = ?")
            .bind(hash)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_delegated_token(
        &self,
        account_id: i64,
        token: &str,
        secret: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE users SET delegated_token = ?, delegated_token_secret = ? WHERE id = ?",
        )
        .bind(token)
        .bind(secret)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `get_var(account, name) -> Option<String>`.
    pub async fn get_var(&self, account_id: i64, name: &str) -> DbResult<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT value FROM user_vars WHERE user_id = ? AND name = ?",
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// `set_var(account, name, value)`, created lazily on first write.
    pub async fn set_var(&self, account_id: i64, name: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO user_vars (user_id, name, value) VALUES (?, ?, ?)
             ON CONFLICT(user_id, name) DO UPDATE SET value = excluded.value",
        )
        .bind(account_id)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityPersistence for Database {
    async fn upsert_identity(
        &self,
        remote_id: RemoteId,
        info: &IdentityInfo,
    ) -> crate::error::Result<()> {
        sqlx::query(
            "INSERT INTO identity_cache (remote_id, screen_name, display_name) VALUES (?, ?, ?)
             ON CONFLICT(remote_id) DO UPDATE SET screen_name = excluded.screen_name, display_name = excluded.display_name",
        )
        .bind(remote_id)
        .bind(&info.screen_name)
        .bind(&info.display_name)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}

impl From<DbError> for crate::error::GatewayError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlx(e) => crate::error::GatewayError::Db(e),
            DbError::Migration(e) => crate::error::GatewayError::Migration(e),
        }
    }
}
