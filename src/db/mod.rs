//! Persistent store (§3, §4.3): SQLite with WAL, foreign keys, and a single
//! append-only `message` table as the canonical order of all chat activity.

mod accounts;
mod channels;
mod ldap;
mod messages;
mod monikers;
mod plugins;
mod schemas;
mod targets;

pub use accounts::{AccountRecord, AccountRepository};
pub use channels::{ChannelRecord, ChannelRepository};
pub use ldap::{LdapRecord, LdapRepository};
pub use messages::MessageRepository;
pub use monikers::MonikerRepository;
pub use plugins::{PluginRecord, PluginRepository};
pub use schemas::{ArgumentSchema, CommandSchemaRecord, SchemaRepository};
pub use targets::{TargetRecord, TargetRepository};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

/// Store errors (§7: "fatal store error" kills the originating loop's
/// supervisor and the process exits non-zero).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("plugin not found: {0}")]
    PluginNotFound(String),
    #[error("ldap endpoint not found: {0}")]
    LdapNotFound(String),
}

/// Store handle wrapping a pooled SQLite connection.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Open (creating if absent) the store at `path`, running migrations.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true)
                .foreign_keys(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %e, "failed to create store directory");
                    }
                }
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Incremental);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "store connected");
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Reference to the underlying pool, for repositories that need it
    /// directly (transactions spanning more than one repository).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .unwrap_or(false)
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        if !Self::table_exists(pool, "message").await {
            Self::run_migration_file(pool, include_str!("../../migrations/001_init.sql")).await;
            info!("store migrations applied (001_init)");
        } else {
            info!("store already initialized");
        }
        Ok(())
    }

    async fn run_migration_file(pool: &SqlitePool, migration: &str) {
        for statement in migration.split(';') {
            let sql_lines: Vec<&str> = statement
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with("--"))
                .collect();
            if sql_lines.is_empty() {
                continue;
            }
            let sql = sql_lines.join("\n");
            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                let err_str = e.to_string();
                if !err_str.contains("already exists") {
                    tracing::warn!(sql = %sql, error = %e, "migration statement failed");
                }
            }
        }
    }

    pub fn accounts(&self) -> AccountRepository<'_> {
        AccountRepository::new(&self.pool)
    }

    pub fn channels(&self) -> ChannelRepository<'_> {
        ChannelRepository::new(&self.pool)
    }

    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(&self.pool)
    }

    pub fn plugins(&self) -> PluginRepository<'_> {
        PluginRepository::new(&self.pool)
    }

    pub fn targets(&self) -> TargetRepository<'_> {
        TargetRepository::new(&self.pool)
    }

    pub fn ldap(&self) -> LdapRepository<'_> {
        LdapRepository::new(&self.pool)
    }

    pub fn monikers(&self) -> MonikerRepository<'_> {
        MonikerRepository::new(&self.pool)
    }

    pub fn schemas(&self) -> SchemaRepository<'_> {
        SchemaRepository::new(&self.pool)
    }
}
