//! Channel repository (§3 `Channel`, §4.5 reconciliation reads, §4.4.1.1).

use sqlx::SqlitePool;

use super::DbError;

/// Desired channel membership for one account, with an optional join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub account: String,
    pub name: String,
    pub key: String,
}

/// Repository for the `channel` table.
pub struct ChannelRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChannelRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All configured channels, for account-manager channel reconciliation
    /// (§4.4.1.1 `desired`).
    pub async fn list(&self) -> Result<Vec<ChannelRecord>, DbError> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT account, name, key FROM channel ORDER BY account, name")
                .fetch_all(self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(account, name, key)| ChannelRecord { account, name, key })
            .collect())
    }

    /// Desired channels for a single account.
    pub async fn list_for_account(&self, account: &str) -> Result<Vec<ChannelRecord>, DbError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT account, name, key FROM channel WHERE account = ? ORDER BY name",
        )
        .bind(account)
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(account, name, key)| ChannelRecord { account, name, key })
            .collect())
    }

    #[cfg(test)]
    pub async fn upsert(&self, record: &ChannelRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO channel (account, name, key) VALUES (?, ?, ?)
             ON CONFLICT(account, name) DO UPDATE SET key = excluded.key",
        )
        .bind(&record.account)
        .bind(&record.name)
        .bind(&record.key)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn remove(&self, account: &str, name: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM channel WHERE account = ? AND name = ?")
            .bind(account)
            .bind(name)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
