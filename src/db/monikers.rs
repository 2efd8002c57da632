//! Moniker repository (§3 `Moniker`, §4.8 resolution).

use sqlx::SqlitePool;

use super::DbError;

/// A per-(account, channel, nick) display-name override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonikerRecord {
    pub account: String,
    pub channel: String,
    pub nick: String,
    pub name: String,
}

/// Repository for the `moniker` table.
pub struct MonikerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MonikerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve a display name for `(account, channel, nick)` (§4.8): the
    /// channel-specific row wins over the default (empty-channel) row; `None`
    /// if neither exists.
    pub async fn resolve(
        &self,
        account: &str,
        channel: &str,
        nick: &str,
    ) -> Result<Option<String>, DbError> {
        if !channel.is_empty() {
            if let Some(name) = sqlx::query_scalar::<_, String>(
                "SELECT name FROM moniker WHERE account = ? AND channel = ? AND nick = ?",
            )
            .bind(account)
            .bind(channel)
            .bind(nick)
            .fetch_optional(self.pool)
            .await?
            {
                return Ok(Some(name));
            }
        }

        let name = sqlx::query_scalar::<_, String>(
            "SELECT name FROM moniker WHERE account = ? AND channel = '' AND nick = ?",
        )
        .bind(account)
        .bind(nick)
        .fetch_optional(self.pool)
        .await?;
        Ok(name)
    }

    #[cfg(test)]
    pub async fn upsert(&self, record: &MonikerRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO moniker (account, channel, nick, name) VALUES (?, ?, ?, ?)
             ON CONFLICT(account, channel, nick) DO UPDATE SET name = excluded.name",
        )
        .bind(&record.account)
        .bind(&record.channel)
        .bind(&record.nick)
        .bind(&record.name)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default_channel() {
        let db = test_db().await;
        db.monikers()
            .upsert(&MonikerRecord {
                account: "one".into(),
                channel: String::new(),
                nick: "nick".into(),
                name: "Default Name".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            db.monikers().resolve("one", "#chan", "nick").await.unwrap().as_deref(),
            Some("Default Name")
        );
    }

    #[tokio::test]
    async fn test_resolve_prefers_channel_specific() {
        let db = test_db().await;
        db.monikers()
            .upsert(&MonikerRecord {
                account: "one".into(),
                channel: String::new(),
                nick: "nick".into(),
                name: "Default Name".into(),
            })
            .await
            .unwrap();
        db.monikers()
            .upsert(&MonikerRecord {
                account: "one".into(),
                channel: "#chan".into(),
                nick: "nick".into(),
                name: "Chan Name".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            db.monikers().resolve("one", "#chan", "nick").await.unwrap().as_deref(),
            Some("Chan Name")
        );
        assert_eq!(
            db.monikers().resolve("one", "#other", "nick").await.unwrap().as_deref(),
            Some("Default Name")
        );
    }

    #[tokio::test]
    async fn test_resolve_none_when_absent() {
        let db = test_db().await;
        assert_eq!(db.monikers().resolve("one", "#chan", "nick").await.unwrap(), None);
    }
}
