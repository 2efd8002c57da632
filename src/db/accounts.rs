//! Account repository (§3 `Account`, §4.5 reconciliation reads).

use sqlx::SqlitePool;

use super::DbError;

/// A configured chat account (one row per IRC/Telegram/Signal/WebHook
/// connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub name: String,
    pub kind: String,
    pub endpoint: String,
    pub host: String,
    pub tls: bool,
    pub tls_insecure: bool,
    pub nick: String,
    pub identity: String,
    pub password: String,
    pub last_id: i64,
}

type AccountRow = (
    String,
    String,
    String,
    String,
    bool,
    bool,
    String,
    String,
    String,
    i64,
);

fn row_to_record(row: AccountRow) -> AccountRecord {
    let (name, kind, endpoint, host, tls, tls_insecure, nick, identity, password, last_id) = row;
    // A default nick of "mup" is applied when empty (§4.5).
    let nick = if nick.is_empty() { "mup".to_owned() } else { nick };
    AccountRecord {
        name,
        kind,
        endpoint,
        host,
        tls,
        tls_insecure,
        nick,
        identity,
        password,
        last_id,
    }
}

const SELECT_COLUMNS: &str =
    "name, kind, endpoint, host, tls, tls_insecure, nick, identity, password, last_id";

/// Repository for the `account` table.
pub struct AccountRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AccountRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All configured accounts, for account-manager reconciliation (§4.5).
    pub async fn list(&self) -> Result<Vec<AccountRecord>, DbError> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM account ORDER BY name"
        ))
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    pub async fn get(&self, name: &str) -> Result<AccountRecord, DbError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM account WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(self.pool)
        .await?
        .ok_or_else(|| DbError::AccountNotFound(name.to_owned()))?;
        Ok(row_to_record(row))
    }

    /// Advance `last_id` for `name`. Idempotent: only ever moves forward, and
    /// only on confirmed delivery (§3, §4.4.1: PONG `sent:<id>` marker).
    pub async fn advance_last_id(&self, name: &str, id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE account SET last_id = ? WHERE name = ? AND last_id < ?")
            .bind(id)
            .bind(name)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Insert or replace an account row (used by the WebHook inbound
    /// listener / fixtures / tests; out of scope for the runtime itself per
    /// §1, which treats provisioning as a collaborator).
    #[cfg(test)]
    pub async fn upsert(&self, record: &AccountRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO account (name, kind, endpoint, host, tls, tls_insecure, nick, identity, password, last_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind, endpoint = excluded.endpoint, host = excluded.host,
                tls = excluded.tls, tls_insecure = excluded.tls_insecure, nick = excluded.nick,
                identity = excluded.identity, password = excluded.password",
        )
        .bind(&record.name)
        .bind(&record.kind)
        .bind(&record.endpoint)
        .bind(&record.host)
        .bind(record.tls)
        .bind(record.tls_insecure)
        .bind(&record.nick)
        .bind(&record.identity)
        .bind(&record.password)
        .bind(record.last_id)
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
    async fn test_upsert_and_get_applies_default_nick() {
        let db = test_db().await;
        db.accounts()
            .upsert(&AccountRecord {
                name: "one".into(),
                kind: "irc".into(),
                endpoint: "irc.example.org:6667".into(),
                host: String::new(),
                tls: false,
                tls_insecure: false,
                nick: String::new(),
                identity: String::new(),
                password: String::new(),
                last_id: 0,
            })
            .await
            .unwrap();

        let got = db.accounts().get("one").await.unwrap();
        assert_eq!(got.nick, "mup");
    }

    #[tokio::test]
    async fn test_advance_last_id_is_monotonic() {
        let db = test_db().await;
        db.accounts()
            .upsert(&AccountRecord {
                name: "one".into(),
                kind: "irc".into(),
                endpoint: String::new(),
                host: String::new(),
                tls: false,
                tls_insecure: false,
                nick: "mup".into(),
                identity: String::new(),
                password: String::new(),
                last_id: 0,
            })
            .await
            .unwrap();

        db.accounts().advance_last_id("one", 5).await.unwrap();
        assert_eq!(db.accounts().get("one").await.unwrap().last_id, 5);

        // A smaller id must never regress last_id.
        db.accounts().advance_last_id("one", 2).await.unwrap();
        assert_eq!(db.accounts().get("one").await.unwrap().last_id, 5);
    }

    #[tokio::test]
    async fn test_get_missing_account_errors() {
        let db = test_db().await;
        assert!(matches!(
            db.accounts().get("ghost").await,
            Err(DbError::AccountNotFound(_))
        ));
    }
}
