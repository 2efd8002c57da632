//! Target repository (§3 `Target`, §4.6 dispatch scoping).

use serde_json::Value;
use sqlx::SqlitePool;

use mup_proto::Address;

use super::DbError;

/// A wildcard address scope that defines what a plugin observes, and its
/// default broadcast destination.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub plugin: String,
    pub account: String,
    pub channel: String,
    pub nick: String,
    pub config: Value,
}

impl TargetRecord {
    /// This target's address scope, for [`Address::contains`] matching.
    pub fn address(&self) -> Address {
        Address {
            account: self.account.clone(),
            channel: self.channel.clone(),
            nick: self.nick.clone(),
            user: String::new(),
            host: String::new(),
        }
    }
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
}

/// Repository for the `target` table.
pub struct TargetRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TargetRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All targets, for plugin-manager reconciliation (§4.6).
    pub async fn list(&self) -> Result<Vec<TargetRecord>, DbError> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT plugin, account, channel, nick, config FROM target ORDER BY plugin, id",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(plugin, account, channel, nick, config)| TargetRecord {
                plugin,
                account,
                channel,
                nick,
                config: parse_json(&config),
            })
            .collect())
    }

    /// Targets for one plugin, in declaration order.
    pub async fn list_for_plugin(&self, plugin: &str) -> Result<Vec<TargetRecord>, DbError> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT plugin, account, channel, nick, config FROM target WHERE plugin = ? ORDER BY id",
        )
        .bind(plugin)
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(plugin, account, channel, nick, config)| TargetRecord {
                plugin,
                account,
                channel,
                nick,
                config: parse_json(&config),
            })
            .collect())
    }

    #[cfg(test)]
    pub async fn insert(&self, record: &TargetRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO target (plugin, account, channel, nick, config) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.plugin)
        .bind(&record.account)
        .bind(&record.channel)
        .bind(&record.nick)
        .bind(record.config.to_string())
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    async fn test_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    async fn seed_plugin(db: &Database, name: &str) {
        db.plugins()
            .upsert(&crate::db::PluginRecord {
                name: name.into(),
                last_id: 0,
                config: json!({}),
                state: json!({}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_for_plugin_preserves_order() {
        let db = test_db().await;
        seed_plugin(&db, "echo").await;
        db.targets()
            .insert(&TargetRecord {
                plugin: "echo".into(),
                account: "one".into(),
                channel: "#chan".into(),
                nick: String::new(),
                config: json!({}),
            })
            .await
            .unwrap();
        db.targets()
            .insert(&TargetRecord {
                plugin: "echo".into(),
                account: "two".into(),
                channel: String::new(),
                nick: "someone".into(),
                config: json!({}),
            })
            .await
            .unwrap();

        let got = db.targets().list_for_plugin("echo").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].account, "one");
        assert_eq!(got[1].account, "two");
    }

    #[tokio::test]
    async fn test_target_address_is_wildcard_scope() {
        let target = TargetRecord {
            plugin: "echo".into(),
            account: "one".into(),
            channel: String::new(),
            nick: String::new(),
            config: json!({}),
        };
        let scope = target.address();
        assert!(scope.contains(&Address {
            account: "one".into(),
            channel: "#anything".into(),
            nick: "anyone".into(),
            user: String::new(),
            host: String::new(),
        }));
        assert!(!scope.contains(&Address {
            account: "two".into(),
            channel: String::new(),
            nick: String::new(),
            user: String::new(),
            host: String::new(),
        }));
    }
}
