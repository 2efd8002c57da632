//! Plugin repository (§3 `Plugin`, §4.6 reconciliation reads).

use serde_json::Value;
use sqlx::SqlitePool;

use super::DbError;

/// A registered plugin instance. `name` may carry a `/label` suffix so the
/// same plugin spec can run multiple instances with distinct config.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRecord {
    pub name: String,
    pub last_id: i64,
    pub config: Value,
    pub state: Value,
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
}

/// Repository for the `plugin` table.
pub struct PluginRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PluginRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All configured plugin instances, for plugin-manager reconciliation
    /// (§4.6).
    pub async fn list(&self) -> Result<Vec<PluginRecord>, DbError> {
        let rows: Vec<(String, i64, String, String)> = sqlx::query_as(
            "SELECT name, last_id, config, state FROM plugin ORDER BY name",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_id, config, state)| PluginRecord {
                name,
                last_id,
                config: parse_json(&config),
                state: parse_json(&state),
            })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<PluginRecord, DbError> {
        let row: Option<(String, i64, String, String)> = sqlx::query_as(
            "SELECT name, last_id, config, state FROM plugin WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;
        let (name, last_id, config, state) =
            row.ok_or_else(|| DbError::PluginNotFound(name.to_owned()))?;
        Ok(PluginRecord {
            name,
            last_id,
            config: parse_json(&config),
            state: parse_json(&state),
        })
    }

    /// Checkpoint `last_id` for a live plugin (§4.6: "periodic checkpoint
    /// persists it to the store").
    pub async fn advance_last_id(&self, name: &str, id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE plugin SET last_id = ? WHERE name = ? AND last_id < ?")
            .bind(id)
            .bind(name)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Persist a plugin's own state blob (opaque to the manager, read/write
    /// only by the plugin itself through the plugger).
    pub async fn save_state(&self, name: &str, state: &Value) -> Result<(), DbError> {
        sqlx::query("UPDATE plugin SET state = ? WHERE name = ?")
            .bind(state.to_string())
            .bind(name)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn upsert(&self, record: &PluginRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO plugin (name, last_id, config, state) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET config = excluded.config, state = excluded.state",
        )
        .bind(&record.name)
        .bind(record.last_id)
        .bind(record.config.to_string())
        .bind(record.state.to_string())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn remove(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM plugin WHERE name = ?")
            .bind(name)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
