//! Message repository (§3 `Message`, §4.3): the single append-only,
//! monotonically-ordered record of all chat activity.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use mup_proto::{Address, BotMessage, Lane};

use super::DbError;

fn params_to_json(params: &[String]) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| "[]".to_owned())
}

fn params_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_message(row: SqliteRow) -> BotMessage {
    let lane: i64 = row.get("lane");
    BotMessage {
        id: Some(row.get::<i64, _>("id")),
        nonce: row.get("nonce"),
        lane: Lane::from_i64(lane).unwrap_or(Lane::Inbound),
        time: row.get("time"),
        address: Address {
            account: row.get("account"),
            channel: row.get("channel"),
            nick: row.get("nick"),
            user: row.get("user"),
            host: row.get("host"),
        },
        command: row.get("command"),
        params: params_from_json(&row.get::<String, _>("params")),
        text: row.get("text"),
        bot_text: row.get("bot_text"),
        bang: row
            .get::<Option<String>, _>("bang")
            .and_then(|s| s.chars().next()),
        as_nick: row.get("as_nick"),
    }
}

const SELECT_COLUMNS: &str = "id, nonce, lane, time, account, channel, nick, user, host, command, params, text, bot_text, bang, as_nick";

/// Repository for the `message` table — the canonical ordering primitive
/// for the whole runtime (§3, §4.3).
pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MessageRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert `msg`, returning its assigned id.
    ///
    /// A duplicate `(nonce, lane)` is silently ignored (§7, §9): this is how
    /// at-least-once redelivery after a restart avoids duplicate dispatch.
    /// When the insert is swallowed as a duplicate, the existing row's id is
    /// returned instead.
    pub async fn insert(&self, msg: &BotMessage) -> Result<i64, DbError> {
        let bang = msg.bang.map(|c| c.to_string());
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message
                (nonce, lane, time, account, channel, nick, user, host, command, params, text, bot_text, bang, as_nick)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.nonce)
        .bind(msg.lane.as_i64())
        .bind(msg.time)
        .bind(&msg.address.account)
        .bind(&msg.address.channel)
        .bind(&msg.address.nick)
        .bind(&msg.address.user)
        .bind(&msg.address.host)
        .bind(&msg.command)
        .bind(params_to_json(&msg.params))
        .bind(&msg.text)
        .bind(&msg.bot_text)
        .bind(&bang)
        .bind(&msg.as_nick)
        .execute(self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        // Duplicate (nonce, lane): look up the id the first insert got.
        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM message WHERE nonce = ? AND lane = ?",
        )
        .bind(&msg.nonce)
        .bind(msg.lane.as_i64())
        .fetch_one(self.pool)
        .await?;
        Ok(id)
    }

    /// Insert a copy of `msg` onto a different lane, reusing its own nonce
    /// for the new `(nonce, lane)` pair. Used when the account manager
    /// mirrors a delivered outbound message onto the inbound lane for
    /// outgoing-handler plugins to observe (§4.5).
    pub async fn insert_as(&self, msg: &BotMessage, lane: Lane) -> Result<i64, DbError> {
        let mut copy = msg.clone();
        copy.id = None;
        copy.lane = lane;
        self.insert(&copy).await
    }

    /// Tail one lane, optionally scoped to one account, strictly after
    /// `cursor`, in ascending id order (§4.3: the canonical tailing query).
    pub async fn after(
        &self,
        lane: Lane,
        account: Option<&str>,
        cursor: i64,
        limit: i64,
    ) -> Result<Vec<BotMessage>, DbError> {
        let rows = match account {
            Some(account) => {
                sqlx::query(&format!(
                    "SELECT {SELECT_COLUMNS} FROM message WHERE lane = ? AND account = ? AND id > ? ORDER BY id LIMIT ?"
                ))
                .bind(lane.as_i64())
                .bind(account)
                .bind(cursor)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {SELECT_COLUMNS} FROM message WHERE lane = ? AND id > ? ORDER BY id LIMIT ?"
                ))
                .bind(lane.as_i64())
                .bind(cursor)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Highest `id` currently on a lane, or 0 if empty. Used to start the
    /// plugin manager's outgoing-handler tail from "now" rather than
    /// replaying the whole outbound history on every restart (§4.6).
    pub async fn max_id(&self, lane: Lane) -> Result<i64, DbError> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM message WHERE lane = ?")
            .bind(lane.as_i64())
            .fetch_one(self.pool)
            .await?;
        Ok(id.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_db() -> Database {
        Database::new(":memory:").await.unwrap()
    }

    fn sample(lane: Lane, text: &str) -> BotMessage {
        let mut msg = BotMessage::new_outgoing(
            "one",
            Address {
                account: String::new(),
                channel: "#chan".into(),
                nick: String::new(),
                user: String::new(),
                host: String::new(),
            },
            "PRIVMSG",
            text,
        );
        msg.lane = lane;
        msg
    }

    #[tokio::test]
    async fn test_insert_assigns_monotonic_ids() {
        let db = test_db().await;
        let id1 = db.messages().insert(&sample(Lane::Inbound, "a")).await.unwrap();
        let id2 = db.messages().insert(&sample(Lane::Inbound, "b")).await.unwrap();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_duplicate_nonce_lane_is_ignored() {
        let db = test_db().await;
        let msg = sample(Lane::Inbound, "a");
        let id1 = db.messages().insert(&msg).await.unwrap();
        let id2 = db.messages().insert(&msg).await.unwrap();
        assert_eq!(id1, id2);

        let rows = db.messages().after(Lane::Inbound, None, 0, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_same_nonce_different_lane_is_distinct() {
        let db = test_db().await;
        let inbound = sample(Lane::Inbound, "a");
        let mut outbound = inbound.clone();
        outbound.lane = Lane::Outbound;

        db.messages().insert(&inbound).await.unwrap();
        db.messages().insert(&outbound).await.unwrap();

        assert_eq!(db.messages().after(Lane::Inbound, None, 0, 100).await.unwrap().len(), 1);
        assert_eq!(db.messages().after(Lane::Outbound, None, 0, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_after_filters_by_account_and_cursor() {
        let db = test_db().await;
        let mut one = sample(Lane::Outbound, "a");
        one.address.account = "one".into();
        let mut two = sample(Lane::Outbound, "b");
        two.address.account = "two".into();

        let id1 = db.messages().insert(&one).await.unwrap();
        db.messages().insert(&two).await.unwrap();

        let rows = db.messages().after(Lane::Outbound, Some("one"), 0, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address.account, "one");

        let none = db.messages().after(Lane::Outbound, Some("one"), id1, 100).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_insert_as_mirrors_to_other_lane() {
        let db = test_db().await;
        let outbound = sample(Lane::Outbound, "hi");
        db.messages().insert(&outbound).await.unwrap();
        db.messages().insert_as(&outbound, Lane::Inbound).await.unwrap();

        assert_eq!(db.messages().after(Lane::Inbound, None, 0, 10).await.unwrap().len(), 1);
        assert_eq!(db.messages().after(Lane::Outbound, None, 0, 10).await.unwrap().len(), 1);
    }
}
