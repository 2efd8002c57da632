//! LDAP endpoint repository (§3 `LDAP`, §4.9 pool reconciliation reads).

use sqlx::SqlitePool;

use super::DbError;

/// A named LDAP endpoint descriptor a plugin can open by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapRecord {
    pub name: String,
    pub url: String,
    pub base_dn: String,
    pub bind_dn: String,
    pub bind_pass: String,
}

/// Repository for the `ldap` table.
pub struct LdapRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> LdapRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// All configured LDAP endpoints, for pool reconciliation (§4.9).
    pub async fn list(&self) -> Result<Vec<LdapRecord>, DbError> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT name, url, base_dn, bind_dn, bind_pass FROM ldap ORDER BY name",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, url, base_dn, bind_dn, bind_pass)| LdapRecord {
                name,
                url,
                base_dn,
                bind_dn,
                bind_pass,
            })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<LdapRecord, DbError> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT name, url, base_dn, bind_dn, bind_pass FROM ldap WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;
        let (name, url, base_dn, bind_dn, bind_pass) =
            row.ok_or_else(|| DbError::LdapNotFound(name.to_owned()))?;
        Ok(LdapRecord {
            name,
            url,
            base_dn,
            bind_dn,
            bind_pass,
        })
    }

    #[cfg(test)]
    pub async fn upsert(&self, record: &LdapRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO ldap (name, url, base_dn, bind_dn, bind_pass) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET url = excluded.url, base_dn = excluded.base_dn,
                bind_dn = excluded.bind_dn, bind_pass = excluded.bind_pass",
        )
        .bind(&record.name)
        .bind(&record.url)
        .bind(&record.base_dn)
        .bind(&record.bind_dn)
        .bind(&record.bind_pass)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn remove(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM ldap WHERE name = ?")
            .bind(name)
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
    async fn test_upsert_and_get() {
        let db = test_db().await;
        db.ldap()
            .upsert(&LdapRecord {
                name: "corp".into(),
                url: "ldaps://ldap.example.org".into(),
                base_dn: "dc=example,dc=org".into(),
                bind_dn: "cn=mup".into(),
                bind_pass: "secret".into(),
            })
            .await
            .unwrap();

        let got = db.ldap().get("corp").await.unwrap();
        assert_eq!(got.url, "ldaps://ldap.example.org");
    }

    #[tokio::test]
    async fn test_get_missing_errors() {
        let db = test_db().await;
        assert!(matches!(db.ldap().get("ghost").await, Err(DbError::LdapNotFound(_))));
    }
}
