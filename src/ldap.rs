//! LDAP connection pool (§3 `LDAP`, §4.9): reconciles a set of named LDAP
//! endpoints against the `ldap` table in lockstep with the plugin manager's
//! own refresh tick, and loans handles out to plugins by name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::db::{Database, DbError, LdapRecord};

/// Errors a plugin sees from [`LdapPool::get`].
#[derive(Debug, Error)]
pub enum LdapError {
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("no ldap endpoint named {0:?}")]
    NotFound(String),
    #[error("dial failed for {name:?}: {source}")]
    Dial {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// What a plugin actually gets back from [`LdapPool::get`]: a leased
/// connection handle it is expected to close when done.
pub struct LdapHandle {
    pub name: String,
    conn: Arc<dyn LdapConn>,
}

impl LdapHandle {
    /// Run a simple bound search, delegating to the underlying connection.
    /// This is the one operation every `LdapConn` impl (real or faked)
    /// supports; richer query shapes can be added as plugins need them.
    pub async fn search(&self, filter: &str) -> Result<Vec<String>, anyhow::Error> {
        self.conn.search(filter).await
    }

    /// Release the handle. A no-op for pooled connections today, but kept
    /// as an explicit call so the plugin contract (§4.9: "receives a
    /// leased handle it must close") has a place to grow connection
    /// checkout/checkin accounting later without changing plugin code.
    pub fn close(self) {}
}

/// The pluggable dial behavior behind one named LDAP endpoint. Production
/// code dials a real `ldap3` connection; tests substitute an in-memory
/// fake (§4.9: "Dial is pluggable").
#[async_trait::async_trait]
pub trait LdapConn: Send + Sync {
    async fn search(&self, filter: &str) -> Result<Vec<String>, anyhow::Error>;
}

/// A real `ldap3` connection, bound once at dial time.
struct Ldap3Conn {
    record: LdapRecord,
}

#[async_trait::async_trait]
impl LdapConn for Ldap3Conn {
    async fn search(&self, filter: &str) -> Result<Vec<String>, anyhow::Error> {
        use ldap3::{LdapConnAsync, Scope, SearchEntry};

        let (conn, mut ldap) = LdapConnAsync::new(&self.record.url).await?;
        ldap3::drive!(conn);

        if !self.record.bind_dn.is_empty() {
            ldap.simple_bind(&self.record.bind_dn, &self.record.bind_pass)
                .await?
                .success()?;
        }

        let (entries, _res) = ldap
            .search(&self.record.base_dn, Scope::Subtree, filter, vec!["dn"])
            .await?
            .success()?;

        let names = entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|e| e.dn)
            .collect();

        ldap.unbind().await?;
        Ok(names)
    }
}

/// A dial function: given the record, produce a connection. Swappable in
/// tests to avoid a real network dependency.
pub type DialFn = Arc<dyn Fn(LdapRecord) -> Arc<dyn LdapConn> + Send + Sync>;

fn default_dial() -> DialFn {
    Arc::new(|record| Arc::new(Ldap3Conn { record }) as Arc<dyn LdapConn>)
}

struct PooledConn {
    record: LdapRecord,
    conn: Arc<dyn LdapConn>,
}

/// Owns the live set of named LDAP connections, reconciled against the
/// `ldap` table (§4.9).
pub struct LdapPool {
    db: Database,
    dial: DialFn,
    conns: Mutex<HashMap<String, PooledConn>>,
}

impl LdapPool {
    pub fn new(db: Database) -> Arc<Self> {
        Self::with_dial(db, default_dial())
    }

    /// Construct with a test-supplied dial function (§4.9).
    pub fn with_dial(db: Database, dial: DialFn) -> Arc<Self> {
        Arc::new(Self {
            db,
            dial,
            conns: Mutex::new(HashMap::new()),
        })
    }

    /// Reconcile live connections against the store: open a connection per
    /// `ldap` row, restart one whose URL or credentials changed, and close
    /// connections for rows that disappeared.
    pub async fn refresh(&self) {
        let records = match self.db.ldap().list().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list ldap endpoints, skipping this refresh");
                return;
            }
        };

        let desired: HashMap<String, LdapRecord> =
            records.into_iter().map(|r| (r.name.clone(), r)).collect();

        let mut conns = self.conns.lock();

        conns.retain(|name, _| {
            let keep = desired.contains_key(name);
            if !keep {
                tracing::info!(ldap = %name, "closing removed ldap endpoint");
            }
            keep
        });

        for (name, record) in desired {
            let needs_restart = match conns.get(&name) {
                Some(existing) => {
                    existing.record.url != record.url
                        || existing.record.bind_dn != record.bind_dn
                        || existing.record.bind_pass != record.bind_pass
                }
                None => true,
            };
            if needs_restart {
                tracing::info!(ldap = %name, url = %record.url, "(re)opening ldap endpoint");
                let conn = (self.dial)(record.clone());
                conns.insert(name, PooledConn { record, conn });
            }
        }
    }

    /// Loan out a handle to the connection named `name` (§4.9).
    pub fn get(&self, name: &str) -> Result<LdapHandle, LdapError> {
        let conns = self.conns.lock();
        let pooled = conns
            .get(name)
            .ok_or_else(|| LdapError::NotFound(name.to_owned()))?;
        Ok(LdapHandle {
            name: name.to_owned(),
            conn: pooled.conn.clone(),
        })
    }
}
