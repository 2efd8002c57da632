//! The reconciled view of one account's configuration (§3, §4.4).

use crate::db::{AccountRecord, ChannelRecord};

/// Everything about an account that can change at runtime. Passed to
/// [`super::AccountClient::update_info`] on every reconciliation tick; the
/// client decides whether a change requires a restart (§4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountInfo {
    pub kind: String,
    pub endpoint: String,
    pub host: String,
    pub tls: bool,
    pub tls_insecure: bool,
    pub nick: String,
    pub identity: String,
    pub password: String,
    /// Desired channel membership, in no particular order.
    pub channels: Vec<ChannelRecord>,
}

impl AccountInfo {
    pub fn from_record(record: &AccountRecord, channels: Vec<ChannelRecord>) -> Self {
        Self {
            kind: record.kind.clone(),
            endpoint: record.endpoint.clone(),
            host: record.host.clone(),
            tls: record.tls,
            tls_insecure: record.tls_insecure,
            nick: record.nick.clone(),
            identity: record.identity.clone(),
            password: record.password.clone(),
            channels,
        }
    }

    /// True if `other` differs in a way the IRC client restarts for:
    /// endpoint/host, TLS settings, or password (§4.4: "IRC restarts on
    /// host/TLS/password changes; nick and channel sets reconcile in
    /// place").
    pub fn requires_irc_restart(&self, other: &AccountInfo) -> bool {
        self.endpoint != other.endpoint
            || self.host != other.host
            || self.tls != other.tls
            || self.tls_insecure != other.tls_insecure
            || self.password != other.password
    }

    /// Desired channel names, for reconciliation against the client's
    /// `active` join set (§4.4.1.1).
    pub fn channel_names(&self) -> std::collections::BTreeSet<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }
}
