//! The address of a message: which account, channel, and nick it belongs to.

/// Where a message came from, or where it's going.
///
/// `user`/`host` are carried for display and ban-style matching elsewhere but
/// never participate in [`Address::contains`] — only `account`, `channel`,
/// and `nick` define a target's scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    /// The account this message belongs to.
    pub account: String,
    /// Channel name, empty if this is a direct message.
    pub channel: String,
    /// Nick of the other party (sender on inbound, recipient on outbound DM).
    pub nick: String,
    /// Username/ident, when known.
    pub user: String,
    /// Hostname, when known.
    pub host: String,
}

impl Address {
    /// Build an address for a given account with everything else empty.
    pub fn for_account(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Self::default()
        }
    }

    /// True if `self`, used as a target's scope, contains `other`.
    ///
    /// An empty `account`/`channel`/`nick` field in `self` acts as a
    /// wildcard matching any value of that field in `other`. `user`/`host`
    /// never participate. This relation is reflexive and is a partial order
    /// (it is not symmetric: a wildcard target contains a concrete address,
    /// not the reverse).
    pub fn contains(&self, other: &Address) -> bool {
        (self.account.is_empty() || self.account == other.account)
            && (self.channel.is_empty() || self.channel == other.channel)
            && (self.nick.is_empty() || self.nick == other.nick)
    }

    /// True if this address names a channel rather than a direct nick.
    pub fn is_channel(&self) -> bool {
        !self.channel.is_empty()
    }
}
