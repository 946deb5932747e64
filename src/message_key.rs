use std::net::SocketAddr;

/// Message ids are unique per sender only, so messages are identified by sender and id
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageKey {
    pub sender: SocketAddr,
    pub msg_id: u64,
}

/// The order in which a receiver prefers messages for granting: fewest bytes left to grant first,
///  then smaller messages. Ties are broken by message key to make the order total.
///
/// NB: The field order defines the derived ordering
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageRank {
    pub bytes_to_grant: u32,
    pub msg_size: u32,
    pub key: MessageKey,
}

impl MessageRank {
    /// `true` if this message has priority over `other` when competing for a priority level,
    ///  regardless of message identity
    pub fn is_preferred_to(&self, other: &MessageRank) -> bool {
        (self.bytes_to_grant, self.msg_size) <= (other.bytes_to_grant, other.msg_size)
    }
}
