//! Packet counters kept by the stack.

/// Per-protocol counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoStats {
    pub sent: u64, // packets handed to an interface
    pub recv: u64, // packets accepted on input
    pub drop: u64, // packets discarded on input
}

/// Stack-wide counters, updated under the stack lock.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetStats {
    pub ipv6: ProtoStats,
    pub icmpv6: ProtoStats,
}
