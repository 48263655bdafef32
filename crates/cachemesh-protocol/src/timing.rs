//! Timing profile -- default intervals and limits for both transports.
//!
//! None of these values is negotiated between nodes. Every field surfaces as
//! a tunable in the channel configs; this profile only supplies defaults.

/// Named set of transport timing and sizing defaults (milliseconds unless noted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    // -- TCP mesh --
    /// First reconnect delay after a failed dial or dropped link.
    pub tcp_reconnect_base_ms: u64,
    /// Upper bound of the exponential reconnect backoff.
    pub tcp_reconnect_max_ms: u64,
    /// Backoff exponent saturation: min(2^count, 2^cap).
    pub backoff_saturation_count: u32,
    /// Random jitter added to each backoff, in parts per thousand.
    pub reconnect_jitter_per_mille: u32,
    /// How often the connector looks for unlinked members.
    pub tcp_connector_tick_ms: u64,
    pub tcp_connect_timeout_ms: u64,
    pub tcp_handshake_timeout_ms: u64,
    /// Idle writers emit a heartbeat frame this often.
    pub tcp_heartbeat_interval_ms: u64,
    /// Readers drop a link after this long without any frame.
    pub tcp_idle_timeout_ms: u64,
    /// A single frame write slower than this marks the peer wedged.
    pub tcp_write_timeout_ms: u64,

    // -- Multicast group --
    pub multicast_heartbeat_interval_ms: u64,
    /// Peers silent for this long are dropped from the view.
    pub multicast_silence_timeout_ms: u64,
    /// Stays under a 1500-byte Ethernet MTU with IP/UDP headers.
    pub max_datagram_bytes: usize,
    pub multicast_ttl: u32,

    // -- Shared --
    /// Capacity of the channel-wide outbound queue (messages).
    pub send_queue_capacity: usize,
}

pub const DEFAULT_TIMING: TimingProfile = TimingProfile {
    tcp_reconnect_base_ms: 500,
    tcp_reconnect_max_ms: 30_000,
    backoff_saturation_count: 6,
    reconnect_jitter_per_mille: 200,
    tcp_connector_tick_ms: 250,
    tcp_connect_timeout_ms: 3_000,
    tcp_handshake_timeout_ms: 3_000,
    tcp_heartbeat_interval_ms: 2_000,
    tcp_idle_timeout_ms: 10_000,
    tcp_write_timeout_ms: 5_000,

    multicast_heartbeat_interval_ms: 1_000,
    multicast_silence_timeout_ms: 5_000,
    max_datagram_bytes: 1_400,
    multicast_ttl: 1,

    send_queue_capacity: 10_000,
};
