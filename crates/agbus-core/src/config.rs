//! Tunable knobs for the network core
//!
//! Everything has a default; nothing is ever read from the environment.
use std::time::Duration;

/// Configuration shared by the network manager and the transport protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkConfiguration {
    /// Inter-frame gap for BAM data frames, clamped to 10..=200 ms on use
    pub minimum_tp_broadcast_interval_ms: u32,
    /// Inter-frame gap for fast packet data frames (0 = as fast as the bus permits)
    pub fast_packet_interval_ms: u32,
    /// Maximum packets per CTS burst when receiving, and the hint advertised in our RTS frames
    pub cts_window_packets: u8,
    /// Cap on concurrent TP + ETP sessions per channel
    pub max_concurrent_sessions: usize,
    /// Inbound bounded queue size
    pub rx_frame_queue_size: usize,
    /// Outbound bounded queue size
    pub tx_frame_queue_size: usize,
    /// Suggested cadence for calling [Network::update](crate::network::Network::update)
    pub periodic_update_interval_ms: u32,
    /// Address-claim contention window, T=250 ms per J1939-81
    pub address_claim_contention_ms: u32,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            minimum_tp_broadcast_interval_ms: 50,
            fast_packet_interval_ms: 0,
            cts_window_packets: 16,
            max_concurrent_sessions: 4,
            rx_frame_queue_size: 4096,
            tx_frame_queue_size: 4096,
            periodic_update_interval_ms: 4,
            address_claim_contention_ms: 250,
        }
    }
}

impl NetworkConfiguration {
    /// The BAM inter-frame gap, clamped into the range ISO 11783-3 permits
    #[must_use]
    pub fn tp_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.minimum_tp_broadcast_interval_ms.clamp(10, 200) as u64)
    }

    #[must_use]
    pub fn fast_packet_interval(&self) -> Duration {
        Duration::from_millis(self.fast_packet_interval_ms as u64)
    }

    #[must_use]
    pub fn address_claim_contention(&self) -> Duration {
        Duration::from_millis(self.address_claim_contention_ms as u64)
    }
}
