//! The transport protocols that carry more than 8 bytes under one PGN
//!
//! ISO 11783-3 specifies two of them: the Transport Protocol (TP, 9..=1785 bytes, broadcast or
//! destination specific) and the Extended Transport Protocol (ETP, 1786..=117_440_505 bytes,
//! destination specific only). NMEA 2000 adds the Fast Packet Protocol (9..=223 bytes, no flow
//! control at all). All three adapt a stream of 8-byte [CanFrame](crate::frame::CanFrame)s into
//! one logical [CanMessage](crate::frame::CanMessage).
//!
//! # Which ISO-TP?
//!
//! There are two distinct Transport Protocols in the ISO CAN world. There's the TP and ETP
//! defined by ISO 11783-3, and there's the "ISO-TP" defined by ISO 15765-2. The two are close
//! enough to be easily confused. It's the ISO 15765-2 ISO-TP that the Linux kernel supports,
//! which leads to confusion in the Precision Ag world, where it's the ISO 11783-3 TP and ETP
//! that matter.
use std::time::{Duration, Instant};

use crate::config::NetworkConfiguration;
use crate::network::NetworkEvent;
use crate::queue::FrameQueue;

mod etp;
mod fastpacket;
mod tp;

pub use etp::{EtpManager, MAX_ETP_BYTES, MIN_ETP_BYTES};
pub use fastpacket::{FastPacketManager, MAX_FAST_PACKET_BYTES, MIN_FAST_PACKET_BYTES};
pub use tp::{MAX_TP_BYTES, MIN_TP_BYTES, TpManager};

/// T1: maximum interval between data frames, receiver side
pub(crate) const T1_DATA_INTERVAL: Duration = Duration::from_millis(750);
/// T2: maximum wait for the first data frame after sending a CTS
pub(crate) const T2_CTS_TO_DATA: Duration = Duration::from_millis(1250);
/// T3: maximum wait for a CTS or EOMA after sending data (or the RTS)
pub(crate) const T3_DATA_TO_CTS: Duration = Duration::from_millis(1250);
/// T4: maximum interval between CTS-hold refreshes, originator side
pub(crate) const T4_HOLD: Duration = Duration::from_millis(1250);
/// Th: cadence at which a holding receiver refreshes its hold
pub(crate) const TH_HOLD_REFRESH: Duration = Duration::from_millis(500);

/// Connection abort reason codes from ISO 11783-3
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Already in one or more sessions and cannot support another
    ExistingTransportSession = 1,
    /// Out of session resources
    SystemResources = 2,
    /// A protocol timer expired
    Timeout = 3,
    /// CTS received while a data transfer was in progress
    CtsWhileTransferring = 4,
    /// Maximum retransmission limit reached
    MaxRetransmit = 5,
    /// Unexpected data transfer packet
    UnexpectedDataTransfer = 6,
    /// Bad sequence number
    BadSequenceNumber = 7,
    /// Duplicate sequence number
    DuplicateSequenceNumber = 8,
}

impl AbortReason {
    /// Decode a received reason byte; anything we don't recognise maps to `None`
    #[must_use]
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::ExistingTransportSession),
            2 => Some(Self::SystemResources),
            3 => Some(Self::Timeout),
            4 => Some(Self::CtsWhileTransferring),
            5 => Some(Self::MaxRetransmit),
            6 => Some(Self::UnexpectedDataTransfer),
            7 => Some(Self::BadSequenceNumber),
            8 => Some(Self::DuplicateSequenceNumber),
            _ => None,
        }
    }
}

/// Which end of a session we are
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Where a transport session is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Originator: the RTS (or BAM announce) still needs to go out
    SendRts,
    /// Originator: burst finished (or RTS sent); waiting for CTS or EOMA
    WaitForCtsOrEoma,
    /// Receiver: armed for a session that has not announced yet
    WaitForRts,
    /// Receiver: a CTS still needs to go out
    SendCts,
    /// Receiver: the final EOMA still needs to go out
    SendEoma,
    /// Originator: data frames are being emitted
    SendData,
    /// Receiver: inside a burst (or a broadcast reassembly)
    RxInProgress,
    Complete,
    Abort,
}

/// Everything a transport manager needs from the network for one step
pub struct TransportContext<'a> {
    pub now: Instant,
    pub config: &'a NetworkConfiguration,
    pub tx: &'a FrameQueue,
    pub events: &'a mut Vec<NetworkEvent>,
    /// TP + ETP sessions currently live on this channel, for the shared session cap
    pub live_sessions: usize,
}
