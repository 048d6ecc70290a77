//! ISO 11783-3 Transport Protocol (9..=1785 bytes)
//!
//! TP is specified in ISO 11783-3:5.10. The maximum message size is 255 packets of 7 bytes per
//! packet, giving a total of 1,785 bytes.
//!
//! There are two kinds of TP sessions
//!
//! 1. Broadcast - global broadcasts with no ECU-ECU p2p connection
//!
//!    BAM sessions are initiated by a TP.CM_BAM control flow message, followed by a series of
//!    TP.DT data transfer messages, with no flow control in between.
//!
//! 2. Point to Point - messages from one ECU to another, with control flow and connection
//!    initiation
//!
//!    Point to point TP sessions are initiated by a TP.CM_RTS request to send, and if
//!    acknowledged, followed up by a series of TP.DT messages sent in bursts whose size is
//!    defined by the periodic flow control messages from the recipient.
//!
//! and two kinds of TP PGNs
//!
//! 1. `0xEB00` - Data Transfer (TP.DT)
//! 2. `0xEC00` - Connection Management (TP.CM)
//!
//!    There are multiple kinds of TP.CM messages defined by the first byte of the message (the
//!    Control Byte):
//!
//!    1. `0x10` - Request To Send (TP.CM_RTS)
//!    2. `0x11` - Clear To Send (TP.CM_CTS)
//!    3. `0x13` - End of Message Acknowledgement (TP.CM_EndofMsgACK)
//!    4. `0x20` - Broadcast Announce Message (TP.CM_BAM)
//!    5. `0xFF` - Connection Abort (TP.Conn_Abort)
//!
//!    Other control byte values are reserved.
use byteorder::{ByteOrder, LittleEndian};

use crate::frame::{CanFrame, CanMessage};
use crate::id::CanId;
use crate::network::{NetworkEvent, SendError};
use crate::pgn::{GLOBAL_ADDRESS, TP_CONNECTION_MANAGEMENT, TP_DATA_TRANSFER, TRANSPORT_PRIORITY};
use crate::transport::{
    AbortReason, Direction, SessionState, T1_DATA_INTERVAL, T2_CTS_TO_DATA, T3_DATA_TO_CTS,
    T4_HOLD, TH_HOLD_REFRESH, TransportContext,
};

const CONTROL_RTS: u8 = 0x10;
const CONTROL_CTS: u8 = 0x11;
const CONTROL_EOMA: u8 = 0x13;
const CONTROL_BAM: u8 = 0x20;
const CONTROL_ABORT: u8 = 0xFF;

pub const MIN_TP_BYTES: usize = 9;
pub const MAX_TP_BYTES: usize = 1785;
const BYTES_PER_PACKET: usize = 7;

#[repr(transparent)]
struct TpDt(CanFrame);

impl TpDt {
    #[inline]
    #[must_use]
    fn seq_id(&self) -> u8 {
        self.0.data()[0]
    }

    #[inline]
    #[must_use]
    fn data(&self) -> &[u8] {
        &self.0.data()[1..]
    }
}

#[repr(transparent)]
struct TpCmRts(CanFrame);

impl TpCmRts {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u16 {
        LittleEndian::read_u16(&self.0.data()[1..3])
    }

    #[inline]
    #[must_use]
    fn total_message_packets(&self) -> u8 {
        self.0.data()[3]
    }

    /// Maximum number of packets the originator would like per burst; `0xFF` means no preference.
    /// The receiver may advertise a larger burst, and the originator must honour the receiver.
    #[inline]
    #[must_use]
    #[allow(unused)]
    fn max_number_packets(&self) -> u8 {
        self.0.data()[4]
    }

    /// The PGN of the message being sent
    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmCts(CanFrame);

impl TpCmCts {
    /// Number of packets the receiver is allowing the originator to send in one burst; zero holds
    /// the connection open
    #[inline]
    #[must_use]
    fn number_of_packets(&self) -> u8 {
        self.0.data()[1]
    }

    /// The next packet number the receiver is expecting
    #[inline]
    #[must_use]
    fn next_packet(&self) -> u8 {
        self.0.data()[2]
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmEndOfMsgAck(CanFrame);

impl TpCmEndOfMsgAck {
    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmConnAbort(CanFrame);

impl TpCmConnAbort {
    #[inline]
    #[must_use]
    fn abort_reason(&self) -> Option<AbortReason> {
        AbortReason::from_wire(self.0.data()[1])
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct TpCmBam(CanFrame);

impl TpCmBam {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u16 {
        LittleEndian::read_u16(&self.0.data()[1..3])
    }

    #[inline]
    #[must_use]
    fn total_message_packets(&self) -> u8 {
        self.0.data()[3]
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

/// One live TP exchange, either direction
#[derive(Debug)]
struct TpSession {
    direction: Direction,
    state: SessionState,
    pgn: u32,
    /// Originator address
    source: u8,
    /// Receiver address; global for broadcast sessions
    destination: u8,
    /// The announcing frame (RTS or BAM) for receive sessions; used to rebuild the logical
    /// message identifier
    announce: CanFrame,
    data: Vec<u8>,
    total_bytes: usize,
    total_packets: u8,
    /// 1-based sequence number of the next packet to send (tx) or expect (rx)
    next_sequence: u8,
    /// Packets left in the CTS burst currently in flight
    burst_remaining: u8,
    /// True once a CTS has crossed the wire in either direction
    established: bool,
    /// Receiver chose to pause the session (CTS with zero packets)
    hold: bool,
    last_activity: std::time::Instant,
    /// What `last_activity` is measured against
    timeout: std::time::Duration,
    /// Pacing for broadcast data frames
    last_data_time: Option<std::time::Instant>,
    /// Timestamp of the most recent frame, stamped onto the delivered message
    last_timestamp_us: Option<u64>,
}

impl TpSession {
    fn remaining_packets(&self) -> u8 {
        self.total_packets - (self.next_sequence - 1)
    }
}

/// The ISO 11783-3 Transport Protocol state machines for one channel
#[derive(Debug)]
pub struct TpManager {
    channel: u8,
    sessions: Vec<TpSession>,
}

impl TpManager {
    #[must_use]
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            sessions: Vec::new(),
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Is there a live session between this originator and receiver? Pass the global address as
    /// the receiver to look for broadcast sessions.
    #[must_use]
    pub fn has_session(&self, originator: u8, receiver: u8) -> bool {
        self.sessions
            .iter()
            .any(|s| s.source == originator && s.destination == receiver)
    }

    /// Begin transmitting a 9..=1785 byte message
    ///
    /// `destination = None` broadcasts the message with BAM pacing; otherwise an RTS/CTS session
    /// is opened with the destination.
    pub fn open_transmit(
        &mut self,
        pgn: u32,
        data: Vec<u8>,
        source: u8,
        destination: Option<u8>,
        ctx: &mut TransportContext,
    ) -> Result<(), SendError> {
        if !(MIN_TP_BYTES..=MAX_TP_BYTES).contains(&data.len()) {
            return Err(SendError::MessageSize(data.len()));
        }
        let destination = destination.unwrap_or(GLOBAL_ADDRESS);
        if self.has_session(source, destination) {
            return Err(SendError::SessionAlreadyActive);
        }
        if ctx.live_sessions >= ctx.config.max_concurrent_sessions {
            return Err(SendError::SessionLimit);
        }

        let total_bytes = data.len();
        let total_packets = total_bytes.div_ceil(BYTES_PER_PACKET) as u8;
        tracing::debug!(
            "TP tx session open: {source:#04X} -> {destination:#04X} pgn {pgn:#X} bytes {total_bytes} packets {total_packets}"
        );
        self.sessions.push(TpSession {
            direction: Direction::Transmit,
            state: SessionState::SendRts,
            pgn,
            source,
            destination,
            announce: CanFrame::default(),
            data,
            total_bytes,
            total_packets,
            next_sequence: 1,
            burst_remaining: 0,
            established: false,
            hold: false,
            last_activity: ctx.now,
            timeout: T3_DATA_TO_CTS,
            last_data_time: None,
            last_timestamp_us: None,
        });
        Ok(())
    }

    /// Route a received TP.CM or TP.DT frame into the session it belongs to
    ///
    /// Returns a fully reassembled message when the frame completes a receive session.
    pub fn process_frame(
        &mut self,
        frame: &CanFrame,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        if frame.pgn() == TP_CONNECTION_MANAGEMENT {
            if frame.dlc() != 8 {
                tracing::warn!("Malformed TP.CM frame from {:#04X}: dlc {}", frame.src(), frame.dlc());
                return None;
            }
            let control_byte = frame.data()[0];
            match control_byte {
                CONTROL_RTS => self.handle_request_to_send(TpCmRts(*frame), ctx),
                CONTROL_CTS => self.handle_clear_to_send(TpCmCts(*frame), ctx),
                CONTROL_EOMA => self.handle_end_of_message(TpCmEndOfMsgAck(*frame), ctx),
                CONTROL_BAM => self.handle_broadcast_announce(TpCmBam(*frame), ctx),
                CONTROL_ABORT => self.handle_connection_abort(TpCmConnAbort(*frame), ctx),
                reserved => {
                    tracing::warn!("TP.CM control byte {reserved:#X} is reserved; ignoring");
                    None
                }
            }
        } else if frame.pgn() == TP_DATA_TRANSFER {
            self.handle_data_transfer(TpDt(*frame), ctx)
        } else {
            None
        }
    }

    /// Advance timers, emit due frames, and tear down expired sessions
    pub fn update(&mut self, ctx: &mut TransportContext) {
        let mut i = 0;
        while i < self.sessions.len() {
            let session = &mut self.sessions[i];
            let mut remove = false;
            match session.state {
                SessionState::SendRts => {
                    Self::pump_announce(self.channel, session, ctx);
                }
                SessionState::SendData => {
                    remove = Self::pump_data(self.channel, session, ctx);
                }
                SessionState::WaitForCtsOrEoma => {
                    let limit = if session.hold { T4_HOLD } else { session.timeout };
                    if ctx.now - session.last_activity >= limit {
                        remove = true;
                        Self::fail_session(self.channel, session, AbortReason::Timeout, ctx);
                    }
                }
                SessionState::SendCts => {
                    Self::pump_cts(self.channel, session, ctx);
                }
                SessionState::SendEoma => {
                    // The message was already delivered; only the acknowledgement is owed
                    remove = Self::emit_eoma(self.channel, session, ctx);
                }
                SessionState::RxInProgress => {
                    if session.hold {
                        Self::refresh_hold(self.channel, session, ctx);
                    } else if session.destination == GLOBAL_ADDRESS {
                        if ctx.now - session.last_activity >= T1_DATA_INTERVAL {
                            tracing::warn!(
                                "BAM session from {:#04X} pgn {:#X} timed out; dropping silently",
                                session.source,
                                session.pgn
                            );
                            remove = true;
                        }
                    } else if ctx.now - session.last_activity >= session.timeout {
                        remove = true;
                        Self::fail_session(self.channel, session, AbortReason::Timeout, ctx);
                    }
                }
                _ => {}
            }
            if remove {
                self.sessions.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Pause or resume a destination-specific receive session from this originator
    ///
    /// While paused the receiver advertises CTS bursts of zero packets and refreshes the hold
    /// every 500 ms; resuming sends a real CTS immediately.
    pub fn set_receive_hold(&mut self, originator: u8, hold: bool, ctx: &mut TransportContext) {
        let channel = self.channel;
        if let Some(session) = self.sessions.iter_mut().find(|s| {
            s.direction == Direction::Receive
                && s.source == originator
                && s.destination != GLOBAL_ADDRESS
        }) {
            session.hold = hold;
            if hold {
                Self::refresh_hold(channel, session, ctx);
            } else if session.burst_remaining == 0 && session.state == SessionState::RxInProgress {
                Self::pump_cts(channel, session, ctx);
            }
        }
    }

    /// Tear down every session that has the given address as an endpoint
    ///
    /// Called when a control function is destroyed. Established destination-specific sessions
    /// get a ConnAbort; everything else disappears silently.
    pub fn cancel_endpoint(&mut self, address: u8, ctx: &mut TransportContext) {
        let channel = self.channel;
        self.sessions.retain_mut(|session| {
            if session.source != address && session.destination != address {
                return true;
            }
            Self::fail_session(channel, session, AbortReason::SystemResources, ctx);
            false
        });
    }

    fn handle_request_to_send(
        &mut self,
        rts: TpCmRts,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = rts.0;
        if frame.dst() == GLOBAL_ADDRESS {
            tracing::warn!("Ignoring TP.CM_RTS addressed to the global address from {:#04X}", frame.src());
            return None;
        }
        let total_bytes = rts.total_message_bytes() as usize;
        let total_packets = rts.total_message_packets();
        let pgn = rts.message_pgn();
        tracing::debug!(
            "TP.CM_RTS {:#04X} -> {:#04X} packets: {total_packets}, bytes: {total_bytes} pgn: {pgn:#X}",
            frame.src(),
            frame.dst()
        );
        if !(MIN_TP_BYTES..=MAX_TP_BYTES).contains(&total_bytes)
            || (total_packets as usize) * BYTES_PER_PACKET < total_bytes
        {
            tracing::warn!("Malformed TP.CM_RTS from {:#04X}: {total_bytes} bytes in {total_packets} packets", frame.src());
            return None;
        }

        // A new RTS for an originator we already have a session with either replaces the old
        // session (nothing received yet) or aborts it
        let mut replaced = false;
        if let Some(existing) = self
            .sessions
            .iter()
            .position(|s| s.source == frame.src() && s.destination == frame.dst())
        {
            let old = &mut self.sessions[existing];
            if old.direction == Direction::Receive && old.data.is_empty() {
                tracing::debug!("Replacing empty TP session from {:#04X}", frame.src());
            } else {
                Self::fail_session(
                    self.channel,
                    old,
                    AbortReason::ExistingTransportSession,
                    ctx,
                );
            }
            self.sessions.swap_remove(existing);
            replaced = true;
        }

        if !replaced && ctx.live_sessions >= ctx.config.max_concurrent_sessions {
            tracing::warn!(
                "Refusing TP.CM_RTS from {:#04X}: {} sessions live",
                frame.src(),
                ctx.live_sessions
            );
            let abort = abort_frame(
                self.channel,
                frame.dst(),
                frame.src(),
                pgn,
                AbortReason::SystemResources,
            );
            ctx.tx.try_push(abort);
            return None;
        }

        let mut session = TpSession {
            direction: Direction::Receive,
            state: SessionState::SendCts,
            pgn,
            source: frame.src(),
            destination: frame.dst(),
            announce: frame,
            data: Vec::with_capacity(total_bytes),
            total_bytes,
            total_packets,
            next_sequence: 1,
            burst_remaining: 0,
            established: false,
            hold: false,
            last_activity: ctx.now,
            timeout: T2_CTS_TO_DATA,
            last_data_time: None,
            last_timestamp_us: None,
        };
        // Answer within Tr by clearing the originator to send right away
        Self::pump_cts(self.channel, &mut session, ctx);
        self.sessions.push(session);
        None
    }

    fn handle_broadcast_announce(
        &mut self,
        bam: TpCmBam,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = bam.0;
        let total_bytes = bam.total_message_bytes() as usize;
        let total_packets = bam.total_message_packets();
        let pgn = bam.message_pgn();
        tracing::debug!(
            "TP.CM_BAM from {:#04X} packets: {total_packets}, bytes: {total_bytes} pgn: {pgn:#X}",
            frame.src()
        );
        if !(MIN_TP_BYTES..=MAX_TP_BYTES).contains(&total_bytes)
            || (total_packets as usize) * BYTES_PER_PACKET < total_bytes
        {
            tracing::warn!("Malformed TP.CM_BAM from {:#04X}: {total_bytes} bytes in {total_packets} packets", frame.src());
            return None;
        }

        // A duplicate BAM from the same source overwrites the incomplete session
        let mut replaced = false;
        if let Some(existing) = self
            .sessions
            .iter()
            .position(|s| s.source == frame.src() && s.destination == GLOBAL_ADDRESS)
        {
            tracing::warn!("Duplicate TP.CM_BAM from {:#04X}; restarting reassembly", frame.src());
            self.sessions.swap_remove(existing);
            replaced = true;
        }
        if !replaced && ctx.live_sessions >= ctx.config.max_concurrent_sessions {
            // A broadcast session can't be refused with an abort; it just isn't tracked
            tracing::warn!(
                "Dropping TP.CM_BAM from {:#04X}: {} sessions live",
                frame.src(),
                ctx.live_sessions
            );
            return None;
        }

        self.sessions.push(TpSession {
            direction: Direction::Receive,
            state: SessionState::RxInProgress,
            pgn,
            source: frame.src(),
            destination: GLOBAL_ADDRESS,
            announce: frame,
            data: Vec::with_capacity(total_bytes),
            total_bytes,
            total_packets,
            next_sequence: 1,
            burst_remaining: total_packets,
            established: false,
            hold: false,
            last_activity: ctx.now,
            timeout: T1_DATA_INTERVAL,
            last_data_time: None,
            last_timestamp_us: None,
        });
        None
    }

    fn handle_clear_to_send(
        &mut self,
        cts: TpCmCts,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = cts.0;
        let Some(index) = self.sessions.iter().position(|s| {
            s.direction == Direction::Transmit
                && s.source == frame.dst()
                && s.destination == frame.src()
                && s.pgn == cts.message_pgn()
        }) else {
            tracing::warn!(
                "Unexpected TP.CM_CTS {:#04X} <- {:#04X} pgn {:#X}",
                frame.dst(),
                frame.src(),
                cts.message_pgn()
            );
            return None;
        };
        let session = &mut self.sessions[index];
        tracing::trace!(
            "TP.CM_CTS {:#04X} <- {:#04X} seq: {:#04X} window: {} pgn: {:#X}",
            frame.dst(),
            frame.src(),
            cts.next_packet(),
            cts.number_of_packets(),
            cts.message_pgn()
        );

        if session.state == SessionState::SendData && session.burst_remaining > 0 {
            Self::fail_session(self.channel, session, AbortReason::CtsWhileTransferring, ctx);
            self.sessions.swap_remove(index);
            return None;
        }

        session.established = true;
        session.last_activity = ctx.now;
        let window = cts.number_of_packets();
        if window == 0 {
            // Hold: the receiver keeps the connection open but isn't ready for data
            session.hold = true;
            session.state = SessionState::WaitForCtsOrEoma;
            return None;
        }
        let next = cts.next_packet();
        if next == 0 || next > session.total_packets {
            Self::fail_session(self.channel, session, AbortReason::BadSequenceNumber, ctx);
            self.sessions.swap_remove(index);
            return None;
        }
        session.hold = false;
        session.next_sequence = next;
        session.burst_remaining = window.min(session.total_packets - next + 1);
        session.state = SessionState::SendData;
        None
    }

    fn handle_end_of_message(
        &mut self,
        eoma: TpCmEndOfMsgAck,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = eoma.0;
        let Some(index) = self.sessions.iter().position(|s| {
            s.direction == Direction::Transmit
                && s.source == frame.dst()
                && s.destination == frame.src()
                && s.pgn == eoma.message_pgn()
        }) else {
            tracing::warn!(
                "Unexpected TP.CM_ACK {:#04X} <- {:#04X} pgn {:#X}",
                frame.dst(),
                frame.src(),
                eoma.message_pgn()
            );
            return None;
        };
        let session = self.sessions.swap_remove(index);
        tracing::debug!(
            "TP.CM_ACK {:#04X} <- {:#04X} bytes {} pgn {:#X}",
            frame.dst(),
            frame.src(),
            session.total_bytes,
            session.pgn
        );
        ctx.events.push(NetworkEvent::TransportDone {
            channel: self.channel,
            pgn: session.pgn,
            destination: session.destination,
            ok: true,
            reason: None,
        });
        None
    }

    fn handle_connection_abort(
        &mut self,
        abort: TpCmConnAbort,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = abort.0;
        tracing::warn!(
            "TP.CM_ABRT {:#04X} <- {:#04X} reason {:?} pgn {:#X}",
            frame.dst(),
            frame.src(),
            abort.abort_reason(),
            abort.message_pgn()
        );
        let Some(index) = self.sessions.iter().position(|s| {
            s.pgn == abort.message_pgn()
                && ((s.source == frame.src() && s.destination == frame.dst())
                    || (s.source == frame.dst() && s.destination == frame.src()))
        }) else {
            return None;
        };
        let session = self.sessions.swap_remove(index);
        if session.direction == Direction::Transmit {
            ctx.events.push(NetworkEvent::TransportDone {
                channel: self.channel,
                pgn: session.pgn,
                destination: session.destination,
                ok: false,
                reason: abort.abort_reason(),
            });
        }
        None
    }

    fn handle_data_transfer(
        &mut self,
        dt: TpDt,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = dt.0;
        if frame.dlc() < 2 {
            tracing::warn!("Malformed TP.DT frame from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return None;
        }
        let Some(index) = self.sessions.iter().position(|s| {
            s.direction == Direction::Receive
                && s.source == frame.src()
                && s.destination == frame.dst()
        }) else {
            if frame.dst() != GLOBAL_ADDRESS {
                tracing::warn!(
                    "Unexpected TP.DT {:#04X} -> {:#04X} seq {:#04X} with no session",
                    frame.src(),
                    frame.dst(),
                    dt.seq_id()
                );
            }
            return None;
        };
        let broadcast = frame.dst() == GLOBAL_ADDRESS;
        let session = &mut self.sessions[index];

        if !broadcast && session.burst_remaining == 0 {
            Self::fail_session(self.channel, session, AbortReason::UnexpectedDataTransfer, ctx);
            self.sessions.swap_remove(index);
            return None;
        }
        let seq = dt.seq_id();
        if seq != session.next_sequence {
            let reason = if seq < session.next_sequence {
                AbortReason::DuplicateSequenceNumber
            } else {
                AbortReason::BadSequenceNumber
            };
            if broadcast {
                tracing::warn!(
                    "BAM sequence error from {:#04X}: got {seq}, expected {}; dropping session",
                    frame.src(),
                    session.next_sequence
                );
            } else {
                Self::fail_session(self.channel, session, reason, ctx);
            }
            self.sessions.swap_remove(index);
            return None;
        }

        // TP.DT frames are padded to the full 7 bytes with 0xFF; the padding doesn't belong to
        // the reconstructed message
        let bytes_remaining = session.total_bytes - session.data.len();
        let take = bytes_remaining.min(dt.data().len());
        session.data.extend_from_slice(&dt.data()[..take]);
        session.next_sequence += 1;
        session.burst_remaining = session.burst_remaining.saturating_sub(1);
        session.last_activity = ctx.now;
        session.timeout = T1_DATA_INTERVAL;
        session.last_timestamp_us = frame.timestamp_us.or(session.last_timestamp_us);
        tracing::trace!(
            "TP.DT     {:#04X} -> {:#04X} seq: {seq:#04X}/{:#04X} bytes: {}/{}",
            frame.src(),
            frame.dst(),
            session.total_packets,
            session.data.len(),
            session.total_bytes,
        );

        let complete = session.data.len() == session.total_bytes;
        let burst_done = session.burst_remaining == 0;

        if complete {
            let mut session = self.sessions.swap_remove(index);
            let message = Self::deliver(&mut session);
            if !broadcast {
                session.state = SessionState::SendEoma;
                if !Self::emit_eoma(self.channel, &mut session, ctx) {
                    // Queue full; keep the session alive until the acknowledgement goes out
                    self.sessions.push(session);
                }
            }
            return Some(message);
        }
        if !broadcast && burst_done {
            // Burst finished; clear the originator to send the next one
            Self::pump_cts(self.channel, &mut self.sessions[index], ctx);
        }
        None
    }

    /// Build the reassembled message out of a finished receive session
    fn deliver(session: &mut TpSession) -> CanMessage {
        let data = std::mem::take(&mut session.data);
        let mut message =
            CanMessage::assembled(session.pgn, session.announce.priority(), &session.announce, data);
        message.timestamp_us = session.last_timestamp_us.or(message.timestamp_us);
        tracing::debug!(
            "TP session complete: {:#04X} -> {:#04X} pgn {:#X} bytes {}",
            session.source,
            session.destination,
            session.pgn,
            message.data.len()
        );
        message
    }

    /// Emit the opening RTS or BAM announce
    fn pump_announce(channel: u8, session: &mut TpSession, ctx: &mut TransportContext) {
        let broadcast = session.destination == GLOBAL_ADDRESS;
        let control = if broadcast { CONTROL_BAM } else { CONTROL_RTS };
        let mut payload = [0xFFu8; 8];
        payload[0] = control;
        LittleEndian::write_u16(&mut payload[1..3], session.total_bytes as u16);
        payload[3] = session.total_packets;
        if !broadcast {
            payload[4] = ctx.config.cts_window_packets;
        }
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.source, session.destination, payload);
        if ctx.tx.try_push(frame) {
            session.last_activity = ctx.now;
            if broadcast {
                session.last_data_time = Some(ctx.now);
                session.burst_remaining = session.total_packets;
                session.state = SessionState::SendData;
            } else {
                session.timeout = T3_DATA_TO_CTS;
                session.state = SessionState::WaitForCtsOrEoma;
            }
        }
    }

    /// Emit as many data frames as the session and the outbound queue allow
    ///
    /// Returns true when the transmit session is finished and should be removed.
    fn pump_data(channel: u8, session: &mut TpSession, ctx: &mut TransportContext) -> bool {
        let broadcast = session.destination == GLOBAL_ADDRESS;
        while session.burst_remaining > 0 {
            if broadcast {
                let due = session
                    .last_data_time
                    .is_none_or(|last| ctx.now - last >= ctx.config.tp_broadcast_interval());
                if !due {
                    return false;
                }
            }
            if ctx.tx.free_space() == 0 {
                // Back-pressure: resume when the hardware drains the queue
                return false;
            }
            let seq = session.next_sequence;
            let start = (seq as usize - 1) * BYTES_PER_PACKET;
            let end = (start + BYTES_PER_PACKET).min(session.total_bytes);
            let mut payload = [0xFFu8; 8];
            payload[0] = seq;
            payload[1..1 + (end - start)].copy_from_slice(&session.data[start..end]);
            let frame = dt_frame(channel, session.source, session.destination, payload);
            if !ctx.tx.try_push(frame) {
                return false;
            }
            session.next_sequence += 1;
            session.burst_remaining -= 1;
            session.last_activity = ctx.now;
            session.last_data_time = Some(ctx.now);
            if broadcast {
                // One frame per update tick keeps the inter-frame gap honest
                break;
            }
        }

        if session.next_sequence > session.total_packets {
            if broadcast {
                ctx.events.push(NetworkEvent::TransportDone {
                    channel,
                    pgn: session.pgn,
                    destination: GLOBAL_ADDRESS,
                    ok: true,
                    reason: None,
                });
                return true;
            }
            session.state = SessionState::WaitForCtsOrEoma;
            session.timeout = T3_DATA_TO_CTS;
            session.last_activity = ctx.now;
        } else if session.burst_remaining == 0 && !broadcast {
            session.state = SessionState::WaitForCtsOrEoma;
            session.timeout = T3_DATA_TO_CTS;
            session.last_activity = ctx.now;
        }
        false
    }

    /// Emit the next CTS for a receive session (or a hold if the application paused it)
    fn pump_cts(channel: u8, session: &mut TpSession, ctx: &mut TransportContext) {
        if session.hold {
            Self::refresh_hold(channel, session, ctx);
            return;
        }
        let window = session
            .remaining_packets()
            .min(ctx.config.cts_window_packets);
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_CTS;
        payload[1] = window;
        payload[2] = session.next_sequence;
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.destination, session.source, payload);
        if ctx.tx.try_push(frame) {
            session.established = true;
            session.burst_remaining = window;
            session.last_activity = ctx.now;
            session.timeout = T2_CTS_TO_DATA;
            session.state = SessionState::RxInProgress;
        } else {
            session.state = SessionState::SendCts;
        }
    }

    /// Refresh a receive-side hold every Th
    fn refresh_hold(channel: u8, session: &mut TpSession, ctx: &mut TransportContext) {
        let due = session
            .last_data_time
            .is_none_or(|last| ctx.now - last >= TH_HOLD_REFRESH);
        if !due {
            return;
        }
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_CTS;
        payload[1] = 0;
        payload[2] = session.next_sequence;
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.destination, session.source, payload);
        if ctx.tx.try_push(frame) {
            session.established = true;
            session.burst_remaining = 0;
            // The hold refresh timer piggybacks on the broadcast pacing slot, which holds never
            // use otherwise
            session.last_data_time = Some(ctx.now);
            session.last_activity = ctx.now;
            session.state = SessionState::RxInProgress;
        }
    }

    /// Returns true once the EOMA is actually on the queue
    fn emit_eoma(channel: u8, session: &mut TpSession, ctx: &mut TransportContext) -> bool {
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_EOMA;
        LittleEndian::write_u16(&mut payload[1..3], session.total_bytes as u16);
        payload[3] = session.total_packets;
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.destination, session.source, payload);
        ctx.tx.try_push(frame)
    }

    /// Abort a session: notify the peer if a connection was established, and surface the failure
    /// for transmit sessions
    fn fail_session(
        channel: u8,
        session: &mut TpSession,
        reason: AbortReason,
        ctx: &mut TransportContext,
    ) {
        tracing::warn!(
            "TP session {:#04X} -> {:#04X} pgn {:#X} failed: {reason:?}",
            session.source,
            session.destination,
            session.pgn
        );
        if session.destination != GLOBAL_ADDRESS && session.established {
            let (us, peer) = match session.direction {
                Direction::Transmit => (session.source, session.destination),
                Direction::Receive => (session.destination, session.source),
            };
            ctx.tx.try_push(abort_frame(channel, us, peer, session.pgn, reason));
        }
        if session.direction == Direction::Transmit {
            ctx.events.push(NetworkEvent::TransportDone {
                channel,
                pgn: session.pgn,
                destination: session.destination,
                ok: false,
                reason: Some(reason),
            });
        }
    }
}

fn cm_frame(channel: u8, source: u8, destination: u8, payload: [u8; 8]) -> CanFrame {
    let id = CanId::encode(TRANSPORT_PRIORITY, TP_CONNECTION_MANAGEMENT, destination, source)
        .expect("TP.CM id is well formed");
    CanFrame::new(channel, id, &payload)
}

fn dt_frame(channel: u8, source: u8, destination: u8, payload: [u8; 8]) -> CanFrame {
    let id = CanId::encode(TRANSPORT_PRIORITY, TP_DATA_TRANSFER, destination, source)
        .expect("TP.DT id is well formed");
    CanFrame::new(channel, id, &payload)
}

fn abort_frame(channel: u8, source: u8, destination: u8, pgn: u32, reason: AbortReason) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = CONTROL_ABORT;
    payload[1] = reason as u8;
    LittleEndian::write_u24(&mut payload[5..8], pgn);
    cm_frame(channel, source, destination, payload)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::NetworkConfiguration;
    use crate::queue::FrameQueue;
    use crate::time::{Clock, ManualClock};

    struct Harness {
        manager: TpManager,
        config: NetworkConfiguration,
        tx: FrameQueue,
        events: Vec<NetworkEvent>,
        clock: ManualClock,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                manager: TpManager::new(0),
                config: NetworkConfiguration::default(),
                tx: FrameQueue::bounded(64),
                events: Vec::new(),
                clock: ManualClock::new(),
            }
        }

        fn process(&mut self, frame: CanFrame) -> Option<CanMessage> {
            let mut ctx = TransportContext {
                now: self.clock.now(),
                config: &self.config,
                tx: &self.tx,
                events: &mut self.events,
                live_sessions: self.manager.session_count(),
            };
            self.manager.process_frame(&frame, &mut ctx)
        }

        fn update(&mut self) {
            let mut ctx = TransportContext {
                now: self.clock.now(),
                config: &self.config,
                tx: &self.tx,
                events: &mut self.events,
                live_sessions: self.manager.session_count(),
            };
            self.manager.update(&mut ctx);
        }

        fn open_transmit(
            &mut self,
            pgn: u32,
            data: Vec<u8>,
            source: u8,
            destination: Option<u8>,
        ) -> Result<(), SendError> {
            let mut ctx = TransportContext {
                now: self.clock.now(),
                config: &self.config,
                tx: &self.tx,
                events: &mut self.events,
                live_sessions: self.manager.session_count(),
            };
            self.manager.open_transmit(pgn, data, source, destination, &mut ctx)
        }

        fn drain_tx(&mut self) -> Vec<CanFrame> {
            std::iter::from_fn(|| self.tx.pop()).collect()
        }
    }

    fn frame(canid: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(0, CanId::new(canid), data)
    }

    #[test]
    fn test_parse_tp_dt() {
        let dt = TpDt(frame(0x1CEB1C2A, &[0x02, 0x1E, 0x1A, 0x80, 0x24, 0x05, 0x2C, 0x69]));
        assert_eq!(dt.seq_id(), 2);
        assert_eq!(dt.data()[0], 0x1E);
        assert_eq!(dt.data()[6], 0x69);
    }

    #[test]
    fn test_parse_tp_cm_rts() {
        let rts = TpCmRts(frame(0x18EC1C2A, &[0x10, 0x4D, 0x01, 0x30, 0xFF, 0x00, 0xEF, 0x01]));
        assert_eq!(rts.total_message_bytes(), 0x014D);
        assert_eq!(rts.total_message_packets(), 0x30);
        assert_eq!(rts.max_number_packets(), 0xFF);
        assert_eq!(rts.message_pgn(), 0x1EF00);
    }

    #[test]
    fn test_parse_tp_cm_cts() {
        let cts = TpCmCts(frame(0x1CEC2A1C, &[0x11, 0x0A, 0x01, 0xFF, 0xFF, 0x00, 0xEF, 0x01]));
        assert_eq!(cts.number_of_packets(), 0x0A);
        assert_eq!(cts.next_packet(), 0x01);
        assert_eq!(cts.message_pgn(), 0x1EF00);
    }

    #[test]
    fn test_parse_tp_cm_bam() {
        let bam = TpCmBam(frame(0x18ECFF1C, &[0x20, 0x0E, 0x00, 0x02, 0xFF, 0xCA, 0xFE, 0x00]));
        assert_eq!(bam.total_message_bytes(), 0x0E);
        assert_eq!(bam.total_message_packets(), 0x02);
        assert_eq!(bam.message_pgn(), 0xFECA);
    }

    #[test]
    fn test_parse_tp_cm_abort() {
        let abort = TpCmConnAbort(frame(0x1CEC2A1C, &[0xFF, 0x03, 0xFF, 0xFF, 0xFF, 0x00, 0xEF, 0x01]));
        assert_eq!(abort.abort_reason(), Some(AbortReason::Timeout));
        assert_eq!(abort.message_pgn(), 0x1EF00);
    }

    #[test]
    fn test_bam_receive() {
        let mut h = Harness::new();
        // A 14-byte Prop B message broadcast in two packets
        let mut msg = h.process(frame(0x18ECFF1C, &[0x20, 0x0E, 0x00, 0x02, 0xFF, 0xCA, 0xFE, 0x00]));
        assert_eq!(msg, None);
        assert!(h.manager.has_session(0x1C, GLOBAL_ADDRESS));
        msg = h.process(frame(0x14EBFF1C, &[0x01, 0x00, 0xFF, 0x7B, 0x14, 0x02, 0x03, 0x0A]));
        assert_eq!(msg, None);
        msg = h.process(frame(0x14EBFF1C, &[0x02, 0xFF, 0xF3, 0x02, 0x0A, 0xF8, 0xF7, 0x02]));

        let msg = msg.unwrap();
        assert_eq!(msg.canid_checks(), (0x18FECA1C, 6, 0xFECA, 0x1C, 0xFF));
        assert_eq!(msg.data.len(), 14);
        assert_eq!(msg.data[0], 0x00);
        assert_eq!(msg.data[6], 0x0A);
        assert_eq!(msg.data[7], 0xFF);
        assert_eq!(msg.data[13], 0x02);
        // The session closes with the message
        assert!(!h.manager.has_session(0x1C, GLOBAL_ADDRESS));
        assert!(h.drain_tx().is_empty());
    }

    impl CanMessage {
        fn canid_checks(&self) -> (u32, u8, u32, u8, u8) {
            (self.id.raw(), self.priority, self.pgn, self.src, self.dst)
        }
    }

    #[test]
    fn test_bam_timeout_is_silent() {
        let mut h = Harness::new();
        h.process(frame(0x18ECFF1C, &[0x20, 0x11, 0x00, 0x03, 0xFF, 0xEC, 0xFE, 0x00]));
        h.process(frame(0x14EBFF1C, &[0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]));
        h.process(frame(0x14EBFF1C, &[0x02, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E]));
        assert_eq!(h.manager.session_count(), 1);

        h.clock.advance(Duration::from_millis(740));
        h.update();
        assert_eq!(h.manager.session_count(), 1);

        h.clock.advance(Duration::from_millis(20));
        h.update();
        assert_eq!(h.manager.session_count(), 0);
        // No abort frame, no event
        assert!(h.drain_tx().is_empty());
        assert!(h.events.is_empty());
    }

    #[test]
    fn test_destination_specific_receive() {
        let mut h = Harness::new();
        // RTS for 23 bytes of PGN 0xFEEB in 4 packets
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        assert!(h.manager.has_session(0x01, 0x02));

        // We clear the whole message in one burst (window 16 > 4 packets remaining)
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.raw(), 0x1CEC0102);
        assert_eq!(frames[0].data(), &[0x11, 0x04, 0x01, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]);

        let payload: Vec<u8> = (1..=23).collect();
        let mut msg = None;
        for seq in 1u8..=4 {
            let start = (seq as usize - 1) * 7;
            let end = (start + 7).min(23);
            let mut data = [0xFFu8; 8];
            data[0] = seq;
            data[1..1 + end - start].copy_from_slice(&payload[start..end]);
            msg = h.process(CanFrame::new(0, CanId::new(0x1CEB0201), &data));
        }
        let msg = msg.unwrap();
        assert_eq!(msg.pgn, 0xFEEB);
        assert_eq!(msg.data, payload);

        // The EOMA closes the session
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data(), &[0x13, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]);
        assert!(!h.manager.has_session(0x01, 0x02));
    }

    #[test]
    fn test_destination_specific_send_honours_cts_window() {
        let mut h = Harness::new();
        h.config.cts_window_packets = 1;
        let payload: Vec<u8> = (1..=23).collect();
        h.open_transmit(0xFEEB, payload.clone(), 0x01, Some(0x02)).unwrap();
        assert!(h.manager.has_session(0x01, 0x02));

        // Another message to the same destination is refused while the session lives
        assert!(matches!(
            h.open_transmit(0xFEEB, payload.clone(), 0x01, Some(0x02)),
            Err(SendError::SessionAlreadyActive)
        ));
        assert!(matches!(
            h.open_transmit(0xFEEC, payload.clone(), 0x01, Some(0x02)),
            Err(SendError::SessionAlreadyActive)
        ));

        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.raw(), 0x1CEC0201);
        // RTS advertising 23 bytes in 4 packets, at most 1 packet per CTS
        assert_eq!(frames[0].data(), &[0x10, 0x17, 0x00, 0x04, 0x01, 0xEB, 0xFE, 0x00]);

        // The receiver ignores our limit and clears 2 packets at a time
        h.process(frame(0x1CEC0102, &[0x11, 0x02, 0x01, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]));
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id.raw(), 0x1CEB0201);
        assert_eq!(frames[0].data(), &[0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(frames[1].data(), &[0x02, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E]);

        h.process(frame(0x1CEC0102, &[0x11, 0x02, 0x03, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]));
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data(), &[0x03, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15]);
        // The final packet is padded with 0xFF
        assert_eq!(frames[1].data(), &[0x04, 0x16, 0x17, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        // EOMA finishes the session with a success event
        h.process(frame(0x1CEC0102, &[0x13, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        assert!(!h.manager.has_session(0x01, 0x02));
        assert!(matches!(
            h.events.as_slice(),
            [NetworkEvent::TransportDone { pgn: 0xFEEB, destination: 0x02, ok: true, .. }]
        ));
    }

    #[test]
    fn test_bam_send_paces_frames() {
        let mut h = Harness::new();
        let payload: Vec<u8> = (1..=17).collect();
        h.open_transmit(0xFEEC, payload, 0x01, None).unwrap();

        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.raw(), 0x1CECFF01);
        assert_eq!(frames[0].data(), &[0x20, 0x11, 0x00, 0x03, 0xFF, 0xEC, 0xFE, 0x00]);

        // No data frame until the broadcast interval has elapsed
        h.update();
        assert!(h.drain_tx().is_empty());

        for seq in 1u8..=3 {
            h.clock.advance(Duration::from_millis(50));
            h.update();
            let frames = h.drain_tx();
            assert_eq!(frames.len(), 1, "one data frame per interval");
            assert_eq!(frames[0].data()[0], seq);
        }
        // The last frame is padded
        assert_eq!(h.manager.session_count(), 0);
        assert!(matches!(
            h.events.as_slice(),
            [NetworkEvent::TransportDone { pgn: 0xFEEC, destination: GLOBAL_ADDRESS, ok: true, .. }]
        ));
    }

    #[test]
    fn test_session_cap_refuses_rts_with_abort() {
        let mut h = Harness::new();
        h.config.max_concurrent_sessions = 1;
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        assert_eq!(h.manager.session_count(), 1);
        h.drain_tx();

        // A second originator is refused with reason 2 (out of resources)
        h.process(frame(0x1CEC0203, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        assert_eq!(h.manager.session_count(), 1);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.raw(), 0x1CEC0302);
        assert_eq!(frames[0].data(), &[0xFF, 0x02, 0xFF, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]);
    }

    #[test]
    fn test_new_rts_replaces_untouched_session() {
        let mut h = Harness::new();
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        h.drain_tx();
        // No data received yet, so a new RTS from the same originator replaces the session
        h.process(frame(0x1CEC0201, &[0x10, 0x2A, 0x00, 0x06, 0xFF, 0xEC, 0xFE, 0x00]));
        assert_eq!(h.manager.session_count(), 1);
        let frames = h.drain_tx();
        // Only a fresh CTS; no abort
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CONTROL_CTS);
        assert_eq!(frames[0].data()[1], 6);
    }

    #[test]
    fn test_bad_sequence_aborts_with_reason_7() {
        let mut h = Harness::new();
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        h.drain_tx();
        h.process(frame(0x1CEB0201, &[0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]));
        // Sequence 3 arrives where 2 was expected
        h.process(frame(0x1CEB0201, &[0x03, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15]));
        assert_eq!(h.manager.session_count(), 0);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CONTROL_ABORT);
        assert_eq!(frames[0].data()[1], AbortReason::BadSequenceNumber as u8);
    }

    #[test]
    fn test_rx_timeout_aborts_with_reason_3() {
        let mut h = Harness::new();
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        h.drain_tx();
        // The originator never sends data after our CTS
        h.clock.advance(Duration::from_millis(1300));
        h.update();
        assert_eq!(h.manager.session_count(), 0);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CONTROL_ABORT);
        assert_eq!(frames[0].data()[1], AbortReason::Timeout as u8);
    }

    #[test]
    fn test_peer_abort_fails_transmit_session() {
        let mut h = Harness::new();
        let payload: Vec<u8> = (1..=23).collect();
        h.open_transmit(0xFEEB, payload, 0x01, Some(0x02)).unwrap();
        h.update();
        h.drain_tx();
        h.process(frame(0x1CEC0102, &[0xFF, 0x01, 0xFF, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]));
        assert_eq!(h.manager.session_count(), 0);
        assert!(matches!(
            h.events.as_slice(),
            [NetworkEvent::TransportDone {
                pgn: 0xFEEB,
                destination: 0x02,
                ok: false,
                reason: Some(AbortReason::ExistingTransportSession),
                ..
            }]
        ));
    }

    #[test]
    fn test_receive_hold_refreshes_every_th() {
        let mut h = Harness::new();
        h.process(frame(0x1CEC0201, &[0x10, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]));
        h.drain_tx();

        let mut ctx = TransportContext {
            now: h.clock.now(),
            config: &h.config,
            tx: &h.tx,
            events: &mut h.events,
            live_sessions: 1,
        };
        h.manager.set_receive_hold(0x01, true, &mut ctx);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CONTROL_CTS);
        assert_eq!(frames[0].data()[1], 0, "hold advertises a zero-packet burst");

        // The hold refreshes every 500ms while the session is paused
        h.clock.advance(Duration::from_millis(499));
        h.update();
        assert!(h.drain_tx().is_empty());
        h.clock.advance(Duration::from_millis(1));
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[1], 0);

        // Releasing the hold clears the originator to send
        let mut ctx = TransportContext {
            now: h.clock.now(),
            config: &h.config,
            tx: &h.tx,
            events: &mut h.events,
            live_sessions: 1,
        };
        h.manager.set_receive_hold(0x01, false, &mut ctx);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[1], 4);
    }

    #[test]
    fn test_transmit_tolerates_cts_hold() {
        let mut h = Harness::new();
        let payload: Vec<u8> = (1..=23).collect();
        h.open_transmit(0xFEEB, payload, 0x01, Some(0x02)).unwrap();
        h.update();
        h.drain_tx();

        // The receiver holds; T3 would have expired but T4 governs held sessions
        h.process(frame(0x1CEC0102, &[0x11, 0x00, 0x01, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]));
        h.clock.advance(Duration::from_millis(1200));
        h.update();
        assert_eq!(h.manager.session_count(), 1);

        // Each refresh restarts T4
        h.process(frame(0x1CEC0102, &[0x11, 0x00, 0x01, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]));
        h.clock.advance(Duration::from_millis(1200));
        h.update();
        assert_eq!(h.manager.session_count(), 1);

        // Until no refresh arrives within T4
        h.clock.advance(Duration::from_millis(100));
        h.update();
        assert_eq!(h.manager.session_count(), 0);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[1], AbortReason::Timeout as u8);
    }
}
