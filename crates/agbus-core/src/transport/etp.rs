//! ISO 11783-3 Extended Transport Protocol (1786..=117,440,505 bytes)
//!
//! ETP is specified in ISO 11783-3:5.11. It is destination specific only; there is no broadcast
//! variant. The maximum message size is 2^24-1 packets of 7 bytes per packet, giving a total of
//! 117,440,505 bytes.
//!
//! ETP uses two PGNs
//!
//! 1. `0xC700` - Data Transfer (ETP.DT)
//! 2. `0xC800` - Connection Management (ETP.CM), multiplexed by the first byte:
//!
//!    1. `0x14` - Request To Send (ETP.CM_RTS)
//!    2. `0x15` - Clear To Send (ETP.CM_CTS)
//!    3. `0x16` - Data Packet Offset (ETP.CM_DPO)
//!    4. `0x17` - End of Message Acknowledgement (ETP.CM_EOMA)
//!    5. `0xFF` - Connection Abort (ETP.Conn_Abort)
//!
//! The one-byte sequence number in ETP.DT frames only counts within a burst; the originator
//! declares the absolute position of each burst with a DPO ahead of it, so the absolute packet
//! number of a data frame is `dpo_offset + sequence`.
use byteorder::{ByteOrder, LittleEndian};

use crate::frame::{CanFrame, CanMessage};
use crate::id::CanId;
use crate::network::{NetworkEvent, SendError};
use crate::pgn::{
    ETP_CONNECTION_MANAGEMENT, ETP_DATA_TRANSFER, GLOBAL_ADDRESS, TRANSPORT_PRIORITY,
};
use crate::transport::{
    AbortReason, Direction, SessionState, T1_DATA_INTERVAL, T2_CTS_TO_DATA, T3_DATA_TO_CTS,
    T4_HOLD, TransportContext,
};

const CONTROL_RTS: u8 = 0x14;
const CONTROL_CTS: u8 = 0x15;
const CONTROL_DPO: u8 = 0x16;
const CONTROL_EOMA: u8 = 0x17;
const CONTROL_ABORT: u8 = 0xFF;

pub const MIN_ETP_BYTES: usize = 1786;
pub const MAX_ETP_BYTES: usize = 117_440_505;
const BYTES_PER_PACKET: usize = 7;

#[repr(transparent)]
struct EtpDt(CanFrame);

impl EtpDt {
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
struct EtpCmRts(CanFrame);

impl EtpCmRts {
    #[inline]
    #[must_use]
    fn total_message_bytes(&self) -> u32 {
        LittleEndian::read_u32(&self.0.data()[1..5])
    }

    /// The PGN of the message being sent
    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct EtpCmCts(CanFrame);

impl EtpCmCts {
    /// Number of packets the receiver will accept in the next burst; zero holds the connection
    #[inline]
    #[must_use]
    fn number_of_packets(&self) -> u8 {
        self.0.data()[1]
    }

    /// The absolute (1-based, 24-bit) packet number the receiver expects next
    #[inline]
    #[must_use]
    fn next_packet(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[2..5])
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct EtpCmDpo(CanFrame);

impl EtpCmDpo {
    /// Packets in the burst this offset applies to
    #[inline]
    #[must_use]
    fn number_of_packets(&self) -> u8 {
        self.0.data()[1]
    }

    /// Absolute packet index the following burst's sequence numbers are relative to
    #[inline]
    #[must_use]
    fn packet_offset(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[2..5])
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct EtpCmEoma(CanFrame);

impl EtpCmEoma {
    #[inline]
    #[must_use]
    #[allow(unused)]
    fn total_message_bytes(&self) -> u32 {
        LittleEndian::read_u32(&self.0.data()[1..5])
    }

    #[inline]
    #[must_use]
    fn message_pgn(&self) -> u32 {
        LittleEndian::read_u24(&self.0.data()[5..8])
    }
}

#[repr(transparent)]
struct EtpCmConnAbort(CanFrame);

impl EtpCmConnAbort {
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

/// One live ETP exchange, either direction
#[derive(Debug)]
struct EtpSession {
    direction: Direction,
    state: SessionState,
    pgn: u32,
    /// Originator address
    source: u8,
    /// Receiver address
    destination: u8,
    announce: CanFrame,
    data: Vec<u8>,
    total_bytes: usize,
    total_packets: u32,
    /// Absolute 1-based packet number of the next packet to send (tx) or expect (rx)
    next_packet: u32,
    /// Packets left in the burst currently in flight
    burst_remaining: u8,
    /// The offset declared by the DPO governing the current burst
    dpo_offset: u32,
    /// Rx: the DPO for the current burst has been seen; tx: the DPO still needs to go out
    dpo_pending: bool,
    /// The burst size of the last CTS we saw or sent
    last_cts_packets: u8,
    established: bool,
    hold: bool,
    last_activity: std::time::Instant,
    timeout: std::time::Duration,
    last_timestamp_us: Option<u64>,
}

impl EtpSession {
    fn packets_received(&self) -> u32 {
        self.next_packet - 1
    }

    fn remaining_packets(&self) -> u32 {
        self.total_packets - (self.next_packet - 1)
    }
}

/// The ISO 11783-3 Extended Transport Protocol state machines for one channel
#[derive(Debug)]
pub struct EtpManager {
    channel: u8,
    sessions: Vec<EtpSession>,
}

impl EtpManager {
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

    #[must_use]
    pub fn has_session(&self, originator: u8, receiver: u8) -> bool {
        self.sessions
            .iter()
            .any(|s| s.source == originator && s.destination == receiver)
    }

    /// Begin transmitting a 1786..=117,440,505 byte message to a specific destination
    pub fn open_transmit(
        &mut self,
        pgn: u32,
        data: Vec<u8>,
        source: u8,
        destination: u8,
        ctx: &mut TransportContext,
    ) -> Result<(), SendError> {
        if !(MIN_ETP_BYTES..=MAX_ETP_BYTES).contains(&data.len()) {
            return Err(SendError::MessageSize(data.len()));
        }
        if destination == GLOBAL_ADDRESS {
            return Err(SendError::CannotBroadcastLarge);
        }
        if self.has_session(source, destination) {
            return Err(SendError::SessionAlreadyActive);
        }
        if ctx.live_sessions >= ctx.config.max_concurrent_sessions {
            return Err(SendError::SessionLimit);
        }

        let total_bytes = data.len();
        let total_packets = total_bytes.div_ceil(BYTES_PER_PACKET) as u32;
        tracing::debug!(
            "ETP tx session open: {source:#04X} -> {destination:#04X} pgn {pgn:#X} bytes {total_bytes} packets {total_packets}"
        );
        self.sessions.push(EtpSession {
            direction: Direction::Transmit,
            state: SessionState::SendRts,
            pgn,
            source,
            destination,
            announce: CanFrame::default(),
            data,
            total_bytes,
            total_packets,
            next_packet: 1,
            burst_remaining: 0,
            dpo_offset: 0,
            dpo_pending: false,
            last_cts_packets: 0,
            established: false,
            hold: false,
            last_activity: ctx.now,
            timeout: T3_DATA_TO_CTS,
            last_timestamp_us: None,
        });
        Ok(())
    }

    /// Route a received ETP.CM or ETP.DT frame into the session it belongs to
    pub fn process_frame(
        &mut self,
        frame: &CanFrame,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        if frame.pgn() == ETP_CONNECTION_MANAGEMENT {
            if frame.dlc() != 8 {
                tracing::warn!("Malformed ETP.CM frame from {:#04X}: dlc {}", frame.src(), frame.dlc());
                return None;
            }
            let control_byte = frame.data()[0];
            match control_byte {
                CONTROL_RTS => self.handle_request_to_send(EtpCmRts(*frame), ctx),
                CONTROL_CTS => self.handle_clear_to_send(EtpCmCts(*frame), ctx),
                CONTROL_DPO => self.handle_data_packet_offset(EtpCmDpo(*frame), ctx),
                CONTROL_EOMA => self.handle_end_of_message(EtpCmEoma(*frame), ctx),
                CONTROL_ABORT => self.handle_connection_abort(EtpCmConnAbort(*frame), ctx),
                reserved => {
                    tracing::warn!("ETP.CM control byte {reserved:#X} is reserved; ignoring");
                    None
                }
            }
        } else if frame.pgn() == ETP_DATA_TRANSFER {
            self.handle_data_transfer(EtpDt(*frame), ctx)
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
                    Self::pump_rts(self.channel, session, ctx);
                }
                SessionState::SendData => {
                    Self::pump_data(self.channel, session, ctx);
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
                    remove = Self::emit_eoma(self.channel, session, ctx);
                }
                SessionState::RxInProgress => {
                    if ctx.now - session.last_activity >= session.timeout {
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

    /// Tear down every session that has the given address as an endpoint
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
        rts: EtpCmRts,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = rts.0;
        if frame.dst() == GLOBAL_ADDRESS {
            tracing::warn!("Ignoring ETP.CM_RTS addressed to the global address from {:#04X}", frame.src());
            return None;
        }
        let total_bytes = rts.total_message_bytes() as usize;
        let pgn = rts.message_pgn();
        tracing::debug!(
            "ETP.CM_RTS {:#04X} -> {:#04X} bytes: {total_bytes} pgn: {pgn:#X}",
            frame.src(),
            frame.dst()
        );
        if !(MIN_ETP_BYTES..=MAX_ETP_BYTES).contains(&total_bytes) {
            tracing::warn!("Malformed ETP.CM_RTS from {:#04X}: {total_bytes} bytes", frame.src());
            return None;
        }

        let mut replaced = false;
        if let Some(existing) = self
            .sessions
            .iter()
            .position(|s| s.source == frame.src() && s.destination == frame.dst())
        {
            let old = &mut self.sessions[existing];
            if old.direction == Direction::Receive && old.data.is_empty() {
                tracing::debug!("Replacing empty ETP session from {:#04X}", frame.src());
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
                "Refusing ETP.CM_RTS from {:#04X}: {} sessions live",
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

        let total_packets = total_bytes.div_ceil(BYTES_PER_PACKET) as u32;
        let mut session = EtpSession {
            direction: Direction::Receive,
            state: SessionState::SendCts,
            pgn,
            source: frame.src(),
            destination: frame.dst(),
            announce: frame,
            data: Vec::with_capacity(total_bytes),
            total_bytes,
            total_packets,
            next_packet: 1,
            burst_remaining: 0,
            dpo_offset: 0,
            dpo_pending: false,
            last_cts_packets: 0,
            established: false,
            hold: false,
            last_activity: ctx.now,
            timeout: T2_CTS_TO_DATA,
            last_timestamp_us: None,
        };
        Self::pump_cts(self.channel, &mut session, ctx);
        self.sessions.push(session);
        None
    }

    fn handle_clear_to_send(
        &mut self,
        cts: EtpCmCts,
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
                "Unexpected ETP.CM_CTS {:#04X} <- {:#04X} pgn {:#X}",
                frame.dst(),
                frame.src(),
                cts.message_pgn()
            );
            return None;
        };
        let session = &mut self.sessions[index];
        tracing::trace!(
            "ETP.CM_CTS {:#04X} <- {:#04X} next: {} window: {} pgn: {:#X}",
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
        session.next_packet = next;
        session.last_cts_packets = window;
        session.burst_remaining =
            (window as u32).min(session.total_packets - next + 1) as u8;
        session.dpo_offset = next - 1;
        session.dpo_pending = true;
        session.state = SessionState::SendData;
        None
    }

    fn handle_data_packet_offset(
        &mut self,
        dpo: EtpCmDpo,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = dpo.0;
        let Some(index) = self.sessions.iter().position(|s| {
            s.direction == Direction::Receive
                && s.source == frame.src()
                && s.destination == frame.dst()
                && s.pgn == dpo.message_pgn()
        }) else {
            tracing::warn!(
                "Unexpected ETP.CM_DPO {:#04X} -> {:#04X} pgn {:#X}",
                frame.src(),
                frame.dst(),
                dpo.message_pgn()
            );
            return None;
        };
        let session = &mut self.sessions[index];
        let offset = dpo.packet_offset();
        if offset != session.packets_received() {
            // The burst would start somewhere other than where the transfer stands
            Self::fail_session(self.channel, session, AbortReason::UnexpectedDataTransfer, ctx);
            self.sessions.swap_remove(index);
            return None;
        }
        session.dpo_offset = offset;
        session.burst_remaining = dpo
            .number_of_packets()
            .min(session.last_cts_packets);
        session.dpo_pending = false;
        session.last_activity = ctx.now;
        tracing::trace!(
            "ETP.CM_DPO {:#04X} -> {:#04X} offset {} packets {}",
            frame.src(),
            frame.dst(),
            offset,
            session.burst_remaining
        );
        None
    }

    fn handle_end_of_message(
        &mut self,
        eoma: EtpCmEoma,
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
                "Unexpected ETP.CM_EOMA {:#04X} <- {:#04X} pgn {:#X}",
                frame.dst(),
                frame.src(),
                eoma.message_pgn()
            );
            return None;
        };
        let session = self.sessions.swap_remove(index);
        tracing::debug!(
            "ETP.CM_EOMA {:#04X} <- {:#04X} bytes {} pgn {:#X}",
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
        abort: EtpCmConnAbort,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = abort.0;
        tracing::warn!(
            "ETP.Conn_Abort {:#04X} <- {:#04X} reason {:?} pgn {:#X}",
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
        dt: EtpDt,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        let frame = dt.0;
        if frame.dlc() < 2 {
            tracing::warn!("Malformed ETP.DT frame from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return None;
        }
        let Some(index) = self.sessions.iter().position(|s| {
            s.direction == Direction::Receive
                && s.source == frame.src()
                && s.destination == frame.dst()
        }) else {
            tracing::warn!(
                "Unexpected ETP.DT {:#04X} -> {:#04X} seq {:#04X} with no session",
                frame.src(),
                frame.dst(),
                dt.seq_id()
            );
            return None;
        };
        let session = &mut self.sessions[index];

        // Data before a DPO (or past the declared burst) is a protocol violation
        if session.burst_remaining == 0 {
            Self::fail_session(self.channel, session, AbortReason::UnexpectedDataTransfer, ctx);
            self.sessions.swap_remove(index);
            return None;
        }
        let absolute = session.dpo_offset + dt.seq_id() as u32;
        if absolute != session.next_packet {
            let reason = if absolute < session.next_packet {
                AbortReason::DuplicateSequenceNumber
            } else {
                AbortReason::BadSequenceNumber
            };
            Self::fail_session(self.channel, session, reason, ctx);
            self.sessions.swap_remove(index);
            return None;
        }

        let bytes_remaining = session.total_bytes - session.data.len();
        let take = bytes_remaining.min(dt.data().len());
        session.data.extend_from_slice(&dt.data()[..take]);
        session.next_packet += 1;
        session.burst_remaining -= 1;
        session.last_activity = ctx.now;
        session.timeout = T1_DATA_INTERVAL;
        session.last_timestamp_us = frame.timestamp_us.or(session.last_timestamp_us);

        let complete = session.data.len() == session.total_bytes;
        let burst_done = session.burst_remaining == 0;

        if complete {
            let mut session = self.sessions.swap_remove(index);
            let message = Self::deliver(&mut session);
            session.state = SessionState::SendEoma;
            if !Self::emit_eoma(self.channel, &mut session, ctx) {
                self.sessions.push(session);
            }
            return Some(message);
        }
        if burst_done {
            Self::pump_cts(self.channel, &mut self.sessions[index], ctx);
        }
        None
    }

    fn deliver(session: &mut EtpSession) -> CanMessage {
        let data = std::mem::take(&mut session.data);
        let mut message =
            CanMessage::assembled(session.pgn, session.announce.priority(), &session.announce, data);
        message.timestamp_us = session.last_timestamp_us.or(message.timestamp_us);
        tracing::debug!(
            "ETP session complete: {:#04X} -> {:#04X} pgn {:#X} bytes {}",
            session.source,
            session.destination,
            session.pgn,
            message.data.len()
        );
        message
    }

    fn pump_rts(channel: u8, session: &mut EtpSession, ctx: &mut TransportContext) {
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_RTS;
        LittleEndian::write_u32(&mut payload[1..5], session.total_bytes as u32);
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.source, session.destination, payload);
        if ctx.tx.try_push(frame) {
            session.last_activity = ctx.now;
            session.timeout = T3_DATA_TO_CTS;
            session.state = SessionState::WaitForCtsOrEoma;
        }
    }

    /// Emit the DPO for the current burst (if still owed) and then data frames as the queue allows
    fn pump_data(channel: u8, session: &mut EtpSession, ctx: &mut TransportContext) {
        if session.dpo_pending {
            let mut payload = [0xFFu8; 8];
            payload[0] = CONTROL_DPO;
            payload[1] = session.burst_remaining;
            LittleEndian::write_u24(&mut payload[2..5], session.dpo_offset);
            LittleEndian::write_u24(&mut payload[5..8], session.pgn);
            let frame = cm_frame(channel, session.source, session.destination, payload);
            if !ctx.tx.try_push(frame) {
                return;
            }
            session.dpo_pending = false;
            session.last_activity = ctx.now;
        }
        while session.burst_remaining > 0 {
            if ctx.tx.free_space() == 0 {
                // Back-pressure: resume when the hardware drains the queue
                return;
            }
            let seq = (session.next_packet - session.dpo_offset) as u8;
            let start = (session.next_packet as usize - 1) * BYTES_PER_PACKET;
            let end = (start + BYTES_PER_PACKET).min(session.total_bytes);
            let mut payload = [0xFFu8; 8];
            payload[0] = seq;
            payload[1..1 + (end - start)].copy_from_slice(&session.data[start..end]);
            let frame = dt_frame(channel, session.source, session.destination, payload);
            if !ctx.tx.try_push(frame) {
                return;
            }
            session.next_packet += 1;
            session.burst_remaining -= 1;
            session.last_activity = ctx.now;
        }
        session.state = SessionState::WaitForCtsOrEoma;
        session.timeout = T3_DATA_TO_CTS;
        session.last_activity = ctx.now;
    }

    fn pump_cts(channel: u8, session: &mut EtpSession, ctx: &mut TransportContext) {
        let window = session.remaining_packets().min(0xFF) as u8;
        let window = window.min(ctx.config.cts_window_packets);
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_CTS;
        payload[1] = window;
        LittleEndian::write_u24(&mut payload[2..5], session.next_packet);
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.destination, session.source, payload);
        if ctx.tx.try_push(frame) {
            session.established = true;
            session.last_cts_packets = window;
            session.burst_remaining = 0; // armed by the DPO that precedes the burst
            session.dpo_pending = true;
            session.last_activity = ctx.now;
            session.timeout = T2_CTS_TO_DATA;
            session.state = SessionState::RxInProgress;
        } else {
            session.state = SessionState::SendCts;
        }
    }

    fn emit_eoma(channel: u8, session: &mut EtpSession, ctx: &mut TransportContext) -> bool {
        let mut payload = [0xFFu8; 8];
        payload[0] = CONTROL_EOMA;
        LittleEndian::write_u32(&mut payload[1..5], session.total_bytes as u32);
        LittleEndian::write_u24(&mut payload[5..8], session.pgn);
        let frame = cm_frame(channel, session.destination, session.source, payload);
        ctx.tx.try_push(frame)
    }

    fn fail_session(
        channel: u8,
        session: &mut EtpSession,
        reason: AbortReason,
        ctx: &mut TransportContext,
    ) {
        tracing::warn!(
            "ETP session {:#04X} -> {:#04X} pgn {:#X} failed: {reason:?}",
            session.source,
            session.destination,
            session.pgn
        );
        if session.established {
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
    let id = CanId::encode(TRANSPORT_PRIORITY, ETP_CONNECTION_MANAGEMENT, destination, source)
        .expect("ETP.CM id is well formed");
    CanFrame::new(channel, id, &payload)
}

fn dt_frame(channel: u8, source: u8, destination: u8, payload: [u8; 8]) -> CanFrame {
    let id = CanId::encode(TRANSPORT_PRIORITY, ETP_DATA_TRANSFER, destination, source)
        .expect("ETP.DT id is well formed");
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
        manager: EtpManager,
        config: NetworkConfiguration,
        tx: FrameQueue,
        events: Vec<NetworkEvent>,
        clock: ManualClock,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                manager: EtpManager::new(0),
                config: NetworkConfiguration::default(),
                tx: FrameQueue::bounded(512),
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

        fn drain_tx(&mut self) -> Vec<CanFrame> {
            std::iter::from_fn(|| self.tx.pop()).collect()
        }
    }

    fn frame(canid: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(0, CanId::new(canid), data)
    }

    #[test]
    fn test_parse_etp_cm_rts() {
        let rts = EtpCmRts(frame(0x1CC80201, &[0x14, 0xA0, 0x86, 0x01, 0x00, 0xEB, 0xFE, 0x00]));
        assert_eq!(rts.total_message_bytes(), 100_000);
        assert_eq!(rts.message_pgn(), 0xFEEB);
    }

    #[test]
    fn test_parse_etp_cm_cts() {
        let cts = EtpCmCts(frame(0x1CC80102, &[0x15, 0x10, 0x01, 0x02, 0x00, 0xEB, 0xFE, 0x00]));
        assert_eq!(cts.number_of_packets(), 0x10);
        assert_eq!(cts.next_packet(), 0x0201);
        assert_eq!(cts.message_pgn(), 0xFEEB);
    }

    #[test]
    fn test_parse_etp_cm_dpo() {
        let dpo = EtpCmDpo(frame(0x1CC80201, &[0x16, 0x10, 0x00, 0x02, 0x00, 0xEB, 0xFE, 0x00]));
        assert_eq!(dpo.number_of_packets(), 0x10);
        assert_eq!(dpo.packet_offset(), 0x0200);
        assert_eq!(dpo.message_pgn(), 0xFEEB);
    }

    /// Drive a complete receive session and return the reassembled message
    fn receive_etp(h: &mut Harness, payload: &[u8]) -> CanMessage {
        let total_packets = payload.len().div_ceil(7) as u32;
        let mut rts = [0u8; 8];
        rts[0] = CONTROL_RTS;
        LittleEndian::write_u32(&mut rts[1..5], payload.len() as u32);
        LittleEndian::write_u24(&mut rts[5..8], 0xFEEB);
        h.process(frame(0x1CC80201, &rts));

        let mut received = 0u32;
        loop {
            // Expect a CTS for the next burst
            let frames = h.drain_tx();
            assert_eq!(frames.len(), 1);
            let cts = EtpCmCts(frames[0]);
            assert_eq!(cts.0.data()[0], CONTROL_CTS);
            assert_eq!(cts.next_packet(), received + 1);
            let burst = cts.number_of_packets() as u32;
            assert!(burst > 0);

            // Announce the burst position, then send it
            let mut dpo = [0u8; 8];
            dpo[0] = CONTROL_DPO;
            dpo[1] = burst as u8;
            LittleEndian::write_u24(&mut dpo[2..5], received);
            LittleEndian::write_u24(&mut dpo[5..8], 0xFEEB);
            h.process(frame(0x1CC80201, &dpo));

            for seq in 1..=burst {
                let packet = received + seq;
                let start = (packet as usize - 1) * 7;
                let end = (start + 7).min(payload.len());
                let mut data = [0xFFu8; 8];
                data[0] = seq as u8;
                data[1..1 + end - start].copy_from_slice(&payload[start..end]);
                let msg = h.process(frame(0x1CC70201, &data));
                if packet == total_packets {
                    let frames = h.drain_tx();
                    assert_eq!(frames.len(), 1);
                    assert_eq!(frames[0].data()[0], CONTROL_EOMA);
                    assert_eq!(
                        LittleEndian::read_u32(&frames[0].data()[1..5]),
                        payload.len() as u32
                    );
                    return msg.unwrap();
                }
                assert_eq!(msg, None);
            }
            received += burst;
        }
    }

    #[test]
    fn test_receive_session() {
        let mut h = Harness::new();
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let msg = receive_etp(&mut h, &payload);
        assert_eq!(msg.pgn, 0xFEEB);
        assert_eq!(msg.src, 0x01);
        assert_eq!(msg.dst, 0x02);
        assert_eq!(msg.data, payload);
        assert_eq!(h.manager.session_count(), 0);
    }

    #[test]
    fn test_data_without_dpo_aborts_with_reason_6() {
        let mut h = Harness::new();
        let mut rts = [0u8; 8];
        rts[0] = CONTROL_RTS;
        LittleEndian::write_u32(&mut rts[1..5], 2000);
        LittleEndian::write_u24(&mut rts[5..8], 0xFEEB);
        h.process(frame(0x1CC80201, &rts));
        h.drain_tx();

        h.process(frame(0x1CC70201, &[0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]));
        assert_eq!(h.manager.session_count(), 0);
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data()[0], CONTROL_ABORT);
        assert_eq!(frames[0].data()[1], AbortReason::UnexpectedDataTransfer as u8);
    }

    #[test]
    fn test_transmit_session() {
        let mut h = Harness::new();
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        {
            let mut ctx = TransportContext {
                now: h.clock.now(),
                config: &h.config,
                tx: &h.tx,
                events: &mut h.events,
                live_sessions: 0,
            };
            h.manager
                .open_transmit(0xFEEB, payload.clone(), 0x01, 0x02, &mut ctx)
                .unwrap();
        }
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.raw(), 0x1CC80201);
        let rts = EtpCmRts(frames[0]);
        assert_eq!(rts.0.data()[0], CONTROL_RTS);
        assert_eq!(rts.total_message_bytes(), 2000);
        assert_eq!(rts.message_pgn(), 0xFEEB);

        // Clear the first 4 packets
        h.process(frame(0x1CC80102, &[0x15, 0x04, 0x01, 0x00, 0x00, 0xEB, 0xFE, 0x00]));
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 5, "a DPO followed by 4 data frames");
        let dpo = EtpCmDpo(frames[0]);
        assert_eq!(dpo.0.data()[0], CONTROL_DPO);
        assert_eq!(dpo.number_of_packets(), 4);
        assert_eq!(dpo.packet_offset(), 0);
        for (i, data_frame) in frames[1..].iter().enumerate() {
            assert_eq!(data_frame.id.raw(), 0x1CC70201);
            assert_eq!(data_frame.data()[0], i as u8 + 1);
            assert_eq!(data_frame.data()[1..], payload[i * 7..(i + 1) * 7]);
        }

        // Clear a burst in the middle of the 24-bit packet space
        h.process(frame(0x1CC80102, &[0x15, 0x02, 0x05, 0x00, 0x00, 0xEB, 0xFE, 0x00]));
        h.update();
        let frames = h.drain_tx();
        assert_eq!(frames.len(), 3);
        let dpo = EtpCmDpo(frames[0]);
        assert_eq!(dpo.packet_offset(), 4);
        assert_eq!(frames[1].data()[0], 1, "sequence numbers restart every burst");
        assert_eq!(frames[1].data()[1..], payload[4 * 7..5 * 7]);

        // The EOMA finishes the session
        let mut eoma = [0xFFu8; 8];
        eoma[0] = CONTROL_EOMA;
        LittleEndian::write_u32(&mut eoma[1..5], 2000);
        LittleEndian::write_u24(&mut eoma[5..8], 0xFEEB);
        h.process(frame(0x1CC80102, &eoma));
        assert_eq!(h.manager.session_count(), 0);
        assert!(matches!(
            h.events.as_slice(),
            [NetworkEvent::TransportDone { pgn: 0xFEEB, destination: 0x02, ok: true, .. }]
        ));
    }

    #[test]
    fn test_transmit_timeout_without_cts() {
        let mut h = Harness::new();
        let payload = vec![0u8; 2000];
        {
            let mut ctx = TransportContext {
                now: h.clock.now(),
                config: &h.config,
                tx: &h.tx,
                events: &mut h.events,
                live_sessions: 0,
            };
            h.manager
                .open_transmit(0xFEEB, payload, 0x01, 0x02, &mut ctx)
                .unwrap();
        }
        h.update();
        h.drain_tx();

        h.clock.advance(Duration::from_millis(1300));
        h.update();
        assert_eq!(h.manager.session_count(), 0);
        // No CTS ever arrived, so no connection was established and no abort frame is owed
        assert!(h.drain_tx().is_empty());
        assert!(matches!(
            h.events.as_slice(),
            [NetworkEvent::TransportDone {
                ok: false,
                reason: Some(AbortReason::Timeout),
                ..
            }]
        ));
    }

    #[test]
    fn test_open_transmit_validation() {
        let mut h = Harness::new();
        let mut ctx = TransportContext {
            now: h.clock.now(),
            config: &h.config,
            tx: &h.tx,
            events: &mut h.events,
            live_sessions: 0,
        };
        assert!(matches!(
            h.manager.open_transmit(0xFEEB, vec![0; 100], 0x01, 0x02, &mut ctx),
            Err(SendError::MessageSize(100))
        ));
        assert!(matches!(
            h.manager
                .open_transmit(0xFEEB, vec![0; 2000], 0x01, GLOBAL_ADDRESS, &mut ctx),
            Err(SendError::CannotBroadcastLarge)
        ));
    }
}
