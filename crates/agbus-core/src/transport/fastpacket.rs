//! NMEA 2000 Fast Packet Protocol (9..=223 bytes)
//!
//! Fast Packet messages are burst sent with no ACK/NACK or flow control of any kind. Each frame's
//! first byte carries a 3-bit sequence counter (identifying the message) and a 5-bit frame index:
//!
//! # First Frame
//!
//! | Byte 1 (bits 7..5) | Byte 1 (bits 4..0) | Byte 2     | Bytes 3 .. 8 |
//! |--------------------|--------------------|------------|--------------|
//! | sequence counter   | frame index (0)    | total len  | data         |
//!
//! # Following Frames
//!
//! | Byte 1 (bits 7..5) | Byte 1 (bits 4..0) | Bytes 2..8 |
//! |--------------------|--------------------|------------|
//! | sequence counter   | frame index        | data       |
//!
//! The sequence counter wraps around per (source, PGN) pair so a receiver can tell a new message
//! from a continuation. Unlike TP/ETP the carried PGN is the PGN of the frames themselves, so the
//! network manager has to be told which PGNs are fast-packet framed.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::frame::{CanFrame, CanMessage};
use crate::id::CanId;
use crate::network::{NetworkEvent, SendError};
use crate::pgn::GLOBAL_ADDRESS;
use crate::transport::TransportContext;

pub const MIN_FAST_PACKET_BYTES: usize = 9;
pub const MAX_FAST_PACKET_BYTES: usize = 223;
/// Payload bytes in the first frame of a sequence
const FIRST_FRAME_BYTES: usize = 6;
/// Payload bytes in every following frame
const BYTES_PER_FRAME: usize = 7;
/// How long an unfinished reassembly is kept before it is discarded
const STALE_RX_SESSION: Duration = Duration::from_millis(750);

/// Private accessors for the fast packet framing
impl CanFrame {
    /// The index of this frame within its message
    #[inline]
    #[must_use]
    fn frame_index(&self) -> u8 {
        self.data()[0] & 0x1F
    }

    /// Identifies which message a frame belongs to, per (source, PGN) pair
    #[inline]
    #[must_use]
    fn sequence_counter(&self) -> u8 {
        self.data()[0] >> 5
    }

    #[inline]
    #[must_use]
    fn is_first_frame(&self) -> bool {
        self.frame_index() == 0
    }

    #[inline]
    #[must_use]
    fn announced_length(&self) -> usize {
        debug_assert!(self.is_first_frame());
        self.data()[1] as usize
    }

    #[inline]
    #[must_use]
    fn session_data(&self) -> &[u8] {
        if self.is_first_frame() {
            &self.data()[2..]
        } else {
            &self.data()[1..]
        }
    }
}

#[derive(Debug)]
struct FpRxSession {
    source: u8,
    pgn: u32,
    sequence_counter: u8,
    expected_bytes: usize,
    next_index: u8,
    data: Vec<u8>,
    announce: CanFrame,
    last_activity: Instant,
}

#[derive(Debug)]
struct FpTxSession {
    frames: VecDeque<CanFrame>,
    source: u8,
    pgn: u32,
    destination: u8,
    last_frame_time: Option<Instant>,
}

/// The NMEA 2000 Fast Packet state machines for one channel
#[derive(Debug)]
pub struct FastPacketManager {
    channel: u8,
    /// PGNs that are fast-packet framed on this network
    registered: Vec<u32>,
    rx: Vec<FpRxSession>,
    tx: Vec<FpTxSession>,
    /// The next sequence counter per (source, PGN)
    counters: IndexMap<(u8, u32), u8>,
}

impl FastPacketManager {
    #[must_use]
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            registered: Vec::new(),
            rx: Vec::new(),
            tx: Vec::new(),
            counters: IndexMap::new(),
        }
    }

    /// Declare a PGN as fast-packet framed
    ///
    /// The framing is invisible on the wire, so the network manager can only route frames here
    /// for PGNs it has been told about.
    pub fn register_pgn(&mut self, pgn: u32) {
        if !self.registered.contains(&pgn) {
            self.registered.push(pgn);
        }
    }

    #[must_use]
    pub fn handles_pgn(&self, pgn: u32) -> bool {
        self.registered.contains(&pgn)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.rx.len() + self.tx.len()
    }

    /// Queue a 9..=223 byte message for fast-packet transmission
    pub fn open_transmit(
        &mut self,
        pgn: u32,
        data: &[u8],
        source: u8,
        destination: Option<u8>,
        priority: u8,
        ctx: &mut TransportContext,
    ) -> Result<(), SendError> {
        if !(MIN_FAST_PACKET_BYTES..=MAX_FAST_PACKET_BYTES).contains(&data.len()) {
            return Err(SendError::MessageSize(data.len()));
        }
        let destination = destination.unwrap_or(GLOBAL_ADDRESS);
        if self
            .tx
            .iter()
            .any(|s| s.source == source && s.pgn == pgn && s.destination == destination)
        {
            return Err(SendError::SessionAlreadyActive);
        }

        let counter = self.counters.entry((source, pgn)).or_insert(0);
        let sequence_counter = *counter;
        *counter = (*counter + 1) & 0x07;

        let id = CanId::encode(priority, pgn, destination, source)
            .map_err(|_| SendError::MessageSize(data.len()))?;
        let mut frames = VecDeque::new();
        let mut payload = [0xFFu8; 8];
        payload[0] = sequence_counter << 5;
        payload[1] = data.len() as u8;
        let first = FIRST_FRAME_BYTES.min(data.len());
        payload[2..2 + first].copy_from_slice(&data[..first]);
        frames.push_back(CanFrame::new(self.channel, id, &payload));

        let mut offset = first;
        let mut index = 1u8;
        while offset < data.len() {
            let end = (offset + BYTES_PER_FRAME).min(data.len());
            let mut payload = [0xFFu8; 8];
            payload[0] = (sequence_counter << 5) | index;
            payload[1..1 + end - offset].copy_from_slice(&data[offset..end]);
            frames.push_back(CanFrame::new(self.channel, id, &payload));
            offset = end;
            index += 1;
        }

        tracing::debug!(
            "FP tx session open: {source:#04X} -> {destination:#04X} pgn {pgn:#X} seq {sequence_counter:#X} frames {}",
            frames.len()
        );
        self.tx.push(FpTxSession {
            frames,
            source,
            pgn,
            destination,
            last_frame_time: None,
        });
        // With no inter-frame delay configured the whole message goes out right away
        self.pump(ctx);
        Ok(())
    }

    /// Reassemble a received fast-packet frame
    pub fn process_frame(
        &mut self,
        frame: &CanFrame,
        ctx: &mut TransportContext,
    ) -> Option<CanMessage> {
        if frame.dlc() < 2 {
            tracing::warn!("Malformed fast packet frame from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return None;
        }
        let pgn = frame.pgn();
        let existing = self
            .rx
            .iter()
            .position(|s| s.source == frame.src() && s.pgn == pgn);

        if frame.is_first_frame() {
            if let Some(index) = existing {
                tracing::warn!(
                    "New FP sequence from {:#04X} pgn {pgn:#X} with a reassembly in progress; restarting",
                    frame.src()
                );
                self.rx.swap_remove(index);
            }
            let expected_bytes = frame.announced_length();
            if !(MIN_FAST_PACKET_BYTES..=MAX_FAST_PACKET_BYTES).contains(&expected_bytes) {
                tracing::warn!(
                    "Malformed FP first frame from {:#04X} pgn {pgn:#X}: {expected_bytes} bytes",
                    frame.src()
                );
                return None;
            }
            let mut session = FpRxSession {
                source: frame.src(),
                pgn,
                sequence_counter: frame.sequence_counter(),
                expected_bytes,
                next_index: 1,
                data: frame.session_data().to_vec(),
                announce: *frame,
                last_activity: ctx.now,
            };
            tracing::debug!(
                "Start FP session: {:#04X} pgn {pgn:#X} seq {:#X} len {}/{}",
                frame.src(),
                session.sequence_counter,
                session.data.len(),
                session.expected_bytes,
            );
            session.data.truncate(expected_bytes);
            self.rx.push(session);
            return None;
        }

        let Some(index) = existing else {
            tracing::trace!(
                "FP continuation from {:#04X} pgn {pgn:#X} with no reassembly in progress",
                frame.src()
            );
            return None;
        };
        let session = &mut self.rx[index];
        if frame.sequence_counter() != session.sequence_counter {
            // A frame from some other message; not ours to consume
            tracing::trace!(
                "FP counter mismatch from {:#04X} pgn {pgn:#X}: got {:#X}, reassembling {:#X}",
                frame.src(),
                frame.sequence_counter(),
                session.sequence_counter
            );
            return None;
        }
        if frame.frame_index() != session.next_index {
            tracing::warn!(
                "FP frame out of order from {:#04X} pgn {pgn:#X}: index {:#X}, expected {:#X}; dropping reassembly",
                frame.src(),
                frame.frame_index(),
                session.next_index
            );
            self.rx.swap_remove(index);
            return None;
        }

        session.next_index += 1;
        session.last_activity = ctx.now;
        let remaining = session.expected_bytes - session.data.len();
        let take = remaining.min(frame.session_data().len());
        session.data.extend_from_slice(&frame.session_data()[..take]);

        if session.data.len() == session.expected_bytes {
            let session = self.rx.swap_remove(index);
            let mut message = CanMessage::assembled(
                session.pgn,
                session.announce.priority(),
                &session.announce,
                session.data,
            );
            message.timestamp_us = frame.timestamp_us.or(message.timestamp_us);
            tracing::debug!(
                "Finished FP session: {:#04X} pgn {:#X} seq {:#X} len {}",
                session.source,
                session.pgn,
                session.sequence_counter,
                message.data.len()
            );
            return Some(message);
        }
        None
    }

    /// Emit due transmit frames and discard stale reassemblies
    pub fn update(&mut self, ctx: &mut TransportContext) {
        self.pump(ctx);
        self.rx.retain(|session| {
            let stale = ctx.now - session.last_activity >= STALE_RX_SESSION;
            if stale {
                tracing::warn!(
                    "FP reassembly from {:#04X} pgn {:#X} went stale; dropping",
                    session.source,
                    session.pgn
                );
            }
            !stale
        });
    }

    /// Drop every session that has the given address as an endpoint
    pub fn cancel_endpoint(&mut self, address: u8) {
        self.rx.retain(|s| s.source != address);
        self.tx
            .retain(|s| s.source != address && s.destination != address);
    }

    fn pump(&mut self, ctx: &mut TransportContext) {
        let interval = ctx.config.fast_packet_interval();
        let mut i = 0;
        while i < self.tx.len() {
            let session = &mut self.tx[i];
            while let Some(frame) = session.frames.front() {
                let due = interval.is_zero()
                    || session
                        .last_frame_time
                        .is_none_or(|last| ctx.now - last >= interval);
                if !due || ctx.tx.free_space() == 0 {
                    break;
                }
                if !ctx.tx.try_push(*frame) {
                    break;
                }
                session.frames.pop_front();
                session.last_frame_time = Some(ctx.now);
            }
            if session.frames.is_empty() {
                let session = self.tx.swap_remove(i);
                ctx.events.push(NetworkEvent::TransportDone {
                    channel: self.channel,
                    pgn: session.pgn,
                    destination: session.destination,
                    ok: true,
                    reason: None,
                });
            } else {
                i += 1;
            }
        }
    }
}
