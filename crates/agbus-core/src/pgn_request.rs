//! The PGN request protocol (PGN 0xEA00) and its acknowledgements (PGN 0xE800)
//!
//! A request names a PGN in its 3-byte payload. Internal control functions register handlers per
//! PGN; a handler can answer with a positive or negative acknowledgement (which this protocol
//! puts on the wire), answer in some other way of its own, or pass. Destination-specific requests
//! nobody answers are NACKed; global requests are never NACKed.
//!
//! The Request for Repetition Rate (PGN 0xCC00) rides along here: a handler that opts in is told
//! the requested rate, and this protocol owns the resulting periodic emission. A rate of zero
//! stops the repetition, 0xFFFF selects the handler's default.
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::control_function::{CfHandle, CfRegistry};
use crate::frame::CanFrame;
use crate::id::CanId;
use crate::pgn::{ACKNOWLEDGEMENT, DEFAULT_PRIORITY, GLOBAL_ADDRESS};
use crate::queue::FrameQueue;

const ACK_CONTROL_POSITIVE: u8 = 0;
const ACK_CONTROL_NEGATIVE: u8 = 1;

/// What a request handler did with a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Answer with a positive acknowledgement
    Ack,
    /// Answer with a negative acknowledgement
    Nack,
    /// The handler answered on its own (e.g. by sending the requested PGN); no acknowledgement
    Handled,
    /// Not this handler's request
    Ignored,
}

/// A received request, as seen by a handler
#[derive(Clone, Copy, Debug)]
pub struct Request {
    pub channel: u8,
    /// The PGN being requested
    pub pgn: u32,
    /// Source address of the requestor
    pub requestor: u8,
    /// Where the request was addressed (an internal CF's address, or the global address)
    pub destination: u8,
}

pub type RequestHandler = Box<dyn FnMut(&Request) -> RequestDisposition + Send>;

/// Called when a repetition is due; returns the payload to broadcast, or `None` to skip a beat
pub type RepetitionEmitter = Box<dyn FnMut() -> Option<Vec<u8>> + Send>;

struct RequestHandlerEntry {
    internal: CfHandle,
    pgn: u32,
    handler: RequestHandler,
}

struct ActiveRepetition {
    interval: Duration,
    last_emit: Option<Instant>,
}

struct RepetitionEntry {
    internal: CfHandle,
    pgn: u32,
    priority: u8,
    default_interval: Duration,
    emitter: RepetitionEmitter,
    active: Option<ActiveRepetition>,
}

/// Handles 0xEA00 requests and 0xCC00 repetition-rate requests for every internal CF
#[derive(Default)]
pub struct PgnRequestProtocol {
    handlers: Vec<RequestHandlerEntry>,
    repetitions: Vec<RepetitionEntry>,
}

impl PgnRequestProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for requests of `pgn` addressed to `internal` (or to everybody)
    pub fn register_request_handler(&mut self, internal: CfHandle, pgn: u32, handler: RequestHandler) {
        self.handlers.push(RequestHandlerEntry {
            internal,
            pgn,
            handler,
        });
    }

    /// Opt `internal` into Request for Repetition Rate for `pgn`
    ///
    /// Once a repetition rate has been requested, the emitter is polled at that cadence and its
    /// payload broadcast under `pgn` until a rate of zero stops it.
    pub fn register_repetition_handler(
        &mut self,
        internal: CfHandle,
        pgn: u32,
        priority: u8,
        default_interval: Duration,
        emitter: RepetitionEmitter,
    ) {
        self.repetitions.push(RepetitionEntry {
            internal,
            pgn,
            priority,
            default_interval,
            emitter,
            active: None,
        });
    }

    /// Drop every registration for a destroyed control function
    pub fn remove_control_function(&mut self, internal: CfHandle) {
        self.handlers.retain(|h| h.internal != internal);
        self.repetitions.retain(|r| r.internal != internal);
    }

    /// Process a received 0xEA00 request frame
    pub fn process_request(&mut self, frame: &CanFrame, registry: &CfRegistry, tx: &FrameQueue) {
        if frame.dlc() < 3 {
            tracing::warn!("Malformed PGN request from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return;
        }
        let requested = LittleEndian::read_u24(&frame.data()[0..3]);
        let destination = frame.dst();
        let global = destination == GLOBAL_ADDRESS;
        tracing::trace!(
            "PGN request from {:#04X} for {requested:#X}, addressed to {destination:#04X}",
            frame.src()
        );

        for internal in registry.internals(frame.channel) {
            let cf = registry.get(internal);
            if !cf.address_valid() || (!global && cf.address() != destination) {
                continue;
            }
            let request = Request {
                channel: frame.channel,
                pgn: requested,
                requestor: frame.src(),
                destination,
            };
            let mut disposition = RequestDisposition::Ignored;
            for entry in self
                .handlers
                .iter_mut()
                .filter(|h| h.internal == internal && h.pgn == requested)
            {
                disposition = (entry.handler)(&request);
                if disposition != RequestDisposition::Ignored {
                    break;
                }
            }
            match disposition {
                RequestDisposition::Ack => {
                    Self::emit_ack(frame, cf.address(), requested, ACK_CONTROL_POSITIVE, tx);
                }
                RequestDisposition::Nack => {
                    Self::emit_ack(frame, cf.address(), requested, ACK_CONTROL_NEGATIVE, tx);
                }
                RequestDisposition::Handled => {}
                RequestDisposition::Ignored => {
                    // A destination-specific request we can't service gets a NACK; global
                    // requests are left unanswered
                    if !global {
                        Self::emit_ack(frame, cf.address(), requested, ACK_CONTROL_NEGATIVE, tx);
                    }
                }
            }
        }
    }

    /// Process a received 0xCC00 Request for Repetition Rate frame
    pub fn process_repetition_rate(&mut self, frame: &CanFrame, registry: &CfRegistry) {
        if frame.dlc() < 5 {
            tracing::warn!(
                "Malformed repetition rate request from {:#04X}: dlc {}",
                frame.src(),
                frame.dlc()
            );
            return;
        }
        let pgn = LittleEndian::read_u24(&frame.data()[0..3]);
        let rate = LittleEndian::read_u16(&frame.data()[3..5]);
        let destination = frame.dst();
        let global = destination == GLOBAL_ADDRESS;

        for entry in self.repetitions.iter_mut().filter(|r| r.pgn == pgn) {
            let cf = registry.get(entry.internal);
            if cf.channel() != frame.channel
                || !cf.address_valid()
                || (!global && cf.address() != destination)
            {
                continue;
            }
            match rate {
                0 => {
                    tracing::debug!("Stopping repetition of {pgn:#X} for {:#04X}", cf.address());
                    entry.active = None;
                }
                0xFFFF => {
                    tracing::debug!(
                        "Repeating {pgn:#X} for {:#04X} at the default {}ms",
                        cf.address(),
                        entry.default_interval.as_millis()
                    );
                    entry.active = Some(ActiveRepetition {
                        interval: entry.default_interval,
                        last_emit: None,
                    });
                }
                ms => {
                    tracing::debug!("Repeating {pgn:#X} for {:#04X} every {ms}ms", cf.address());
                    entry.active = Some(ActiveRepetition {
                        interval: Duration::from_millis(ms as u64),
                        last_emit: None,
                    });
                }
            }
        }
    }

    /// Emit any repetitions that have come due
    pub fn update(&mut self, now: Instant, registry: &CfRegistry, tx: &FrameQueue) {
        for entry in &mut self.repetitions {
            let Some(active) = &mut entry.active else {
                continue;
            };
            let due = active
                .last_emit
                .is_none_or(|last| now - last >= active.interval);
            if !due {
                continue;
            }
            let cf = registry.get(entry.internal);
            if !cf.address_valid() {
                continue;
            }
            let Some(payload) = (entry.emitter)() else {
                active.last_emit = Some(now);
                continue;
            };
            if payload.len() > 8 {
                tracing::warn!(
                    "Repetition payload for {:#X} is {} bytes; periodic emissions must fit one frame",
                    entry.pgn,
                    payload.len()
                );
                active.last_emit = Some(now);
                continue;
            }
            let Ok(id) = CanId::encode(entry.priority, entry.pgn, GLOBAL_ADDRESS, cf.address())
            else {
                tracing::warn!("Cannot encode repetition id for PGN {:#X}", entry.pgn);
                continue;
            };
            if tx.try_push(CanFrame::new(cf.channel(), id, &payload)) {
                active.last_emit = Some(now);
            }
        }
    }

    fn emit_ack(request: &CanFrame, our_address: u8, pgn: u32, control: u8, tx: &FrameQueue) {
        // Acknowledgements are always broadcast; byte 4 names the requestor being answered
        let mut payload = [0xFFu8; 8];
        payload[0] = control;
        payload[4] = request.src();
        LittleEndian::write_u24(&mut payload[5..8], pgn);
        let Ok(id) = CanId::encode(DEFAULT_PRIORITY, ACKNOWLEDGEMENT, GLOBAL_ADDRESS, our_address)
        else {
            return;
        };
        tx.try_push(CanFrame::new(request.channel, id, &payload));
    }
}
