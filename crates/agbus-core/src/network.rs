//! The network manager: routes received frames, fans out callbacks, and serialises outgoing
//! messages
//!
//! A [Network] is an explicit, injectable value covering a fixed set of channels; tests build as
//! many independent networks as they like. All of its state is owned by whichever thread calls
//! [update](Network::update); the two bounded frame queues are the only seam shared with the
//! hardware pump.
use std::sync::Arc;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::address_claim::{AddressClaimStateMachine, ClaimContext, ClaimState};
use crate::config::NetworkConfiguration;
use crate::control_function::{CfHandle, CfKind, CfRegistry, ControlFunction};
use crate::frame::{CanFrame, CanMessage};
use crate::id::CanId;
use crate::name::{Name, NameFilter};
use crate::pgn::{
    ADDRESS_CLAIM, ETP_CONNECTION_MANAGEMENT, ETP_DATA_TRANSFER, GLOBAL_ADDRESS, NULL_ADDRESS,
    REQUEST, REQUEST_FOR_REPETITION_RATE, TP_CONNECTION_MANAGEMENT, TP_DATA_TRANSFER,
};
use crate::pgn_request::{PgnRequestProtocol, RepetitionEmitter, RequestHandler};
use crate::queue::FrameQueue;
use crate::time::{Clock, MonotonicClock};
use crate::transport::{
    AbortReason, EtpManager, FastPacketManager, TpManager, TransportContext,
};

/// A synchronous failure from a send call
///
/// Protocol-level failures never surface here; they arrive later as a
/// [NetworkEvent::TransportDone] with `ok = false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendError {
    /// The payload doesn't fit any transport
    MessageSize(usize),
    /// Messages over 1785 bytes cannot be broadcast
    CannotBroadcastLarge,
    /// A session between this source and destination is already live
    SessionAlreadyActive,
    /// The per-channel cap on concurrent transport sessions is reached
    SessionLimit,
    /// The source is not an internal control function holding a valid address
    InvalidSource,
    /// The destination control function is unknown or has no valid address
    InvalidDestination,
    /// No such channel
    UnknownChannel(u8),
    /// The outbound frame queue is full
    QueueFull,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageSize(size) => write!(f, "no transport carries a {size} byte message"),
            Self::CannotBroadcastLarge => {
                write!(f, "messages over 1785 bytes require a destination")
            }
            Self::SessionAlreadyActive => {
                write!(f, "a transport session with this destination is already live")
            }
            Self::SessionLimit => write!(f, "concurrent transport session limit reached"),
            Self::InvalidSource => {
                write!(f, "source is not an internal control function with a valid address")
            }
            Self::InvalidDestination => {
                write!(f, "destination control function has no valid address")
            }
            Self::UnknownChannel(channel) => write!(f, "no such channel: {channel}"),
            Self::QueueFull => write!(f, "outbound frame queue is full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Things the core tells the application about, drained with [Network::poll_event]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// An internal control function finished claiming an address
    AddressClaimed { handle: CfHandle, address: u8 },
    /// An internal control function lost its address in arbitration
    AddressLost { handle: CfHandle, address: u8 },
    /// An internal control function has no claimable address and is off the bus
    UnableToClaim { handle: CfHandle },
    /// Somebody is sending traffic from an address we hold
    AddressViolation { handle: CfHandle, address: u8 },
    /// A transport transmission finished, successfully or not
    TransportDone {
        channel: u8,
        pgn: u32,
        destination: u8,
        ok: bool,
        reason: Option<AbortReason>,
    },
}

/// Identifies a registered callback so it can be removed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Which messages a callback subscription covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallbackScope {
    /// Every message under the PGN
    Global,
    /// Only messages whose source is this partnered control function
    Partner(CfHandle),
    /// Only messages addressed to this internal control function (or to everybody)
    Internal(CfHandle),
}

pub type MessageCallback = Box<dyn FnMut(&CanMessage) + Send>;

struct CallbackEntry {
    id: CallbackId,
    pgn: u32,
    scope: CallbackScope,
    callback: MessageCallback,
}

struct ChannelProtocols {
    tp: TpManager,
    etp: EtpManager,
    fp: FastPacketManager,
}

/// The core of the stack: one value per CAN network (set of channels)
pub struct Network {
    config: NetworkConfiguration,
    clock: Box<dyn Clock>,
    registry: CfRegistry,
    claims: Vec<AddressClaimStateMachine>,
    channels: Vec<ChannelProtocols>,
    requests: PgnRequestProtocol,
    rx_queue: Arc<FrameQueue>,
    tx_queue: Arc<FrameQueue>,
    callbacks: Vec<CallbackEntry>,
    events: Vec<NetworkEvent>,
    next_callback_id: u64,
}

impl Network {
    #[must_use]
    pub fn new(channel_count: usize, config: NetworkConfiguration) -> Self {
        Self::with_clock(channel_count, config, Box::new(MonotonicClock))
    }

    /// Build a network against an explicit clock; tests pass a
    /// [ManualClock](crate::time::ManualClock)
    #[must_use]
    pub fn with_clock(channel_count: usize, config: NetworkConfiguration, clock: Box<dyn Clock>) -> Self {
        let channels = (0..channel_count)
            .map(|channel| ChannelProtocols {
                tp: TpManager::new(channel as u8),
                etp: EtpManager::new(channel as u8),
                fp: FastPacketManager::new(channel as u8),
            })
            .collect();
        Self {
            channels,
            clock,
            registry: CfRegistry::new(),
            claims: Vec::new(),
            requests: PgnRequestProtocol::new(),
            rx_queue: Arc::new(FrameQueue::bounded(config.rx_frame_queue_size)),
            tx_queue: Arc::new(FrameQueue::bounded(config.tx_frame_queue_size)),
            callbacks: Vec::new(),
            events: Vec::new(),
            next_callback_id: 0,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfiguration {
        &self.config
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The inbound queue the hardware pump produces into
    #[must_use]
    pub fn rx_queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.rx_queue)
    }

    /// The outbound queue the hardware pump consumes from
    #[must_use]
    pub fn tx_queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.tx_queue)
    }

    /// Host a control function on this stack and start claiming its preferred address
    pub fn create_internal_cf(
        &mut self,
        name: Name,
        preferred_address: u8,
        channel: u8,
    ) -> eyre::Result<CfHandle> {
        if channel as usize >= self.channels.len() {
            return Err(SendError::UnknownChannel(channel).into());
        }
        if preferred_address >= NULL_ADDRESS {
            eyre::bail!("Preferred address {preferred_address:#04X} is not claimable");
        }
        let handle = self.registry.create_internal(name, channel);
        self.claims.push(AddressClaimStateMachine::new(
            handle,
            name,
            preferred_address,
            channel,
        ));
        Ok(handle)
    }

    /// Watch for a remote control function matching the NAME filter set
    pub fn create_partnered_cf(
        &mut self,
        channel: u8,
        filters: Vec<NameFilter>,
    ) -> eyre::Result<CfHandle> {
        if channel as usize >= self.channels.len() {
            return Err(SendError::UnknownChannel(channel).into());
        }
        Ok(self.registry.create_partnered(channel, filters))
    }

    /// Remove a control function and cancel every transport session it is party to
    pub fn destroy_cf(&mut self, handle: CfHandle) {
        let Some(cf) = self.registry.destroy(handle) else {
            return;
        };
        self.claims.retain(|machine| machine.handle() != handle);
        self.requests.remove_control_function(handle);
        self.callbacks.retain(|entry| match entry.scope {
            CallbackScope::Global => true,
            CallbackScope::Partner(h) | CallbackScope::Internal(h) => h != handle,
        });

        let address = cf.address();
        if address == NULL_ADDRESS || address == GLOBAL_ADDRESS {
            return;
        }
        let now = self.clock.now();
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        if let Some(protocols) = channels.get_mut(cf.channel() as usize) {
            let live = protocols.tp.session_count() + protocols.etp.session_count();
            let mut ctx = TransportContext {
                now,
                config,
                tx: tx_queue.as_ref(),
                events,
                live_sessions: live,
            };
            protocols.tp.cancel_endpoint(address, &mut ctx);
            protocols.etp.cancel_endpoint(address, &mut ctx);
            protocols.fp.cancel_endpoint(address);
        }
    }

    #[must_use]
    pub fn control_function(&self, handle: CfHandle) -> &ControlFunction {
        self.registry.get(handle)
    }

    #[must_use]
    pub fn registry(&self) -> &CfRegistry {
        &self.registry
    }

    /// TP + ETP sessions currently live on the channel
    #[must_use]
    pub fn live_sessions(&self, channel: u8) -> usize {
        self.channels
            .get(channel as usize)
            .map(|p| p.tp.session_count() + p.etp.session_count())
            .unwrap_or(0)
    }

    /// Send a message, choosing the transport by size and destination
    ///
    /// Up to 8 bytes goes out as a single frame. 9..=1785 bytes uses the transport protocol
    /// (BAM when there is no destination); 1786..=117,440,505 bytes uses the extended transport
    /// protocol and requires a destination.
    pub fn send_message(
        &mut self,
        pgn: u32,
        data: &[u8],
        source: CfHandle,
        destination: Option<CfHandle>,
        priority: u8,
    ) -> eyre::Result<()> {
        let (channel, source_address) = self.validate_source(source)?;
        let destination_address = match destination {
            Some(handle) => Some(self.validate_destination(handle, channel)?),
            None => None,
        };

        if data.len() <= 8 {
            let id = CanId::encode(
                priority,
                pgn,
                destination_address.unwrap_or(GLOBAL_ADDRESS),
                source_address,
            )?;
            if !self.tx_queue.try_push(CanFrame::new(channel, id, data)) {
                return Err(SendError::QueueFull.into());
            }
            return Ok(());
        }

        let now = self.clock.now();
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let protocols = &mut channels[channel as usize];
        let live = protocols.tp.session_count() + protocols.etp.session_count();
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: live,
        };
        if data.len() <= crate::transport::MAX_TP_BYTES {
            protocols.tp.open_transmit(
                pgn,
                data.to_vec(),
                source_address,
                destination_address,
                &mut ctx,
            )?;
        } else {
            let Some(destination_address) = destination_address else {
                return Err(SendError::CannotBroadcastLarge.into());
            };
            protocols.etp.open_transmit(
                pgn,
                data.to_vec(),
                source_address,
                destination_address,
                &mut ctx,
            )?;
        }
        Ok(())
    }

    /// Send a 9..=223 byte message with NMEA 2000 fast packet framing
    pub fn send_fast_packet(
        &mut self,
        pgn: u32,
        data: &[u8],
        source: CfHandle,
        destination: Option<CfHandle>,
        priority: u8,
    ) -> eyre::Result<()> {
        let (channel, source_address) = self.validate_source(source)?;
        let destination_address = match destination {
            Some(handle) => Some(self.validate_destination(handle, channel)?),
            None => None,
        };
        let now = self.clock.now();
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let protocols = &mut channels[channel as usize];
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: 0,
        };
        protocols.fp.open_transmit(
            pgn,
            data,
            source_address,
            destination_address,
            priority,
            &mut ctx,
        )?;
        Ok(())
    }

    /// Declare a PGN as fast-packet framed on a channel, so received frames reassemble
    pub fn register_fast_packet_pgn(&mut self, channel: u8, pgn: u32) -> eyre::Result<()> {
        let protocols = self
            .channels
            .get_mut(channel as usize)
            .ok_or(SendError::UnknownChannel(channel))?;
        protocols.fp.register_pgn(pgn);
        Ok(())
    }

    /// Invoke the callback for every received message under the PGN
    pub fn add_global_pgn_callback(&mut self, pgn: u32, callback: MessageCallback) -> CallbackId {
        self.add_callback(pgn, CallbackScope::Global, callback)
    }

    /// Invoke the callback for messages under the PGN whose source is the partnered CF
    pub fn add_partner_pgn_callback(
        &mut self,
        pgn: u32,
        partner: CfHandle,
        callback: MessageCallback,
    ) -> CallbackId {
        self.add_callback(pgn, CallbackScope::Partner(partner), callback)
    }

    /// Invoke the callback for messages under the PGN addressed to the internal CF (or to
    /// everybody)
    pub fn add_internal_pgn_callback(
        &mut self,
        pgn: u32,
        internal: CfHandle,
        callback: MessageCallback,
    ) -> CallbackId {
        self.add_callback(pgn, CallbackScope::Internal(internal), callback)
    }

    pub fn remove_callback(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|entry| entry.id != id);
        self.callbacks.len() != before
    }

    /// Register a handler for 0xEA00 requests of `pgn` addressed to `internal`
    pub fn register_request_handler(&mut self, internal: CfHandle, pgn: u32, handler: RequestHandler) {
        self.requests.register_request_handler(internal, pgn, handler);
    }

    /// Opt `internal` into Request for Repetition Rate for `pgn`
    pub fn register_repetition_handler(
        &mut self,
        internal: CfHandle,
        pgn: u32,
        priority: u8,
        default_interval: std::time::Duration,
        emitter: RepetitionEmitter,
    ) {
        self.requests
            .register_repetition_handler(internal, pgn, priority, default_interval, emitter);
    }

    /// Pause or resume the destination-specific TP session from `originator` on `channel`
    pub fn set_receive_hold(&mut self, channel: u8, originator: u8, hold: bool) {
        let now = self.clock.now();
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let Some(protocols) = channels.get_mut(channel as usize) else {
            return;
        };
        let live = protocols.tp.session_count() + protocols.etp.session_count();
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: live,
        };
        protocols.tp.set_receive_hold(originator, hold, &mut ctx);
    }

    /// Hand a received frame to the core, as the hardware pump does
    pub fn inject_frame(&self, frame: CanFrame) -> bool {
        self.rx_queue.try_push(frame)
    }

    /// The next pending event, if any
    pub fn poll_event(&mut self) -> Option<NetworkEvent> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.events.remove(0))
        }
    }

    /// One cooperative tick; call at least every few milliseconds
    ///
    /// Drains the inbound queue, advances the address-claim machines, pumps the transport
    /// protocols, and emits due periodic messages — in that order. Never blocks and never
    /// sleeps.
    pub fn update(&mut self) {
        let now = self.clock.now();

        while let Some(frame) = self.rx_queue.pop() {
            self.process_frame(frame, now);
        }

        {
            let Self {
                claims,
                registry,
                config,
                tx_queue,
                events,
                ..
            } = self;
            for machine in claims.iter_mut() {
                let mut ctx = ClaimContext {
                    now,
                    config,
                    registry: &mut *registry,
                    tx: tx_queue.as_ref(),
                    events: &mut *events,
                };
                machine.update(&mut ctx);
            }
        }

        {
            let Self {
                channels,
                config,
                tx_queue,
                events,
                ..
            } = self;
            for protocols in channels.iter_mut() {
                let live = protocols.tp.session_count() + protocols.etp.session_count();
                let mut ctx = TransportContext {
                    now,
                    config,
                    tx: tx_queue.as_ref(),
                    events: &mut *events,
                    live_sessions: live,
                };
                protocols.tp.update(&mut ctx);
                let mut ctx = TransportContext {
                    now,
                    config,
                    tx: tx_queue.as_ref(),
                    events: &mut *events,
                    live_sessions: live,
                };
                protocols.etp.update(&mut ctx);
                let mut ctx = TransportContext {
                    now,
                    config,
                    tx: tx_queue.as_ref(),
                    events: &mut *events,
                    live_sessions: live,
                };
                protocols.fp.update(&mut ctx);
            }
        }

        self.requests.update(now, &self.registry, self.tx_queue.as_ref());
    }

    fn add_callback(&mut self, pgn: u32, scope: CallbackScope, callback: MessageCallback) -> CallbackId {
        let id = CallbackId(self.next_callback_id);
        self.next_callback_id += 1;
        self.callbacks.push(CallbackEntry {
            id,
            pgn,
            scope,
            callback,
        });
        id
    }

    fn validate_source(&self, source: CfHandle) -> Result<(u8, u8), SendError> {
        if !self.registry.is_alive(source) {
            return Err(SendError::InvalidSource);
        }
        let cf = self.registry.get(source);
        if cf.kind() != CfKind::Internal || !cf.address_valid() {
            return Err(SendError::InvalidSource);
        }
        Ok((cf.channel(), cf.address()))
    }

    fn validate_destination(&self, destination: CfHandle, channel: u8) -> Result<u8, SendError> {
        if !self.registry.is_alive(destination) {
            return Err(SendError::InvalidDestination);
        }
        let cf = self.registry.get(destination);
        if !cf.address_valid() || cf.channel() != channel {
            return Err(SendError::InvalidDestination);
        }
        Ok(cf.address())
    }

    /// Dispatch one received frame in the protocol priority order
    fn process_frame(&mut self, frame: CanFrame, now: Instant) {
        if !frame.extended {
            // J1939 traffic is always 29-bit; 11-bit frames belong to somebody else's protocol
            tracing::trace!("Ignoring standard-identifier frame {:?}", frame.id);
            return;
        }
        let channel = frame.channel as usize;
        if channel >= self.channels.len() {
            tracing::warn!("Frame on unknown channel {channel}; dropping");
            return;
        }
        let pgn = frame.pgn();

        if pgn != ADDRESS_CLAIM {
            self.check_address_violation(&frame, now);
        }

        match pgn {
            TP_CONNECTION_MANAGEMENT | TP_DATA_TRANSFER => {
                if let Some(message) = self.feed_tp(&frame, now) {
                    self.dispatch_message(message);
                }
            }
            ETP_CONNECTION_MANAGEMENT | ETP_DATA_TRANSFER => {
                if let Some(message) = self.feed_etp(&frame, now) {
                    self.dispatch_message(message);
                }
            }
            ADDRESS_CLAIM => self.process_address_claim(&frame, now),
            REQUEST => self.process_request(&frame, now),
            REQUEST_FOR_REPETITION_RATE => {
                self.requests.process_repetition_rate(&frame, &self.registry);
            }
            _ if self.channels[channel].fp.handles_pgn(pgn) => {
                if let Some(message) = self.feed_fp(&frame, now) {
                    self.dispatch_message(message);
                }
            }
            _ => self.dispatch_message(CanMessage::from(frame)),
        }
    }

    fn feed_tp(&mut self, frame: &CanFrame, now: Instant) -> Option<CanMessage> {
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let protocols = &mut channels[frame.channel as usize];
        let live = protocols.tp.session_count() + protocols.etp.session_count();
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: live,
        };
        protocols.tp.process_frame(frame, &mut ctx)
    }

    fn feed_etp(&mut self, frame: &CanFrame, now: Instant) -> Option<CanMessage> {
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let protocols = &mut channels[frame.channel as usize];
        let live = protocols.tp.session_count() + protocols.etp.session_count();
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: live,
        };
        protocols.etp.process_frame(frame, &mut ctx)
    }

    fn feed_fp(&mut self, frame: &CanFrame, now: Instant) -> Option<CanMessage> {
        let Self {
            channels,
            config,
            tx_queue,
            events,
            ..
        } = self;
        let protocols = &mut channels[frame.channel as usize];
        let mut ctx = TransportContext {
            now,
            config,
            tx: tx_queue.as_ref(),
            events,
            live_sessions: 0,
        };
        protocols.fp.process_frame(frame, &mut ctx)
    }

    fn process_address_claim(&mut self, frame: &CanFrame, now: Instant) {
        if frame.dlc() != 8 {
            tracing::warn!("Malformed address claim from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(frame.data());
        let name = Name::from_claim_bytes(bytes);
        let channel = frame.channel;
        let claimed_address = frame.src();

        // A claim carrying one of our own NAMEs is contention, not an observation; the state
        // machine deals with it without disturbing our registry entry
        let own_name = self
            .claims
            .iter()
            .any(|m| m.channel() == channel && m.name() == name);
        if !own_name && claimed_address != NULL_ADDRESS {
            self.registry.observe(channel, name, claimed_address);
        }

        let Self {
            claims,
            registry,
            config,
            tx_queue,
            events,
            ..
        } = self;
        for machine in claims.iter_mut().filter(|m| m.channel() == channel) {
            let mut ctx = ClaimContext {
                now,
                config,
                registry: &mut *registry,
                tx: tx_queue.as_ref(),
                events: &mut *events,
            };
            machine.process_claim(claimed_address, name, &mut ctx);
        }
    }

    fn process_request(&mut self, frame: &CanFrame, now: Instant) {
        if frame.dlc() < 3 {
            tracing::warn!("Malformed PGN request from {:#04X}: dlc {}", frame.src(), frame.dlc());
            return;
        }
        let requested = LittleEndian::read_u24(&frame.data()[0..3]);
        if requested == ADDRESS_CLAIM {
            let channel = frame.channel;
            let destination = frame.dst();
            let Self {
                claims,
                registry,
                config,
                tx_queue,
                events,
                ..
            } = self;
            for machine in claims.iter_mut().filter(|m| m.channel() == channel) {
                let mut ctx = ClaimContext {
                    now,
                    config,
                    registry: &mut *registry,
                    tx: tx_queue.as_ref(),
                    events: &mut *events,
                };
                machine.process_request_for_claim(destination, &mut ctx);
            }
        } else {
            self.requests
                .process_request(frame, &self.registry, self.tx_queue.as_ref());
        }
    }

    /// Defend our address if somebody else is sourcing traffic from it
    fn check_address_violation(&mut self, frame: &CanFrame, now: Instant) {
        let channel = frame.channel;
        let source = frame.src();
        if source >= NULL_ADDRESS {
            return;
        }
        let Self {
            claims,
            registry,
            config,
            tx_queue,
            events,
            ..
        } = self;
        for machine in claims.iter_mut().filter(|m| {
            m.channel() == channel
                && m.state() == ClaimState::AddressClaimingComplete
                && m.claimed_address() == source
        }) {
            tracing::warn!(
                "Address violation: traffic from {source:#04X} on channel {channel}, which we hold"
            );
            events.push(NetworkEvent::AddressViolation {
                handle: machine.handle(),
                address: source,
            });
            let mut ctx = ClaimContext {
                now,
                config,
                registry: &mut *registry,
                tx: tx_queue.as_ref(),
                events: &mut *events,
            };
            machine.defend(&mut ctx);
        }
    }

    /// Fan a reassembled (or short) message out to every matching callback
    ///
    /// Global subscriptions first, then partner-scoped, then internal-scoped; within a scope,
    /// registration order.
    fn dispatch_message(&mut self, mut message: CanMessage) {
        let channel = message.channel;
        message.source_handle = self.registry.lookup_by_address(channel, message.src);
        if message.dst != GLOBAL_ADDRESS {
            message.destination_handle = self.registry.lookup_by_address(channel, message.dst);
        }

        let Self {
            callbacks, registry, ..
        } = self;
        for entry in callbacks.iter_mut().filter(|e| e.pgn == message.pgn) {
            if entry.scope == CallbackScope::Global {
                (entry.callback)(&message);
            }
        }
        for entry in callbacks.iter_mut().filter(|e| e.pgn == message.pgn) {
            if let CallbackScope::Partner(partner) = entry.scope {
                if message.source_handle == Some(partner) {
                    (entry.callback)(&message);
                }
            }
        }
        for entry in callbacks.iter_mut().filter(|e| e.pgn == message.pgn) {
            if let CallbackScope::Internal(internal) = entry.scope {
                let cf = registry.get(internal);
                if cf.channel() == channel
                    && cf.address_valid()
                    && (message.dst == cf.address() || message.dst == GLOBAL_ADDRESS)
                {
                    (entry.callback)(&message);
                }
            }
        }
    }
}
