//! Claiming and defending a bus address for an internally hosted control function
//!
//! J1939-81 address management: on startup a control function asks who is out there (request for
//! address claim), listens through a contention window, claims its preferred address, and then
//! defends that address for as long as it lives. Arbitration always favours the numerically lower
//! NAME; the loser either re-claims from the dynamic range (if it is arbitrary-address capable)
//! or falls silent.
use std::time::Instant;

use crate::config::NetworkConfiguration;
use crate::control_function::{CfHandle, CfRegistry};
use crate::frame::CanFrame;
use crate::id::CanId;
use crate::name::Name;
use crate::network::NetworkEvent;
use crate::pgn::{ADDRESS_CLAIM, DEFAULT_PRIORITY, GLOBAL_ADDRESS, NULL_ADDRESS, REQUEST};
use crate::queue::FrameQueue;

/// Where an internal control function is in its claim lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimState {
    /// Not yet started
    None,
    /// Ask the bus who has already claimed what
    SendRequestForClaim,
    /// Listening for claims during the contention window
    WaitForRequestContentionPeriod,
    /// Ready to announce a claim for the preferred address
    SendPreferredAddressClaim,
    /// Lost the preferred address; announce a claim from the dynamic range
    SendArbitraryAddressClaim,
    /// No claimable address; the control function stays off the bus
    UnableToClaim,
    /// Holding a claimed address and defending it
    AddressClaimingComplete,
}

/// Everything a claim state machine needs from the network for one step
pub struct ClaimContext<'a> {
    pub now: Instant,
    pub config: &'a NetworkConfiguration,
    pub registry: &'a mut CfRegistry,
    pub tx: &'a FrameQueue,
    pub events: &'a mut Vec<NetworkEvent>,
}

/// One instance per internal control function
#[derive(Debug)]
pub struct AddressClaimStateMachine {
    handle: CfHandle,
    channel: u8,
    name: Name,
    preferred_address: u8,
    claimed_address: u8,
    state: ClaimState,
    state_entered: Option<Instant>,
}

impl AddressClaimStateMachine {
    #[must_use]
    pub fn new(handle: CfHandle, name: Name, preferred_address: u8, channel: u8) -> Self {
        Self {
            handle,
            channel,
            name,
            preferred_address,
            claimed_address: NULL_ADDRESS,
            state: ClaimState::SendRequestForClaim,
            state_entered: None,
        }
    }

    #[must_use]
    pub fn handle(&self) -> CfHandle {
        self.handle
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    #[must_use]
    pub fn name(&self) -> Name {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> ClaimState {
        self.state
    }

    #[must_use]
    pub fn claimed_address(&self) -> u8 {
        self.claimed_address
    }

    /// Advance timers and emit any due frames
    pub fn update(&mut self, ctx: &mut ClaimContext) {
        match self.state {
            ClaimState::None | ClaimState::UnableToClaim => {}
            ClaimState::SendRequestForClaim => {
                // Request for address claim, sent from the NULL address to everybody
                let id = CanId::encode(DEFAULT_PRIORITY, REQUEST, GLOBAL_ADDRESS, NULL_ADDRESS)
                    .expect("request id is well formed");
                let pgn = ADDRESS_CLAIM;
                let data = [pgn as u8, (pgn >> 8) as u8, (pgn >> 16) as u8];
                if ctx.tx.try_push(CanFrame::new(self.channel, id, &data)) {
                    self.enter(ClaimState::WaitForRequestContentionPeriod, ctx.now);
                }
            }
            ClaimState::WaitForRequestContentionPeriod => {
                let deadline_passed = self
                    .state_entered
                    .is_some_and(|entered| ctx.now - entered >= ctx.config.address_claim_contention());
                if deadline_passed {
                    self.enter(ClaimState::SendPreferredAddressClaim, ctx.now);
                    // Claim in the same tick the window closes
                    self.update(ctx);
                }
            }
            ClaimState::SendPreferredAddressClaim | ClaimState::SendArbitraryAddressClaim => {
                match self.choose_address(ctx) {
                    Some(address) => {
                        if self.emit_claim(ctx, address) {
                            self.claimed_address = address;
                            ctx.registry.set_address(self.handle, address, true);
                            ctx.events.push(NetworkEvent::AddressClaimed {
                                handle: self.handle,
                                address,
                            });
                            tracing::debug!(
                                "Claimed address {address:#04X} on channel {} for NAME {:#018X}",
                                self.channel,
                                self.name.into_bits()
                            );
                            self.enter(ClaimState::AddressClaimingComplete, ctx.now);
                        }
                    }
                    None => self.fail_claim(ctx),
                }
            }
            ClaimState::AddressClaimingComplete => {}
        }
    }

    /// React to an address claim heard on our channel
    pub fn process_claim(&mut self, source_address: u8, claimed_name: Name, ctx: &mut ClaimContext) {
        if source_address == NULL_ADDRESS {
            // A claim from the NULL address is a cannot-claim announcement; for us it only means
            // somebody wants to know who is out there
            self.process_request_for_claim(GLOBAL_ADDRESS, ctx);
            return;
        }
        if claimed_name == self.name {
            if source_address != self.claimed_address {
                // Another stack instance is running with our NAME; start over
                tracing::warn!(
                    "Heard our own NAME {:#018X} claim {source_address:#04X}; re-contending",
                    self.name.into_bits()
                );
                self.restart(ctx);
            }
            return;
        }
        if self.state != ClaimState::AddressClaimingComplete
            || source_address != self.claimed_address
        {
            return;
        }

        if self.name < claimed_name {
            // Lower NAME wins: repeat our claim to push the contender off
            self.emit_claim(ctx, self.claimed_address);
        } else {
            ctx.events.push(NetworkEvent::AddressLost {
                handle: self.handle,
                address: self.claimed_address,
            });
            if self.name.arbitrary_address_capable() {
                ctx.registry.set_address(self.handle, self.claimed_address, false);
                self.enter(ClaimState::SendArbitraryAddressClaim, ctx.now);
                // Re-claim without waiting for the next tick
                self.update(ctx);
            } else {
                self.fail_claim(ctx);
            }
        }
    }

    /// Re-assert our claim after observing traffic that uses our address
    pub fn defend(&mut self, ctx: &mut ClaimContext) {
        if self.state == ClaimState::AddressClaimingComplete {
            self.emit_claim(ctx, self.claimed_address);
        }
    }

    /// React to a request for the address-claim PGN addressed to us (or to everybody)
    pub fn process_request_for_claim(&mut self, destination: u8, ctx: &mut ClaimContext) {
        if destination != GLOBAL_ADDRESS && destination != self.claimed_address {
            return;
        }
        match self.state {
            ClaimState::AddressClaimingComplete => {
                self.emit_claim(ctx, self.claimed_address);
            }
            ClaimState::UnableToClaim => {
                // Announce that we cannot claim, from the NULL address
                self.emit_claim_from(ctx, NULL_ADDRESS);
            }
            _ => {}
        }
    }

    fn restart(&mut self, ctx: &mut ClaimContext) {
        self.claimed_address = NULL_ADDRESS;
        ctx.registry.set_address(self.handle, NULL_ADDRESS, false);
        self.enter(ClaimState::SendRequestForClaim, ctx.now);
    }

    fn fail_claim(&mut self, ctx: &mut ClaimContext) {
        tracing::warn!(
            "No claimable address for NAME {:#018X} on channel {}",
            self.name.into_bits(),
            self.channel
        );
        ctx.registry.set_address(self.handle, self.claimed_address, false);
        ctx.events.push(NetworkEvent::UnableToClaim { handle: self.handle });
        self.enter(ClaimState::UnableToClaim, ctx.now);
    }

    /// Pick the address to claim: the preferred address unless a lower NAME holds it, otherwise
    /// the first free dynamic address for arbitrary-address-capable NAMEs
    fn choose_address(&self, ctx: &ClaimContext) -> Option<u8> {
        match ctx.registry.lookup_by_address(self.channel, self.preferred_address) {
            None => Some(self.preferred_address),
            Some(holder) if holder == self.handle => Some(self.preferred_address),
            Some(holder) => {
                let incumbent = ctx.registry.get(holder).name();
                if incumbent > Some(self.name) {
                    // We outrank the incumbent; claim and let them move
                    Some(self.preferred_address)
                } else if self.name.arbitrary_address_capable() {
                    ctx.registry.next_free_dynamic_address(self.channel)
                } else {
                    None
                }
            }
        }
    }

    fn emit_claim(&self, ctx: &mut ClaimContext, address: u8) -> bool {
        self.emit_claim_from(ctx, address)
    }

    fn emit_claim_from(&self, ctx: &mut ClaimContext, source: u8) -> bool {
        let id = CanId::encode(DEFAULT_PRIORITY, ADDRESS_CLAIM, GLOBAL_ADDRESS, source)
            .expect("claim id is well formed");
        ctx.tx
            .try_push(CanFrame::new(self.channel, id, &self.name.to_claim_bytes()))
    }

    fn enter(&mut self, state: ClaimState, now: Instant) {
        self.state = state;
        self.state_entered = Some(now);
    }
}
