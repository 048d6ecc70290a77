//! The registry of every control function observed, partnered, or hosted on any channel
//!
//! Control functions are owned by value in an arena; everything else refers to them through
//! [CfHandle] indices. Sessions and callbacks never hold references into the registry, which is
//! what lets a destroyed control function tear down its sessions with a direct call instead of
//! weak pointers.
use crate::name::{Name, NameFilter, matches_filters};
use crate::pgn::{GLOBAL_ADDRESS, NULL_ADDRESS};

/// A stable index into the control-function arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CfHandle(pub(crate) usize);

impl CfHandle {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// How a control function is known to this stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfKind {
    /// Hosted by this stack; owns an address-claim state machine
    Internal,
    /// A remote control function we were told to watch for by NAME filters
    Partnered,
    /// Observed on the bus but uncategorised
    External,
}

/// The identity and current address of one ECU on one channel
#[derive(Clone, Debug)]
pub struct ControlFunction {
    kind: CfKind,
    channel: u8,
    /// Unknown for partnered control functions whose match has not claimed yet
    name: Option<Name>,
    address: u8,
    address_valid: bool,
    alive: bool,
}

impl ControlFunction {
    #[must_use]
    pub fn kind(&self) -> CfKind {
        self.kind
    }

    #[must_use]
    pub fn channel(&self) -> u8 {
        self.channel
    }

    #[must_use]
    pub fn name(&self) -> Option<Name> {
        self.name
    }

    #[must_use]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// False until an address has been claimed (internal) or observed (partnered/external), and
    /// after the control function loses its address in arbitration
    #[must_use]
    pub fn address_valid(&self) -> bool {
        self.address_valid
    }
}

/// What [CfRegistry::observe] did with a received address claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserveOutcome {
    /// The arena entry for the claimant
    pub handle: CfHandle,
    /// A control function that previously held the claimed address and lost it
    pub displaced: Option<CfHandle>,
    /// True if the claimant now validly holds the address it claimed
    pub claim_won: bool,
}

#[derive(Debug)]
struct PartnerDescriptor {
    channel: u8,
    filters: Vec<NameFilter>,
    entry: CfHandle,
    resolved: bool,
}

/// Owns the canonical `(channel, address) -> CF` and `(channel, NAME) -> CF` mappings
#[derive(Debug, Default)]
pub struct CfRegistry {
    arena: Vec<ControlFunction>,
    partners: Vec<PartnerDescriptor>,
}

impl CfRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, handle: CfHandle) -> &ControlFunction {
        &self.arena[handle.0]
    }

    /// Register a control function hosted by this stack
    ///
    /// The entry starts at the NULL address with `address_valid = false`; the address-claim state
    /// machine moves it from there.
    pub fn create_internal(&mut self, name: Name, channel: u8) -> CfHandle {
        self.push(ControlFunction {
            kind: CfKind::Internal,
            channel,
            name: Some(name),
            address: NULL_ADDRESS,
            address_valid: false,
            alive: true,
        })
    }

    /// Register a partner descriptor; the entry resolves once a matching NAME claims
    pub fn create_partnered(&mut self, channel: u8, filters: Vec<NameFilter>) -> CfHandle {
        let entry = self.push(ControlFunction {
            kind: CfKind::Partnered,
            channel,
            name: None,
            address: NULL_ADDRESS,
            address_valid: false,
            alive: true,
        });
        self.partners.push(PartnerDescriptor {
            channel,
            filters,
            entry,
            resolved: false,
        });
        entry
    }

    /// Process a received address claim
    ///
    /// Creates or updates the claimant's arena entry (resolving a pending partner descriptor if
    /// the NAME matches one) and settles the address slot: of all live control functions claiming
    /// the same address on the same channel, the numerically lowest NAME keeps it.
    pub fn observe(&mut self, channel: u8, name: Name, claimed_address: u8) -> Option<ObserveOutcome> {
        if claimed_address == NULL_ADDRESS || claimed_address == GLOBAL_ADDRESS {
            return None;
        }

        let handle = match self.find_by_name(channel, name) {
            Some(existing) => existing,
            None => match self.resolve_partner(channel, name) {
                Some(partner) => partner,
                None => self.push(ControlFunction {
                    kind: CfKind::External,
                    channel,
                    name: Some(name),
                    address: NULL_ADDRESS,
                    address_valid: false,
                    alive: true,
                }),
            },
        };

        // Settle the address slot
        let holder = self.arena.iter().position(|cf| {
            cf.alive
                && cf.address_valid
                && cf.channel == channel
                && cf.address == claimed_address
                && cf.name != Some(name)
        });
        let mut displaced = None;
        let mut claim_won = true;
        if let Some(holder) = holder {
            let holder_name = self.arena[holder].name;
            if holder_name < Some(name) {
                // The incumbent has the lower NAME; the claimant will have to move
                claim_won = false;
            } else {
                self.arena[holder].address_valid = false;
                displaced = Some(CfHandle(holder));
                tracing::debug!(
                    "CF {holder} displaced from address {claimed_address:#04X} on channel {channel} by lower NAME {:#018X}",
                    name.into_bits()
                );
            }
        }

        let cf = &mut self.arena[handle.0];
        cf.address = claimed_address;
        cf.address_valid = claim_won;
        tracing::trace!(
            "Observed claim: NAME {:#018X} at address {claimed_address:#04X} on channel {channel} (won: {claim_won})",
            name.into_bits()
        );
        Some(ObserveOutcome {
            handle,
            displaced,
            claim_won,
        })
    }

    /// Update an internal control function's address from its claim state machine
    ///
    /// Claiming an address displaces any other live holder of that slot; the claim machine only
    /// does this when it has arbitration priority.
    pub(crate) fn set_address(&mut self, handle: CfHandle, address: u8, valid: bool) {
        if valid {
            let channel = self.arena[handle.0].channel;
            if let Some(holder) = self.lookup_by_address(channel, address) {
                if holder != handle {
                    self.arena[holder.0].address_valid = false;
                }
            }
        }
        let cf = &mut self.arena[handle.0];
        cf.address = address;
        cf.address_valid = valid;
    }

    #[must_use]
    pub fn lookup_by_address(&self, channel: u8, address: u8) -> Option<CfHandle> {
        self.arena
            .iter()
            .position(|cf| {
                cf.alive && cf.address_valid && cf.channel == channel && cf.address == address
            })
            .map(CfHandle)
    }

    #[must_use]
    pub fn lookup_by_name(&self, channel: u8, name: Name) -> Option<CfHandle> {
        self.find_by_name(channel, name)
    }

    /// Every live internal control function on the channel
    pub fn internals(&self, channel: u8) -> impl Iterator<Item = CfHandle> + '_ {
        self.arena
            .iter()
            .enumerate()
            .filter(move |(_, cf)| cf.alive && cf.kind == CfKind::Internal && cf.channel == channel)
            .map(|(index, _)| CfHandle(index))
    }

    /// The next unclaimed address in the dynamic range 128..=247, if any
    #[must_use]
    pub fn next_free_dynamic_address(&self, channel: u8) -> Option<u8> {
        crate::pgn::DYNAMIC_ADDRESS_RANGE
            .clone()
            .find(|&addr| self.lookup_by_address(channel, addr).is_none())
    }

    /// Remove a control function from the registry
    ///
    /// Returns the entry so the network can cancel its transport sessions.
    pub fn destroy(&mut self, handle: CfHandle) -> Option<ControlFunction> {
        let cf = self.arena.get_mut(handle.0)?;
        if !cf.alive {
            return None;
        }
        cf.alive = false;
        cf.address_valid = false;
        self.partners.retain(|p| p.entry != handle);
        Some(self.arena[handle.0].clone())
    }

    #[must_use]
    pub fn is_alive(&self, handle: CfHandle) -> bool {
        self.arena.get(handle.0).is_some_and(|cf| cf.alive)
    }

    fn push(&mut self, cf: ControlFunction) -> CfHandle {
        self.arena.push(cf);
        CfHandle(self.arena.len() - 1)
    }

    fn find_by_name(&self, channel: u8, name: Name) -> Option<CfHandle> {
        self.arena
            .iter()
            .position(|cf| cf.alive && cf.channel == channel && cf.name == Some(name))
            .map(CfHandle)
    }

    /// Bind the first unresolved partner descriptor whose filter set matches the NAME
    fn resolve_partner(&mut self, channel: u8, name: Name) -> Option<CfHandle> {
        let descriptor = self
            .partners
            .iter_mut()
            .find(|p| !p.resolved && p.channel == channel && matches_filters(&p.filters, name))?;
        descriptor.resolved = true;
        let entry = descriptor.entry;
        self.arena[entry.0].name = Some(name);
        tracing::debug!(
            "Partner {} resolved to NAME {:#018X} on channel {channel}",
            entry.0,
            name.into_bits()
        );
        Some(entry)
    }
}
