//! The parameter group numbers and reserved addresses the core traffics in

/// PGN Request (PGN 59904)
pub const REQUEST: u32 = 0xEA00;
/// Acknowledgement (PGN 59392)
pub const ACKNOWLEDGEMENT: u32 = 0xE800;
/// Address Claim (PGN 60928)
pub const ADDRESS_CLAIM: u32 = 0xEE00;
/// Transport Protocol Connection Management (TP.CM, PGN 60416)
pub const TP_CONNECTION_MANAGEMENT: u32 = 0xEC00;
/// Transport Protocol Data Transfer (TP.DT, PGN 60160)
pub const TP_DATA_TRANSFER: u32 = 0xEB00;
/// Extended Transport Protocol Connection Management (ETP.CM, PGN 51200)
pub const ETP_CONNECTION_MANAGEMENT: u32 = 0xC800;
/// Extended Transport Protocol Data Transfer (ETP.DT, PGN 50944)
pub const ETP_DATA_TRANSFER: u32 = 0xC700;
/// Request for Repetition Rate (PGN 52224)
pub const REQUEST_FOR_REPETITION_RATE: u32 = 0xCC00;

/// The "send to everybody" destination address
pub const GLOBAL_ADDRESS: u8 = 0xFF;
/// The NULL address, used as the source of an ECU that has not (yet) claimed an address
pub const NULL_ADDRESS: u8 = 0xFE;

/// The dynamic address range an arbitrary-address-capable ECU may claim from
pub const DYNAMIC_ADDRESS_RANGE: std::ops::RangeInclusive<u8> = 128..=247;

/// The default priority for application messages
pub const DEFAULT_PRIORITY: u8 = 6;
/// The priority used for TP/ETP connection management and data frames
pub const TRANSPORT_PRIORITY: u8 = 7;
