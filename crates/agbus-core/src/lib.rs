//! An ISO 11783 (ISOBUS) / SAE J1939 communication core
//!
//! The pieces that turn a raw 29-bit CAN bus into an addressable, reliable, multi-packet message
//! transport for cooperating ECUs:
//!
//! * [name] and [control_function] - 64-bit NAMEs and the registry of who is on the bus
//! * [address_claim] - claiming and defending 8-bit bus addresses per J1939-81
//! * [id] and [frame] - the identifier codec and frame/message types
//! * [network] - the [Network](network::Network) value that routes everything
//! * [transport] - TP, ETP, and NMEA 2000 fast packet reassembly and transmission
//! * [pgn_request] - 0xEA00 requests, acknowledgements, and repetition rates
//!
//! Hardware drivers live behind the queue seam in the `agbus-hw` crate; the core never touches
//! the wire directly.
pub mod address_claim;
pub mod config;
pub mod control_function;
pub mod frame;
pub mod id;
pub mod name;
pub mod network;
pub mod pgn;
pub mod pgn_request;
pub mod queue;
pub mod time;
pub mod transport;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
