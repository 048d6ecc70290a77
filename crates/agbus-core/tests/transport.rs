//! Transport protocol scenarios against full networks
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agbus_core::config::NetworkConfiguration;
use agbus_core::frame::{CanFrame, CanMessage};
use agbus_core::name::Name;
use agbus_core::network::{Network, NetworkEvent};
use agbus_core::pgn;
use agbus_core::time::ManualClock;
use agbus_test::{drain, tp_bam, tp_cts, tp_data, tp_data_frames, tp_eoma, tp_rts};
use pretty_assertions::assert_eq;

#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}

fn network_with(config: NetworkConfiguration) -> (Network, ManualClock) {
    let clock = ManualClock::new();
    (
        Network::with_clock(1, config, Box::new(clock.clone())),
        clock,
    )
}

/// Claim an address for an internal CF, consuming the claim traffic
fn claimed_internal(
    network: &mut Network,
    clock: &ManualClock,
    name_bits: u64,
    address: u8,
) -> agbus_core::control_function::CfHandle {
    let handle = network
        .create_internal_cf(Name::from_bits(name_bits), address, 0)
        .unwrap();
    network.update();
    clock.advance(Duration::from_millis(250));
    network.update();
    drain(&network.tx_queue());
    while network.poll_event().is_some() {}
    handle
}

/// Collect messages delivered to a global callback
fn capture_messages(network: &mut Network, pgn: u32) -> Arc<Mutex<Vec<CanMessage>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    network.add_global_pgn_callback(
        pgn,
        Box::new(move |message| sink.lock().unwrap().push(message.clone())),
    );
    captured
}

/// S3: destination-specific 23 bytes; the receiver's 2-packet CTS window is honoured
#[test]
fn test_destination_specific_send_honours_receiver_window() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let originator = claimed_internal(&mut network, &clock, 0x123, 0x01);
    // The peer at 0x02 becomes known by claiming its own address
    network.inject_frame(agbus_test::claim_frame(0, 0x02, Name::from_bits(0x456)));
    network.update();
    let receiver = network.registry().lookup_by_address(0, 0x02).unwrap();

    let payload: Vec<u8> = (1..=23).collect();
    network
        .send_message(0xFEEB, &payload, originator, Some(receiver), 6)
        .unwrap();
    network.update();

    // RTS first
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0x10);
    assert_eq!(frames[0].data()[1], 23);
    assert_eq!(frames[0].data()[3], 4);

    // The receiver clears 2 packets per burst
    network.inject_frame(tp_cts(0, 0x02, 0x01, 2, 1, 0xFEEB));
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data(), &[0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
    assert_eq!(frames[1].data(), &[0x02, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E]);

    network.inject_frame(tp_cts(0, 0x02, 0x01, 2, 3, 0xFEEB));
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data()[0], 3);
    assert_eq!(frames[1].data(), &[0x04, 0x16, 0x17, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

    network.inject_frame(tp_eoma(0, 0x02, 0x01, 23, 4, 0xFEEB));
    network.update();
    assert_eq!(network.live_sessions(0), 0);
    let events: Vec<_> = std::iter::from_fn(|| network.poll_event()).collect();
    assert!(events.iter().any(|e| matches!(
        e,
        NetworkEvent::TransportDone { pgn: 0xFEEB, destination: 0x02, ok: true, .. }
    )));
}

/// S4 (transmit half): BAM, then data frames at least 50ms apart, last frame 0xFF padded
#[test]
fn test_bam_transmit_pacing() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let originator = claimed_internal(&mut network, &clock, 0x123, 0x01);

    let payload: Vec<u8> = (1..=17).collect();
    network
        .send_message(0xFEEC, &payload, originator, None, 6)
        .unwrap();
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data(), &[0x20, 0x11, 0x00, 0x03, 0xFF, 0xEC, 0xFE, 0x00]);

    // Ticking every 4ms, a data frame appears only once per 50ms interval
    let mut data_frames = Vec::new();
    for _ in 0..40 {
        clock.advance(Duration::from_millis(4));
        network.update();
        let emitted = drain(&network.tx_queue());
        assert!(emitted.len() <= 1);
        if let Some(frame) = emitted.first() {
            data_frames.push(*frame);
        }
    }
    assert_eq!(data_frames.len(), 3);
    assert_eq!(data_frames[0].data()[0], 1);
    assert_eq!(data_frames[2].data(), &[0x03, 0x0F, 0x10, 0x11, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert_eq!(network.live_sessions(0), 0);
}

/// S4 (receive half): a BAM reassembles into one 17-byte message
#[test]
fn test_bam_receive_delivers_message() {
    let (mut network, _clock) = network_with(NetworkConfiguration::default());
    let captured = capture_messages(&mut network, 0xFEEC);

    let payload: Vec<u8> = (1..=17).collect();
    network.inject_frame(tp_bam(0, 0x01, 17, 3, 0xFEEC));
    for frame in tp_data_frames(0, 0x01, pgn::GLOBAL_ADDRESS, &payload) {
        network.inject_frame(frame);
    }
    network.update();

    let messages = captured.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].pgn, 0xFEEC);
    assert_eq!(messages[0].src, 0x01);
    assert!(messages[0].is_broadcast());
    assert_eq!(messages[0].data, payload);
}

/// S5: an incomplete BAM dies silently after T1
#[test]
fn test_bam_timeout_is_silent() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let captured = capture_messages(&mut network, 0xFEEC);

    network.inject_frame(tp_bam(0, 0x01, 17, 3, 0xFEEC));
    network.inject_frame(tp_data(0, 0x01, pgn::GLOBAL_ADDRESS, 1, &[1, 2, 3, 4, 5, 6, 7]));
    network.inject_frame(tp_data(0, 0x01, pgn::GLOBAL_ADDRESS, 2, &[8, 9, 10, 11, 12, 13, 14]));
    network.update();
    assert_eq!(network.live_sessions(0), 1);

    clock.advance(Duration::from_millis(750));
    network.update();
    assert_eq!(network.live_sessions(0), 0);
    assert!(captured.lock().unwrap().is_empty());
    assert!(drain(&network.tx_queue()).is_empty());
    assert!(network.poll_event().is_none());
}

/// S7: with the cap at one session, a second RTS is refused with reason 2
#[test]
fn test_session_cap() {
    let config = NetworkConfiguration {
        max_concurrent_sessions: 1,
        ..Default::default()
    };
    let (mut network, clock) = network_with(config);
    claimed_internal(&mut network, &clock, 0x123, 0x10);

    network.inject_frame(tp_rts(0, 0x0A, 0x10, 100, 15, 0xFEEB));
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0x11, "first RTS is answered with a CTS");
    assert_eq!(network.live_sessions(0), 1);

    network.inject_frame(tp_rts(0, 0x0B, 0x10, 100, 15, 0xFEEB));
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0xFF);
    assert_eq!(frames[0].data()[1], 2, "refused with reason 2 (out of resources)");
    assert_eq!(frames[0].dst(), 0x0B);
    assert_eq!(network.live_sessions(0), 1, "no second session was created");
}

/// Destination-specific receive delivers the message and acknowledges with EOMA
#[test]
fn test_destination_specific_receive() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    claimed_internal(&mut network, &clock, 0x123, 0x10);
    let captured = capture_messages(&mut network, 0xFEEB);

    let payload: Vec<u8> = (0..23).collect();
    network.inject_frame(tp_rts(0, 0x0A, 0x10, 23, 4, 0xFEEB));
    network.update();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0x11);
    assert_eq!(frames[0].data()[1], 4, "whole message in one burst");

    for frame in tp_data_frames(0, 0x0A, 0x10, &payload) {
        network.inject_frame(frame);
    }
    network.update();

    let messages = captured.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, payload);
    assert_eq!(messages[0].dst, 0x10);
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0x13, "EOMA closes the session");
    assert_eq!(network.live_sessions(0), 0);
}

/// Destroying a CF cancels its sessions and aborts established ones
#[test]
fn test_destroy_cf_cancels_sessions() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let internal = claimed_internal(&mut network, &clock, 0x123, 0x10);

    network.inject_frame(tp_rts(0, 0x0A, 0x10, 100, 15, 0xFEEB));
    network.update();
    drain(&network.tx_queue());
    assert_eq!(network.live_sessions(0), 1);

    network.destroy_cf(internal);
    assert_eq!(network.live_sessions(0), 0);
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data()[0], 0xFF, "the established session gets an abort");
    assert_eq!(frames[0].dst(), 0x0A);
}

/// Sending over 1785 bytes without a destination is refused synchronously
#[test]
fn test_cannot_broadcast_large() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let originator = claimed_internal(&mut network, &clock, 0x123, 0x01);
    let err = network
        .send_message(0xFEEB, &vec![0u8; 2000], originator, None, 6)
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<agbus_core::network::SendError>(),
        Some(&agbus_core::network::SendError::CannotBroadcastLarge)
    );
}

/// A CF that has not finished claiming cannot source messages
#[test]
fn test_send_requires_valid_address() {
    let (mut network, _clock) = network_with(NetworkConfiguration::default());
    let handle = network
        .create_internal_cf(Name::from_bits(0x123), 0x01, 0)
        .unwrap();
    // No updates yet, so no address has been claimed
    let err = network.send_message(0xFEEB, &[0u8; 4], handle, None, 6).unwrap_err();
    assert_eq!(
        err.downcast_ref::<agbus_core::network::SendError>(),
        Some(&agbus_core::network::SendError::InvalidSource)
    );
}

/// A short message goes out as a single frame with the requested priority
#[test]
fn test_short_send() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    let originator = claimed_internal(&mut network, &clock, 0x123, 0x01);
    network
        .send_message(0xFECA, &[0xDE, 0xAD, 0xBE, 0xEF], originator, None, 3)
        .unwrap();
    let frames = drain(&network.tx_queue());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id.raw(), 0x0CFECA01);
    assert_eq!(frames[0].data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
}

/// An unrelated frame is untouched by a session abort (containment)
#[test]
fn test_session_failure_is_contained() {
    let (mut network, clock) = network_with(NetworkConfiguration::default());
    claimed_internal(&mut network, &clock, 0x123, 0x10);
    let captured = capture_messages(&mut network, 0xFECA);

    // A session from 0x0A goes bad with an out-of-sequence frame
    network.inject_frame(tp_rts(0, 0x0A, 0x10, 23, 4, 0xFEEB));
    network.update();
    drain(&network.tx_queue());
    network.inject_frame(tp_data(0, 0x0A, 0x10, 3, &[0; 7]));

    // Meanwhile a plain message from 0x0B arrives
    let id = agbus_core::id::CanId::new(0x18FECA0B);
    network.inject_frame(CanFrame::new(0, id, &[0x01]));
    network.update();

    assert_eq!(network.live_sessions(0), 0, "the bad session is gone");
    let messages = captured.lock().unwrap();
    assert_eq!(messages.len(), 1, "unrelated traffic is unaffected");
}
