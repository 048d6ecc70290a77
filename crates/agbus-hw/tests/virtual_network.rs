//! Two full stacks talking over the in-process virtual bus
use std::time::{Duration, Instant};

use agbus_core::config::NetworkConfiguration;
use agbus_core::name::{Name, NameFilter, NameParameter};
use agbus_core::network::Network;
use agbus_hw::{HardwareInterface, VirtualBus};
use pretty_assertions::assert_eq;

#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .with_ansi(true)
        .init();
}

fn spin_until(networks: &mut [&mut Network], mut done: impl FnMut(&[&mut Network]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        for network in networks.iter_mut() {
            network.update();
        }
        if done(networks) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the networks");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Two stacks claim addresses and resolve each other as partners, like two real ECUs would
#[test]
fn test_partnered_claim_over_virtual_bus() {
    let bus = VirtualBus::new();

    let mut first = Network::new(1, NetworkConfiguration::default());
    let mut first_hw = HardwareInterface::new(first.rx_queue(), first.tx_queue());
    first_hw.add_channel(Box::new(bus.plugin())).unwrap();
    first_hw.start().unwrap();

    let mut second = Network::new(1, NetworkConfiguration::default());
    let mut second_hw = HardwareInterface::new(second.rx_queue(), second.tx_queue());
    second_hw.add_channel(Box::new(bus.plugin())).unwrap();
    second_hw.start().unwrap();

    let mut first_name = Name::new();
    first_name.set_arbitrary_address_capable(true);
    first_name.set_industry_group(1);
    first_name.set_function_code(130);
    first_name.set_identity_number(1);
    first_name.set_manufacturer_code(69);
    let first_internal = first.create_internal_cf(first_name, 0x1C, 0).unwrap();

    let mut second_name = Name::new();
    second_name.set_arbitrary_address_capable(true);
    second_name.set_industry_group(1);
    second_name.set_function_code(25);
    second_name.set_identity_number(2);
    second_name.set_manufacturer_code(69);
    let second_internal = second.create_internal_cf(second_name, 0x1D, 0).unwrap();

    let first_partner = first
        .create_partnered_cf(0, vec![NameFilter::new(NameParameter::FunctionCode, 25)])
        .unwrap();
    let second_partner = second
        .create_partnered_cf(0, vec![NameFilter::new(NameParameter::FunctionCode, 130)])
        .unwrap();

    spin_until(&mut [&mut first, &mut second], |networks| {
        networks[0].control_function(first_partner).address_valid()
            && networks[1].control_function(second_partner).address_valid()
    });

    assert!(first.control_function(first_internal).address_valid());
    assert!(second.control_function(second_internal).address_valid());
    assert_eq!(first.control_function(first_partner).address(), 0x1D);
    assert_eq!(second.control_function(second_partner).address(), 0x1C);

    first_hw.stop();
    second_hw.stop();
}

/// A TP broadcast crosses the virtual bus from one stack to the other
#[test]
fn test_broadcast_over_virtual_bus() {
    let bus = VirtualBus::new();

    let mut sender = Network::new(1, NetworkConfiguration::default());
    let mut sender_hw = HardwareInterface::new(sender.rx_queue(), sender.tx_queue());
    sender_hw.add_channel(Box::new(bus.plugin())).unwrap();
    sender_hw.start().unwrap();

    let mut receiver = Network::new(1, NetworkConfiguration::default());
    let mut receiver_hw = HardwareInterface::new(receiver.rx_queue(), receiver.tx_queue());
    receiver_hw.add_channel(Box::new(bus.plugin())).unwrap();
    receiver_hw.start().unwrap();

    let internal = sender
        .create_internal_cf(Name::from_bits(0x100), 0x01, 0)
        .unwrap();
    let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&captured);
    receiver.add_global_pgn_callback(
        0xFEEC,
        Box::new(move |message| sink.lock().unwrap().push(message.data.clone())),
    );

    spin_until(&mut [&mut sender, &mut receiver], |networks| {
        networks[0].control_function(internal).address_valid()
    });

    let payload: Vec<u8> = (1..=17).collect();
    sender
        .send_message(0xFEEC, &payload, internal, None, 6)
        .unwrap();

    spin_until(&mut [&mut sender, &mut receiver], |_| {
        !captured.lock().unwrap().is_empty()
    });
    assert_eq!(captured.lock().unwrap()[0], payload);

    sender_hw.stop();
    receiver_hw.stop();
}
