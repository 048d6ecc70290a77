//! Wire-level frame builders shared by the integration tests
//!
//! Everything here builds frames the way a remote ECU would put them on the bus, so tests can
//! play the peer side of address-claim and transport exchanges byte for byte.
use agbus_core::frame::CanFrame;
use agbus_core::id::CanId;
use agbus_core::name::Name;
use agbus_core::pgn;
use agbus_core::queue::FrameQueue;

/// Pop everything out of a frame queue
pub fn drain(queue: &FrameQueue) -> Vec<CanFrame> {
    std::iter::from_fn(|| queue.pop()).collect()
}

fn write_u24(buf: &mut [u8], value: u32) {
    buf[0] = value as u8;
    buf[1] = (value >> 8) as u8;
    buf[2] = (value >> 16) as u8;
}

/// An address claim broadcast by `source`
pub fn claim_frame(channel: u8, source: u8, name: Name) -> CanFrame {
    let id = CanId::encode(6, pgn::ADDRESS_CLAIM, pgn::GLOBAL_ADDRESS, source).unwrap();
    CanFrame::new(channel, id, &name.to_claim_bytes())
}

/// A request for `requested` addressed to `destination`
pub fn request_frame(channel: u8, requested: u32, source: u8, destination: u8) -> CanFrame {
    let id = CanId::encode(6, pgn::REQUEST, destination, source).unwrap();
    let mut data = [0u8; 3];
    write_u24(&mut data, requested);
    CanFrame::new(channel, id, &data)
}

fn tp_cm(channel: u8, source: u8, destination: u8, payload: [u8; 8]) -> CanFrame {
    let id = CanId::encode(7, pgn::TP_CONNECTION_MANAGEMENT, destination, source).unwrap();
    CanFrame::new(channel, id, &payload)
}

/// TP.CM_RTS announcing `bytes` of `message_pgn` in `packets` packets
pub fn tp_rts(channel: u8, source: u8, destination: u8, bytes: u16, packets: u8, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x10;
    payload[1] = bytes as u8;
    payload[2] = (bytes >> 8) as u8;
    payload[3] = packets;
    write_u24(&mut payload[5..8], message_pgn);
    tp_cm(channel, source, destination, payload)
}

/// TP.CM_CTS clearing `packets` packets starting at `next`
pub fn tp_cts(channel: u8, source: u8, destination: u8, packets: u8, next: u8, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x11;
    payload[1] = packets;
    payload[2] = next;
    write_u24(&mut payload[5..8], message_pgn);
    tp_cm(channel, source, destination, payload)
}

/// TP.CM_EndofMsgACK for a completed transfer
pub fn tp_eoma(channel: u8, source: u8, destination: u8, bytes: u16, packets: u8, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x13;
    payload[1] = bytes as u8;
    payload[2] = (bytes >> 8) as u8;
    payload[3] = packets;
    write_u24(&mut payload[5..8], message_pgn);
    tp_cm(channel, source, destination, payload)
}

/// TP.CM_BAM broadcasting `bytes` of `message_pgn` in `packets` packets
pub fn tp_bam(channel: u8, source: u8, bytes: u16, packets: u8, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x20;
    payload[1] = bytes as u8;
    payload[2] = (bytes >> 8) as u8;
    payload[3] = packets;
    write_u24(&mut payload[5..8], message_pgn);
    tp_cm(channel, source, pgn::GLOBAL_ADDRESS, payload)
}

/// TP.Conn_Abort with a raw reason byte
pub fn tp_abort(channel: u8, source: u8, destination: u8, reason: u8, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0xFF;
    payload[1] = reason;
    write_u24(&mut payload[5..8], message_pgn);
    tp_cm(channel, source, destination, payload)
}

/// A TP.DT data frame carrying up to 7 payload bytes, padded with 0xFF
pub fn tp_data(channel: u8, source: u8, destination: u8, sequence: u8, data: &[u8]) -> CanFrame {
    let id = CanId::encode(7, pgn::TP_DATA_TRANSFER, destination, source).unwrap();
    let mut payload = [0xFFu8; 8];
    payload[0] = sequence;
    payload[1..1 + data.len()].copy_from_slice(data);
    CanFrame::new(channel, id, &payload)
}

/// Split a message into TP.DT frames, sequence numbers starting at 1
pub fn tp_data_frames(channel: u8, source: u8, destination: u8, message: &[u8]) -> Vec<CanFrame> {
    message
        .chunks(7)
        .enumerate()
        .map(|(index, chunk)| tp_data(channel, source, destination, index as u8 + 1, chunk))
        .collect()
}

fn etp_cm(channel: u8, source: u8, destination: u8, payload: [u8; 8]) -> CanFrame {
    let id = CanId::encode(7, pgn::ETP_CONNECTION_MANAGEMENT, destination, source).unwrap();
    CanFrame::new(channel, id, &payload)
}

/// ETP.CM_RTS announcing `bytes` of `message_pgn`
pub fn etp_rts(channel: u8, source: u8, destination: u8, bytes: u32, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x14;
    payload[1..5].copy_from_slice(&bytes.to_le_bytes());
    write_u24(&mut payload[5..8], message_pgn);
    etp_cm(channel, source, destination, payload)
}

/// ETP.CM_CTS clearing `packets` packets starting at absolute packet `next`
pub fn etp_cts(channel: u8, source: u8, destination: u8, packets: u8, next: u32, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x15;
    payload[1] = packets;
    write_u24(&mut payload[2..5], next);
    write_u24(&mut payload[5..8], message_pgn);
    etp_cm(channel, source, destination, payload)
}

/// ETP.CM_DPO declaring the absolute position of the next burst
pub fn etp_dpo(channel: u8, source: u8, destination: u8, packets: u8, offset: u32, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x16;
    payload[1] = packets;
    write_u24(&mut payload[2..5], offset);
    write_u24(&mut payload[5..8], message_pgn);
    etp_cm(channel, source, destination, payload)
}

/// ETP.CM_EOMA for a completed transfer
pub fn etp_eoma(channel: u8, source: u8, destination: u8, bytes: u32, message_pgn: u32) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = 0x17;
    payload[1..5].copy_from_slice(&bytes.to_le_bytes());
    write_u24(&mut payload[5..8], message_pgn);
    etp_cm(channel, source, destination, payload)
}

/// An ETP.DT data frame with an in-burst sequence number
pub fn etp_data(channel: u8, source: u8, destination: u8, sequence: u8, data: &[u8]) -> CanFrame {
    let id = CanId::encode(7, pgn::ETP_DATA_TRANSFER, destination, source).unwrap();
    let mut payload = [0xFFu8; 8];
    payload[0] = sequence;
    payload[1..1 + data.len()].copy_from_slice(data);
    CanFrame::new(channel, id, &payload)
}

/// A fast packet frame: `(counter << 5) | index` header, first frame carries the total length
pub fn fast_packet_frame(
    channel: u8,
    id: CanId,
    counter: u8,
    index: u8,
    total_len: Option<u8>,
    data: &[u8],
) -> CanFrame {
    let mut payload = [0xFFu8; 8];
    payload[0] = (counter << 5) | (index & 0x1F);
    let offset = match total_len {
        Some(len) => {
            payload[1] = len;
            2
        }
        None => 1,
    };
    payload[offset..offset + data.len()].copy_from_slice(data);
    CanFrame::new(channel, id, &payload)
}
