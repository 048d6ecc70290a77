//! [CanFrame]s are restricted to 8 bytes, [CanMessage]s are arbitrarily sized
use std::io::Write;

use serde::ser::SerializeStruct;

use crate::control_function::CfHandle;
use crate::id::CanId;

/// A single 29-bit-identifier CAN frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanFrame {
    /// Which bus the frame was seen on (or should be written to)
    pub channel: u8,
    pub id: CanId,
    /// 29-bit identifier; everything J1939 emits is extended, but drivers may yield 11-bit
    /// frames, which the core ignores
    pub extended: bool,
    /// Microsecond receive timestamp, attached on ingress
    pub timestamp_us: Option<u64>,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame from up to 8 payload bytes
    ///
    /// # Panics
    ///
    /// If `data` is longer than 8 bytes.
    #[must_use]
    pub fn new(channel: u8, id: CanId, data: &[u8]) -> Self {
        assert!(data.len() <= 8, "CAN frames carry at most 8 bytes");
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Self {
            channel,
            id,
            extended: true,
            timestamp_us: None,
            dlc: data.len() as u8,
            data: buf,
        }
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    #[inline]
    #[must_use]
    pub fn dlc(&self) -> usize {
        self.dlc as usize
    }

    #[inline]
    #[must_use]
    pub fn pgn(&self) -> u32 {
        self.id.pgn()
    }

    #[inline]
    #[must_use]
    pub fn src(&self) -> u8 {
        self.id.source_address()
    }

    #[inline]
    #[must_use]
    pub fn dst(&self) -> u8 {
        self.id.destination_address()
    }

    #[inline]
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.id.priority()
    }

    /// Write the frame in candump -L format
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(
            writer,
            "({:.6}) can{} {}#{}",
            self.timestamp_us.unwrap_or(0) as f64 / 1e6,
            self.channel,
            hex::encode_upper(self.id.raw().to_be_bytes()),
            hex::encode_upper(self.data())
        )
    }
}

/// A logical message, possibly reassembled from several [CanFrame]s
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CanMessage {
    pub channel: u8,
    /// The identifier the message was (or would have been) sent under as a single frame
    pub id: CanId,
    pub priority: u8,
    pub pgn: u32,
    pub src: u8,
    pub dst: u8,
    pub data: Vec<u8>,
    pub timestamp_us: Option<u64>,
    /// The registry entry for the sender, if its NAME has been observed
    pub source_handle: Option<CfHandle>,
    /// The registry entry for the receiver, for destination-specific messages
    pub destination_handle: Option<CfHandle>,
}

impl From<CanFrame> for CanMessage {
    fn from(frame: CanFrame) -> CanMessage {
        CanMessage {
            channel: frame.channel,
            id: frame.id,
            priority: frame.priority(),
            pgn: frame.pgn(),
            src: frame.src(),
            dst: frame.dst(),
            data: frame.data().to_vec(),
            timestamp_us: frame.timestamp_us,
            source_handle: None,
            destination_handle: None,
        }
    }
}

impl CanMessage {
    /// Build a logical message as if it had arrived under the given PGN as one big frame
    ///
    /// Transport sessions announce a PGN that differs from the PGN of the frames that carry the
    /// session, so the identifier is reconstructed here from the announced PGN and the addresses
    /// of the announcing frame.
    #[must_use]
    pub fn assembled(pgn: u32, priority: u8, announcing: &CanFrame, data: Vec<u8>) -> Self {
        let pdu_format = (pgn & 0xFF00) >> 8;
        let destination = if pdu_format <= 0xEF {
            announcing.dst()
        } else {
            crate::pgn::GLOBAL_ADDRESS
        };
        // Reconstruction can't fail: the PGN came off the wire and is 18 bits by construction
        let id = CanId::encode(priority, pgn, destination, announcing.src())
            .unwrap_or_else(|_| CanId::new((priority as u32) << 26 | pgn << 8 | announcing.src() as u32));
        Self {
            channel: announcing.channel,
            id,
            priority,
            pgn,
            src: announcing.src(),
            dst: destination,
            data,
            timestamp_us: announcing.timestamp_us,
            source_handle: None,
            destination_handle: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.dst == crate::pgn::GLOBAL_ADDRESS
    }

    /// Write the message in candump -L format, as if it were a single frame
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writeln!(
            writer,
            "({:.6}) can{} {}#{}",
            self.timestamp_us.unwrap_or(0) as f64 / 1e6,
            self.channel,
            hex::encode_upper(self.id.raw().to_be_bytes()),
            hex::encode_upper(&self.data)
        )
    }
}

impl serde::Serialize for CanFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CanFrame", 8)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("canid", &format!("{:#X}", self.id.raw()))?;
        state.serialize_field("dlc", &self.dlc)?;
        state.serialize_field("priority", &self.priority())?;
        state.serialize_field("src", &format!("{:#X}", self.src()))?;
        state.serialize_field("dst", &format!("{:#X}", self.dst()))?;
        state.serialize_field("pgn", &format!("{:#X}", self.pgn()))?;
        state.serialize_field("data", &hex::encode_upper(self.data()))?;
        state.end()
    }
}

impl serde::Serialize for CanMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CanMessage", 8)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("canid", &format!("{:#X}", self.id.raw()))?;
        state.serialize_field("dlc", &self.data.len())?;
        state.serialize_field("priority", &self.priority)?;
        state.serialize_field("src", &format!("{:#X}", self.src))?;
        state.serialize_field("dst", &format!("{:#X}", self.dst))?;
        state.serialize_field("pgn", &format!("{:#X}", self.pgn))?;
        state.serialize_field("data", &hex::encode_upper(&self.data))?;
        state.end()
    }
}
