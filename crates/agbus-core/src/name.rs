//! The ISOBUS NAME is defined by ISO 11783-5 4.3.2.
//!
//! Every control function on the bus carries a 64-bit NAME that is unique on that bus. Addresses
//! are ephemeral; the NAME is the durable identity, and address-claim arbitration compares full
//! NAMEs numerically (lower value wins).
//!
//! Some of the NAME fields have global values, but the interpretation of other fields depends on
//! the values of yet other fields. See 'Figure 2 -- NAME-field relationships and dependencies'
//! from ISO 11783-5 4.3.2.
use bitfield_struct::bitfield;

/// A 64-bit ISOBUS/J1939 NAME
///
/// ### Repr: `u64`
/// | Field                      | Size (bits) |
/// |----------------------------|-------------|
/// | Identity number            | 21          |
/// | Manufacturer code          | 11          |
/// | ECU instance               | 3           |
/// | Function instance          | 5           |
/// | Function code              | 8           |
/// | Reserved                   | 1           |
/// | Device class               | 7           |
/// | Device class instance      | 4           |
/// | Industry group             | 3           |
/// | Arbitrary address capable  | 1           |
///
/// The setters clamp out-of-range values to their field width, so a NAME can never violate the
/// bit layout. The `Ord` impl compares the packed 64-bit value, which is exactly address-claim
/// arbitration order.
#[bitfield(u64)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name {
    #[bits(21)]
    identity_number_bits: u32,
    #[bits(11)]
    manufacturer_code_bits: u16,
    #[bits(3)]
    ecu_instance_bits: u8,
    #[bits(5)]
    function_instance_bits: u8,
    #[bits(8)]
    function_code_bits: u8,
    #[bits(1)]
    reserved_bits: bool,
    #[bits(7)]
    device_class_bits: u8,
    #[bits(4)]
    device_class_instance_bits: u8,
    #[bits(3)]
    industry_group_bits: u8,
    #[bits(1)]
    arbitrary_address_capable_bits: bool,
}

impl Name {
    /// This field is assigned by the manufacturer, similar to a serial number, i.e. the code must
    /// be uniquely assigned to the unit.
    #[must_use]
    pub const fn identity_number(&self) -> u32 {
        self.identity_number_bits()
    }

    pub fn set_identity_number(&mut self, value: u32) {
        self.set_identity_number_bits(value & 0x1F_FFFF);
    }

    /// The 11-bit manufacturer code is assigned by SAE
    #[must_use]
    pub const fn manufacturer_code(&self) -> u16 {
        self.manufacturer_code_bits()
    }

    pub fn set_manufacturer_code(&mut self, value: u16) {
        self.set_manufacturer_code_bits(value & 0x7FF);
    }

    /// Separates multiple ECUs with the same function on the same network
    #[must_use]
    pub const fn ecu_instance(&self) -> u8 {
        self.ecu_instance_bits()
    }

    pub fn set_ecu_instance(&mut self, value: u8) {
        self.set_ecu_instance_bits(value & 0x07);
    }

    #[must_use]
    pub const fn function_instance(&self) -> u8 {
        self.function_instance_bits()
    }

    pub fn set_function_instance(&mut self, value: u8) {
        self.set_function_instance_bits(value & 0x1F);
    }

    /// Functions 0..=127 are interpreted globally; 128..=254 depend on the industry group and
    /// device class
    #[must_use]
    pub const fn function_code(&self) -> u8 {
        self.function_code_bits()
    }

    pub fn set_function_code(&mut self, value: u8) {
        self.set_function_code_bits(value);
    }

    /// Reserved bit (always 0)
    #[must_use]
    pub const fn reserved(&self) -> bool {
        self.reserved_bits()
    }

    /// Also known as "Vehicle System" in SAE J1939. Interpretation depends on the industry group.
    #[must_use]
    pub const fn device_class(&self) -> u8 {
        self.device_class_bits()
    }

    pub fn set_device_class(&mut self, value: u8) {
        self.set_device_class_bits(value & 0x7F);
    }

    #[must_use]
    pub const fn device_class_instance(&self) -> u8 {
        self.device_class_instance_bits()
    }

    pub fn set_device_class_instance(&mut self, value: u8) {
        self.set_device_class_instance_bits(value & 0x0F);
    }

    #[must_use]
    pub const fn industry_group(&self) -> u8 {
        self.industry_group_bits()
    }

    pub fn set_industry_group(&mut self, value: u8) {
        self.set_industry_group_bits(value & 0x07);
    }

    /// Indicates whether the control function can self-configure its address from the dynamic
    /// range when its preferred address is taken
    #[must_use]
    pub const fn arbitrary_address_capable(&self) -> bool {
        self.arbitrary_address_capable_bits()
    }

    pub fn set_arbitrary_address_capable(&mut self, value: bool) {
        self.set_arbitrary_address_capable_bits(value);
    }

    /// The 8-byte address-claim payload (little-endian byte image)
    #[must_use]
    pub const fn to_claim_bytes(self) -> [u8; 8] {
        self.into_bits().to_le_bytes()
    }

    /// Parse a NAME out of an address-claim payload
    #[must_use]
    pub const fn from_claim_bytes(bytes: [u8; 8]) -> Self {
        Self::from_bits(u64::from_le_bytes(bytes))
    }
}

/// Industry group
///
/// Bits 60..=62 of the NAME.
///
/// SPN 2846 (0x0B1E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndustryGroup {
    Global = 0,
    OnHighway = 1,
    AgriculturalAndForestry = 2,
    Construction = 3,
    Marine = 4,
    Industrial = 5,
    Reserved6 = 6,
    Reserved7 = 7,
}

impl IndustryGroup {
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }
}

/// Which NAME field a [NameFilter] matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameParameter {
    IdentityNumber,
    ManufacturerCode,
    EcuInstance,
    FunctionInstance,
    FunctionCode,
    DeviceClass,
    DeviceClassInstance,
    IndustryGroup,
    ArbitraryAddressCapable,
}

/// A single-field NAME predicate
///
/// Partnered control functions are described by a set of filters; a candidate NAME matches the
/// set iff every filter in the set matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameFilter {
    parameter: NameParameter,
    value: u32,
}

impl NameFilter {
    #[must_use]
    pub const fn new(parameter: NameParameter, value: u32) -> Self {
        Self { parameter, value }
    }

    #[must_use]
    pub const fn parameter(&self) -> NameParameter {
        self.parameter
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub fn matches(&self, name: Name) -> bool {
        let actual = match self.parameter {
            NameParameter::IdentityNumber => name.identity_number(),
            NameParameter::ManufacturerCode => name.manufacturer_code() as u32,
            NameParameter::EcuInstance => name.ecu_instance() as u32,
            NameParameter::FunctionInstance => name.function_instance() as u32,
            NameParameter::FunctionCode => name.function_code() as u32,
            NameParameter::DeviceClass => name.device_class() as u32,
            NameParameter::DeviceClassInstance => name.device_class_instance() as u32,
            NameParameter::IndustryGroup => name.industry_group() as u32,
            NameParameter::ArbitraryAddressCapable => name.arbitrary_address_capable() as u32,
        };
        actual == self.value
    }
}

/// Does the candidate NAME satisfy every filter in the set?
#[must_use]
pub fn matches_filters(filters: &[NameFilter], name: Name) -> bool {
    filters.iter().all(|f| f.matches(name))
}
