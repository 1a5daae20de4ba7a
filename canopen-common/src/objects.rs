//! The type and access model shared by every entry in the object dictionary.
//!
//! These types describe *what kind of thing* an (index, subindex) holds; the live storage and
//! locking discipline around them belongs to `canopen_node::od`.

/// Access rule for an object dictionary entry, as declared by the EDS `AccessType` field.
///
/// CiA 306 additionally defines `rwr` and `rww` (read/write, with a preferred direction for PDO
/// mapping purposes); both collapse to [`AccessType::Rw`] here, since the core does not
/// distinguish them for SDO access control (see §6 of the EDS notes).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only: SDO download is rejected
    #[default]
    Ro,
    /// Write-only: SDO upload is rejected
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and never changed internally either
    Const,
}

impl AccessType {
    /// True if an SDO client is allowed to read this entry
    pub fn readable(&self) -> bool {
        !matches!(self, AccessType::Wo)
    }

    /// True if an SDO client is allowed to write this entry
    pub fn writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// The data type of an object dictionary entry, per CiA 301 Table 44 / CiA 306.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DataType {
    /// A single byte, 0 or 1
    Boolean = 1,
    #[default]
    /// Signed 8-bit integer
    Int8 = 2,
    /// Signed 16-bit integer
    Int16 = 3,
    /// Signed 32-bit integer
    Int32 = 4,
    /// Unsigned 8-bit integer
    UInt8 = 5,
    /// Unsigned 16-bit integer
    UInt16 = 6,
    /// Unsigned 32-bit integer
    UInt32 = 7,
    /// IEEE-754 single precision float
    Real32 = 8,
    /// ASCII text, not zero-terminated
    VisibleString = 9,
    /// Arbitrary binary data of fixed declared length
    OctetString = 0xA,
    /// Arbitrary binary data of unbounded/unknown length
    Domain = 0xF,
    /// IEEE-754 double precision float
    Real64 = 0x11,
    /// Signed 64-bit integer
    Int64 = 0x15,
    /// Unsigned 64-bit integer
    UInt64 = 0x1B,
    /// A CiA 306 data type code this crate does not model explicitly
    Other(u16),
}

impl From<u16> for DataType {
    fn from(value: u16) -> Self {
        use DataType::*;
        match value {
            1 => Boolean,
            2 => Int8,
            3 => Int16,
            4 => Int32,
            5 => UInt8,
            6 => UInt16,
            7 => UInt32,
            8 => Real32,
            9 => VisibleString,
            0xA => OctetString,
            0xF => Domain,
            0x11 => Real64,
            0x15 => Int64,
            0x1B => UInt64,
            other => Other(other),
        }
    }
}

impl DataType {
    /// The CiA 306 integer code for this data type
    pub fn code(&self) -> u16 {
        use DataType::*;
        match self {
            Boolean => 1,
            Int8 => 2,
            Int16 => 3,
            Int32 => 4,
            UInt8 => 5,
            UInt16 => 6,
            UInt32 => 7,
            Real32 => 8,
            VisibleString => 9,
            OctetString => 0xA,
            Domain => 0xF,
            Real64 => 0x11,
            Int64 => 0x15,
            UInt64 => 0x1B,
            Other(code) => *code,
        }
    }

    /// True if this is one of the variable-length string/domain kinds
    pub fn is_variable_length(&self) -> bool {
        matches!(
            self,
            DataType::VisibleString | DataType::OctetString | DataType::Domain
        )
    }

    /// The fixed on-wire byte length of a numeric data type, or `None` for variable-length kinds.
    pub fn fixed_size(&self) -> Option<usize> {
        use DataType::*;
        match self {
            Boolean | Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Real32 => Some(4),
            Int64 | UInt64 | Real64 => Some(8),
            VisibleString | OctetString | Domain | Other(_) => None,
        }
    }
}
