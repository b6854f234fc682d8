#![forbid(unsafe_code)]

//! Identifiers, tokens and the crate-wide error type.

use std::fmt;

use rand::RngCore;

pub mod checksum;
pub mod value;

pub use checksum::{blob_range_hash, Checksum, Crc32Fast, Xxh64};
pub use value::Value;

/// Number of bytes addressed by one step of a [`BlobIndex`].
pub const BLOB_INDEX_STEP: usize = 16;

/// Integer address of a record in the arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlobIndex(pub i32);

/// Monotonically increasing version stamp of a transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TimeSlice(pub i32);

/// Wall-clock time stored on transaction markers, microseconds since the Unix epoch.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(pub i64);

/// 128-bit identifier of a graph, an instance or a transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BaseUid(pub [u8; 16]);

/// Entity type token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EntityType(pub u32);
/// Relation type token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RelationType(pub u32);
/// Enumeration value token; the low four bits are the ordinal inside its family.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EnumValue(pub u32);

/// Representation type of a value: `family << 4 | kind`.
///
/// Kind 0 is a primitive scalar whose family selects the scalar; kinds 1 to 3
/// are enumerations and quantities whose family is a registered token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ValueRepType(pub u32);

impl BlobIndex {
    /// Index of the graph root record.
    pub const ROOT: BlobIndex = BlobIndex(42);

    /// Byte offset of this index inside the arena.
    pub fn offset(self) -> usize {
        self.0.max(0) as usize * BLOB_INDEX_STEP
    }

    /// Returns the index `n` steps further on.
    pub fn advance(self, n: i32) -> BlobIndex {
        BlobIndex(self.0 + n)
    }
}

impl BaseUid {
    /// Uid made of zero bytes, used by delegates.
    pub const ZERO: BaseUid = BaseUid([0; 16]);

    /// Draws a fresh identifier from `rng`.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        BaseUid(bytes)
    }

    /// Parses the 32 character hex rendering produced by `Display`.
    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text).map_err(|err| StrataError::Invalid(format!("uid hex: {err}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| StrataError::Invalid("uid must be 16 bytes".into()))?;
        Ok(BaseUid(bytes))
    }

    /// Returns true for the all-zero uid.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl ValueRepType {
    /// Boolean scalar.
    pub const BOOL: ValueRepType = ValueRepType(1 << 4);
    /// Signed 64-bit integer scalar.
    pub const INT: ValueRepType = ValueRepType(2 << 4);
    /// 64-bit float scalar.
    pub const FLOAT: ValueRepType = ValueRepType(3 << 4);
    /// UTF-8 string.
    pub const STRING: ValueRepType = ValueRepType(4 << 4);
    /// Timestamp.
    pub const TIME: ValueRepType = ValueRepType(5 << 4);
    /// Opaque serialized bytes.
    pub const SERIALIZED: ValueRepType = ValueRepType(6 << 4);

    const KIND_ENUM: u32 = 1;
    const KIND_QUANTITY_FLOAT: u32 = 2;
    const KIND_QUANTITY_INT: u32 = 3;

    /// Enumeration over the registered family `family`.
    pub fn enumeration(family: u32) -> Self {
        ValueRepType((family << 4) | Self::KIND_ENUM)
    }

    /// Float quantity in the registered unit `family`.
    pub fn quantity_float(family: u32) -> Self {
        ValueRepType((family << 4) | Self::KIND_QUANTITY_FLOAT)
    }

    /// Integer quantity in the registered unit `family`.
    pub fn quantity_int(family: u32) -> Self {
        ValueRepType((family << 4) | Self::KIND_QUANTITY_INT)
    }

    /// Low four bits.
    pub fn kind(self) -> u32 {
        self.0 & 0xF
    }

    /// Token with the kind bits cleared.
    pub fn family_bits(self) -> u32 {
        self.0 & !0xF
    }

    /// True for enumeration types.
    pub fn is_enum(self) -> bool {
        self.kind() == Self::KIND_ENUM
    }

    /// True for types whose family must be recorded in the enum usage cache.
    pub fn tracks_family(self) -> bool {
        matches!(
            self.kind(),
            Self::KIND_ENUM | Self::KIND_QUANTITY_FLOAT | Self::KIND_QUANTITY_INT
        )
    }
}

impl EnumValue {
    /// Builds a value token from a family base (multiple of 16) and ordinal 1..=15.
    pub fn new(family_base: u32, ordinal: u32) -> Self {
        EnumValue((family_base & !0xF) | (ordinal & 0xF))
    }

    /// Representation type of the enumeration this value belongs to.
    pub fn rep_type(self) -> ValueRepType {
        ValueRepType::enumeration(self.0 >> 4)
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// An edge-list or chronological invariant does not hold.
    #[error("structural violation at blob {index}: {reason}")]
    StructuralViolation {
        /// Record where the violation was found.
        index: BlobIndex,
        /// Human readable description.
        reason: String,
    },
    /// A deferred edge list was needed but creating one was not allowed.
    #[error("capacity exceeded: edge list of blob {holder} has no room for {edge}")]
    CapacityExceeded {
        /// Owner of the full edge list.
        holder: BlobIndex,
        /// Signed reference that did not fit.
        edge: i32,
    },
    /// A mutation was attempted without holding the write role.
    #[error("write role not held by the calling thread")]
    ConcurrencyViolation,
    /// An index outside the populated range was dereferenced.
    #[error("blob index {index} outside [{lo}, {hi})")]
    RangeError {
        /// Requested index.
        index: BlobIndex,
        /// Lowest valid index.
        lo: BlobIndex,
        /// One past the highest valid index.
        hi: BlobIndex,
    },
    /// A payload declares a layout version that cannot be converted.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),
    /// A record had an unexpected type.
    #[error("type mismatch at blob {index}: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Record inspected.
        index: BlobIndex,
        /// Expected type description.
        expected: &'static str,
        /// Actual type description.
        actual: String,
    },
    /// A record does not exist at the requested time slice.
    #[error("blob {index} does not exist at time slice {time_slice}")]
    NotAlive {
        /// Record inspected.
        index: BlobIndex,
        /// Time slice of the frame.
        time_slice: TimeSlice,
    },
    /// An update does not fit onto the current heads.
    #[error("heads mismatch: {0}")]
    HeadsMismatch(String),
    /// Stored bytes are not decodable.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata (de)serialization failure.
    #[error("serialization: {0}")]
    Serialization(String),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Whether the graph must not be used further after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::StructuralViolation { .. }
                | StrataError::ConcurrencyViolation
                | StrataError::Corruption(_)
        )
    }

    pub(crate) fn type_mismatch(index: BlobIndex, expected: &'static str, actual: impl fmt::Debug) -> Self {
        StrataError::TypeMismatch {
            index,
            expected,
            actual: format!("{actual:?}"),
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl fmt::Display for BlobIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BaseUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ET({})", self.0)
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RT({})", self.0)
    }
}

impl From<i32> for BlobIndex {
    fn from(value: i32) -> Self {
        BlobIndex(value)
    }
}

impl From<BlobIndex> for i32 {
    fn from(value: BlobIndex) -> Self {
        value.0
    }
}
