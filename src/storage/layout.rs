//! Byte layout of every record type.
//!
//! A record starts with a one byte type tag followed by three reserved bytes.
//! Fixed-width fields are big-endian and every record is padded to a whole number
//! of [`BLOB_INDEX_STEP`] units. Records that own an edge list embed one segment:
//!
//! ```text
//! capacity:i32 | tail:i32 | slots[capacity]:i32 | subsequent:i32
//! ```

use crate::primitives::bytes::be;
use crate::types::{Result, StrataError, BLOB_INDEX_STEP};

/// `subsequent` value of a segment that has no continuation yet.
pub const SENTINEL_SUBSEQUENT: i32 = -1;

/// Smallest capacity of a newly created deferred edge list.
pub const DEFERRED_MIN_CAPACITY: usize = 14;
/// Growth factor applied to the total capacity of a chain when it overflows.
pub const DEFERRED_GROWTH: usize = 3;

/// Longest tag name accepted by tag assignment.
pub const MAX_TAG_LEN: usize = 10_000;

/// Offset of the version length in a root record.
pub const ROOT_VERSION_LEN_AT: usize = 4;
/// Offset of the revision length in a root record.
pub const ROOT_REVISION_LEN_AT: usize = 6;
/// Offset of the uid in a root record.
pub const ROOT_UID_AT: usize = 8;
/// Offset of the version text in a root record.
pub const ROOT_VERSION_AT: usize = 24;
/// Room for the version text.
pub const ROOT_VERSION_MAX: usize = 62;
/// Offset of the revision text in a root record.
pub const ROOT_REVISION_AT: usize = 86;
/// Room for the revision text.
pub const ROOT_REVISION_MAX: usize = 64;

/// Record type tags. Zero is free space.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobType {
    /// Graph metadata; always the first record.
    Root = 1,
    /// Tx marker.
    TxEvent = 2,
    /// Links consecutive tx markers.
    NextTx = 3,
    /// Links a delegate to one of its instances.
    RaeInstance = 4,
    /// Links a delegate to its parent delegate.
    ToDelegate = 5,
    /// Entity instance.
    Entity = 6,
    /// Attribute entity instance.
    AttributeEntity = 7,
    /// Shared value body.
    Value = 8,
    /// Relation instance between two records.
    Relation = 9,
    /// Tx event bringing a delegate into use.
    DelegateInstantiation = 10,
    /// Tx event retiring a delegate.
    DelegateRetirement = 11,
    /// Tx event instantiating an instance.
    Instantiation = 12,
    /// Tx event terminating an instance.
    Termination = 13,
    /// Value stored on the edge itself.
    AtomicValueAssignment = 14,
    /// Value held by a value node.
    AttributeValueAssignment = 15,
    /// Continuation of an edge list.
    DeferredEdgeList = 16,
    /// Gives a record a tag name.
    AssignTagName = 17,
    /// Links a tag assignment to the one that replaced it.
    NextTagNameAssignment = 18,
}

impl BlobType {
    /// Every record type, in tag order.
    pub const ALL: [BlobType; 18] = [
        BlobType::Root,
        BlobType::TxEvent,
        BlobType::NextTx,
        BlobType::RaeInstance,
        BlobType::ToDelegate,
        BlobType::Entity,
        BlobType::AttributeEntity,
        BlobType::Value,
        BlobType::Relation,
        BlobType::DelegateInstantiation,
        BlobType::DelegateRetirement,
        BlobType::Instantiation,
        BlobType::Termination,
        BlobType::AtomicValueAssignment,
        BlobType::AttributeValueAssignment,
        BlobType::DeferredEdgeList,
        BlobType::AssignTagName,
        BlobType::NextTagNameAssignment,
    ];

    /// Record type of a tag byte; `None` for zero and unknown tags.
    pub fn from_tag(tag: u8) -> Option<BlobType> {
        Self::ALL.get(usize::from(tag).checked_sub(1)?).copied()
    }

    /// Tag byte written at the start of the record.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Offset of the embedded edge segment, if the record owns an edge list.
    pub fn edge_segment_at(self) -> Option<usize> {
        match self {
            BlobType::Root => Some(152),
            BlobType::TxEvent | BlobType::Entity | BlobType::AttributeEntity => Some(32),
            BlobType::RaeInstance | BlobType::ToDelegate => Some(12),
            BlobType::Relation => Some(40),
            BlobType::AssignTagName => Some(16),
            BlobType::DeferredEdgeList => Some(8),
            _ => None,
        }
    }

    /// Inline capacity for record types with a fixed-size edge list.
    pub fn inline_capacity(self) -> Option<usize> {
        match self {
            BlobType::Root => Some(54),
            BlobType::TxEvent | BlobType::RaeInstance => Some(6),
            BlobType::ToDelegate => Some(62),
            BlobType::Entity | BlobType::AttributeEntity => Some(7),
            BlobType::Relation => Some(5),
            BlobType::AssignTagName => Some(1),
            _ => None,
        }
    }

    /// Offsets of the source and target fields of edge-like records.
    pub fn source_target_at(self) -> Option<(usize, usize)> {
        match self {
            BlobType::NextTx
            | BlobType::RaeInstance
            | BlobType::ToDelegate
            | BlobType::DelegateInstantiation
            | BlobType::DelegateRetirement
            | BlobType::Instantiation
            | BlobType::Termination
            | BlobType::AttributeValueAssignment
            | BlobType::NextTagNameAssignment => Some((4, 8)),
            BlobType::Relation => Some((8, 12)),
            BlobType::AtomicValueAssignment => Some((12, 16)),
            BlobType::AssignTagName => Some((8, 12)),
            _ => None,
        }
    }

    /// Records that can be addressed through a frame.
    pub fn is_promotable(self) -> bool {
        matches!(
            self,
            BlobType::Entity
                | BlobType::AttributeEntity
                | BlobType::Relation
                | BlobType::Value
                | BlobType::TxEvent
                | BlobType::Root
        )
    }

    /// Records carrying instantiation and termination time slices.
    pub fn is_instance_kind(self) -> bool {
        matches!(
            self,
            BlobType::Entity | BlobType::AttributeEntity | BlobType::Relation
        )
    }

    /// Offset of the termination slice in instance records.
    pub fn termination_at(self) -> Option<usize> {
        match self {
            BlobType::Entity | BlobType::AttributeEntity => Some(12),
            BlobType::Relation => Some(20),
            _ => None,
        }
    }

    /// Record type name as written in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            BlobType::Root => "ROOT_NODE",
            BlobType::TxEvent => "TX_EVENT_NODE",
            BlobType::NextTx => "NEXT_TX_EDGE",
            BlobType::RaeInstance => "RAE_INSTANCE_EDGE",
            BlobType::ToDelegate => "TO_DELEGATE_EDGE",
            BlobType::Entity => "ENTITY_NODE",
            BlobType::AttributeEntity => "ATTRIBUTE_ENTITY_NODE",
            BlobType::Value => "VALUE_NODE",
            BlobType::Relation => "RELATION_EDGE",
            BlobType::DelegateInstantiation => "DELEGATE_INSTANTIATION_EDGE",
            BlobType::DelegateRetirement => "DELEGATE_RETIREMENT_EDGE",
            BlobType::Instantiation => "INSTANTIATION_EDGE",
            BlobType::Termination => "TERMINATION_EDGE",
            BlobType::AtomicValueAssignment => "ATOMIC_VALUE_ASSIGNMENT_EDGE",
            BlobType::AttributeValueAssignment => "ATTRIBUTE_VALUE_ASSIGNMENT_EDGE",
            BlobType::DeferredEdgeList => "DEFERRED_EDGE_LIST_NODE",
            BlobType::AssignTagName => "ASSIGN_TAG_NAME_EDGE",
            BlobType::NextTagNameAssignment => "NEXT_TAG_NAME_ASSIGNMENT_EDGE",
        }
    }
}

/// Bytes taken by an edge segment of `capacity` slots.
pub fn segment_len(capacity: usize) -> usize {
    12 + 4 * capacity
}

/// Rounds `len` up to a whole number of index steps.
pub fn padded(len: usize) -> usize {
    len.div_ceil(BLOB_INDEX_STEP) * BLOB_INDEX_STEP
}

/// Offset of the length-prefixed buffer for record types that carry one.
pub fn buffer_at(ty: BlobType) -> Option<usize> {
    match ty {
        BlobType::Value => Some(12),
        BlobType::AtomicValueAssignment => Some(20),
        BlobType::AssignTagName => Some(16 + segment_len(1)),
        _ => None,
    }
}

fn buffer_len_at(ty: BlobType) -> Option<usize> {
    match ty {
        BlobType::Value | BlobType::AtomicValueAssignment => Some(8),
        BlobType::AssignTagName => Some(4),
        _ => None,
    }
}

/// Unpadded length of a record of type `ty` with a buffer of `buffer_len` bytes or
/// an edge list of `capacity` slots (deferred lists only).
pub fn raw_len(ty: BlobType, buffer_len: usize, capacity: usize) -> usize {
    if let Some(at) = buffer_at(ty) {
        return at + buffer_len;
    }
    match (ty.edge_segment_at(), ty.inline_capacity()) {
        (Some(at), Some(cap)) => at + segment_len(cap),
        (Some(at), None) => at + segment_len(capacity),
        _ => match ty {
            BlobType::AttributeValueAssignment => 16,
            _ => 12,
        },
    }
}

/// Size in bytes of the record whose first bytes are `head` (at least one step).
pub fn record_size(head: &[u8]) -> Result<usize> {
    let tag = *head
        .first()
        .ok_or_else(|| StrataError::Corruption("empty record header".into()))?;
    let ty = BlobType::from_tag(tag)
        .ok_or_else(|| StrataError::Corruption(format!("unknown record tag {tag}")))?;
    let buffer_len = match buffer_len_at(ty) {
        Some(at) => usize::try_from(be::get_u32(head, at)?)
            .map_err(|_| StrataError::Corruption("buffer length overflow".into()))?,
        None => 0,
    };
    let capacity = match ty {
        BlobType::DeferredEdgeList => {
            let cap = be::get_i32(head, 8)?;
            usize::try_from(cap)
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| StrataError::Corruption(format!("deferred capacity {cap}")))?
        }
        _ => 0,
    };
    Ok(padded(raw_len(ty, buffer_len, capacity)))
}

/// Capacity of a new deferred list continuing a chain of `total` slots.
pub fn deferred_capacity(total: usize) -> usize {
    (DEFERRED_GROWTH * total).max(DEFERRED_MIN_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizes_are_step_aligned() {
        let sizes = [
            (BlobType::Root, 384),
            (BlobType::TxEvent, 80),
            (BlobType::NextTx, 16),
            (BlobType::RaeInstance, 48),
            (BlobType::ToDelegate, 272),
            (BlobType::Entity, 80),
            (BlobType::Relation, 80),
            (BlobType::AttributeValueAssignment, 16),
        ];
        for (ty, expected) in sizes {
            assert_eq!(padded(raw_len(ty, 0, 0)), expected, "{}", ty.name());
        }
        assert_eq!(padded(raw_len(BlobType::DeferredEdgeList, 0, 21)), 112);
    }

    #[test]
    fn tags_round_trip() {
        for ty in BlobType::ALL {
            assert_eq!(BlobType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(BlobType::from_tag(0), None);
        assert_eq!(BlobType::from_tag(19), None);
    }

    #[test]
    fn deferred_growth() {
        assert_eq!(deferred_capacity(1), 14);
        assert_eq!(deferred_capacity(7), 21);
        assert_eq!(deferred_capacity(28), 84);
    }

    #[test]
    fn record_size_reads_buffers() -> Result<()> {
        let mut head = [0u8; 16];
        head[0] = BlobType::AssignTagName.tag();
        be::put_u32(&mut head, 4, 5)?;
        assert_eq!(record_size(&head)?, padded(16 + 16 + 5));
        head[0] = 0;
        assert!(record_size(&head).is_err());
        Ok(())
    }
}
