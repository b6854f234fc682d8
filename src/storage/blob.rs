#![allow(missing_docs)]

//! Decoded records.
//!
//! [`Blob`] is the closed set of record kinds. Decoding reads the fixed fields of a
//! record; edge segments are managed separately by [`super::edges`].

use crate::primitives::bytes::be;
use crate::storage::layout::{self, BlobType, SENTINEL_SUBSEQUENT};
use crate::types::{
    BaseUid, BlobIndex, EntityType, RelationType, Result, StrataError, TimeSlice, Timestamp,
    ValueRepType,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootNode {
    pub uid: BaseUid,
    pub layout_version: String,
    pub revision: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxEventNode {
    pub time: Timestamp,
    pub time_slice: TimeSlice,
    pub uid: BaseUid,
}

/// Plain directed link between two records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub source: BlobIndex,
    pub target: BlobIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityNode {
    pub entity_type: EntityType,
    pub instantiation: TimeSlice,
    pub termination: TimeSlice,
    pub uid: BaseUid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeEntityNode {
    pub rep_type: ValueRepType,
    pub instantiation: TimeSlice,
    pub termination: TimeSlice,
    pub uid: BaseUid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueNode {
    pub rep_type: ValueRepType,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelationEdge {
    pub relation_type: RelationType,
    pub source: BlobIndex,
    pub target: BlobIndex,
    pub instantiation: TimeSlice,
    pub termination: TimeSlice,
    pub uid: BaseUid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AtomicValueAssignment {
    pub rep_type: ValueRepType,
    pub source: BlobIndex,
    pub target: BlobIndex,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeValueAssignment {
    pub source: BlobIndex,
    pub target: BlobIndex,
    pub value_node: BlobIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredEdgeList {
    pub first_blob: BlobIndex,
    pub capacity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignTagName {
    pub source: BlobIndex,
    pub target: BlobIndex,
    pub tag: String,
}

/// Every record kind the arena can hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blob {
    Root(RootNode),
    TxEvent(TxEventNode),
    NextTx(Link),
    RaeInstance(Link),
    ToDelegate(Link),
    Entity(EntityNode),
    AttributeEntity(AttributeEntityNode),
    Value(ValueNode),
    Relation(RelationEdge),
    DelegateInstantiation(Link),
    DelegateRetirement(Link),
    Instantiation(Link),
    Termination(Link),
    AtomicValueAssignment(AtomicValueAssignment),
    AttributeValueAssignment(AttributeValueAssignment),
    DeferredEdgeList(DeferredEdgeList),
    AssignTagName(AssignTagName),
    NextTagNameAssignment(Link),
}

impl Blob {
    pub fn blob_type(&self) -> BlobType {
        match self {
            Blob::Root(_) => BlobType::Root,
            Blob::TxEvent(_) => BlobType::TxEvent,
            Blob::NextTx(_) => BlobType::NextTx,
            Blob::RaeInstance(_) => BlobType::RaeInstance,
            Blob::ToDelegate(_) => BlobType::ToDelegate,
            Blob::Entity(_) => BlobType::Entity,
            Blob::AttributeEntity(_) => BlobType::AttributeEntity,
            Blob::Value(_) => BlobType::Value,
            Blob::Relation(_) => BlobType::Relation,
            Blob::DelegateInstantiation(_) => BlobType::DelegateInstantiation,
            Blob::DelegateRetirement(_) => BlobType::DelegateRetirement,
            Blob::Instantiation(_) => BlobType::Instantiation,
            Blob::Termination(_) => BlobType::Termination,
            Blob::AtomicValueAssignment(_) => BlobType::AtomicValueAssignment,
            Blob::AttributeValueAssignment(_) => BlobType::AttributeValueAssignment,
            Blob::DeferredEdgeList(_) => BlobType::DeferredEdgeList,
            Blob::AssignTagName(_) => BlobType::AssignTagName,
            Blob::NextTagNameAssignment(_) => BlobType::NextTagNameAssignment,
        }
    }

    /// Source and target of edge-like records.
    pub fn source_target(&self) -> Option<(BlobIndex, BlobIndex)> {
        match self {
            Blob::NextTx(l)
            | Blob::RaeInstance(l)
            | Blob::ToDelegate(l)
            | Blob::DelegateInstantiation(l)
            | Blob::DelegateRetirement(l)
            | Blob::Instantiation(l)
            | Blob::Termination(l)
            | Blob::NextTagNameAssignment(l) => Some((l.source, l.target)),
            Blob::Relation(r) => Some((r.source, r.target)),
            Blob::AtomicValueAssignment(a) => Some((a.source, a.target)),
            Blob::AttributeValueAssignment(a) => Some((a.source, a.target)),
            Blob::AssignTagName(a) => Some((a.source, a.target)),
            _ => None,
        }
    }

    /// Uid carried by the record, if any.
    pub fn uid(&self) -> Option<BaseUid> {
        match self {
            Blob::Root(r) => Some(r.uid),
            Blob::TxEvent(t) => Some(t.uid),
            Blob::Entity(e) => Some(e.uid),
            Blob::AttributeEntity(a) => Some(a.uid),
            Blob::Relation(r) => Some(r.uid),
            _ => None,
        }
    }

    /// Instantiation and termination slices of instance records.
    pub fn lifetime(&self) -> Option<(TimeSlice, TimeSlice)> {
        match self {
            Blob::Entity(e) => Some((e.instantiation, e.termination)),
            Blob::AttributeEntity(a) => Some((a.instantiation, a.termination)),
            Blob::Relation(r) => Some((r.instantiation, r.termination)),
            _ => None,
        }
    }

    /// Padded size of the encoded record.
    pub fn encoded_len(&self) -> usize {
        let ty = self.blob_type();
        let raw = match self {
            Blob::Value(v) => layout::raw_len(ty, v.data.len(), 0),
            Blob::AtomicValueAssignment(a) => layout::raw_len(ty, a.data.len(), 0),
            Blob::AssignTagName(a) => layout::raw_len(ty, a.tag.len(), 0),
            Blob::DeferredEdgeList(d) => layout::raw_len(ty, 0, d.capacity),
            _ => layout::raw_len(ty, 0, 0),
        };
        layout::padded(raw)
    }

    /// Writes the record into `dst`, which must be zeroed and exactly
    /// [`Blob::encoded_len`] bytes long. Edge segments start out empty.
    pub fn encode_into(&self, dst: &mut [u8]) -> Result<()> {
        let ty = self.blob_type();
        dst[0] = ty.tag();
        match self {
            Blob::Root(r) => {
                let version = r.layout_version.as_bytes();
                let revision = r.revision.as_bytes();
                if version.len() > layout::ROOT_VERSION_MAX || revision.len() > layout::ROOT_REVISION_MAX {
                    return Err(StrataError::Invalid("root version or revision too long".into()));
                }
                be::put_u16(dst, layout::ROOT_VERSION_LEN_AT, version.len() as u16)?;
                be::put_u16(dst, layout::ROOT_REVISION_LEN_AT, revision.len() as u16)?;
                be::put_16(dst, layout::ROOT_UID_AT, &r.uid.0)?;
                dst[layout::ROOT_VERSION_AT..layout::ROOT_VERSION_AT + version.len()].copy_from_slice(version);
                dst[layout::ROOT_REVISION_AT..layout::ROOT_REVISION_AT + revision.len()]
                    .copy_from_slice(revision);
            }
            Blob::TxEvent(t) => {
                be::put_i64(dst, 4, t.time.0)?;
                be::put_i32(dst, 12, t.time_slice.0)?;
                be::put_16(dst, 16, &t.uid.0)?;
            }
            Blob::NextTx(l)
            | Blob::RaeInstance(l)
            | Blob::ToDelegate(l)
            | Blob::DelegateInstantiation(l)
            | Blob::DelegateRetirement(l)
            | Blob::Instantiation(l)
            | Blob::Termination(l)
            | Blob::NextTagNameAssignment(l) => {
                be::put_i32(dst, 4, l.source.0)?;
                be::put_i32(dst, 8, l.target.0)?;
            }
            Blob::Entity(e) => {
                be::put_u32(dst, 4, e.entity_type.0)?;
                be::put_i32(dst, 8, e.instantiation.0)?;
                be::put_i32(dst, 12, e.termination.0)?;
                be::put_16(dst, 16, &e.uid.0)?;
            }
            Blob::AttributeEntity(a) => {
                be::put_u32(dst, 4, a.rep_type.0)?;
                be::put_i32(dst, 8, a.instantiation.0)?;
                be::put_i32(dst, 12, a.termination.0)?;
                be::put_16(dst, 16, &a.uid.0)?;
            }
            Blob::Value(v) => {
                be::put_u32(dst, 4, v.rep_type.0)?;
                be::put_u32(dst, 8, buffer_len(&v.data)?)?;
                dst[12..12 + v.data.len()].copy_from_slice(&v.data);
            }
            Blob::Relation(r) => {
                be::put_u32(dst, 4, r.relation_type.0)?;
                be::put_i32(dst, 8, r.source.0)?;
                be::put_i32(dst, 12, r.target.0)?;
                be::put_i32(dst, 16, r.instantiation.0)?;
                be::put_i32(dst, 20, r.termination.0)?;
                be::put_16(dst, 24, &r.uid.0)?;
            }
            Blob::AtomicValueAssignment(a) => {
                be::put_u32(dst, 4, a.rep_type.0)?;
                be::put_u32(dst, 8, buffer_len(&a.data)?)?;
                be::put_i32(dst, 12, a.source.0)?;
                be::put_i32(dst, 16, a.target.0)?;
                dst[20..20 + a.data.len()].copy_from_slice(&a.data);
            }
            Blob::AttributeValueAssignment(a) => {
                be::put_i32(dst, 4, a.source.0)?;
                be::put_i32(dst, 8, a.target.0)?;
                be::put_i32(dst, 12, a.value_node.0)?;
            }
            Blob::DeferredEdgeList(d) => {
                be::put_i32(dst, 4, d.first_blob.0)?;
            }
            Blob::AssignTagName(a) => {
                be::put_u32(dst, 4, buffer_len(a.tag.as_bytes())?)?;
                be::put_i32(dst, 8, a.source.0)?;
                be::put_i32(dst, 12, a.target.0)?;
                let at = layout::buffer_at(ty).unwrap_or(32);
                dst[at..at + a.tag.len()].copy_from_slice(a.tag.as_bytes());
            }
        }
        if let Some(at) = ty.edge_segment_at() {
            let capacity = match self {
                Blob::DeferredEdgeList(d) => d.capacity,
                _ => ty.inline_capacity().unwrap_or(0),
            };
            be::put_i32(dst, at, capacity as i32)?;
            be::put_i32(dst, at + 4, 0)?;
            be::put_i32(dst, at + 8 + 4 * capacity, SENTINEL_SUBSEQUENT)?;
        }
        Ok(())
    }

    /// Decodes the fixed fields of the record occupying `src`.
    pub fn decode(src: &[u8]) -> Result<Blob> {
        let tag = *src
            .first()
            .ok_or_else(|| StrataError::Corruption("empty record".into()))?;
        let ty = BlobType::from_tag(tag)
            .ok_or_else(|| StrataError::Corruption(format!("unknown record tag {tag}")))?;
        let link = || -> Result<Link> {
            Ok(Link {
                source: BlobIndex(be::get_i32(src, 4)?),
                target: BlobIndex(be::get_i32(src, 8)?),
            })
        };
        let blob = match ty {
            BlobType::Root => {
                let vlen = usize::from(be::get_u16(src, layout::ROOT_VERSION_LEN_AT)?);
                let rlen = usize::from(be::get_u16(src, layout::ROOT_REVISION_LEN_AT)?);
                if vlen > layout::ROOT_VERSION_MAX || rlen > layout::ROOT_REVISION_MAX {
                    return Err(StrataError::Corruption("root string lengths".into()));
                }
                Blob::Root(RootNode {
                    uid: BaseUid(be::get_16(src, layout::ROOT_UID_AT)?),
                    layout_version: utf8(slice(src, layout::ROOT_VERSION_AT, vlen)?)?,
                    revision: utf8(slice(src, layout::ROOT_REVISION_AT, rlen)?)?,
                })
            }
            BlobType::TxEvent => Blob::TxEvent(TxEventNode {
                time: Timestamp(be::get_i64(src, 4)?),
                time_slice: TimeSlice(be::get_i32(src, 12)?),
                uid: BaseUid(be::get_16(src, 16)?),
            }),
            BlobType::NextTx => Blob::NextTx(link()?),
            BlobType::RaeInstance => Blob::RaeInstance(link()?),
            BlobType::ToDelegate => Blob::ToDelegate(link()?),
            BlobType::DelegateInstantiation => Blob::DelegateInstantiation(link()?),
            BlobType::DelegateRetirement => Blob::DelegateRetirement(link()?),
            BlobType::Instantiation => Blob::Instantiation(link()?),
            BlobType::Termination => Blob::Termination(link()?),
            BlobType::NextTagNameAssignment => Blob::NextTagNameAssignment(link()?),
            BlobType::Entity => Blob::Entity(EntityNode {
                entity_type: EntityType(be::get_u32(src, 4)?),
                instantiation: TimeSlice(be::get_i32(src, 8)?),
                termination: TimeSlice(be::get_i32(src, 12)?),
                uid: BaseUid(be::get_16(src, 16)?),
            }),
            BlobType::AttributeEntity => Blob::AttributeEntity(AttributeEntityNode {
                rep_type: ValueRepType(be::get_u32(src, 4)?),
                instantiation: TimeSlice(be::get_i32(src, 8)?),
                termination: TimeSlice(be::get_i32(src, 12)?),
                uid: BaseUid(be::get_16(src, 16)?),
            }),
            BlobType::Value => {
                let len = be::get_u32(src, 8)? as usize;
                Blob::Value(ValueNode {
                    rep_type: ValueRepType(be::get_u32(src, 4)?),
                    data: slice(src, 12, len)?.to_vec(),
                })
            }
            BlobType::Relation => Blob::Relation(RelationEdge {
                relation_type: RelationType(be::get_u32(src, 4)?),
                source: BlobIndex(be::get_i32(src, 8)?),
                target: BlobIndex(be::get_i32(src, 12)?),
                instantiation: TimeSlice(be::get_i32(src, 16)?),
                termination: TimeSlice(be::get_i32(src, 20)?),
                uid: BaseUid(be::get_16(src, 24)?),
            }),
            BlobType::AtomicValueAssignment => {
                let len = be::get_u32(src, 8)? as usize;
                Blob::AtomicValueAssignment(AtomicValueAssignment {
                    rep_type: ValueRepType(be::get_u32(src, 4)?),
                    source: BlobIndex(be::get_i32(src, 12)?),
                    target: BlobIndex(be::get_i32(src, 16)?),
                    data: slice(src, 20, len)?.to_vec(),
                })
            }
            BlobType::AttributeValueAssignment => Blob::AttributeValueAssignment(AttributeValueAssignment {
                source: BlobIndex(be::get_i32(src, 4)?),
                target: BlobIndex(be::get_i32(src, 8)?),
                value_node: BlobIndex(be::get_i32(src, 12)?),
            }),
            BlobType::DeferredEdgeList => {
                let cap = be::get_i32(src, 8)?;
                Blob::DeferredEdgeList(DeferredEdgeList {
                    first_blob: BlobIndex(be::get_i32(src, 4)?),
                    capacity: usize::try_from(cap)
                        .map_err(|_| StrataError::Corruption(format!("deferred capacity {cap}")))?,
                })
            }
            BlobType::AssignTagName => {
                let len = be::get_u32(src, 4)? as usize;
                let at = layout::buffer_at(ty).unwrap_or(32);
                Blob::AssignTagName(AssignTagName {
                    source: BlobIndex(be::get_i32(src, 8)?),
                    target: BlobIndex(be::get_i32(src, 12)?),
                    tag: utf8(slice(src, at, len)?)?,
                })
            }
        };
        Ok(blob)
    }
}

fn buffer_len(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len()).map_err(|_| StrataError::Invalid("buffer longer than 4 GiB".into()))
}

fn slice(src: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    src.get(at..at + len)
        .ok_or_else(|| StrataError::Corruption(format!("buffer of {len} bytes at {at} overruns record")))
}

fn utf8(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|err| StrataError::Corruption(format!("utf8 field: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(blob: &Blob) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; blob.encoded_len()];
        blob.encode_into(&mut bytes)?;
        Ok(bytes)
    }

    #[test]
    fn relation_fields_and_segment() -> Result<()> {
        let blob = Blob::Relation(RelationEdge {
            relation_type: RelationType(3),
            source: BlobIndex(50),
            target: BlobIndex(60),
            instantiation: TimeSlice(2),
            termination: TimeSlice(0),
            uid: BaseUid([1; 16]),
        });
        let bytes = encode(&blob)?;
        assert_eq!(bytes.len(), 80);
        assert_eq!(layout::record_size(&bytes)?, 80);
        assert_eq!(be::get_i32(&bytes, 40)?, 5);
        assert_eq!(be::get_i32(&bytes, 40 + 8 + 20)?, SENTINEL_SUBSEQUENT);
        let decoded = Blob::decode(&bytes)?;
        assert_eq!(decoded.source_target(), Some((BlobIndex(50), BlobIndex(60))));
        assert_eq!(decoded, blob);
        Ok(())
    }

    #[test]
    fn tag_buffer_follows_segment() -> Result<()> {
        let blob = Blob::AssignTagName(AssignTagName {
            source: BlobIndex(44),
            target: BlobIndex(70),
            tag: "alpha".into(),
        });
        let bytes = encode(&blob)?;
        assert_eq!(&bytes[32..37], b"alpha");
        assert_eq!(Blob::decode(&bytes)?, blob);
        Ok(())
    }

    #[test]
    fn root_rejects_long_version() {
        let blob = Blob::Root(RootNode {
            uid: BaseUid::ZERO,
            layout_version: "x".repeat(63),
            revision: String::new(),
        });
        assert!(encode(&blob).is_err());
    }
}
