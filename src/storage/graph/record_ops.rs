use tracing::debug;

use super::{DelegateKind, Graph, GraphState};
use crate::storage::blob::{
    AssignTagName, AtomicValueAssignment, AttributeEntityNode, AttributeValueAssignment, Blob, EntityNode, Link,
    RelationEdge, ValueNode,
};
use crate::storage::caches::{value_hash, CacheKey, CacheName};
use crate::storage::edges;
use crate::storage::layout::{BlobType, MAX_TAG_LEN};
use crate::types::{
    BaseUid, BlobIndex, EntityType, RelationType, Result, StrataError, TimeSlice, Value, ValueRepType,
};

impl GraphState {
    fn claim_uid(&mut self, uid: Option<BaseUid>) -> Result<BaseUid> {
        match uid {
            Some(uid) if uid.is_zero() => Err(StrataError::Invalid("the zero uid is reserved for delegates".into())),
            Some(uid) if self.caches.get(CacheName::UidLookup).contains(&CacheKey::Uid(uid)) => {
                Err(StrataError::Invalid(format!("uid {uid} already in use")))
            }
            Some(uid) => Ok(uid),
            None => Ok(self.fresh_uid()),
        }
    }

    /// Writes an instance record, its RAE instance edge from the order 1 delegate
    /// and the instantiation edge from the open tx.
    fn instantiate_with(
        &mut self,
        kind: DelegateKind,
        uid: Option<BaseUid>,
        build: impl FnOnce(TimeSlice, BaseUid) -> Blob,
    ) -> Result<BlobIndex> {
        let uid = self.claim_uid(uid)?;
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        let lo = self.store.write_head();
        let anchor = self.instance_anchor(kind)?;
        let blob = build(slice, uid);
        let index = if blob.source_target().is_some() {
            self.write_edge(blob)?
        } else {
            self.store.append_blob(&blob)?
        };
        let rae = self.write_edge(Blob::RaeInstance(Link {
            source: anchor,
            target: index,
        }))?;
        self.write_edge(Blob::Instantiation(Link { source: tx, target: rae }))?;
        self.apply_range(lo)?;
        debug!(index = index.0, uid = %uid, time_slice = slice.0, "graph.instantiated");
        Ok(index)
    }

    pub(crate) fn instantiate_entity(&mut self, et: EntityType, uid: Option<BaseUid>) -> Result<BlobIndex> {
        self.instantiate_with(DelegateKind::Entity(et), uid, |slice, uid| {
            Blob::Entity(EntityNode {
                entity_type: et,
                instantiation: slice,
                termination: TimeSlice(0),
                uid,
            })
        })
    }

    pub(crate) fn instantiate_attribute_entity(
        &mut self,
        rep_type: ValueRepType,
        uid: Option<BaseUid>,
    ) -> Result<BlobIndex> {
        self.instantiate_with(DelegateKind::Value(rep_type), uid, |slice, uid| {
            Blob::AttributeEntity(AttributeEntityNode {
                rep_type,
                instantiation: slice,
                termination: TimeSlice(0),
                uid,
            })
        })
    }

    pub(crate) fn instantiate_relation(
        &mut self,
        rt: RelationType,
        source: BlobIndex,
        target: BlobIndex,
        uid: Option<BaseUid>,
    ) -> Result<BlobIndex> {
        let slice = self.pending_slice()?;
        self.check_live_instance(source, slice)?;
        self.check_live_instance(target, slice)?;
        let kind = DelegateKind::Triple {
            source: Box::new(self.delegate_of(source)?.kind),
            relation: rt,
            target: Box::new(self.delegate_of(target)?.kind),
        };
        self.instantiate_with(kind, uid, |slice, uid| {
            Blob::Relation(RelationEdge {
                relation_type: rt,
                source,
                target,
                instantiation: slice,
                termination: TimeSlice(0),
                uid,
            })
        })
    }

    /// Fails unless `index` is an instance (not a delegate) alive at `slice`.
    fn check_live_instance(&self, index: BlobIndex, slice: TimeSlice) -> Result<()> {
        let ty = self.store.blob_type(index)?;
        if !ty.is_instance_kind() || self.is_delegate(index)? {
            return Err(StrataError::type_mismatch(index, "entity, attribute entity or relation instance", ty.name()));
        }
        if !self.exists_at(index, slice)? {
            return Err(StrataError::NotAlive {
                index,
                time_slice: slice,
            });
        }
        Ok(())
    }

    /// RAE instance edge pointing at the instance `index`.
    pub(crate) fn rae_of(&self, index: BlobIndex) -> Result<BlobIndex> {
        edges::linked(&self.store, index, BlobType::RaeInstance, false)?
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::Corruption(format!("instance {index} has no RAE instance edge")))
    }

    /// Terminates `index` and every live relation attached to it.
    pub(crate) fn terminate(&mut self, index: BlobIndex) -> Result<Vec<BlobIndex>> {
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        self.check_live_instance(index, slice)?;
        let mut doomed = vec![index];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let cur = doomed[cursor];
            cursor += 1;
            let Some((inst, _)) = self.store.blob(cur)?.lifetime() else {
                continue;
            };
            if inst >= slice {
                return Err(StrataError::Invalid(format!(
                    "blob {cur} was instantiated in the terminating tx"
                )));
            }
            for r in edges::edge_refs(&self.store, cur)? {
                let rel = edges::referenced(cur, r)?;
                if doomed.contains(&rel) || self.store.blob_type(rel)? != BlobType::Relation {
                    continue;
                }
                if !self.is_delegate(rel)? && self.exists_at(rel, slice)? {
                    doomed.push(rel);
                }
            }
        }
        let lo = self.store.write_head();
        for cur in &doomed {
            let rae = self.rae_of(*cur)?;
            self.write_edge(Blob::Termination(Link { source: tx, target: rae }))?;
        }
        self.apply_range(lo)?;
        debug!(index = index.0, cascaded = doomed.len() - 1, time_slice = slice.0, "graph.terminated");
        Ok(doomed)
    }

    fn check_assignable(&self, ae: BlobIndex, value: &Value, slice: TimeSlice) -> Result<()> {
        let Blob::AttributeEntity(node) = self.store.blob(ae)? else {
            return Err(StrataError::type_mismatch(ae, "attribute entity", self.store.blob_type(ae)?.name()));
        };
        self.check_live_instance(ae, slice)?;
        if value.rep_type() != node.rep_type {
            return Err(StrataError::type_mismatch(ae, "value of the attribute's representation", value.rep_type()));
        }
        Ok(())
    }

    pub(crate) fn assign_value(&mut self, ae: BlobIndex, value: &Value) -> Result<BlobIndex> {
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        self.check_assignable(ae, value, slice)?;
        let lo = self.store.write_head();
        let edge = self.write_edge(Blob::AtomicValueAssignment(AtomicValueAssignment {
            rep_type: value.rep_type(),
            source: tx,
            target: ae,
            data: value.encode(),
        }))?;
        self.apply_range(lo)?;
        Ok(edge)
    }

    /// Assigns a deduplicated value node; equal bodies share one node.
    pub(crate) fn assign_value_node(&mut self, ae: BlobIndex, value: &Value) -> Result<BlobIndex> {
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        self.check_assignable(ae, value, slice)?;
        let rep_type = value.rep_type();
        let data = value.encode();
        let lo = self.store.write_head();
        let mut node = None;
        for candidate in self
            .caches
            .get(CacheName::AvHashLookup)
            .values(&CacheKey::Hash(value_hash(rep_type, &data)))
        {
            if let Blob::Value(v) = self.store.blob(candidate)? {
                if v.rep_type == rep_type && v.data == data {
                    node = Some(candidate);
                    break;
                }
            }
        }
        let value_node = match node {
            Some(existing) => existing,
            None => self.store.append_blob(&Blob::Value(ValueNode { rep_type, data }))?,
        };
        let edge = self.write_edge(Blob::AttributeValueAssignment(AttributeValueAssignment {
            source: tx,
            target: ae,
            value_node,
        }))?;
        self.apply_range(lo)?;
        Ok(edge)
    }

    /// Value of the attribute entity at `slice`: the latest assignment made in a
    /// tx at or before it.
    pub(crate) fn value_of(&self, ae: BlobIndex, slice: TimeSlice) -> Result<Option<Value>> {
        let Blob::AttributeEntity(_) = self.store.blob(ae)? else {
            return Err(StrataError::type_mismatch(ae, "attribute entity", self.store.blob_type(ae)?.name()));
        };
        let mut latest = None;
        for r in edges::edge_refs(&self.store, ae)? {
            if r > 0 {
                continue;
            }
            let edge = BlobIndex(-r);
            let (tx, rep_type, data) = match self.store.blob(edge)? {
                Blob::AtomicValueAssignment(a) => (a.source, a.rep_type, a.data),
                Blob::AttributeValueAssignment(a) => match self.store.blob(a.value_node)? {
                    Blob::Value(v) => (a.source, v.rep_type, v.data),
                    other => {
                        return Err(StrataError::type_mismatch(a.value_node, "value node", other.blob_type().name()));
                    }
                },
                _ => continue,
            };
            if self.time_slice_of(tx)? <= slice {
                latest = Some((rep_type, data));
            }
        }
        latest.map(|(rep, data)| Value::decode(rep, &data)).transpose()
    }

    pub(crate) fn assign_tag(&mut self, index: BlobIndex, tag: &str) -> Result<BlobIndex> {
        if tag.is_empty() || tag.len() > MAX_TAG_LEN {
            return Err(StrataError::Invalid(format!(
                "tag length {} outside 1..={MAX_TAG_LEN}",
                tag.len()
            )));
        }
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        self.check_live_instance(index, slice)?;
        let rae = self.rae_of(index)?;
        let previous = self
            .caches
            .get(CacheName::TagLookup)
            .latest_origin(&CacheKey::Tag(tag.to_owned()));
        let lo = self.store.write_head();
        let edge = self.write_edge(Blob::AssignTagName(AssignTagName {
            source: tx,
            target: rae,
            tag: tag.to_owned(),
        }))?;
        if let Some(prev) = previous {
            self.write_edge(Blob::NextTagNameAssignment(Link {
                source: prev,
                target: edge,
            }))?;
        }
        self.apply_range(lo)?;
        debug!(index = index.0, tag, "graph.tagged");
        Ok(edge)
    }

    /// Tokens of `name` introduced by records below `hi`.
    fn used_tokens(&self, name: CacheName, hi: BlobIndex) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .caches
            .get(name)
            .keys_below(hi)
            .filter_map(|key| match key {
                CacheKey::Token(t) => Some(*t),
                _ => None,
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl Graph {
    /// Instantiates an entity of type `et` in the open tx.
    pub fn instantiate_entity(&self, et: EntityType, uid: Option<BaseUid>) -> Result<BlobIndex> {
        self.write()?.instantiate_entity(et, uid)
    }

    /// Instantiates an attribute entity holding values of `rep_type`.
    pub fn instantiate_attribute_entity(&self, rep_type: ValueRepType, uid: Option<BaseUid>) -> Result<BlobIndex> {
        self.write()?.instantiate_attribute_entity(rep_type, uid)
    }

    /// Instantiates a relation between two live instances.
    pub fn instantiate_relation(
        &self,
        rt: RelationType,
        source: BlobIndex,
        target: BlobIndex,
        uid: Option<BaseUid>,
    ) -> Result<BlobIndex> {
        self.write()?.instantiate_relation(rt, source, target, uid)
    }

    /// Terminates an instance in the open tx along with its live relations;
    /// returns every terminated record.
    pub fn terminate(&self, record: BlobIndex) -> Result<Vec<BlobIndex>> {
        self.write()?.terminate(record)
    }

    /// Assigns `value` to `attribute_entity` with an atomic value assignment.
    pub fn assign_value(&self, attribute_entity: BlobIndex, value: &Value) -> Result<BlobIndex> {
        self.write()?.assign_value(attribute_entity, value)
    }

    /// Assigns `value` through a shared value node.
    pub fn assign_value_node(&self, attribute_entity: BlobIndex, value: &Value) -> Result<BlobIndex> {
        self.write()?.assign_value_node(attribute_entity, value)
    }

    /// Tags `record` with `tag`, moving the tag off its previous holder.
    pub fn assign_tag(&self, record: BlobIndex, tag: &str) -> Result<BlobIndex> {
        self.write()?.assign_tag(record, tag)
    }

    /// Value of `attribute_entity` as of `slice`.
    pub fn value_of(&self, attribute_entity: BlobIndex, slice: TimeSlice) -> Result<Option<Value>> {
        let state = self.read();
        self.check_visible(&state, attribute_entity)?;
        state.value_of(attribute_entity, slice)
    }

    /// Record carrying `uid`.
    pub fn lookup_uid(&self, uid: BaseUid) -> Option<BlobIndex> {
        let state = self.read();
        let hi = self.visible_head(&state);
        state
            .caches
            .get(CacheName::UidLookup)
            .latest_below(&CacheKey::Uid(uid), hi)
    }

    /// Record most recently tagged `tag`.
    pub fn lookup_tag(&self, tag: &str) -> Option<BlobIndex> {
        let state = self.read();
        let hi = self.visible_head(&state);
        state
            .caches
            .get(CacheName::TagLookup)
            .latest_below(&CacheKey::Tag(tag.to_owned()), hi)
    }

    /// Entity types in use by visible records.
    pub fn ets_used(&self) -> Vec<EntityType> {
        let state = self.read();
        state
            .used_tokens(CacheName::EtsUsed, self.visible_head(&state))
            .into_iter()
            .map(EntityType)
            .collect()
    }

    /// Relation types in use by visible records.
    pub fn rts_used(&self) -> Vec<RelationType> {
        let state = self.read();
        state
            .used_tokens(CacheName::RtsUsed, self.visible_head(&state))
            .into_iter()
            .map(RelationType)
            .collect()
    }

    /// Enum families and enum values in use, as raw tokens.
    pub fn ens_used(&self) -> Vec<u32> {
        let state = self.read();
        state.used_tokens(CacheName::EnsUsed, self.visible_head(&state))
    }
}
