//! Delegate hierarchy.
//!
//! Delegates are type-level records hanging off the root through chains of
//! to-delegate edges: an order `n` delegate sits `n` levels below the root along
//! delegates of the same kind. Relation delegates are grouped under a self-loop
//! relation record per relation type; a triple delegate of order `n` connects the
//! order `n` delegates of its source and target kinds.

use tracing::debug;

use super::{Graph, GraphState};
use crate::storage::blob::{AttributeEntityNode, Blob, EntityNode, Link, RelationEdge, RootNode, TxEventNode};
use crate::storage::edges;
use crate::storage::layout::BlobType;
use crate::types::{BaseUid, BlobIndex, EntityType, RelationType, Result, StrataError, TimeSlice, Timestamp, ValueRepType};

/// What a delegate stands for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DelegateKind {
    /// Entities of one type.
    Entity(EntityType),
    /// Attribute entities of one representation type.
    Value(ValueRepType),
    /// Group of all relation delegates of one type.
    Relation(RelationType),
    /// Relations of one type between two kinds of ends.
    Triple {
        /// Kind of the source end.
        source: Box<DelegateKind>,
        /// Relation type.
        relation: RelationType,
        /// Kind of the target end.
        target: Box<DelegateKind>,
    },
    /// Tx markers.
    Tx,
    /// The root.
    Root,
}

/// A delegate descriptor; order 0 describes an instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Delegate {
    /// Distance from the instances; zero for an instance.
    pub order: u32,
    /// What the delegate stands for.
    pub kind: DelegateKind,
}

impl Delegate {
    /// Descriptor of an order `order` delegate of `kind`.
    pub fn new(order: u32, kind: DelegateKind) -> Self {
        Self { order, kind }
    }

    /// Relation delegate between two kinds.
    pub fn triple(order: u32, source: DelegateKind, relation: RelationType, target: DelegateKind) -> Self {
        Self::new(
            order,
            DelegateKind::Triple {
                source: Box::new(source),
                relation,
                target: Box::new(target),
            },
        )
    }
}

impl GraphState {
    pub(crate) fn incoming_to_delegate(&self, index: BlobIndex) -> Result<Option<BlobIndex>> {
        Ok(edges::linked(&self.store, index, BlobType::ToDelegate, false)?
            .into_iter()
            .next())
    }

    pub(crate) fn is_delegate(&self, index: BlobIndex) -> Result<bool> {
        Ok(self.incoming_to_delegate(index)?.is_some())
    }

    pub(crate) fn is_group(&self, index: BlobIndex) -> Result<bool> {
        Ok(matches!(self.store.blob(index)?, Blob::Relation(r) if r.source == index && r.target == index))
    }

    /// Index of the delegate, or `None` when it does not exist and `create` is off.
    ///
    /// With `create` set, missing levels are written and a retired delegate and its
    /// retired ancestors are instantiated again in the open tx.
    pub(crate) fn delegate_index(&mut self, delegate: &Delegate, create: bool) -> Result<Option<BlobIndex>> {
        if delegate.order == 0 {
            return Err(StrataError::Invalid("order 0 names an instance, not a delegate".into()));
        }
        let found = match self.delegates.get(delegate).copied() {
            Some(index) => Some(index),
            None => self.find_delegate(delegate, create)?,
        };
        let Some(index) = found else {
            return Ok(None);
        };
        if create {
            self.reinstantiate(index)?;
        }
        self.delegates.put(delegate.clone(), index);
        Ok(Some(index))
    }

    fn find_delegate(&mut self, delegate: &Delegate, create: bool) -> Result<Option<BlobIndex>> {
        if let DelegateKind::Triple {
            source,
            relation,
            target,
        } = &delegate.kind
        {
            let group = Delegate::new(1, DelegateKind::Relation(*relation));
            let Some(mut z) = self.delegate_index(&group, create)? else {
                return Ok(None);
            };
            for level in 1..=delegate.order {
                let src = self.delegate_index(&Delegate::new(level, (**source).clone()), create)?;
                let trg = self.delegate_index(&Delegate::new(level, (**target).clone()), create)?;
                let (Some(src), Some(trg)) = (src, trg) else {
                    return Ok(None);
                };
                z = match self.triple_child(z, *relation, src, trg)? {
                    Some(child) => child,
                    None if create => self.create_triple_child(z, *relation, src, trg)?,
                    None => return Ok(None),
                };
            }
            return Ok(Some(z));
        }
        let mut z = BlobIndex::ROOT;
        for _ in 0..delegate.order {
            z = match self.child(z, &delegate.kind)? {
                Some(child) => child,
                None if create => self.create_child(z, &delegate.kind)?,
                None => return Ok(None),
            };
        }
        Ok(Some(z))
    }

    fn children(&self, parent: BlobIndex) -> Result<Vec<BlobIndex>> {
        edges::linked(&self.store, parent, BlobType::ToDelegate, true)?
            .into_iter()
            .map(|td| self.ends_of(td).map(|(_, target)| target))
            .collect()
    }

    fn child(&self, parent: BlobIndex, kind: &DelegateKind) -> Result<Option<BlobIndex>> {
        for t in self.children(parent)? {
            let hit = match (kind, self.store.blob(t)?) {
                (DelegateKind::Entity(et), Blob::Entity(e)) => e.entity_type == *et,
                (DelegateKind::Value(vrt), Blob::AttributeEntity(a)) => a.rep_type == *vrt,
                (DelegateKind::Relation(rt), Blob::Relation(r)) => {
                    r.relation_type == *rt && r.source == t && r.target == t
                }
                (DelegateKind::Tx, Blob::TxEvent(_)) | (DelegateKind::Root, Blob::Root(_)) => true,
                _ => false,
            };
            if hit {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }

    fn triple_child(
        &self,
        parent: BlobIndex,
        rt: RelationType,
        source: BlobIndex,
        target: BlobIndex,
    ) -> Result<Option<BlobIndex>> {
        for t in self.children(parent)? {
            if let Blob::Relation(r) = self.store.blob(t)? {
                if r.relation_type == rt && r.source == source && r.target == target && r.source != t {
                    return Ok(Some(t));
                }
            }
        }
        Ok(None)
    }

    fn create_child(&mut self, parent: BlobIndex, kind: &DelegateKind) -> Result<BlobIndex> {
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        let index = match kind {
            DelegateKind::Entity(et) => self.store.append_blob(&Blob::Entity(EntityNode {
                entity_type: *et,
                instantiation: slice,
                termination: TimeSlice(0),
                uid: BaseUid::ZERO,
            }))?,
            DelegateKind::Value(vrt) => self.store.append_blob(&Blob::AttributeEntity(AttributeEntityNode {
                rep_type: *vrt,
                instantiation: slice,
                termination: TimeSlice(0),
                uid: BaseUid::ZERO,
            }))?,
            DelegateKind::Relation(rt) => {
                let at = self.store.write_head();
                self.write_edge(Blob::Relation(RelationEdge {
                    relation_type: *rt,
                    source: at,
                    target: at,
                    instantiation: slice,
                    termination: TimeSlice(0),
                    uid: BaseUid::ZERO,
                }))?
            }
            DelegateKind::Tx => self.store.append_blob(&Blob::TxEvent(TxEventNode {
                time: Timestamp(0),
                time_slice: TimeSlice(0),
                uid: BaseUid::ZERO,
            }))?,
            DelegateKind::Root => self.store.append_blob(&Blob::Root(RootNode {
                uid: BaseUid::ZERO,
                layout_version: String::new(),
                revision: String::new(),
            }))?,
            DelegateKind::Triple { .. } => {
                return Err(StrataError::Invalid("triple delegates hang below their group".into()));
            }
        };
        self.attach_delegate(parent, index, tx)?;
        Ok(index)
    }

    fn create_triple_child(
        &mut self,
        parent: BlobIndex,
        rt: RelationType,
        source: BlobIndex,
        target: BlobIndex,
    ) -> Result<BlobIndex> {
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        let index = self.write_edge(Blob::Relation(RelationEdge {
            relation_type: rt,
            source,
            target,
            instantiation: slice,
            termination: TimeSlice(0),
            uid: BaseUid::ZERO,
        }))?;
        self.attach_delegate(parent, index, tx)?;
        Ok(index)
    }

    fn attach_delegate(&mut self, parent: BlobIndex, child: BlobIndex, tx: BlobIndex) -> Result<()> {
        let td = self.write_edge(Blob::ToDelegate(Link {
            source: parent,
            target: child,
        }))?;
        self.write_edge(Blob::DelegateInstantiation(Link { source: tx, target: td }))?;
        debug!(parent = parent.0, delegate = child.0, "delegate.created");
        Ok(())
    }

    /// Instantiates `index` and its ancestors again while they are retired.
    fn reinstantiate(&mut self, index: BlobIndex) -> Result<()> {
        let slice = self.pending_slice()?;
        let mut cur = index;
        while let Some(td) = self.incoming_to_delegate(cur)? {
            if self.delegate_alive(td, slice)? {
                break;
            }
            let tx = self.get_or_open_tx()?;
            self.write_edge(Blob::DelegateInstantiation(Link { source: tx, target: td }))?;
            debug!(delegate = cur.0, "delegate.reinstantiated");
            cur = self.ends_of(td)?.0;
        }
        Ok(())
    }

    /// Descriptor of the delegate (or instance, with order 0) at `index`.
    pub(crate) fn delegate_of(&self, index: BlobIndex) -> Result<Delegate> {
        let blob = self.store.blob(index)?;
        if let Blob::Relation(r) = &blob {
            if !(r.source == index && r.target == index) {
                let mut order = 0;
                let mut cur = index;
                while let Some(td) = self.incoming_to_delegate(cur)? {
                    order += 1;
                    cur = self.ends_of(td)?.0;
                    if self.is_group(cur)? {
                        break;
                    }
                }
                let source = self.delegate_of(r.source)?.kind;
                let target = self.delegate_of(r.target)?.kind;
                return Ok(Delegate::triple(order, source, r.relation_type, target));
            }
        }
        let kind = match blob {
            Blob::Entity(e) => DelegateKind::Entity(e.entity_type),
            Blob::AttributeEntity(a) => DelegateKind::Value(a.rep_type),
            Blob::Relation(r) => DelegateKind::Relation(r.relation_type),
            Blob::TxEvent(_) => DelegateKind::Tx,
            Blob::Root(_) => DelegateKind::Root,
            other => {
                return Err(StrataError::type_mismatch(index, "instance or delegate", other.blob_type().name()));
            }
        };
        let mut order = 0;
        let mut cur = index;
        while let Some(td) = self.incoming_to_delegate(cur)? {
            order += 1;
            cur = self.ends_of(td)?.0;
        }
        Ok(Delegate::new(order, kind))
    }

    /// To-delegate edge into the order 1 delegate of `kind`, creating it if needed.
    pub(crate) fn instance_anchor(&mut self, kind: DelegateKind) -> Result<BlobIndex> {
        let delegate = self
            .delegate_index(&Delegate::new(1, kind), true)?
            .ok_or(StrataError::NotFound)?;
        self.incoming_to_delegate(delegate)?
            .ok_or_else(|| StrataError::Corruption(format!("delegate {delegate} has no to-delegate edge")))
    }

    pub(crate) fn retire_delegate(&mut self, delegate: &Delegate) -> Result<BlobIndex> {
        let index = self
            .delegate_index(delegate, false)?
            .ok_or(StrataError::NotFound)?;
        let td = self
            .incoming_to_delegate(index)?
            .ok_or_else(|| StrataError::Corruption(format!("delegate {index} has no to-delegate edge")))?;
        let tx = self.get_or_open_tx()?;
        let slice = self.time_slice_of(tx)?;
        if !self.delegate_alive(td, slice)? {
            return Err(StrataError::NotAlive {
                index,
                time_slice: slice,
            });
        }
        let lo = self.store.write_head();
        let edge = self.write_edge(Blob::DelegateRetirement(Link { source: tx, target: td }))?;
        self.apply_range(lo)?;
        debug!(delegate = index.0, "delegate.retired");
        Ok(edge)
    }
}

impl Graph {
    /// Finds the delegate; with `create` set (write role required) missing levels
    /// are written.
    pub fn delegate_index(&self, delegate: &Delegate, create: bool) -> Result<Option<BlobIndex>> {
        if create {
            let mut state = self.write()?;
            let lo = state.store.write_head();
            let found = state.delegate_index(delegate, true)?;
            state.apply_range(lo)?;
            return Ok(found);
        }
        let mut state = self.write_unchecked();
        let found = state.delegate_index(delegate, false)?;
        let hi = self.visible_head(&state);
        Ok(found.filter(|index| *index < hi))
    }

    /// Descriptor of `record`, which must be visible.
    pub fn delegate_of(&self, record: BlobIndex) -> Result<Delegate> {
        let state = self.read();
        self.check_visible(&state, record)?;
        state.delegate_of(record)
    }

    /// Retires an existing, live delegate in the open tx.
    pub fn retire_delegate(&self, delegate: &Delegate) -> Result<BlobIndex> {
        self.write()?.retire_delegate(delegate)
    }
}
