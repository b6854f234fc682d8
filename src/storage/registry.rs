//! Name to token registry owned by a graph.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::types::{EntityType, EnumValue, RelationType, Result, StrataError};

/// Ordinals per enum family; the low four bits of a value token, zero excluded.
const MAX_ENUM_ORDINAL: u32 = 15;

#[derive(Default, Debug, Clone)]
struct Names {
    names: Vec<String>,
    ids: FxHashMap<String, u32>,
}

impl Names {
    fn intern(&mut self, name: &str) -> (u32, bool) {
        if let Some(id) = self.ids.get(name) {
            return (*id, false);
        }
        self.names.push(name.to_owned());
        let id = self.names.len() as u32;
        self.ids.insert(name.to_owned(), id);
        (id, true)
    }

    fn get(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    fn name(&self, id: u32) -> Option<&str> {
        let slot = usize::try_from(id).ok()?.checked_sub(1)?;
        self.names.get(slot).map(String::as_str)
    }
}

/// Tokens for entity types, relation types and enum values.
///
/// Tokens start at 1 and are handed out in registration order.
#[derive(Default, Debug, Clone)]
pub struct TokenRegistry {
    entity_types: Names,
    relation_types: Names,
    enum_families: Names,
    enum_values: FxHashMap<u32, Names>,
}

impl TokenRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the entity type `name`, registering it on first use.
    pub fn entity_type(&mut self, name: &str) -> EntityType {
        let (id, fresh) = self.entity_types.intern(name);
        if fresh {
            debug!(name, token = id, "registry.entity_type");
        }
        EntityType(id)
    }

    /// Token of the relation type `name`, registering it on first use.
    pub fn relation_type(&mut self, name: &str) -> RelationType {
        let (id, fresh) = self.relation_types.intern(name);
        if fresh {
            debug!(name, token = id, "registry.relation_type");
        }
        RelationType(id)
    }

    /// Family number of an enumeration, for [`crate::types::ValueRepType::enumeration`].
    pub fn enum_family(&mut self, family: &str) -> u32 {
        self.enum_families.intern(family).0
    }

    /// Token of `value` in the enum `family`, registering both on first use.
    pub fn enum_value(&mut self, family: &str, value: &str) -> Result<EnumValue> {
        let fam = self.enum_family(family);
        let values = self.enum_values.entry(fam).or_default();
        if values.get(value).is_none() && values.names.len() as u32 >= MAX_ENUM_ORDINAL {
            return Err(StrataError::Invalid(format!(
                "enum family {family} already has {MAX_ENUM_ORDINAL} values"
            )));
        }
        let (ordinal, _) = values.intern(value);
        Ok(EnumValue::new(fam << 4, ordinal))
    }

    /// Token of a registered entity type.
    pub fn lookup_entity_type(&self, name: &str) -> Option<EntityType> {
        self.entity_types.get(name).map(EntityType)
    }

    /// Token of a registered relation type.
    pub fn lookup_relation_type(&self, name: &str) -> Option<RelationType> {
        self.relation_types.get(name).map(RelationType)
    }

    /// Name an entity type token was registered under.
    pub fn entity_type_name(&self, et: EntityType) -> Option<&str> {
        self.entity_types.name(et.0)
    }

    /// Name a relation type token was registered under.
    pub fn relation_type_name(&self, rt: RelationType) -> Option<&str> {
        self.relation_types.name(rt.0)
    }

    /// `(family, value)` names of an enum token.
    pub fn enum_value_name(&self, ev: EnumValue) -> Option<(&str, &str)> {
        let fam = ev.0 >> 4;
        let family = self.enum_families.name(fam)?;
        let value = self.enum_values.get(&fam)?.name(ev.0 & 0xF)?;
        Some((family, value))
    }
}

/// A token name seen before a registry was available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingToken {
    /// Entity type name.
    EntityType(String),
    /// Relation type name.
    RelationType(String),
    /// Value name within an enum family.
    EnumValue {
        /// Enum family name.
        family: String,
        /// Value name.
        value: String,
    },
}

/// Queue of names recorded before any graph exists.
#[derive(Default, Debug, Clone)]
pub struct PendingTokens {
    queue: Vec<PendingToken>,
}

impl PendingTokens {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `token` unless it is already queued.
    pub fn push(&mut self, token: PendingToken) {
        if !self.queue.contains(&token) {
            self.queue.push(token);
        }
    }

    /// Number of queued names.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Registers every queued name with `registry` and empties the queue.
    pub fn flush_into(&mut self, registry: &mut TokenRegistry) -> Result<usize> {
        let flushed = self.queue.len();
        for token in self.queue.drain(..) {
            match token {
                PendingToken::EntityType(name) => {
                    registry.entity_type(&name);
                }
                PendingToken::RelationType(name) => {
                    registry.relation_type(&name);
                }
                PendingToken::EnumValue { family, value } => {
                    registry.enum_value(&family, &value)?;
                }
            }
        }
        debug!(flushed, "registry.pending.flushed");
        Ok(flushed)
    }
}
