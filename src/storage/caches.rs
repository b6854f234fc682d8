//! Derived lookup caches.
//!
//! Every cache is an append log of `(key, value, origin)` entries where `origin` is
//! the record whose apply handler produced the entry. Keying removals by origin is
//! what makes each unapply handler the exact inverse of its apply handler.

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{BaseUid, BlobIndex, Checksum, Result, StrataError, ValueRepType, Xxh64};

/// Names of the caches a graph maintains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheName {
    /// Entity types with an order 1 delegate.
    #[serde(rename = "_ETs_used")]
    EtsUsed,
    /// Relation types with an order 1 delegate.
    #[serde(rename = "_RTs_used")]
    RtsUsed,
    /// Enum families and values in use.
    #[serde(rename = "_ENs_used")]
    EnsUsed,
    /// Uid to record.
    #[serde(rename = "_uid_lookup")]
    UidLookup,
    /// Tag to the record it currently names.
    #[serde(rename = "_tag_lookup")]
    TagLookup,
    /// Value node body hash to value node.
    #[serde(rename = "_av_hash_lookup")]
    AvHashLookup,
}

impl CacheName {
    /// Every cache, in block order.
    pub const ALL: [CacheName; 6] = [
        CacheName::EtsUsed,
        CacheName::RtsUsed,
        CacheName::EnsUsed,
        CacheName::UidLookup,
        CacheName::TagLookup,
        CacheName::AvHashLookup,
    ];

    /// Name used in payload metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheName::EtsUsed => "_ETs_used",
            CacheName::RtsUsed => "_RTs_used",
            CacheName::EnsUsed => "_ENs_used",
            CacheName::UidLookup => "_uid_lookup",
            CacheName::TagLookup => "_tag_lookup",
            CacheName::AvHashLookup => "_av_hash_lookup",
        }
    }

    /// Inverse of [`CacheName::as_str`].
    pub fn parse(name: &str) -> Option<CacheName> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Entity type, relation type or enum token.
    Token(u32),
    /// Uid of a record.
    Uid(BaseUid),
    /// Tag name.
    Tag(String),
    /// Hash of a value node body.
    Hash(u64),
}

/// One cache entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheEntry {
    /// Lookup key.
    pub key: CacheKey,
    /// Record the key maps to.
    pub value: BlobIndex,
    /// Record whose apply handler produced the entry.
    pub origin: BlobIndex,
}

/// An entry a later record took out, kept while that record is unpublished.
#[derive(Clone, Debug)]
struct Superseded {
    entry: CacheEntry,
    by: BlobIndex,
}

/// One derived cache.
#[derive(Clone, Debug)]
pub struct Cache {
    name: CacheName,
    entries: Vec<CacheEntry>,
    lookup: FxHashMap<CacheKey, SmallVec<[(BlobIndex, BlobIndex); 1]>>,
    superseded: Vec<Superseded>,
    revision: u64,
    upstream_size: usize,
    upstream_revision: u64,
}

impl Cache {
    /// An empty cache at revision zero.
    pub fn new(name: CacheName) -> Self {
        Self {
            name,
            entries: Vec::new(),
            lookup: FxHashMap::default(),
            superseded: Vec::new(),
            revision: 0,
            upstream_size: 0,
            upstream_revision: 0,
        }
    }

    /// Which cache this is.
    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped by every removal.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of entries already externalized; zero once a removal invalidated them.
    pub fn upstream_size(&self) -> usize {
        if self.revision == self.upstream_revision {
            self.upstream_size.min(self.entries.len())
        } else {
            0
        }
    }

    /// Live entries in insertion order.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Adds an entry unless the same `(key, origin)` pair is present.
    pub fn insert(&mut self, key: CacheKey, value: BlobIndex, origin: BlobIndex) -> bool {
        let slot = self.lookup.entry(key.clone()).or_default();
        if slot.iter().any(|(o, _)| *o == origin) {
            return false;
        }
        slot.push((origin, value));
        self.superseded
            .retain(|s| !(s.entry.origin == origin && s.entry.key == key));
        self.entries.push(CacheEntry { key, value, origin });
        true
    }

    /// Adds an entry only when `key` is absent; used-type sets use this.
    pub fn insert_if_absent(&mut self, key: CacheKey, value: BlobIndex, origin: BlobIndex) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.insert(key, value, origin)
    }

    /// Removes the entry produced by `origin` for `key`.
    pub fn remove(&mut self, key: &CacheKey, origin: BlobIndex) -> bool {
        let Some(slot) = self.lookup.get_mut(key) else {
            return false;
        };
        let Some(pos) = slot.iter().position(|(o, _)| *o == origin) else {
            return false;
        };
        slot.remove(pos);
        if slot.is_empty() {
            self.lookup.remove(key);
        }
        if let Some(at) = self
            .entries
            .iter()
            .rposition(|e| e.origin == origin && &e.key == key)
        {
            self.entries.remove(at);
        }
        self.revision += 1;
        true
    }

    /// Removes the entry produced by `origin` for `key` on behalf of the record
    /// `by`. Readers that cannot see `by` yet keep seeing the entry until
    /// [`Cache::settle`] passes it.
    pub fn supersede(&mut self, key: &CacheKey, origin: BlobIndex, by: BlobIndex) -> bool {
        let value = self
            .lookup
            .get(key)
            .and_then(|slot| slot.iter().find(|(o, _)| *o == origin))
            .map(|(_, v)| *v);
        let Some(value) = value else {
            return false;
        };
        self.remove(key, origin);
        self.superseded.push(Superseded {
            entry: CacheEntry {
                key: key.clone(),
                value,
                origin,
            },
            by,
        });
        true
    }

    /// Forgets superseded entries whose superseding record lies below `published`.
    pub fn settle(&mut self, published: BlobIndex) {
        self.superseded.retain(|s| s.by >= published);
    }

    /// Whether any live entry has `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lookup.contains_key(key)
    }

    /// Value of the live entry with the highest origin.
    pub fn latest(&self, key: &CacheKey) -> Option<BlobIndex> {
        self.lookup
            .get(key)
            .and_then(|slot| slot.iter().max_by_key(|(origin, _)| *origin))
            .map(|(_, value)| *value)
    }

    /// Origin of the live entry with the highest origin.
    pub fn latest_origin(&self, key: &CacheKey) -> Option<BlobIndex> {
        self.lookup
            .get(key)
            .and_then(|slot| slot.iter().map(|(origin, _)| *origin).max())
    }

    /// Value of the entry with the highest origin as seen by a reader for whom
    /// only records below `hi` exist.
    pub fn latest_below(&self, key: &CacheKey, hi: BlobIndex) -> Option<BlobIndex> {
        let live = self.lookup.get(key).into_iter().flatten().copied();
        let taken = self
            .superseded
            .iter()
            .filter(|s| &s.entry.key == key && s.by >= hi)
            .map(|s| (s.entry.origin, s.entry.value));
        live.chain(taken)
            .filter(|(origin, _)| *origin < hi)
            .max_by_key(|(origin, _)| *origin)
            .map(|(_, value)| value)
    }

    /// Keys with at least one entry whose origin lies below `hi`.
    pub fn keys_below(&self, hi: BlobIndex) -> impl Iterator<Item = &CacheKey> + '_ {
        self.entries.iter().filter(move |e| e.origin < hi).map(|e| &e.key)
    }

    /// All values stored for `key`.
    pub fn values(&self, key: &CacheKey) -> Vec<BlobIndex> {
        self.lookup
            .get(key)
            .map(|slot| slot.iter().map(|(_, v)| *v).collect())
            .unwrap_or_default()
    }

    /// Drops every entry and adopts `revision`, ahead of a full transfer.
    pub fn reset(&mut self, revision: u64) {
        self.entries.clear();
        self.lookup.clear();
        self.superseded.clear();
        self.revision = revision;
        self.upstream_size = 0;
        self.upstream_revision = revision;
    }

    /// Records the first `size` entries as externalized at the current revision.
    pub fn mark_synced(&mut self, size: usize) {
        self.upstream_size = size.min(self.entries.len());
        self.upstream_revision = self.revision;
    }

    /// Encodes entries `[from, to)`.
    pub fn diff(&self, from: usize, to: usize) -> Result<Vec<u8>> {
        let slice = self.entries.get(from..to).ok_or_else(|| {
            StrataError::HeadsMismatch(format!(
                "cache {} range [{from}, {to}) beyond {} entries",
                self.name,
                self.entries.len()
            ))
        })?;
        let mut out = Vec::new();
        var::encode_u64(slice.len() as u64, &mut out);
        for entry in slice {
            encode_entry(entry, &mut out);
        }
        Ok(out)
    }

    /// Appends the entries of a diff produced by [`Cache::diff`].
    pub fn apply_diff(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut cur = Cursor::new(bytes);
        let count = cur.varint()?;
        let mut added = 0;
        for _ in 0..count {
            let entry = decode_entry(&mut cur)?;
            if self.insert(entry.key, entry.value, entry.origin) {
                added += 1;
            }
        }
        if !cur.is_empty() {
            return Err(StrataError::Corruption(format!(
                "{} trailing bytes in {} diff",
                cur.remaining(),
                self.name
            )));
        }
        Ok(added)
    }

    /// Entries in canonical order, for comparing caches built along different paths.
    pub fn canonical(&self) -> Vec<CacheEntry> {
        let mut out = self.entries.clone();
        out.sort();
        out
    }
}

/// Key of a value node body in the av-hash cache.
pub fn value_hash(rep_type: ValueRepType, data: &[u8]) -> u64 {
    let mut hasher = Xxh64::default();
    hasher.update(&rep_type.0.to_be_bytes());
    hasher.update(data);
    hasher.finalize()
}

fn encode_entry(entry: &CacheEntry, out: &mut Vec<u8>) {
    match &entry.key {
        CacheKey::Token(t) => {
            out.push(0);
            var::encode_u64(u64::from(*t), out);
        }
        CacheKey::Uid(uid) => {
            out.push(1);
            out.extend_from_slice(&uid.0);
        }
        CacheKey::Tag(tag) => {
            out.push(2);
            var::encode_u64(tag.len() as u64, out);
            out.extend_from_slice(tag.as_bytes());
        }
        CacheKey::Hash(h) => {
            out.push(3);
            out.extend_from_slice(&h.to_be_bytes());
        }
    }
    var::encode_i64(i64::from(entry.value.0), out);
    var::encode_i64(i64::from(entry.origin.0), out);
}

fn decode_entry(cur: &mut Cursor<'_>) -> Result<CacheEntry> {
    let key = match cur.take(1)?[0] {
        0 => CacheKey::Token(
            u32::try_from(cur.varint()?).map_err(|_| StrataError::Corruption("token overflow".into()))?,
        ),
        1 => {
            let mut uid = [0u8; 16];
            uid.copy_from_slice(cur.take(16)?);
            CacheKey::Uid(BaseUid(uid))
        }
        2 => {
            let len = cur.varint()? as usize;
            let raw = cur.take(len)?;
            CacheKey::Tag(
                String::from_utf8(raw.to_vec())
                    .map_err(|err| StrataError::Corruption(format!("tag key: {err}")))?,
            )
        }
        3 => CacheKey::Hash(cur.u64()?),
        other => return Err(StrataError::Corruption(format!("cache key kind {other}"))),
    };
    let index = |v: i64| {
        i32::try_from(v)
            .map(BlobIndex)
            .map_err(|_| StrataError::Corruption(format!("cache index {v}")))
    };
    let value = index(cur.varint_i64()?)?;
    let origin = index(cur.varint_i64()?)?;
    Ok(CacheEntry { key, value, origin })
}

/// The six caches of a graph.
#[derive(Clone, Debug)]
pub struct CacheSet {
    caches: [Cache; 6],
}

impl Default for CacheSet {
    fn default() -> Self {
        Self {
            caches: CacheName::ALL.map(Cache::new),
        }
    }
}

impl CacheSet {
    /// Cache `name`.
    pub fn get(&self, name: CacheName) -> &Cache {
        &self.caches[name.slot()]
    }

    /// Cache `name`, for replay.
    pub fn get_mut(&mut self, name: CacheName) -> &mut Cache {
        &mut self.caches[name.slot()]
    }

    /// Caches in [`CacheName::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = &Cache> + '_ {
        self.caches.iter()
    }

    /// Empties every cache and bumps its revision.
    pub fn clear(&mut self) {
        for cache in &mut self.caches {
            let revision = cache.revision + 1;
            cache.reset(revision);
        }
    }

    /// Runs [`Cache::settle`] on every cache.
    pub fn settle(&mut self, published: BlobIndex) {
        for cache in &mut self.caches {
            cache.settle(published);
        }
    }

    /// Canonical contents of every cache.
    pub fn fingerprint(&self) -> Vec<(CacheName, Vec<CacheEntry>)> {
        self.caches.iter().map(|c| (c.name, c.canonical())).collect()
    }
}
