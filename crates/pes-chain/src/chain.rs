//! One partition's ordered log and the materialized state replayed from it.
//!
//! All mutation happens under a single write lock per partition, so merges
//! are applied strictly in offset order and readers always observe a state
//! produced by a whole number of appends.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use pes_crypto::{Verifier, VerifyingKey};
use pes_types::{EntityId, EntryId, KeyHash, PartitionKey, SyncToken};
use tracing::{debug, info, warn};

use crate::codec::RecordCodec;
use crate::entry::{EntryMeta, Fields, LogEntry, LogRecord};
use crate::error::{ChainError, ChainResult, RightsError};
use crate::merge::{MergeSide, MergeStrategy};
use crate::object::MaterializedObject;
use crate::rights::{EntityView, RightsEngine};

/// Notified of every new head, including deletions.
///
/// Called while the chain's write lock is held: implementations must not
/// block and must not call back into the chain.
pub trait MergeListener: Send + Sync {
    fn on_merged(&self, object: &Arc<MaterializedObject>);
}

/// Why a record was set aside instead of merged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QuarantineReason {
    #[error("{0}")]
    Rights(RightsError),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// A record that was stored on the log but not applied to state.
#[derive(Clone, Debug)]
pub struct QuarantinedEntry {
    pub offset: u64,
    /// `None` when the record could not be decoded at all.
    pub entry: Option<Arc<LogEntry>>,
    pub reason: QuarantineReason,
}

impl QuarantinedEntry {
    fn awaits_key(&self, key: &KeyHash) -> bool {
        matches!(&self.reason, QuarantineReason::Rights(e) if e.retry_key().as_ref() == Some(key))
    }
}

/// What an append did to the chain.
#[derive(Clone, Debug)]
pub enum Disposition {
    /// The entry became (or merged into) the entity's head.
    Merged(Arc<MaterializedObject>),
    /// Lost a tie-break; kept in history only.
    Superseded { entity: EntityId, winner: EntryId },
    Quarantined(QuarantineReason),
    /// An entry with the same id was already applied.
    Duplicate(EntryId),
    SyncMarker(SyncToken),
    KeyAnnounced { key: KeyHash, retried: usize },
}

#[derive(Clone, Debug)]
pub struct AppendOutcome {
    pub offset: u64,
    pub disposition: Disposition,
}

/// Metadata of one entity's accepted entries, oldest first.
///
/// A detached snapshot: iterating it again always starts from the beginning
/// and later appends do not show up.
#[derive(Clone, Debug)]
pub struct History {
    entries: Arc<[EntryMeta]>,
}

impl History {
    pub fn iter(&self) -> std::slice::Iter<'_, EntryMeta> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self {
            entries: Arc::from(Vec::new()),
        }
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a EntryMeta;
    type IntoIter = std::slice::Iter<'a, EntryMeta>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Consistent read-only view of a chain, valid for the duration of
/// [`PartitionChain::read`].
pub struct ChainView<'a> {
    state: &'a ChainState,
}

impl ChainView<'_> {
    /// Live (non-deleted) head of `id`.
    pub fn get(&self, id: &EntityId) -> Option<&Arc<MaterializedObject>> {
        self.state.heads.get(id).filter(|o| !o.deleted)
    }

    /// Live heads of one entity type, in no particular order.
    pub fn objects_of_type<'b>(
        &'b self,
        entity_type: &'b str,
    ) -> impl Iterator<Item = &'b Arc<MaterializedObject>> + 'b {
        self.state
            .heads
            .values()
            .filter(move |o| !o.deleted && o.entity_type == entity_type)
    }

    pub fn last_offset(&self) -> Option<u64> {
        self.state.last_offset
    }
}

impl EntityView for ChainView<'_> {
    fn head(&self, id: &EntityId) -> Option<&MaterializedObject> {
        self.state.head(id)
    }
}

/// Ordered log of one partition plus its materialized objects.
pub struct PartitionChain {
    key: PartitionKey,
    engine: Arc<RightsEngine>,
    strategy: Arc<dyn MergeStrategy>,
    verifier: Arc<dyn Verifier>,
    state: RwLock<ChainState>,
    listeners: RwLock<Vec<Arc<dyn MergeListener>>>,
}

impl PartitionChain {
    pub fn new(
        key: PartitionKey,
        engine: Arc<RightsEngine>,
        strategy: Arc<dyn MergeStrategy>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            key,
            engine,
            strategy,
            verifier,
            state: RwLock::new(ChainState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn engine(&self) -> &Arc<RightsEngine> {
        &self.engine
    }

    pub fn add_listener(&self, listener: Arc<dyn MergeListener>) -> ChainResult<()> {
        self.listeners
            .write()
            .map_err(|_| ChainError::LockPoisoned)?
            .push(listener);
        Ok(())
    }

    /// Returns `false` if `listener` was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn MergeListener>) -> ChainResult<bool> {
        let mut listeners = self.listeners.write().map_err(|_| ChainError::LockPoisoned)?;
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        Ok(listeners.len() != before)
    }

    /// Apply a decoded record observed at `offset`.
    ///
    /// Offsets must be strictly increasing; anything else is corruption and
    /// leaves the chain untouched. Under a fail-on-conflict merge policy an
    /// unresolvable merge is returned as [`ChainError::MergeConflict`] after
    /// the record has been stored.
    pub fn append(&self, offset: u64, record: LogRecord) -> ChainResult<AppendOutcome> {
        self.ingest(offset, Ok(record))
    }

    /// Decode and apply raw log bytes. Undecodable records are quarantined.
    pub fn append_bytes(&self, offset: u64, bytes: &[u8]) -> ChainResult<AppendOutcome> {
        self.ingest(offset, RecordCodec::decode(bytes).map_err(|e| e.to_string()))
    }

    fn ingest(
        &self,
        offset: u64,
        record: Result<LogRecord, String>,
    ) -> ChainResult<AppendOutcome> {
        let mut state = self.state.write().map_err(|_| ChainError::LockPoisoned)?;
        let mut changed = Vec::new();
        let result = state.apply(&self.rules(), offset, record, &mut changed);

        if !changed.is_empty() {
            let listeners = self.listeners.read().map_err(|_| ChainError::LockPoisoned)?;
            for object in &changed {
                for listener in listeners.iter() {
                    listener.on_merged(object);
                }
            }
        }

        result.map(|disposition| AppendOutcome {
            offset,
            disposition,
        })
    }

    /// Retry entries quarantined for want of `key`, e.g. after the key was
    /// registered with the external verifier. Returns how many were merged.
    pub fn retry_quarantined(&self, key: &KeyHash) -> ChainResult<usize> {
        let mut state = self.state.write().map_err(|_| ChainError::LockPoisoned)?;
        let mut changed = Vec::new();
        state.retry(&self.rules(), key, &mut changed);

        let listeners = self.listeners.read().map_err(|_| ChainError::LockPoisoned)?;
        for object in &changed {
            for listener in listeners.iter() {
                listener.on_merged(object);
            }
        }
        Ok(changed.len())
    }

    /// Run `f` against a consistent view of the chain.
    pub fn read<R>(&self, f: impl FnOnce(&ChainView<'_>) -> R) -> ChainResult<R> {
        let state = self.state.read().map_err(|_| ChainError::LockPoisoned)?;
        Ok(f(&ChainView { state: &state }))
    }

    /// Latest state, or `None` if never created or deleted.
    pub fn get(&self, id: &EntityId) -> ChainResult<Option<Arc<MaterializedObject>>> {
        self.read(|view| view.get(id).cloned())
    }

    /// `true` if the entity was ever created, even if since deleted.
    pub fn ever_existed(&self, id: &EntityId) -> ChainResult<bool> {
        self.read(|view| view.state.heads.contains_key(id))
    }

    pub fn objects_of_type(&self, entity_type: &str) -> ChainResult<Vec<Arc<MaterializedObject>>> {
        self.read(|view| view.objects_of_type(entity_type).cloned().collect())
    }

    /// The stored entry that produced the current head.
    pub fn get_raw(&self, id: &EntityId) -> ChainResult<Option<Arc<LogEntry>>> {
        self.read(|view| {
            view.state
                .heads
                .get(id)
                .and_then(|head| view.state.entries.get(&head.version))
                .map(|(_, entry)| Arc::clone(entry))
        })
    }

    /// State of `id` as of log position `position` (inclusive), rebuilt by
    /// replaying that prefix of the log.
    pub fn get_version(
        &self,
        id: &EntityId,
        position: u64,
    ) -> ChainResult<Option<Arc<MaterializedObject>>> {
        let state = self.state.read().map_err(|_| ChainError::LockPoisoned)?;
        let prefix = state.log.iter().take_while(|slot| slot.offset <= position);
        let replayed = self.replay_slots(prefix);
        Ok(replayed.heads.get(id).filter(|o| !o.deleted).cloned())
    }

    pub fn get_history(&self, id: &EntityId) -> ChainResult<History> {
        self.read(|view| History {
            entries: view
                .state
                .history
                .get(id)
                .map(|h| Arc::from(h.as_slice()))
                .unwrap_or_else(|| Arc::from(Vec::new())),
        })
    }

    /// `true` if the entry passed validation and was resolved into state,
    /// as head or as a superseded sibling. Quarantined, unseen and
    /// conflicting entries are `false`.
    pub fn was_applied(&self, entry: &EntryId) -> ChainResult<bool> {
        self.read(|view| {
            view.state.entries.contains_key(entry) && !view.state.conflicted.contains(entry)
        })
    }

    /// A key announced on this partition's log.
    pub fn announced_key(&self, hash: &KeyHash) -> ChainResult<Option<VerifyingKey>> {
        self.read(|view| view.state.announced.get(hash).cloned())
    }

    pub fn quarantine(&self) -> ChainResult<Vec<QuarantinedEntry>> {
        self.read(|view| view.state.quarantine.clone())
    }

    pub fn last_offset(&self) -> ChainResult<Option<u64>> {
        self.read(|view| view.state.last_offset)
    }

    /// Number of records stored, including quarantined and marker records.
    pub fn len(&self) -> ChainResult<usize> {
        self.read(|view| view.state.log.len())
    }

    pub fn is_empty(&self) -> ChainResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Every head, deleted ones included, keyed by entity.
    pub fn snapshot(&self) -> ChainResult<BTreeMap<EntityId, MaterializedObject>> {
        self.read(|view| heads_by_id(view.state))
    }

    /// Heads rebuilt from offset zero without touching live state.
    pub fn replay(&self) -> ChainResult<BTreeMap<EntityId, MaterializedObject>> {
        let state = self.state.read().map_err(|_| ChainError::LockPoisoned)?;
        Ok(heads_by_id(&self.replay_slots(state.log.iter())))
    }

    fn replay_slots<'a>(&self, slots: impl Iterator<Item = &'a LogSlot>) -> ChainState {
        let rules = self.rules();
        let mut fresh = ChainState::default();
        let mut changed = Vec::new();
        for slot in slots {
            // Conflicts were already reported when the record first arrived.
            let _ = fresh.apply(&rules, slot.offset, slot.record.clone(), &mut changed);
            changed.clear();
        }
        fresh
    }

    fn rules(&self) -> Rules<'_> {
        Rules {
            key: &self.key,
            engine: &self.engine,
            strategy: self.strategy.as_ref(),
            verifier: self.verifier.as_ref(),
        }
    }
}

impl std::fmt::Debug for PartitionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionChain")
            .field("key", &self.key)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

fn heads_by_id(state: &ChainState) -> BTreeMap<EntityId, MaterializedObject> {
    state
        .heads
        .iter()
        .map(|(id, object)| (*id, object.as_ref().clone()))
        .collect()
}

struct Rules<'a> {
    key: &'a PartitionKey,
    engine: &'a RightsEngine,
    strategy: &'a dyn MergeStrategy,
    verifier: &'a dyn Verifier,
}

#[derive(Clone)]
struct LogSlot {
    offset: u64,
    record: Result<LogRecord, String>,
}

/// Keys announced on the log take precedence over the external verifier.
struct ChainKeys<'a> {
    announced: &'a HashMap<KeyHash, VerifyingKey>,
    external: &'a dyn Verifier,
}

impl Verifier for ChainKeys<'_> {
    fn public_key_for_hash(&self, hash: &KeyHash) -> Option<VerifyingKey> {
        self.announced
            .get(hash)
            .cloned()
            .or_else(|| self.external.public_key_for_hash(hash))
    }
}

#[derive(Default)]
struct ChainState {
    log: Vec<LogSlot>,
    last_offset: Option<u64>,
    heads: HashMap<EntityId, Arc<MaterializedObject>>,
    /// Every accepted version, by entry id; merge bases come from here.
    snapshots: HashMap<EntryId, Arc<MaterializedObject>>,
    entries: HashMap<EntryId, (u64, Arc<LogEntry>)>,
    history: HashMap<EntityId, Vec<EntryMeta>>,
    /// Kept in offset order.
    quarantine: Vec<QuarantinedEntry>,
    /// Entries a fail-on-conflict merge refused.
    conflicted: HashSet<EntryId>,
    announced: HashMap<KeyHash, VerifyingKey>,
}

impl EntityView for ChainState {
    fn head(&self, id: &EntityId) -> Option<&MaterializedObject> {
        self.heads.get(id).map(Arc::as_ref)
    }
}

impl ChainState {
    fn apply(
        &mut self,
        rules: &Rules<'_>,
        offset: u64,
        record: Result<LogRecord, String>,
        changed: &mut Vec<Arc<MaterializedObject>>,
    ) -> ChainResult<Disposition> {
        if let Some(last) = self.last_offset {
            if offset <= last {
                warn!(partition = %rules.key, offset, last, "out-of-order offset rejected");
                return Err(ChainError::Corruption {
                    partition: rules.key.clone(),
                    offset,
                    reason: format!("offset does not follow {last}"),
                });
            }
        }
        self.last_offset = Some(offset);
        self.log.push(LogSlot {
            offset,
            record: record.clone(),
        });

        match record {
            Err(reason) => {
                warn!(partition = %rules.key, offset, %reason, "undecodable record quarantined");
                self.park(QuarantinedEntry {
                    offset,
                    entry: None,
                    reason: QuarantineReason::Malformed(reason.clone()),
                });
                Ok(Disposition::Quarantined(QuarantineReason::Malformed(reason)))
            }
            Ok(LogRecord::Sync(token)) => Ok(Disposition::SyncMarker(token)),
            Ok(LogRecord::PublicKey(announcement)) => {
                let key = VerifyingKey::from_bytes(announcement.key).map_err(|e| {
                    ChainError::Codec(format!("announced key at offset {offset}: {e}"))
                });
                let key = match key {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(partition = %rules.key, offset, error = %e, "invalid key announcement");
                        let reason = QuarantineReason::Malformed(e.to_string());
                        self.park(QuarantinedEntry {
                            offset,
                            entry: None,
                            reason: reason.clone(),
                        });
                        return Ok(Disposition::Quarantined(reason));
                    }
                };
                let hash = key.key_hash();
                self.announced.insert(hash, key);
                let retried = self.retry(rules, &hash, changed);
                info!(partition = %rules.key, offset, key = %hash.short_id(), retried, "public key announced");
                Ok(Disposition::KeyAnnounced { key: hash, retried })
            }
            Ok(LogRecord::Data(entry)) => self.apply_entry(rules, offset, Arc::new(entry), changed),
        }
    }

    /// Re-run quarantined entries waiting on `key`, in offset order.
    fn retry(
        &mut self,
        rules: &Rules<'_>,
        key: &KeyHash,
        changed: &mut Vec<Arc<MaterializedObject>>,
    ) -> usize {
        let (waiting, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.quarantine)
            .into_iter()
            .partition(|q| q.awaits_key(key));
        self.quarantine = rest;

        let before = changed.len();
        for parked in waiting {
            let Some(entry) = parked.entry else { continue };
            if let Err(e) = self.apply_entry(rules, parked.offset, entry, changed) {
                warn!(partition = %rules.key, offset = parked.offset, error = %e, "retried entry not merged");
            }
        }
        changed.len() - before
    }

    fn park(&mut self, quarantined: QuarantinedEntry) {
        let at = self
            .quarantine
            .partition_point(|q| q.offset < quarantined.offset);
        self.quarantine.insert(at, quarantined);
    }

    fn quarantine_entry(
        &mut self,
        rules: &Rules<'_>,
        offset: u64,
        entry: Arc<LogEntry>,
        reason: QuarantineReason,
    ) -> Disposition {
        warn!(
            partition = %rules.key,
            offset,
            entry = %entry.entry_id,
            entity = %entry.entity_id,
            reason = ?reason,
            "entry quarantined"
        );
        self.park(QuarantinedEntry {
            offset,
            entry: Some(entry),
            reason: reason.clone(),
        });
        Disposition::Quarantined(reason)
    }

    fn apply_entry(
        &mut self,
        rules: &Rules<'_>,
        offset: u64,
        entry: Arc<LogEntry>,
        changed: &mut Vec<Arc<MaterializedObject>>,
    ) -> ChainResult<Disposition> {
        if self.entries.contains_key(&entry.entry_id) {
            debug!(partition = %rules.key, offset, entry = %entry.entry_id, "duplicate entry ignored");
            return Ok(Disposition::Duplicate(entry.entry_id));
        }
        if &entry.partition != rules.key {
            let reason = QuarantineReason::Malformed(format!("entry belongs to {}", entry.partition));
            return Ok(self.quarantine_entry(rules, offset, entry, reason));
        }
        if let Some(head) = self.heads.get(&entry.entity_id) {
            if head.entity_type != entry.entity_type {
                let reason = QuarantineReason::Malformed(format!(
                    "entity type '{}' does not match '{}'",
                    entry.entity_type, head.entity_type
                ));
                return Ok(self.quarantine_entry(rules, offset, entry, reason));
            }
        }

        let fields = match entry.fields() {
            Ok(fields) => fields,
            Err(e) => {
                let reason = QuarantineReason::Malformed(e.to_string());
                return Ok(self.quarantine_entry(rules, offset, entry, reason));
            }
        };

        let keys = ChainKeys {
            announced: &self.announced,
            external: rules.verifier,
        };
        if let Err(e) = rules.engine.validate(&entry, fields.as_ref(), &keys, &*self) {
            return Ok(self.quarantine_entry(rules, offset, entry, QuarantineReason::Rights(e)));
        }

        self.record_history(&entry, offset);
        let own = Arc::new(MaterializedObject::from_entry(&entry, fields, offset));

        let Some(head) = self.heads.get(&entry.entity_id).cloned() else {
            return Ok(self.promote(rules, own, changed));
        };

        if entry.previous_version_id == Some(head.version) {
            return Ok(self.promote(rules, own, changed));
        }

        if entry.previous_version_id == head.previous_version_id {
            return Ok(self.tie_break(rules, head, own, changed));
        }

        if own.deleted || head.deleted {
            return Ok(self.tie_break(rules, head, own, changed));
        }

        let base = entry
            .previous_version_id
            .and_then(|prev| self.snapshots.get(&prev))
            .filter(|base| base.id == entry.entity_id && !base.deleted)
            .map(|base| &base.fields);
        let ours = MergeSide {
            fields: &head.fields,
            timestamp: head.timestamp,
            entry_id: head.version,
        };
        let theirs = MergeSide {
            fields: &own.fields,
            timestamp: own.timestamp,
            entry_id: own.version,
        };

        let merged: Fields = match rules.strategy.merge(base, &ours, &theirs) {
            Ok(fields) => fields,
            Err(conflict) => {
                self.conflicted.insert(own.version);
                self.snapshots.insert(own.version, own);
                warn!(
                    partition = %rules.key,
                    offset,
                    entity = %entry.entity_id,
                    field = %conflict.field,
                    strategy = rules.strategy.name(),
                    "merge conflict left unresolved"
                );
                return Err(ChainError::MergeConflict {
                    entity: entry.entity_id,
                    entry: entry.entry_id,
                    field: conflict.field,
                });
            }
        };

        let rights = if theirs.beats(&ours) {
            own.rights.clone()
        } else {
            head.rights.clone()
        };
        let object = MaterializedObject {
            partition: head.partition.clone(),
            id: head.id,
            entity_type: head.entity_type.clone(),
            parent_id: head.parent_id,
            version: entry.entry_id,
            previous_version_id: entry.previous_version_id,
            offset,
            timestamp: head.timestamp.max(entry.timestamp),
            author: entry.author,
            rights,
            fields: merged,
            deleted: false,
        };
        debug!(
            partition = %rules.key,
            offset,
            entity = %entry.entity_id,
            strategy = rules.strategy.name(),
            "causal conflict merged"
        );
        Ok(self.promote(rules, Arc::new(object), changed))
    }

    /// Concurrent versions: highest `(timestamp, entry_id)` becomes head.
    fn tie_break(
        &mut self,
        rules: &Rules<'_>,
        head: Arc<MaterializedObject>,
        incoming: Arc<MaterializedObject>,
        changed: &mut Vec<Arc<MaterializedObject>>,
    ) -> Disposition {
        if incoming.precedence() > head.precedence() {
            return self.promote(rules, incoming, changed);
        }
        debug!(
            partition = %rules.key,
            entity = %incoming.id,
            loser = %incoming.version,
            winner = %head.version,
            "concurrent write superseded"
        );
        let entity = incoming.id;
        self.snapshots.insert(incoming.version, incoming);
        Disposition::Superseded {
            entity,
            winner: head.version,
        }
    }

    fn promote(
        &mut self,
        rules: &Rules<'_>,
        object: Arc<MaterializedObject>,
        changed: &mut Vec<Arc<MaterializedObject>>,
    ) -> Disposition {
        debug!(
            partition = %rules.key,
            offset = object.offset,
            entity = %object.id,
            version = %object.version,
            deleted = object.deleted,
            "head advanced"
        );
        self.snapshots.insert(object.version, Arc::clone(&object));
        self.heads.insert(object.id, Arc::clone(&object));
        changed.push(Arc::clone(&object));
        Disposition::Merged(object)
    }

    fn record_history(&mut self, entry: &Arc<LogEntry>, offset: u64) {
        self.entries
            .insert(entry.entry_id, (offset, Arc::clone(entry)));
        let history = self.history.entry(entry.entity_id).or_default();
        let at = history.partition_point(|m| m.offset < offset);
        history.insert(at, EntryMeta::of(entry, offset));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{NewEntry, PublicKeyRecord, RightsSet};
    use crate::merge::MergePolicy;
    use pes_crypto::{KeyDirectory, Signer, SigningKey};
    use pes_types::TemporalAnchor;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn key() -> PartitionKey {
        PartitionKey::new("accounts", 0)
    }

    fn chain_with(policy: MergePolicy, keys: &[&SigningKey]) -> PartitionChain {
        let dir = KeyDirectory::new();
        for k in keys {
            dir.register(k.verifying_key());
        }
        PartitionChain::new(
            key(),
            Arc::new(RightsEngine::permissive()),
            policy.strategy(),
            Arc::new(dir),
        )
    }

    fn at(ms: u64) -> TemporalAnchor {
        TemporalAnchor::new(ms, 0, 0)
    }

    fn create(sk: &SigningKey, entity: EntityId, ms: u64) -> LogEntry {
        NewEntry::new(key(), entity, "account", at(ms))
            .field("owner", json!("ada"))
            .field("balance", json!(0))
            .rights(RightsSet::new().with_write(sk.key_hash()))
            .sign(sk)
            .unwrap()
    }

    fn update(sk: &SigningKey, base: &LogEntry, ms: u64, fields: Fields) -> LogEntry {
        NewEntry::new(key(), base.entity_id, "account", at(ms))
            .previous(Some(base.entry_id))
            .fields(fields)
            .rights(base.rights.clone())
            .sign(sk)
            .unwrap()
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn append_materializes_latest_state() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let x = EntityId::new();

        let a = create(&sk, x, 1);
        let out = chain.append(0, LogRecord::Data(a.clone())).unwrap();
        assert!(matches!(out.disposition, Disposition::Merged(_)));

        let b = update(&sk, &a, 2, fields(&[("owner", json!("ada")), ("balance", json!(7))]));
        chain.append(1, LogRecord::Data(b.clone())).unwrap();

        let head = chain.get(&x).unwrap().unwrap();
        assert_eq!(head.version, b.entry_id);
        assert_eq!(head.field("balance"), Some(&json!(7)));
        assert_eq!(chain.get_raw(&x).unwrap().unwrap().entry_id, b.entry_id);
        assert_eq!(chain.last_offset().unwrap(), Some(1));
    }

    #[test]
    fn out_of_order_offsets_are_corruption() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        chain.append(5, LogRecord::Sync(SyncToken::new(0, 1))).unwrap();

        for offset in [5, 3] {
            let err = chain.append(offset, LogRecord::Sync(SyncToken::new(0, 2))).unwrap_err();
            assert!(matches!(err, ChainError::Corruption { offset: o, .. } if o == offset));
        }
        assert_eq!(chain.len().unwrap(), 1);
        assert!(chain.append(6, LogRecord::Sync(SyncToken::new(0, 3))).is_ok());
    }

    #[test]
    fn unauthorized_write_leaves_state_unchanged() {
        let k1 = SigningKey::generate();
        let k2 = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&k1, &k2]);
        let x = EntityId::new();

        let a = create(&k1, x, 1);
        chain.append(0, LogRecord::Data(a.clone())).unwrap();
        let before = chain.get(&x).unwrap().unwrap();

        let b = update(&k2, &a, 2, fields(&[("owner", json!("mallory"))]));
        let out = chain.append(1, LogRecord::Data(b)).unwrap();
        assert!(matches!(
            out.disposition,
            Disposition::Quarantined(QuarantineReason::Rights(RightsError::NotAuthorized { .. }))
        ));

        assert_eq!(chain.get(&x).unwrap().unwrap(), before);
        assert_eq!(chain.get_history(&x).unwrap().len(), 1);
        assert_eq!(chain.quarantine().unwrap().len(), 1);
    }

    #[test]
    fn parent_owner_updates_and_removes_child() {
        use crate::rights::{RightsRegistry, RightsRules, StaticAuthorities};

        let owner = SigningKey::generate();
        let stranger = SigningKey::generate();
        let dir = KeyDirectory::new();
        dir.register(owner.verifying_key());
        dir.register(stranger.verifying_key());
        let engine = RightsEngine::new(
            RightsRegistry::new().register("txn", RightsRules::child_of("account")),
            Arc::new(StaticAuthorities::new()),
        );
        let chain = PartitionChain::new(key(), Arc::new(engine), MergePolicy::default().strategy(), Arc::new(dir));

        let account = create(&owner, EntityId::new(), 1);
        chain.append(0, LogRecord::Data(account.clone())).unwrap();
        let txn = EntityId::new();
        let edit = |sk: &SigningKey, previous: &LogEntry, ms: u64, amount: i64| {
            NewEntry::new(key(), txn, "txn", at(ms))
                .parent(account.entity_id)
                .previous(Some(previous.entry_id))
                .field("amount", json!(amount))
                .sign(sk)
                .unwrap()
        };

        let c1 = NewEntry::new(key(), txn, "txn", at(2))
            .parent(account.entity_id)
            .field("amount", json!(1))
            .sign(&owner)
            .unwrap();
        let out = chain.append(1, LogRecord::Data(c1.clone())).unwrap();
        assert!(matches!(out.disposition, Disposition::Merged(_)));

        let c2 = edit(&owner, &c1, 3, 2);
        let out = chain.append(2, LogRecord::Data(c2.clone())).unwrap();
        assert!(matches!(out.disposition, Disposition::Merged(_)));
        assert_eq!(chain.get(&txn).unwrap().unwrap().field("amount"), Some(&json!(2)));

        let forged = edit(&stranger, &c2, 4, 99);
        let out = chain.append(3, LogRecord::Data(forged)).unwrap();
        assert!(matches!(
            out.disposition,
            Disposition::Quarantined(QuarantineReason::Rights(RightsError::NotAuthorized { .. }))
        ));
        assert_eq!(chain.get(&txn).unwrap().unwrap().field("amount"), Some(&json!(2)));

        let removal = NewEntry::new(key(), txn, "txn", at(5))
            .parent(account.entity_id)
            .previous(Some(c2.entry_id))
            .tombstone()
            .sign(&owner)
            .unwrap();
        chain.append(4, LogRecord::Data(removal.clone())).unwrap();
        assert!(chain.get(&txn).unwrap().is_none());
        assert!(chain.was_applied(&removal.entry_id).unwrap());
        assert!(chain.ever_existed(&txn).unwrap());
    }

    #[test]
    fn concurrent_writes_pick_same_winner_in_any_order() {
        let sk = SigningKey::generate();
        let x = EntityId::new();
        let a = create(&sk, x, 1);
        let early = update(&sk, &a, 5, fields(&[("balance", json!(1))]));
        let late = update(&sk, &a, 9, fields(&[("balance", json!(2))]));

        for order in [[&early, &late], [&late, &early]] {
            let chain = chain_with(MergePolicy::default(), &[&sk]);
            chain.append(0, LogRecord::Data(a.clone())).unwrap();
            chain.append(1, LogRecord::Data(order[0].clone())).unwrap();
            let out = chain.append(2, LogRecord::Data(order[1].clone())).unwrap();

            let head = chain.get(&x).unwrap().unwrap();
            assert_eq!(head.version, late.entry_id);
            assert_eq!(head.fields, fields(&[("balance", json!(2))]));
            assert_eq!(chain.get_history(&x).unwrap().len(), 3);
            if order[1].entry_id == early.entry_id {
                assert!(matches!(out.disposition, Disposition::Superseded { winner, .. } if winner == late.entry_id));
            }
        }
    }

    #[test]
    fn equal_timestamps_break_ties_on_entry_id() {
        let sk = SigningKey::generate();
        let x = EntityId::new();
        let a = create(&sk, x, 1);
        let low = NewEntry::new(key(), x, "account", at(5))
            .entry_id(EntryId::from_u128(1))
            .previous(Some(a.entry_id))
            .field("v", json!("low"))
            .rights(a.rights.clone())
            .sign(&sk)
            .unwrap();
        let high = NewEntry::new(key(), x, "account", at(5))
            .entry_id(EntryId::from_u128(2))
            .previous(Some(a.entry_id))
            .field("v", json!("high"))
            .rights(a.rights.clone())
            .sign(&sk)
            .unwrap();

        let chain = chain_with(MergePolicy::default(), &[&sk]);
        chain.append(0, LogRecord::Data(a)).unwrap();
        chain.append(1, LogRecord::Data(high)).unwrap();
        chain.append(2, LogRecord::Data(low)).unwrap();
        assert_eq!(chain.get(&x).unwrap().unwrap().field("v"), Some(&json!("high")));
    }

    #[test]
    fn causal_conflict_unions_disjoint_fields() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::FieldUnion, &[&sk]);
        let x = EntityId::new();

        let a = create(&sk, x, 1);
        let b = update(&sk, &a, 2, fields(&[("owner", json!("ada")), ("balance", json!(10))]));
        let c = update(&sk, &b, 3, fields(&[("owner", json!("ada")), ("balance", json!(20))]));
        // Written against `a` while `b` and `c` were in flight.
        let stale = update(&sk, &a, 4, fields(&[("owner", json!("grace")), ("balance", json!(0))]));

        for (offset, entry) in [a, b, c, stale.clone()].into_iter().enumerate() {
            chain.append(offset as u64, LogRecord::Data(entry)).unwrap();
        }

        let head = chain.get(&x).unwrap().unwrap();
        assert_eq!(head.version, stale.entry_id);
        assert_eq!(head.field("owner"), Some(&json!("grace")));
        assert_eq!(head.field("balance"), Some(&json!(20)));
    }

    #[test]
    fn fail_on_conflict_surfaces_error_and_keeps_head() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::FailOnConflict, &[&sk]);
        let x = EntityId::new();

        let a = create(&sk, x, 1);
        let b = update(&sk, &a, 2, fields(&[("owner", json!("ada")), ("balance", json!(10))]));
        let c = update(&sk, &b, 3, fields(&[("owner", json!("ada")), ("balance", json!(20))]));
        let stale = update(&sk, &a, 4, fields(&[("owner", json!("ada")), ("balance", json!(99))]));

        for (offset, entry) in [a, b, c.clone()].into_iter().enumerate() {
            chain.append(offset as u64, LogRecord::Data(entry)).unwrap();
        }
        let err = chain.append(3, LogRecord::Data(stale.clone())).unwrap_err();
        assert_eq!(
            err,
            ChainError::MergeConflict {
                entity: x,
                entry: stale.entry_id,
                field: "balance".into()
            }
        );
        assert_eq!(chain.get(&x).unwrap().unwrap().version, c.entry_id);
        assert_eq!(chain.last_offset().unwrap(), Some(3));
        assert!(!chain.was_applied(&stale.entry_id).unwrap());
        assert!(chain.was_applied(&c.entry_id).unwrap());
    }

    #[test]
    fn deletion_hides_entity_but_keeps_history() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let x = EntityId::new();

        let a = create(&sk, x, 1);
        let gone = NewEntry::new(key(), x, "account", at(2))
            .previous(Some(a.entry_id))
            .tombstone()
            .rights(a.rights.clone())
            .sign(&sk)
            .unwrap();
        chain.append(0, LogRecord::Data(a)).unwrap();
        chain.append(1, LogRecord::Data(gone)).unwrap();

        assert!(chain.get(&x).unwrap().is_none());
        assert!(chain.ever_existed(&x).unwrap());
        assert!(!chain.ever_existed(&EntityId::new()).unwrap());

        let history = chain.get_history(&x).unwrap();
        let tombstones: Vec<bool> = history.iter().map(|m| m.tombstone).collect();
        assert_eq!(tombstones, vec![false, true]);
        // Restartable: a second pass sees the same rows.
        assert_eq!(history.iter().count(), 2);
        assert_eq!((&history).into_iter().count(), 2);
    }

    #[test]
    fn get_version_replays_prefix() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let x = EntityId::new();

        let a = create(&sk, x, 1);
        let b = update(&sk, &a, 2, fields(&[("balance", json!(5))]));
        chain.append(10, LogRecord::Data(a.clone())).unwrap();
        chain.append(20, LogRecord::Data(b.clone())).unwrap();

        assert!(chain.get_version(&x, 9).unwrap().is_none());
        assert_eq!(chain.get_version(&x, 10).unwrap().unwrap().version, a.entry_id);
        assert_eq!(chain.get_version(&x, 19).unwrap().unwrap().version, a.entry_id);
        assert_eq!(chain.get_version(&x, 20).unwrap().unwrap().version, b.entry_id);
    }

    #[test]
    fn announced_key_releases_quarantined_entries() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[]);
        let x = EntityId::new();
        let a = create(&sk, x, 1);
        let b = update(&sk, &a, 2, fields(&[("balance", json!(3))]));

        chain.append(0, LogRecord::Data(a)).unwrap();
        chain.append(1, LogRecord::Data(b.clone())).unwrap();
        assert!(chain.get(&x).unwrap().is_none());
        assert_eq!(chain.quarantine().unwrap().len(), 2);

        let out = chain
            .append(2, LogRecord::PublicKey(PublicKeyRecord::new(&sk.verifying_key())))
            .unwrap();
        assert!(matches!(out.disposition, Disposition::KeyAnnounced { retried: 2, .. }));
        assert!(chain.announced_key(&sk.key_hash()).unwrap().is_some());
        assert_eq!(chain.get(&x).unwrap().unwrap().version, b.entry_id);
        assert!(chain.quarantine().unwrap().is_empty());
        assert_eq!(chain.replay().unwrap(), chain.snapshot().unwrap());
    }

    #[test]
    fn external_key_discovery_retries_on_request() {
        let sk = SigningKey::generate();
        let dir = Arc::new(KeyDirectory::new());
        let chain = PartitionChain::new(
            key(),
            Arc::new(RightsEngine::permissive()),
            MergePolicy::default().strategy(),
            dir.clone(),
        );
        let x = EntityId::new();
        chain.append(0, LogRecord::Data(create(&sk, x, 1))).unwrap();
        assert!(chain.get(&x).unwrap().is_none());

        let (hash, _) = dir.register(sk.verifying_key());
        assert_eq!(chain.retry_quarantined(&hash).unwrap(), 1);
        assert!(chain.get(&x).unwrap().is_some());
    }

    #[test]
    fn malformed_bytes_are_quarantined_not_fatal() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let out = chain.append_bytes(0, b"not a record").unwrap();
        assert!(matches!(out.disposition, Disposition::Quarantined(QuarantineReason::Malformed(_))));

        let x = EntityId::new();
        let bytes = RecordCodec::encode(&LogRecord::Data(create(&sk, x, 1))).unwrap();
        chain.append_bytes(1, &bytes).unwrap();
        assert!(chain.get(&x).unwrap().is_some());
    }

    #[test]
    fn foreign_partition_entries_are_quarantined() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let stray = NewEntry::new(PartitionKey::new("accounts", 1), EntityId::new(), "account", at(1))
            .rights(RightsSet::new().with_write(sk.key_hash()))
            .sign(&sk)
            .unwrap();
        let out = chain.append(0, LogRecord::Data(stray)).unwrap();
        assert!(matches!(out.disposition, Disposition::Quarantined(QuarantineReason::Malformed(_))));
    }

    #[test]
    fn duplicate_entries_apply_once() {
        let sk = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&sk]);
        let a = create(&sk, EntityId::new(), 1);
        chain.append(0, LogRecord::Data(a.clone())).unwrap();
        let out = chain.append(1, LogRecord::Data(a.clone())).unwrap();
        assert!(matches!(out.disposition, Disposition::Duplicate(id) if id == a.entry_id));
        assert_eq!(chain.get_history(&a.entity_id).unwrap().len(), 1);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<EntryId>>);

    impl MergeListener for Recorder {
        fn on_merged(&self, object: &Arc<MaterializedObject>) {
            self.0.lock().unwrap().push(object.version);
        }
    }

    #[test]
    fn listeners_see_new_heads_only() {
        let k1 = SigningKey::generate();
        let k2 = SigningKey::generate();
        let chain = chain_with(MergePolicy::default(), &[&k1, &k2]);
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn MergeListener> = recorder.clone();
        chain.add_listener(listener.clone()).unwrap();

        let x = EntityId::new();
        let a = create(&k1, x, 1);
        chain.append(0, LogRecord::Data(a.clone())).unwrap();
        chain
            .append(1, LogRecord::Data(update(&k2, &a, 2, Fields::new())))
            .unwrap();
        chain.append(2, LogRecord::Sync(SyncToken::new(1, 1))).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![a.entry_id]);

        assert!(chain.remove_listener(&listener).unwrap());
        assert!(!chain.remove_listener(&listener).unwrap());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Create { entity: usize, signer: usize, ms: u64 },
        Update { entity: usize, signer: usize, ms: u64, balance: i64, stale: bool },
        Delete { entity: usize, signer: usize, ms: u64 },
        Garbage,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, 0..2usize, 0..20u64).prop_map(|(entity, signer, ms)| Op::Create { entity, signer, ms }),
            (0..3usize, 0..2usize, 0..20u64, -5..5i64, any::<bool>()).prop_map(
                |(entity, signer, ms, balance, stale)| Op::Update { entity, signer, ms, balance, stale }
            ),
            (0..3usize, 0..2usize, 0..20u64).prop_map(|(entity, signer, ms)| Op::Delete { entity, signer, ms }),
            Just(Op::Garbage),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn replay_matches_incremental_state(ops in prop::collection::vec(arb_op(), 1..24)) {
            let signers = [SigningKey::from_bytes([7; 32]), SigningKey::from_bytes([9; 32])];
            let entities = [EntityId::from_u128(1), EntityId::from_u128(2), EntityId::from_u128(3)];
            let chain = chain_with(MergePolicy::default(), &[&signers[0], &signers[1]]);
            let mut seen: Vec<Vec<EntryId>> = vec![Vec::new(); entities.len()];

            for (offset, op) in ops.into_iter().enumerate() {
                let offset = offset as u64;
                let record = match op {
                    Op::Garbage => {
                        chain.append_bytes(offset, b"garbage").unwrap();
                        continue;
                    }
                    Op::Create { entity, signer, ms } => {
                        let sk = &signers[signer];
                        NewEntry::new(key(), entities[entity], "account", at(ms))
                            .field("balance", json!(0))
                            .rights(RightsSet::new().with_write(sk.key_hash()))
                            .sign(sk)
                            .unwrap()
                    }
                    Op::Update { entity, signer, ms, balance, stale } => {
                        let prev = if stale { seen[entity].first() } else { seen[entity].last() };
                        let rights = RightsSet::new().with_write(signers[signer].key_hash());
                        NewEntry::new(key(), entities[entity], "account", at(ms))
                            .previous(prev.copied())
                            .field("balance", json!(balance))
                            .rights(rights)
                            .sign(&signers[signer])
                            .unwrap()
                    }
                    Op::Delete { entity, signer, ms } => {
                        let rights = RightsSet::new().with_write(signers[signer].key_hash());
                        NewEntry::new(key(), entities[entity], "account", at(ms))
                            .previous(seen[entity].last().copied())
                            .tombstone()
                            .rights(rights)
                            .sign(&signers[signer])
                            .unwrap()
                    }
                };
                let index = entities.iter().position(|e| *e == record.entity_id).unwrap();
                seen[index].push(record.entry_id);
                chain.append(offset, LogRecord::Data(record)).unwrap();
            }

            prop_assert_eq!(chain.replay().unwrap(), chain.snapshot().unwrap());
        }
    }
}
