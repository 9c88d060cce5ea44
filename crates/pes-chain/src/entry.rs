use std::collections::{BTreeMap, BTreeSet};

use pes_crypto::{ContentHasher, Keychain, Signature, Signer, VerifyingKey};
use pes_types::{EntityId, EntryId, KeyHash, PartitionKey, SyncToken, TemporalAnchor};
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// Decoded entity payload: a JSON object keyed by field name.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Keys authorized to read and write one entity.
///
/// An empty `read_keys` set means the entity is readable by any caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightsSet {
    pub read_keys: BTreeSet<KeyHash>,
    pub write_keys: BTreeSet<KeyHash>,
}

impl RightsSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read(mut self, key: KeyHash) -> Self {
        self.read_keys.insert(key);
        self
    }

    pub fn with_write(mut self, key: KeyHash) -> Self {
        self.write_keys.insert(key);
        self
    }

    pub fn permits_write(&self, author: &KeyHash) -> bool {
        self.write_keys.contains(author)
    }

    /// `true` if the keychain holds a private key listed in `read_keys`.
    pub fn permits_read(&self, keychain: &Keychain) -> bool {
        self.read_keys.is_empty() || keychain.holds_any(&self.read_keys)
    }
}

/// An immutable, signed record describing one version of one entity.
///
/// Never mutated after it is durably written. Ordering is assigned by the
/// backend (partition offset), not carried in the entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub partition: PartitionKey,
    pub entity_id: EntityId,
    pub entity_type: String,
    pub parent_id: Option<EntityId>,
    pub previous_version_id: Option<EntryId>,
    pub timestamp: TemporalAnchor,
    /// JSON-encoded [`Fields`]; `None` marks a deletion.
    pub payload: Option<Vec<u8>>,
    pub rights: RightsSet,
    pub author: KeyHash,
    pub signature: Signature,
}

/// The subset of entry fields covered by the signature.
#[derive(Serialize)]
struct SignedView<'a> {
    entry_id: &'a EntryId,
    partition: &'a PartitionKey,
    entity_id: &'a EntityId,
    entity_type: &'a str,
    parent_id: &'a Option<EntityId>,
    previous_version_id: &'a Option<EntryId>,
    timestamp: &'a TemporalAnchor,
    payload: &'a Option<Vec<u8>>,
    rights: &'a RightsSet,
    author: &'a KeyHash,
}

impl LogEntry {
    /// Digest the author signed.
    pub fn signing_digest(&self) -> ChainResult<[u8; 32]> {
        signing_digest(&SignedView {
            entry_id: &self.entry_id,
            partition: &self.partition,
            entity_id: &self.entity_id,
            entity_type: &self.entity_type,
            parent_id: &self.parent_id,
            previous_version_id: &self.previous_version_id,
            timestamp: &self.timestamp,
            payload: &self.payload,
            rights: &self.rights,
            author: &self.author,
        })
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// Decode the payload. Tombstones decode to `None`.
    pub fn fields(&self) -> ChainResult<Option<Fields>> {
        self.payload
            .as_deref()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| ChainError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// Tie-break ordering between concurrent writes: timestamp, then entry id.
    pub fn precedence(&self) -> (TemporalAnchor, EntryId) {
        (self.timestamp, self.entry_id)
    }
}

fn signing_digest(view: &SignedView<'_>) -> ChainResult<[u8; 32]> {
    ContentHasher::ENTRY
        .hash_canonical(view)
        .map_err(|e| ChainError::Serialization(e.to_string()))
}

/// An entry under construction, before it is signed.
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub entry_id: EntryId,
    pub partition: PartitionKey,
    pub entity_id: EntityId,
    pub entity_type: String,
    pub parent_id: Option<EntityId>,
    pub previous_version_id: Option<EntryId>,
    pub timestamp: TemporalAnchor,
    pub fields: Option<Fields>,
    pub rights: RightsSet,
}

impl NewEntry {
    pub fn new(
        partition: PartitionKey,
        entity_id: EntityId,
        entity_type: impl Into<String>,
        timestamp: TemporalAnchor,
    ) -> Self {
        Self {
            entry_id: EntryId::new(),
            partition,
            entity_id,
            entity_type: entity_type.into(),
            parent_id: None,
            previous_version_id: None,
            timestamp,
            fields: Some(Fields::new()),
            rights: RightsSet::new(),
        }
    }

    pub fn entry_id(mut self, id: EntryId) -> Self {
        self.entry_id = id;
        self
    }

    pub fn parent(mut self, parent: EntityId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn previous(mut self, previous: Option<EntryId>) -> Self {
        self.previous_version_id = previous;
        self
    }

    pub fn fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields
            .get_or_insert_with(Fields::new)
            .insert(name.into(), value);
        self
    }

    pub fn tombstone(mut self) -> Self {
        self.fields = None;
        self
    }

    pub fn rights(mut self, rights: RightsSet) -> Self {
        self.rights = rights;
        self
    }

    /// Encode the payload and sign the entry.
    pub fn sign(self, signer: &dyn Signer) -> ChainResult<LogEntry> {
        let payload = self
            .fields
            .as_ref()
            .map(|f| serde_json::to_vec(f).map_err(|e| ChainError::Serialization(e.to_string())))
            .transpose()?;
        let author = signer.key_hash();

        let digest = signing_digest(&SignedView {
            entry_id: &self.entry_id,
            partition: &self.partition,
            entity_id: &self.entity_id,
            entity_type: &self.entity_type,
            parent_id: &self.parent_id,
            previous_version_id: &self.previous_version_id,
            timestamp: &self.timestamp,
            payload: &payload,
            rights: &self.rights,
            author: &author,
        })?;

        Ok(LogEntry {
            entry_id: self.entry_id,
            partition: self.partition,
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            parent_id: self.parent_id,
            previous_version_id: self.previous_version_id,
            timestamp: self.timestamp,
            payload,
            rights: self.rights,
            author,
            signature: signer.sign(&digest),
        })
    }
}

/// Announces a public key so entries signed by it can be verified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub key: [u8; 32],
}

impl PublicKeyRecord {
    pub fn new(key: &VerifyingKey) -> Self {
        Self { key: key.as_bytes() }
    }
}

/// Everything that can appear on a partition log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Data(LogEntry),
    /// Write-visibility marker; see `pes-sync`.
    Sync(SyncToken),
    PublicKey(PublicKeyRecord),
}

/// History row for one entry of one entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub entry_id: EntryId,
    pub offset: u64,
    pub previous_version_id: Option<EntryId>,
    pub timestamp: TemporalAnchor,
    pub author: KeyHash,
    pub tombstone: bool,
}

impl EntryMeta {
    pub(crate) fn of(entry: &LogEntry, offset: u64) -> Self {
        Self {
            entry_id: entry.entry_id,
            offset,
            previous_version_id: entry.previous_version_id,
            timestamp: entry.timestamp,
            author: entry.author,
            tombstone: entry.is_tombstone(),
        }
    }
}
