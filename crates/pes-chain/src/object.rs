use pes_types::{EntityId, EntryId, KeyHash, PartitionKey, TemporalAnchor};

use crate::entry::{Fields, LogEntry, RightsSet};

/// Decoded, rights-checked projection of an entity at one version.
///
/// Snapshots are immutable: a merge publishes a new `Arc<MaterializedObject>`
/// rather than editing the previous one, so readers never observe a
/// half-applied entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedObject {
    pub partition: PartitionKey,
    pub id: EntityId,
    pub entity_type: String,
    pub parent_id: Option<EntityId>,
    /// Entry that produced this version.
    pub version: EntryId,
    /// `previous_version_id` of that entry; used to spot concurrent siblings.
    pub previous_version_id: Option<EntryId>,
    pub offset: u64,
    pub timestamp: TemporalAnchor,
    pub author: KeyHash,
    pub rights: RightsSet,
    pub fields: Fields,
    pub deleted: bool,
}

impl MaterializedObject {
    pub(crate) fn from_entry(entry: &LogEntry, fields: Option<Fields>, offset: u64) -> Self {
        Self {
            partition: entry.partition.clone(),
            id: entry.entity_id,
            entity_type: entry.entity_type.clone(),
            parent_id: entry.parent_id,
            version: entry.entry_id,
            previous_version_id: entry.previous_version_id,
            offset,
            timestamp: entry.timestamp,
            author: entry.author,
            rights: entry.rights.clone(),
            deleted: fields.is_none(),
            fields: fields.unwrap_or_default(),
        }
    }

    pub fn precedence(&self) -> (TemporalAnchor, EntryId) {
        (self.timestamp, self.version)
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}
