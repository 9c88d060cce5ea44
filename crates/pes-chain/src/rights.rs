use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use pes_crypto::{Keychain, Signer, Verifier};
use pes_types::{EntityId, KeyHash};
use tracing::debug;

use crate::entry::{Fields, LogEntry};
use crate::error::RightsError;
use crate::object::MaterializedObject;

/// Read access to the current heads of a chain, including deleted ones.
pub trait EntityView {
    fn head(&self, id: &EntityId) -> Option<&MaterializedObject>;
}

/// Maps a named field value (e.g. a domain string) to the keys that hold
/// implicit authority over entities carrying that value.
pub trait AuthorityDirectory: Send + Sync {
    fn authorities(&self, field: &str, value: &str) -> BTreeSet<KeyHash>;
}

/// Fixed authority table declared at start-up.
#[derive(Debug, Default)]
pub struct StaticAuthorities {
    table: HashMap<(String, String), BTreeSet<KeyHash>>,
}

impl StaticAuthorities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, field: impl Into<String>, value: impl Into<String>, key: KeyHash) -> Self {
        self.table
            .entry((field.into(), value.into()))
            .or_default()
            .insert(key);
        self
    }
}

impl AuthorityDirectory for StaticAuthorities {
    fn authorities(&self, field: &str, value: &str) -> BTreeSet<KeyHash> {
        self.table
            .get(&(field.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// How new entities of one type may be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RightsRules {
    /// Entity types allowed as parents. Empty means any parent type.
    pub parent_types: BTreeSet<String>,
    /// A parent is mandatory for creation.
    pub require_parent: bool,
    /// Named field whose value grants creation rights via an [`AuthorityDirectory`].
    pub implicit_authority: Option<String>,
    /// Parentless creation is allowed when the author lists itself in the
    /// new entity's write keys.
    pub permit_free_root: bool,
}

impl Default for RightsRules {
    fn default() -> Self {
        Self {
            parent_types: BTreeSet::new(),
            require_parent: false,
            implicit_authority: None,
            permit_free_root: true,
        }
    }
}

impl RightsRules {
    /// Rules for a type that only exists underneath a parent of `parent_type`.
    pub fn child_of(parent_type: impl Into<String>) -> Self {
        Self {
            parent_types: BTreeSet::from([parent_type.into()]),
            require_parent: true,
            implicit_authority: None,
            permit_free_root: false,
        }
    }

    /// Rules for a root type whose creators are vouched for by `field`.
    pub fn implicit_authority(field: impl Into<String>) -> Self {
        Self {
            implicit_authority: Some(field.into()),
            permit_free_root: false,
            ..Self::default()
        }
    }
}

/// Registration table of per-type creation rules.
#[derive(Clone, Debug, Default)]
pub struct RightsRegistry {
    rules: HashMap<String, RightsRules>,
    fallback: RightsRules,
}

impl RightsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entity_type: impl Into<String>, rules: RightsRules) -> Self {
        self.rules.insert(entity_type.into(), rules);
        self
    }

    /// Rules applied to types that were never registered.
    pub fn fallback(mut self, rules: RightsRules) -> Self {
        self.fallback = rules;
        self
    }

    pub fn rules_for(&self, entity_type: &str) -> &RightsRules {
        self.rules.get(entity_type).unwrap_or(&self.fallback)
    }
}

/// Gatekeeper for incoming entries.
pub struct RightsEngine {
    registry: RightsRegistry,
    authorities: Arc<dyn AuthorityDirectory>,
}

impl RightsEngine {
    pub fn new(registry: RightsRegistry, authorities: Arc<dyn AuthorityDirectory>) -> Self {
        Self {
            registry,
            authorities,
        }
    }

    pub fn permissive() -> Self {
        Self::new(RightsRegistry::default(), Arc::new(StaticAuthorities::new()))
    }

    pub fn registry(&self) -> &RightsRegistry {
        &self.registry
    }

    /// Check signature and write authority of `entry` against `view`.
    pub fn validate(
        &self,
        entry: &LogEntry,
        fields: Option<&Fields>,
        keys: &dyn Verifier,
        view: &dyn EntityView,
    ) -> Result<(), RightsError> {
        self.verify_signature(entry, keys)?;

        if let Some(existing) = view.head(&entry.entity_id) {
            if existing.rights.permits_write(&entry.author) {
                return Ok(());
            }
            if self.inherited_write_keys(existing, view).contains(&entry.author) {
                debug!(entity = %entry.entity_id, "write inherited from ancestor");
                return Ok(());
            }
            return Err(RightsError::NotAuthorized {
                author: entry.author,
                entity: entry.entity_id,
            });
        }

        self.validate_creation(entry, fields, view)
    }

    fn verify_signature(&self, entry: &LogEntry, keys: &dyn Verifier) -> Result<(), RightsError> {
        let key = keys
            .public_key_for_hash(&entry.author)
            .ok_or(RightsError::UnknownKey(entry.author))?;
        let digest = entry
            .signing_digest()
            .map_err(|_| RightsError::BadSignature {
                author: entry.author,
            })?;
        key.verify(&digest, &entry.signature)
            .map_err(|_| RightsError::BadSignature {
                author: entry.author,
            })
    }

    fn validate_creation(
        &self,
        entry: &LogEntry,
        fields: Option<&Fields>,
        view: &dyn EntityView,
    ) -> Result<(), RightsError> {
        let rules = self.registry.rules_for(&entry.entity_type);
        let denied = || RightsError::NotAuthorized {
            author: entry.author,
            entity: entry.entity_id,
        };

        if let Some(parent_id) = entry.parent_id {
            let parent = view
                .head(&parent_id)
                .ok_or(RightsError::MissingParent { parent: parent_id })?;
            if !rules.parent_types.is_empty() && !rules.parent_types.contains(&parent.entity_type) {
                return Err(RightsError::ParentTypeNotAllowed {
                    parent_type: parent.entity_type.clone(),
                    child_type: entry.entity_type.clone(),
                });
            }
            if parent.rights.permits_write(&entry.author)
                || self.inherited_write_keys(parent, view).contains(&entry.author)
            {
                debug!(entity = %entry.entity_id, parent = %parent_id, "write inherited from parent");
                return Ok(());
            }
            return Err(denied());
        }

        if rules.require_parent {
            return Err(denied());
        }

        if let Some(field) = &rules.implicit_authority {
            let value = fields
                .and_then(|f| f.get(field))
                .and_then(|v| v.as_str());
            if let Some(value) = value {
                if self.authorities.authorities(field, value).contains(&entry.author) {
                    return Ok(());
                }
            }
        }

        if rules.permit_free_root && entry.rights.permits_write(&entry.author) {
            return Ok(());
        }

        Err(denied())
    }

    /// Write keys `object` inherits from its ancestors.
    ///
    /// Each step up is taken only while the child's type accepts the
    /// parent's type. The walk stops at a missing parent or a cycle.
    pub fn inherited_write_keys(&self, object: &MaterializedObject, view: &dyn EntityView) -> BTreeSet<KeyHash> {
        let mut keys = BTreeSet::new();
        let mut seen = HashSet::from([object.id]);
        let mut child = object;
        while let Some(parent_id) = child.parent_id {
            if !seen.insert(parent_id) {
                break;
            }
            let Some(parent) = view.head(&parent_id) else {
                break;
            };
            let accepted = &self.registry.rules_for(&child.entity_type).parent_types;
            if !accepted.is_empty() && !accepted.contains(&parent.entity_type) {
                break;
            }
            keys.extend(parent.rights.write_keys.iter().copied());
            child = parent;
        }
        keys
    }

    /// Whether the holder of `keychain` may read `object`.
    pub fn can_read(&self, object: &MaterializedObject, keychain: &Keychain) -> bool {
        object.rights.permits_read(keychain)
    }

    /// Which held key, if any, could write `intent` right now. Mirrors
    /// [`Self::validate`] without producing a signature.
    pub fn write_key_for(
        &self,
        intent: &WriteIntent<'_>,
        keychain: &Keychain,
        view: &dyn EntityView,
    ) -> Option<KeyHash> {
        if let Some(existing) = view.head(intent.entity_id) {
            let mut allowed = existing.rights.write_keys.clone();
            allowed.extend(self.inherited_write_keys(existing, view));
            return keychain.signer_for(&allowed).map(|k| k.key_hash());
        }

        let rules = self.registry.rules_for(intent.entity_type);
        if let Some(parent_id) = intent.parent_id {
            let parent = view.head(parent_id)?;
            if !rules.parent_types.is_empty() && !rules.parent_types.contains(&parent.entity_type) {
                return None;
            }
            let mut allowed = parent.rights.write_keys.clone();
            allowed.extend(self.inherited_write_keys(parent, view));
            return keychain.signer_for(&allowed).map(|k| k.key_hash());
        }
        if rules.require_parent {
            return None;
        }

        if let Some(field) = &rules.implicit_authority {
            let value = intent
                .fields
                .and_then(|f| f.get(field))
                .and_then(|v| v.as_str());
            if let Some(value) = value {
                let authorities = self.authorities.authorities(field, value);
                if let Some(key) = keychain.signer_for(&authorities) {
                    return Some(key.key_hash());
                }
            }
        }

        if rules.permit_free_root {
            return keychain
                .signer_for(intent.declared_write_keys)
                .map(|k| k.key_hash());
        }
        None
    }
}

/// A write a caller is about to sign, used to pick the signing key.
#[derive(Clone, Copy, Debug)]
pub struct WriteIntent<'a> {
    pub entity_id: &'a EntityId,
    pub entity_type: &'a str,
    pub parent_id: Option<&'a EntityId>,
    pub declared_write_keys: &'a BTreeSet<KeyHash>,
    pub fields: Option<&'a Fields>,
}

impl std::fmt::Debug for RightsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RightsEngine")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{NewEntry, RightsSet};
    use pes_crypto::{KeyDirectory, SigningKey};
    use pes_types::{PartitionKey, TemporalAnchor};
    use serde_json::json;

    #[derive(Default)]
    struct Heads(HashMap<EntityId, MaterializedObject>);

    impl EntityView for Heads {
        fn head(&self, id: &EntityId) -> Option<&MaterializedObject> {
            self.0.get(id)
        }
    }

    fn partition() -> PartitionKey {
        PartitionKey::new("rights", 0)
    }

    fn directory(keys: &[&SigningKey]) -> KeyDirectory {
        let dir = KeyDirectory::new();
        for key in keys {
            dir.register(key.verifying_key());
        }
        dir
    }

    fn root(sk: &SigningKey, entity: EntityId, ty: &str) -> LogEntry {
        NewEntry::new(partition(), entity, ty, TemporalAnchor::new(1, 0, 0))
            .field("name", json!("root"))
            .rights(RightsSet::new().with_write(sk.key_hash()))
            .sign(sk)
            .unwrap()
    }

    fn check(engine: &RightsEngine, entry: &LogEntry, dir: &KeyDirectory, heads: &Heads) -> Result<(), RightsError> {
        let fields = entry.fields().unwrap();
        engine.validate(entry, fields.as_ref(), dir, heads)
    }

    #[test]
    fn unknown_author_is_reported_for_retry() {
        let sk = SigningKey::generate();
        let engine = RightsEngine::permissive();
        let entry = root(&sk, EntityId::new(), "doc");

        let err = check(&engine, &entry, &KeyDirectory::new(), &Heads::default()).unwrap_err();
        assert_eq!(err, RightsError::UnknownKey(sk.key_hash()));
        assert_eq!(err.retry_key(), Some(sk.key_hash()));
    }

    #[test]
    fn free_root_requires_self_listed_write_key() {
        let sk = SigningKey::generate();
        let dir = directory(&[&sk]);
        let engine = RightsEngine::permissive();

        assert!(check(&engine, &root(&sk, EntityId::new(), "doc"), &dir, &Heads::default()).is_ok());

        let unlisted = NewEntry::new(partition(), EntityId::new(), "doc", TemporalAnchor::zero())
            .sign(&sk)
            .unwrap();
        assert!(matches!(
            check(&engine, &unlisted, &dir, &Heads::default()),
            Err(RightsError::NotAuthorized { .. })
        ));
    }

    #[test]
    fn existing_entity_requires_listed_write_key() {
        let k1 = SigningKey::generate();
        let k2 = SigningKey::generate();
        let dir = directory(&[&k1, &k2]);
        let engine = RightsEngine::permissive();

        let entity = EntityId::new();
        let create = root(&k1, entity, "doc");
        let mut heads = Heads::default();
        heads.0.insert(
            entity,
            MaterializedObject::from_entry(&create, create.fields().unwrap(), 0),
        );

        let update = NewEntry::new(partition(), entity, "doc", TemporalAnchor::new(2, 0, 0))
            .previous(Some(create.entry_id))
            .rights(RightsSet::new().with_write(k2.key_hash()))
            .sign(&k2)
            .unwrap();
        assert_eq!(
            check(&engine, &update, &dir, &heads),
            Err(RightsError::NotAuthorized {
                author: k2.key_hash(),
                entity
            })
        );
    }

    #[test]
    fn child_inherits_parent_write_keys() {
        let owner = SigningKey::generate();
        let stranger = SigningKey::generate();
        let dir = directory(&[&owner, &stranger]);
        let engine = RightsEngine::new(
            RightsRegistry::new().register("txn", RightsRules::child_of("account")),
            Arc::new(StaticAuthorities::new()),
        );

        let account = EntityId::new();
        let create = root(&owner, account, "account");
        let mut heads = Heads::default();
        heads.0.insert(account, MaterializedObject::from_entry(&create, create.fields().unwrap(), 0));

        let child = |sk: &SigningKey| {
            NewEntry::new(partition(), EntityId::new(), "txn", TemporalAnchor::zero())
                .parent(account)
                .sign(sk)
                .unwrap()
        };
        assert!(check(&engine, &child(&owner), &dir, &heads).is_ok());
        assert!(check(&engine, &child(&stranger), &dir, &heads).is_err());

        let orphan = NewEntry::new(partition(), EntityId::new(), "txn", TemporalAnchor::zero())
            .rights(RightsSet::new().with_write(owner.key_hash()))
            .sign(&owner)
            .unwrap();
        assert!(check(&engine, &orphan, &dir, &heads).is_err());
    }

    #[test]
    fn parent_owner_keeps_write_access_to_existing_children() {
        let owner = SigningKey::generate();
        let stranger = SigningKey::generate();
        let dir = directory(&[&owner, &stranger]);
        let engine = RightsEngine::new(
            RightsRegistry::new()
                .register("txn", RightsRules::child_of("account"))
                .register("line", RightsRules::child_of("txn")),
            Arc::new(StaticAuthorities::new()),
        );

        let account = EntityId::new();
        let create = root(&owner, account, "account");
        let txn = NewEntry::new(partition(), EntityId::new(), "txn", TemporalAnchor::new(2, 0, 0))
            .parent(account)
            .field("amount", json!(1))
            .sign(&owner)
            .unwrap();
        let mut heads = Heads::default();
        for (offset, entry) in [&create, &txn].into_iter().enumerate() {
            heads.0.insert(
                entry.entity_id,
                MaterializedObject::from_entry(entry, entry.fields().unwrap(), offset as u64),
            );
        }

        let edit = |sk: &SigningKey| {
            NewEntry::new(partition(), txn.entity_id, "txn", TemporalAnchor::new(3, 0, 0))
                .parent(account)
                .previous(Some(txn.entry_id))
                .field("amount", json!(2))
                .sign(sk)
                .unwrap()
        };
        assert!(check(&engine, &edit(&owner), &dir, &heads).is_ok());
        assert!(matches!(
            check(&engine, &edit(&stranger), &dir, &heads),
            Err(RightsError::NotAuthorized { .. })
        ));

        let removal = NewEntry::new(partition(), txn.entity_id, "txn", TemporalAnchor::new(3, 0, 0))
            .parent(account)
            .previous(Some(txn.entry_id))
            .tombstone()
            .sign(&owner)
            .unwrap();
        assert!(check(&engine, &removal, &dir, &heads).is_ok());

        // Grandchildren reach the account's keys through the txn.
        let line = NewEntry::new(partition(), EntityId::new(), "line", TemporalAnchor::new(4, 0, 0))
            .parent(txn.entity_id)
            .sign(&owner)
            .unwrap();
        assert!(check(&engine, &line, &dir, &heads).is_ok());

        let keychain = Keychain::new().with_key(owner.clone());
        let no_keys = BTreeSet::new();
        let intent = WriteIntent {
            entity_id: &txn.entity_id,
            entity_type: "txn",
            parent_id: Some(&account),
            declared_write_keys: &no_keys,
            fields: None,
        };
        assert_eq!(engine.write_key_for(&intent, &keychain, &heads), Some(owner.key_hash()));
        let outsider = Keychain::new().with_key(stranger.clone());
        assert_eq!(engine.write_key_for(&intent, &outsider, &heads), None);
    }

    #[test]
    fn inheritance_stops_at_parent_types_the_child_rejects() {
        let owner = SigningKey::generate();
        let engine = RightsEngine::new(
            RightsRegistry::new().register("txn", RightsRules::child_of("account")),
            Arc::new(StaticAuthorities::new()),
        );
        let folder = EntityId::new();
        let create = root(&owner, folder, "folder");
        let stray = NewEntry::new(partition(), EntityId::new(), "txn", TemporalAnchor::new(2, 0, 0))
            .parent(folder)
            .sign(&owner)
            .unwrap();
        let mut heads = Heads::default();
        heads.0.insert(folder, MaterializedObject::from_entry(&create, create.fields().unwrap(), 0));
        let stray = MaterializedObject::from_entry(&stray, stray.fields().unwrap(), 1);

        assert!(engine.inherited_write_keys(&stray, &heads).is_empty());
    }

    #[test]
    fn implicit_authority_vouches_for_domain() {
        let authority = SigningKey::generate();
        let other = SigningKey::generate();
        let dir = directory(&[&authority, &other]);
        let engine = RightsEngine::new(
            RightsRegistry::new().register("company", RightsRules::implicit_authority("domain")),
            Arc::new(StaticAuthorities::new().grant("domain", "example.org", authority.key_hash())),
        );

        let company = |sk: &SigningKey, domain: &str| {
            NewEntry::new(partition(), EntityId::new(), "company", TemporalAnchor::zero())
                .field("domain", json!(domain))
                .rights(RightsSet::new().with_write(sk.key_hash()))
                .sign(sk)
                .unwrap()
        };
        assert!(check(&engine, &company(&authority, "example.org"), &dir, &Heads::default()).is_ok());
        assert!(check(&engine, &company(&other, "example.org"), &dir, &Heads::default()).is_err());
        assert!(check(&engine, &company(&authority, "other.org"), &dir, &Heads::default()).is_err());
    }

    #[test]
    fn write_key_for_picks_held_key() {
        let k1 = SigningKey::generate();
        let engine = RightsEngine::permissive();
        let keychain = Keychain::new().with_key(k1.clone());
        let entity = EntityId::new();
        let declared = BTreeSet::from([k1.key_hash()]);

        let intent = WriteIntent {
            entity_id: &entity,
            entity_type: "doc",
            parent_id: None,
            declared_write_keys: &declared,
            fields: None,
        };
        assert_eq!(
            engine.write_key_for(&intent, &keychain, &Heads::default()),
            Some(k1.key_hash())
        );

        let empty = BTreeSet::new();
        let intent = WriteIntent {
            declared_write_keys: &empty,
            ..intent
        };
        assert_eq!(engine.write_key_for(&intent, &keychain, &Heads::default()), None);
    }
}
