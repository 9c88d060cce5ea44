use std::collections::BTreeSet;
use std::sync::Arc;

use pes_types::{EntryId, TemporalAnchor};
use serde::{Deserialize, Serialize};

use crate::entry::Fields;

/// One side of a merge: a version's fields plus its tie-break inputs.
#[derive(Clone, Copy, Debug)]
pub struct MergeSide<'a> {
    pub fields: &'a Fields,
    pub timestamp: TemporalAnchor,
    pub entry_id: EntryId,
}

impl MergeSide<'_> {
    /// Highest `(timestamp, entry_id)` wins.
    pub fn beats(&self, other: &MergeSide<'_>) -> bool {
        (self.timestamp, self.entry_id) > (other.timestamp, other.entry_id)
    }
}

/// A field both sides changed in incompatible ways.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeConflict {
    pub field: String,
}

/// Three-way merge of two versions that diverged from a common base.
///
/// Implementations must be deterministic and symmetric: swapping `ours` and
/// `theirs` yields the same fields. Replay relies on it.
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(
        &self,
        base: Option<&Fields>,
        ours: &MergeSide<'_>,
        theirs: &MergeSide<'_>,
    ) -> Result<Fields, MergeConflict>;
}

/// Default strategy: union of non-overlapping field changes; overlapping
/// changes resolve per field to the side that wins the tie-break.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldUnionStrategy;

/// Whole-object last-writer-wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastWriterWinsStrategy;

/// Field union that refuses overlapping changes instead of resolving them.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailOnConflictStrategy;

impl MergeStrategy for FieldUnionStrategy {
    fn name(&self) -> &'static str {
        "field-union"
    }

    fn merge(
        &self,
        base: Option<&Fields>,
        ours: &MergeSide<'_>,
        theirs: &MergeSide<'_>,
    ) -> Result<Fields, MergeConflict> {
        let winner = if theirs.beats(ours) { theirs } else { ours };
        union_with(base, ours, theirs, |field| {
            Ok(winner.fields.get(field).cloned())
        })
    }
}

impl MergeStrategy for LastWriterWinsStrategy {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn merge(
        &self,
        _base: Option<&Fields>,
        ours: &MergeSide<'_>,
        theirs: &MergeSide<'_>,
    ) -> Result<Fields, MergeConflict> {
        let winner = if theirs.beats(ours) { theirs } else { ours };
        Ok(winner.fields.clone())
    }
}

impl MergeStrategy for FailOnConflictStrategy {
    fn name(&self) -> &'static str {
        "fail-on-conflict"
    }

    fn merge(
        &self,
        base: Option<&Fields>,
        ours: &MergeSide<'_>,
        theirs: &MergeSide<'_>,
    ) -> Result<Fields, MergeConflict> {
        union_with(base, ours, theirs, |field| {
            Err(MergeConflict {
                field: field.to_string(),
            })
        })
    }
}

fn union_with(
    base: Option<&Fields>,
    ours: &MergeSide<'_>,
    theirs: &MergeSide<'_>,
    mut on_overlap: impl FnMut(&str) -> Result<Option<serde_json::Value>, MergeConflict>,
) -> Result<Fields, MergeConflict> {
    let empty = Fields::new();
    let base = base.unwrap_or(&empty);

    let names: BTreeSet<&String> = base
        .keys()
        .chain(ours.fields.keys())
        .chain(theirs.fields.keys())
        .collect();

    let mut merged = Fields::new();
    for name in names {
        let b = base.get(name);
        let o = ours.fields.get(name);
        let t = theirs.fields.get(name);

        let value = if o == t {
            o.cloned()
        } else if o == b {
            t.cloned()
        } else if t == b {
            o.cloned()
        } else {
            on_overlap(name)?
        };

        if let Some(value) = value {
            merged.insert(name.clone(), value);
        }
    }
    Ok(merged)
}

/// Selects the [`MergeStrategy`] used by a chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    #[default]
    FieldUnion,
    LastWriterWins,
    FailOnConflict,
}

impl MergePolicy {
    pub fn strategy(&self) -> Arc<dyn MergeStrategy> {
        match self {
            Self::FieldUnion => Arc::new(FieldUnionStrategy),
            Self::LastWriterWins => Arc::new(LastWriterWinsStrategy),
            Self::FailOnConflict => Arc::new(FailOnConflictStrategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn side(fields: &Fields, ms: u64, id: u128) -> MergeSide<'_> {
        MergeSide {
            fields,
            timestamp: TemporalAnchor::new(ms, 0, 0),
            entry_id: EntryId::from_u128(id),
        }
    }

    #[test]
    fn tie_break_falls_back_to_entry_id() {
        let f = Fields::new();
        assert!(side(&f, 10, 1).beats(&side(&f, 9, 2)));
        assert!(side(&f, 10, 2).beats(&side(&f, 10, 1)));
        assert!(!side(&f, 10, 1).beats(&side(&f, 10, 1)));
    }

    #[test]
    fn field_union_keeps_non_overlapping_changes() {
        let base = fields(&[("a", json!(1)), ("b", json!(1))]);
        let ours = fields(&[("a", json!(2)), ("b", json!(1))]);
        let theirs = fields(&[("a", json!(1)), ("b", json!(3)), ("c", json!("new"))]);

        let merged = FieldUnionStrategy
            .merge(Some(&base), &side(&ours, 1, 1), &side(&theirs, 2, 2))
            .unwrap();
        assert_eq!(merged, fields(&[("a", json!(2)), ("b", json!(3)), ("c", json!("new"))]));
    }

    #[test]
    fn field_union_resolves_overlap_by_tie_break() {
        let base = fields(&[("a", json!(1))]);
        let ours = fields(&[("a", json!("ours"))]);
        let theirs = fields(&[("a", json!("theirs"))]);

        let merged = FieldUnionStrategy
            .merge(Some(&base), &side(&ours, 5, 1), &side(&theirs, 4, 2))
            .unwrap();
        assert_eq!(merged["a"], json!("ours"));
    }

    #[test]
    fn field_union_honours_removals() {
        let base = fields(&[("a", json!(1)), ("b", json!(2))]);
        let ours = fields(&[("a", json!(1))]);
        let theirs = fields(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);

        let merged = FieldUnionStrategy
            .merge(Some(&base), &side(&ours, 1, 1), &side(&theirs, 2, 2))
            .unwrap();
        assert_eq!(merged, fields(&[("a", json!(1)), ("c", json!(3))]));
    }

    #[test]
    fn last_writer_wins_takes_whole_object() {
        let ours = fields(&[("a", json!(1)), ("b", json!(1))]);
        let theirs = fields(&[("a", json!(2))]);
        let merged = LastWriterWinsStrategy
            .merge(None, &side(&ours, 1, 1), &side(&theirs, 2, 2))
            .unwrap();
        assert_eq!(merged, theirs);
    }

    #[test]
    fn fail_on_conflict_reports_field() {
        let base = fields(&[("a", json!(1))]);
        let ours = fields(&[("a", json!(2))]);
        let theirs = fields(&[("a", json!(3))]);
        let err = FailOnConflictStrategy
            .merge(Some(&base), &side(&ours, 1, 1), &side(&theirs, 2, 2))
            .unwrap_err();
        assert_eq!(err, MergeConflict { field: "a".into() });
    }

    #[test]
    fn policy_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&MergePolicy::FailOnConflict).unwrap(), "\"fail-on-conflict\"");
        assert_eq!(MergePolicy::default().strategy().name(), "field-union");
    }

    fn arb_fields() -> impl Strategy<Value = Fields> {
        prop::collection::btree_map("[a-d]", (0i64..4).prop_map(Value::from), 0..4)
    }

    proptest! {
        #[test]
        fn field_union_is_symmetric(
            base in arb_fields(),
            ours in arb_fields(),
            theirs in arb_fields(),
            ours_ms in 0u64..3,
            theirs_ms in 0u64..3,
        ) {
            let a = side(&ours, ours_ms, 1);
            let b = side(&theirs, theirs_ms, 2);
            let ab = FieldUnionStrategy.merge(Some(&base), &a, &b).unwrap();
            let ba = FieldUnionStrategy.merge(Some(&base), &b, &a).unwrap();
            prop_assert_eq!(ab, ba);
        }
    }
}
