//! Detects and repairs schema drift the CMS metadata accumulates around
//! translated collections: duplicated relation records, malformed field
//! capability markers, and missing permission grants for the service policy.
//!
//! Every repair is idempotent and works one affected tuple at a time, so the
//! manager can run while the sync pipeline is live.

use crate::config::CollectionConfig;
use crate::store::Store;
use anyhow::Result;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Actions the service identity needs on every table it touches.
const REQUIRED_ACTIONS: [&str; 3] = ["create", "update", "read"];

/// Outcome of one repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Tuples inspected
    pub examined: usize,
    /// Tuples rewritten or created
    pub repaired: usize,
    /// Tuples that could not be brought to canonical form
    pub unrepairable: usize,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.unrepairable == 0
    }

    pub fn merge(&mut self, other: &RepairReport) {
        self.examined += other.examined;
        self.repaired += other.repaired;
        self.unrepairable += other.unrepairable;
    }
}

pub struct ConsistencyManager {
    store: Store,
    policy_id: String,
    collections: Vec<CollectionConfig>,
}

impl ConsistencyManager {
    pub fn new(store: Store, policy_id: &str, collections: &[CollectionConfig]) -> Self {
        Self {
            store,
            policy_id: policy_id.to_string(),
            collections: collections.to_vec(),
        }
    }

    /// Run all three repairs. Used at startup and by the repair CLI.
    pub fn repair_all(&self) -> Result<RepairReport> {
        let mut report = self.dedupe_relations()?;
        report.merge(&self.canonicalize_markers()?);
        report.merge(&self.ensure_permissions()?);
        Ok(report)
    }

    /// Collapse duplicated relation records.
    ///
    /// Records are grouped by `(many_collection, many_field, one_collection)`;
    /// the earliest-created record of each group survives, the rest are
    /// deleted in one transaction per group. Re-running on a clean table
    /// changes nothing.
    pub fn dedupe_relations(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        // list_relations orders by id, so the first record of each group is
        // the earliest-created one.
        let mut groups: BTreeMap<(String, String, String), Vec<i64>> = BTreeMap::new();
        for record in self.store.list_relations()? {
            groups
                .entry((
                    record.many_collection,
                    record.many_field,
                    record.one_collection,
                ))
                .or_default()
                .push(record.id);
        }

        for ((many_collection, many_field, one_collection), ids) in groups {
            report.examined += 1;
            if ids.len() <= 1 {
                continue;
            }

            let kept = ids[0];
            let doomed = &ids[1..];
            self.store.delete_relations(doomed)?;
            report.repaired += 1;

            info!(
                "Collapsed {} duplicate relation(s) for {}.{} -> {}, kept id {}",
                doomed.len(),
                many_collection,
                many_field,
                one_collection,
                kept
            );
        }

        Ok(report)
    }

    /// Rewrite field capability markers to the canonical encoding.
    ///
    /// Canonical form is a compact JSON array of tags in sorted order.
    /// Values already canonical are left byte-identical; values no parser
    /// accepts are logged and left untouched.
    pub fn canonicalize_markers(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        for meta in self.store.list_field_meta()? {
            let Some(raw) = meta.special.as_deref() else {
                continue;
            };
            report.examined += 1;

            let Some(tags) = parse_tag_set(raw) else {
                warn!(
                    "Unrepairable capability marker on {}.{}: {:?}",
                    meta.collection, meta.field, raw
                );
                report.unrepairable += 1;
                continue;
            };

            let canonical = canonical_encoding(&tags);
            if canonical == raw {
                continue;
            }

            self.store.update_field_special(meta.id, &canonical)?;
            report.repaired += 1;
            info!(
                "Rewrote capability marker on {}.{}: {:?} -> {:?}",
                meta.collection, meta.field, raw, canonical
            );
        }

        Ok(report)
    }

    /// Ensure the service policy holds create/update/read grants on every
    /// translations table and on the language registry. Only ever adds.
    pub fn ensure_permissions(&self) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        let mut tables: Vec<String> = self
            .collections
            .iter()
            .map(|c| c.translations_table())
            .collect();
        tables.push("languages".to_string());

        for table in &tables {
            for action in REQUIRED_ACTIONS {
                report.examined += 1;
                if self.store.ensure_grant(&self.policy_id, table, action)? {
                    report.repaired += 1;
                    info!(
                        "Granted {} on {} to policy {}",
                        action, table, self.policy_id
                    );
                }
            }
        }

        Ok(report)
    }
}

/// Parse any accepted encoding of a capability marker into a tag set.
///
/// Accepted: a JSON array of strings, a JSON string wrapping another accepted
/// encoding (double-encoded legacy rows), and bare comma-separated text.
/// Returns `None` for values that look like JSON but are not.
fn parse_tag_set(raw: &str) -> Option<BTreeSet<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(BTreeSet::new());
    }

    if trimmed.starts_with('[') {
        let parsed: Vec<String> = serde_json::from_str(trimmed).ok()?;
        return Some(
            parsed
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        );
    }

    if trimmed.starts_with('"') {
        let inner: String = serde_json::from_str(trimmed).ok()?;
        return parse_tag_set(&inner);
    }

    // Bare comma-separated legacy encoding
    Some(
        trimmed
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

/// Compact JSON array, tags in sorted order.
fn canonical_encoding(tags: &BTreeSet<String>) -> String {
    serde_json::to_string(&tags.iter().collect::<Vec<_>>())
        .expect("A set of strings always serializes")
}
