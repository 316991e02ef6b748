use crate::config::{CollectionConfig, LocaleSpec};
use crate::registry::{Direction, LanguageEntry};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

/// One persisted per-locale translation row.
#[derive(Debug, Clone)]
pub struct TranslationRow {
    pub parent_id: String,
    pub language_code: String,
    /// Field name -> translated value for every configured field
    pub fields: Map<String, Value>,
    /// Set when the provider failed and the source text was copied instead
    pub degraded: bool,
    pub updated_at: String,
}

/// Foreign-key metadata linking a translations table to its parent and to
/// the language registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRecord {
    pub id: i64,
    pub many_collection: String,
    pub many_field: String,
    pub one_collection: String,
    pub one_field: Option<String>,
}

/// Field metadata row carrying the "special" capability marker.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub id: i64,
    pub collection: String,
    pub field: String,
    pub special: Option<String>,
}

/// Handle to the CMS database file.
///
/// All writes go through one connection behind a mutex, so competing upserts
/// for the same `(parent_id, language_code)` key serialize and the row always
/// reflects exactly one write in full.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open the database and enable foreign keys.
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path)
            .context(format!("Failed to open database at {}", database_path))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create the metadata tables and one translations table per configured
    /// collection. Safe to run on every startup.
    pub fn init_schema(&self, collections: &[CollectionConfig]) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS languages (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                direction TEXT NOT NULL DEFAULT 'ltr'
            )",
            [],
        )
        .context("Failed to create languages table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                many_collection TEXT NOT NULL,
                many_field TEXT NOT NULL,
                one_collection TEXT NOT NULL,
                one_field TEXT
            )",
            [],
        )
        .context("Failed to create relations table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS field_meta (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                field TEXT NOT NULL,
                special TEXT,
                UNIQUE(collection, field)
            )",
            [],
        )
        .context("Failed to create field_meta table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS permissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                policy_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                action TEXT NOT NULL,
                UNIQUE(policy_id, collection, action)
            )",
            [],
        )
        .context("Failed to create permissions table")?;

        for collection in collections {
            let table = collection.translations_table();
            validate_table_name(&table)?;
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        parent_id TEXT NOT NULL,
                        language_code TEXT NOT NULL,
                        fields TEXT NOT NULL,
                        degraded INTEGER NOT NULL DEFAULT 0,
                        updated_at TEXT NOT NULL,
                        UNIQUE(parent_id, language_code)
                    )",
                    table
                ),
                [],
            )
            .context(format!("Failed to create {} table", table))?;
        }

        Ok(())
    }

    // ==================== Language registry ====================

    /// Insert any missing locales. Existing rows are never updated or
    /// deleted; a language entry is immutable once referenced.
    pub fn ensure_languages(&self, locales: &[LocaleSpec]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut added = 0;

        for locale in locales {
            added += conn
                .execute(
                    "INSERT OR IGNORE INTO languages (code, name, direction) VALUES (?1, ?2, ?3)",
                    params![locale.code, locale.name, locale.direction],
                )
                .context(format!("Failed to insert language {}", locale.code))?;
        }

        Ok(added)
    }

    /// Load the full language registry.
    pub fn list_languages(&self) -> Result<Vec<LanguageEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT code, name, direction FROM languages ORDER BY code")
            .context("Failed to prepare language query")?;

        let entries = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read languages")?;

        entries
            .into_iter()
            .map(|(code, name, direction)| {
                let direction = Direction::from_str(&direction)
                    .with_context(|| format!("Language {} has invalid direction", code))?;
                Ok(LanguageEntry {
                    code,
                    name,
                    direction,
                })
            })
            .collect()
    }

    // ==================== Translation rows ====================

    /// Write or replace the translation row for `(parent_id, language_code)`.
    ///
    /// A single conflict-target statement, so the row always holds one
    /// complete field set; re-running the same write is a no-op in effect.
    pub fn upsert_translation(
        &self,
        collection: &CollectionConfig,
        parent_id: &str,
        language_code: &str,
        fields: &Map<String, Value>,
        degraded: bool,
    ) -> Result<()> {
        let table = collection.translations_table();
        validate_table_name(&table)?;
        let fields_json =
            serde_json::to_string(fields).context("Failed to serialize translation fields")?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (parent_id, language_code, fields, degraded, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(parent_id, language_code) DO UPDATE SET
                     fields = excluded.fields,
                     degraded = excluded.degraded,
                     updated_at = excluded.updated_at",
                table
            ),
            params![parent_id, language_code, fields_json, degraded as i64, now],
        )
        .context(format!(
            "Failed to upsert translation for {} parent {} locale {}",
            collection.name, parent_id, language_code
        ))?;

        Ok(())
    }

    /// Remove every translation row for the parent, across all locales.
    /// Returns the number of rows removed; an absent parent is a no-op.
    pub fn delete_translations(
        &self,
        collection: &CollectionConfig,
        parent_id: &str,
    ) -> Result<usize> {
        let table = collection.translations_table();
        validate_table_name(&table)?;
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE parent_id = ?1", table),
                params![parent_id],
            )
            .context(format!(
                "Failed to delete translations for {} parent {}",
                collection.name, parent_id
            ))?;

        Ok(removed)
    }

    /// All translation rows for one parent, ordered by locale.
    pub fn translations_for(
        &self,
        collection: &CollectionConfig,
        parent_id: &str,
    ) -> Result<Vec<TranslationRow>> {
        let table = collection.translations_table();
        validate_table_name(&table)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT parent_id, language_code, fields, degraded, updated_at
                 FROM {} WHERE parent_id = ?1 ORDER BY language_code",
                table
            ))
            .context("Failed to prepare translation query")?;

        let rows = stmt
            .query_map(params![parent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read translation rows")?;

        rows.into_iter()
            .map(|(parent_id, language_code, fields, degraded, updated_at)| {
                let fields: Map<String, Value> = serde_json::from_str(&fields)
                    .context("Stored translation fields are not valid JSON")?;
                Ok(TranslationRow {
                    parent_id,
                    language_code,
                    fields,
                    degraded: degraded != 0,
                    updated_at,
                })
            })
            .collect()
    }

    // ==================== Relation records ====================

    /// Ensure the two relation records a translatable collection needs:
    /// translations -> parent collection and translations -> languages.
    /// Creates nothing when a record for the triple already exists.
    pub fn ensure_relations(&self, collection: &CollectionConfig) -> Result<usize> {
        let table = collection.translations_table();
        let mut added = 0;

        added += self.ensure_relation(&table, "parent_id", &collection.name, &collection.id_field)?;
        added += self.ensure_relation(&table, "language_code", "languages", "code")?;

        Ok(added)
    }

    fn ensure_relation(
        &self,
        many_collection: &str,
        many_field: &str,
        one_collection: &str,
        one_field: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let existing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM relations
                 WHERE many_collection = ?1 AND many_field = ?2 AND one_collection = ?3",
                params![many_collection, many_field, one_collection],
                |row| row.get(0),
            )
            .context("Failed to check existing relation")?;

        if existing > 0 {
            return Ok(0);
        }

        conn.execute(
            "INSERT INTO relations (many_collection, many_field, one_collection, one_field)
             VALUES (?1, ?2, ?3, ?4)",
            params![many_collection, many_field, one_collection, one_field],
        )
        .context("Failed to insert relation record")?;

        Ok(1)
    }

    /// All relation records, oldest first.
    pub fn list_relations(&self) -> Result<Vec<RelationRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, many_collection, many_field, one_collection, one_field
                 FROM relations ORDER BY id",
            )
            .context("Failed to prepare relation query")?;

        let records = stmt
            .query_map([], |row| {
                Ok(RelationRecord {
                    id: row.get(0)?,
                    many_collection: row.get(1)?,
                    many_field: row.get(2)?,
                    one_collection: row.get(3)?,
                    one_field: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read relation records")?;

        Ok(records)
    }

    /// Delete a batch of relation records in one transaction.
    ///
    /// Used by the consistency manager to collapse one duplicated triple at a
    /// time without holding a lock over the whole table scan.
    pub fn delete_relations(&self, ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to begin relation delete transaction")?;

        for id in ids {
            tx.execute("DELETE FROM relations WHERE id = ?1", params![id])
                .context(format!("Failed to delete relation {}", id))?;
        }

        tx.commit()
            .context("Failed to commit relation delete transaction")?;
        Ok(())
    }

    /// Insert a relation record directly. Setup and test helper.
    pub fn insert_relation(
        &self,
        many_collection: &str,
        many_field: &str,
        one_collection: &str,
        one_field: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO relations (many_collection, many_field, one_collection, one_field)
             VALUES (?1, ?2, ?3, ?4)",
            params![many_collection, many_field, one_collection, one_field],
        )
        .context("Failed to insert relation record")?;
        Ok(conn.last_insert_rowid())
    }

    // ==================== Field capability markers ====================

    /// Ensure the capability markers a translatable collection needs: the
    /// translations alias on the parent and the two link fields on the
    /// translations table. Existing marker values are kept as-is.
    pub fn ensure_field_markers(&self, collection: &CollectionConfig) -> Result<()> {
        let table = collection.translations_table();
        self.ensure_field_meta(&collection.name, "translations", r#"["translations"]"#)?;
        self.ensure_field_meta(&table, "parent_id", r#"["m2o"]"#)?;
        self.ensure_field_meta(&table, "language_code", r#"["m2o"]"#)?;
        Ok(())
    }

    /// Register a field's capability marker, keeping any existing value.
    fn ensure_field_meta(&self, collection: &str, field: &str, special: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO field_meta (collection, field, special) VALUES (?1, ?2, ?3)",
            params![collection, field, special],
        )
        .context(format!(
            "Failed to insert field metadata for {}.{}",
            collection, field
        ))?;
        Ok(())
    }

    /// Overwrite a field's marker value. Setup and test helper.
    pub fn set_field_special(&self, collection: &str, field: &str, special: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO field_meta (collection, field, special) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, field) DO UPDATE SET special = excluded.special",
            params![collection, field, special],
        )
        .context(format!(
            "Failed to set field metadata for {}.{}",
            collection, field
        ))?;
        Ok(())
    }

    pub fn list_field_meta(&self) -> Result<Vec<FieldMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, collection, field, special FROM field_meta ORDER BY id")
            .context("Failed to prepare field metadata query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(FieldMeta {
                    id: row.get(0)?,
                    collection: row.get(1)?,
                    field: row.get(2)?,
                    special: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read field metadata")?;

        Ok(rows)
    }

    /// Rewrite one field's marker value in its own transaction.
    pub fn update_field_special(&self, id: i64, special: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .context("Failed to begin marker update transaction")?;
        tx.execute(
            "UPDATE field_meta SET special = ?1 WHERE id = ?2",
            params![special, id],
        )
        .context(format!("Failed to update marker for field_meta {}", id))?;
        tx.commit()
            .context("Failed to commit marker update transaction")?;
        Ok(())
    }

    // ==================== Permission grants ====================

    /// Add a grant if absent. Returns true when a new grant was created;
    /// existing grants are never modified or narrowed.
    pub fn ensure_grant(&self, policy_id: &str, collection: &str, action: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let added = conn
            .execute(
                "INSERT OR IGNORE INTO permissions (policy_id, collection, action)
                 VALUES (?1, ?2, ?3)",
                params![policy_id, collection, action],
            )
            .context(format!(
                "Failed to ensure {} grant on {} for policy {}",
                action, collection, policy_id
            ))?;
        Ok(added > 0)
    }

    pub fn has_grant(&self, policy_id: &str, collection: &str, action: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM permissions
                 WHERE policy_id = ?1 AND collection = ?2 AND action = ?3",
                params![policy_id, collection, action],
                |row| row.get(0),
            )
            .context("Failed to check permission grant")?;
        Ok(count > 0)
    }

    /// Number of grants held by a policy.
    pub fn grant_count(&self, policy_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM permissions WHERE policy_id = ?1",
                params![policy_id],
                |row| row.get(0),
            )
            .context("Failed to count permission grants")?;
        Ok(count as usize)
    }
}

/// Table names are interpolated into SQL, so restrict them to identifier
/// characters. Collection names come from startup configuration, never from
/// webhook payloads.
fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("Invalid table name '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn map_locations() -> CollectionConfig {
        CollectionConfig {
            name: "map_locations".to_string(),
            id_field: "id".to_string(),
            translatable_fields: vec!["name".to_string(), "description".to_string()],
        }
    }

    fn open_store(temp: &TempDir) -> Store {
        let path = temp.path().join("cms.db");
        let store = Store::new(path.to_str().unwrap()).expect("Should open");
        store
            .init_schema(&[map_locations()])
            .expect("Should init schema");
        store
    }

    fn fields(name: &str, description: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("name".to_string(), json!(name));
        map.insert("description".to_string(), json!(description));
        map
    }

    #[test]
    fn test_upsert_creates_row() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        store
            .upsert_translation(&collection, "1", "en-US", &fields("Temple", "Old"), false)
            .expect("Should upsert");

        let rows = store.translations_for(&collection, "1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].language_code, "en-US");
        assert_eq!(rows[0].fields["name"], json!("Temple"));
        assert!(!rows[0].degraded);
    }

    #[test]
    fn test_upsert_replaces_not_appends() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        store
            .upsert_translation(&collection, "1", "en-US", &fields("First", "a"), false)
            .unwrap();
        store
            .upsert_translation(&collection, "1", "en-US", &fields("Second", "b"), true)
            .unwrap();

        let rows = store.translations_for(&collection, "1").unwrap();
        assert_eq!(rows.len(), 1, "Upsert must never duplicate a key");
        assert_eq!(rows[0].fields["name"], json!("Second"));
        assert!(rows[0].degraded);
    }

    #[test]
    fn test_upsert_same_write_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();
        let f = fields("Same", "Same");

        for _ in 0..5 {
            store
                .upsert_translation(&collection, "7", "en-US", &f, false)
                .unwrap();
        }

        let rows = store.translations_for(&collection, "7").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["name"], json!("Same"));
    }

    #[test]
    fn test_concurrent_upserts_leave_one_complete_row() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let collection = collection.clone();
                std::thread::spawn(move || {
                    let name = format!("Temple {}", i);
                    let description = format!("Description {}", i);
                    store
                        .upsert_translation(
                            &collection,
                            "1",
                            "en-US",
                            &fields(&name, &description),
                            false,
                        )
                        .expect("Should upsert");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // One row survives, and both fields come from the same write.
        let rows = store.translations_for(&collection, "1").unwrap();
        assert_eq!(rows.len(), 1);
        let name = rows[0].fields["name"].as_str().unwrap();
        let suffix = name.strip_prefix("Temple ").unwrap();
        assert_eq!(
            rows[0].fields["description"].as_str().unwrap(),
            format!("Description {}", suffix)
        );
    }

    #[test]
    fn test_delete_removes_all_locales() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        store
            .upsert_translation(&collection, "1", "en-US", &fields("a", "b"), false)
            .unwrap();
        store
            .upsert_translation(&collection, "1", "ar-SA", &fields("c", "d"), false)
            .unwrap();
        store
            .upsert_translation(&collection, "2", "en-US", &fields("e", "f"), false)
            .unwrap();

        let removed = store.delete_translations(&collection, "1").unwrap();
        assert_eq!(removed, 2);
        assert!(store.translations_for(&collection, "1").unwrap().is_empty());
        // Other parents untouched
        assert_eq!(store.translations_for(&collection, "2").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_absent_parent_is_noop() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        let removed = store.delete_translations(&collection, "999").unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_ensure_languages_never_updates_existing() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let added = store
            .ensure_languages(&[LocaleSpec {
                code: "en-US".to_string(),
                name: "English".to_string(),
                direction: "ltr".to_string(),
            }])
            .unwrap();
        assert_eq!(added, 1);

        // Re-running with a different name must not touch the stored row.
        let added = store
            .ensure_languages(&[LocaleSpec {
                code: "en-US".to_string(),
                name: "Renamed".to_string(),
                direction: "rtl".to_string(),
            }])
            .unwrap();
        assert_eq!(added, 0);

        let languages = store.list_languages().unwrap();
        assert_eq!(languages.len(), 1);
        assert_eq!(languages[0].name, "English");
    }

    #[test]
    fn test_ensure_relations_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        assert_eq!(store.ensure_relations(&collection).unwrap(), 2);
        assert_eq!(store.ensure_relations(&collection).unwrap(), 0);

        let relations = store.list_relations().unwrap();
        assert_eq!(relations.len(), 2);
        assert!(relations
            .iter()
            .any(|r| r.one_collection == "map_locations" && r.many_field == "parent_id"));
        assert!(relations
            .iter()
            .any(|r| r.one_collection == "languages" && r.many_field == "language_code"));
    }

    #[test]
    fn test_ensure_field_markers_idempotent_and_keeps_existing() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let collection = map_locations();

        // Pre-existing marker values must survive provisioning.
        store
            .set_field_special("map_locations", "translations", "translations,alias")
            .unwrap();

        store.ensure_field_markers(&collection).unwrap();
        store.ensure_field_markers(&collection).unwrap();

        let meta = store.list_field_meta().unwrap();
        assert_eq!(meta.len(), 3);
        let existing = meta
            .iter()
            .find(|m| m.collection == "map_locations" && m.field == "translations")
            .unwrap();
        assert_eq!(existing.special.as_deref(), Some("translations,alias"));
        let link = meta
            .iter()
            .find(|m| m.collection == "map_locations_translations" && m.field == "parent_id")
            .unwrap();
        assert_eq!(link.special.as_deref(), Some(r#"["m2o"]"#));
    }

    #[test]
    fn test_ensure_grant_only_adds() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        assert!(store
            .ensure_grant("policy-1", "map_locations_translations", "create")
            .unwrap());
        assert!(!store
            .ensure_grant("policy-1", "map_locations_translations", "create")
            .unwrap());
        assert!(store
            .has_grant("policy-1", "map_locations_translations", "create")
            .unwrap());
        assert_eq!(store.grant_count("policy-1").unwrap(), 1);
    }

    #[test]
    fn test_validate_table_name_rejects_injection() {
        assert!(validate_table_name("map_locations_translations").is_ok());
        assert!(validate_table_name("a; DROP TABLE languages").is_err());
        assert!(validate_table_name("").is_err());
    }
}
