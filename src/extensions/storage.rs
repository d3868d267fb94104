//! Extension-owned persistent storage
//!
//! Each extension gets a SQLite file under its data directory, and each
//! (extension, user) pair its own file under `users/<user>/`. Handles are
//! opened lazily and cached per (extension, user). Two shapes are stored:
//!
//! - the legacy unscoped key/value table (`storage.local`)
//! - declared collections, one table per collection, JSON values with
//!   `json_extract` indexes for the declared index fields

use super::collaborators::validate_user_id;
use super::error::StorageError;
use super::manifest::{is_valid_id, CollectionDeclaration};
use super::sql::{is_safe_identifier, table_prefix};
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Cache key: extension id and optional user scope
type HandleKey = (String, Option<String>);

/// Opens and caches per-extension storage handles
pub struct StorageManager {
    root: PathBuf,
    handles: DashMap<HandleKey, Arc<ExtensionStorage>>,
}

impl StorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: DashMap::new(),
        }
    }

    /// Directory holding an extension's storage files. The id must be a
    /// well-formed extension id so the path stays under the root.
    pub fn extension_dir(&self, extension_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_id(extension_id) {
            return Err(StorageError::InvalidIdentifier(extension_id.to_string()));
        }
        Ok(self.root.join(extension_id))
    }

    /// Get or open the handle for (extension, user)
    pub fn handle(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
    ) -> Result<Arc<ExtensionStorage>, StorageError> {
        let mut path = self.extension_dir(extension_id)?;
        let key = (extension_id.to_string(), user_id.map(str::to_string));
        if let Some(existing) = self.handles.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        if let Some(user) = user_id {
            validate_user_id(user).map_err(StorageError::InvalidIdentifier)?;
            path = path.join("users").join(user);
        }
        let storage = Arc::new(ExtensionStorage::open(extension_id, &path.join("storage.db"))?);
        let entry = self.handles.entry(key).or_insert(storage);
        Ok(Arc::clone(entry.value()))
    }

    /// Drop every cached handle of an extension
    pub fn close_extension(&self, extension_id: &str) {
        self.handles.retain(|(ext, _), _| ext != extension_id);
    }

    /// Close handles and delete all storage files of an extension
    pub fn purge_extension(&self, extension_id: &str) -> Result<(), StorageError> {
        let dir = self.extension_dir(extension_id)?;
        self.close_extension(extension_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

/// One extension's (optionally user-scoped) database
pub struct ExtensionStorage {
    conn: Mutex<Connection>,
    prefix: String,
    ensured: Mutex<HashSet<String>>,
}

impl ExtensionStorage {
    pub fn open(extension_id: &str, db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::with_connection(extension_id, conn)
    }

    pub fn in_memory(extension_id: &str) -> Result<Self, StorageError> {
        Self::with_connection(extension_id, Connection::open_in_memory()?)
    }

    fn with_connection(extension_id: &str, conn: Connection) -> Result<Self, StorageError> {
        let prefix = table_prefix(extension_id);
        let kv_table = format!("{}_kv", prefix);
        if !is_safe_identifier(&kv_table) {
            return Err(StorageError::InvalidIdentifier(kv_table));
        }
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                kv_table
            ),
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            prefix,
            ensured: Mutex::new(HashSet::new()),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn kv_table(&self) -> String {
        // `__kv` cannot collide with a collection: collection names start with a letter
        format!("{}_kv", self.prefix)
    }

    /// Table for a collection; the name must pass identifier sanitization
    pub fn collection_table(&self, collection: &str) -> Result<String, StorageError> {
        let table = format!("{}{}", self.prefix, collection);
        if collection.is_empty()
            || !collection.starts_with(|c: char| c.is_ascii_lowercase())
            || !is_safe_identifier(collection)
            || !is_safe_identifier(&table)
        {
            return Err(StorageError::InvalidIdentifier(collection.to_string()));
        }
        Ok(table)
    }

    // ---- legacy key/value ----

    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let sql = format!("SELECT value FROM \"{}\" WHERE key = ?1", self.kv_table());
        let raw: Option<String> = self
            .lock()?
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StorageError::from))
            .transpose()
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        upsert(&*self.lock()?, &self.kv_table(), key, value)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM \"{}\" WHERE key = ?1", self.kv_table());
        Ok(self.lock()?.execute(&sql, params![key])? > 0)
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        select_keys(&*self.lock()?, &self.kv_table())
    }

    // ---- collections ----

    /// Create the collection table and its field indexes once per handle
    pub fn ensure_collection(&self, decl: &CollectionDeclaration) -> Result<String, StorageError> {
        let table = self.collection_table(&decl.name)?;
        {
            let ensured = self.ensured.lock().map_err(|_| StorageError::Poisoned)?;
            if ensured.contains(&decl.name) {
                return Ok(table);
            }
        }

        let conn = self.lock()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                table
            ),
            [],
        )?;
        for field in &decl.indexes {
            if !is_safe_identifier(field) {
                tracing::warn!(
                    collection = %decl.name,
                    field = %field,
                    "Skipping index on invalid field name"
                );
                continue;
            }
            let index = format!("{}_idx_{}", table, field);
            if !is_safe_identifier(&index) {
                tracing::warn!(index = %index, "Skipping index with oversized name");
                continue;
            }
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS \"{}\" ON \"{}\" (json_extract(value, '$.{}'))",
                    index, table, field
                ),
                [],
            )?;
        }
        drop(conn);

        self.ensured
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .insert(decl.name.clone());
        Ok(table)
    }

    pub fn collection_get(
        &self,
        decl: &CollectionDeclaration,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let table = self.ensure_collection(decl)?;
        let raw: Option<String> = self
            .lock()?
            .query_row(
                &format!("SELECT value FROM \"{}\" WHERE key = ?1", table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StorageError::from))
            .transpose()
    }

    pub fn collection_set(
        &self,
        decl: &CollectionDeclaration,
        key: &str,
        value: &Value,
    ) -> Result<(), StorageError> {
        let table = self.ensure_collection(decl)?;
        upsert(&*self.lock()?, &table, key, value)
    }

    pub fn collection_delete(
        &self,
        decl: &CollectionDeclaration,
        key: &str,
    ) -> Result<bool, StorageError> {
        let table = self.ensure_collection(decl)?;
        Ok(self
            .lock()?
            .execute(&format!("DELETE FROM \"{}\" WHERE key = ?1", table), params![key])?
            > 0)
    }

    pub fn collection_keys(&self, decl: &CollectionDeclaration) -> Result<Vec<String>, StorageError> {
        let table = self.ensure_collection(decl)?;
        select_keys(&*self.lock()?, &table)
    }

    /// Documents whose indexed fields equal every value in `filter`
    pub fn collection_query(
        &self,
        decl: &CollectionDeclaration,
        filter: &Map<String, Value>,
        limit: Option<u32>,
    ) -> Result<Vec<(String, Value)>, StorageError> {
        let table = self.ensure_collection(decl)?;

        let mut clauses = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (field, expected) in filter {
            if !decl.indexes.iter().any(|f| f == field) || !is_safe_identifier(field) {
                return Err(StorageError::NotIndexed {
                    collection: decl.name.clone(),
                    field: field.clone(),
                });
            }
            values.push(json_to_sql(expected));
            clauses.push(format!(
                "json_extract(value, '$.{}') = ?{}",
                field,
                values.len()
            ));
        }

        let mut sql = format!("SELECT key, value FROM \"{}\"", table);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY key");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, raw)| -> Result<(String, Value), StorageError> {
                Ok((key, serde_json::from_str(&raw)?))
            })
            .collect()
    }
}

fn upsert(conn: &Connection, table: &str, key: &str, value: &Value) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "INSERT INTO \"{}\" (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            table
        ),
        params![key, serde_json::to_string(value)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn select_keys(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("SELECT key FROM \"{}\" ORDER BY key", table))?;
    let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// json_extract returns SQL scalars; compare against the matching SQL type
fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}
