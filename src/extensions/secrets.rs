//! Encrypted secrets for extensions.
//!
//! Records are keyed by (extension id, optional user id, key). Values are
//! sealed with ChaCha20-Poly1305 under a key derived from the master secret
//! with Argon2id. The (extension, user, key) triple is bound as associated
//! data, so a record copied to another scope fails to open.

use super::error::SecretsError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use once_cell::sync::OnceCell;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fixed salt: the derived key must depend only on the master secret
const KDF_SALT: &[u8] = b"extension-runtime/secrets/v1";
const NONCE_LEN: usize = 12;

/// Extension-scoped records are stored with an empty user id
const NO_USER: &str = "";

/// Derive the 256-bit encryption key for a master secret
pub fn derive_key(master_secret: &str) -> Result<[u8; 32], SecretsError> {
    let mut key = [0u8; 32];
    let params = argon2::Params::new(19456, 2, 1, Some(32))
        .map_err(|err| SecretsError::KeyDerivation(err.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    argon2
        .hash_password_into(master_secret.as_bytes(), KDF_SALT, &mut key)
        .map_err(|err| SecretsError::KeyDerivation(err.to_string()))?;
    Ok(key)
}

enum Location {
    File(PathBuf),
    Memory,
}

/// Persistent, encrypted key/value store scoped by extension and user
pub struct SecretsStore {
    location: Location,
    conn: OnceCell<Mutex<Connection>>,
    cipher: ChaCha20Poly1305,
}

impl SecretsStore {
    /// Store backed by a SQLite file. The file is opened on first use.
    pub fn open(db_path: impl AsRef<Path>, master_secret: &str) -> Result<Self, SecretsError> {
        Self::with_location(Location::File(db_path.as_ref().to_path_buf()), master_secret)
    }

    /// Store backed by a private in-memory database
    pub fn in_memory(master_secret: &str) -> Result<Self, SecretsError> {
        Self::with_location(Location::Memory, master_secret)
    }

    fn with_location(location: Location, master_secret: &str) -> Result<Self, SecretsError> {
        let key = derive_key(master_secret)?;
        Ok(Self {
            location,
            conn: OnceCell::new(),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    fn connection(&self) -> Result<&Mutex<Connection>, SecretsError> {
        self.conn.get_or_try_init(|| {
            let conn = match &self.location {
                Location::File(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| SecretsError::Corrupt(e.to_string()))?;
                    }
                    let conn = Connection::open(path)?;
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                    conn.pragma_update(None, "busy_timeout", 5000)?;
                    conn
                }
                Location::Memory => Connection::open_in_memory()?,
            };

            conn.execute(
                "CREATE TABLE IF NOT EXISTS extension_secrets (
                    extension_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    nonce BLOB NOT NULL,
                    ciphertext BLOB NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (extension_id, user_id, key)
                )",
                [],
            )?;
            tracing::debug!("Opened secrets database");
            Ok(Mutex::new(conn))
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SecretsError>,
    ) -> Result<T, SecretsError> {
        let conn = self
            .connection()?
            .lock()
            .map_err(|_| SecretsError::Poisoned)?;
        f(&conn)
    }

    /// Store or replace a secret
    pub fn set(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<(), SecretsError> {
        let user = scope(user_id)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let aad = associated_data(extension_id, user, key);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| SecretsError::Encrypt)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO extension_secrets (extension_id, user_id, key, nonce, ciphertext, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(extension_id, user_id, key)
                 DO UPDATE SET nonce = excluded.nonce,
                               ciphertext = excluded.ciphertext,
                               updated_at = excluded.updated_at",
                params![
                    extension_id,
                    user,
                    key,
                    &nonce[..],
                    ciphertext,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(extension = extension_id, key, "Stored secret");
        Ok(())
    }

    /// Read and decrypt a secret. Fails if the record does not open under this key.
    pub fn get(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, SecretsError> {
        let user = scope(user_id)?;
        let Some((nonce, ciphertext)) = self.sealed_record(extension_id, user_id, key)? else {
            return Ok(None);
        };
        if nonce.len() != NONCE_LEN {
            return Err(SecretsError::Corrupt(format!(
                "nonce for '{}' has {} bytes",
                key,
                nonce.len()
            )));
        }

        let aad = associated_data(extension_id, user, key);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SecretsError::Decrypt {
                key: key.to_string(),
            })?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| SecretsError::Corrupt(format!("secret '{}' is not UTF-8", key)))
    }

    /// Raw (nonce, ciphertext) as persisted
    pub fn sealed_record(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, SecretsError> {
        let user = scope(user_id)?;
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT nonce, ciphertext FROM extension_secrets
                     WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
                    params![extension_id, user, key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
    }

    /// Delete one secret; returns whether it existed
    pub fn delete(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        key: &str,
    ) -> Result<bool, SecretsError> {
        let user = scope(user_id)?;
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM extension_secrets WHERE extension_id = ?1 AND user_id = ?2 AND key = ?3",
                params![extension_id, user, key],
            )?)
        })?;
        Ok(removed > 0)
    }

    /// Keys in one scope, sorted
    pub fn list(&self, extension_id: &str, user_id: Option<&str>) -> Result<Vec<String>, SecretsError> {
        let user = scope(user_id)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM extension_secrets
                 WHERE extension_id = ?1 AND user_id = ?2 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![extension_id, user], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    /// Remove every extension-scoped and user-scoped record of one extension
    pub fn delete_all_for_extension(&self, extension_id: &str) -> Result<usize, SecretsError> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM extension_secrets WHERE extension_id = ?1",
                params![extension_id],
            )?)
        })?;
        tracing::info!(extension = extension_id, removed, "Deleted extension secrets");
        Ok(removed)
    }

    /// Number of records (all scopes) held for an extension
    pub fn count_for_extension(&self, extension_id: &str) -> Result<usize, SecretsError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM extension_secrets WHERE extension_id = ?1",
                params![extension_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

fn scope(user_id: Option<&str>) -> Result<&str, SecretsError> {
    match user_id {
        None => Ok(NO_USER),
        Some("") => Err(SecretsError::EmptyUserId),
        Some(user) => Ok(user),
    }
}

fn associated_data(extension_id: &str, user: &str, key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(extension_id.len() + user.len() + key.len() + 2);
    aad.extend_from_slice(extension_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(user.as_bytes());
    aad.push(0);
    aad.extend_from_slice(key.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a1 = derive_key("master-a").unwrap();
        let a2 = derive_key("master-a").unwrap();
        let b = derive_key("master-b").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_round_trip_and_scopes() {
        let store = SecretsStore::in_memory("master").unwrap();
        store.set("ext", None, "token", "abc").unwrap();
        store.set("ext", Some("u1"), "token", "user-abc").unwrap();

        assert_eq!(store.get("ext", None, "token").unwrap().as_deref(), Some("abc"));
        assert_eq!(
            store.get("ext", Some("u1"), "token").unwrap().as_deref(),
            Some("user-abc")
        );
        assert_eq!(store.get("ext", Some("u2"), "token").unwrap(), None);
        assert_eq!(store.list("ext", None).unwrap(), vec!["token".to_string()]);

        assert!(store.delete("ext", None, "token").unwrap());
        assert!(!store.delete("ext", None, "token").unwrap());
        assert_eq!(store.count_for_extension("ext").unwrap(), 1);
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let store = SecretsStore::in_memory("master").unwrap();
        store.set("ext", None, "k", "one").unwrap();
        store.set("ext", None, "k", "two").unwrap();
        assert_eq!(store.get("ext", None, "k").unwrap().as_deref(), Some("two"));
        assert_eq!(store.count_for_extension("ext").unwrap(), 1);
    }

    #[test]
    fn test_plaintext_not_persisted() {
        let store = SecretsStore::in_memory("master").unwrap();
        store.set("ext", None, "k", "super-secret-value").unwrap();
        let (nonce, ciphertext) = store.sealed_record("ext", None, "k").unwrap().unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(!ciphertext
            .windows(b"super-secret-value".len())
            .any(|w| w == b"super-secret-value"));
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let store = SecretsStore::in_memory("master").unwrap();
        assert!(matches!(
            store.set("ext", Some(""), "k", "v"),
            Err(SecretsError::EmptyUserId)
        ));
    }
}
