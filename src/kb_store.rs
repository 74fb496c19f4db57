use crate::fs_utils::{self, ReadDocumentError, WriteAtomicallyError};
use crate::locks::{LockAcquireError, LockFile};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use libherokubuildpack::log::log_warning;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata fields that are stored zlib-compressed when they exceed
/// [`COMPRESSION_THRESHOLD`], hex-encoded with a `<field>_compressed`
/// sibling marker.
pub(crate) const LARGE_TEXT_FIELDS: [&str; 3] = ["description", "license", "help_text"];

pub(crate) const COMPRESSION_THRESHOLD: usize = 512;

/// The knowledge base's persistence layer: hash- and set-valued keys over a
/// single JSON document, written atomically under a file lock.
///
/// The shapes mirror the index server the design came from, so every reader
/// and writer thinks in terms of `hset`/`sadd`-style operations and the
/// store stays swappable. Single-writer semantics are provided by the
/// callers (the builder holds the install lock while it writes).
#[derive(Debug)]
pub struct KbStore {
    document_path: PathBuf,
    lock_path: PathBuf,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreDocument {
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    sets: BTreeMap<String, BTreeSet<String>>,
}

impl KbStore {
    pub fn new(store_dir: &Path) -> Self {
        let document_path = store_dir.join("knowledge_base.json");
        let lock_path = document_path.with_extension("json.lock");
        Self {
            document_path,
            lock_path,
        }
    }

    // --- hash-valued keys ---

    pub(crate) fn hash_set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            document
                .hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        })
    }

    pub(crate) fn hash_set_all(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            let hash = document.hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
        })
    }

    pub(crate) fn hash_get_field(&self, key: &str, field: &str) -> Option<String> {
        self.read().hashes.get(key)?.get(field).cloned()
    }

    pub(crate) fn hash_get_all(&self, key: &str) -> BTreeMap<String, String> {
        self.read().hashes.get(key).cloned().unwrap_or_default()
    }

    // --- set-valued keys ---

    pub(crate) fn set_add(&self, key: &str, members: &[String]) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            document
                .sets
                .entry(key.to_string())
                .or_default()
                .extend(members.iter().cloned());
        })
    }

    pub(crate) fn set_remove(&self, key: &str, members: &[String]) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            if let Some(set) = document.sets.get_mut(key) {
                for member in members {
                    set.remove(member);
                }
            }
        })
    }

    pub(crate) fn set_members(&self, key: &str) -> BTreeSet<String> {
        self.read().sets.get(key).cloned().unwrap_or_default()
    }

    pub(crate) fn set_contains(&self, key: &str, member: &str) -> bool {
        self.read()
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member))
    }

    // --- key management ---

    /// Delete every key (hash or set) starting with `prefix`.
    pub(crate) fn delete_keys_with_prefix(&self, prefix: &str) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            document.hashes.retain(|key, _| !key.starts_with(prefix));
            document.sets.retain(|key, _| !key.starts_with(prefix));
        })
    }

    pub(crate) fn delete_key(&self, key: &str) -> Result<(), KbStoreError> {
        self.mutate(|document| {
            document.hashes.remove(key);
            document.sets.remove(key);
        })
    }

    fn read(&self) -> StoreDocument {
        match fs_utils::read_optional_document(&self.document_path) {
            Ok(Some(document)) => document,
            Ok(None) => StoreDocument::default(),
            Err(ReadDocumentError::Parse { path, parse_error }) => {
                log_warning(
                    "Knowledge base document corrupt",
                    format!(
                        "Could not parse {}: {parse_error}. Treating it as empty; \
                         a rebuild will repopulate it.",
                        path.display()
                    ),
                );
                StoreDocument::default()
            }
            Err(ReadDocumentError::Io { path, io_error }) => {
                log_warning(
                    "Knowledge base read failed",
                    format!("Could not read {}: {io_error}", path.display()),
                );
                StoreDocument::default()
            }
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoreDocument)) -> Result<(), KbStoreError> {
        let _lock = LockFile::acquire(&self.lock_path, STORE_LOCK_TIMEOUT)
            .map_err(KbStoreError::Lock)?;
        let mut document = self.read();
        apply(&mut document);
        let contents = serde_json::to_vec(&document).map_err(KbStoreError::Serialize)?;
        if let Some(parent) = self.document_path.parent() {
            std::fs::create_dir_all(parent).map_err(|io_error| {
                KbStoreError::Write(WriteAtomicallyError {
                    io_error,
                    path: parent.to_path_buf(),
                })
            })?;
        }
        fs_utils::write_atomically(&self.document_path, &contents).map_err(KbStoreError::Write)
    }
}

/// Compress a large text field for storage: zlib-deflate then hex-encode.
pub(crate) fn compress_field(value: &str) -> Result<String, std::io::Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(value.as_bytes())?;
    Ok(hex::encode(encoder.finish()?))
}

/// Inverse of [`compress_field`]. Returns `None` when the stored value is
/// not valid hex-encoded zlib data.
pub(crate) fn decompress_field(stored: &str) -> Option<String> {
    let compressed = hex::decode(stored).ok()?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut value = String::new();
    decoder.read_to_string(&mut value).ok()?;
    Some(value)
}

/// Errors that can occur when writing to the knowledge base store.
#[derive(Debug)]
pub enum KbStoreError {
    Lock(LockAcquireError),
    Serialize(serde_json::Error),
    Write(WriteAtomicallyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KbStore) {
        let scratch = tempfile::tempdir().unwrap();
        let store = KbStore::new(scratch.path());
        (scratch, store)
    }

    #[test]
    fn hash_operations() {
        let (_scratch, store) = store();
        store.hash_set_field("omnipkg:env_ab:py3.11:numpy", "active_version", "2.3.5").unwrap();
        store
            .hash_set_all(
                "omnipkg:env_ab:py3.11:numpy",
                &BTreeMap::from([("bubble:1.24.3".to_string(), "true".to_string())]),
            )
            .unwrap();

        assert_eq!(
            store.hash_get_field("omnipkg:env_ab:py3.11:numpy", "active_version"),
            Some("2.3.5".to_string())
        );
        let all = store.hash_get_all("omnipkg:env_ab:py3.11:numpy");
        assert_eq!(all.len(), 2);
        assert_eq!(store.hash_get_field("missing", "field"), None);
    }

    #[test]
    fn set_operations() {
        let (_scratch, store) = store();
        let key = "omnipkg:env_ab:py3.11:index";
        store.set_add(key, &["numpy".to_string(), "rich".to_string()]).unwrap();
        store.set_add(key, &["numpy".to_string()]).unwrap();
        assert_eq!(store.set_members(key).len(), 2);
        assert!(store.set_contains(key, "rich"));

        store.set_remove(key, &["rich".to_string()]).unwrap();
        assert!(!store.set_contains(key, "rich"));
    }

    #[test]
    fn prefix_deletion_scopes_by_context() {
        let (_scratch, store) = store();
        store.hash_set_field("omnipkg:env_ab:py3.11:numpy", "active_version", "2.3.5").unwrap();
        store.hash_set_field("omnipkg:env_cd:py3.12:numpy", "active_version", "1.26.4").unwrap();
        store.set_add("omnipkg:env_ab:py3.11:index", &["numpy".to_string()]).unwrap();

        store.delete_keys_with_prefix("omnipkg:env_ab:py3.11:").unwrap();
        assert_eq!(store.hash_get_field("omnipkg:env_ab:py3.11:numpy", "active_version"), None);
        assert!(store.set_members("omnipkg:env_ab:py3.11:index").is_empty());
        // The other interpreter's context is untouched.
        assert_eq!(
            store.hash_get_field("omnipkg:env_cd:py3.12:numpy", "active_version"),
            Some("1.26.4".to_string())
        );
    }

    #[test]
    fn corrupt_store_is_treated_as_empty() {
        let (scratch, store) = store();
        std::fs::write(scratch.path().join("knowledge_base.json"), "][").unwrap();
        assert_eq!(store.hash_get_field("any", "field"), None);
        store.hash_set_field("any", "field", "value").unwrap();
        assert_eq!(store.hash_get_field("any", "field"), Some("value".to_string()));
    }

    #[test]
    fn compression_round_trips() {
        let original = "BSD 3-Clause License\n".repeat(100);
        let compressed = compress_field(&original).unwrap();
        assert!(compressed.len() < original.len());
        assert!(compressed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(decompress_field(&compressed).unwrap(), original);
    }

    #[test]
    fn decompress_rejects_plain_text() {
        assert_eq!(decompress_field("not hex at all"), None);
        assert_eq!(decompress_field("abcdef"), None);
    }
}
