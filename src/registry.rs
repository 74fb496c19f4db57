use crate::fs_utils::{self, ReadDocumentError, WriteAtomicallyError};
use crate::locks::{LockAcquireError, LockFile};
use crate::names::canonicalize_name;
use crate::version::Version;
use libherokubuildpack::log::log_warning;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Filename of the path registry document, stored beside the bubbles.
pub(crate) const PATH_REGISTRY_FILENAME: &str = "package_paths.json";

/// Filename of the failed-version cache document.
pub(crate) const FAILED_VERSIONS_FILENAME: &str = "failed_versions.json";

/// How long a failed-version entry short-circuits reinstall attempts.
pub(crate) const FAILED_VERSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DOCUMENT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps `(canonical_name, version)` to the absolute path of the bubble
/// holding that version. The registry is an accelerator: the bubble
/// directory's name remains the source of truth for its identity, and a
/// registered path is re-validated against the filesystem on lookup.
#[derive(Debug)]
pub struct PathRegistry {
    document_path: PathBuf,
    lock_path: PathBuf,
}

type RegistryDocument = BTreeMap<String, BTreeMap<String, PathBuf>>;

impl PathRegistry {
    pub fn new(bubble_root: &Path) -> Self {
        let document_path = bubble_root.join(PATH_REGISTRY_FILENAME);
        let lock_path = document_path.with_extension("json.lock");
        Self {
            document_path,
            lock_path,
        }
    }

    /// Look up the bubble path registered for `(name, version)`, returning
    /// `None` when nothing is registered or the registered directory no
    /// longer exists on disk.
    pub fn get_bubble_path(&self, name: &str, version: &Version) -> Option<PathBuf> {
        let document: RegistryDocument = read_document(&self.document_path);
        let path = document
            .get(&canonicalize_name(name))?
            .get(&version.to_string())?
            .clone();
        path.is_dir().then_some(path)
    }

    /// Record the bubble path for `(name, version)`. Mutations re-read the
    /// document under the file lock so concurrent registrars never lose each
    /// other's entries.
    pub fn register(
        &self,
        name: &str,
        version: &Version,
        bubble_path: &Path,
    ) -> Result<(), RegistryError> {
        self.mutate(|document: &mut RegistryDocument| {
            document
                .entry(canonicalize_name(name))
                .or_default()
                .insert(version.to_string(), bubble_path.to_path_buf());
        })
    }

    /// Remove the entry for `(name, version)`, if any.
    pub fn unregister(&self, name: &str, version: &Version) -> Result<(), RegistryError> {
        self.mutate(|document: &mut RegistryDocument| {
            let canonical_name = canonicalize_name(name);
            if let Some(versions) = document.get_mut(&canonical_name) {
                versions.remove(&version.to_string());
                if versions.is_empty() {
                    document.remove(&canonical_name);
                }
            }
        })
    }

    /// Every registered `(name, version)` pair for `name`.
    pub fn registered_versions(&self, name: &str) -> Vec<Version> {
        let document: RegistryDocument = read_document(&self.document_path);
        document
            .get(&canonicalize_name(name))
            .map(|versions| {
                versions
                    .keys()
                    .filter_map(|version| version.parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut RegistryDocument),
    ) -> Result<(), RegistryError> {
        let _lock = LockFile::acquire(&self.lock_path, DOCUMENT_LOCK_TIMEOUT)
            .map_err(RegistryError::Lock)?;
        let mut document: RegistryDocument = read_document(&self.document_path);
        apply(&mut document);
        write_document(&self.document_path, &document)
    }
}

/// Remembers versions that recently failed to build, so that repeated
/// activations of a known-bad spec short-circuit instead of re-running a
/// doomed staged install. Entries expire after [`FAILED_VERSION_TTL`].
#[derive(Debug)]
pub struct FailedVersionCache {
    document_path: PathBuf,
    lock_path: PathBuf,
}

type FailedVersionsDocument = BTreeMap<String, BTreeMap<String, FailedVersion>>;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FailedVersion {
    pub reason: String,
    pub timestamp: u64,
}

impl FailedVersionCache {
    pub fn new(bubble_root: &Path) -> Self {
        let document_path = bubble_root.join(FAILED_VERSIONS_FILENAME);
        let lock_path = document_path.with_extension("json.lock");
        Self {
            document_path,
            lock_path,
        }
    }

    pub fn mark_failed(
        &self,
        name: &str,
        version: &Version,
        reason: &str,
    ) -> Result<(), RegistryError> {
        self.mutate(|document| {
            document
                .entry(canonicalize_name(name))
                .or_default()
                .insert(
                    version.to_string(),
                    FailedVersion {
                        reason: reason.to_string(),
                        timestamp: unix_timestamp(),
                    },
                );
        })
    }

    /// Whether `(name, version)` failed within the TTL window. Expired
    /// entries are ignored (and cleaned up on the next mutation).
    pub fn is_recently_failed(&self, name: &str, version: &Version) -> bool {
        self.recent_failure(name, version).is_some()
    }

    pub fn recent_failure(&self, name: &str, version: &Version) -> Option<FailedVersion> {
        let document: FailedVersionsDocument = read_document(&self.document_path);
        let entry = document
            .get(&canonicalize_name(name))?
            .get(&version.to_string())?
            .clone();
        let age = unix_timestamp().saturating_sub(entry.timestamp);
        (age <= FAILED_VERSION_TTL.as_secs()).then_some(entry)
    }

    /// Forget a failure record, typically after a successful rebuild.
    pub fn clear(&self, name: &str, version: &Version) -> Result<(), RegistryError> {
        self.mutate(|document| {
            let canonical_name = canonicalize_name(name);
            if let Some(versions) = document.get_mut(&canonical_name) {
                versions.remove(&version.to_string());
                if versions.is_empty() {
                    document.remove(&canonical_name);
                }
            }
        })
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut FailedVersionsDocument),
    ) -> Result<(), RegistryError> {
        let _lock = LockFile::acquire(&self.lock_path, DOCUMENT_LOCK_TIMEOUT)
            .map_err(RegistryError::Lock)?;
        let mut document: FailedVersionsDocument = read_document(&self.document_path);
        prune_expired(&mut document);
        apply(&mut document);
        write_document(&self.document_path, &document)
    }
}

fn prune_expired(document: &mut FailedVersionsDocument) {
    let now = unix_timestamp();
    document.retain(|_, versions| {
        versions
            .retain(|_, entry| now.saturating_sub(entry.timestamp) <= FAILED_VERSION_TTL.as_secs());
        !versions.is_empty()
    });
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Read a persisted registry document, treating a missing file or any read
/// failure as the empty document. A torn or corrupted file therefore costs a
/// rebuild of its contents, never a crash.
fn read_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs_utils::read_optional_document(path) {
        Ok(Some(document)) => document,
        Ok(None) => T::default(),
        Err(ReadDocumentError::Parse { path, parse_error }) => {
            log_warning(
                "Registry document corrupt",
                format!(
                    "Could not parse {}: {parse_error}. Treating it as empty.",
                    path.display()
                ),
            );
            T::default()
        }
        Err(ReadDocumentError::Io { path, io_error }) => {
            log_warning(
                "Registry read failed",
                format!("Could not read {}: {io_error}", path.display()),
            );
            T::default()
        }
    }
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), RegistryError> {
    let contents = serde_json::to_vec_pretty(document).map_err(RegistryError::Serialize)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|io_error| {
            RegistryError::Write(WriteAtomicallyError {
                io_error,
                path: parent.to_path_buf(),
            })
        })?;
    }
    fs_utils::write_atomically(path, &contents).map_err(RegistryError::Write)
}

/// Errors that can occur when updating a persisted registry document.
#[derive(Debug)]
pub enum RegistryError {
    Lock(LockAcquireError),
    Serialize(serde_json::Error),
    Write(WriteAtomicallyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn version(input: &str) -> Version {
        input.parse().unwrap()
    }

    #[test]
    fn register_and_look_up() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = PathRegistry::new(scratch.path());
        let bubble = scratch.path().join("flask-login-0.4.1");
        fs::create_dir(&bubble).unwrap();

        registry.register("Flask_Login", &version("0.4.1"), &bubble).unwrap();
        assert_eq!(
            registry.get_bubble_path("flask-login", &version("0.4.1")),
            Some(bubble)
        );
        assert_eq!(registry.get_bubble_path("flask-login", &version("0.6.3")), None);
        assert_eq!(registry.registered_versions("flask-login"), vec![version("0.4.1")]);
    }

    #[test]
    fn lookup_rejects_stale_entries() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = PathRegistry::new(scratch.path());
        let bubble = scratch.path().join("rich-13.4.2");
        fs::create_dir(&bubble).unwrap();
        registry.register("rich", &version("13.4.2"), &bubble).unwrap();

        fs::remove_dir(&bubble).unwrap();
        // The directory is gone, so the registry no longer vouches for it.
        assert_eq!(registry.get_bubble_path("rich", &version("13.4.2")), None);
    }

    #[test]
    fn unregister_removes_entry_and_empty_package() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = PathRegistry::new(scratch.path());
        let bubble = scratch.path().join("rich-13.4.2");
        fs::create_dir(&bubble).unwrap();
        registry.register("rich", &version("13.4.2"), &bubble).unwrap();
        registry.unregister("rich", &version("13.4.2")).unwrap();
        assert_eq!(registry.get_bubble_path("rich", &version("13.4.2")), None);
        assert!(registry.registered_versions("rich").is_empty());
    }

    #[test]
    fn corrupt_document_is_treated_as_empty() {
        let scratch = tempfile::tempdir().unwrap();
        let registry = PathRegistry::new(scratch.path());
        fs::write(scratch.path().join(PATH_REGISTRY_FILENAME), "{broken").unwrap();

        assert_eq!(registry.get_bubble_path("rich", &version("13.4.2")), None);
        // A mutation rebuilds a valid document from scratch.
        let bubble = scratch.path().join("rich-13.4.2");
        fs::create_dir(&bubble).unwrap();
        registry.register("rich", &version("13.4.2"), &bubble).unwrap();
        assert_eq!(
            registry.get_bubble_path("rich", &version("13.4.2")),
            Some(bubble)
        );
    }

    #[test]
    fn failed_versions_respect_ttl() {
        let scratch = tempfile::tempdir().unwrap();
        let cache = FailedVersionCache::new(scratch.path());

        cache.mark_failed("numpy", &version("1.24.3"), "staging install failed").unwrap();
        assert!(cache.is_recently_failed("numpy", &version("1.24.3")));
        assert!(!cache.is_recently_failed("numpy", &version("1.24.4")));
        let failure = cache.recent_failure("numpy", &version("1.24.3")).unwrap();
        assert_eq!(failure.reason, "staging install failed");

        // Rewrite the entry with an expired timestamp; it no longer counts.
        let document_path = scratch.path().join(FAILED_VERSIONS_FILENAME);
        let rewritten = fs::read_to_string(&document_path)
            .unwrap()
            .replace(&failure.timestamp.to_string(), "1000");
        fs::write(&document_path, rewritten).unwrap();
        assert!(!cache.is_recently_failed("numpy", &version("1.24.3")));

        // The next mutation prunes the expired entry entirely.
        cache.mark_failed("scipy", &version("1.11.0"), "no release date").unwrap();
        let document = fs::read_to_string(&document_path).unwrap();
        assert!(!document.contains("numpy"));
    }

    #[test]
    fn clear_removes_failure_record() {
        let scratch = tempfile::tempdir().unwrap();
        let cache = FailedVersionCache::new(scratch.path());
        cache.mark_failed("numpy", &version("1.24.3"), "verification failed").unwrap();
        cache.clear("numpy", &version("1.24.3")).unwrap();
        assert!(!cache.is_recently_failed("numpy", &version("1.24.3")));
    }
}
