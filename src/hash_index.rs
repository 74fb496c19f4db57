use crate::kb_store::{KbStore, KbStoreError};
use libherokubuildpack::log::log_warning;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File suffixes of native extension modules. These are never deduplicated:
/// a bubble must hold its own full copy so that two versions of a compiled
/// module can never be confused through a shared inode or a fallthrough path.
pub(crate) const NATIVE_SUFFIXES: [&str; 3] = ["so", "pyd", "dll"];

/// KB key suffix of the main environment's file hash set.
pub(crate) const HASH_INDEX_KEY_SUFFIX: &str = "main_env:file_hashes";

/// Marker field set when an incremental index update failed and the index
/// should be rebuilt from scratch on next use.
const REBUILD_MARKER_SUFFIX: &str = "main_env:file_hashes:stale";

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Whether the file must always be copied into a bubble (never dedup'd).
pub(crate) fn is_native_file(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            NATIVE_SUFFIXES
                .iter()
                .any(|suffix| extension.eq_ignore_ascii_case(suffix))
        })
}

/// Stream a file and produce its SHA-256 as lowercase hex.
pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A per-process memo of file hashes, so each path is hashed at most once no
/// matter how many bubbles are built in one run.
#[derive(Debug, Default)]
pub(crate) struct HashMemo {
    hashes: HashMap<PathBuf, String>,
}

impl HashMemo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hash(&mut self, path: &Path) -> io::Result<String> {
        if let Some(hash) = self.hashes.get(path) {
            return Ok(hash.clone());
        }
        let hash = sha256_file(path)?;
        self.hashes.insert(path.to_path_buf(), hash.clone());
        Ok(hash)
    }
}

/// The set of SHA-256 hashes of every file in the main site-packages,
/// persisted in the knowledge base and used to decide whether a staged file
/// can be omitted from a bubble.
#[derive(Debug)]
pub(crate) struct HashIndex {
    hashes: BTreeSet<String>,
}

impl HashIndex {
    /// Load the index for this context, building it from the filesystem on
    /// first use or when a previous incremental update left it stale.
    pub(crate) fn load_or_build(
        store: &KbStore,
        kb_prefix: &str,
        site_packages: &Path,
        memo: &mut HashMemo,
    ) -> Self {
        let key = format!("{kb_prefix}{HASH_INDEX_KEY_SUFFIX}");
        let marker_key = format!("{kb_prefix}{REBUILD_MARKER_SUFFIX}");
        let stale = store.hash_get_field(&marker_key, "stale").is_some();

        let existing = store.set_members(&key);
        if !existing.is_empty() && !stale {
            return Self { hashes: existing };
        }

        let index = Self::build(site_packages, memo);
        let members: Vec<String> = index.hashes.iter().cloned().collect();
        let written = store
            .delete_key(&key)
            .and_then(|()| store.set_add(&key, &members))
            .and_then(|()| store.delete_key(&marker_key));
        if let Err(error) = written {
            // Index persistence is best-effort: hashing still answered the
            // dedup question for this run, the next run rebuilds again.
            warn_index_write_failed(&error);
        }
        index
    }

    /// Hash every file under `site_packages`. Unreadable files are logged
    /// and skipped, which only means they will never be dedup'd.
    fn build(site_packages: &Path, memo: &mut HashMemo) -> Self {
        let mut hashes = BTreeSet::new();
        for entry in WalkDir::new(site_packages)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            match memo.hash(entry.path()) {
                Ok(hash) => {
                    hashes.insert(hash);
                }
                Err(io_error) => log_warning(
                    "Unreadable file skipped during hashing",
                    format!("{}: {io_error}", entry.path().display()),
                ),
            }
        }
        Self { hashes }
    }

    pub(crate) fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub(crate) fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Apply an install diff: hashes of removed files leave the index,
    /// hashes of added files join it. A failed write sets the rebuild
    /// marker instead of failing the install.
    pub(crate) fn apply_delta(
        &mut self,
        store: &KbStore,
        kb_prefix: &str,
        added_files: &[PathBuf],
        removed_hashes: &[String],
        memo: &mut HashMemo,
    ) {
        let key = format!("{kb_prefix}{HASH_INDEX_KEY_SUFFIX}");

        let mut added_hashes = Vec::new();
        for path in added_files {
            match memo.hash(path) {
                Ok(hash) => {
                    self.hashes.insert(hash.clone());
                    added_hashes.push(hash);
                }
                Err(io_error) => log_warning(
                    "Unreadable file skipped during hashing",
                    format!("{}: {io_error}", path.display()),
                ),
            }
        }
        for hash in removed_hashes {
            self.hashes.remove(hash);
        }

        let written = store
            .set_remove(&key, removed_hashes)
            .and_then(|()| store.set_add(&key, &added_hashes));
        if let Err(error) = written {
            warn_index_write_failed(&error);
            let marker_key = format!("{kb_prefix}{REBUILD_MARKER_SUFFIX}");
            store.hash_set_field(&marker_key, "stale", "true").ok();
        }
    }
}

fn warn_index_write_failed(error: &KbStoreError) {
    log_warning(
        "Hash index update failed",
        format!("The main-env hash index could not be persisted ({error:?}). It will be rebuilt on next use."),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn native_suffixes_are_recognized() {
        assert!(is_native_file(Path::new("numpy/core/_multiarray_umath.cpython-311-x86_64-linux-gnu.so")));
        assert!(is_native_file(Path::new("lib\\mod.PYD")));
        assert!(is_native_file(Path::new("bin/library.dll")));
        assert!(!is_native_file(Path::new("flask/app.py")));
        assert!(!is_native_file(Path::new("README")));
    }

    #[test]
    fn sha256_streams_file_contents() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("payload.txt");
        fs::write(&path, "hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn memo_hashes_each_path_once() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("payload.txt");
        fs::write(&path, "contents").unwrap();

        let mut memo = HashMemo::new();
        let first = memo.hash(&path).unwrap();
        // Change the file: the memo still answers with the original hash,
        // which is the point of the per-process memo.
        fs::write(&path, "different").unwrap();
        assert_eq!(memo.hash(&path).unwrap(), first);
    }

    #[test]
    fn load_or_build_populates_store_and_rereads() {
        let scratch = tempfile::tempdir().unwrap();
        let site = scratch.path().join("site-packages");
        fs::create_dir_all(site.join("pkg")).unwrap();
        fs::write(site.join("pkg/module.py"), "x = 1").unwrap();
        fs::write(site.join("pkg/other.py"), "y = 2").unwrap();

        let store = KbStore::new(scratch.path());
        let mut memo = HashMemo::new();
        let index = HashIndex::load_or_build(&store, "t:", &site, &mut memo);
        assert_eq!(index.len(), 2);
        assert!(index.contains(&sha256_file(&site.join("pkg/module.py")).unwrap()));

        // A second load reads from the store (delete the files to prove it).
        fs::remove_file(site.join("pkg/module.py")).unwrap();
        let reloaded = HashIndex::load_or_build(&store, "t:", &site, &mut HashMemo::new());
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn apply_delta_updates_membership() {
        let scratch = tempfile::tempdir().unwrap();
        let site = scratch.path().join("site-packages");
        fs::create_dir_all(&site).unwrap();
        fs::write(site.join("old.py"), "old").unwrap();

        let store = KbStore::new(scratch.path());
        let mut memo = HashMemo::new();
        let mut index = HashIndex::load_or_build(&store, "t:", &site, &mut memo);
        let old_hash = sha256_file(&site.join("old.py")).unwrap();
        assert!(index.contains(&old_hash));

        fs::write(site.join("new.py"), "new").unwrap();
        index.apply_delta(
            &store,
            "t:",
            &[site.join("new.py")],
            &[old_hash.clone()],
            &mut memo,
        );
        assert!(!index.contains(&old_hash));
        assert!(index.contains(&sha256_file(&site.join("new.py")).unwrap()));

        // The persisted set matches the in-memory view.
        let key = format!("t:{HASH_INDEX_KEY_SUFFIX}");
        assert!(!store.set_contains(&key, &old_hash));
        assert_eq!(store.set_members(&key).len(), 1);
    }
}
