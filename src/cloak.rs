use crate::locks::{LockAcquireError, LockManager};
use crate::names::module_name;
use libherokubuildpack::log::{log_info, log_warning};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Packages that must never be cloaked under any circumstance: the
/// activator's own dependency closure, the networking and cache essentials
/// it needs mid-activation, and the installer tooling the build and
/// recovery paths shell out to. Attempts to cloak them are silently
/// skipped. Canonical names.
pub(crate) const IMMORTAL_PACKAGES: [&str; 32] = [
    // Core activator dependencies.
    "omnipkg",
    "click",
    "rich",
    "toml",
    "packaging",
    "filelock",
    "colorama",
    "tabulate",
    "psutil",
    "distro",
    "pydantic",
    "pydantic-core",
    "ruamel-yaml",
    "safety-schemas",
    "typing-extensions",
    "mypy-extensions",
    // Networking essentials.
    "requests",
    "urllib3",
    "charset-normalizer",
    "idna",
    "certifi",
    // Async networking essentials.
    "aiohttp",
    "aiosignal",
    "aiohappyeyeballs",
    "attrs",
    "frozenlist",
    "multidict",
    "yarl",
    // Cache.
    "redis",
    // Installer tooling.
    "pip",
    "setuptools",
    "wheel",
];

const CLOAK_MARKER: &str = "_omnipkg_cloaked";

pub(crate) fn is_immortal(canonical_name: &str) -> bool {
    IMMORTAL_PACKAGES.contains(&canonical_name)
}

/// One successful rename performed during cloaking, kept so the owning
/// loader can reverse it (or a panic-restore can).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CloakRecord {
    pub(crate) original: PathBuf,
    pub(crate) cloaked: PathBuf,
}

/// A cloaked artifact found by scanning the site directory, parsed back out
/// of the suffix grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FoundCloak {
    pub(crate) path: PathBuf,
    pub(crate) original: PathBuf,
    pub(crate) timestamp_us: u128,
    pub(crate) loader_id: u64,
}

/// Renames main-env package artifacts out of the import path and back.
///
/// Every cloak this engine creates embeds `loader_id` in the suffix, which
/// is what lets crash recovery distinguish our cloaks from a concurrent
/// loader's.
#[derive(Debug)]
pub(crate) struct CloakEngine {
    site_packages: PathBuf,
    locks: LockManager,
    loader_id: u64,
}

impl CloakEngine {
    pub(crate) fn new(site_packages: &Path, locks: LockManager, loader_id: u64) -> Self {
        Self {
            site_packages: site_packages.to_path_buf(),
            locks,
            loader_id,
        }
    }

    /// Hide every main-env artifact of `canonical_name` behind a loader-tagged
    /// rename. Immortal packages are skipped silently; artifacts that vanish
    /// before we get to them were cloaked by a concurrent loader and are
    /// skipped; a lock timeout skips that artifact with a warning.
    pub(crate) fn cloak_package(
        &self,
        canonical_name: &str,
    ) -> Result<Vec<CloakRecord>, CloakError> {
        if is_immortal(canonical_name) {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for artifact in self.artifact_paths(canonical_name) {
            let _lock = match self.locks.cloak_lock(canonical_name) {
                Ok(lock) => lock,
                Err(LockAcquireError::Timeout { waited, .. }) => {
                    log_warning(
                        "Cloak lock timeout",
                        format!(
                            "Another loader held the cloak lock for '{canonical_name}' for more \
                             than {waited:?}; skipping {}.",
                            artifact.display()
                        ),
                    );
                    continue;
                }
                Err(error) => return Err(CloakError::Lock(error)),
            };
            // Re-check under the lock: a concurrent loader may have already
            // cloaked this artifact.
            if !artifact.exists() && fs::symlink_metadata(&artifact).is_err() {
                continue;
            }
            let cloaked = self.cloaked_path(&artifact);
            fs::rename(&artifact, &cloaked).map_err(|io_error| CloakError::Rename {
                from: artifact.clone(),
                to: cloaked.clone(),
                io_error,
            })?;
            records.push(CloakRecord {
                original: artifact,
                cloaked,
            });
        }
        Ok(records)
    }

    /// Reverse a cloak operation, in reverse order of cloaking. Tolerates
    /// every race: a restored original wins over our cloak, a vanished cloak
    /// means another loader already restored it.
    pub(crate) fn uncloak(&self, canonical_name: &str, records: &[CloakRecord]) {
        for record in records.iter().rev() {
            let _lock = match self.locks.cloak_lock(canonical_name) {
                Ok(lock) => Some(lock),
                Err(error) => {
                    log_warning(
                        "Cloak lock unavailable during restore",
                        format!("Restoring {} without the lock: {error}", record.original.display()),
                    );
                    None
                }
            };
            if fs::symlink_metadata(&record.cloaked).is_err() {
                // Another loader restored (or cleaned up) this cloak.
                continue;
            }
            if fs::symlink_metadata(&record.original).is_ok() {
                // Something re-created the original while we were active;
                // our cloaked copy is the authoritative one.
                remove_path(&record.original);
            }
            if let Err(io_error) = fs::rename(&record.cloaked, &record.original) {
                log_warning(
                    "Cloak restore failed",
                    format!(
                        "Could not rename {} back to {}: {io_error}",
                        record.cloaked.display(),
                        record.original.display()
                    ),
                );
            }
        }
    }

    /// Restore every recorded cloak after a failed activation, then sweep
    /// for orphans of the same package so no cloak of ours outlives us.
    pub(crate) fn panic_restore(&self, canonical_name: &str, records: &[CloakRecord]) {
        self.uncloak(canonical_name, records);
        self.recover_orphans(canonical_name);
    }

    /// Find every cloaked artifact for `canonical_name` in the site
    /// directory, newest first.
    pub(crate) fn scan_cloaks(&self, canonical_name: &str) -> Vec<FoundCloak> {
        let module = module_name(canonical_name);
        let Ok(entries) = fs::read_dir(&self.site_packages) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.contains(CLOAK_MARKER) {
                continue;
            }
            let Some(cloak) = parse_cloaked_name(&self.site_packages, &file_name) else {
                continue;
            };
            let original_name = cloak
                .original
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            // Match the package dir, single-file module, dist-info and
            // egg-info forms of this package only.
            let matches_package = original_name == module
                || original_name == format!("{module}.py")
                || (original_name.starts_with(&format!("{module}-"))
                    && (original_name.ends_with(".dist-info")
                        || original_name.ends_with(".egg-info")));
            if matches_package {
                found.push(cloak);
            }
        }
        found.sort_by(|a, b| b.timestamp_us.cmp(&a.timestamp_us));
        found
    }

    /// Detect and repair cloaks left behind by a crashed loader: restore the
    /// newest cloak per original path (preferring one tagged with our own
    /// loader id), delete the older ones encountered during the scan.
    pub(crate) fn recover_orphans(&self, canonical_name: &str) {
        let _lock = match self.locks.cloak_lock(canonical_name) {
            Ok(lock) => Some(lock),
            Err(error) => {
                log_warning(
                    "Cloak lock unavailable during orphan recovery",
                    format!("Proceeding without the lock for '{canonical_name}': {error}"),
                );
                None
            }
        };

        let mut cloaks = self.scan_cloaks(canonical_name);
        // Prefer our own cloaks, then recency (the list is newest-first).
        cloaks.sort_by_key(|cloak| (cloak.loader_id != self.loader_id, u128::MAX - cloak.timestamp_us));

        let mut restored_originals: Vec<PathBuf> = Vec::new();
        for cloak in cloaks {
            if restored_originals.contains(&cloak.original) {
                // An older cloak of an already-restored artifact: stale.
                log_info(format!(
                    "Removing stale cloak {}",
                    cloak.path.display()
                ));
                remove_path(&cloak.path);
                continue;
            }
            if fs::symlink_metadata(&cloak.original).is_ok() {
                // The original is back (restored by another loader); this
                // cloak is stale.
                remove_path(&cloak.path);
                restored_originals.push(cloak.original);
                continue;
            }
            match fs::rename(&cloak.path, &cloak.original) {
                Ok(()) => {
                    log_info(format!(
                        "Restored orphaned cloak for '{canonical_name}' ({})",
                        cloak.original.display()
                    ));
                    restored_originals.push(cloak.original);
                }
                Err(io_error) => log_warning(
                    "Orphan cloak restore failed",
                    format!("{}: {io_error}", cloak.path.display()),
                ),
            }
        }
    }

    /// On loader startup: restore any cloak of an immortal package left by a
    /// crashed older process, before dependency scanning relies on them.
    pub(crate) fn restore_critical_dep_cloaks(&self) {
        for package in IMMORTAL_PACKAGES {
            if !self.scan_cloaks(package).is_empty() {
                log_warning(
                    "Cloaked critical dependency found",
                    format!("'{package}' was left cloaked by a previous process; restoring it."),
                );
                self.recover_orphans(package);
            }
        }
    }

    /// The artifacts of `canonical_name` currently present in site-packages:
    /// the package directory, a top-level single-file module, and the
    /// dist-info/egg-info directories.
    fn artifact_paths(&self, canonical_name: &str) -> Vec<PathBuf> {
        let module = module_name(canonical_name);
        let mut artifacts = Vec::new();
        for candidate in [
            self.site_packages.join(&module),
            self.site_packages.join(format!("{module}.py")),
        ] {
            if fs::symlink_metadata(&candidate).is_ok() {
                artifacts.push(candidate);
            }
        }
        if let Ok(entries) = fs::read_dir(&self.site_packages) {
            for entry in entries.filter_map(Result::ok) {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if file_name.contains(CLOAK_MARKER) {
                    continue;
                }
                if file_name.starts_with(&format!("{module}-"))
                    && (file_name.ends_with(".dist-info") || file_name.ends_with(".egg-info"))
                {
                    artifacts.push(entry.path());
                }
            }
        }
        artifacts
    }

    /// `X -> X.<timestamp_us>_<loader_id>_omnipkg_cloaked[.<ext>]`, with the
    /// original extension repeated at the end when there is one, so tooling
    /// that filters by extension still classifies the file correctly.
    fn cloaked_path(&self, original: &Path) -> PathBuf {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        let mut cloaked_name = format!(
            "{}.{timestamp_us}_{}{CLOAK_MARKER}",
            original.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            self.loader_id,
        );
        if let Some(extension) = original.extension().and_then(|e| e.to_str()) {
            if !original.is_dir() {
                cloaked_name.push('.');
                cloaked_name.push_str(extension);
            }
        }
        original.with_file_name(cloaked_name)
    }
}

/// Parse `<original>.<timestamp_us>_<loader_id>_omnipkg_cloaked[.<ext>]`.
fn parse_cloaked_name(site_packages: &Path, file_name: &str) -> Option<FoundCloak> {
    let marker_start = file_name.find(CLOAK_MARKER)?;
    let prefix = &file_name[..marker_start];
    // The prefix ends with `.<timestamp>_<loader_id>`.
    let (rest, loader_id) = prefix.rsplit_once('_')?;
    let (original, timestamp) = rest.rsplit_once('.')?;
    let timestamp_us = timestamp.parse().ok()?;
    let loader_id = loader_id.parse().ok()?;
    Some(FoundCloak {
        path: site_packages.join(file_name),
        original: site_packages.join(original),
        timestamp_us,
        loader_id,
    })
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(io_error) = result {
        log_warning(
            "Cleanup failed",
            format!("Could not remove {}: {io_error}", path.display()),
        );
    }
}

/// Errors that can occur while cloaking a package's artifacts.
#[derive(Debug)]
pub enum CloakError {
    Lock(LockAcquireError),
    Rename {
        from: PathBuf,
        to: PathBuf,
        io_error: io::Error,
    },
}
