use crate::config::Config;
use crate::dist_info::{self, dependency_names, Distribution};
use crate::fs_utils::{self, CapturedCommandError};
use crate::hash_index::{is_native_file, HashIndex, HashMemo};
use crate::kb_store::KbStore;
use crate::locks::{LockAcquireError, LockManager};
use crate::manifest::{BubbleManifest, ManifestError, ManifestPackage, PackageType};
use crate::names::PackageSpec;
use crate::registry::{FailedVersionCache, PathRegistry, RegistryError};
use crate::version::Version;
use libherokubuildpack::log::{log_header, log_info, log_warning};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use std::{fs, io};
use walkdir::WalkDir;

/// Timeout for one external installer run into a staging directory.
const INSTALLER_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for one sterile import probe.
const IMPORT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const PYPI_BASE_URL: &str = "https://pypi.org/pypi";

/// Packages that must be import-tested together, in this order. A bubble
/// containing the key package runs its probe with the listed imports instead
/// of a lone import of the key.
const IMPORT_TEST_GROUPS: [(&str, &[&str]); 2] = [
    ("tensorboard", &["tensorflow", "tensorboard"]),
    ("tensorflow", &["tensorflow", "tensorboard"]),
];

/// The result of asking the builder for a bubble.
#[derive(Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A new bubble was created at this path.
    Created(PathBuf),
    /// The bubble already existed (registry hit or a concurrent builder won
    /// the race); nothing was rebuilt.
    AlreadyPresent(PathBuf),
}

/// Creates isolated version bubbles: a staged historical install,
/// deduplicated against the main environment, verified in a sterile
/// subprocess, and committed atomically into the bubble root.
pub struct BubbleBuilder<'a> {
    config: &'a Config,
    registry: &'a PathRegistry,
    failed_versions: &'a FailedVersionCache,
    store: &'a KbStore,
    locks: LockManager,
    memo: HashMemo,
    agent: ureq::Agent,
    index_base_url: String,
}

impl<'a> BubbleBuilder<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a PathRegistry,
        failed_versions: &'a FailedVersionCache,
        store: &'a KbStore,
    ) -> Self {
        Self {
            config,
            registry,
            failed_versions,
            store,
            locks: LockManager::new(&config.bubble_root),
            memo: HashMemo::new(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            index_base_url: PYPI_BASE_URL.to_string(),
        }
    }

    /// Build (or find) the bubble for `spec`. Exactly one builder creates a
    /// given bubble across processes; the loser waits on the install lock
    /// and observes the winner's directory. Recoverable failures mark the
    /// version failed and surface as an error the caller can log and skip.
    pub fn create(&mut self, spec: &PackageSpec) -> Result<BuildOutcome, BubbleError> {
        if let Some(existing) = self.registry.get_bubble_path(&spec.name, &spec.version) {
            if BubbleManifest::exists(&existing) {
                return Ok(BuildOutcome::AlreadyPresent(existing));
            }
        }
        if self.failed_versions.is_recently_failed(&spec.name, &spec.version) {
            return Err(BubbleError::RecentlyFailed(spec.clone()));
        }

        let _install_lock = self
            .locks
            .install_lock(&spec.name, &spec.version)
            .map_err(BubbleError::InstallLockTimeout)?;

        // Re-check under the lock: a concurrent builder may have finished
        // while we waited.
        let bubble_path = self.config.bubble_root.join(spec.bubble_dir_name());
        if BubbleManifest::exists(&bubble_path) {
            self.registry
                .register(&spec.name, &spec.version, &bubble_path)
                .map_err(BubbleError::Registry)?;
            return Ok(BuildOutcome::AlreadyPresent(bubble_path));
        }

        log_header(format!("Building bubble for {spec}"));
        self.build_fresh(spec, &bubble_path)?;
        Ok(BuildOutcome::Created(bubble_path))
    }

    fn build_fresh(&mut self, spec: &PackageSpec, bubble_path: &Path) -> Result<(), BubbleError> {
        // Step 1: anchor the time travel on the target's release date.
        let Some(release_date) = self.release_date(spec)? else {
            self.mark_failed(spec, "no release date on the upstream index");
            return Err(BubbleError::ReleaseDateUnavailable(spec.clone()));
        };

        // Step 2: the shopping list - dependency names declared by the
        // target, read from a deps-disabled install in a throwaway dir.
        let dependency_list = self.dependency_shopping_list(spec)?;
        log_info(format!(
            "{} declares {} dependencies",
            spec,
            dependency_list.len()
        ));

        // Step 3: resolve each dependency to the latest version released at
        // or before the anchor date.
        let historical = self.historical_versions(&dependency_list, release_date);

        // Step 4: staged install of the full pin list.
        let staging = tempfile::tempdir().map_err(|io_error| BubbleError::Staging {
            path: PathBuf::from("tempdir"),
            io_error,
        })?;
        let mut pins = vec![spec.to_string()];
        pins.extend(
            historical
                .iter()
                .map(|(name, version)| format!("{name}=={version}")),
        );
        if let Err(error) = self.install_to_target(&pins, staging.path()) {
            self.mark_failed(spec, "staging install failed");
            return Err(BubbleError::StagingInstall(error));
        }

        // Step 5: enumerate what actually landed in staging.
        let installed =
            dist_info::discover_distributions(staging.path()).map_err(|error| BubbleError::Staging {
                path: error.site_dir,
                io_error: error.io_error,
            })?;

        // Verification happens before anything reaches the bubble root.
        if let Err(error) = self.verify_staging(spec, staging.path()) {
            self.mark_failed(spec, "import verification failed in a sterile subprocess");
            return Err(error);
        }

        // Step 6: deduplicated copy into a work directory beside the final
        // path, then an atomic rename. A crash never leaves a half-built
        // tree at the bubble path itself.
        let work_path = self
            .config
            .bubble_root
            .join(format!(".tmp-{}", spec.bubble_dir_name()));
        if work_path.exists() {
            fs::remove_dir_all(&work_path).map_err(|io_error| BubbleError::Staging {
                path: work_path.clone(),
                io_error,
            })?;
        }
        let copied_bytes = self.deduplicated_copy(staging.path(), &work_path)?;

        // Step 7: the manifest makes the bubble real.
        let manifest = BubbleManifest::new(manifest_packages(&installed), copied_bytes);
        manifest.write(&work_path).map_err(BubbleError::Manifest)?;
        fs::rename(&work_path, bubble_path).map_err(|io_error| BubbleError::Staging {
            path: bubble_path.to_path_buf(),
            io_error,
        })?;

        // Step 8: register.
        self.registry
            .register(&spec.name, &spec.version, bubble_path)
            .map_err(BubbleError::Registry)?;
        self.failed_versions.clear(&spec.name, &spec.version).ok();
        log_info(format!(
            "Bubble ready at {} ({} packages)",
            bubble_path.display(),
            manifest.stats.package_count
        ));
        Ok(())
    }

    /// Remove a bubble from disk and from the registry, used by the
    /// activation auto-heal and by `smart_uninstall`.
    pub fn destroy(&self, spec: &PackageSpec) -> Result<(), BubbleError> {
        let bubble_path = self.config.bubble_root.join(spec.bubble_dir_name());
        if bubble_path.is_dir() {
            fs::remove_dir_all(&bubble_path).map_err(|io_error| BubbleError::Staging {
                path: bubble_path,
                io_error,
            })?;
        }
        self.registry
            .unregister(&spec.name, &spec.version)
            .map_err(BubbleError::Registry)
    }

    fn mark_failed(&self, spec: &PackageSpec, reason: &str) {
        log_warning(
            "Bubble build failed",
            format!("{spec}: {reason}. The version is cached as failed for 24 hours."),
        );
        if let Err(error) = self
            .failed_versions
            .mark_failed(&spec.name, &spec.version, reason)
        {
            log_warning(
                "Failed-version cache update failed",
                format!("{spec}: {error:?}"),
            );
        }
    }

    // --- upstream index (time travel) ---

    fn release_date(&self, spec: &PackageSpec) -> Result<Option<jiff::Timestamp>, BubbleError> {
        let url = format!("{}/{}/{}/json", self.index_base_url, spec.name, spec.version);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(error) => return Err(BubbleError::Index(error)),
        };
        let document: Value = response
            .into_json()
            .map_err(|io_error| BubbleError::IndexPayload {
                url,
                detail: io_error.to_string(),
            })?;
        Ok(parse_release_date(&document))
    }

    fn historical_versions(
        &self,
        dependency_list: &[String],
        cutoff: jiff::Timestamp,
    ) -> BTreeMap<String, Version> {
        let mut resolved = BTreeMap::new();
        for name in dependency_list {
            let url = format!("{}/{name}/json", self.index_base_url);
            let document: Option<Value> = self
                .agent
                .get(&url)
                .call()
                .ok()
                .and_then(|response| response.into_json().ok());
            match document.as_ref().and_then(|doc| latest_release_before(doc, cutoff)) {
                Some(version) => {
                    resolved.insert(name.clone(), version);
                }
                None => log_warning(
                    "Dependency left unpinned",
                    format!(
                        "No release of '{name}' on or before {cutoff} could be determined; \
                         the installer's own resolution will apply."
                    ),
                ),
            }
        }
        resolved
    }

    // --- staged installs ---

    fn dependency_shopping_list(&self, spec: &PackageSpec) -> Result<Vec<String>, BubbleError> {
        let probe_dir = tempfile::tempdir().map_err(|io_error| BubbleError::Staging {
            path: PathBuf::from("tempdir"),
            io_error,
        })?;
        if let Err(error) = self.install_to_target(&[spec.to_string()], probe_dir.path()) {
            self.mark_failed(spec, "deps-disabled probe install failed");
            return Err(BubbleError::StagingInstall(error));
        }

        let module = crate::names::module_name(&spec.name);
        let dist_info_path = probe_dir
            .path()
            .join(format!("{module}-{}.dist-info", spec.version));
        match dist_info::read_metadata(&dist_info_path) {
            Ok(metadata) => Ok(dependency_names(&metadata)),
            Err(error) => {
                // Unreadable dependency metadata means "no deps": the bubble
                // is still built, just without time-traveled pins.
                log_warning(
                    "Dependency metadata unreadable",
                    format!("{}: {}", error.path.display(), error.io_error),
                );
                Ok(Vec::new())
            }
        }
    }

    fn install_to_target(
        &self,
        pins: &[String],
        target: &Path,
    ) -> Result<(), CapturedCommandError> {
        let mut command = Command::new(&self.config.python_executable);
        command.args([
            "-m",
            "pip",
            "install",
            "--quiet",
            "--no-input",
            "--no-deps",
            "--target",
        ]);
        command.arg(target);
        command.args(pins);
        fs_utils::run_command_with_deadline(&mut command, INSTALLER_TIMEOUT).map(|_| ())
    }

    // --- verification ---

    /// Import-test the staged packages in a sterile subprocess whose
    /// `sys.path` is exactly the staging tree (plus the interpreter's own
    /// stdlib). A failing primary package discards the bubble; failing
    /// dependencies are warned about only.
    fn verify_staging(&self, spec: &PackageSpec, staging: &Path) -> Result<(), BubbleError> {
        let installed = dist_info::discover_distributions(staging).unwrap_or_default();

        let mut imports: Vec<(String, bool)> = Vec::new();
        let primary_imports = IMPORT_TEST_GROUPS
            .iter()
            .find(|(key, _)| *key == spec.name)
            .map(|(_, group)| group.iter().map(ToString::to_string).collect::<Vec<_>>());
        match primary_imports {
            Some(group) => imports.extend(group.into_iter().map(|name| (name, true))),
            None => imports.push((
                dist_info::import_name(
                    &staging.join(format!(
                        "{}-{}.dist-info",
                        crate::names::module_name(&spec.name),
                        spec.version
                    )),
                    &spec.name,
                ),
                true,
            )),
        }
        for distribution in &installed {
            if distribution.canonical_name == spec.name {
                continue;
            }
            let import = dist_info::import_name(
                &distribution.dist_info_path,
                &distribution.canonical_name,
            );
            if !imports.iter().any(|(existing, _)| *existing == import) {
                imports.push((import, false));
            }
        }

        for (import, is_primary) in imports {
            let probe = format!(
                "import sys; sys.path.insert(0, {path:?}); import {import}",
                path = staging.to_string_lossy(),
            );
            let result = fs_utils::run_command_with_deadline(
                Command::new(&self.config.python_executable).args(["-I", "-c", &probe]),
                IMPORT_PROBE_TIMEOUT,
            );
            match result {
                Ok(_) => {}
                Err(error) if is_primary => {
                    return Err(BubbleError::Verification {
                        spec: spec.clone(),
                        import,
                        detail: describe_command_error(&error),
                    });
                }
                Err(error) => log_warning(
                    "Dependency failed its import probe",
                    format!("'{import}': {}", describe_command_error(&error)),
                ),
            }
        }
        Ok(())
    }

    // --- deduplicated copy ---

    /// Copy the staging tree into `destination`, omitting pure-Python files
    /// whose hash already exists in the main environment. Native binaries
    /// and dist-info records are always copied in full.
    fn deduplicated_copy(&mut self, staging: &Path, destination: &Path) -> Result<u64, BubbleError> {
        let index = HashIndex::load_or_build(
            self.store,
            &self.config.kb_prefix(),
            &self.config.site_packages,
            &mut self.memo,
        );

        let mut copied_bytes = 0u64;
        let mut deduplicated = 0usize;
        for entry in WalkDir::new(staging)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(staging)
                .map_err(|_| BubbleError::Staging {
                    path: entry.path().to_path_buf(),
                    io_error: io::Error::new(io::ErrorKind::Other, "path escaped staging root"),
                })?;

            let in_dist_info = relative
                .components()
                .next()
                .is_some_and(|first| first.as_os_str().to_string_lossy().ends_with(".dist-info"));
            let must_copy = is_native_file(relative) || in_dist_info;

            if !must_copy {
                match self.memo.hash(entry.path()) {
                    // A hash hit alone is not enough: the index may hold
                    // stale hashes of files that have since been removed
                    // from the main env. Dedup only when the fallback file
                    // is actually still there; a stale entry costs a copy,
                    // never a missing file.
                    Ok(hash)
                        if index.contains(&hash)
                            && self.config.site_packages.join(relative).is_file() =>
                    {
                        deduplicated += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(io_error) => {
                        // Unreadable for hashing: treat as not dedup'd and
                        // let the copy surface any real problem.
                        log_warning(
                            "File hash failed",
                            format!("{}: {io_error}", entry.path().display()),
                        );
                    }
                }
            }

            let target = destination.join(relative);
            fs_utils::copy_file_with_dirs(entry.path(), &target).map_err(|io_error| {
                BubbleError::Staging {
                    path: target,
                    io_error,
                }
            })?;
            copied_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        log_info(format!(
            "Deduplicated {deduplicated} files against the main environment"
        ));
        Ok(copied_bytes)
    }

}

/// Extract `urls[0].upload_time_iso_8601` from a PyPI release document.
fn parse_release_date(document: &Value) -> Option<jiff::Timestamp> {
    let upload_time = document.get("urls")?.get(0)?.get("upload_time_iso_8601")?;
    upload_time.as_str()?.parse().ok()
}

/// From a PyPI project document, the greatest version whose first file was
/// uploaded at or before `cutoff`. Pre-releases are considered only when
/// nothing else qualifies.
fn latest_release_before(document: &Value, cutoff: jiff::Timestamp) -> Option<Version> {
    let releases = document.get("releases")?.as_object()?;
    let mut best: Option<Version> = None;
    let mut best_prerelease: Option<Version> = None;
    for (version_string, files) in releases {
        let Ok(version) = version_string.parse::<Version>() else {
            continue;
        };
        let Some(upload_time) = files
            .get(0)
            .and_then(|file| file.get("upload_time_iso_8601"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let Ok(uploaded) = upload_time.parse::<jiff::Timestamp>() else {
            continue;
        };
        if uploaded > cutoff {
            continue;
        }
        let slot = if version.pre.is_some() || version.dev.is_some() {
            &mut best_prerelease
        } else {
            &mut best
        };
        if slot.as_ref().map_or(true, |current| version > *current) {
            *slot = Some(version);
        }
    }
    best.or(best_prerelease)
}

fn manifest_packages(installed: &[Distribution]) -> BTreeMap<String, ManifestPackage> {
    let mut packages = BTreeMap::new();
    for distribution in installed {
        let metadata = dist_info::read_metadata(&distribution.dist_info_path).unwrap_or_default();
        packages.insert(
            distribution.canonical_name.clone(),
            ManifestPackage {
                version: distribution.version.to_string(),
                package_type: classify_package(distribution),
                summary: metadata.summary,
                license: metadata.license,
                home_page: metadata.home_page,
            },
        );
    }
    packages
}

/// Classify a package by the files its RECORD lists: any native extension
/// alongside Python sources makes it mixed, only native makes it native.
fn classify_package(distribution: &Distribution) -> PackageType {
    let files = dist_info::record_files(&distribution.dist_info_path).unwrap_or_default();
    let has_native = files.iter().any(|file| is_native_file(file));
    let has_python = files
        .iter()
        .any(|file| file.extension().is_some_and(|ext| ext == "py"));
    match (has_native, has_python) {
        (true, true) => PackageType::Mixed,
        (true, false) => PackageType::Native,
        _ => PackageType::PurePython,
    }
}

fn describe_command_error(error: &CapturedCommandError) -> String {
    match error {
        CapturedCommandError::Io(inner) => {
            format!("could not run {}: {}", inner.program, inner.io_error)
        }
        CapturedCommandError::NonZeroExitStatus(output) => format!(
            "exited {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        CapturedCommandError::TimedOut { timeout, .. } => {
            format!("timed out after {timeout:?}")
        }
    }
}

/// Errors that can occur while building a bubble.
#[derive(Debug)]
pub enum BubbleError {
    Index(ureq::Error),
    IndexPayload {
        url: String,
        detail: String,
    },
    InstallLockTimeout(LockAcquireError),
    Manifest(ManifestError),
    RecentlyFailed(PackageSpec),
    Registry(RegistryError),
    ReleaseDateUnavailable(PackageSpec),
    Staging {
        path: PathBuf,
        io_error: io::Error,
    },
    StagingInstall(CapturedCommandError),
    Verification {
        spec: PackageSpec,
        import: String,
        detail: String,
    },
}
