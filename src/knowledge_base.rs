use crate::config::Config;
use crate::dist_info::{
    self, dependency_names, parse_dist_info_dir_name, Distribution, ReadMetadataError,
};
use crate::fs_utils::{self, CapturedCommandError, WriteAtomicallyError};
use crate::kb_store::{
    compress_field, KbStore, KbStoreError, COMPRESSION_THRESHOLD, LARGE_TEXT_FIELDS,
};
use crate::names::{canonicalize_name, module_name, PackageSpec};
use crate::InstallerCapability;
use libherokubuildpack::log::{log_info, log_warning};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// The program run in a hyper-isolated child interpreter (`-I -S -E`) to
/// enumerate distributions. Isolation matters: the parent process may have
/// bubbles spliced into its own view of the world, and an in-process
/// enumeration would inherit that bias. The child sees exactly the search
/// paths it is handed and nothing else.
const DISCOVERY_SCRIPT: &str = r"
import importlib.metadata
import json
import sys

found = []
for dist in importlib.metadata.distributions(path=sys.argv[1:]):
    try:
        path = dist._path
    except AttributeError:
        continue
    if path is not None:
        found.append(str(path))
print(json.dumps(found))
";

/// Maintains the per-context package index: every discovered distribution's
/// version, dependencies, readable metadata and health, keyed by
/// `<prefix><name>[...]` so two interpreters sharing a host never collide.
pub struct KnowledgeBase<'a> {
    store: &'a KbStore,
    config: &'a Config,
    prefix: String,
}

/// What a sync pass did, including the self-heal reinstalls it scheduled.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed: usize,
    pub healed: Vec<PackageSpec>,
}

/// Executes the vulnerability scan over a requirements file, producing the
/// scanner's JSON report. The production implementation activates the
/// scanner's own bubble through the loader; tests substitute a stub.
pub trait ScanRunner {
    fn scan(&mut self, requirements_path: &Path) -> Result<String, ScanUnavailable>;
}

/// The scanner could not produce a report; scanning is skipped, never fatal.
#[derive(Debug)]
pub struct ScanUnavailable(pub String);

impl<'a> KnowledgeBase<'a> {
    pub fn new(store: &'a KbStore, config: &'a Config) -> Self {
        let prefix = config.kb_prefix();
        Self {
            store,
            config,
            prefix,
        }
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.prefix)
    }

    /// Enumerate distributions over `search_paths` via the isolated child
    /// interpreter. A child failure falls back to direct in-process
    /// discovery with a warning, which risks bias but never blocks a sync.
    pub fn discover(&self, search_paths: &[PathBuf]) -> Vec<Distribution> {
        match self.discover_via_subprocess(search_paths) {
            Ok(distributions) => distributions,
            Err(error) => {
                log_warning(
                    "Isolated discovery failed",
                    format!(
                        "The discovery subprocess did not complete ({error:?}); falling back \
                         to direct discovery, which may be contaminated by active bubbles."
                    ),
                );
                self.discover_directly(search_paths)
            }
        }
    }

    fn discover_via_subprocess(
        &self,
        search_paths: &[PathBuf],
    ) -> Result<Vec<Distribution>, CapturedCommandError> {
        let mut command = Command::new(&self.config.python_executable);
        command.args(["-I", "-S", "-E", "-c", DISCOVERY_SCRIPT]);
        for path in search_paths {
            command.arg(path);
        }
        let output = fs_utils::run_command_with_deadline(&mut command, DISCOVERY_TIMEOUT)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let dist_info_paths: Vec<PathBuf> =
            serde_json::from_str(stdout.trim()).unwrap_or_default();

        let mut distributions = Vec::new();
        for dist_info_path in dist_info_paths {
            let Some(dir_name) = dist_info_path.file_name().map(|n| n.to_string_lossy()) else {
                continue;
            };
            if dist_info::is_subcomponent(&dir_name) {
                continue;
            }
            let Some((name, version)) = parse_dist_info_dir_name(&dir_name) else {
                continue;
            };
            let site_dir = dist_info_path
                .parent()
                .map_or_else(PathBuf::new, Path::to_path_buf);
            distributions.push(Distribution {
                canonical_name: canonicalize_name(&name),
                name,
                version,
                dist_info_path,
                site_dir,
            });
        }
        Ok(distributions)
    }

    fn discover_directly(&self, search_paths: &[PathBuf]) -> Vec<Distribution> {
        let mut distributions = Vec::new();
        for path in search_paths {
            match dist_info::discover_distributions(path) {
                Ok(mut found) => distributions.append(&mut found),
                Err(error) => log_warning(
                    "Search path unreadable",
                    format!("{}: {}", error.site_dir.display(), error.io_error),
                ),
            }
        }
        distributions
    }

    /// Targeted discovery for explicit `name==version` specs: exact
    /// dist-info path, then normalized-name lookup, then a glob over the
    /// site dir, then the bubble directories, then a broad last-resort scan.
    pub(crate) fn discover_targeted(&self, specs: &[PackageSpec]) -> Vec<Distribution> {
        let site = &self.config.site_packages;
        let mut found = Vec::new();
        for spec in specs {
            let module = module_name(&spec.name);
            // Exact dist-info path.
            let exact = site.join(format!("{module}-{}.dist-info", spec.version));
            if exact.is_dir() {
                found.push(Distribution {
                    name: module.clone(),
                    canonical_name: spec.name.clone(),
                    version: spec.version.clone(),
                    dist_info_path: exact,
                    site_dir: site.clone(),
                });
                continue;
            }
            // Normalized-name lookup, then glob over dist-info names.
            if let Some(distribution) = self
                .match_in_dir(site, spec)
                .or_else(|| self.match_in_bubbles(spec))
                .or_else(|| self.broad_scan(spec))
            {
                found.push(distribution);
            } else {
                log_warning(
                    "Targeted discovery miss",
                    format!("No dist-info found anywhere for {spec}."),
                );
            }
        }
        found
    }

    fn match_in_dir(&self, dir: &Path, spec: &PackageSpec) -> Option<Distribution> {
        dist_info::discover_distributions(dir)
            .ok()?
            .into_iter()
            .find(|distribution| {
                distribution.canonical_name == spec.name && distribution.version == spec.version
            })
    }

    fn match_in_bubbles(&self, spec: &PackageSpec) -> Option<Distribution> {
        let bubble = self.config.bubble_root.join(spec.bubble_dir_name());
        self.match_in_dir(&bubble, spec)
    }

    fn broad_scan(&self, spec: &PackageSpec) -> Option<Distribution> {
        let entries = std::fs::read_dir(&self.config.bubble_root).ok()?;
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().is_dir() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if let Some(distribution) = self.match_in_dir(&entry.path(), spec) {
                return Some(distribution);
            }
        }
        None
    }

    /// Reconcile the index with the filesystem. With `targeted` set, only
    /// those specs are re-indexed (the install delta); otherwise everything
    /// discovered on the search paths is.
    ///
    /// Corrupt dist-infos (no readable Name) are scheduled for self-heal:
    /// reinstalled at the version parsed from the directory name when an
    /// installer capability is available.
    pub fn sync(
        &self,
        targeted: Option<&[PackageSpec]>,
        installer: Option<&dyn InstallerCapability>,
    ) -> Result<SyncReport, KnowledgeBaseError> {
        let distributions = match targeted {
            Some(specs) => self.discover_targeted(specs),
            None => {
                let mut search_paths = vec![self.config.site_packages.clone()];
                if let Ok(entries) = std::fs::read_dir(&self.config.bubble_root) {
                    for entry in entries.filter_map(Result::ok) {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if entry.path().is_dir() && !name.starts_with('.') {
                            search_paths.push(entry.path());
                        }
                    }
                }
                self.discover(&search_paths)
            }
        };

        let mut report = SyncReport::default();
        for distribution in distributions {
            match self.index_distribution(&distribution) {
                Ok(()) => report.indexed += 1,
                Err(KnowledgeBaseError::CorruptDistInfo { spec, .. }) => {
                    log_warning(
                        "Corrupt dist-info",
                        format!(
                            "{} has no readable Name; scheduling a self-heal reinstall of {spec}.",
                            distribution.dist_info_path.display()
                        ),
                    );
                    if let Some(installer) = installer {
                        if let Err(error) = installer.install(&[spec.clone()]) {
                            log_warning(
                                "Self-heal reinstall failed",
                                format!("{spec}: {error}"),
                            );
                        }
                    }
                    report.healed.push(spec);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(report)
    }

    fn index_distribution(&self, distribution: &Distribution) -> Result<(), KnowledgeBaseError> {
        let metadata = dist_info::read_metadata(&distribution.dist_info_path)
            .map_err(KnowledgeBaseError::ReadMetadata)?;
        if metadata.name.is_none() {
            return Err(KnowledgeBaseError::CorruptDistInfo {
                dist_info_path: distribution.dist_info_path.clone(),
                spec: PackageSpec {
                    name: distribution.canonical_name.clone(),
                    version: distribution.version.clone(),
                },
            });
        }

        let name = &distribution.canonical_name;
        let version = distribution.version.to_string();
        let in_bubble = distribution.site_dir != self.config.site_packages;

        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        fields.insert("name".to_string(), metadata.name.clone().unwrap_or_default());
        fields.insert("version".to_string(), version.clone());
        fields.insert(
            "path".to_string(),
            distribution.site_dir.to_string_lossy().to_string(),
        );
        for (field, value) in [
            ("summary", &metadata.summary),
            ("author", &metadata.author),
            ("license", &metadata.license),
            ("home_page", &metadata.home_page),
            ("requires_python", &metadata.requires_python),
        ] {
            if let Some(value) = value {
                fields.insert(field.to_string(), value.clone());
            }
        }
        fields.insert(
            "dependencies".to_string(),
            serde_json::to_string(&dependency_names(&metadata))
                .map_err(KnowledgeBaseError::Serialize)?,
        );
        if !metadata.description.is_empty() {
            fields.insert("description".to_string(), metadata.description.clone());
        }

        // Large text fields are zlib-compressed and hex-encoded, with a
        // sibling marker so readers know to inflate them.
        for field in LARGE_TEXT_FIELDS {
            let Some(value) = fields.get(field) else {
                continue;
            };
            if value.len() > COMPRESSION_THRESHOLD {
                match compress_field(value) {
                    Ok(compressed) => {
                        fields.insert(field.to_string(), compressed);
                        fields.insert(format!("{field}_compressed"), "true".to_string());
                    }
                    Err(io_error) => log_warning(
                        "Field compression failed",
                        format!("{name} {field}: {io_error}"),
                    ),
                }
            }
        }

        fields.insert("checksum".to_string(), entry_checksum(&fields));

        let version_key = self.key(&format!("{name}:{version}"));
        self.store
            .hash_set_all(&version_key, &fields)
            .map_err(KnowledgeBaseError::Store)?;

        let package_key = self.key(name);
        if in_bubble {
            self.store
                .hash_set_field(
                    &package_key,
                    &format!("bubble:{version}"),
                    &distribution.site_dir.to_string_lossy(),
                )
                .map_err(KnowledgeBaseError::Store)?;
        } else {
            self.store
                .hash_set_field(&package_key, "active_version", &version)
                .map_err(KnowledgeBaseError::Store)?;
        }
        self.store
            .set_add(
                &self.key(&format!("{name}:installed_versions")),
                &[version],
            )
            .map_err(KnowledgeBaseError::Store)?;
        self.store
            .set_add(&self.key("index"), &[name.clone()])
            .map_err(KnowledgeBaseError::Store)?;
        Ok(())
    }

    /// Drop every key in this environment's context. The next sync rebuilds
    /// the index from the filesystem; other interpreters' contexts are
    /// untouched.
    pub fn reset(&self) -> Result<(), KnowledgeBaseError> {
        self.store
            .delete_keys_with_prefix(&self.prefix)
            .map_err(KnowledgeBaseError::Store)
    }

    /// The version currently indexed as active in the main environment.
    pub fn active_version(&self, name: &str) -> Option<String> {
        self.store
            .hash_get_field(&self.key(&canonicalize_name(name)), "active_version")
    }

    /// Remove everything indexed for `(name, version)`, including the bubble
    /// flag and the membership records.
    pub fn purge_version(&self, spec: &PackageSpec) -> Result<(), KnowledgeBaseError> {
        let version = spec.version.to_string();
        self.store
            .delete_key(&self.key(&format!("{}:{version}", spec.name)))
            .map_err(KnowledgeBaseError::Store)?;
        self.store
            .set_remove(
                &self.key(&format!("{}:installed_versions", spec.name)),
                &[version.clone()],
            )
            .map_err(KnowledgeBaseError::Store)?;
        let package_key = self.key(&spec.name);
        let mut remaining = self.store.hash_get_all(&package_key);
        remaining.remove(&format!("bubble:{version}"));
        if remaining.get("active_version") == Some(&version) {
            remaining.remove("active_version");
        }
        self.store
            .delete_key(&package_key)
            .map_err(KnowledgeBaseError::Store)?;
        if !remaining.is_empty() {
            self.store
                .hash_set_all(&package_key, &remaining)
                .map_err(KnowledgeBaseError::Store)?;
        }
        if self
            .store
            .set_members(&self.key(&format!("{}:installed_versions", spec.name)))
            .is_empty()
        {
            self.store
                .set_remove(&self.key("index"), &[spec.name.clone()])
                .map_err(KnowledgeBaseError::Store)?;
        }
        Ok(())
    }

    /// Store a snapshot of the main environment under `last_known_good`,
    /// used by the surgeon's revert plan.
    pub(crate) fn save_snapshot(
        &self,
        snapshot: &BTreeMap<String, crate::version::Version>,
    ) -> Result<(), KnowledgeBaseError> {
        let fields: BTreeMap<String, String> = snapshot
            .iter()
            .map(|(name, version)| (name.clone(), version.to_string()))
            .collect();
        let key = self.key("last_known_good");
        self.store.delete_key(&key).map_err(KnowledgeBaseError::Store)?;
        self.store
            .hash_set_all(&key, &fields)
            .map_err(KnowledgeBaseError::Store)
    }

    pub(crate) fn load_snapshot(&self) -> BTreeMap<String, crate::version::Version> {
        self.store
            .hash_get_all(&self.key("last_known_good"))
            .into_iter()
            .filter_map(|(name, version)| Some((name, version.parse().ok()?)))
            .collect()
    }

    /// Run the vulnerability scan over the active (non-bubbled) packages and
    /// store the per-package results. The scanner itself lives in a bubble
    /// and is executed through `runner`, so scanning never perturbs the main
    /// environment.
    pub fn security_scan(
        &self,
        active_packages: &BTreeMap<String, crate::version::Version>,
        runner: &mut dyn ScanRunner,
    ) -> Result<(), KnowledgeBaseError> {
        let requirements = active_packages
            .iter()
            .map(|(name, version)| format!("{name}=={version}"))
            .collect::<Vec<String>>()
            .join("\n");
        let scratch = tempfile::tempdir().map_err(|io_error| {
            KnowledgeBaseError::Write(WriteAtomicallyError {
                io_error,
                path: PathBuf::from("security-scan"),
            })
        })?;
        let requirements_path = scratch.path().join("requirements.txt");
        fs_utils::write_atomically(&requirements_path, requirements.as_bytes())
            .map_err(KnowledgeBaseError::Write)?;

        let report = match runner.scan(&requirements_path) {
            Ok(report) => report,
            Err(ScanUnavailable(detail)) => {
                log_warning(
                    "Security scan unavailable",
                    format!("The scanner did not produce a report: {detail}"),
                );
                return Ok(());
            }
        };

        // The report maps canonical names to issue lists; anything the
        // scanner flags is stored verbatim on the (package, version) entry.
        let parsed: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&report).unwrap_or_default();
        for (name, version) in active_packages {
            let issues = parsed
                .get(name)
                .map(ToString::to_string)
                .unwrap_or_else(|| "[]".to_string());
            self.store
                .hash_set_field(
                    &self.key(&format!("{name}:{version}")),
                    "security_issues",
                    &issues,
                )
                .map_err(KnowledgeBaseError::Store)?;
        }
        log_info(format!(
            "Security scan stored for {} active packages",
            active_packages.len()
        ));
        Ok(())
    }
}

/// Checksum of an index entry: SHA-256 over the sorted `field=value` pairs.
/// Lets consumers detect torn or tampered entries without re-reading disk.
fn entry_checksum(fields: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (field, value) in fields {
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Errors that can occur while synchronizing the knowledge base.
#[derive(Debug)]
pub enum KnowledgeBaseError {
    CorruptDistInfo {
        dist_info_path: PathBuf,
        spec: PackageSpec,
    },
    ReadMetadata(ReadMetadataError),
    Serialize(serde_json::Error),
    Store(KbStoreError),
    Write(WriteAtomicallyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;

    fn fixture(scratch: &Path) -> (Config, KbStore) {
        let site = scratch.join("site-packages");
        fs::create_dir_all(&site).unwrap();
        let config = Config::new(PathBuf::from("/usr/bin/python3"), "3.11".to_string(), site);
        fs::create_dir_all(&config.bubble_root).unwrap();
        let store = KbStore::new(scratch);
        (config, store)
    }

    fn write_dist_info(dir: &Path, name: &str, version: &str, extra_metadata: &str) {
        let dist_info = dir.join(format!(
            "{}-{version}.dist-info",
            name.to_lowercase().replace('-', "_")
        ));
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(
            dist_info.join("METADATA"),
            format!("Name: {name}\nVersion: {version}\n{extra_metadata}"),
        )
        .unwrap();
    }

    #[test]
    fn sync_indexes_main_env_and_bubbles() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        write_dist_info(&config.site_packages, "rich", "13.7.0", "Summary: terminal output\n");
        let bubble = config.bubble_root.join("rich-13.4.2");
        fs::create_dir_all(&bubble).unwrap();
        write_dist_info(&bubble, "rich", "13.4.2", "");

        let kb = KnowledgeBase::new(&store, &config);
        // The isolated interpreter is absent in tests, so sync exercises the
        // direct-discovery fallback path.
        let report = kb.sync(None, None).unwrap();
        assert_eq!(report.indexed, 2);
        assert!(report.healed.is_empty());

        assert_eq!(kb.active_version("rich"), Some("13.7.0".to_string()));
        let package = store.hash_get_all(&kb.key("rich"));
        assert_eq!(
            package.get("bubble:13.4.2"),
            Some(&bubble.to_string_lossy().to_string())
        );
        let versions = store.set_members(&kb.key("rich:installed_versions"));
        assert!(versions.contains("13.7.0") && versions.contains("13.4.2"));
        assert!(store.set_contains(&kb.key("index"), "rich"));

        let entry = store.hash_get_all(&kb.key("rich:13.7.0"));
        assert_eq!(entry.get("summary"), Some(&"terminal output".to_string()));
        assert!(entry.contains_key("checksum"));
    }

    #[test]
    fn sync_compresses_large_descriptions() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        let description = "A very long description. ".repeat(100);
        write_dist_info(
            &config.site_packages,
            "verbose-pkg",
            "1.0",
            &format!("\n{description}"),
        );

        let kb = KnowledgeBase::new(&store, &config);
        kb.sync(None, None).unwrap();
        let entry = store.hash_get_all(&kb.key("verbose-pkg:1.0"));
        assert_eq!(entry.get("description_compressed"), Some(&"true".to_string()));
        let stored = entry.get("description").unwrap();
        assert!(stored.len() < description.len());
        assert_eq!(
            crate::kb_store::decompress_field(stored).unwrap().trim(),
            description.trim()
        );
    }

    #[test]
    fn sync_schedules_self_heal_for_corrupt_dist_info() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        // METADATA exists but carries no Name header.
        let dist_info = config.site_packages.join("broken_pkg-2.5.dist-info");
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(dist_info.join("METADATA"), "Metadata-Version: 2.1\n").unwrap();

        let kb = KnowledgeBase::new(&store, &config);
        let report = kb.sync(None, None).unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(
            report.healed,
            vec![PackageSpec::parse("broken-pkg==2.5").unwrap()]
        );
    }

    #[test]
    fn targeted_discovery_walks_the_fallback_chain() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        // Present only inside a bubble, so the exact and site lookups miss.
        let bubble = config.bubble_root.join("numpy-1.24.3");
        fs::create_dir_all(&bubble).unwrap();
        write_dist_info(&bubble, "numpy", "1.24.3", "");

        let kb = KnowledgeBase::new(&store, &config);
        let specs = [PackageSpec::parse("numpy==1.24.3").unwrap()];
        let found = kb.discover_targeted(&specs);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].site_dir, bubble);

        // A spec that exists nowhere is reported as a miss, not an error.
        let missing = [PackageSpec::parse("nowhere==9.9").unwrap()];
        assert!(kb.discover_targeted(&missing).is_empty());
    }

    #[test]
    fn purge_version_removes_all_traces() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        write_dist_info(&config.site_packages, "rich", "13.7.0", "");
        let kb = KnowledgeBase::new(&store, &config);
        kb.sync(None, None).unwrap();

        kb.purge_version(&PackageSpec::parse("rich==13.7.0").unwrap()).unwrap();
        assert!(store.hash_get_all(&kb.key("rich:13.7.0")).is_empty());
        assert!(store.set_members(&kb.key("rich:installed_versions")).is_empty());
        assert!(!store.set_contains(&kb.key("index"), "rich"));
        assert_eq!(kb.active_version("rich"), None);
    }

    #[test]
    fn snapshot_round_trips() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        let kb = KnowledgeBase::new(&store, &config);
        let snapshot = BTreeMap::from([
            ("numpy".to_string(), "2.3.5".parse().unwrap()),
            ("rich".to_string(), "13.7.0".parse().unwrap()),
        ]);
        kb.save_snapshot(&snapshot).unwrap();
        assert_eq!(kb.load_snapshot(), snapshot);
    }

    #[test]
    fn security_scan_stores_results_per_package() {
        struct StubRunner;
        impl ScanRunner for StubRunner {
            fn scan(&mut self, _requirements_path: &Path) -> Result<String, ScanUnavailable> {
                Ok(r#"{"requests": [{"id": "CVE-2024-0001", "severity": "high"}]}"#.to_string())
            }
        }

        let scratch = tempfile::tempdir().unwrap();
        let (config, store) = fixture(scratch.path());
        let kb = KnowledgeBase::new(&store, &config);
        let active = BTreeMap::from([
            ("requests".to_string(), "2.31.0".parse().unwrap()),
            ("rich".to_string(), "13.7.0".parse().unwrap()),
        ]);
        kb.security_scan(&active, &mut StubRunner).unwrap();

        let flagged = store.hash_get_field(&kb.key("requests:2.31.0"), "security_issues").unwrap();
        assert!(flagged.contains("CVE-2024-0001"));
        assert_eq!(
            store.hash_get_field(&kb.key("rich:13.7.0"), "security_issues"),
            Some("[]".to_string())
        );
    }
}
