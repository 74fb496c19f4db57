use crate::bubble::{BubbleBuilder, BubbleError};
use crate::config::{Config, InstallStrategy};
use crate::dist_info::{self, DiscoverError};
use crate::fs_utils::{self, CapturedCommandError};
use crate::hash_index::{HashIndex, HashMemo};
use crate::kb_store::KbStore;
use crate::knowledge_base::{KnowledgeBase, KnowledgeBaseError};
use crate::names::{canonicalize_name, PackageSpec};
use crate::registry::PathRegistry;
use crate::version::Version;
use libherokubuildpack::log::{log_header, log_info, log_warning};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

const INSTALLER_TIMEOUT: Duration = Duration::from_secs(600);

/// What `smart_install` did with each requested spec.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Installed into the main environment by the external installer.
    pub installed: Vec<PackageSpec>,
    /// Served by building (or reusing) a bubble.
    pub bubbled: Vec<PackageSpec>,
    /// Already satisfied; nothing was done.
    pub skipped: Vec<PackageSpec>,
    /// Collateral downgrades that were bubbled and then restored.
    pub restored: Vec<PackageSpec>,
}

/// Wraps the external installer with downgrade surgery: whatever the
/// installer clobbers is re-homed into a bubble and the main environment is
/// put back the way it was.
pub struct Surgeon<'a> {
    config: &'a Config,
    registry: &'a PathRegistry,
    store: &'a KbStore,
    knowledge_base: KnowledgeBase<'a>,
    builder: BubbleBuilder<'a>,
    memo: HashMemo,
}

impl<'a> Surgeon<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a PathRegistry,
        store: &'a KbStore,
        knowledge_base: KnowledgeBase<'a>,
        builder: BubbleBuilder<'a>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            knowledge_base,
            builder,
            memo: HashMemo::new(),
        }
    }

    /// Install `specs`, protecting the main environment from downgrades.
    ///
    /// Requested versions older than the active one go straight to a bubble;
    /// the installer never touches the main env for them. Everything else is
    /// installed normally, after which any collaterally downgraded package
    /// is bubbled at the downgraded version and restored to its prior one.
    pub fn smart_install(&mut self, specs: &[PackageSpec]) -> Result<InstallReport, SurgeonError> {
        let mut report = InstallReport::default();

        // Newest-first, so a multi-spec request settles the newest version
        // into the main env and bubbles the rest.
        let mut ordered: Vec<PackageSpec> = specs.to_vec();
        ordered.sort_by(|a, b| b.version.cmp(&a.version));

        for spec in &ordered {
            let snapshot = self.snapshot_main_env()?;
            let active = snapshot.get(&spec.name);

            if self.is_satisfied(spec, active) {
                log_info(format!("{spec} is already satisfied"));
                report.skipped.push(spec.clone());
                continue;
            }

            let bubble_is_target = match active {
                // An older version than the active one never touches the
                // main env, regardless of strategy.
                Some(active_version) if spec.version < *active_version => true,
                // Under `stable-main`, a newer version is bubbled too: the
                // active version keeps the main env. `latest-active` lets
                // the installer replace it (with downgrade surgery below).
                Some(_) => matches!(self.config.install_strategy, InstallStrategy::StableMain),
                None => false,
            };
            if bubble_is_target {
                log_header(format!("Bubbling {spec} (older than the active version)"));
                self.builder.create(spec).map_err(SurgeonError::Bubble)?;
                report.bubbled.push(spec.clone());
                continue;
            }

            log_header(format!("Installing {spec}"));
            self.run_installer(&["install", &spec.to_string()])
                .map_err(SurgeonError::Installer)?;
            let after = self.snapshot_main_env()?;
            report.installed.push(spec.clone());

            // Downgrade surgery: restore anything the installer pulled
            // backwards, preserving the older version in a bubble first.
            for downgrade in detect_downgrades(&snapshot, &after) {
                log_warning(
                    "Collateral downgrade detected",
                    format!(
                        "'{}' went from {} to {}; bubbling the older version and restoring.",
                        downgrade.name, downgrade.before, downgrade.after
                    ),
                );
                let downgraded = PackageSpec {
                    name: downgrade.name.clone(),
                    version: downgrade.after.clone(),
                };
                self.builder.create(&downgraded).map_err(SurgeonError::Bubble)?;
                let restore = PackageSpec {
                    name: downgrade.name.clone(),
                    version: downgrade.before.clone(),
                };
                self.run_installer(&["install", &restore.to_string()])
                    .map_err(SurgeonError::Installer)?;
                report.restored.push(restore);
            }

            self.reconcile_after_change(&snapshot)?;
        }

        // The environment is settled: save it as the revert anchor.
        let settled = self.snapshot_main_env()?;
        self.knowledge_base
            .save_snapshot(&settled)
            .map_err(SurgeonError::KnowledgeBase)?;
        Ok(report)
    }

    /// Uninstall `specs`: active installations go through the external
    /// uninstaller, bubbled installations are removed by deleting the bubble
    /// directory. KB entries for the affected versions are purged either way.
    pub fn smart_uninstall(&mut self, specs: &[PackageSpec]) -> Result<(), SurgeonError> {
        for spec in specs {
            let active = self.snapshot_main_env()?.get(&spec.name).cloned();
            if active.as_ref() == Some(&spec.version) {
                log_header(format!("Uninstalling {spec} from the main environment"));
                self.run_installer(&["uninstall", "--yes", &spec.name])
                    .map_err(SurgeonError::Installer)?;
            } else if self
                .registry
                .get_bubble_path(&spec.name, &spec.version)
                .is_some()
            {
                log_header(format!("Removing bubble for {spec}"));
                self.builder.destroy(spec).map_err(SurgeonError::Bubble)?;
            } else {
                log_info(format!("{spec} is not installed; nothing to do"));
                continue;
            }
            self.knowledge_base
                .purge_version(spec)
                .map_err(SurgeonError::KnowledgeBase)?;
        }
        Ok(())
    }

    /// Diff the live environment against the last-known-good snapshot and
    /// apply the uninstall/install plan that takes it back there.
    pub fn revert(&mut self) -> Result<(), SurgeonError> {
        let target = self.knowledge_base.load_snapshot();
        if target.is_empty() {
            log_warning(
                "No revert anchor",
                "No last-known-good snapshot has been saved yet; nothing to revert to."
                    .to_string(),
            );
            return Ok(());
        }
        let current = self.snapshot_main_env()?;

        let mut to_remove: Vec<String> = Vec::new();
        let mut to_install: Vec<PackageSpec> = Vec::new();
        for (name, version) in &current {
            if !target.contains_key(name) {
                to_remove.push(name.clone());
            } else if target[name] != *version {
                to_install.push(PackageSpec {
                    name: name.clone(),
                    version: target[name].clone(),
                });
            }
        }
        for (name, version) in &target {
            if !current.contains_key(name) {
                to_install.push(PackageSpec {
                    name: name.clone(),
                    version: version.clone(),
                });
            }
        }

        log_header(format!(
            "Reverting: {} removals, {} installs",
            to_remove.len(),
            to_install.len()
        ));
        for name in to_remove {
            self.run_installer(&["uninstall", "--yes", &name])
                .map_err(SurgeonError::Installer)?;
        }
        for spec in to_install {
            self.run_installer(&["install", &spec.to_string()])
                .map_err(SurgeonError::Installer)?;
        }
        Ok(())
    }

    /// Whether the spec is satisfied by the main env or an existing bubble.
    /// Answered from dist-info scanning; installer dry-runs are advisory
    /// only and never consulted here.
    fn is_satisfied(&self, spec: &PackageSpec, active: Option<&Version>) -> bool {
        if active == Some(&spec.version) {
            return true;
        }
        self.registry
            .get_bubble_path(&spec.name, &spec.version)
            .is_some()
    }

    pub(crate) fn snapshot_main_env(&self) -> Result<BTreeMap<String, Version>, SurgeonError> {
        dist_info::snapshot_versions(&self.config.site_packages).map_err(SurgeonError::Discover)
    }

    /// After the main env changed: update the hash index incrementally and
    /// re-index only the delta in the knowledge base.
    fn reconcile_after_change(
        &mut self,
        before: &BTreeMap<String, Version>,
    ) -> Result<(), SurgeonError> {
        let after = self.snapshot_main_env()?;

        // Files belonging to the changed distributions, for the index delta.
        let mut added_files: Vec<PathBuf> = Vec::new();
        let mut changed: Vec<PackageSpec> = Vec::new();
        for (name, version) in &after {
            if before.get(name) != Some(version) {
                changed.push(PackageSpec {
                    name: name.clone(),
                    version: version.clone(),
                });
                if let Ok(Some(distribution)) =
                    dist_info::find_distribution(&self.config.site_packages, name)
                {
                    if let Ok(files) = dist_info::record_files(&distribution.dist_info_path) {
                        added_files.extend(
                            files
                                .iter()
                                .map(|relative| self.config.site_packages.join(relative))
                                .filter(|path| path.is_file()),
                        );
                    }
                }
            }
        }

        let mut index = HashIndex::load_or_build(
            self.store,
            &self.config.kb_prefix(),
            &self.config.site_packages,
            &mut self.memo,
        );
        // Removed files' hashes are unknowable after the fact; stale hashes
        // only cost unnecessary copies and are trimmed by the next rebuild.
        index.apply_delta(
            self.store,
            &self.config.kb_prefix(),
            &added_files,
            &[],
            &mut self.memo,
        );

        if !changed.is_empty() {
            self.knowledge_base
                .sync(Some(&changed), None)
                .map_err(SurgeonError::KnowledgeBase)?;
        }
        Ok(())
    }

    fn run_installer(&self, arguments: &[&str]) -> Result<(), CapturedCommandError> {
        let mut command = Command::new(&self.config.python_executable);
        command.args(["-m", "pip", "--quiet", "--no-input"]);
        command.args(arguments);
        fs_utils::run_command_with_deadline(&mut command, INSTALLER_TIMEOUT).map(|_| ())
    }
}

/// A package whose version moved backwards across an installer run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Downgrade {
    pub(crate) name: String,
    pub(crate) before: Version,
    pub(crate) after: Version,
}

/// Compare two environment snapshots and report every version decrease.
pub(crate) fn detect_downgrades(
    before: &BTreeMap<String, Version>,
    after: &BTreeMap<String, Version>,
) -> Vec<Downgrade> {
    let mut downgrades = Vec::new();
    for (name, after_version) in after {
        if let Some(before_version) = before.get(name) {
            if after_version < before_version {
                downgrades.push(Downgrade {
                    name: name.clone(),
                    before: before_version.clone(),
                    after: after_version.clone(),
                });
            }
        }
    }
    downgrades
}

/// Parse user-supplied requirement strings, rejecting anything unpinned:
/// the surgeon only reasons about exact versions.
pub fn parse_install_specs(raw_specs: &[String]) -> Result<Vec<PackageSpec>, SurgeonError> {
    raw_specs
        .iter()
        .map(|raw| {
            PackageSpec::parse(raw).map_err(|_| SurgeonError::UnpinnedSpec {
                spec: raw.clone(),
                canonical_name: canonicalize_name(raw.split(['=', '<', '>', '!']).next().unwrap_or(raw)),
            })
        })
        .collect()
}

/// Errors that can occur during installer surgery.
#[derive(Debug)]
pub enum SurgeonError {
    Bubble(BubbleError),
    Discover(DiscoverError),
    Installer(CapturedCommandError),
    KnowledgeBase(KnowledgeBaseError),
    UnpinnedSpec {
        spec: String,
        canonical_name: String,
    },
}
