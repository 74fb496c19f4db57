//! Installer surgery scenarios driven by a scripted stand-in for the
//! external installer, so no network or real package index is involved.

#![cfg(unix)]

use omnipkg::{
    BubbleBuilder, BubbleManifest, Config, FailedVersionCache, InstallStrategy, KbStore,
    KnowledgeBase, ManifestPackage, PackageSpec, PackageType, PathRegistry, Surgeon,
};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn test_config(scratch: &Path) -> Config {
    let site = scratch.join("site-packages");
    fs::create_dir_all(&site).unwrap();
    let mut config = Config::new(fake_installer(scratch, &site), "3.11".to_string(), site);
    config.install_strategy = InstallStrategy::LatestActive;
    fs::create_dir_all(&config.bubble_root).unwrap();
    config
}

/// A stand-in for `python -m pip`: handles `install <spec>` by dropping a
/// dist-info into the site dir and `uninstall --yes <name>` by removing the
/// package's dist-infos. Everything else is a successful no-op.
fn fake_installer(scratch: &Path, site: &Path) -> PathBuf {
    let script_path = scratch.join("fake-python");
    let script = format!(
        r#"#!/usr/bin/env bash
set -euo pipefail
site={site:?}
args=("$@")
for ((i = 0; i < ${{#args[@]}}; i++)); do
    case "${{args[$i]}}" in
        install)
            spec="${{args[$((i + 1))]}}"
            name="${{spec%%==*}}"
            version="${{spec##*==}}"
            module="${{name//-/_}}"
            dist_info="$site/${{module}}-${{version}}.dist-info"
            # Replace any existing version of this package first.
            rm -rf "$site/${{module}}"-*.dist-info
            mkdir -p "$dist_info" "$site/$module"
            printf 'Name: %s\nVersion: %s\n' "$name" "$version" > "$dist_info/METADATA"
            printf '%s\n' "$module" > "$dist_info/top_level.txt"
            printf '%s/__init__.py,sha256=x,1\n' "$module" > "$dist_info/RECORD"
            touch "$site/$module/__init__.py"
            exit 0
            ;;
        uninstall)
            name="${{args[$((i + 2))]}}"
            module="${{name//-/_}}"
            rm -rf "$site/${{module}}"-*.dist-info "$site/$module"
            exit 0
            ;;
    esac
done
exit 0
"#,
        site = site.to_string_lossy(),
    );
    fs::write(&script_path, script).unwrap();
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();
    script_path
}

struct Harness {
    _scratch: tempfile::TempDir,
    config: Config,
    registry: PathRegistry,
    failed: FailedVersionCache,
    store: KbStore,
}

fn harness() -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let config = test_config(scratch.path());
    let registry = PathRegistry::new(&config.bubble_root);
    let failed = FailedVersionCache::new(&config.bubble_root);
    let store = KbStore::new(scratch.path());
    Harness {
        config,
        registry,
        failed,
        store,
        _scratch: scratch,
    }
}

fn surgeon(harness: &Harness) -> Surgeon<'_> {
    let knowledge_base = KnowledgeBase::new(&harness.store, &harness.config);
    let builder = BubbleBuilder::new(
        &harness.config,
        &harness.registry,
        &harness.failed,
        &harness.store,
    );
    Surgeon::new(
        &harness.config,
        &harness.registry,
        &harness.store,
        knowledge_base,
        builder,
    )
}

fn make_bubble(config: &Config, registry: &PathRegistry, canonical_name: &str, version: &str) {
    let bubble = config
        .bubble_root
        .join(format!("{canonical_name}-{version}"));
    fs::create_dir_all(&bubble).unwrap();
    BubbleManifest::new(
        BTreeMap::from([(
            canonical_name.to_string(),
            ManifestPackage {
                version: version.to_string(),
                package_type: PackageType::PurePython,
                summary: None,
                license: None,
                home_page: None,
            },
        )]),
        0,
    )
    .write(&bubble)
    .unwrap();
    registry
        .register(canonical_name, &version.parse().unwrap(), &bubble)
        .unwrap();
}

#[test]
fn new_package_goes_to_the_main_env() {
    let harness = harness();
    let mut surgeon = surgeon(&harness);

    let specs = [PackageSpec::parse("flask==3.0.0").unwrap()];
    let report = surgeon.smart_install(&specs).unwrap();
    assert_eq!(report.installed, specs.to_vec());
    assert!(report.bubbled.is_empty());

    // The fake installer landed it in site-packages, and the knowledge base
    // indexed the delta.
    assert!(harness
        .config
        .site_packages
        .join("flask-3.0.0.dist-info")
        .is_dir());
    let kb = KnowledgeBase::new(&harness.store, &harness.config);
    assert_eq!(kb.active_version("flask"), Some("3.0.0".to_string()));
}

#[test]
fn satisfied_specs_are_skipped() {
    let harness = harness();

    // Satisfied by an existing bubble: never reaches the installer.
    make_bubble(&harness.config, &harness.registry, "numpy", "1.24.3");
    let mut surgeon = surgeon(&harness);
    let specs = [PackageSpec::parse("numpy==1.24.3").unwrap()];
    let report = surgeon.smart_install(&specs).unwrap();
    assert_eq!(report.skipped, specs.to_vec());
    assert!(report.installed.is_empty());
}

#[test]
fn uninstall_routes_bubbles_and_main_env_differently() {
    let harness = harness();
    make_bubble(&harness.config, &harness.registry, "numpy", "1.24.3");
    let mut surgeon = surgeon(&harness);

    // Install one into the main env through the fake installer.
    surgeon
        .smart_install(&[PackageSpec::parse("flask==3.0.0").unwrap()])
        .unwrap();

    surgeon
        .smart_uninstall(&[
            PackageSpec::parse("numpy==1.24.3").unwrap(),
            PackageSpec::parse("flask==3.0.0").unwrap(),
        ])
        .unwrap();

    // The bubble directory is gone and so is the main-env installation.
    assert!(!harness.config.bubble_root.join("numpy-1.24.3").exists());
    assert!(!harness
        .config
        .site_packages
        .join("flask-3.0.0.dist-info")
        .exists());
    let kb = KnowledgeBase::new(&harness.store, &harness.config);
    assert_eq!(kb.active_version("flask"), None);
}

#[test]
fn last_known_good_snapshot_anchors_revert() {
    let harness = harness();
    let mut surgeon = surgeon(&harness);

    surgeon
        .smart_install(&[PackageSpec::parse("flask==3.0.0").unwrap()])
        .unwrap();

    // Drift the environment behind the surgeon's back, then revert.
    let site = &harness.config.site_packages;
    fs::remove_dir_all(site.join("flask-3.0.0.dist-info")).unwrap();
    fs::create_dir_all(site.join("stray_pkg-9.9.dist-info")).unwrap();
    fs::write(
        site.join("stray_pkg-9.9.dist-info/METADATA"),
        "Name: stray-pkg\nVersion: 9.9\n",
    )
    .unwrap();

    surgeon.revert().unwrap();
    assert!(site.join("flask-3.0.0.dist-info").is_dir());
    assert!(!site.join("stray_pkg-9.9.dist-info").exists());
}
