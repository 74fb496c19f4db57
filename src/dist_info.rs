use crate::names::{canonicalize_name, module_name, KNOWN_IMPORT_NAMES};
use crate::version::Version;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Distributions that are shipped as sub-components of an umbrella package
/// and must not be treated as independently installable. Matched by prefix
/// against the dist-info directory name.
pub(crate) const SUBCOMPONENT_PREFIXES: [&str; 2] =
    ["tensorboard_data_server-", "tensorboard_plugin_"];

/// A discovered installed distribution: the parsed identity plus where its
/// `.dist-info` directory lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Distribution {
    /// The name as it appears in the dist-info directory name.
    pub name: String,
    pub canonical_name: String,
    pub version: Version,
    pub dist_info_path: PathBuf,
    /// The site directory (or bubble directory) the distribution lives in.
    pub site_dir: PathBuf,
}

/// Parse `<name>-<version>` out of a `.dist-info` (or `.egg-info`) directory
/// name. Returns `None` for names that don't follow the convention.
pub(crate) fn parse_dist_info_dir_name(dir_name: &str) -> Option<(String, Version)> {
    let stem = dir_name
        .strip_suffix(".dist-info")
        .or_else(|| dir_name.strip_suffix(".egg-info"))?;
    let (name, version) = stem.rsplit_once('-')?;
    let version = version.parse().ok()?;
    Some((name.to_string(), version))
}

/// Whether this dist-info directory belongs to a known umbrella
/// sub-component that discovery should skip.
pub(crate) fn is_subcomponent(dist_info_dir_name: &str) -> bool {
    SUBCOMPONENT_PREFIXES
        .iter()
        .any(|prefix| dist_info_dir_name.starts_with(prefix))
}

/// Enumerate every distribution in `site_dir` by scanning for `.dist-info`
/// directories. Umbrella sub-components are skipped; directories whose name
/// doesn't parse are ignored (they get picked up by the knowledge base's
/// self-heal path instead).
pub(crate) fn discover_distributions(site_dir: &Path) -> Result<Vec<Distribution>, DiscoverError> {
    let entries = fs::read_dir(site_dir).map_err(|io_error| DiscoverError {
        io_error,
        site_dir: site_dir.to_path_buf(),
    })?;

    let mut distributions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|io_error| DiscoverError {
            io_error,
            site_dir: site_dir.to_path_buf(),
        })?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.ends_with(".dist-info") || !entry.path().is_dir() {
            continue;
        }
        if is_subcomponent(&file_name) {
            continue;
        }
        if let Some((name, version)) = parse_dist_info_dir_name(&file_name) {
            distributions.push(Distribution {
                canonical_name: canonicalize_name(&name),
                name,
                version,
                dist_info_path: entry.path(),
                site_dir: site_dir.to_path_buf(),
            });
        }
    }
    distributions.sort_by(|a, b| a.canonical_name.cmp(&b.canonical_name));
    Ok(distributions)
}

/// A snapshot of the installed package set: canonical name to version.
/// When several versions of one name are present (which only happens with a
/// damaged environment), the newest wins.
pub(crate) fn snapshot_versions(site_dir: &Path) -> Result<BTreeMap<String, Version>, DiscoverError> {
    let mut snapshot: BTreeMap<String, Version> = BTreeMap::new();
    for distribution in discover_distributions(site_dir)? {
        match snapshot.get(&distribution.canonical_name) {
            Some(existing) if *existing >= distribution.version => {}
            _ => {
                snapshot.insert(distribution.canonical_name, distribution.version);
            }
        }
    }
    Ok(snapshot)
}

/// Find the installed distribution for `name` in `site_dir`, if any.
pub(crate) fn find_distribution(
    site_dir: &Path,
    name: &str,
) -> Result<Option<Distribution>, DiscoverError> {
    let canonical_name = canonicalize_name(name);
    Ok(discover_distributions(site_dir)?
        .into_iter()
        .find(|distribution| distribution.canonical_name == canonical_name))
}

/// An I/O error that occurred while scanning a site directory.
#[derive(Debug)]
pub struct DiscoverError {
    pub(crate) io_error: io::Error,
    pub(crate) site_dir: PathBuf,
}

/// The readable subset of a distribution's `METADATA` file, plus the
/// declared dependency list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub home_page: Option<String>,
    pub requires_python: Option<String>,
    pub requires_dist: Vec<String>,
    /// The long description (the message body after the headers).
    pub description: String,
}

/// Parse the RFC 822-style `METADATA` document inside a dist-info directory.
pub(crate) fn read_metadata(dist_info_path: &Path) -> Result<DistMetadata, ReadMetadataError> {
    let metadata_path = dist_info_path.join("METADATA");
    let contents = fs::read_to_string(&metadata_path).map_err(|io_error| ReadMetadataError {
        io_error,
        path: metadata_path,
    })?;
    Ok(parse_metadata(&contents))
}

pub(crate) fn parse_metadata(contents: &str) -> DistMetadata {
    let mut metadata = DistMetadata::default();
    let mut lines = contents.lines();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        // Continuation lines only occur in fields we don't collect.
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match field.to_ascii_lowercase().as_str() {
            "name" => metadata.name = Some(value.to_string()),
            "version" => metadata.version = Some(value.to_string()),
            "summary" => metadata.summary = Some(value.to_string()),
            "author" => metadata.author = Some(value.to_string()),
            "license" | "license-expression" => metadata.license = Some(value.to_string()),
            "home-page" => metadata.home_page = Some(value.to_string()),
            "requires-python" => metadata.requires_python = Some(value.to_string()),
            "requires-dist" => metadata.requires_dist.push(value.to_string()),
            _ => {}
        }
    }
    metadata.description = lines.collect::<Vec<&str>>().join("\n");
    metadata
}

/// The canonical names of a distribution's declared runtime dependencies,
/// with extras-conditional requirements (`; extra == "..."`) excluded.
pub(crate) fn dependency_names(metadata: &DistMetadata) -> Vec<String> {
    let mut names = Vec::new();
    for requirement in &metadata.requires_dist {
        if let Some((_, marker)) = requirement.split_once(';') {
            if marker.contains("extra") {
                continue;
            }
        }
        let name_end = requirement
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(requirement.len());
        let name = canonicalize_name(&requirement[..name_end]);
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// The relative file paths recorded in a dist-info's `RECORD` file.
pub(crate) fn record_files(dist_info_path: &Path) -> Result<Vec<PathBuf>, ReadMetadataError> {
    let record_path = dist_info_path.join("RECORD");
    let contents = fs::read_to_string(&record_path).map_err(|io_error| ReadMetadataError {
        io_error,
        path: record_path,
    })?;
    Ok(contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(record_line_path)
        .map(PathBuf::from)
        .collect())
}

/// Extract the path column from a RECORD line. Paths containing commas are
/// quoted per the CSV rules, everything else is a plain prefix.
fn record_line_path(line: &str) -> String {
    if let Some(quoted) = line.strip_prefix('"') {
        if let Some(end) = quoted.find('"') {
            return quoted[..end].replace("\"\"", "\"");
        }
    }
    line.split(',').next().unwrap_or(line).to_string()
}

/// An I/O error that occurred while reading a dist-info metadata file.
#[derive(Debug)]
pub struct ReadMetadataError {
    pub(crate) io_error: io::Error,
    pub(crate) path: PathBuf,
}

/// Resolve the true import name of a distribution: `top_level.txt` first,
/// then the first importable path in `RECORD`, then the known-mappings
/// table, and as a last resort the hyphens-to-underscores transformation.
pub(crate) fn import_name(dist_info_path: &Path, canonical_name: &str) -> String {
    if let Ok(contents) = fs::read_to_string(dist_info_path.join("top_level.txt")) {
        if let Some(import_name) = contents.lines().map(str::trim).find(|line| !line.is_empty()) {
            return import_name.to_string();
        }
    }

    if let Ok(files) = record_files(dist_info_path) {
        if let Some(import_name) = import_name_from_record(&files) {
            return import_name;
        }
    }

    for (name, import_name) in KNOWN_IMPORT_NAMES {
        if name == canonical_name {
            return import_name.to_string();
        }
    }

    module_name(canonical_name)
}

fn import_name_from_record(files: &[PathBuf]) -> Option<String> {
    // A package directory: the first component of any `<pkg>/__init__.py`.
    for file in files {
        let mut components = file.components();
        let first = components.next()?.as_os_str().to_string_lossy().to_string();
        if file.ends_with("__init__.py") && !first.ends_with(".dist-info") && !first.contains('.') {
            return Some(first);
        }
    }
    // A single-file module at the top level.
    files.iter().find_map(|file| {
        let name = file.to_string_lossy();
        (file.components().count() == 1)
            .then(|| name.strip_suffix(".py").map(ToString::to_string))
            .flatten()
    })
}
