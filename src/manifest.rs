use crate::fs_utils::{self, ReadDocumentError, WriteAtomicallyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Filename of the manifest written at the root of every bubble.
pub(crate) const MANIFEST_FILENAME: &str = ".omnipkg_manifest.json";

/// The record written at the root of every bubble, describing its contents.
/// A bubble without a valid manifest is treated as nonexistent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BubbleManifest {
    pub created_at: String,
    pub packages: BTreeMap<String, ManifestPackage>,
    pub stats: ManifestStats,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ManifestPackage {
    pub version: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_page: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    PurePython,
    Native,
    Mixed,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ManifestStats {
    pub bubble_size_mb: f64,
    pub package_count: usize,
}

impl BubbleManifest {
    pub fn new(packages: BTreeMap<String, ManifestPackage>, bubble_size_bytes: u64) -> Self {
        let package_count = packages.len();
        Self {
            created_at: jiff::Timestamp::now().to_string(),
            packages,
            stats: ManifestStats {
                bubble_size_mb: bubble_size_bytes as f64 / (1024.0 * 1024.0),
                package_count,
            },
        }
    }

    pub fn write(&self, bubble_path: &Path) -> Result<(), ManifestError> {
        let contents = serde_json::to_vec_pretty(self).map_err(ManifestError::Serialize)?;
        fs_utils::write_atomically(&bubble_path.join(MANIFEST_FILENAME), &contents)
            .map_err(ManifestError::Write)
    }

    /// Read the manifest of the bubble at `bubble_path`. A missing manifest
    /// is an error: the bubble is only considered to exist once its manifest
    /// does.
    pub fn read(bubble_path: &Path) -> Result<Self, ManifestError> {
        let manifest_path = bubble_path.join(MANIFEST_FILENAME);
        fs_utils::read_optional_document(&manifest_path)
            .map_err(|error| match error {
                ReadDocumentError::Parse { path, parse_error } => {
                    ManifestError::Parse { path, parse_error }
                }
                other => ManifestError::Read(other),
            })?
            .ok_or_else(|| ManifestError::Missing {
                bubble_path: bubble_path.to_path_buf(),
            })
    }

    /// Whether the directory at `bubble_path` is a usable bubble.
    pub(crate) fn exists(bubble_path: &Path) -> bool {
        bubble_path.join(MANIFEST_FILENAME).is_file()
    }
}

/// Errors that can occur when reading or writing a bubble manifest.
#[derive(Debug)]
pub enum ManifestError {
    Missing {
        bubble_path: PathBuf,
    },
    Parse {
        path: PathBuf,
        parse_error: serde_json::Error,
    },
    Read(ReadDocumentError),
    Serialize(serde_json::Error),
    Write(WriteAtomicallyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> BubbleManifest {
        BubbleManifest::new(
            BTreeMap::from([
                (
                    "flask-login".to_string(),
                    ManifestPackage {
                        version: "0.4.1".to_string(),
                        package_type: PackageType::PurePython,
                        summary: Some("User session management for Flask".to_string()),
                        license: Some("MIT".to_string()),
                        home_page: None,
                    },
                ),
                (
                    "numpy".to_string(),
                    ManifestPackage {
                        version: "1.24.3".to_string(),
                        package_type: PackageType::Native,
                        summary: None,
                        license: None,
                        home_page: None,
                    },
                ),
            ]),
            3 * 1024 * 1024,
        )
    }

    #[test]
    fn round_trips_through_disk() {
        let scratch = tempfile::tempdir().unwrap();
        let manifest = sample_manifest();
        manifest.write(scratch.path()).unwrap();
        assert!(BubbleManifest::exists(scratch.path()));
        assert_eq!(BubbleManifest::read(scratch.path()).unwrap(), manifest);
    }

    #[test]
    fn stats_reflect_contents() {
        let manifest = sample_manifest();
        assert_eq!(manifest.stats.package_count, 2);
        assert!((manifest.stats.bubble_size_mb - 3.0).abs() < 0.001);
    }

    #[test]
    fn package_type_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&PackageType::PurePython).unwrap(),
            "\"pure_python\""
        );
        assert_eq!(
            serde_json::from_str::<PackageType>("\"mixed\"").unwrap(),
            PackageType::Mixed
        );
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let scratch = tempfile::tempdir().unwrap();
        assert!(!BubbleManifest::exists(scratch.path()));
        assert!(matches!(
            BubbleManifest::read(scratch.path()).unwrap_err(),
            ManifestError::Missing { .. }
        ));
    }

    #[test]
    fn malformed_manifest_is_a_parse_error() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join(MANIFEST_FILENAME), "{").unwrap();
        assert!(matches!(
            BubbleManifest::read(scratch.path()).unwrap_err(),
            ManifestError::Parse { .. }
        ));
    }
}
