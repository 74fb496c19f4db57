use crate::version::{ParseVersionError, Version};
use std::fmt::{self, Display};

/// Import names that cannot be derived from the distribution name by the
/// usual hyphen-to-underscore transformation. Used as a fallback when a
/// distribution ships neither a `top_level.txt` nor a usable `RECORD`.
pub(crate) const KNOWN_IMPORT_NAMES: [(&str, &str); 8] = [
    ("attrs", "attr"),
    ("beautifulsoup4", "bs4"),
    ("opencv-python", "cv2"),
    ("pillow", "PIL"),
    ("protobuf", "google.protobuf"),
    ("python-dateutil", "dateutil"),
    ("pyyaml", "yaml"),
    ("scikit-learn", "sklearn"),
];

/// Normalize a distribution name per PEP 503: lowercase, with runs of
/// hyphens, underscores and dots collapsed into a single hyphen.
///
/// Two identities are considered equal only if their canonical names match,
/// so every map and lock in this crate is keyed by the canonical form.
pub fn canonicalize_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut previous_was_separator = false;
    for character in name.trim().chars() {
        if matches!(character, '-' | '_' | '.') {
            previous_was_separator = true;
        } else {
            if previous_was_separator && !canonical.is_empty() {
                canonical.push('-');
            }
            previous_was_separator = false;
            canonical.extend(character.to_lowercase());
        }
    }
    canonical
}

/// The on-disk module form of a canonical name (hyphens become underscores).
/// This is what `import` statements and site-packages directories use.
pub(crate) fn module_name(canonical_name: &str) -> String {
    canonical_name.replace('-', "_")
}

/// A fully pinned package identity: canonical name plus exact version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PackageSpec {
    pub name: String,
    pub version: Version,
}

impl PackageSpec {
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: canonicalize_name(name),
            version,
        }
    }

    /// Parse a `name==version` requirement string.
    pub fn parse(spec: &str) -> Result<Self, ParsePackageSpecError> {
        let (name, version) = spec
            .split_once("==")
            .ok_or_else(|| ParsePackageSpecError::MissingVersionPin(spec.to_string()))?;
        let name = canonicalize_name(name);
        if name.is_empty() {
            return Err(ParsePackageSpecError::EmptyName(spec.to_string()));
        }
        let version = version
            .trim()
            .parse()
            .map_err(ParsePackageSpecError::InvalidVersion)?;
        Ok(Self { name, version })
    }

    /// The directory name of this identity's bubble: `<name>-<version>`.
    pub(crate) fn bubble_dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { name, version } = self;
        write!(f, "{name}=={version}")
    }
}

/// Errors that can occur when parsing a `name==version` requirement string.
#[derive(Debug)]
pub enum ParsePackageSpecError {
    EmptyName(String),
    InvalidVersion(ParseVersionError),
    MissingVersionPin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_name_normalizes_separators() {
        assert_eq!(canonicalize_name("Flask-Login"), "flask-login");
        assert_eq!(canonicalize_name("ruamel.yaml"), "ruamel-yaml");
        assert_eq!(canonicalize_name("typing_extensions"), "typing-extensions");
        assert_eq!(canonicalize_name("foo__bar..baz"), "foo-bar-baz");
        assert_eq!(canonicalize_name("  NumPy  "), "numpy");
    }

    #[test]
    fn module_name_uses_underscores() {
        assert_eq!(module_name("flask-login"), "flask_login");
        assert_eq!(module_name("numpy"), "numpy");
    }

    #[test]
    fn parse_spec_valid() {
        let spec = PackageSpec::parse("Flask_Login==0.4.1").unwrap();
        assert_eq!(spec.name, "flask-login");
        assert_eq!(spec.version, "0.4.1".parse().unwrap());
        assert_eq!(spec.to_string(), "flask-login==0.4.1");
        assert_eq!(spec.bubble_dir_name(), "flask-login-0.4.1");
    }

    #[test]
    fn parse_spec_missing_pin() {
        assert!(matches!(
            PackageSpec::parse("requests").unwrap_err(),
            ParsePackageSpecError::MissingVersionPin(spec) if spec == "requests"
        ));
        assert!(matches!(
            PackageSpec::parse("requests>=2.0").unwrap_err(),
            ParsePackageSpecError::MissingVersionPin(_)
        ));
    }

    #[test]
    fn parse_spec_empty_name() {
        assert!(matches!(
            PackageSpec::parse("==1.0").unwrap_err(),
            ParsePackageSpecError::EmptyName(_)
        ));
    }

    #[test]
    fn parse_spec_invalid_version() {
        assert!(matches!(
            PackageSpec::parse("requests==not.a.version").unwrap_err(),
            ParsePackageSpecError::InvalidVersion(_)
        ));
    }

    #[test]
    fn known_import_names_are_canonically_keyed() {
        for (name, _) in KNOWN_IMPORT_NAMES {
            assert_eq!(canonicalize_name(name), name);
        }
    }
}
