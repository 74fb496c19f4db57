use crate::fs_utils::{
    self, CapturedCommandError, ReadDocumentError, WriteAtomicallyError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The default version of the vulnerability scanner installed into its own
/// bubble for security scans of the active environment.
pub(crate) const DEFAULT_SCANNER_VERSION: &str = "3.2.4";

/// The default base prefix for every knowledge base key.
pub(crate) const DEFAULT_KEY_PREFIX: &str = "omnipkg";

/// Directory under site-packages holding every version bubble.
pub(crate) const DEFAULT_BUBBLE_DIR_NAME: &str = ".omnipkg_versions";

/// Which environment a freshly requested install should land in.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStrategy {
    /// Keep the main environment stable: anything older than the active
    /// version goes straight into a bubble.
    #[default]
    StableMain,
    /// Let the newest requested version take over the main environment,
    /// bubbling whatever it displaces.
    LatestActive,
}

/// The resolved configuration every component works from.
///
/// Persisted as a JSON document; any key missing from the document is filled
/// in with a default detected from the running interpreter, so a fresh
/// machine needs no configuration at all.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub python_executable: PathBuf,
    pub python_version: String,
    pub site_packages: PathBuf,
    pub bubble_root: PathBuf,
    pub key_prefix: String,
    pub scanner_version: String,
    pub install_strategy: InstallStrategy,
    pub interpreters: BTreeMap<String, PathBuf>,
}

/// The on-disk form of [`Config`], with every field optional so that partial
/// documents (and the empty document) are valid input.
#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigDocument {
    python_executable: Option<PathBuf>,
    python_version: Option<String>,
    site_packages: Option<PathBuf>,
    bubble_root: Option<PathBuf>,
    key_prefix: Option<String>,
    scanner_version: Option<String>,
    install_strategy: Option<InstallStrategy>,
    interpreters: Option<BTreeMap<String, PathBuf>>,
}

impl Config {
    /// Build a config from explicit paths, using defaults for everything else.
    /// The entry point for embedders and tests; `load_or_detect` is the entry
    /// point for everything driven by a config file.
    pub fn new(python_executable: PathBuf, python_version: String, site_packages: PathBuf) -> Self {
        let bubble_root = site_packages.join(DEFAULT_BUBBLE_DIR_NAME);
        Self {
            python_executable,
            python_version,
            site_packages,
            bubble_root,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scanner_version: DEFAULT_SCANNER_VERSION.to_string(),
            install_strategy: InstallStrategy::default(),
            interpreters: BTreeMap::new(),
        }
    }

    /// Load the config document at `path`, detect defaults for any missing
    /// keys, and write the completed document back if anything was filled in.
    pub fn load_or_detect(path: &Path) -> Result<Self, ConfigError> {
        let document = match fs_utils::read_optional_document(path) {
            Ok(Some(document)) => document,
            Ok(None) => ConfigDocument::default(),
            Err(ReadDocumentError::Parse { path, parse_error }) => {
                return Err(ConfigError::Parse { path, parse_error });
            }
            Err(error) => return Err(ConfigError::Read(error)),
        };

        let was_complete = document.is_complete();
        let config = document.into_config()?;
        if !was_complete {
            config.save(path)?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let document = ConfigDocument {
            python_executable: Some(self.python_executable.clone()),
            python_version: Some(self.python_version.clone()),
            site_packages: Some(self.site_packages.clone()),
            bubble_root: Some(self.bubble_root.clone()),
            key_prefix: Some(self.key_prefix.clone()),
            scanner_version: Some(self.scanner_version.clone()),
            install_strategy: Some(self.install_strategy),
            interpreters: Some(self.interpreters.clone()),
        };
        let contents = serde_json::to_vec_pretty(&document).map_err(ConfigError::Serialize)?;
        fs_utils::write_atomically(path, &contents).map_err(ConfigError::Write)
    }

    /// The environment context scoping every knowledge base key and registry
    /// document: a stable hash of the interpreter root plus `major.minor`.
    pub fn env_context(&self) -> EnvContext {
        let interpreter_root = self
            .python_executable
            .canonicalize()
            .unwrap_or_else(|_| self.python_executable.clone())
            .parent()
            .map_or_else(|| self.python_executable.clone(), Path::to_path_buf);
        let digest = Sha256::digest(interpreter_root.to_string_lossy().as_bytes());
        EnvContext {
            env_id: hex::encode(&digest[..8]),
            python_version: self.python_version.clone(),
        }
    }

    /// The fully-scoped knowledge base key prefix for this environment.
    pub(crate) fn kb_prefix(&self) -> String {
        let EnvContext {
            env_id,
            python_version,
        } = self.env_context();
        format!("{}:env_{env_id}:py{python_version}:", self.key_prefix)
    }
}

impl ConfigDocument {
    fn is_complete(&self) -> bool {
        self.python_executable.is_some()
            && self.python_version.is_some()
            && self.site_packages.is_some()
            && self.bubble_root.is_some()
            && self.key_prefix.is_some()
            && self.scanner_version.is_some()
            && self.install_strategy.is_some()
            && self.interpreters.is_some()
    }

    fn into_config(self) -> Result<Config, ConfigError> {
        let python_executable = match self.python_executable {
            Some(python_executable) => python_executable,
            None => PathBuf::from("python3"),
        };
        let python_version = match self.python_version {
            Some(python_version) => python_version,
            None => detect_python_version(&python_executable)?,
        };
        let site_packages = match self.site_packages {
            Some(site_packages) => site_packages,
            None => detect_site_packages(&python_executable)?,
        };
        let bubble_root = self
            .bubble_root
            .unwrap_or_else(|| site_packages.join(DEFAULT_BUBBLE_DIR_NAME));
        Ok(Config {
            python_executable,
            python_version,
            site_packages,
            bubble_root,
            key_prefix: self.key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            scanner_version: self
                .scanner_version
                .unwrap_or_else(|| DEFAULT_SCANNER_VERSION.to_string()),
            install_strategy: self.install_strategy.unwrap_or_default(),
            interpreters: self.interpreters.unwrap_or_default(),
        })
    }
}

fn detect_python_version(python_executable: &Path) -> Result<String, ConfigError> {
    query_interpreter(
        python_executable,
        "import sys; print('%d.%d' % sys.version_info[:2])",
    )
}

fn detect_site_packages(python_executable: &Path) -> Result<PathBuf, ConfigError> {
    query_interpreter(
        python_executable,
        "import sysconfig; print(sysconfig.get_paths()['purelib'])",
    )
    .map(PathBuf::from)
}

fn query_interpreter(python_executable: &Path, code: &str) -> Result<String, ConfigError> {
    let output = fs_utils::run_command_and_capture_output(
        Command::new(python_executable).args(["-c", code]),
    )
    .map_err(ConfigError::DetectDefaults)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// The `(env_id, python_version)` pair scoping all per-interpreter state.
/// Two interpreters sharing a host never read each other's keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvContext {
    pub env_id: String,
    pub python_version: String,
}

/// Errors that can occur when loading, detecting or saving the configuration.
#[derive(Debug)]
pub enum ConfigError {
    DetectDefaults(CapturedCommandError),
    Parse {
        path: PathBuf,
        parse_error: serde_json::Error,
    },
    Read(ReadDocumentError),
    Serialize(serde_json::Error),
    Write(WriteAtomicallyError),
}
