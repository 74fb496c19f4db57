use crate::names::module_name;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// An explicit model of the interpreter state the activation loader manages:
/// the import path, the `PATH` environment value handed to subprocesses, and
/// a mirror of which top-level modules the managed interpreter has loaded.
///
/// The loader mutates this state during activation and restores it exactly
/// on exit; nothing else in the crate touches it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpreterState {
    pub sys_path: Vec<PathBuf>,
    pub path_env: String,
    pub loaded_modules: BTreeSet<String>,
}

impl InterpreterState {
    /// The state of a fresh interpreter over the given site-packages.
    pub fn new(site_packages: &Path, path_env: String) -> Self {
        Self {
            sys_path: vec![site_packages.to_path_buf()],
            path_env,
            loaded_modules: BTreeSet::new(),
        }
    }

    /// Capture a snapshot that [`InterpreterState::restore`] can later apply
    /// verbatim. Activation exit must leave the state bitwise identical to
    /// the snapshot taken at enter.
    pub(crate) fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            sys_path: self.sys_path.clone(),
            path_env: self.path_env.clone(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &StateSnapshot) {
        self.sys_path = snapshot.sys_path.clone();
        self.path_env = snapshot.path_env.clone();
    }

    pub(crate) fn note_loaded(&mut self, module: &str) {
        self.loaded_modules.insert(module.to_string());
    }

    pub(crate) fn is_loaded(&self, module: &str) -> bool {
        self.loaded_modules.contains(module)
    }

    /// Drop `package`'s modules from the loaded-module mirror: the top-level
    /// module itself plus every submodule. `retain` names modules that must
    /// survive (the unreloadable C-extension cores); a dotted retain entry
    /// also protects its own submodules, while a bare top-level entry
    /// protects only itself.
    pub(crate) fn purge_modules(&mut self, canonical_name: &str, retain: &[String]) -> Vec<String> {
        let module = module_name(canonical_name);
        let prefix = format!("{module}.");
        let mut purged = Vec::new();
        self.loaded_modules.retain(|loaded| {
            let belongs = *loaded == module || loaded.starts_with(&prefix);
            let kept = !belongs
                || retain.iter().any(|keep| {
                    loaded == keep
                        || (keep.contains('.') && loaded.starts_with(&format!("{keep}.")))
                });
            if !kept {
                purged.push(loaded.clone());
            }
            kept
        });
        purged
    }
}

/// The captured originals that exit/panic-restore reapply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StateSnapshot {
    pub(crate) sys_path: Vec<PathBuf>,
    pub(crate) path_env: String,
}

/// Which loader currently owns a package's main-env installation (after
/// uncloaking it to satisfy an activation). Shared between every scope in
/// the process; mutations are serialized by the global activation lock, the
/// mutex just keeps the container safe for concurrent readers.
#[derive(Debug, Default)]
pub(crate) struct MainEnvOwnership {
    owners: Mutex<BTreeSet<String>>,
}

impl MainEnvOwnership {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, canonical_name: &str) {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(canonical_name.to_string());
    }

    pub(crate) fn unregister(&self, canonical_name: &str) {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(canonical_name);
    }

    pub(crate) fn is_owned(&self, canonical_name: &str) -> bool {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(canonical_name)
    }
}
