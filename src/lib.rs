//! Multi-version package management for Python environments: run mutually
//! incompatible versions of one package in a single interpreter session,
//! with sub-millisecond switching between them.
//!
//! The external installer still performs installs; this crate surgically
//! relocates anything that would clobber an existing installation into an
//! isolated "bubble" on disk ([`BubbleBuilder`], [`Surgeon`]) and splices a
//! bubble into the managed import path for the duration of a scope
//! ([`Loader`]). The knowledge base ([`KnowledgeBase`]) keeps the on-disk
//! world and the index reconciled, and file locks ([`locks`]) make all of it
//! safe across processes.

#![warn(clippy::pedantic)]
#![warn(unused_crate_dependencies)]
// Prevent warnings caused by the large size of `ureq::Error` in error enums,
// where it is not worth boxing since the enum size doesn't affect performance.
#![allow(clippy::large_enum_variant)]
#![allow(clippy::result_large_err)]

mod bubble;
mod cloak;
mod config;
mod diagnostics;
mod dist_info;
mod fs_utils;
mod hash_index;
mod kb_store;
mod knowledge_base;
mod loader;
mod locks;
mod manifest;
mod names;
mod registry;
mod session;
mod surgeon;
mod version;
mod worker;

pub use crate::bubble::{BubbleBuilder, BubbleError, BuildOutcome};
pub use crate::cloak::CloakError;
pub use crate::config::{Config, ConfigError, EnvContext, InstallStrategy};
pub use crate::diagnostics::on_error;
pub use crate::dist_info::{DiscoverError, DistMetadata, Distribution, ReadMetadataError};
pub use crate::fs_utils::{
    CapturedCommandError, CommandIoError, ReadDocumentError, WriteAtomicallyError,
};
pub use crate::kb_store::{KbStore, KbStoreError};
pub use crate::knowledge_base::{
    KnowledgeBase, KnowledgeBaseError, ScanRunner, ScanUnavailable, SyncReport,
};
pub use crate::loader::{
    ActivationError, ActivationOptions, ActivationOutcome, ActivationTimings, ActiveScope,
    IsolationMode, Loader, ScannerInvocation,
};
pub use crate::locks::LockAcquireError;
pub use crate::manifest::{
    BubbleManifest, ManifestError, ManifestPackage, ManifestStats, PackageType,
};
pub use crate::names::{canonicalize_name, PackageSpec, ParsePackageSpecError};
pub use crate::registry::{FailedVersion, FailedVersionCache, PathRegistry, RegistryError};
pub use crate::session::InterpreterState;
pub use crate::surgeon::{parse_install_specs, InstallReport, Surgeon, SurgeonError};
pub use crate::version::{ParseVersionError, Version};
pub use crate::worker::{ExecutionOutput, FrameError, Worker, WorkerError, WorkerPool};

use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// The narrow installer interface injected where a component would otherwise
/// need the whole package manager (the knowledge base's self-heal, embedders
/// driving install-on-demand). Keeping it this small is what breaks the
/// loader/manager reference cycle.
pub trait InstallerCapability {
    fn install(&self, specs: &[PackageSpec]) -> Result<(), CapabilityError>;
    fn uninstall(&self, specs: &[PackageSpec]) -> Result<(), CapabilityError>;
    fn list_installed(&self) -> Result<BTreeMap<String, Version>, CapabilityError>;
}

/// An opaque failure from an [`InstallerCapability`] implementation.
#[derive(Debug)]
pub struct CapabilityError(pub String);

impl Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level error for embedders that drive the whole system and want a
/// single type to match on.
#[derive(Debug)]
pub enum OmnipkgError {
    Activation(ActivationError),
    Bubble(BubbleError),
    Config(ConfigError),
    KnowledgeBase(KnowledgeBaseError),
    Registry(RegistryError),
    Surgeon(SurgeonError),
    Worker(WorkerError),
}

impl From<ActivationError> for OmnipkgError {
    fn from(error: ActivationError) -> Self {
        Self::Activation(error)
    }
}

impl From<BubbleError> for OmnipkgError {
    fn from(error: BubbleError) -> Self {
        Self::Bubble(error)
    }
}

impl From<ConfigError> for OmnipkgError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<KnowledgeBaseError> for OmnipkgError {
    fn from(error: KnowledgeBaseError) -> Self {
        Self::KnowledgeBase(error)
    }
}

impl From<RegistryError> for OmnipkgError {
    fn from(error: RegistryError) -> Self {
        Self::Registry(error)
    }
}

impl From<SurgeonError> for OmnipkgError {
    fn from(error: SurgeonError) -> Self {
        Self::Surgeon(error)
    }
}

impl From<WorkerError> for OmnipkgError {
    fn from(error: WorkerError) -> Self {
        Self::Worker(error)
    }
}
