use crate::bubble::{BubbleBuilder, BubbleError};
use crate::cloak::{self, CloakEngine, CloakError, CloakRecord};
use crate::config::Config;
use crate::dist_info::{self, Distribution};
use crate::fs_utils::{self, CapturedCommandError};
use crate::locks::{LockAcquireError, LockManager, ReentrantLock};
use crate::manifest::{BubbleManifest, ManifestError};
use crate::names::{module_name, PackageSpec};
use crate::session::{InterpreterState, MainEnvOwnership, StateSnapshot};
use crate::worker::{ExecutionOutput, Worker, WorkerError, WorkerPool};
use libherokubuildpack::log::{log_info, log_warning};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const IMPORT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const VALIDATION_RETRIES: usize = 3;

/// Packages whose C++ backend cannot be unloaded once its indicator module
/// has been imported. When the indicator is loaded and a different version
/// is requested, in-process switching is impossible: the core modules are
/// preserved, cloaking skips the package, and execution is delegated to a
/// subprocess worker.
const UNRELOADABLE_BACKENDS: [(&str, &str); 4] = [
    ("torch", "torch._C"),
    ("numpy", "numpy.core._multiarray_umath"),
    ("tensorflow", "tensorflow.python.pywrap_tensorflow"),
    ("scipy", "scipy.linalg._fblas"),
];

/// Core submodules preserved during a surgical purge of torch. Utility
/// modules outside this list are still purged.
const TORCH_CORE_MODULES: [&str; 4] = ["torch", "torch._C", "torch.nn", "torch.autograd"];

static LOADER_COUNTER: AtomicU64 = AtomicU64::new(1);

fn allocate_loader_id() -> u64 {
    // Process id in the high bits keeps ids distinct across processes; the
    // counter keeps them distinct across loaders within one process.
    (u64::from(std::process::id()) << 20) | LOADER_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// How strictly a bubble replaces the main environment on the import path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationMode {
    /// The bubble replaces the main site-packages entirely; only the
    /// bubble's own dedup fallthrough reaches the main env.
    #[default]
    Strict,
    /// The bubble is prepended and the main site-packages stays visible for
    /// dependency fallthrough.
    Overlay,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivationOptions {
    pub isolation_mode: IsolationMode,
    pub force_activation: bool,
}

/// How the activation is being served. Callers that only use
/// [`ActiveScope::execute`] never need to look.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The requested version is importable directly in the managed
    /// interpreter state.
    InProcess,
    /// A C-extension collision made in-process switching impossible;
    /// execution is transparently delegated to a subprocess worker.
    ViaWorker,
}

/// Durations of the enter and exit halves of one activation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivationTimings {
    pub activation_ns: u128,
    pub deactivation_ns: u128,
}

/// The activation loader: entry point for splicing a specific package
/// version into the managed interpreter state for the duration of a scope.
pub struct Loader<'a> {
    config: &'a Config,
    builder: BubbleBuilder<'a>,
    engine: CloakEngine,
    locks: LockManager,
    activation_lock: ReentrantLock,
    ownership: MainEnvOwnership,
    pool: WorkerPool,
    loader_id: u64,
}

impl<'a> Loader<'a> {
    pub fn new(config: &'a Config, builder: BubbleBuilder<'a>) -> Self {
        let loader_id = allocate_loader_id();
        let locks = LockManager::new(&config.bubble_root);
        let engine = CloakEngine::new(&config.site_packages, locks.clone(), loader_id);
        // A crashed older process may have left critical dependencies
        // cloaked; restore them before anything relies on them.
        engine.restore_critical_dep_cloaks();
        Self {
            config,
            builder,
            engine,
            locks,
            activation_lock: ReentrantLock::new(),
            ownership: MainEnvOwnership::new(),
            pool: WorkerPool::new(&config.python_executable),
            loader_id,
        }
    }

    pub fn loader_id(&self) -> u64 {
        self.loader_id
    }

    /// Enter an activation scope for `spec`. On success the returned scope
    /// must be closed with [`ActiveScope::exit`]; on failure the prior state
    /// has already been faithfully restored.
    pub fn activate<'s>(
        &'s mut self,
        state: &'s mut InterpreterState,
        spec: &PackageSpec,
        options: ActivationOptions,
    ) -> Result<ActiveScope<'s, 'a>, ActivationError> {
        let started = Instant::now();

        // Happy path: the requested version is already active.
        if !options.force_activation {
            if let Some(active) = current_version(state, &spec.name) {
                if active == spec.version {
                    return Ok(ActiveScope {
                        loader: self,
                        state,
                        spec: spec.clone(),
                        mode: ScopeMode::NoOp,
                        timings: ActivationTimings {
                            activation_ns: started.elapsed().as_nanos(),
                            deactivation_ns: 0,
                        },
                        exited: false,
                    });
                }
            }
        }

        // A bubble on disk serves the request without touching the main env.
        let bubble_path = self.config.bubble_root.join(spec.bubble_dir_name());
        if BubbleManifest::exists(&bubble_path) {
            return self.enter_bubble(state, spec, options, bubble_path, started, true);
        }

        // A sibling scope in this process may already own the main-env
        // installation at this version; share it instead of rescanning.
        if self.ownership.is_owned(&spec.name)
            && find_version_in_dir(&self.config.site_packages, spec).is_some()
        {
            self.ownership.register(&spec.name);
            return Ok(ActiveScope {
                loader: self,
                state,
                spec: spec.clone(),
                mode: ScopeMode::MainEnv,
                timings: ActivationTimings {
                    activation_ns: started.elapsed().as_nanos(),
                    deactivation_ns: 0,
                },
                exited: false,
            });
        }

        // The main env may hold the requested version behind a cloak left by
        // another loader; restore it and own the main env directly.
        if self.try_recover_cloaked_main_env(spec) {
            self.ownership.register(&spec.name);
            log_info(format!(
                "Activated {spec} from the main environment (uncloaked)"
            ));
            return Ok(ActiveScope {
                loader: self,
                state,
                spec: spec.clone(),
                mode: ScopeMode::MainEnv,
                timings: ActivationTimings {
                    activation_ns: started.elapsed().as_nanos(),
                    deactivation_ns: 0,
                },
                exited: false,
            });
        }

        // Neither present: build on demand under the install lock. A racing
        // builder may finish first, in which case the re-check wins.
        {
            let _install_lock = self
                .locks
                .install_lock(&spec.name, &spec.version)
                .map_err(ActivationError::InstallLockTimeout)?;
            if !BubbleManifest::exists(&bubble_path) {
                self.builder.create(spec).map_err(ActivationError::Build)?;
            }
        }
        self.enter_bubble(state, spec, options, bubble_path, started, true)
    }

    fn enter_bubble<'s>(
        &'s mut self,
        state: &'s mut InterpreterState,
        spec: &PackageSpec,
        options: ActivationOptions,
        bubble_path: PathBuf,
        started: Instant,
        allow_heal: bool,
    ) -> Result<ActiveScope<'s, 'a>, ActivationError> {
        match self.activate_bubble(state, spec, options, &bubble_path) {
            Ok(mode) => Ok(ActiveScope {
                loader: self,
                state,
                spec: spec.clone(),
                mode,
                timings: ActivationTimings {
                    activation_ns: started.elapsed().as_nanos(),
                    deactivation_ns: 0,
                },
                exited: false,
            }),
            Err(error) if allow_heal && matches!(error, ActivationError::Validation { .. }) => {
                // One auto-heal attempt: the bubble may be damaged; rebuild
                // it from scratch and retry once.
                log_warning(
                    "Bubble failed validation",
                    format!("Rebuilding {spec} once before giving up: {error:?}"),
                );
                self.builder.destroy(spec).map_err(ActivationError::Build)?;
                self.builder.create(spec).map_err(ActivationError::Build)?;
                self.enter_bubble(state, spec, options, bubble_path, started, false)
            }
            Err(error) => Err(error),
        }
    }

    /// The `_activate_bubble` pipeline: conflict set, module purge, cloak,
    /// path splice, immortal-dep symlinks, validation, collision diagnosis.
    /// On any failure the cloaks recorded so far are panic-restored and the
    /// captured state is reapplied before the error propagates.
    fn activate_bubble(
        &mut self,
        state: &mut InterpreterState,
        spec: &PackageSpec,
        options: ActivationOptions,
        bubble_path: &Path,
    ) -> Result<ScopeMode, ActivationError> {
        let manifest = BubbleManifest::read(bubble_path).map_err(ActivationError::Manifest)?;
        let snapshot = state.snapshot();

        // The conflict set: bubble packages also present in the main env at
        // a different version. Only these need cloaking.
        let main_env = dist_info::snapshot_versions(&self.config.site_packages)
            .map_err(ActivationError::Discover)?;
        let mut conflict_set: Vec<String> = Vec::new();
        let mut needs_worker = false;
        for (name, package) in &manifest.packages {
            let Some(active_version) = main_env.get(name) else {
                continue;
            };
            if active_version.to_string() == package.version {
                continue;
            }
            if let Some((_, indicator)) = UNRELOADABLE_BACKENDS
                .iter()
                .find(|(backend, _)| *backend == name.as_str())
            {
                if state.is_loaded(indicator) {
                    // The loaded backend cannot be swapped in-process: keep
                    // it out of the cloak list, preserve its core modules,
                    // and serve the scope through a worker.
                    log_warning(
                        "C extension backend already loaded",
                        format!(
                            "'{name}' has '{indicator}' loaded; switching to the worker \
                             fallback for {spec}."
                        ),
                    );
                    state.purge_modules(name, &retained_core_modules(name));
                    needs_worker = true;
                    continue;
                }
            }
            conflict_set.push(name.clone());
        }

        // Cloak the conflict set. The global activation lock serializes the
        // cloak-list mutation against sibling threads.
        let mut cloak_records: Vec<(String, Vec<CloakRecord>)> = Vec::new();
        {
            let _guard = self.activation_lock.lock();
            for name in &conflict_set {
                state.purge_modules(name, &[]);
                match self.engine.cloak_package(name) {
                    Ok(records) => cloak_records.push((name.clone(), records)),
                    Err(error) => {
                        self.panic_restore(&cloak_records);
                        state.restore(&snapshot);
                        return Err(ActivationError::Cloak(error));
                    }
                }
            }
        }

        // Path surgery.
        match options.isolation_mode {
            IsolationMode::Strict => {
                let mut sys_path = vec![bubble_path.to_path_buf()];
                sys_path.extend(
                    snapshot
                        .sys_path
                        .iter()
                        .filter(|path| **path != self.config.site_packages)
                        .cloned(),
                );
                state.sys_path = sys_path;
            }
            IsolationMode::Overlay => {
                state.sys_path.insert(0, bubble_path.to_path_buf());
                if !state.sys_path.contains(&self.config.site_packages) {
                    state.sys_path.push(self.config.site_packages.clone());
                }
            }
        }
        let bubble_bin = bubble_path.join("bin");
        if bubble_bin.is_dir() {
            state.path_env = format!("{}:{}", bubble_bin.display(), state.path_env);
        }

        // The activator's own dependencies must stay importable inside the
        // bubble even under strict isolation; non-destructive symlinks cover
        // the ones the bubble doesn't carry itself.
        let symlinks = self.link_immortal_dependencies(bubble_path);

        let outcome = if needs_worker {
            // In-process validation is meaningless with a poisoned backend;
            // a subprocess health check replaces it.
            self.subprocess_health_check(spec, bubble_path)
                .map_err(|error| {
                    self.panic_restore(&cloak_records);
                    state.restore(&snapshot);
                    error
                })?;
            ActivationOutcome::ViaWorker
        } else {
            match self.validate_import(state, spec, bubble_path) {
                Ok(()) => ActivationOutcome::InProcess,
                Err(validation_error) => {
                    // Collision diagnosis: if a sterile interpreter can
                    // import the bubble, our in-process state is corrupt
                    // and the worker fallback serves the scope instead.
                    if self.subprocess_health_check(spec, bubble_path).is_ok() {
                        log_warning(
                            "Process state corrupted",
                            format!(
                                "{spec} imports cleanly in a sterile subprocess but not with \
                                 the spliced path; delegating to the worker fallback."
                            ),
                        );
                        ActivationOutcome::ViaWorker
                    } else {
                        self.panic_restore(&cloak_records);
                        state.restore(&snapshot);
                        return Err(validation_error);
                    }
                }
            }
        };

        let worker = if outcome == ActivationOutcome::ViaWorker {
            let worker_paths = vec![bubble_path.to_path_buf(), self.config.site_packages.clone()];
            match self.pool.checkout(spec, &worker_paths) {
                Ok(worker) => Some(worker),
                Err(error) => {
                    self.panic_restore(&cloak_records);
                    state.restore(&snapshot);
                    return Err(ActivationError::WorkerUnavailable(error));
                }
            }
        } else {
            state.note_loaded(&dist_info::import_name(
                &bubble_dist_info(bubble_path, spec),
                &spec.name,
            ));
            None
        };

        Ok(ScopeMode::Bubble {
            bubble_path: bubble_path.to_path_buf(),
            snapshot,
            isolation: options.isolation_mode,
            cloak_records,
            symlinks,
            bubble_packages: manifest.packages.keys().cloned().collect(),
            worker,
        })
    }

    /// Scan for a cloaked main-env dist-info matching the requested version
    /// and restore it if found.
    fn try_recover_cloaked_main_env(&self, spec: &PackageSpec) -> bool {
        let wanted = format!(
            "{}-{}.dist-info",
            module_name(&spec.name),
            spec.version
        );
        let has_match = self.engine.scan_cloaks(&spec.name).iter().any(|cloak| {
            cloak
                .original
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == wanted)
        });
        if has_match {
            self.engine.recover_orphans(&spec.name);
            return find_version_in_dir(&self.config.site_packages, spec).is_some();
        }
        false
    }

    fn link_immortal_dependencies(&self, bubble_path: &Path) -> Vec<PathBuf> {
        let mut created = Vec::new();
        for package in cloak::IMMORTAL_PACKAGES {
            let module = module_name(package);
            let source = self.config.site_packages.join(&module);
            let link = bubble_path.join(&module);
            if !source.is_dir() || link.exists() {
                continue;
            }
            match fs_utils::symlink_if_absent(&source, &link) {
                Ok(()) => created.push(link),
                Err(io_error) => log_warning(
                    "Dependency link failed",
                    format!("{}: {io_error}", link.display()),
                ),
            }
        }
        created
    }

    /// Smoke-import the package under its true import name against the
    /// current (spliced) path view, retrying with a cache clear in between.
    fn validate_import(
        &self,
        state: &InterpreterState,
        spec: &PackageSpec,
        bubble_path: &Path,
    ) -> Result<(), ActivationError> {
        let import = dist_info::import_name(&bubble_dist_info(bubble_path, spec), &spec.name);
        let mut last_detail = String::new();
        for attempt in 1..=VALIDATION_RETRIES {
            match self.sterile_probe(&state.sys_path, &import) {
                Ok(()) => return Ok(()),
                Err(detail) => {
                    last_detail = detail;
                    if attempt < VALIDATION_RETRIES {
                        log_info(format!(
                            "Import validation attempt {attempt} failed for '{import}'; retrying"
                        ));
                    }
                }
            }
        }
        Err(ActivationError::Validation {
            spec: spec.clone(),
            import,
            detail: last_detail,
        })
    }

    /// Probe the bubble alone in a fresh interpreter. Success here while the
    /// spliced-path probe fails is the signature of an in-process collision.
    fn subprocess_health_check(
        &self,
        spec: &PackageSpec,
        bubble_path: &Path,
    ) -> Result<(), ActivationError> {
        let import = dist_info::import_name(&bubble_dist_info(bubble_path, spec), &spec.name);
        let paths = vec![bubble_path.to_path_buf(), self.config.site_packages.clone()];
        self.sterile_probe(&paths, &import)
            .map_err(|detail| ActivationError::Validation {
                spec: spec.clone(),
                import,
                detail,
            })
    }

    fn sterile_probe(&self, sys_path: &[PathBuf], import: &str) -> Result<(), String> {
        let paths: Vec<String> = sys_path
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let code = format!(
            "import sys, json; sys.path[:0] = json.loads({paths:?}); import {import}",
            paths = serde_json::to_string(&paths).unwrap_or_default(),
        );
        let result = fs_utils::run_command_with_deadline(
            Command::new(&self.config.python_executable).args(["-I", "-c", &code]),
            IMPORT_PROBE_TIMEOUT,
        );
        match result {
            Ok(_) => Ok(()),
            Err(CapturedCommandError::Io(inner)) => Err(format!(
                "could not run {}: {}",
                inner.program, inner.io_error
            )),
            Err(CapturedCommandError::NonZeroExitStatus(output)) => {
                Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
            }
            Err(CapturedCommandError::TimedOut { timeout, .. }) => {
                Err(format!("probe timed out after {timeout:?}"))
            }
        }
    }

    fn panic_restore(&self, cloak_records: &[(String, Vec<CloakRecord>)]) {
        for (name, records) in cloak_records.iter().rev() {
            self.engine.panic_restore(name, records);
        }
    }
}

/// Runs the vulnerability scanner for the knowledge base's security scan,
/// with the scanner activated inside its own bubble so that scanning never
/// perturbs the main environment. `force_activation` bypasses the
/// already-active fast path, guaranteeing the bubbled scanner is the one
/// that runs even when some version of it is installed in the main env.
pub struct ScannerInvocation<'s, 'a> {
    loader: &'s mut Loader<'a>,
    state: &'s mut InterpreterState,
}

impl<'s, 'a> ScannerInvocation<'s, 'a> {
    pub fn new(loader: &'s mut Loader<'a>, state: &'s mut InterpreterState) -> Self {
        Self { loader, state }
    }
}

impl crate::knowledge_base::ScanRunner for ScannerInvocation<'_, '_> {
    fn scan(
        &mut self,
        requirements_path: &Path,
    ) -> Result<String, crate::knowledge_base::ScanUnavailable> {
        let unavailable = |detail: String| crate::knowledge_base::ScanUnavailable(detail);
        let version = self
            .loader
            .config
            .scanner_version
            .parse()
            .map_err(|error| unavailable(format!("bad scanner version pin: {error:?}")))?;
        let spec = PackageSpec::new("safety", version);
        let options = ActivationOptions {
            isolation_mode: IsolationMode::Overlay,
            force_activation: true,
        };

        let mut scope = self
            .loader
            .activate(self.state, &spec, options)
            .map_err(|error| unavailable(format!("scanner activation failed: {error:?}")))?;
        let code = format!(
            "import runpy, sys\n\
             sys.argv = ['safety', 'check', '--file', {path:?}, '--output', 'json']\n\
             runpy.run_module('safety', run_name='__main__')",
            path = requirements_path.to_string_lossy(),
        );
        let result = scope
            .execute(&code)
            .map_err(|error| unavailable(format!("scanner execution failed: {error:?}")));
        scope
            .exit()
            .map_err(|error| unavailable(format!("scanner deactivation failed: {error:?}")))?;
        result.map(|output| output.stdout)
    }
}

/// The version of `name` visible through the interpreter state's path view:
/// the first matching dist-info along `sys_path` wins, exactly as the
/// interpreter's own metadata lookup would.
pub(crate) fn current_version(state: &InterpreterState, name: &str) -> Option<crate::version::Version> {
    for path in &state.sys_path {
        if let Ok(Some(distribution)) = dist_info::find_distribution(path, name) {
            return Some(distribution.version);
        }
    }
    None
}

fn find_version_in_dir(dir: &Path, spec: &PackageSpec) -> Option<Distribution> {
    dist_info::find_distribution(dir, &spec.name)
        .ok()
        .flatten()
        .filter(|distribution| distribution.version == spec.version)
}

fn bubble_dist_info(bubble_path: &Path, spec: &PackageSpec) -> PathBuf {
    bubble_path.join(format!(
        "{}-{}.dist-info",
        module_name(&spec.name),
        spec.version
    ))
}

fn retained_core_modules(canonical_name: &str) -> Vec<String> {
    if canonical_name == "torch" {
        return TORCH_CORE_MODULES.iter().map(ToString::to_string).collect();
    }
    UNRELOADABLE_BACKENDS
        .iter()
        .find(|(backend, _)| *backend == canonical_name)
        .map(|(backend, indicator)| vec![(*backend).to_string(), (*indicator).to_string()])
        .unwrap_or_default()
}

enum ScopeMode {
    /// The requested version was already active; nothing to restore.
    NoOp,
    /// The main env serves the request after an uncloak; this loader owns
    /// the package's main-env installation until exit.
    MainEnv,
    Bubble {
        bubble_path: PathBuf,
        snapshot: StateSnapshot,
        isolation: IsolationMode,
        cloak_records: Vec<(String, Vec<CloakRecord>)>,
        symlinks: Vec<PathBuf>,
        bubble_packages: Vec<String>,
        worker: Option<Worker>,
    },
}

/// A live activation. Dropping it without calling [`ActiveScope::exit`]
/// panic-restores the filesystem and state as a safety net, but the explicit
/// exit is the supported path (it returns the timings and surfaces errors).
pub struct ActiveScope<'s, 'a> {
    loader: &'s mut Loader<'a>,
    state: &'s mut InterpreterState,
    spec: PackageSpec,
    mode: ScopeMode,
    timings: ActivationTimings,
    exited: bool,
}

impl ActiveScope<'_, '_> {
    pub fn outcome(&self) -> ActivationOutcome {
        match &self.mode {
            ScopeMode::Bubble { worker: Some(_), .. } => ActivationOutcome::ViaWorker,
            _ => ActivationOutcome::InProcess,
        }
    }

    pub fn activation_ns(&self) -> u128 {
        self.timings.activation_ns
    }

    /// Run `code` in the activated context: through the spliced interpreter
    /// state in-process, or through the fallback worker when a collision
    /// forced delegation. The caller cannot tell the difference.
    pub fn execute(&mut self, code: &str) -> Result<ExecutionOutput, ActivationError> {
        if let ScopeMode::Bubble {
            worker: Some(worker),
            ..
        } = &mut self.mode
        {
            return worker.execute(code).map_err(ActivationError::Worker);
        }

        let paths: Vec<String> = self
            .state
            .sys_path
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let program = format!(
            "import sys, json; sys.path[:0] = json.loads({paths:?})\n{code}",
            paths = serde_json::to_string(&paths).unwrap_or_default(),
        );
        let output = fs_utils::run_command_and_capture_output(
            Command::new(&self.loader.config.python_executable)
                .args(["-I", "-c", &program])
                .env("PATH", &self.state.path_env),
        )
        .map_err(ActivationError::Execute)?;
        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// The version of `name` as seen inside this scope.
    pub fn get_version(&mut self, name: &str) -> Option<String> {
        if let ScopeMode::Bubble {
            worker: Some(worker),
            ..
        } = &mut self.mode
        {
            return worker.get_version(name).ok();
        }
        current_version(self.state, name).map(|version| version.to_string())
    }

    /// Close the scope: uncloak, restore the captured path state exactly,
    /// purge the bubble's modules, and verify no orphaned cloaks remain.
    pub fn exit(mut self) -> Result<ActivationTimings, ActivationError> {
        let started = Instant::now();
        self.exited = true;

        let mode = std::mem::replace(&mut self.mode, ScopeMode::NoOp);
        match mode {
            ScopeMode::NoOp => {}
            ScopeMode::MainEnv => {
                self.loader.ownership.unregister(&self.spec.name);
            }
            ScopeMode::Bubble {
                bubble_path,
                snapshot,
                isolation,
                cloak_records,
                symlinks,
                bubble_packages,
                worker,
            } => {
                if let Some(worker) = worker {
                    self.loader.pool.checkin(worker);
                }

                {
                    let _guard = self.loader.activation_lock.lock();
                    for (name, records) in cloak_records.iter().rev() {
                        self.loader.engine.uncloak(name, records);
                    }
                    // Post-restore sweep: nothing of ours may remain cloaked.
                    for (name, _) in &cloak_records {
                        if !self.loader.engine.scan_cloaks(name).is_empty() {
                            self.loader.engine.recover_orphans(name);
                        }
                    }
                }

                for link in symlinks {
                    if let Err(io_error) = std::fs::remove_file(&link) {
                        log_warning(
                            "Dependency link cleanup failed",
                            format!("{}: {io_error}", link.display()),
                        );
                    }
                }

                match isolation {
                    IsolationMode::Strict => self.state.restore(&snapshot),
                    IsolationMode::Overlay => {
                        self.state.sys_path.retain(|path| *path != bubble_path);
                        self.state.path_env = snapshot.path_env.clone();
                    }
                }

                for name in bubble_packages {
                    self.state
                        .purge_modules(&name, &retained_core_modules(&name));
                }
            }
        }

        self.timings.deactivation_ns = started.elapsed().as_nanos();
        Ok(self.timings)
    }
}

impl Drop for ActiveScope<'_, '_> {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        // Safety net for scopes dropped without an explicit exit (including
        // unwinding): restore the filesystem and the captured state.
        if let ScopeMode::Bubble {
            snapshot,
            cloak_records,
            symlinks,
            ..
        } = &self.mode
        {
            log_warning(
                "Activation scope dropped without exit",
                format!("Panic-restoring state for {}", self.spec),
            );
            self.loader.panic_restore(cloak_records);
            for link in symlinks {
                std::fs::remove_file(link).ok();
            }
            self.state.restore(snapshot);
        }
        if matches!(self.mode, ScopeMode::MainEnv) {
            self.loader.ownership.unregister(&self.spec.name);
        }
    }
}

/// Errors that can occur when entering or using an activation scope.
#[derive(Debug)]
pub enum ActivationError {
    Build(BubbleError),
    Cloak(CloakError),
    Discover(dist_info::DiscoverError),
    Execute(CapturedCommandError),
    InstallLockTimeout(LockAcquireError),
    Manifest(ManifestError),
    /// The bubble failed its smoke-import even after the auto-heal rebuild.
    Validation {
        spec: PackageSpec,
        import: String,
        detail: String,
    },
    Worker(WorkerError),
    /// The worker fallback itself could not be started; there is nothing
    /// left to fall back to.
    WorkerUnavailable(WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb_store::KbStore;
    use crate::registry::{FailedVersionCache, PathRegistry};
    use std::collections::BTreeMap;
    use std::fs;

    struct Fixture {
        _scratch: tempfile::TempDir,
        config: Config,
        store: KbStore,
        registry: PathRegistry,
        failed: FailedVersionCache,
    }

    fn fixture() -> Fixture {
        let scratch = tempfile::tempdir().unwrap();
        let site = scratch.path().join("site-packages");
        fs::create_dir_all(&site).unwrap();
        let config = Config::new(python_executable(), "3.11".to_string(), site);
        fs::create_dir_all(&config.bubble_root).unwrap();
        let store = KbStore::new(scratch.path());
        let registry = PathRegistry::new(&config.bubble_root);
        let failed = FailedVersionCache::new(&config.bubble_root);
        Fixture {
            _scratch: scratch,
            config,
            store,
            registry,
            failed,
        }
    }

    fn python_executable() -> PathBuf {
        PathBuf::from("python3")
    }

    fn python_available() -> bool {
        Command::new("python3").args(["-c", "0"]).output().is_ok()
    }

    fn install_fake_package(site: &Path, name: &str, version: &str) {
        let module = name.replace('-', "_");
        fs::create_dir_all(site.join(&module)).unwrap();
        fs::write(
            site.join(&module).join("__init__.py"),
            format!("__version__ = {version:?}\n"),
        )
        .unwrap();
        let dist_info = site.join(format!("{module}-{version}.dist-info"));
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(
            dist_info.join("METADATA"),
            format!("Name: {name}\nVersion: {version}\n"),
        )
        .unwrap();
        fs::write(dist_info.join("top_level.txt"), format!("{module}\n")).unwrap();
        fs::write(
            dist_info.join("RECORD"),
            format!("{module}/__init__.py,sha256=x,1\n"),
        )
        .unwrap();
    }

    fn make_bubble(fixture: &Fixture, canonical_name: &str, version: &str) -> PathBuf {
        let bubble = fixture
            .config
            .bubble_root
            .join(format!("{canonical_name}-{version}"));
        fs::create_dir_all(&bubble).unwrap();
        install_fake_package(&bubble, canonical_name, version);
        let manifest = BubbleManifest::new(
            BTreeMap::from([(
                canonical_name.to_string(),
                crate::manifest::ManifestPackage {
                    version: version.to_string(),
                    package_type: crate::manifest::PackageType::PurePython,
                    summary: None,
                    license: None,
                    home_page: None,
                },
            )]),
            1024,
        );
        manifest.write(&bubble).unwrap();
        bubble
    }

    #[test]
    fn already_active_version_is_a_no_op() {
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "1.0");
        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, "/usr/bin".to_string());

        let spec = PackageSpec::parse("demo-pkg==1.0").unwrap();
        let before = state.clone();
        let scope = loader
            .activate(&mut state, &spec, ActivationOptions::default())
            .unwrap();
        assert_eq!(scope.outcome(), ActivationOutcome::InProcess);
        scope.exit().unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn bubble_activation_cloaks_conflicts_and_restores_exactly() {
        if !python_available() {
            return;
        }
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "2.0");
        let bubble = make_bubble(&fixture, "demo-pkg", "1.0");

        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, "/usr/bin".to_string());
        let original_state = state.clone();

        let spec = PackageSpec::parse("demo-pkg==1.0").unwrap();
        let mut scope = loader
            .activate(&mut state, &spec, ActivationOptions::default())
            .unwrap();
        assert_eq!(scope.outcome(), ActivationOutcome::InProcess);
        assert_eq!(scope.get_version("demo-pkg"), Some("1.0".to_string()));

        let timings = scope.exit().unwrap();
        assert!(timings.activation_ns > 0);
        assert_eq!(state, original_state);

        // The main env is back byte-for-byte: version 2.0 visible, no cloaks.
        let distribution =
            dist_info::find_distribution(&fixture.config.site_packages, "demo-pkg")
                .unwrap()
                .unwrap();
        assert_eq!(distribution.version, "2.0".parse().unwrap());
        let leftovers: Vec<_> = fs::read_dir(&fixture.config.site_packages)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains("omnipkg_cloaked"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = bubble;
    }

    #[test]
    fn strict_mode_removes_main_site_packages_from_path() {
        if !python_available() {
            return;
        }
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "2.0");
        let bubble = make_bubble(&fixture, "demo-pkg", "1.0");

        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, String::new());

        let spec = PackageSpec::parse("demo-pkg==1.0").unwrap();
        let scope = loader
            .activate(&mut state, &spec, ActivationOptions::default())
            .unwrap();
        assert_eq!(scope.state.sys_path[0], bubble);
        assert!(!scope.state.sys_path.contains(&fixture.config.site_packages));
        scope.exit().unwrap();
        assert!(state.sys_path.contains(&fixture.config.site_packages));
    }

    #[test]
    fn overlay_mode_keeps_main_site_packages_visible() {
        if !python_available() {
            return;
        }
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "2.0");
        let bubble = make_bubble(&fixture, "demo-pkg", "1.0");

        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, String::new());

        let spec = PackageSpec::parse("demo-pkg==1.0").unwrap();
        let options = ActivationOptions {
            isolation_mode: IsolationMode::Overlay,
            force_activation: false,
        };
        let scope = loader.activate(&mut state, &spec, options).unwrap();
        assert_eq!(scope.state.sys_path[0], bubble);
        assert!(scope.state.sys_path.contains(&fixture.config.site_packages));
        scope.exit().unwrap();
        assert!(!state.sys_path.contains(&bubble));
    }

    #[test]
    fn force_activation_still_selects_a_bubble() {
        if !python_available() {
            return;
        }
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "1.0");
        let bubble = make_bubble(&fixture, "demo-pkg", "1.0");

        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, String::new());

        // Same version as active, but force still routes through selection.
        let spec = PackageSpec::parse("demo-pkg==1.0").unwrap();
        let options = ActivationOptions {
            isolation_mode: IsolationMode::Strict,
            force_activation: true,
        };
        let scope = loader.activate(&mut state, &spec, options).unwrap();
        assert_eq!(scope.state.sys_path[0], bubble);
        scope.exit().unwrap();
    }

    #[test]
    fn cloaked_main_env_version_is_recovered() {
        let fixture = fixture();
        install_fake_package(&fixture.config.site_packages, "demo-pkg", "1.5");

        // Cloak it as a crashed loader would have left it.
        let locks = LockManager::new(&fixture.config.bubble_root);
        let foreign_engine = CloakEngine::new(&fixture.config.site_packages, locks, 999_999);
        foreign_engine.cloak_package("demo-pkg").unwrap();
        assert!(dist_info::find_distribution(&fixture.config.site_packages, "demo-pkg")
            .unwrap()
            .is_none());

        let builder = BubbleBuilder::new(
            &fixture.config,
            &fixture.registry,
            &fixture.failed,
            &fixture.store,
        );
        let mut loader = Loader::new(&fixture.config, builder);
        let mut state =
            InterpreterState::new(&fixture.config.site_packages, String::new());

        let spec = PackageSpec::parse("demo-pkg==1.5").unwrap();
        let scope = loader
            .activate(&mut state, &spec, ActivationOptions::default())
            .unwrap();
        assert_eq!(scope.outcome(), ActivationOutcome::InProcess);
        scope.exit().unwrap();

        let distribution =
            dist_info::find_distribution(&fixture.config.site_packages, "demo-pkg")
                .unwrap()
                .unwrap();
        assert_eq!(distribution.version, "1.5".parse().unwrap());
    }

    #[test]
    fn retained_cores_cover_the_backend_table() {
        assert_eq!(retained_core_modules("torch"), TORCH_CORE_MODULES.to_vec());
        assert_eq!(
            retained_core_modules("scipy"),
            vec!["scipy".to_string(), "scipy.linalg._fblas".to_string()]
        );
        assert!(retained_core_modules("flask").is_empty());
    }
}
