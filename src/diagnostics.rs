use crate::bubble::BubbleError;
use crate::cloak::CloakError;
use crate::config::ConfigError;
use crate::fs_utils::{CapturedCommandError, CommandIoError};
use crate::knowledge_base::KnowledgeBaseError;
use crate::loader::ActivationError;
use crate::locks::LockAcquireError;
use crate::registry::RegistryError;
use crate::surgeon::SurgeonError;
use crate::worker::WorkerError;
use crate::OmnipkgError;
use indoc::{formatdoc, indoc};
use libherokubuildpack::log::log_error;

/// Handle any non-recoverable error that escaped the core.
///
/// Recoverable conditions (a skipped artifact, a failed version, a corrupt
/// document) were already logged and absorbed where they occurred; whatever
/// reaches this handler ended the operation, so all that remains is to
/// explain it well.
pub fn on_error(error: &OmnipkgError) {
    match error {
        OmnipkgError::Activation(error) => on_activation_error(error),
        OmnipkgError::Bubble(error) => on_bubble_error(error),
        OmnipkgError::Config(error) => on_config_error(error),
        OmnipkgError::KnowledgeBase(error) => on_knowledge_base_error(error),
        OmnipkgError::Registry(error) => on_registry_error(error),
        OmnipkgError::Surgeon(error) => on_surgeon_error(error),
        OmnipkgError::Worker(error) => on_worker_error(error),
    }
}

fn on_activation_error(error: &ActivationError) {
    match error {
        ActivationError::Validation { spec, import, detail } => log_error(
            "Bubble activation failed",
            formatdoc! {"
                The bubble for {spec} could not be validated: importing
                '{import}' failed even after rebuilding the bubble from
                scratch.

                Details:

                {detail}

                This usually means the package needs system libraries that
                are not present, or that this version is incompatible with
                the running Python. The version has been marked as failed,
                so repeated activations will not retry it for 24 hours.
            "},
        ),
        ActivationError::InstallLockTimeout(lock_error) => log_error(
            "Timed out waiting for a concurrent install",
            formatdoc! {"
                Another process has been building this same bubble for more
                than five minutes, and the wait timed out.

                Details: {lock_error}

                If the other process has crashed while holding the lock,
                the lock will be released when it exits; trying again is
                safe at any time.
            "},
        ),
        ActivationError::WorkerUnavailable(worker_error) => on_worker_error(worker_error),
        ActivationError::Worker(worker_error) => on_worker_error(worker_error),
        ActivationError::Build(bubble_error) => on_bubble_error(bubble_error),
        ActivationError::Cloak(cloak_error) => on_cloak_error(cloak_error),
        ActivationError::Manifest(manifest_error) => log_error(
            "Unreadable bubble manifest",
            formatdoc! {"
                The bubble's manifest could not be read, so the bubble was
                treated as nonexistent.

                Details: {manifest_error:?}

                Deleting the bubble directory will trigger a clean rebuild
                on the next activation.
            "},
        ),
        ActivationError::Discover(discover_error) => log_error(
            "Unable to scan site-packages",
            formatdoc! {"
                An I/O error occurred while scanning:
                {path}

                Details: {io_error}

                {INTERNAL_ERROR_MESSAGE}
                ",
                path = discover_error.site_dir.display(),
                io_error = discover_error.io_error,
            },
        ),
        ActivationError::Execute(command_error) => on_captured_command_error(
            "Unable to execute code in the activated context",
            command_error,
        ),
    }
}

fn on_bubble_error(error: &BubbleError) {
    match error {
        BubbleError::ReleaseDateUnavailable(spec) => log_error(
            "Package version not found on the upstream index",
            formatdoc! {"
                The upstream index has no release date for {spec}, which
                usually means this exact version was never published there.

                Check the version number for typos. The version has been
                cached as failed, so it will not be retried for 24 hours.
            "},
        ),
        BubbleError::RecentlyFailed(spec) => log_error(
            "Version recently failed to build",
            formatdoc! {"
                {spec} failed to build within the last 24 hours, so the
                build was skipped rather than retried.

                The failed-version cache entry expires on its own; to retry
                immediately, delete failed_versions.json from the bubble
                root.
            "},
        ),
        BubbleError::StagingInstall(command_error) => on_captured_command_error(
            "Unable to stage the bubble's packages",
            command_error,
        ),
        BubbleError::Verification { spec, import, detail } => log_error(
            "Bubble failed verification",
            formatdoc! {"
                The staged install for {spec} failed its import test in a
                sterile subprocess (importing '{import}'):

                {detail}

                The staged files were discarded; nothing was committed to
                the bubble root.
            "},
        ),
        BubbleError::Index(ureq_error) => log_error(
            "Unable to reach the upstream package index",
            formatdoc! {"
                An error occurred while querying the package index for
                release metadata.

                In some cases, this happens due to a temporary issue with
                the network connection or the index itself.

                Try again to see if the error resolves itself.

                Details: {ureq_error}
            "},
        ),
        BubbleError::IndexPayload { url, detail } => log_error(
            "Malformed response from the upstream package index",
            formatdoc! {"
                The package index returned a response that could not be
                parsed:
                {url}

                Details: {detail}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
        BubbleError::InstallLockTimeout(lock_error) => log_error(
            "Timed out waiting for a concurrent install",
            formatdoc! {"
                Another process held the install lock for this bubble for
                more than five minutes.

                Details: {lock_error}
            "},
        ),
        BubbleError::Manifest(manifest_error) => log_error(
            "Unable to write the bubble manifest",
            formatdoc! {"
                Details: {manifest_error:?}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
        BubbleError::Registry(registry_error) => on_registry_error(registry_error),
        BubbleError::Staging { path, io_error } => log_error(
            "I/O error while assembling the bubble",
            formatdoc! {"
                An I/O error occurred at:
                {path}

                Details: {io_error}

                Check the free space and permissions of the bubble root,
                then try again.
                ",
                path = path.display(),
            },
        ),
    }
}

fn on_cloak_error(error: &CloakError) {
    match error {
        CloakError::Rename { from, to, io_error } => log_error(
            "Unable to cloak a main-env package",
            formatdoc! {"
                Renaming this artifact out of the import path failed:
                {from}
                -> {to}

                Details: {io_error}

                All renames performed so far have been restored. Check the
                permissions on site-packages.
                ",
                from = from.display(),
                to = to.display(),
            },
        ),
        CloakError::Lock(lock_error) => on_lock_error(lock_error),
    }
}

fn on_config_error(error: &ConfigError) {
    match error {
        ConfigError::Parse { path, parse_error } => log_error(
            "Invalid configuration file",
            formatdoc! {"
                The configuration file could not be parsed as JSON:
                {path}

                Details: {parse_error}

                Fix the syntax error, or delete the file to have it
                regenerated with detected defaults.
                ",
                path = path.display(),
            },
        ),
        ConfigError::DetectDefaults(command_error) => on_captured_command_error(
            "Unable to detect environment defaults",
            command_error,
        ),
        other => log_error(
            "Unable to load configuration",
            formatdoc! {"
                Details: {other:?}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
    }
}

fn on_knowledge_base_error(error: &KnowledgeBaseError) {
    log_error(
        "Knowledge base update failed",
        formatdoc! {"
            The package index for this environment could not be updated.

            Details: {error:?}

            The index is a cache: a full rebuild will repopulate it from
            the filesystem.
        "},
    );
}

fn on_registry_error(error: &RegistryError) {
    match error {
        RegistryError::Lock(lock_error) => on_lock_error(lock_error),
        other => log_error(
            "Unable to update the bubble registry",
            formatdoc! {"
                Details: {other:?}

                The registry is an accelerator over the bubble directory
                names; deleting package_paths.json is always safe.
            "},
        ),
    }
}

fn on_surgeon_error(error: &SurgeonError) {
    match error {
        SurgeonError::Installer(command_error) => on_captured_command_error(
            "The external installer did not exit successfully",
            command_error,
        ),
        SurgeonError::UnpinnedSpec { spec, .. } => log_error(
            "Unpinned requirement",
            formatdoc! {"
                The requirement '{spec}' does not pin an exact version.

                Multi-version management needs exact pins, for example:
                requests==2.31.0
            "},
        ),
        SurgeonError::Bubble(bubble_error) => on_bubble_error(bubble_error),
        SurgeonError::KnowledgeBase(kb_error) => on_knowledge_base_error(kb_error),
        SurgeonError::Discover(discover_error) => log_error(
            "Unable to scan site-packages",
            formatdoc! {"
                An I/O error occurred while scanning:
                {path}

                Details: {io_error}
                ",
                path = discover_error.site_dir.display(),
                io_error = discover_error.io_error,
            },
        ),
    }
}

fn on_worker_error(error: &WorkerError) {
    match error {
        WorkerError::Startup { spec, detail } => log_error(
            "Unable to start the fallback worker",
            formatdoc! {"
                The subprocess worker for {spec} could not be started:

                {detail}

                The worker is the last resort when in-process activation is
                impossible, so this activation cannot proceed. Check that
                the configured Python executable is runnable.
            "},
        ),
        WorkerError::Execution { spec, error, stderr, .. } => log_error(
            "Code execution failed in the worker",
            formatdoc! {"
                The worker for {spec} reported an error:

                {error}

                {stderr}
            "},
        ),
        WorkerError::Frame(frame_error) => log_error(
            "Worker protocol failure",
            formatdoc! {"
                The framed protocol between this process and the worker
                broke down.

                Details: {frame_error:?}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
        WorkerError::Protocol(detail) => log_error(
            "Worker protocol failure",
            formatdoc! {"
                Details: {detail}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
    }
}

fn on_lock_error(error: &LockAcquireError) {
    match error {
        LockAcquireError::Timeout { path, waited } => log_error(
            "Timed out waiting for a file lock",
            formatdoc! {"
                Another process held this lock for more than {waited:?}:
                {path}

                If the other process has crashed, its lock was released by
                the operating system when it exited and the stale lock file
                is harmless; trying again is safe.
                ",
                path = path.display(),
            },
        ),
        LockAcquireError::Io { path, io_error } => log_error(
            "Unable to acquire a file lock",
            formatdoc! {"
                An I/O error occurred on the lock file:
                {path}

                Details: {io_error}

                {INTERNAL_ERROR_MESSAGE}
                ",
                path = path.display(),
            },
        ),
    }
}

fn on_captured_command_error(header: &str, error: &CapturedCommandError) {
    match error {
        CapturedCommandError::Io(CommandIoError { program, io_error }) => log_error(
            format!("Unable to run {program}"),
            formatdoc! {"
                An I/O error occurred while trying to run:
                `{program}`

                Details: {io_error}

                {INTERNAL_ERROR_MESSAGE}
            "},
        ),
        CapturedCommandError::NonZeroExitStatus(output) => log_error(
            header.to_string(),
            formatdoc! {"
                The command did not exit successfully ({exit_status}).

                Details:

                {stderr}

                In some cases, this happens due to an unstable network
                connection. Please try again to see if the error resolves
                itself.

                If that does not help, check the status of PyPI (the
                upstream Python package repository service), here:
                https://status.python.org
                ",
                exit_status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr),
            },
        ),
        CapturedCommandError::TimedOut { program, timeout } => log_error(
            header.to_string(),
            formatdoc! {"
                `{program}` was still running after {timeout:?} and was
                terminated.

                In some cases, this happens due to an unstable network
                connection. Please try again to see if the error resolves
                itself.
            "},
        ),
    }
}

const INTERNAL_ERROR_MESSAGE: &str = indoc! {"
    This is an unexpected error that could be caused by a bug
    in this tool, or an issue with the local environment.

    Try the operation again to see if the error resolves itself.
"};
