use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use std::{fs, io, thread};

/// Read and deserialize the JSON document at `path`, or `None` when no
/// document has been written there yet.
///
/// Every persisted document in this crate (config, registry, failed-version
/// cache, manifests, knowledge base) is read through here and written
/// through [`write_atomically`], so a reader can only ever observe a whole
/// document. "Not written yet" covers more than a missing file: on a fresh
/// bubble root a parent directory may be missing too, and a stray directory
/// sitting where the document belongs is treated the same way rather than
/// surfacing as an I/O error the caller can't act on.
pub(crate) fn read_optional_document<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, ReadDocumentError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(io_error)
            if matches!(
                io_error.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::IsADirectory
                    | io::ErrorKind::NotADirectory
            ) =>
        {
            return Ok(None);
        }
        Err(io_error) => {
            return Err(ReadDocumentError::Io {
                io_error,
                path: path.to_path_buf(),
            });
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(document) => Ok(Some(document)),
        Err(parse_error) => Err(ReadDocumentError::Parse {
            parse_error,
            path: path.to_path_buf(),
        }),
    }
}

/// Errors that can occur when reading a persisted JSON document. Whether a
/// corrupt document is fatal is the caller's call: the registry and the
/// knowledge base rebuild from an empty one, the config and manifests
/// surface it.
#[derive(Debug)]
pub enum ReadDocumentError {
    Io {
        io_error: io::Error,
        path: PathBuf,
    },
    Parse {
        parse_error: serde_json::Error,
        path: PathBuf,
    },
}

/// Write `contents` to `path` atomically: serialize to an adjacent temporary
/// file, then rename over the destination. On POSIX the rename is a single
/// atomic step; a reader that races the write sees either the previous
/// document or the new one, never a truncated file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), WriteAtomicallyError> {
    let error = |io_error| WriteAtomicallyError {
        io_error,
        path: path.to_path_buf(),
    };
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents).map_err(error)?;
    fs::rename(&temp_path, path).or_else(|rename_error| {
        // On Windows the rename fails if the destination exists; retry once
        // after removing it, accepting the small non-atomic window.
        if cfg!(windows) {
            fs::remove_file(path).ok();
            fs::rename(&temp_path, path).map_err(error)
        } else {
            Err(error(rename_error))
        }
    })
}

/// An I/O error that occurred while atomically writing the specified file.
#[derive(Debug)]
pub struct WriteAtomicallyError {
    pub(crate) io_error: io::Error,
    pub(crate) path: PathBuf,
}

/// Run an external command to completion and hand back its captured output.
/// A non-zero exit is an error carrying the full output, since the callers
/// (interpreter queries, activated-context execution) always want the
/// child's stderr to explain what went wrong.
pub(crate) fn run_command_and_capture_output(
    command: &mut Command,
) -> Result<Output, CapturedCommandError> {
    let program = command.get_program().to_string_lossy().to_string();
    let output = command
        .output()
        .map_err(|io_error| CapturedCommandError::Io(CommandIoError { program, io_error }))?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(CapturedCommandError::NonZeroExitStatus(output))
    }
}

/// Like [`run_command_and_capture_output`], but kills the process and reports
/// a timeout if it has not exited before the deadline. Used for the
/// subprocess import probes and the external installer, both of which have
/// hard upper bounds on how long they may run.
pub(crate) fn run_command_with_deadline(
    command: &mut Command,
    timeout: Duration,
) -> Result<Output, CapturedCommandError> {
    let program = command.get_program().to_string_lossy().to_string();
    let io_error = |program: &str, io_error| {
        CapturedCommandError::Io(CommandIoError {
            program: program.to_string(),
            io_error,
        })
    };

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| io_error(&program, error))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                child.kill().ok();
                child.wait().ok();
                return Err(CapturedCommandError::TimedOut { program, timeout });
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(error) => {
                child.kill().ok();
                return Err(io_error(&program, error));
            }
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|error| io_error(&program, error))?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(CapturedCommandError::NonZeroExitStatus(output))
    }
}

/// Errors that can occur when running an external process using
/// `run_command_and_capture_output` or `run_command_with_deadline`.
#[derive(Debug)]
pub enum CapturedCommandError {
    Io(CommandIoError),
    NonZeroExitStatus(Output),
    TimedOut { program: String, timeout: Duration },
}

/// I/O error that occurred while spawning/waiting on a command,
/// such as when the program wasn't found.
#[derive(Debug)]
pub struct CommandIoError {
    pub(crate) program: String,
    pub(crate) io_error: io::Error,
}

/// Copy a single file to `destination`, creating any missing parent
/// directories first. Timestamps are not preserved; content and the
/// executable bit are.
pub(crate) fn copy_file_with_dirs(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, destination)?;
    Ok(())
}

/// Create a symlink at `link` pointing at `target`, skipping the operation
/// when `link` already exists in any form.
#[cfg(unix)]
pub(crate) fn symlink_if_absent(target: &Path, link: &Path) -> io::Result<()> {
    match std::os::unix::fs::symlink(target, link) {
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
pub(crate) fn symlink_if_absent(target: &Path, link: &Path) -> io::Result<()> {
    // Symlinking into bubbles is a non-destructive optimization; without
    // symlink support the dependency fallthrough path covers the same need.
    let _ = (target, link);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_optional_document_absent_in_all_forms() {
        // Missing file, missing parent directory, a directory sitting where
        // the document belongs, and a file where a parent should be: all of
        // these mean "no document yet".
        for path in [
            "tests/fixtures/non-existent-file.json",
            "tests/fixtures/non-existent-dir/document.json",
            "tests/fixtures/",
            "Cargo.toml/document.json",
        ] {
            assert_eq!(
                read_optional_document::<serde_json::Value>(Path::new(path)).unwrap(),
                None
            );
        }
    }

    #[test]
    fn read_optional_document_round_trips_json() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("document.json");
        fs::write(&path, "{\"entries\": 2}").unwrap();
        let document: serde_json::Value = read_optional_document(&path).unwrap().unwrap();
        assert_eq!(document["entries"], 2);
    }

    #[test]
    fn read_optional_document_reports_corruption() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("document.json");
        fs::write(&path, "{torn").unwrap();
        assert!(matches!(
            read_optional_document::<serde_json::Value>(&path).unwrap_err(),
            ReadDocumentError::Parse { path: parse_path, .. } if parse_path == path
        ));
    }

    #[test]
    fn write_atomically_replaces_contents() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("document.json");
        write_atomically(&path, b"{\"first\": 1}").unwrap();
        write_atomically(&path, b"{\"second\": 2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"second\": 2}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn run_command_and_capture_output_success() {
        let output =
            run_command_and_capture_output(Command::new("bash").args(["-c", "echo output"]))
                .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "output\n");
    }

    #[test]
    fn run_command_and_capture_output_io_error() {
        assert!(matches!(
            run_command_and_capture_output(&mut Command::new("non-existent-command")).unwrap_err(),
            CapturedCommandError::Io(_)
        ));
    }

    #[test]
    fn run_command_and_capture_output_non_zero_exit_status() {
        assert!(matches!(
            run_command_and_capture_output(Command::new("bash").args(["-c", "false"])).unwrap_err(),
            CapturedCommandError::NonZeroExitStatus(_)
        ));
    }

    #[test]
    fn run_command_with_deadline_success() {
        let output = run_command_with_deadline(
            Command::new("bash").args(["-c", "echo output"]),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "output\n");
    }

    #[test]
    fn run_command_with_deadline_times_out() {
        let started = Instant::now();
        assert!(matches!(
            run_command_with_deadline(
                Command::new("bash").args(["-c", "sleep 30"]),
                Duration::from_millis(200),
            )
            .unwrap_err(),
            CapturedCommandError::TimedOut { program, .. } if program == "bash"
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn copy_file_with_dirs_creates_parents() {
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source.txt");
        fs::write(&source, "payload").unwrap();
        let destination = scratch.path().join("a/b/c/destination.txt");
        copy_file_with_dirs(&source, &destination).unwrap();
        assert_eq!(fs::read_to_string(&destination).unwrap(), "payload");
    }
}
