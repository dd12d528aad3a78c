//! Executable resolution and containment checks.
//!
//! A binary plugin's executable is named relative to its bundle directory.
//! Before anything is spawned, both the directory and the resolved
//! executable are canonicalised (following symlinks) and the executable must
//! land inside the directory. This blocks `..` traversal and symlink
//! escapes; a manifest can never point the host at a binary outside its own
//! bundle.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Why an executable could not be accepted for launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The named executable does not exist.
    #[error("executable not found: {path}")]
    NotFound {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// The plugin directory itself could not be resolved.
    #[error("cannot resolve plugin directory '{path}': {reason}")]
    CannotResolve {
        /// The directory that failed to resolve.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// The executable exists but could not be inspected.
    #[error("cannot access '{path}': {reason}")]
    CannotAccess {
        /// The path that failed.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// The file has no execute bit set.
    #[error("'{path}' is not executable")]
    NotExecutable {
        /// The rejected path.
        path: PathBuf,
    },

    /// The resolved executable lies outside the resolved plugin directory.
    #[error("'{path}' escapes the plugin directory '{dir}'")]
    EscapesPluginDirectory {
        /// The resolved executable.
        path: PathBuf,
        /// The resolved plugin directory.
        dir: PathBuf,
    },
}

/// Resolves `executable` against `dir` and proves containment.
///
/// Returns the canonical path to spawn. Errors here mean no child process
/// was created.
pub fn resolve_executable(dir: &Path, executable: &str) -> Result<PathBuf, LaunchError> {
    let dir = dir
        .canonicalize()
        .map_err(|e| LaunchError::CannotResolve {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

    let candidate = dir.join(executable);
    let resolved = candidate.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::NotFound { path: candidate.clone() }
        } else {
            LaunchError::CannotAccess {
                path: candidate.clone(),
                reason: e.to_string(),
            }
        }
    })?;

    // Containment: the canonical executable must sit under the canonical
    // directory, i.e. the relative path is neither absolute nor `..`-led.
    if resolved.strip_prefix(&dir).is_err() {
        return Err(LaunchError::EscapesPluginDirectory {
            path: resolved,
            dir,
        });
    }

    let metadata = std::fs::metadata(&resolved).map_err(|e| LaunchError::CannotAccess {
        path: resolved.clone(),
        reason: e.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(LaunchError::NotExecutable { path: resolved });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::NotExecutable { path: resolved });
        }
    }

    Ok(resolved)
}
