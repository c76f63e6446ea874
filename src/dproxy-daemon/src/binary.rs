//! Staging of the daemon executable before it is injected into a sandbox.
//!
//! The preparer copies the configured daemon build into a private staging
//! directory under a deterministic name. Repeated calls with an unchanged
//! source reuse the staged copy as-is.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::BinaryError;

/// Architectures the daemon is built for, with the suffix used for the
/// staged file name.
const SUPPORTED_ARCHITECTURES: &[(&str, &str)] = &[("x86_64", "amd64"), ("aarch64", "arm64")];

/// Default staging directory name under the system temp dir.
const DEFAULT_STAGING_DIR: &str = "dproxy-binaries";

/// Copies and validates the daemon executable into a staging location.
#[derive(Debug)]
pub struct BinaryPreparer {
    staging_dir: PathBuf,
    arch: String,
    staged: Option<PathBuf>,
}

impl Default for BinaryPreparer {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join(DEFAULT_STAGING_DIR))
    }
}

impl BinaryPreparer {
    /// Create a preparer that stages into `staging_dir`.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            arch: std::env::consts::ARCH.to_string(),
            staged: None,
        }
    }

    /// Override the host architecture.
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    /// Directory staged binaries are written to.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Path of the currently staged binary, if any.
    pub fn staged_path(&self) -> Option<&Path> {
        self.staged.as_deref()
    }

    /// Stage `source` and return the path of the staged executable.
    ///
    /// If a staged copy already exists with the same size and modification
    /// time as the source it is returned untouched. Otherwise the stale copy
    /// is replaced. A failed copy never leaves a partial file behind.
    pub fn prepare_binary(&mut self, source: impl AsRef<Path>) -> Result<PathBuf, BinaryError> {
        let suffix = self.validate_architecture()?;
        let source = source.as_ref();
        let source_meta = validate_source(source)?;

        let target = self.staging_dir.join(format!("daemon-{suffix}"));

        if target.exists() {
            if same_file_stamp(&source_meta, &target) {
                debug!(path = %target.display(), "Binary already staged");
                self.staged = Some(target.clone());
                return Ok(target);
            }
            fs::remove_file(&target).map_err(|source| BinaryError::Staging {
                path: target.clone(),
                source,
            })?;
            debug!(path = %target.display(), "Removed outdated staged binary");
        }

        if let Err(e) = stage_copy(source, &target, &source_meta) {
            if target.exists()
                && let Err(remove_err) = fs::remove_file(&target)
            {
                warn!(path = %target.display(), "Failed to remove partial binary: {}", remove_err);
            }
            return Err(e);
        }

        info!(
            source = %source.display(),
            target = %target.display(),
            "Staged daemon binary"
        );
        self.staged = Some(target.clone());
        Ok(target)
    }

    /// Remove the staged binary and, when empty, the staging directory.
    ///
    /// Safe to call any number of times.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.staged.take() {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "Cleaned up staged binary"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to clean up staged binary: {}", e),
            }
        }

        let is_empty = fs::read_dir(&self.staging_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            match fs::remove_dir(&self.staging_dir) {
                Ok(()) => debug!(dir = %self.staging_dir.display(), "Removed empty staging directory"),
                Err(e) => warn!(
                    dir = %self.staging_dir.display(),
                    "Failed to remove staging directory: {}", e
                ),
            }
        }
    }

    fn validate_architecture(&self) -> Result<&'static str, BinaryError> {
        SUPPORTED_ARCHITECTURES
            .iter()
            .find(|(arch, _)| *arch == self.arch)
            .map(|(_, suffix)| *suffix)
            .ok_or_else(|| BinaryError::UnsupportedArchitecture {
                arch: self.arch.clone(),
            })
    }
}

fn validate_source(source: &Path) -> Result<fs::Metadata, BinaryError> {
    let meta = match fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BinaryError::NotFound(source.to_path_buf()));
        }
        Err(source_err) => {
            return Err(BinaryError::NotReadable {
                path: source.to_path_buf(),
                source: source_err,
            });
        }
    };

    if !meta.is_file() {
        return Err(BinaryError::NotAFile(source.to_path_buf()));
    }

    File::open(source).map_err(|e| BinaryError::NotReadable {
        path: source.to_path_buf(),
        source: e,
    })?;

    Ok(meta)
}

fn same_file_stamp(source_meta: &fs::Metadata, target: &Path) -> bool {
    let Ok(target_meta) = fs::metadata(target) else {
        return false;
    };
    match (source_meta.modified(), target_meta.modified()) {
        (Ok(a), Ok(b)) => a == b && source_meta.len() == target_meta.len(),
        _ => false,
    }
}

fn stage_copy(source: &Path, target: &Path, source_meta: &fs::Metadata) -> Result<(), BinaryError> {
    let staging_err = |source: io::Error| BinaryError::Staging {
        path: target.to_path_buf(),
        source,
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(staging_err)?;
    }
    fs::copy(source, target).map_err(staging_err)?;

    // Carry the source mtime over so the next call can detect an unchanged source.
    let modified = source_meta.modified().map_err(staging_err)?;
    File::options()
        .write(true)
        .open(target)
        .and_then(|f| f.set_modified(modified))
        .map_err(staging_err)?;

    set_executable(target).map_err(staging_err)?;

    if !is_executable(target) {
        return Err(BinaryError::NotExecutable(target.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    path.is_file()
}
