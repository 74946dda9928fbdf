//! File-based distributed lock.

use async_trait::async_trait;
use distlock_core::naming::{replace_invalid_chars, to_safe_name};
use distlock_core::{
    CancellationToken, DistributedLock, LockError, LockHandle, LockResult, Release, Timeout,
    busy_wait,
};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::FileLockOptions;

/// Extension given to lock files created from lock names.
pub const LOCK_FILE_EXTENSION: &str = "lock";

/// Longest file name most file systems accept.
const MAX_FILE_NAME_LEN: usize = 255;

/// A file-based distributed lock.
///
/// Holding the lock means holding an exclusive OS lock on an open lock file.
/// The file is created on demand and deleted on release.
///
/// # Example
///
/// ```rust,ignore
/// use distlock_file::FileDistributedLock;
/// use distlock_core::DistributedLock;
///
/// let lock = FileDistributedLock::new("/var/lock/myapp", "nightly-report")?;
/// let handle = lock.acquire_timeout(Duration::from_secs(5)).await?;
/// // Critical section
/// handle.release().await?;
/// ```
#[derive(Debug, Clone)]
pub struct FileDistributedLock {
    name: String,
    path: PathBuf,
    options: FileLockOptions,
}

impl FileDistributedLock {
    /// Create a lock named `name` inside `directory`.
    pub fn new(directory: impl AsRef<Path>, name: &str) -> LockResult<Self> {
        Self::with_options(directory, name, FileLockOptions::default())
    }

    /// Create a lock inside `directory` with explicit options.
    pub fn with_options(
        directory: impl AsRef<Path>,
        name: &str,
        options: FileLockOptions,
    ) -> LockResult<Self> {
        options.validate()?;
        let path = directory.as_ref().join(lock_file_name(name));
        Ok(Self {
            name: name.to_string(),
            path,
            options,
        })
    }

    /// Create a lock on an exact file path.
    ///
    /// Fails if the path is an existing directory or has no file name.
    pub fn from_path(path: impl Into<PathBuf>) -> LockResult<Self> {
        let path = path.into();
        if path.file_name().is_none() {
            return Err(LockError::InvalidName(format!(
                "lock path {} has no file name",
                path.display()
            )));
        }
        if path.is_dir() {
            return Err(LockError::InvalidName(format!(
                "lock path {} is a directory",
                path.display()
            )));
        }
        Ok(Self {
            name: path.display().to_string(),
            path,
            options: FileLockOptions::default(),
        })
    }

    /// Replace the options.
    pub fn options(mut self, options: FileLockOptions) -> LockResult<Self> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// Path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn try_acquire_once(&self) -> LockResult<Option<LockHandle>> {
        let path = self.path.clone();
        let max_retries = self.options.max_permission_retries;
        let file = tokio::task::spawn_blocking(move || try_lock_file(&path, max_retries)).await??;

        Ok(file.map(|file| {
            info!(lock = %self.name, path = %self.path.display(), "Acquired file lock");
            LockHandle::new(
                self.name.clone(),
                CancellationToken::new(),
                FileLockRelease {
                    file,
                    path: self.path.clone(),
                },
            )
        }))
    }
}

#[async_trait]
impl DistributedLock for FileDistributedLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire_with(
        &self,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockHandle>> {
        busy_wait(&self.options.busy_wait, timeout, cancel, |_| {
            self.try_acquire_once()
        })
        .await
    }
}

/// Releases a held lock file.
struct FileLockRelease {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl Release for FileLockRelease {
    async fn release(self: Box<Self>) -> LockResult<()> {
        tokio::task::spawn_blocking(move || self.release_blocking()).await?
    }
}

impl FileLockRelease {
    // Unlink while still locked so a waiter that opened the old file sees it
    // was replaced and retries on a fresh one.
    #[cfg(unix)]
    fn release_blocking(self) -> LockResult<()> {
        let removed = remove_if_exists(&self.path);
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to unlock lock file");
        }
        drop(self.file);
        removed?;
        debug!(path = %self.path.display(), "Released file lock");
        Ok(())
    }

    // Open files cannot be removed here; close first.
    #[cfg(not(unix))]
    fn release_blocking(self) -> LockResult<()> {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to unlock lock file");
        }
        drop(self.file);
        if let Err(e) = remove_if_exists(&self.path) {
            // Another process may already have the file open again.
            debug!(path = %self.path.display(), error = %e, "Lock file not removed");
        }
        debug!(path = %self.path.display(), "Released file lock");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> LockResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::Io(e)),
    }
}

/// Map a lock name onto a lock file name.
pub fn lock_file_name(name: &str) -> String {
    let suffix_len = LOCK_FILE_EXTENSION.len() + 1;
    let stem = to_safe_name(
        name,
        MAX_FILE_NAME_LEN - suffix_len,
        is_valid_file_stem,
        |n| replace_invalid_chars(n, is_valid_file_char),
    );
    format!("{}.{}", stem, LOCK_FILE_EXTENSION)
}

fn is_valid_file_char(c: char) -> bool {
    !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

fn is_valid_file_stem(stem: &str) -> bool {
    const RESERVED: [&str; 4] = ["CON", "PRN", "AUX", "NUL"];

    if stem.is_empty() || stem.ends_with(' ') || stem.ends_with('.') || stem.starts_with('.') {
        return false;
    }
    let upper = stem.to_ascii_uppercase();
    let reserved = RESERVED.contains(&upper.as_str())
        || ((upper.starts_with("COM") || upper.starts_with("LPT"))
            && upper.len() == 4
            && upper.as_bytes()[3].is_ascii_digit());
    !reserved && stem.chars().all(is_valid_file_char)
}

/// One acquisition attempt: `Ok(None)` when busy or transiently failing.
fn try_lock_file(path: &Path, max_retries: u32) -> LockResult<Option<File>> {
    let mut retries = 0;

    loop {
        if !ensure_directory(path, &mut retries, max_retries)? {
            return Ok(None);
        }

        let error = match open_and_lock(path) {
            Ok(file) => return Ok(file),
            Err(e) => e,
        };

        if path.is_dir() {
            return Err(LockError::InvalidName(format!(
                "lock path {} is a directory",
                path.display()
            )));
        }

        match error.kind() {
            ErrorKind::InvalidFilename => {
                return Err(LockError::InvalidName(format!(
                    "lock path {} is too long: {}",
                    path.display(),
                    error
                )));
            }
            ErrorKind::PermissionDenied => {
                if fs::metadata(path).is_ok_and(|m| m.permissions().readonly()) {
                    return Err(LockError::Backend(format!(
                        "lock file {} is read-only",
                        path.display()
                    )));
                }
                retries += 1;
                if retries > max_retries {
                    return Err(LockError::RetriesExhausted {
                        attempts: retries,
                        reason: format!("opening {}: {}", path.display(), error),
                    });
                }
                debug!(path = %path.display(), retries, "Transient permission error opening lock file");
            }
            _ => {
                debug!(path = %path.display(), error = %error, "Transient error opening lock file");
                return Ok(None);
            }
        }
    }
}

/// Make sure the lock file's directory exists.
///
/// Returns `Ok(false)` for a transient failure the next busy-wait cycle
/// should retry.
fn ensure_directory(path: &Path, retries: &mut u32, max_retries: u32) -> LockResult<bool> {
    let Some(directory) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(true);
    };

    loop {
        let error = match fs::create_dir_all(directory) {
            Ok(()) => return Ok(true),
            Err(e) => e,
        };

        if directory.is_dir() {
            return Ok(true);
        }

        match error.kind() {
            ErrorKind::InvalidFilename => {
                return Err(LockError::InvalidName(format!(
                    "lock directory {} is too long: {}",
                    directory.display(),
                    error
                )));
            }
            ErrorKind::PermissionDenied => {
                // The parent exists, so the denial is real and will not go away.
                if directory.parent().is_some_and(|p| p.is_dir()) {
                    return Err(LockError::Io(error));
                }
                *retries += 1;
                if *retries > max_retries {
                    return Err(LockError::RetriesExhausted {
                        attempts: *retries,
                        reason: format!("creating {}: {}", directory.display(), error),
                    });
                }
            }
            ErrorKind::AlreadyExists | ErrorKind::NotADirectory => {
                return Err(LockError::InvalidName(format!(
                    "{} exists and is not a directory",
                    directory.display()
                )));
            }
            _ => {
                debug!(directory = %directory.display(), error = %error, "Transient error creating lock directory");
                return Ok(false);
            }
        }
    }
}

/// Open (creating if needed) and exclusively lock `path`.
///
/// `Ok(None)` means another handle holds the lock.
pub(crate) fn open_and_lock(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(None),
        Err(e) => return Err(e),
    }

    if !still_linked(&file, path)? {
        return Ok(None);
    }
    Ok(Some(file))
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether the locked file is still the one at `path`.
///
/// A releasing holder unlinks the file before unlocking it, so a waiter that
/// opened it just before can win the lock on an orphan.
#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}
