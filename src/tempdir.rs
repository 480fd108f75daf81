//! Private working directories for instances.
//!
//! Every directory created by [`make`] is recorded in a process-wide tracking
//! set. Instance teardown removes its own directory with [`remove`]; the
//! host-exit hooks call [`cleanup`] to sweep whatever is left.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// How many names to try before giving up on collisions.
const MAX_NAME_ATTEMPTS: usize = 8;

static TRACKED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn tracked() -> &'static Mutex<HashSet<PathBuf>> {
    TRACKED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Create `<root>/<prefix>_<user>_<pid>_<random>` with owner-only permissions.
///
/// The returned path is absolute and canonical. The directory is tracked
/// until [`remove`] or [`cleanup`] deletes it.
pub fn make(root: &Path, prefix: &str) -> Result<PathBuf> {
    let unavailable = |reason: String| Error::TempDirUnavailable {
        root: root.to_path_buf(),
        reason,
    };

    let root = root
        .canonicalize()
        .map_err(|e| unavailable(format!("cannot resolve temp root: {}", e)))?;
    let user = current_user();
    let pid = std::process::id();

    for _ in 0..MAX_NAME_ATTEMPTS {
        let suffix: u64 = rand::thread_rng().gen();
        let path = root.join(format!("{}_{}_{}_{:016x}", prefix, user, pid, suffix));

        match create_private_dir(&path) {
            Ok(()) => {
                tracked().lock().insert(path.clone());
                tracing::debug!("Created working directory {}", path.display());
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(unavailable(e.to_string())),
        }
    }

    Err(unavailable(format!(
        "no unused name after {} attempts",
        MAX_NAME_ATTEMPTS
    )))
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir(path)
}

/// Remove one directory and stop tracking it. A missing directory is success.
pub async fn remove(path: &Path) -> Result<()> {
    let result = match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    };
    if result.is_ok() {
        tracked().lock().remove(path);
    }
    result
}

/// Synchronous variant of [`remove`] for exit paths without a runtime.
pub fn remove_blocking(path: &Path) -> Result<()> {
    let result = match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    };
    if result.is_ok() {
        tracked().lock().remove(path);
    }
    result
}

/// Remove every tracked directory, logging (never returning) failures.
///
/// Returns how many directories were removed.
pub fn cleanup() -> usize {
    let paths: Vec<PathBuf> = tracked().lock().drain().collect();
    sweep(paths)
}

fn sweep(paths: Vec<PathBuf>) -> usize {
    let mut removed = 0;

    for path in paths {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    removed
}

/// Whether `path` is currently tracked for removal.
pub fn is_tracked(path: &Path) -> bool {
    tracked().lock().contains(path)
}

/// Login name of the current user, reduced to `[A-Za-z0-9_-]`.
pub fn current_user() -> String {
    let raw = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(user_from_passwd)
        .unwrap_or_else(|| "unknown".to_string());

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(unix)]
fn user_from_passwd() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(not(unix))]
fn user_from_passwd() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_creates_named_private_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = make(root.path(), "throwaway_db").unwrap();

        assert!(dir.is_dir());
        assert!(dir.is_absolute());
        assert!(is_tracked(&dir));

        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        let expected = format!("throwaway_db_{}_{}_", current_user(), std::process::id());
        assert!(name.starts_with(&expected), "unexpected name {}", name);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        remove_blocking(&dir).unwrap();
        assert!(!dir.exists());
        assert!(!is_tracked(&dir));
    }

    #[test]
    fn make_gives_unique_names() {
        let root = tempfile::tempdir().unwrap();
        let a = make(root.path(), "t").unwrap();
        let b = make(root.path(), "t").unwrap();
        assert_ne!(a, b);
        remove_blocking(&a).unwrap();
        remove_blocking(&b).unwrap();
    }

    #[test]
    fn make_fails_for_missing_root() {
        let err = make(Path::new("/definitely/not/here"), "t").unwrap_err();
        assert!(matches!(err, Error::TempDirUnavailable { .. }));
    }

    #[tokio::test]
    async fn remove_tolerates_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = make(root.path(), "t").unwrap();
        std::fs::write(dir.join("file"), b"x").unwrap();

        remove(&dir).await.unwrap();
        assert!(!dir.exists());
        // Second removal is a no-op
        remove(&dir).await.unwrap();
    }

    // cleanup() itself drains the process-wide set, which would race with
    // other tests; exercise the sweep it delegates to instead.
    #[test]
    fn sweep_removes_dirs_and_skips_missing() {
        let root = tempfile::tempdir().unwrap();
        let present = root.path().join("present");
        std::fs::create_dir_all(present.join("rethinkdb_data")).unwrap();
        let missing = root.path().join("missing");

        assert_eq!(sweep(vec![present.clone(), missing]), 1);
        assert!(!present.exists());
    }

    #[test]
    fn current_user_is_sanitized() {
        let user = current_user();
        assert!(!user.is_empty());
        assert!(user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}
