//! Teardown of host-side artifacts left behind by policy compilation.
//!
//! Binding over a non-existent path makes the sandbox tool materialize an
//! empty file or directory on the host. Those mount points, and any
//! runtime-generated syscall-filter files, are registered here at plan time
//! and removed after the sandboxed command returns. An exit handler installed
//! on first registration is the safety net for abnormal teardown.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::Once;
use tracing::debug;

static MOUNT_POINTS: LazyLock<Mutex<BTreeSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(BTreeSet::new()));
static GENERATED_FILTERS: LazyLock<Mutex<BTreeSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(BTreeSet::new()));
static EXIT_HOOK: Once = Once::new();

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

extern "C" fn reap_on_exit() {
    cleanup();
}

fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // Compilation is serial per process, so there is no registration race.
        unsafe {
            libc::atexit(reap_on_exit);
        }
    });
}

/// Record a host path where the sandbox tool will materialize an empty entry.
pub fn register_mount_point(path: PathBuf) {
    install_exit_hook();
    debug!(path = %path.display(), "registered mount-point artifact");
    lock(&MOUNT_POINTS).insert(path);
}

/// Record a runtime-generated syscall-filter file for teardown.
pub fn register_generated_filter(path: PathBuf) {
    install_exit_hook();
    debug!(path = %path.display(), "registered generated filter artifact");
    lock(&GENERATED_FILTERS).insert(path);
}

/// Remove registered artifacts that are still inert: zero-byte files and
/// empty directories. Anything another actor has written real content into is
/// left alone. Idempotent and infallible.
pub fn cleanup() {
    let mount_points: Vec<PathBuf> = {
        let mut set = lock(&MOUNT_POINTS);
        let drained = set.iter().cloned().collect();
        set.clear();
        drained
    };
    for path in mount_points {
        remove_if_empty(&path);
    }

    let filters: Vec<PathBuf> = {
        let mut set = lock(&GENERATED_FILTERS);
        let drained = set.iter().cloned().collect();
        set.clear();
        drained
    };
    for path in filters {
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), %err, "generated filter already gone");
        }
    }
}

/// Remove only the generated syscall-filter files, used when compilation
/// fails partway and the mount plan was never handed to the sandbox tool.
pub fn cleanup_generated_filters() {
    let filters: Vec<PathBuf> = {
        let mut set = lock(&GENERATED_FILTERS);
        let drained = set.iter().cloned().collect();
        set.clear();
        drained
    };
    for path in filters {
        let _ = std::fs::remove_file(&path);
    }
}

fn remove_if_empty(path: &Path) {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };

    if metadata.is_file() && metadata.len() == 0 {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(path = %path.display(), %err, "could not remove mount-point file");
        }
        return;
    }

    if metadata.is_dir() {
        let is_empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            if let Err(err) = std::fs::remove_dir(path) {
                debug!(path = %path.display(), %err, "could not remove mount-point dir");
            }
        } else {
            debug!(path = %path.display(), "mount point has real content, leaving it");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(reaper)]
    fn cleanup_removes_empty_artifacts_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let ghost_file = dir.path().join(".ghost");
        std::fs::write(&ghost_file, b"").unwrap();
        let ghost_dir = dir.path().join("ghost_dir");
        std::fs::create_dir(&ghost_dir).unwrap();
        let kept_file = dir.path().join("kept");
        std::fs::write(&kept_file, b"real content").unwrap();
        let kept_dir = dir.path().join("kept_dir");
        std::fs::create_dir(&kept_dir).unwrap();
        std::fs::write(kept_dir.join("inner"), b"x").unwrap();

        register_mount_point(ghost_file.clone());
        register_mount_point(ghost_dir.clone());
        register_mount_point(kept_file.clone());
        register_mount_point(kept_dir.clone());

        cleanup();

        assert!(!ghost_file.exists());
        assert!(!ghost_dir.exists());
        assert!(kept_file.exists());
        assert!(kept_dir.exists());
    }

    #[test]
    #[serial(reaper)]
    fn cleanup_is_idempotent_and_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let never_created = dir.path().join("never_created");
        register_mount_point(never_created);

        cleanup();
        cleanup();
    }

    #[test]
    #[serial(reaper)]
    fn generated_filters_are_unconditionally_removed() {
        let dir = tempfile::tempdir().unwrap();
        let filter = dir.path().join("unix-sockets.bpf");
        std::fs::write(&filter, b"\x06\x00\x00\x00").unwrap();

        register_generated_filter(filter.clone());
        cleanup();

        assert!(!filter.exists());
    }
}
