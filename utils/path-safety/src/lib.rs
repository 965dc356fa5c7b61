//! Path examination primitives shared by the sandbox policy compilers.
//!
//! Everything here is either pure (`normalize`, `symlink_widens`, glob
//! splitting) or reads the filesystem without following the leaf symlink.
//! None of it mutates the filesystem.

use path_absolutize::Absolutize;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Host-specific directory aliases that must compare as equivalent when
/// judging symlink resolutions (`/tmp` and `/var` are symlinks into
/// `/private` on macOS).
const HOST_ALIAS_PAIRS: &[(&str, &str)] = &[("/private/tmp", "/tmp"), ("/private/var", "/var")];

/// What the leaf of a path is, without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Dir,
    Symlink,
    Missing,
}

/// Make `path` absolute against `base` and collapse `.`/`..` lexically.
///
/// Pure: no filesystem access, no symlink resolution. Trailing slashes are
/// irrelevant after this (they do not survive component iteration).
pub fn normalize(path: impl AsRef<Path>, base: &Path) -> std::io::Result<PathBuf> {
    let absolute = path.as_ref().absolutize_from(base)?;
    // Rebuild from components so a trailing slash cannot survive into the
    // rendered directive.
    Ok(absolute.components().collect())
}

/// Classify the leaf of `path` via `symlink_metadata`.
pub fn classify(path: &Path) -> PathKind {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => PathKind::Symlink,
        Ok(metadata) if metadata.is_dir() => PathKind::Dir,
        Ok(_) => PathKind::File,
        Err(_) => PathKind::Missing,
    }
}

fn map_host_alias(path: &Path) -> PathBuf {
    for (alias, canonical) in HOST_ALIAS_PAIRS {
        if let Ok(rest) = path.strip_prefix(alias) {
            return Path::new(canonical).join(rest);
        }
    }
    path.to_path_buf()
}

/// Whether resolving a symlink at `input` to `resolved` would admit more of
/// the filesystem than the caller's literal path implies.
///
/// Alias-equivalent and strictly deeper resolutions are always fine. Beyond
/// that, a resolution widens scope when it lands on `/`, on an ancestor of
/// the input, on a very short path (≤ 4 bytes, which also rejects `/usr` and
/// `/opt`; kept for parity with the observed behavior), or anywhere outside
/// the directory that contains the symlink.
pub fn symlink_widens(input: &Path, resolved: &Path) -> bool {
    let input = map_host_alias(input);
    let resolved = map_host_alias(resolved);

    if resolved == input {
        return false;
    }
    if resolved.starts_with(&input) {
        // Deeper resolution inside the literal path.
        return false;
    }
    if resolved == Path::new("/") {
        return true;
    }
    if input.starts_with(&resolved) {
        // Resolution to an ancestor admits the whole ancestor subtree.
        return true;
    }
    if resolved.as_os_str().len() <= 4 {
        return true;
    }
    match input.parent() {
        Some(parent) => !resolved.starts_with(parent),
        None => true,
    }
}

/// Walk `target` component-by-component and return the first component that
/// is a symlink lying inside one of `allowed_roots`.
///
/// A deny path whose intermediate component is a symlink under a writable
/// root can be deleted and rebuilt as a real directory; the compilers clobber
/// that component instead of trusting the path below it.
pub fn find_symlink_in_path(target: &Path, allowed_roots: &[PathBuf]) -> Option<PathBuf> {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current.push(Path::new("/"));
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                current.pop();
                continue;
            }
            Component::Normal(part) => current.push(part),
            Component::Prefix(_) => continue,
        }

        let metadata = match std::fs::symlink_metadata(&current) {
            Ok(metadata) => metadata,
            Err(_) => break,
        };

        if metadata.file_type().is_symlink()
            && allowed_roots.iter().any(|root| current.starts_with(root))
        {
            return Some(current);
        }
    }

    None
}

/// True when some existing prefix of `target` is a regular file.
///
/// No `mkdir` sequence can ever materialize such a path (the worktree case,
/// where `.git` is a pointer file), so deny planning skips it.
pub fn has_file_ancestor(target: &Path) -> bool {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current.push(Path::new("/"));
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                current.pop();
                continue;
            }
            Component::Normal(part) => current.push(part),
            Component::Prefix(_) => continue,
        }

        if current == target {
            break;
        }
        match std::fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.is_file() => return true,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    false
}

/// Shortest prefix of `target` that does not exist, or `None` when the whole
/// path exists.
pub fn first_nonexistent(target: &Path) -> Option<PathBuf> {
    let mut current = PathBuf::new();

    for component in target.components() {
        match component {
            Component::RootDir => {
                current.push(Path::new("/"));
                continue;
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                current.pop();
                continue;
            }
            Component::Normal(part) => current.push(part),
            Component::Prefix(_) => continue,
        }

        if !current.exists() {
            return Some(current);
        }
    }

    None
}

/// Nearest prefix of `target` that exists on disk.
pub fn nearest_existing_ancestor(target: &Path) -> Option<PathBuf> {
    let mut current = target;
    loop {
        if current.exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

/// Whether `pattern` contains an unescaped `*` or `?`.
pub fn is_glob(pattern: &str) -> bool {
    let mut escaped = false;
    for ch in pattern.chars() {
        match ch {
            '\\' if !escaped => escaped = true,
            '*' | '?' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// Split a glob pattern into its literal base directory and wildcard tail.
///
/// The base is the longest prefix of whole components containing no wildcard;
/// the tail starts at the first component that does. `"/a/b/*.txt"` splits
/// into `("/a/b", "*.txt")` and `"/a/b*/c"` into `("/a", "b*/c")`.
pub fn split_glob(pattern: &str) -> (PathBuf, String) {
    let first_wildcard = {
        let mut escaped = false;
        let mut index = None;
        for (i, ch) in pattern.char_indices() {
            match ch {
                '\\' if !escaped => escaped = true,
                '*' | '?' if !escaped => {
                    index = Some(i);
                    break;
                }
                _ => escaped = false,
            }
        }
        index
    };

    let Some(first_wildcard) = first_wildcard else {
        return (PathBuf::from(pattern), String::new());
    };

    match pattern[..first_wildcard].rfind('/') {
        Some(0) => (PathBuf::from("/"), pattern[1..].to_string()),
        Some(slash) => (
            PathBuf::from(&pattern[..slash]),
            pattern[slash + 1..].to_string(),
        ),
        None => (PathBuf::new(), pattern.to_string()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_collapses_dots_and_trailing_slashes() {
        let base = Path::new("/work/project");
        assert_eq!(
            normalize("sub/../other/", base).unwrap(),
            PathBuf::from("/work/project/other")
        );
        assert_eq!(normalize("/abs/p/", base).unwrap(), PathBuf::from("/abs/p"));
        assert_eq!(
            normalize("./x", base).unwrap(),
            PathBuf::from("/work/project/x")
        );
    }

    #[test]
    fn classify_distinguishes_leaf_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        assert_eq!(classify(dir.path()), PathKind::Dir);
        assert_eq!(classify(&file), PathKind::File);
        assert_eq!(classify(&link), PathKind::Symlink);
        assert_eq!(classify(&dir.path().join("missing")), PathKind::Missing);
    }

    #[test]
    fn widens_for_root_ancestor_and_short_targets() {
        let input = Path::new("/tmp/work/link");
        assert!(symlink_widens(input, Path::new("/")));
        assert!(symlink_widens(input, Path::new("/tmp/work")));
        assert!(symlink_widens(input, Path::new("/tmp")));
        assert!(symlink_widens(Path::new("/usr/local/link"), Path::new("/opt")));
    }

    #[test]
    fn widens_when_resolution_escapes_the_containing_directory() {
        assert!(symlink_widens(
            Path::new("/tmp/t/user_area/evil"),
            Path::new("/tmp/t/protected")
        ));
        assert!(symlink_widens(
            Path::new("/home/u/project/link"),
            Path::new("/home/u/elsewhere")
        ));
    }

    #[test]
    fn deeper_and_sibling_resolutions_are_allowed() {
        assert!(!symlink_widens(
            Path::new("/tmp/t/user_area/link"),
            Path::new("/tmp/t/user_area/real")
        ));
        assert!(!symlink_widens(
            Path::new("/tmp/t/user_area/link"),
            Path::new("/tmp/t/user_area/link/deeper")
        ));
    }

    #[test]
    fn host_alias_pairs_are_equivalent() {
        assert!(!symlink_widens(
            Path::new("/tmp/work"),
            Path::new("/private/tmp/work")
        ));
        assert!(!symlink_widens(
            Path::new("/var/log/app"),
            Path::new("/private/var/log/app")
        ));
        // The alias only applies to the well-known pairs.
        assert!(symlink_widens(
            Path::new("/tmp/work/link"),
            Path::new("/private/etc")
        ));
    }

    #[test]
    fn finds_symlink_component_inside_allowed_root() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let target = link.join("below");
        let roots = vec![dir.path().to_path_buf()];
        assert_eq!(find_symlink_in_path(&target, &roots), Some(link.clone()));

        // Outside every allowed root the symlink is not reported.
        let other_roots = vec![PathBuf::from("/nonexistent-root")];
        assert_eq!(find_symlink_in_path(&target, &other_roots), None);
    }

    #[test]
    fn file_ancestor_detection_matches_worktree_layout() {
        let dir = tempfile::tempdir().unwrap();
        let dot_git = dir.path().join(".git");
        std::fs::write(&dot_git, "gitdir: /elsewhere\n").unwrap();

        assert!(has_file_ancestor(&dot_git.join("hooks")));
        assert!(!has_file_ancestor(&dir.path().join("missing/hooks")));
    }

    #[test]
    fn first_nonexistent_walks_to_the_break_point() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a").join("b");
        assert_eq!(first_nonexistent(&missing), Some(dir.path().join("a")));
        assert_eq!(first_nonexistent(dir.path()), None);

        std::fs::create_dir(dir.path().join("a")).unwrap();
        assert_eq!(first_nonexistent(&missing), Some(missing.clone()));
    }

    #[test]
    fn nearest_existing_ancestor_stops_at_the_first_hit() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("x/y/z");
        assert_eq!(
            nearest_existing_ancestor(&missing),
            Some(dir.path().to_path_buf())
        );
    }

    #[test]
    fn glob_detection_respects_escapes() {
        assert!(is_glob("/a/*.txt"));
        assert!(is_glob("/a/file?.log"));
        assert!(!is_glob("/a/plain"));
        assert!(!is_glob("/a/star\\*name"));
    }

    #[test]
    fn glob_split_separates_base_and_tail() {
        assert_eq!(
            split_glob("/a/b/*.txt"),
            (PathBuf::from("/a/b"), "*.txt".to_string())
        );
        assert_eq!(
            split_glob("/a/b*/c"),
            (PathBuf::from("/a"), "b*/c".to_string())
        );
        assert_eq!(split_glob("/*"), (PathBuf::from("/"), "*".to_string()));
        assert_eq!(
            split_glob("/no/wildcards"),
            (PathBuf::from("/no/wildcards"), String::new())
        );
    }
}
