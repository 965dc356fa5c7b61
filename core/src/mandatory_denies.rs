//! Built-in write denies derived from the working directory.
//!
//! Shell rc files, VCS internals, and editor/agent configuration are denied
//! regardless of the caller's policy: a command that can append to `.bashrc`
//! or drop a `.git/hooks/pre-commit` escalates out of the sandbox the next
//! time a human touches the directory. The working-directory entries are
//! computed locally; nested copies are discovered through one bounded run of
//! the external file-index scanner.

use shelter_utils_path_safety::PathKind;
use shelter_utils_path_safety::classify;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Dotfiles that must never be writable, wherever they appear.
///
/// Part of the external contract: shell rc files (including direnv's
/// `.envrc`), git identity/module config, the ripgrep config hook, and
/// agent-config manifests.
pub const DANGEROUS_FILES: &[&str] = &[
    ".bashrc",
    ".bash_profile",
    ".zshrc",
    ".zprofile",
    ".profile",
    ".envrc",
    ".gitconfig",
    ".gitmodules",
    ".ripgreprc",
    ".mcp.json",
];

/// Directories that must never be writable: IDE settings and agent
/// command/agent definitions, which editors and agents execute implicitly.
pub const DANGEROUS_DIRECTORIES: &[&str] =
    &[".vscode", ".idea", ".claude/commands", ".claude/agents"];

/// Inputs for one enumeration pass.
pub struct MandatoryDenyRequest<'a> {
    pub cwd: &'a Path,
    pub allow_git_config: bool,
    /// Directory depth bound for the nested scan.
    pub search_depth: usize,
    /// Scanner binary override; `rg` from `PATH` otherwise.
    pub scanner: Option<&'a Path>,
    pub cancel: Option<&'a CancellationToken>,
}

/// Produce the deduplicated set of absolute paths to add to the write-deny
/// list.
///
/// Best-effort by design: the working-directory entries are always present,
/// and a missing, failing, or cancelled scanner only costs the nested
/// entries.
pub async fn enumerate_mandatory_denies(request: MandatoryDenyRequest<'_>) -> Vec<PathBuf> {
    let mut denies: BTreeSet<PathBuf> = BTreeSet::new();

    for name in DANGEROUS_FILES {
        denies.insert(request.cwd.join(name));
    }
    for name in DANGEROUS_DIRECTORIES {
        denies.insert(request.cwd.join(name));
    }
    denies.extend(version_control_denies(
        &request.cwd.join(".git"),
        request.allow_git_config,
    ));

    if request.search_depth > 0 {
        match scan_nested(&request).await {
            Some(nested) => denies.extend(nested),
            None => debug!("nested mandatory-deny scan yielded no results"),
        }
    }

    denies.into_iter().collect()
}

/// Denies contributed by a `.git` entry, sensitive to its on-disk layout.
///
/// Only a real `.git` directory gets `hooks` (and `config`, unless the caller
/// opted out). A worktree pointer file or a missing `.git` contributes
/// nothing: denying below a file makes the downstream compiler plan a mount
/// under a file, and denying a missing `.git` blocks git from creating its
/// own directory.
fn version_control_denies(dot_git: &Path, allow_git_config: bool) -> Vec<PathBuf> {
    match classify(dot_git) {
        PathKind::Dir => {
            let mut denies = vec![dot_git.join("hooks")];
            if !allow_git_config {
                denies.push(dot_git.join("config"));
            }
            denies
        }
        PathKind::File | PathKind::Symlink | PathKind::Missing => Vec::new(),
    }
}

/// Run the external file-index scanner once and map its hits back to deny
/// paths. Returns `None` when the scanner is unavailable, fails, or is
/// cancelled.
async fn scan_nested(request: &MandatoryDenyRequest<'_>) -> Option<BTreeSet<PathBuf>> {
    let scanner = match request.scanner {
        Some(binary) => binary.to_path_buf(),
        None => match which::which("rg") {
            Ok(binary) => binary,
            Err(err) => {
                warn!(%err, "file-index scanner not found, nested mandatory denies skipped");
                return None;
            }
        },
    };

    let mut command = tokio::process::Command::new(&scanner);
    command
        .arg("--files")
        .arg("--hidden")
        .arg("--no-ignore")
        .arg("--max-depth")
        .arg(request.search_depth.to_string())
        .arg("-g")
        .arg("!**/node_modules/**")
        .current_dir(request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for name in DANGEROUS_FILES {
        command.arg("-g").arg(format!("**/{name}"));
    }
    for name in DANGEROUS_DIRECTORIES {
        command.arg("-g").arg(format!("**/{name}/**"));
    }
    command.arg("-g").arg("**/.git/HEAD");

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, scanner = %scanner.display(), "could not spawn file-index scanner");
            return None;
        }
    };

    // `kill_on_drop` reaps the scanner when the cancelled arm wins.
    let output = match request.cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("mandatory-deny scan cancelled, returning partial results");
                    return None;
                }
                output = child.wait_with_output() => output,
            }
        }
        None => child.wait_with_output().await,
    };

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(status = %output.status, "file-index scanner exited unsuccessfully");
            return None;
        }
        Err(err) => {
            warn!(%err, "file-index scanner failed");
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut denies = BTreeSet::new();
    for line in stdout.lines() {
        let relative = line.trim();
        if relative.is_empty() {
            continue;
        }
        collect_denies_for_hit(request, relative, &mut denies);
    }
    Some(denies)
}

fn collect_denies_for_hit(
    request: &MandatoryDenyRequest<'_>,
    relative: &str,
    denies: &mut BTreeSet<PathBuf>,
) {
    let absolute = request.cwd.join(relative);

    if let Some(file_name) = absolute.file_name().and_then(|name| name.to_str())
        && DANGEROUS_FILES.contains(&file_name)
    {
        denies.insert(absolute);
    }

    for directory in DANGEROUS_DIRECTORIES {
        if let Some(prefix) = path_through_segment(relative, directory) {
            denies.insert(request.cwd.join(prefix));
        }
    }

    // A nested `.git` is only ever seen through its `HEAD` file, which
    // guarantees the directory layout.
    if let Some(git_dir) = relative
        .strip_suffix("/HEAD")
        .filter(|prefix| *prefix == ".git" || prefix.ends_with("/.git"))
    {
        denies.extend(version_control_denies(
            &request.cwd.join(git_dir),
            request.allow_git_config,
        ));
    }
}

/// If `segment` (one or more components) appears in `relative`, return the
/// prefix of `relative` up to and including it.
fn path_through_segment(relative: &str, segment: &str) -> Option<String> {
    let mut search_start = 0;
    while let Some(found) = relative[search_start..].find(segment) {
        let start = search_start + found;
        let end = start + segment.len();
        let starts_on_boundary = start == 0 || relative.as_bytes()[start - 1] == b'/';
        let ends_on_boundary = end == relative.len() || relative.as_bytes()[end] == b'/';
        if starts_on_boundary && ends_on_boundary {
            return Some(relative[..end].to_string());
        }
        search_start = end;
    }
    None
}
