//! Bubblewrap-based policy compilation for Linux.
//!
//! The compiler turns a policy plus the mandatory denies into an ordered
//! argument vector for the user-namespace sandbox tool. Ordering carries the
//! semantics: later binds override earlier ones on overlapping paths, so the
//! root goes down first, writable roots re-enable writes on top of it, and
//! deny overlays win over both. PID/proc and network directives must follow
//! every filesystem bind.
//!
//! Per-path anomalies are skipped with a debug log rather than failing the
//! compile; the policy lists describe intent over a filesystem that may have
//! changed since the caller wrote them.

use crate::error::Result;
use crate::error::SandboxErr;
use crate::reaper;
use crate::seccomp_filter;
use shelter_protocol::NetworkBridge;
use shelter_protocol::SandboxPolicy;
use shelter_utils_path_safety::PathKind;
use shelter_utils_path_safety::classify;
use shelter_utils_path_safety::find_symlink_in_path;
use shelter_utils_path_safety::first_nonexistent;
use shelter_utils_path_safety::has_file_ancestor;
use shelter_utils_path_safety::is_glob;
use shelter_utils_path_safety::nearest_existing_ancestor;
use shelter_utils_path_safety::normalize;
use shelter_utils_path_safety::split_glob;
use shelter_utils_path_safety::symlink_widens;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::warn;

/// External binary that loads a BPF file, sets no-new-privs, and execs.
pub const SYSCALL_FILTER_APPLICATOR: &str = "shelter-seccomp-apply";

/// Read-denied regardless of policy: host SSH client configuration fragments.
const IMPLICIT_READ_DENIES: &[&str] = &["/etc/ssh/ssh_config.d"];

/// Build the argument vector passed to the sandbox tool (everything after
/// `argv[0]`). `program` is the tool's own path, needed to spell the inner
/// stage of a nested invocation.
pub(crate) fn create_bwrap_args(
    user_command: &str,
    policy: &SandboxPolicy,
    cwd: &Path,
    mandatory_denies: &[PathBuf],
    program: &Path,
) -> Result<Vec<String>> {
    let shell = which::which(policy.shell())
        .map_err(|_| SandboxErr::ShellNotFound(policy.shell().to_string()))?;

    let mut args = vec!["--new-session".to_string(), "--die-with-parent".to_string()];

    // (1) Root: read-only when write restrictions are in effect.
    if policy.has_write_restrictions() {
        push_directive(&mut args, "--ro-bind", "/", "/");
    } else {
        push_directive(&mut args, "--bind", "/", "/");
    }

    // (2) Writable roots.
    let allowed_roots = apply_write_allows(&mut args, policy, cwd);

    // (3) Deny overlays inside the writable roots.
    if policy.has_write_restrictions() || !mandatory_denies.is_empty() {
        let mut denies: BTreeSet<PathBuf> = mandatory_denies.iter().cloned().collect();
        if let Some(write) = &policy.write {
            denies.extend(resolve_path_entries(&write.deny_within_allow, cwd));
        }
        for deny in denies {
            apply_write_deny(&mut args, &deny, &allowed_roots);
        }
    }

    // (4) Read denies mask content that stays visible through the root bind.
    apply_read_denies(&mut args, policy, cwd);

    // (5) Device tree, then PID isolation. `/dev` must come after the binds
    // so none of the overlays shadow it.
    push_directive2(&mut args, "--dev", "/dev");
    args.push("--unshare-pid".to_string());
    if !policy.enable_weaker_nested_sandbox {
        push_directive2(&mut args, "--proc", "/proc");
    }

    // (6) Network.
    args.push("--setenv".to_string());
    args.push("SHELTER_SANDBOX".to_string());
    args.push("bwrap".to_string());
    if policy.network.restricted {
        args.push("--unshare-net".to_string());
        if policy.network.bridge.is_none() {
            args.push("--setenv".to_string());
            args.push("SHELTER_SANDBOX_NETWORK_DISABLED".to_string());
            args.push("1".to_string());
        }
    }
    if let Some(bridge) = &policy.network.bridge {
        apply_bridge(&mut args, bridge)?;
    }

    if !policy.unix_sockets.allow_paths.is_empty() {
        debug!("unixSockets.allowPaths is only honored by the profile-engine backend");
    }

    // (7) Payload.
    let payload = build_payload(user_command, policy, &shell, &allowed_roots, program)?;
    args.push("--".to_string());
    args.extend(payload);

    Ok(args)
}

fn push_directive(args: &mut Vec<String>, directive: &str, source: &str, target: &str) {
    args.push(directive.to_string());
    args.push(source.to_string());
    args.push(target.to_string());
}

fn push_directive2(args: &mut Vec<String>, directive: &str, target: &str) {
    args.push(directive.to_string());
    args.push(target.to_string());
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn is_within(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// Normalize literal entries and expand glob entries against the filesystem.
fn resolve_path_entries(entries: &[String], cwd: &Path) -> Vec<PathBuf> {
    let mut resolved = Vec::new();
    for entry in entries {
        if is_glob(entry) {
            resolved.extend(expand_glob_entry(entry, cwd));
            continue;
        }
        match normalize(entry, cwd) {
            Ok(path) => resolved.push(path),
            Err(err) => debug!(entry, %err, "could not normalize path entry, skipping"),
        }
    }
    resolved
}

/// A glob cannot be a mount target, so match it against what is on disk under
/// its literal base and treat every hit as a literal path.
fn expand_glob_entry(pattern: &str, cwd: &Path) -> Vec<PathBuf> {
    let normalized = match normalize(pattern, cwd) {
        Ok(path) => path_to_string(&path),
        Err(err) => {
            debug!(pattern, %err, "could not normalize glob entry, skipping");
            return Vec::new();
        }
    };
    let (base, _) = split_glob(&normalized);
    let matcher = match globset::GlobBuilder::new(&normalized)
        .literal_separator(true)
        .build()
    {
        Ok(glob) => glob.compile_matcher(),
        Err(err) => {
            debug!(pattern, %err, "invalid glob entry, skipping");
            return Vec::new();
        }
    };

    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(&base)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if matcher.is_match(entry.path()) {
            matches.push(entry.path().to_path_buf());
        }
    }
    if matches.is_empty() {
        debug!(pattern, "glob entry matched nothing on disk");
    }
    matches
}

/// Stage (2): bind each surviving allow entry over the read-only root and
/// record it as an allowed-write root.
fn apply_write_allows(args: &mut Vec<String>, policy: &SandboxPolicy, cwd: &Path) -> Vec<PathBuf> {
    let mut allowed_roots: Vec<PathBuf> = Vec::new();
    let Some(write) = &policy.write else {
        return allowed_roots;
    };

    for entry in &write.allow_only {
        let normalized = match normalize(entry, cwd) {
            Ok(path) => path,
            Err(err) => {
                debug!(entry, %err, "could not normalize write allow, skipping");
                continue;
            }
        };
        if normalized.starts_with("/dev") {
            // The device tree is provided by the implicit `--dev /dev`.
            debug!(path = %normalized.display(), "write allow under /dev, skipping");
            continue;
        }
        if classify(&normalized) == PathKind::Missing {
            debug!(path = %normalized.display(), "write allow does not exist, skipping");
            continue;
        }
        let canonical = match std::fs::canonicalize(&normalized) {
            Ok(path) => path,
            Err(err) => {
                debug!(path = %normalized.display(), %err, "write allow did not resolve, skipping");
                continue;
            }
        };
        if symlink_widens(&normalized, &canonical) {
            debug!(
                path = %normalized.display(),
                resolved = %canonical.display(),
                "write allow resolves outside its own scope, skipping"
            );
            continue;
        }
        if allowed_roots.contains(&canonical) {
            continue;
        }
        let rendered = path_to_string(&canonical);
        push_directive(args, "--bind", &rendered, &rendered);
        allowed_roots.push(canonical);
    }

    allowed_roots
}

/// Stage (3): keep one deny path read-only (or uncreatable) inside the
/// writable roots.
fn apply_write_deny(args: &mut Vec<String>, deny: &Path, allowed_roots: &[PathBuf]) {
    if deny.starts_with("/dev") {
        debug!(path = %deny.display(), "write deny under /dev, skipping");
        return;
    }

    // An intermediate symlink under a writable root could be deleted and
    // rebuilt as a real directory, so clobber the symlink itself.
    if let Some(symlink) = find_symlink_in_path(deny, allowed_roots) {
        push_directive(args, "--ro-bind", "/dev/null", &path_to_string(&symlink));
        return;
    }

    if !deny.exists() {
        plan_missing_deny(args, deny, allowed_roots);
        return;
    }

    if is_within(deny, allowed_roots) {
        let rendered = path_to_string(deny);
        push_directive(args, "--ro-bind", &rendered, &rendered);
    } else {
        debug!(
            path = %deny.display(),
            "write deny outside every writable root is already read-only"
        );
    }
}

/// Block creation of a deny path that does not exist yet.
///
/// The sandboxed command must not be able to `mkdir -p` its way into the deny
/// path, so the first missing component is occupied: with `/dev/null` when it
/// is the deny path itself, or with an empty directory when it is an
/// intermediate component that downstream tools still expect to traverse.
/// Both host-side artifacts are registered with the reaper.
fn plan_missing_deny(args: &mut Vec<String>, deny: &Path, allowed_roots: &[PathBuf]) {
    if has_file_ancestor(deny) {
        // No mkdir sequence can materialize this path (worktree `.git` file).
        debug!(path = %deny.display(), "write deny has a file ancestor, skipping");
        return;
    }
    let Some(ancestor) = nearest_existing_ancestor(deny) else {
        debug!(path = %deny.display(), "write deny has no existing ancestor, skipping");
        return;
    };
    if !is_within(&ancestor, allowed_roots) {
        debug!(
            path = %deny.display(),
            "missing write deny sits under a read-only subtree, skipping"
        );
        return;
    }
    let Some(first_missing) = first_nonexistent(deny) else {
        return;
    };

    if first_missing == deny {
        let rendered = path_to_string(deny);
        push_directive(args, "--ro-bind", "/dev/null", &rendered);
        reaper::register_mount_point(deny.to_path_buf());
        return;
    }

    // The break point is an intermediate component: mount an empty directory
    // there so the component still looks like a directory while nothing can
    // be created beneath it.
    let empty_dir = match tempfile::Builder::new()
        .prefix("shelter-deny-")
        .tempdir()
    {
        Ok(dir) => dir.keep(),
        Err(err) => {
            debug!(path = %deny.display(), %err, "could not create deny artifact dir, skipping");
            return;
        }
    };
    push_directive(
        args,
        "--ro-bind",
        &path_to_string(&empty_dir),
        &path_to_string(&first_missing),
    );
    reaper::register_mount_point(first_missing);
    reaper::register_mount_point(empty_dir);
}

/// Stage (4): mask read-denied content. Directories become empty tmpfs
/// mounts, files are shadowed by `/dev/null`.
fn apply_read_denies(args: &mut Vec<String>, policy: &SandboxPolicy, cwd: &Path) {
    let mut denies: BTreeSet<PathBuf> = IMPLICIT_READ_DENIES.iter().map(PathBuf::from).collect();
    if let Some(read) = &policy.read {
        denies.extend(resolve_path_entries(&read.deny_only, cwd));
    }

    for deny in denies {
        match classify(&deny) {
            PathKind::Dir => {
                push_directive2(args, "--tmpfs", &path_to_string(&deny));
            }
            PathKind::File | PathKind::Symlink => {
                push_directive(args, "--ro-bind", "/dev/null", &path_to_string(&deny));
            }
            PathKind::Missing => {
                debug!(path = %deny.display(), "read deny does not exist, skipping");
            }
        }
    }
}

/// Stage (6): make the bridge's Unix sockets visible and point standard proxy
/// variables at the in-sandbox forwarder endpoints.
fn apply_bridge(args: &mut Vec<String>, bridge: &NetworkBridge) -> Result<()> {
    for socket in [&bridge.http_socket_path, &bridge.socks_socket_path] {
        if !socket.exists() {
            return Err(SandboxErr::MissingBridgeSocket(socket.clone()));
        }
        let rendered = path_to_string(socket);
        push_directive(args, "--bind", &rendered, &rendered);
    }

    let settings = [
        (
            "HTTP_PROXY".to_string(),
            format!("http://127.0.0.1:{}", bridge.http_port),
        ),
        (
            "HTTPS_PROXY".to_string(),
            format!("http://127.0.0.1:{}", bridge.http_port),
        ),
        (
            "ALL_PROXY".to_string(),
            format!("socks5://127.0.0.1:{}", bridge.socks_port),
        ),
        (
            "SHELTER_HTTP_PROXY_PORT".to_string(),
            bridge.http_port.to_string(),
        ),
        (
            "SHELTER_SOCKS_PROXY_PORT".to_string(),
            bridge.socks_port.to_string(),
        ),
    ];
    for (key, value) in settings {
        args.push("--setenv".to_string());
        args.push(key);
        args.push(value);
    }
    Ok(())
}

/// Stage (7): pick how the user command is launched.
fn build_payload(
    user_command: &str,
    policy: &SandboxPolicy,
    shell: &Path,
    allowed_roots: &[PathBuf],
    program: &Path,
) -> Result<Vec<String>> {
    let shell = path_to_string(shell);

    if !policy.needs_unix_socket_filter() {
        if !seccomp_filter::filter_available() {
            warn!("unix sockets are unrestricted and no syscall filter tooling is present");
        }
        return Ok(vec![shell, "-c".to_string(), user_command.to_string()]);
    }

    let filter = seccomp_filter::ensure_unix_socket_filter()?;

    match &policy.network.bridge {
        None => {
            // The filter applicator wraps the shell directly; no helper
            // processes are involved, so nothing else needs to stay
            // unfiltered.
            let applicator = which::which(SYSCALL_FILTER_APPLICATOR).map_err(|_| {
                SandboxErr::MissingSandboxTool(SYSCALL_FILTER_APPLICATOR.to_string())
            })?;
            Ok(vec![
                path_to_string(&applicator),
                "apply".to_string(),
                path_to_string(&filter),
                shell,
                "-c".to_string(),
                user_command.to_string(),
            ])
        }
        Some(bridge) => {
            let script =
                build_nested_stage_script(user_command, policy, &shell, allowed_roots, program,
                    bridge, &filter)?;
            Ok(vec![shell, "-c".to_string(), script])
        }
    }
}

/// Two-stage payload used when the syscall filter and the network bridge are
/// both in play.
///
/// The socat forwarders create Unix-domain sockets, so they must run in the
/// outer stage where the filter does not apply. The inner stage re-enters the
/// sandbox tool with the filter loaded from an inherited descriptor and
/// replays every writable bind so writes reach the shared underlying
/// filesystem instead of the inner stage's read-only root.
fn build_nested_stage_script(
    user_command: &str,
    policy: &SandboxPolicy,
    shell: &str,
    allowed_roots: &[PathBuf],
    program: &Path,
    bridge: &NetworkBridge,
    filter: &Path,
) -> Result<String> {
    let mut inner: Vec<String> = vec![
        path_to_string(program),
        "--die-with-parent".to_string(),
        "--unshare-all".to_string(),
        "--share-net".to_string(),
        "--ro-bind".to_string(),
        "/".to_string(),
        "/".to_string(),
    ];
    for root in allowed_roots {
        if root.starts_with("/dev") {
            continue;
        }
        let rendered = path_to_string(root);
        push_directive(&mut inner, "--bind", &rendered, &rendered);
    }
    push_directive2(&mut inner, "--dev", "/dev");
    if !policy.enable_weaker_nested_sandbox {
        push_directive2(&mut inner, "--proc", "/proc");
    }
    inner.push("--seccomp".to_string());
    inner.push("9".to_string());
    inner.push("--".to_string());
    inner.push(shell.to_string());
    inner.push("-c".to_string());
    inner.push(user_command.to_string());

    let join = |parts: &[String]| -> Result<String> {
        shlex::try_join(parts.iter().map(String::as_str))
            .map_err(|err| SandboxErr::Policy(format!("cannot quote payload: {err}")))
    };

    let http_forward = join(&[
        "socat".to_string(),
        format!(
            "TCP-LISTEN:{},fork,reuseaddr,bind=127.0.0.1",
            bridge.http_port
        ),
        format!("UNIX-CONNECT:{}", bridge.http_socket_path.display()),
    ])?;
    let socks_forward = join(&[
        "socat".to_string(),
        format!(
            "TCP-LISTEN:{},fork,reuseaddr,bind=127.0.0.1",
            bridge.socks_port
        ),
        format!("UNIX-CONNECT:{}", bridge.socks_socket_path.display()),
    ])?;
    let inner_joined = join(&inner)?;
    let filter_quoted = shlex::try_quote(&path_to_string(filter))
        .map_err(|err| SandboxErr::Policy(format!("cannot quote filter path: {err}")))?
        .into_owned();

    // Give the forwarders a moment to start listening before the user command
    // can race them to the proxy ports.
    Ok(format!(
        "{http_forward} &\n{socks_forward} &\nsleep 0.2\nexec {inner_joined} 9<{filter_quoted}\n"
    ))
}
