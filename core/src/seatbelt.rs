//! Profile-engine policy compilation for macOS.
//!
//! The compiler emits a single sandbox-profile S-expression handed to
//! `sandbox-exec` as inline profile text. Rule order matters: the profile
//! engine gives the most recently matching rule precedence, so the base
//! denies go first, write allows layer on top, and the deny carve-outs come
//! last.

use crate::glob::glob_to_profile_regex;
use shelter_protocol::SandboxPolicy;
use shelter_utils_path_safety::is_glob;
use shelter_utils_path_safety::normalize;
use shelter_utils_path_safety::split_glob;
use shelter_utils_path_safety::symlink_widens;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;

const BASE_POLICY: &str = include_str!("seatbelt_base_policy.sbpl");

/// Fixed path to the profile-engine invoker. Only `/usr/bin` is trusted: an
/// attacker who can replace that binary already owns the machine.
pub const PROFILE_ENGINE_PATH: &str = "/usr/bin/sandbox-exec";

/// Render the complete profile for one command.
pub(crate) fn build_profile(
    policy: &SandboxPolicy,
    cwd: &Path,
    mandatory_denies: &[PathBuf],
) -> String {
    let mut profile = String::from(BASE_POLICY);
    profile.push('\n');
    push_read_rules(&mut profile, policy, cwd);
    push_write_rules(&mut profile, policy, cwd, mandatory_denies);
    push_network_rules(&mut profile, policy);
    push_unix_socket_rules(&mut profile, policy);
    if policy.allow_pty {
        profile.push_str("; pty\n(allow pseudo-tty)\n");
        profile.push_str("(allow file-ioctl (regex #\"^/dev/ttys\"))\n");
    }
    profile
}

fn escape(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

/// Every ancestor directory of `path`, nearest first, ending at `/`.
fn ancestors_to_root(path: &Path) -> Vec<PathBuf> {
    let mut chain = Vec::new();
    let mut current = path.to_path_buf();
    while let Some(parent) = current.parent() {
        let parent = parent.to_path_buf();
        chain.push(parent.clone());
        if parent == Path::new("/") {
            break;
        }
        current = parent;
    }
    chain
}

/// Resolve a literal entry, keeping the original when the resolution would
/// widen scope. Unlike the mount compiler, the profile compiler never drops
/// an entry: the unresolved original still names exactly what the caller
/// wrote.
fn boundary_checked(normalized: PathBuf) -> PathBuf {
    match std::fs::canonicalize(&normalized) {
        Ok(canonical) => {
            if symlink_widens(&normalized, &canonical) {
                debug!(
                    path = %normalized.display(),
                    resolved = %canonical.display(),
                    "resolution widens scope, keeping the original path"
                );
                normalized
            } else {
                canonical
            }
        }
        Err(_) => normalized,
    }
}

/// Same boundary check at glob granularity: the pattern's literal base is
/// resolved, and the original pattern is kept whenever that resolution would
/// widen scope.
fn boundary_checked_glob(pattern: &str) -> String {
    let (base, tail) = split_glob(pattern);
    if tail.is_empty() || base.as_os_str().is_empty() || base == Path::new("/") {
        return pattern.to_string();
    }
    match std::fs::canonicalize(&base) {
        Ok(canonical) => {
            if symlink_widens(&base, &canonical) {
                debug!(pattern, "glob base resolution widens scope, keeping the original pattern");
                pattern.to_string()
            } else {
                format!("{}/{tail}", canonical.to_string_lossy())
            }
        }
        Err(_) => pattern.to_string(),
    }
}

/// Emit the deny family for one path: the operation denies plus the
/// rename-block chain.
///
/// Rename is a write whose check runs against the source's ancestors, so
/// denying only the path itself leaves `mv denied/secret readable/` open.
/// The path gets a subpath unlink deny (covering everything beneath it) and
/// every ancestor up to `/` gets a literal one (so no ancestor can be
/// renamed to carry the subtree somewhere readable).
fn push_deny_family(profile: &mut String, operations: &[&str], entry: &DenyEntry) {
    match entry {
        DenyEntry::Literal(path) => {
            let escaped = escape(path);
            for operation in operations {
                profile.push_str(&format!("(deny {operation} (subpath \"{escaped}\"))\n"));
            }
            profile.push_str(&format!(
                "(deny file-write-unlink (subpath \"{escaped}\"))\n"
            ));
            for ancestor in ancestors_to_root(path) {
                profile.push_str(&format!(
                    "(deny file-write-unlink (literal \"{}\"))\n",
                    escape(&ancestor)
                ));
            }
        }
        DenyEntry::Glob(pattern) => {
            let regex = glob_to_profile_regex(pattern);
            for operation in operations {
                profile.push_str(&format!("(deny {operation} (regex #\"{regex}\"))\n"));
            }
            profile.push_str(&format!(
                "(deny file-write-unlink (regex #\"{regex}\"))\n"
            ));
            let (base, _) = split_glob(pattern);
            if !base.as_os_str().is_empty() {
                profile.push_str(&format!(
                    "(deny file-write-unlink (literal \"{}\"))\n",
                    escape(&base)
                ));
                for ancestor in ancestors_to_root(&base) {
                    profile.push_str(&format!(
                        "(deny file-write-unlink (literal \"{}\"))\n",
                        escape(&ancestor)
                    ));
                }
            }
        }
    }
}

enum DenyEntry {
    Literal(PathBuf),
    Glob(String),
}

fn resolve_deny_entries(entries: &[String], cwd: &Path) -> Vec<DenyEntry> {
    let mut resolved = Vec::new();
    for entry in entries {
        if is_glob(entry) {
            match normalize(entry, cwd) {
                Ok(pattern) => {
                    resolved.push(DenyEntry::Glob(pattern.to_string_lossy().to_string()));
                }
                Err(err) => debug!(entry, %err, "could not normalize glob entry, skipping"),
            }
            continue;
        }
        match normalize(entry, cwd) {
            Ok(path) => resolved.push(DenyEntry::Literal(boundary_checked(path))),
            Err(err) => debug!(entry, %err, "could not normalize deny entry, skipping"),
        }
    }
    resolved
}

fn push_read_rules(profile: &mut String, policy: &SandboxPolicy, cwd: &Path) {
    let Some(read) = &policy.read else {
        return;
    };
    if read.deny_only.is_empty() {
        return;
    }
    profile.push_str("; read denies\n");
    for entry in resolve_deny_entries(&read.deny_only, cwd) {
        push_deny_family(profile, &["file-read*"], &entry);
    }
}

fn push_write_rules(
    profile: &mut String,
    policy: &SandboxPolicy,
    cwd: &Path,
    mandatory_denies: &[PathBuf],
) {
    let Some(write) = &policy.write else {
        profile.push_str("; writes unrestricted\n(allow file-write*)\n");
        return;
    };

    if !write.allow_only.is_empty() {
        profile.push_str("; write allows\n");
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for entry in &write.allow_only {
            if is_glob(entry) {
                let pattern = match normalize(entry, cwd) {
                    Ok(pattern) => pattern.to_string_lossy().to_string(),
                    Err(err) => {
                        debug!(entry, %err, "could not normalize glob allow, skipping");
                        continue;
                    }
                };
                let checked = boundary_checked_glob(&pattern);
                let regex = glob_to_profile_regex(&checked);
                if seen.insert(regex.clone()) {
                    profile.push_str(&format!("(allow file-write* (regex #\"{regex}\"))\n"));
                }
                continue;
            }
            let normalized = match normalize(entry, cwd) {
                Ok(path) => path,
                Err(err) => {
                    debug!(entry, %err, "could not normalize write allow, skipping");
                    continue;
                }
            };
            let escaped = escape(&boundary_checked(normalized));
            if seen.insert(escaped.clone()) {
                profile.push_str(&format!("(allow file-write* (subpath \"{escaped}\"))\n"));
            }
        }
    }

    let mut deny_entries = resolve_deny_entries(&write.deny_within_allow, cwd);
    deny_entries.extend(
        mandatory_denies
            .iter()
            .map(|path| DenyEntry::Literal(path.clone())),
    );
    if !deny_entries.is_empty() {
        profile.push_str("; write denies\n");
        for entry in deny_entries {
            push_deny_family(profile, &["file-write*"], &entry);
        }
    }
}

fn push_network_rules(profile: &mut String, policy: &SandboxPolicy) {
    profile.push_str("; network\n");
    if !policy.network.restricted {
        profile.push_str("(allow network*)\n");
        return;
    }

    // DNS keeps resolving even in restricted mode; actual traffic must go
    // through the bridge proxies.
    profile.push_str("(allow network-outbound (remote ip \"*:53\"))\n");
    if let Some(bridge) = &policy.network.bridge {
        profile.push_str(&format!(
            "(allow network-outbound (remote ip \"localhost:{}\"))\n",
            bridge.http_port
        ));
        profile.push_str(&format!(
            "(allow network-outbound (remote ip \"localhost:{}\"))\n",
            bridge.socks_port
        ));
    }
    if policy.allow_local_binding {
        profile.push_str("(allow network-bind (local ip \"localhost:*\"))\n");
        profile.push_str("(allow network-inbound (local ip \"localhost:*\"))\n");
        profile.push_str("(allow network-outbound (remote ip \"localhost:*\"))\n");
        // Dual-stack runtimes bind the IPv4-mapped form rather than plain
        // 127.0.0.1.
        profile.push_str("(allow network-bind (local ip \"::ffff:127.0.0.1:*\"))\n");
        profile.push_str("(allow network-inbound (local ip \"::ffff:127.0.0.1:*\"))\n");
    }
}

fn push_unix_socket_rules(profile: &mut String, policy: &SandboxPolicy) {
    let sockets = &policy.unix_sockets;
    if !sockets.allow_all && sockets.allow_paths.is_empty() {
        // The base policy's system-socket deny keeps creation blocked.
        return;
    }

    profile.push_str("; unix sockets\n");
    // Socket creation carries no path, only a domain, so it must be allowed
    // with a domain predicate; a subpath filter here silently blocks every
    // AF_UNIX socket regardless of the allowed paths.
    profile.push_str("(allow system-socket (socket-domain AF_UNIX))\n");

    if sockets.allow_all {
        profile.push_str("(allow network-bind (local unix-socket))\n");
        profile.push_str("(allow network-outbound (remote unix-socket))\n");
        return;
    }

    for path in &sockets.allow_paths {
        let escaped = escape(path);
        profile.push_str(&format!(
            "(allow network-bind (local unix-socket (subpath \"{escaped}\")))\n"
        ));
        profile.push_str(&format!(
            "(allow network-bind (local unix-socket (literal \"{escaped}\")))\n"
        ));
        profile.push_str(&format!(
            "(allow network-outbound (remote unix-socket (subpath \"{escaped}\")))\n"
        ));
        profile.push_str(&format!(
            "(allow network-outbound (remote unix-socket (literal \"{escaped}\")))\n"
        ));
    }
}
