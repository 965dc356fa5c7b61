//! Runtime generation of the Unix-socket-blocking syscall filter.
//!
//! The filter denies `socket(AF_UNIX, …)` and `socketpair(AF_UNIX, …)` with
//! `EPERM` and allows everything else. It is compiled to classic BPF and
//! written to a file so the sandbox tool can load it through an inherited
//! file descriptor; the file is registered for teardown the moment it exists.
//! A pre-built program supplied via `SHELTER_SECCOMP_BPF` takes precedence
//! when present, and is the only option on hosts where runtime generation is
//! unsupported.

use crate::error::Result;
use crate::error::SandboxErr;
use std::path::PathBuf;

/// Environment variable naming a pre-built BPF artifact.
pub const PREBUILT_FILTER_ENV_VAR: &str = "SHELTER_SECCOMP_BPF";

/// Cheap availability probe used to decide between a hard error and a
/// degraded-protection warning.
pub(crate) fn filter_available() -> bool {
    if prebuilt_filter_path().is_some() {
        return true;
    }
    cfg!(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))
}

fn prebuilt_filter_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os(PREBUILT_FILTER_ENV_VAR)?);
    path.is_file().then_some(path)
}

/// Produce a BPF artifact on disk and return its path.
pub(crate) fn ensure_unix_socket_filter() -> Result<PathBuf> {
    if let Some(prebuilt) = prebuilt_filter_path() {
        return Ok(prebuilt);
    }
    generate_filter_file()
}

#[cfg(target_os = "linux")]
fn generate_filter_file() -> Result<PathBuf> {
    use std::io::Write;

    let program = build_unix_socket_deny_program()
        .map_err(|err| SandboxErr::SyscallFilterUnavailable(err.to_string()))?;

    let mut bytes = Vec::with_capacity(program.len() * 8);
    for instruction in &program {
        bytes.extend_from_slice(&instruction.code.to_ne_bytes());
        bytes.push(instruction.jt);
        bytes.push(instruction.jf);
        bytes.extend_from_slice(&instruction.k.to_ne_bytes());
    }

    let mut file = tempfile::Builder::new()
        .prefix("shelter-unix-sockets-")
        .suffix(".bpf")
        .tempfile()?;
    file.write_all(&bytes)?;
    let (_, path) = file
        .keep()
        .map_err(|err| SandboxErr::SyscallFilterUnavailable(err.to_string()))?;
    crate::reaper::register_generated_filter(path.clone());
    Ok(path)
}

#[cfg(target_os = "linux")]
fn build_unix_socket_deny_program()
-> std::result::Result<seccompiler::BpfProgram, Box<dyn std::error::Error>> {
    use seccompiler::SeccompAction;
    use seccompiler::SeccompCmpArgLen;
    use seccompiler::SeccompCmpOp;
    use seccompiler::SeccompCondition;
    use seccompiler::SeccompFilter;
    use seccompiler::SeccompRule;
    use seccompiler::TargetArch;
    use std::collections::BTreeMap;

    // Match on the domain argument only: creation is what gets blocked, no
    // path is involved at this layer.
    let af_unix_rule = SeccompRule::new(vec![SeccompCondition::new(
        0,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::Eq,
        libc::AF_UNIX as u64,
    )?])?;

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(libc::SYS_socket, vec![af_unix_rule.clone()]);
    rules.insert(libc::SYS_socketpair, vec![af_unix_rule]);

    let target_arch = if cfg!(target_arch = "x86_64") {
        TargetArch::x86_64
    } else if cfg!(target_arch = "aarch64") {
        TargetArch::aarch64
    } else {
        return Err("unsupported architecture for seccomp filter generation".into());
    };

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,                     // default – allow
        SeccompAction::Errno(libc::EPERM as u32), // when rule matches – return EPERM
        target_arch,
    )?;

    Ok(filter.try_into()?)
}

#[cfg(not(target_os = "linux"))]
fn generate_filter_file() -> Result<PathBuf> {
    Err(SandboxErr::SyscallFilterUnavailable(
        "runtime filter generation is only supported on Linux; set SHELTER_SECCOMP_BPF".to_string(),
    ))
}
