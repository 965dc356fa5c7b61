use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SandboxErr>;

/// The one failure surface callers see: either a composite command string or
/// a reason the policy could not be compiled.
///
/// Per-path anomalies never land here; those are skipped with a debug log
/// because the caller's policy lists describe intent over a filesystem that
/// may have moved on.
#[derive(Debug, thiserror::Error)]
pub enum SandboxErr {
    #[error("cannot compile policy: sandbox tool `{0}` not found on PATH")]
    MissingSandboxTool(String),

    #[error("cannot compile policy: shell `{0}` not found on PATH")]
    ShellNotFound(String),

    #[error(
        "cannot compile policy: network bridge socket {0} does not exist (bridge supervisor down?)"
    )]
    MissingBridgeSocket(PathBuf),

    #[error("cannot compile policy: syscall filter unavailable: {0}")]
    SyscallFilterUnavailable(String),

    #[error("cannot compile policy: {0}")]
    Policy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
