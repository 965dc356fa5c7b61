//! Top-level composition: one policy + one command in, one composite shell
//! command string out.

use crate::bwrap;
use crate::error::Result;
use crate::error::SandboxErr;
use crate::mandatory_denies::MandatoryDenyRequest;
use crate::mandatory_denies::enumerate_mandatory_denies;
use crate::reaper;
use crate::seatbelt;
use shelter_protocol::SandboxPolicy;
use std::path::Path;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which host sandbox engine to compile for. Platform detection belongs to
/// the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPlatform {
    /// User-namespace sandbox tool plus seccomp.
    Linux,
    /// Kernel profile engine.
    Macos,
}

/// One wrap invocation.
pub struct WrapRequest<'a> {
    pub command: &'a str,
    pub policy: &'a SandboxPolicy,
    pub platform: SandboxPlatform,
    /// Working directory the policy's relative paths and mandatory denies
    /// are anchored to.
    pub cwd: &'a Path,
    /// Cancels the mandatory-deny scan; compilation then proceeds with the
    /// partial list.
    pub cancel: Option<&'a CancellationToken>,
}

/// Compile `request.policy` into a single shell command that runs
/// `request.command` under the host sandbox and exits with its status.
///
/// A policy with no restrictions returns the command unchanged. Compilation
/// failures tear down any syscall-filter artifacts generated along the way
/// before propagating.
pub async fn wrap_command(request: WrapRequest<'_>) -> Result<String> {
    if !request.policy.has_any_restrictions() {
        debug!("policy has no restrictions, returning the command unchanged");
        return Ok(request.command.to_string());
    }

    let mandatory_denies = if request.policy.has_write_restrictions() {
        enumerate_mandatory_denies(MandatoryDenyRequest {
            cwd: request.cwd,
            allow_git_config: request.policy.allow_git_config,
            search_depth: request.policy.search_depth(),
            scanner: request
                .policy
                .ripgrep
                .as_ref()
                .and_then(|config| config.binary.as_deref()),
            cancel: request.cancel,
        })
        .await
    } else {
        Vec::new()
    };

    match compose(&request, &mandatory_denies) {
        Ok(composite) => Ok(composite),
        Err(err) => {
            reaper::cleanup_generated_filters();
            Err(err)
        }
    }
}

fn compose(request: &WrapRequest<'_>, mandatory_denies: &[PathBuf]) -> Result<String> {
    let argv = match request.platform {
        SandboxPlatform::Linux => {
            let program = which::which("bwrap")
                .map_err(|_| SandboxErr::MissingSandboxTool("bwrap".to_string()))?;
            let args = bwrap::create_bwrap_args(
                request.command,
                request.policy,
                request.cwd,
                mandatory_denies,
                &program,
            )?;
            let mut argv = vec![program.to_string_lossy().to_string()];
            argv.extend(args);
            argv
        }
        SandboxPlatform::Macos => {
            let shell = which::which(request.policy.shell())
                .map_err(|_| SandboxErr::ShellNotFound(request.policy.shell().to_string()))?;
            let profile = seatbelt::build_profile(request.policy, request.cwd, mandatory_denies);
            vec![
                "env".to_string(),
                "SHELTER_SANDBOX=seatbelt".to_string(),
                seatbelt::PROFILE_ENGINE_PATH.to_string(),
                "-p".to_string(),
                profile,
                "--".to_string(),
                shell.to_string_lossy().to_string(),
                "-c".to_string(),
                request.command.to_string(),
            ]
        }
    };

    shlex::try_join(argv.iter().map(String::as_str))
        .map_err(|err| SandboxErr::Policy(format!("cannot quote composite command: {err}")))
}
