//! End-to-end coverage of the public wrap API, with execution-level checks
//! that only run where a working user-namespace sandbox tool is present.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use shelter_core::SandboxPlatform;
use shelter_core::WrapRequest;
use shelter_core::reaper;
use shelter_core::wrap_command;
use shelter_protocol::SandboxPolicy;
use shelter_protocol::UnixSocketPolicy;
use shelter_protocol::WriteRestrictions;
use std::path::Path;
use std::process::Command;
use tokio_util::sync::CancellationToken;

fn open_sockets_policy() -> SandboxPolicy {
    SandboxPolicy {
        unix_sockets: UnixSocketPolicy {
            allow_all: true,
            allow_paths: Vec::new(),
        },
        bin_shell: Some("sh".to_string()),
        ..Default::default()
    }
}

fn write_restricted(allow: &[&Path]) -> SandboxPolicy {
    SandboxPolicy {
        write: Some(WriteRestrictions {
            allow_only: allow
                .iter()
                .map(|path| path.to_string_lossy().to_string())
                .collect(),
            deny_within_allow: Vec::new(),
        }),
        ..open_sockets_policy()
    }
}

/// The sandbox tool must exist and user namespaces must actually work in this
/// environment before any execution-level assertion is meaningful.
fn bwrap_usable() -> bool {
    if which::which("bwrap").is_err() {
        return false;
    }
    Command::new("bwrap")
        .args([
            "--ro-bind", "/", "/", "--dev", "/dev", "--unshare-pid", "--proc", "/proc", "--",
            "/bin/true",
        ])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn run_composite(composite: &str, cwd: &Path) -> std::process::Output {
    Command::new("sh")
        .arg("-c")
        .arg(composite)
        .current_dir(cwd)
        .output()
        .expect("run composite command")
}

#[tokio::test]
async fn policy_from_control_channel_json_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let policy: SandboxPolicy = serde_json::from_str(
        r#"{
            "write": { "allowOnly": ["."], "denyWithinAllow": [] },
            "unixSockets": { "allowAll": true },
            "binShell": "sh"
        }"#,
    )
    .unwrap();

    let composite = wrap_command(WrapRequest {
        command: "echo hello",
        policy: &policy,
        platform: SandboxPlatform::Macos,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();

    assert!(composite.contains("/usr/bin/sandbox-exec"));
    assert!(composite.contains("echo hello"));
}

#[tokio::test]
async fn cancelled_scan_still_produces_a_composite() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let policy = write_restricted(&[dir.path()]);

    let composite = wrap_command(WrapRequest {
        command: "true",
        policy: &policy,
        platform: SandboxPlatform::Macos,
        cwd: dir.path(),
        cancel: Some(&cancel),
    })
    .await
    .unwrap();

    // The cwd-local mandatory denies survive cancellation.
    assert!(composite.contains(".bashrc"));
}

#[tokio::test]
async fn cleanup_after_wrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let policy = write_restricted(&[dir.path()]);
    let _ = wrap_command(WrapRequest {
        command: "true",
        policy: &policy,
        platform: SandboxPlatform::Macos,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();

    reaper::cleanup();
    reaper::cleanup();
}

#[tokio::test]
async fn sandboxed_write_lands_only_inside_the_allowed_root() {
    if !bwrap_usable() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let area = dir.path().join("user_area");
    std::fs::create_dir(&area).unwrap();
    let area = area.canonicalize().unwrap();
    let policy = write_restricted(&[&area]);

    let inside = area.join("ok");
    let composite = wrap_command(WrapRequest {
        command: &format!("touch {}", inside.display()),
        policy: &policy,
        platform: SandboxPlatform::Linux,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();
    let output = run_composite(&composite, dir.path());
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(inside.exists());

    let outside = dir.path().canonicalize().unwrap().join("blocked");
    let composite = wrap_command(WrapRequest {
        command: &format!("touch {}", outside.display()),
        policy: &policy,
        platform: SandboxPlatform::Linux,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();
    let output = run_composite(&composite, dir.path());
    assert!(!output.status.success());
    assert!(!outside.exists());

    reaper::cleanup();
}

#[tokio::test]
async fn worktree_pointer_file_does_not_break_execution() {
    if !bwrap_usable() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".git"), "gitdir: /elsewhere/repo\n").unwrap();
    let policy = SandboxPolicy {
        write: Some(WriteRestrictions {
            allow_only: vec![".".to_string()],
            deny_within_allow: Vec::new(),
        }),
        ..open_sockets_policy()
    };

    let composite = wrap_command(WrapRequest {
        command: "echo hello",
        policy: &policy,
        platform: SandboxPlatform::Linux,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();
    let output = run_composite(&composite, dir.path());

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");

    reaper::cleanup();
}

#[tokio::test]
async fn read_denied_directory_is_invisible_inside_the_sandbox() {
    if !bwrap_usable() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let denied = dir.path().join("denied");
    std::fs::create_dir(&denied).unwrap();
    std::fs::write(denied.join("secret.txt"), "secret").unwrap();
    let denied = denied.canonicalize().unwrap();

    let policy = SandboxPolicy {
        read: Some(shelter_protocol::ReadRestrictions {
            deny_only: vec![denied.to_string_lossy().to_string()],
        }),
        ..open_sockets_policy()
    };

    let composite = wrap_command(WrapRequest {
        command: &format!("cat {}/secret.txt", denied.display()),
        policy: &policy,
        platform: SandboxPlatform::Linux,
        cwd: dir.path(),
        cancel: None,
    })
    .await
    .unwrap();
    let output = run_composite(&composite, dir.path());

    assert!(!output.status.success());
    // The host copy is untouched.
    assert_eq!(
        std::fs::read_to_string(denied.join("secret.txt")).unwrap(),
        "secret"
    );
}
