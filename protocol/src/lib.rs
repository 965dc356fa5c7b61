//! Policy record handed to the sandbox policy compilers.
//!
//! A long-lived supervisor ships one of these per command (or an update
//! between commands) as JSON over the control channel, so every field here
//! must stay serializable. Anything that cannot round-trip through JSON,
//! such as a cancellation token, travels as a separate argument instead.

use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;

/// Default bound for the nested dangerous-file scan.
pub const DEFAULT_MANDATORY_DENY_SEARCH_DEPTH: usize = 3;

/// Caller-supplied sandbox policy.
///
/// Absent sections mean "no restriction of that kind". An all-default policy
/// compiles to the user command unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SandboxPolicy {
    /// Read restrictions. Empty or absent means reads are unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadRestrictions>,

    /// Write restrictions. Absent means writes are unrestricted; present with
    /// an empty allow list means a read-only filesystem with nothing
    /// writable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<WriteRestrictions>,

    #[serde(default)]
    pub network: NetworkPolicy,

    #[serde(default)]
    pub unix_sockets: UnixSocketPolicy,

    /// Leave `.git/config` writable even though `.git/hooks` stays denied.
    #[serde(default)]
    pub allow_git_config: bool,

    /// Allow pseudo-terminal allocation (profile-engine hosts only).
    #[serde(default)]
    pub allow_pty: bool,

    /// Allow binding loopback listeners while the network is restricted
    /// (profile-engine hosts only).
    #[serde(default)]
    pub allow_local_binding: bool,

    /// Skip mounting a fresh `/proc` so the sandbox can run inside container
    /// environments that reject it (user-namespace hosts only).
    #[serde(default)]
    pub enable_weaker_nested_sandbox: bool,

    /// Overrides for the external file-index scanner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ripgrep: Option<RipgrepConfig>,

    /// How deep below the working directory the mandatory-deny scan looks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory_deny_search_depth: Option<usize>,

    /// Shell used to run the wrapped command. Resolved via `PATH` at compile
    /// time; defaults to `bash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_shell: Option<String>,
}

/// Deny-only read policy: everything is readable except the listed paths or
/// glob patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadRestrictions {
    #[serde(default)]
    pub deny_only: Vec<String>,
}

/// Allow-only write policy with carve-outs inside the allowed subtrees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WriteRestrictions {
    /// Paths writable inside the sandbox. Everything else is read-only.
    #[serde(default)]
    pub allow_only: Vec<String>,

    /// Paths or glob patterns that stay read-only even when they fall under
    /// an allowed root.
    #[serde(default)]
    pub deny_within_allow: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkPolicy {
    /// When true, the sandbox has no network access except through the
    /// bridge, if one is supplied.
    #[serde(default)]
    pub restricted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<NetworkBridge>,
}

/// Host-side endpoints of the network bridge supervisor. The sockets must
/// already exist on disk when the policy is compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkBridge {
    pub http_socket_path: PathBuf,
    pub socks_socket_path: PathBuf,
    pub http_port: u16,
    pub socks_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnixSocketPolicy {
    /// Permit creating Unix-domain sockets anywhere.
    #[serde(default)]
    pub allow_all: bool,

    /// Paths where binding/connecting Unix sockets is permitted. Honored only
    /// by the profile-engine backend; the user-namespace backend cannot scope
    /// socket creation by path.
    #[serde(default)]
    pub allow_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RipgrepConfig {
    /// Scanner binary to invoke instead of `rg` from `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
}

impl SandboxPolicy {
    /// True when compiling this policy would change the command at all.
    pub fn has_any_restrictions(&self) -> bool {
        self.has_read_restrictions()
            || self.has_write_restrictions()
            || self.network.restricted
            || !self.unix_sockets.allow_all
    }

    pub fn has_read_restrictions(&self) -> bool {
        self.read
            .as_ref()
            .is_some_and(|read| !read.deny_only.is_empty())
    }

    /// Write restrictions are in effect whenever a write section is present,
    /// including the empty-allow-list ("nothing writable") form.
    pub fn has_write_restrictions(&self) -> bool {
        self.write.is_some()
    }

    /// Whether the Unix-socket-blocking syscall filter applies to the user
    /// command.
    pub fn needs_unix_socket_filter(&self) -> bool {
        !self.unix_sockets.allow_all
    }

    pub fn search_depth(&self) -> usize {
        self.mandatory_deny_search_depth
            .unwrap_or(DEFAULT_MANDATORY_DENY_SEARCH_DEPTH)
    }

    pub fn shell(&self) -> &str {
        self.bin_shell.as_deref().unwrap_or("bash")
    }
}
