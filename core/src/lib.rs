//! Policy compiler for running shell commands under host-OS sandboxes.
//!
//! One call to [`wrap_command`] turns a declarative policy plus a raw user
//! command into a single composite shell command that runs the command under
//! the host's sandbox engine: a user-namespace tool with a seccomp filter on
//! Linux, the kernel profile engine on macOS. After the wrapped command
//! returns, [`reaper::cleanup`] removes any host-side mount-point residue the
//! sandbox tool left behind.

mod bwrap;
pub mod error;
mod glob;
pub mod mandatory_denies;
pub mod reaper;
mod seatbelt;
mod seccomp_filter;
mod wrap;

pub use bwrap::SYSCALL_FILTER_APPLICATOR;
pub use error::Result;
pub use error::SandboxErr;
pub use mandatory_denies::DANGEROUS_DIRECTORIES;
pub use mandatory_denies::DANGEROUS_FILES;
pub use mandatory_denies::MandatoryDenyRequest;
pub use mandatory_denies::enumerate_mandatory_denies;
pub use seatbelt::PROFILE_ENGINE_PATH;
pub use seccomp_filter::PREBUILT_FILTER_ENV_VAR;
pub use wrap::SandboxPlatform;
pub use wrap::WrapRequest;
pub use wrap::wrap_command;
