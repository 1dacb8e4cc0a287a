//! Privilege elevation for rule-table commands
//!
//! tpfw normally runs as root (it is started by the service manager next to
//! the proxy). When it is not, the whole tpfw process is re-run once under an
//! elevation helper, so a lifecycle call prompts at most once instead of once
//! per iptables invocation.
//!
//! # Elevation Strategy
//!
//! - **Root**: no elevation
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **CLI fallback**: `sudo` for terminal environments
//! - **Headless fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `TPFW_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for scripts with sudoers NOPASSWD rules.
//!   Example: `TPFW_ELEVATION_METHOD=sudo tpfw apply`
//!
//! - `TPFW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! Helpers reset the environment, so the variables in [`FORWARDED_ENV`] are
//! passed to the elevated process explicitly through `env`.
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Elevation binaries are checked for availability before use

use std::ffi::{OsStr, OsString};
use std::io;
use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `TPFW_ELEVATION_METHOD`
    #[error("Invalid TPFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
///
/// Absolute or relative paths are checked directly.
pub(crate) fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Variables the elevated process still needs after the helper resets the environment
pub const FORWARDED_ENV: [&str; 1] = [crate::core::iptables::IPTABLES_COMMAND_ENV];

/// Picks the helper that grants root, or `None` when no elevation is needed.
fn elevation_helper() -> Result<Option<String>, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("TPFW_TEST_NO_ELEVATION").is_ok() {
        return Ok(None);
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::geteuid().is_root() {
        return Ok(None);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("TPFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(Some(method))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(Some("run0".to_string()));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        Ok(Some("sudo".to_string()))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(Some("pkexec".to_string()))
    }
}

/// `helper env VAR=value... program args...`
fn wrapped<I, S>(helper: &str, program: &OsStr, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(helper);
    cmd.arg("env");
    for name in FORWARDED_ENV {
        if let Some(value) = std::env::var_os(name) {
            let mut assignment = OsString::from(name);
            assignment.push("=");
            assignment.push(value);
            cmd.arg(assignment);
        }
    }
    cmd.arg(program).args(args);
    cmd
}

/// Command re-running the current executable with `args` as root
///
/// Returns `None` when the process is already privileged (or elevation is
/// bypassed for tests); the caller then proceeds in-process. Arguments are
/// passed directly without shell interpretation.
pub fn elevated_self_command<I, S>(args: I) -> Result<Option<Command>, ElevationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let Some(helper) = elevation_helper()? else {
        return Ok(None);
    };
    let exe = std::env::current_exe()?;
    Ok(Some(wrapped(&helper, exe.as_os_str(), args)))
}
