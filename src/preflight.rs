//! Host readiness checks for `tpfw check`
//!
//! Nothing here mutates the host. Each check yields a [`CheckItem`]; the
//! caller decides how to render them and whether a failure is fatal.

use crate::elevation::binary_exists;
use std::fmt;

pub const CAP_NET_BIND_SERVICE: u32 = 10;
pub const CAP_NET_ADMIN: u32 = 12;
pub const CAP_NET_RAW: u32 = 13;

const PROC_STATUS: &str = "/proc/self/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CheckLevel {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckItem {
    pub name: &'static str,
    pub level: CheckLevel,
    pub message: String,
    pub suggestion: Option<String>,
}

impl CheckItem {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            level: CheckLevel::Pass,
            message: message.into(),
            suggestion: None,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>, suggestion: &str) -> Self {
        Self {
            name,
            level: CheckLevel::Warn,
            message: message.into(),
            suggestion: Some(suggestion.to_string()),
        }
    }

    fn fail(name: &'static str, message: impl Into<String>, suggestion: &str) -> Self {
        Self {
            name,
            level: CheckLevel::Fail,
            message: message.into(),
            suggestion: Some(suggestion.to_string()),
        }
    }
}

impl fmt::Display for CheckItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.name, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n       -> {suggestion}")?;
        }
        Ok(())
    }
}

/// Extracts the effective capability mask from `/proc/<pid>/status` content.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|rest| u64::from_str_radix(rest.trim(), 16).ok())
}

pub fn has_capability(mask: u64, bit: u32) -> bool {
    mask & (1u64 << bit) != 0
}

fn check_root() -> CheckItem {
    if nix::unistd::geteuid().is_root() {
        CheckItem::pass("root", "running as root")
    } else {
        CheckItem::warn(
            "root",
            "not running as root",
            "iptables will be invoked through run0, sudo or pkexec",
        )
    }
}

fn check_capability(cap_eff: Option<u64>, bit: u32, name: &'static str) -> CheckItem {
    match cap_eff {
        Some(mask) if has_capability(mask, bit) => CheckItem::pass(name, "present in effective set"),
        Some(_) => CheckItem::warn(
            name,
            "missing from effective set",
            "run as root or grant the capability (e.g. systemd AmbientCapabilities)",
        ),
        None => CheckItem::warn(
            name,
            format!("could not read CapEff from {PROC_STATUS}"),
            "check the CapEff field manually",
        ),
    }
}

fn check_iptables(program: &str) -> CheckItem {
    if binary_exists(program) {
        CheckItem::pass("iptables", format!("'{program}' found"))
    } else {
        CheckItem::fail(
            "iptables",
            format!("'{program}' not found on PATH"),
            "install iptables or set TPFW_IPTABLES_COMMAND",
        )
    }
}

/// Runs every check against the current process and `program`.
pub fn run_checks(program: &str) -> Vec<CheckItem> {
    let cap_eff = std::fs::read_to_string(PROC_STATUS)
        .ok()
        .as_deref()
        .and_then(parse_cap_eff);

    vec![
        check_root(),
        check_capability(cap_eff, CAP_NET_ADMIN, "CAP_NET_ADMIN"),
        check_capability(cap_eff, CAP_NET_RAW, "CAP_NET_RAW"),
        check_capability(cap_eff, CAP_NET_BIND_SERVICE, "CAP_NET_BIND_SERVICE"),
        check_iptables(program),
    ]
}

/// `(pass, warn, fail)` counts
pub fn summarize(checks: &[CheckItem]) -> (usize, usize, usize) {
    checks.iter().fold((0, 0, 0), |(p, w, f), c| match c.level {
        CheckLevel::Pass => (p + 1, w, f),
        CheckLevel::Warn => (p, w + 1, f),
        CheckLevel::Fail => (p, w, f + 1),
    })
}
