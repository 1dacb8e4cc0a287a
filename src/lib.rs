//! tpfw - transparent-proxy firewall rules
//!
//! Installs and removes the iptables chains that steer traffic into a local
//! TPROXY-capable proxy (and its DNS listener), and nothing else.
//!
//! # Architecture
//!
//! - [`core`] - Chain builders, the rule-table client, and the `apply`/`clean` lifecycle
//! - [`config`] - Proxy and host configuration, persisted as JSON
//! - [`validators`] - Input validation for configuration values
//! - [`elevation`] - Re-running tpfw once through run0/sudo/pkexec when not root
//! - [`preflight`] - Read-only host readiness checks
//! - [`audit`] - Audit log of every privileged operation
//! - [`utils`] - XDG directories
//!
//! # Safety Properties
//!
//! - `apply` and `clean` are idempotent and may be repeated freely
//! - Hook jumps are installed only after every chain is fully populated
//! - `clean` only removes what tpfw installs, and is safe on a partially applied host
//! - No rule argument is ever passed through a shell

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod preflight;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::client::RuleTableClient;
pub use core::error::{Error, Result};
pub use core::iptables::IptablesCli;
pub use core::memory::MemoryRuleTable;
pub use core::orchestrator::Orchestrator;
