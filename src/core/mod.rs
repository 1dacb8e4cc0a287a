//! Core rule-chain orchestration
//!
//! - [`chain`]: Table, chain and rule identifiers
//! - [`client`]: The five-operation rule-table primitive
//! - [`iptables`]: [`client::RuleTableClient`] backed by the iptables binary
//! - [`memory`]: In-memory [`client::RuleTableClient`] for tests
//! - [`rules`]: Rule builders shared by the chains, group probing
//! - [`plan`]: Ordered install/remove steps and their executor
//! - [`forward`]: Chains for externally routed traffic
//! - [`local`]: Chains for locally originated traffic
//! - [`orchestrator`]: The `apply`/`clean` lifecycle
//! - [`error`]: Error types for rule-table operations

pub mod chain;
pub mod client;
pub mod error;
pub mod forward;
pub mod iptables;
pub mod local;
pub mod memory;
pub mod orchestrator;
pub mod plan;
pub mod rules;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
