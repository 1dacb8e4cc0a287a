//! The rule-table mutation primitive.
//!
//! [`RuleTableClient`] is the only OS-specific seam in tpfw: five lifecycle
//! operations plus the read-only [`rule_exists`](RuleTableClient::rule_exists)
//! query used by `status`, each parameterized by table and chain. Production code drives the
//! `iptables` binary through [`IptablesCli`](crate::core::iptables::IptablesCli);
//! tests use the stateful [`MemoryRuleTable`](crate::core::memory::MemoryRuleTable).
//!
//! All methods are synchronous. Nothing is retried.

use crate::core::chain::{RuleSpec, Table};

/// Failure of a single rule-table operation, carrying the tool's diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl OperationError {
    pub fn new(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

pub type OpResult<T> = std::result::Result<T, OperationError>;

/// Abstraction over chain and rule mutation in a packet-filter table.
pub trait RuleTableClient {
    /// Creates `chain` unless it already exists.
    fn create_chain_if_absent(&self, table: Table, chain: &str) -> OpResult<()>;

    fn chain_exists(&self, table: Table, chain: &str) -> OpResult<bool>;

    /// Appends `rule` unless an identical rule is already present in `chain`.
    fn append_unique(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()>;

    /// Deletes `rule` from `chain` if present; absent rule or chain is a no-op.
    fn delete_if_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()>;

    /// Flushes and deletes `chain` if it exists. Fails while a jump still references it.
    fn clear_and_delete_chain(&self, table: Table, chain: &str) -> OpResult<()>;

    /// True if an identical `rule` is present in `chain`; an absent chain is `false`.
    fn rule_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<bool>;
}

impl<T: RuleTableClient + ?Sized> RuleTableClient for &T {
    fn create_chain_if_absent(&self, table: Table, chain: &str) -> OpResult<()> {
        (**self).create_chain_if_absent(table, chain)
    }

    fn chain_exists(&self, table: Table, chain: &str) -> OpResult<bool> {
        (**self).chain_exists(table, chain)
    }

    fn append_unique(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        (**self).append_unique(table, chain, rule)
    }

    fn delete_if_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        (**self).delete_if_exists(table, chain, rule)
    }

    fn clear_and_delete_chain(&self, table: Table, chain: &str) -> OpResult<()> {
        (**self).clear_and_delete_chain(table, chain)
    }

    fn rule_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<bool> {
        (**self).rule_exists(table, chain, rule)
    }
}
