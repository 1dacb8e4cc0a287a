//! Ordered, idempotent install/remove steps.
//!
//! Chain builders never touch the rule table themselves: they return a
//! `Vec<Step>` and [`run_steps`] executes it front to back, stopping at the
//! first failure. The same list renders as iptables commands for `tpfw plan`.

use crate::core::chain::{ChainId, RuleSpec};
use crate::core::client::RuleTableClient;
use crate::core::error::{Error, Result, RuleAction};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Create the chain unless it exists
    CreateChain(ChainId),
    /// Append the rule unless an identical one exists
    Append { chain: ChainId, rule: RuleSpec },
    /// Delete the rule if present
    Delete { chain: ChainId, rule: RuleSpec },
    /// If `chain` exists: delete the jump to it from `hook`, then clear and delete it
    Unhook { hook: ChainId, chain: ChainId },
}

impl Step {
    pub fn append(chain: ChainId, rule: RuleSpec) -> Self {
        Self::Append { chain, rule }
    }

    pub fn delete(chain: ChainId, rule: RuleSpec) -> Self {
        Self::Delete { chain, rule }
    }

    /// `hook -j chain`
    pub fn hook(hook: ChainId, chain: ChainId) -> Self {
        Self::Append {
            chain: hook,
            rule: RuleSpec::jump(chain.name),
        }
    }

    /// Executes this step against `client`, wrapping failures with the implicated chain and rule.
    pub fn run<C: RuleTableClient + ?Sized>(&self, client: &C) -> Result<()> {
        debug!("step: {self}");
        match self {
            Self::CreateChain(chain) => client
                .create_chain_if_absent(chain.table, chain.name)
                .map_err(|source| Error::ChainCreation {
                    table: chain.table,
                    chain: chain.name.to_string(),
                    source,
                }),
            Self::Append { chain, rule } => client
                .append_unique(chain.table, chain.name, rule)
                .map_err(|source| mutation_error(RuleAction::Append, *chain, rule, source)),
            Self::Delete { chain, rule } => client
                .delete_if_exists(chain.table, chain.name, rule)
                .map_err(|source| mutation_error(RuleAction::Delete, *chain, rule, source)),
            Self::Unhook { hook, chain } => unhook(client, *hook, *chain),
        }
    }

    /// The iptables invocations this step may issue (mutations only).
    pub fn commands(&self) -> Vec<String> {
        fn cmd(op: &str, chain: ChainId, rule: Option<&RuleSpec>) -> String {
            match rule {
                Some(rule) => format!("iptables -t {} {op} {} {rule}", chain.table, chain.name),
                None => format!("iptables -t {} {op} {}", chain.table, chain.name),
            }
        }

        match self {
            Self::CreateChain(chain) => vec![cmd("-N", *chain, None)],
            Self::Append { chain, rule } => vec![cmd("-A", *chain, Some(rule))],
            Self::Delete { chain, rule } => vec![cmd("-D", *chain, Some(rule))],
            Self::Unhook { hook, chain } => vec![
                cmd("-D", *hook, Some(&RuleSpec::jump(chain.name))),
                cmd("-F", *chain, None),
                cmd("-X", *chain, None),
            ],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateChain(chain) => write!(f, "create {chain}"),
            Self::Append { chain, rule } => write!(f, "append {chain} [{rule}]"),
            Self::Delete { chain, rule } => write!(f, "delete {chain} [{rule}]"),
            Self::Unhook { hook, chain } => write!(f, "unhook {hook} -> {}, drop {chain}", chain.name),
        }
    }
}

fn mutation_error(
    action: RuleAction,
    chain: ChainId,
    rule: &RuleSpec,
    source: crate::core::client::OperationError,
) -> Error {
    Error::RuleMutation {
        action,
        table: chain.table,
        chain: chain.name.to_string(),
        rule: rule.to_string(),
        source,
    }
}

fn unhook<C: RuleTableClient + ?Sized>(client: &C, hook: ChainId, chain: ChainId) -> Result<()> {
    let exists = client
        .chain_exists(chain.table, chain.name)
        .map_err(|source| Error::ChainQuery {
            table: chain.table,
            chain: chain.name.to_string(),
            source,
        })?;
    if !exists {
        debug!("{chain} does not exist, nothing to unhook");
        return Ok(());
    }

    debug!("clean {hook} -> {}...", chain.name);
    let jump = RuleSpec::jump(chain.name);
    client
        .delete_if_exists(hook.table, hook.name, &jump)
        .map_err(|source| mutation_error(RuleAction::Delete, hook, &jump, source))?;

    client
        .clear_and_delete_chain(chain.table, chain.name)
        .map_err(|source| Error::ChainDeletion {
            table: chain.table,
            chain: chain.name.to_string(),
            source,
        })
}

/// Runs `steps` in order; the first failure aborts with no rollback.
pub fn run_steps<C: RuleTableClient + ?Sized>(client: &C, steps: &[Step]) -> Result<()> {
    steps.iter().try_for_each(|step| step.run(client))
}

/// A custom chain hooked into a built-in chain.
pub trait ChainBuilder {
    /// The chain this builder owns
    fn chain(&self) -> ChainId;

    /// Built-in chain that jumps into [`chain`](Self::chain)
    fn hook(&self) -> ChainId;

    /// Populates the chain (and any satellite rules); never installs the hook jump.
    fn install_steps(&self) -> Vec<Step>;

    /// Removes the hook jump, the chain, and any satellite rules.
    fn remove_steps(&self) -> Vec<Step> {
        vec![Step::Unhook {
            hook: self.hook(),
            chain: self.chain(),
        }]
    }

    fn hook_step(&self) -> Step {
        Step::hook(self.hook(), self.chain())
    }
}
