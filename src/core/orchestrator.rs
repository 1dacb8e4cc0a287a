//! Composes the four chains into the `apply`/`clean` lifecycle.
//!
//! Applied/unapplied state is never held in memory: it is whatever the rule
//! table says. `apply` populates all chains first and only then installs the
//! hook jumps, so traffic never enters a half-built chain. `clean` tears the
//! chains down in reverse order.

use crate::config::{HostConfig, ProxyConfig};
use crate::core::chain::{ChainId, RuleSpec};
use crate::core::client::RuleTableClient;
use crate::core::error::{Error, Result};
use crate::core::forward::{ForwardDns, ForwardRules};
use crate::core::local::{LocalDns, LocalRules};
use crate::core::plan::{ChainBuilder, Step, run_steps};
use crate::core::rules::{GroupProbe, OwnerExemptions, SystemGroups};
use tracing::info;

/// Existence of one managed chain and of its hook jump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStatus {
    pub chain: ChainId,
    pub hook: ChainId,
    pub exists: bool,
    pub hooked: bool,
}

impl ChainStatus {
    pub fn is_applied(&self) -> bool {
        self.exists && self.hooked
    }
}

/// Observed state of all managed chains, in composition order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub chains: Vec<ChainStatus>,
}

impl Status {
    pub fn is_applied(&self) -> bool {
        self.chains.iter().all(ChainStatus::is_applied)
    }

    pub fn is_clean(&self) -> bool {
        self.chains.iter().all(|c| !c.exists && !c.hooked)
    }
}

pub struct Orchestrator<C, G = SystemGroups> {
    client: C,
    proxy: ProxyConfig,
    host: HostConfig,
    groups: G,
}

impl<C: RuleTableClient> Orchestrator<C, SystemGroups> {
    /// Orchestrator probing the system group database.
    pub fn new(client: C, proxy: ProxyConfig, host: HostConfig) -> Self {
        Self::with_group_probe(client, proxy, host, SystemGroups)
    }
}

impl<C: RuleTableClient, G: GroupProbe> Orchestrator<C, G> {
    pub fn with_group_probe(client: C, proxy: ProxyConfig, host: HostConfig, groups: G) -> Self {
        Self {
            client,
            proxy,
            host,
            groups,
        }
    }

    /// Builders in composition order: forward, forward DNS, local, local DNS.
    fn builders(&self) -> Vec<Box<dyn ChainBuilder>> {
        let owners = OwnerExemptions::probe(&self.host, &self.groups);
        vec![
            Box::new(ForwardRules::new(self.proxy.clone(), self.host.clone())),
            Box::new(ForwardDns::new(self.proxy.clone(), self.host.clone())),
            Box::new(LocalRules::new(self.proxy.clone(), owners.clone())),
            Box::new(LocalDns::new(self.proxy.clone(), self.host.clone(), owners)),
        ]
    }

    /// Every chain populated in order, then the four hook jumps.
    pub fn plan_apply(&self) -> Vec<Step> {
        let builders = self.builders();
        let mut steps: Vec<Step> = builders.iter().flat_map(|b| b.install_steps()).collect();
        steps.extend(builders.iter().map(|b| b.hook_step()));
        steps
    }

    /// Teardown of every chain, in reverse composition order.
    pub fn plan_clean(&self) -> Vec<Step> {
        self.builders()
            .iter()
            .rev()
            .flat_map(|b| b.remove_steps())
            .collect()
    }

    /// Installs all chains and hooks. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. Rules installed before it stay
    /// in place; call [`clean`](Self::clean) to remove them.
    pub fn apply(&self) -> Result<()> {
        info!("apply all rules...");
        let steps = self.plan_apply();
        run_steps(&self.client, &steps)?;
        info!("{} steps applied", steps.len());
        Ok(())
    }

    /// Removes all chains, hooks, and satellite rules. Idempotent, safe on a
    /// partially applied host.
    ///
    /// # Errors
    ///
    /// Returns the first real failure; absent chains and rules are not errors.
    pub fn clean(&self) -> Result<()> {
        info!("clean all rules...");
        run_steps(&self.client, &self.plan_clean())?;
        info!("rules cleaned");
        Ok(())
    }

    /// Reports, for each managed chain, whether it and its hook jump exist.
    ///
    /// Read-only: issues existence queries and never mutates the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChainQuery`] naming the chain whose query failed.
    pub fn status(&self) -> Result<Status> {
        let chains = self
            .builders()
            .iter()
            .map(|b| {
                let chain = b.chain();
                let hook = b.hook();
                let exists = self
                    .client
                    .chain_exists(chain.table, chain.name)
                    .map_err(|source| Error::ChainQuery {
                        table: chain.table,
                        chain: chain.name.to_string(),
                        source,
                    })?;
                let hooked = self
                    .client
                    .rule_exists(hook.table, hook.name, &RuleSpec::jump(chain.name))
                    .map_err(|source| Error::ChainQuery {
                        table: hook.table,
                        chain: hook.name.to_string(),
                        source,
                    })?;
                Ok(ChainStatus {
                    chain,
                    hook,
                    exists,
                    hooked,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Status { chains })
    }
}
