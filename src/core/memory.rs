//! In-memory [`RuleTableClient`] for deterministic tests.
//!
//! Enforces the same invariants the kernel does: rules can only be appended to
//! existing chains, jumps must target an existing chain, built-in chains cannot
//! be deleted, and a chain cannot be deleted while a rule still jumps to it.
//! Diagnostics mimic iptables wording so error translation can be exercised.

use crate::core::chain::{BUILTIN_CHAINS, RuleSpec, Table};
use crate::core::client::{OpResult, OperationError, RuleTableClient};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use strum::IntoEnumIterator;

/// Key of a chain in the snapshot: `(table, chain name)`
pub type ChainKey = (Table, String);

/// Operation kinds, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    CreateChain,
    ChainExists,
    Append,
    Delete,
    ClearAndDelete,
    RuleExists,
}

#[derive(Debug, Clone)]
struct Fault {
    op: OpKind,
    table: Table,
    chain: String,
    message: String,
}

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<ChainKey, Vec<RuleSpec>>,
    faults: Vec<Fault>,
}

#[derive(Debug)]
pub struct MemoryRuleTable {
    state: Mutex<State>,
}

impl Default for MemoryRuleTable {
    fn default() -> Self {
        Self::new()
    }
}

fn no_chain() -> OperationError {
    OperationError::new("iptables: No chain/target/match by that name.", Some(1))
}

impl MemoryRuleTable {
    /// A pristine host: every table holds only its empty built-in chains.
    pub fn new() -> Self {
        let mut chains = BTreeMap::new();
        for table in Table::iter() {
            for name in BUILTIN_CHAINS {
                chains.insert((table, name.to_string()), Vec::new());
            }
        }
        Self {
            state: Mutex::new(State {
                chains,
                faults: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes every subsequent `op` on `table/chain` fail with `message`.
    pub fn fail_on(&self, op: OpKind, table: Table, chain: &str, message: &str) {
        self.lock().faults.push(Fault {
            op,
            table,
            chain: chain.to_string(),
            message: message.to_string(),
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Rules of `table/chain` in evaluation order; empty if the chain is absent.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<RuleSpec> {
        self.lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    /// Full copy of the table state, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<ChainKey, Vec<RuleSpec>> {
        self.lock().chains.clone()
    }

    /// Seeds a chain that was not created by tpfw (e.g. another tool's rules).
    pub fn seed_chain(&self, table: Table, chain: &str, rules: Vec<RuleSpec>) {
        self.lock().chains.insert((table, chain.to_string()), rules);
    }

    fn check_fault(state: &State, op: OpKind, table: Table, chain: &str) -> OpResult<()> {
        match state
            .faults
            .iter()
            .find(|f| f.op == op && f.table == table && f.chain == chain)
        {
            Some(fault) => Err(OperationError::new(fault.message.clone(), Some(2))),
            None => Ok(()),
        }
    }
}

impl RuleTableClient for MemoryRuleTable {
    fn create_chain_if_absent(&self, table: Table, chain: &str) -> OpResult<()> {
        let mut state = self.lock();
        Self::check_fault(&state, OpKind::CreateChain, table, chain)?;
        state.chains.entry((table, chain.to_string())).or_default();
        Ok(())
    }

    fn chain_exists(&self, table: Table, chain: &str) -> OpResult<bool> {
        let state = self.lock();
        Self::check_fault(&state, OpKind::ChainExists, table, chain)?;
        Ok(state.chains.contains_key(&(table, chain.to_string())))
    }

    fn append_unique(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        let mut state = self.lock();
        Self::check_fault(&state, OpKind::Append, table, chain)?;

        if let Some(target) = rule.jumps_to_chain()
            && !state.chains.contains_key(&(table, target.to_string()))
        {
            return Err(OperationError::new(
                format!("iptables v1.8.9: Couldn't load target `{target}':No such file or directory"),
                Some(2),
            ));
        }

        let rules = state
            .chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(no_chain)?;
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn delete_if_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        let mut state = self.lock();
        Self::check_fault(&state, OpKind::Delete, table, chain)?;

        if let Some(rules) = state.chains.get_mut(&(table, chain.to_string()))
            && let Some(pos) = rules.iter().position(|r| r == rule)
        {
            rules.remove(pos);
        }
        Ok(())
    }

    fn clear_and_delete_chain(&self, table: Table, chain: &str) -> OpResult<()> {
        let mut state = self.lock();
        Self::check_fault(&state, OpKind::ClearAndDelete, table, chain)?;

        let key = (table, chain.to_string());
        if !state.chains.contains_key(&key) {
            return Ok(());
        }
        if BUILTIN_CHAINS.contains(&chain) {
            return Err(OperationError::new(
                "iptables: Can't delete built-in chain.",
                Some(1),
            ));
        }

        let referenced = state
            .chains
            .iter()
            .filter(|((t, name), _)| *t == table && name != chain)
            .flat_map(|(_, rules)| rules.iter())
            .any(|r| r.jumps_to_chain() == Some(chain));
        if referenced {
            return Err(OperationError::new("iptables: Too many links.", Some(1)));
        }

        state.chains.remove(&key);
        Ok(())
    }

    fn rule_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<bool> {
        let state = self.lock();
        Self::check_fault(&state, OpKind::RuleExists, table, chain)?;
        Ok(state
            .chains
            .get(&(table, chain.to_string()))
            .is_some_and(|rules| rules.contains(rule)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret(dest: &str) -> RuleSpec {
        RuleSpec::new().args(["-d", dest, "-j", "RETURN"])
    }

    #[test]
    fn test_pristine_has_only_builtins() {
        let mem = MemoryRuleTable::new();
        assert!(mem.has_chain(Table::Mangle, "PREROUTING"));
        assert!(mem.has_chain(Table::Nat, "OUTPUT"));
        assert!(!mem.has_chain(Table::Mangle, "TPFW_V4"));
        assert!(mem.snapshot().values().all(Vec::is_empty));
    }

    #[test]
    fn test_append_requires_chain() {
        let mem = MemoryRuleTable::new();
        let err = mem.append_unique(Table::Mangle, "TPFW_V4", &ret("10.0.0.0/8")).unwrap_err();
        assert!(err.message.contains("No chain/target/match"));
    }

    #[test]
    fn test_append_is_unique() {
        let mem = MemoryRuleTable::new();
        mem.create_chain_if_absent(Table::Mangle, "TPFW_V4").unwrap();
        mem.append_unique(Table::Mangle, "TPFW_V4", &ret("10.0.0.0/8")).unwrap();
        mem.append_unique(Table::Mangle, "TPFW_V4", &ret("10.0.0.0/8")).unwrap();
        mem.append_unique(Table::Mangle, "TPFW_V4", &ret("127.0.0.0/8")).unwrap();
        assert_eq!(
            mem.rules(Table::Mangle, "TPFW_V4"),
            vec![ret("10.0.0.0/8"), ret("127.0.0.0/8")]
        );
    }

    #[test]
    fn test_jump_to_missing_chain_rejected() {
        let mem = MemoryRuleTable::new();
        let err = mem
            .append_unique(Table::Mangle, "PREROUTING", &RuleSpec::jump("TPFW_V4"))
            .unwrap_err();
        assert!(err.message.contains("Couldn't load target"));
    }

    #[test]
    fn test_referenced_chain_cannot_be_deleted() {
        let mem = MemoryRuleTable::new();
        mem.create_chain_if_absent(Table::Nat, "TPFW_DNS_V4").unwrap();
        mem.append_unique(Table::Nat, "PREROUTING", &RuleSpec::jump("TPFW_DNS_V4"))
            .unwrap();

        let err = mem.clear_and_delete_chain(Table::Nat, "TPFW_DNS_V4").unwrap_err();
        assert_eq!(err.message, "iptables: Too many links.");

        mem.delete_if_exists(Table::Nat, "PREROUTING", &RuleSpec::jump("TPFW_DNS_V4"))
            .unwrap();
        mem.clear_and_delete_chain(Table::Nat, "TPFW_DNS_V4").unwrap();
        assert!(!mem.has_chain(Table::Nat, "TPFW_DNS_V4"));
    }

    #[test]
    fn test_same_name_in_other_table_is_not_a_reference() {
        let mem = MemoryRuleTable::new();
        mem.create_chain_if_absent(Table::Nat, "X").unwrap();
        mem.create_chain_if_absent(Table::Mangle, "X").unwrap();
        mem.append_unique(Table::Mangle, "OUTPUT", &RuleSpec::jump("X")).unwrap();
        mem.clear_and_delete_chain(Table::Nat, "X").unwrap();
    }

    #[test]
    fn test_builtin_cannot_be_deleted() {
        let mem = MemoryRuleTable::new();
        assert!(mem.clear_and_delete_chain(Table::Mangle, "OUTPUT").is_err());
    }

    #[test]
    fn test_absent_deletes_are_noops() {
        let mem = MemoryRuleTable::new();
        mem.delete_if_exists(Table::Nat, "TPFW_DNS_V4", &ret("1.1.1.1")).unwrap();
        mem.delete_if_exists(Table::Nat, "OUTPUT", &ret("1.1.1.1")).unwrap();
        mem.clear_and_delete_chain(Table::Nat, "TPFW_DNS_V4").unwrap();
    }

    #[test]
    fn test_rule_exists_query() {
        let mem = MemoryRuleTable::new();
        let rule = ret("10.0.0.0/8");
        assert!(!mem.rule_exists(Table::Mangle, "TPFW_V4", &rule).unwrap());

        mem.create_chain_if_absent(Table::Mangle, "TPFW_V4").unwrap();
        mem.append_unique(Table::Mangle, "TPFW_V4", &rule).unwrap();
        assert!(mem.rule_exists(Table::Mangle, "TPFW_V4", &rule).unwrap());
        assert!(!mem.rule_exists(Table::Nat, "TPFW_V4", &rule).unwrap());
    }

    #[test]
    fn test_fault_injection() {
        let mem = MemoryRuleTable::new();
        mem.fail_on(OpKind::CreateChain, Table::Mangle, "TPFW_V4", "boom");
        let err = mem.create_chain_if_absent(Table::Mangle, "TPFW_V4").unwrap_err();
        assert_eq!(err.message, "boom");

        // Other chains are unaffected
        mem.create_chain_if_absent(Table::Nat, "TPFW_V4").unwrap();

        mem.clear_faults();
        mem.create_chain_if_absent(Table::Mangle, "TPFW_V4").unwrap();
    }
}
