//! Table, chain and rule identifiers shared by every chain builder.

use std::fmt;

/// iptables table a chain lives in
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Table {
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "nat")]
    Nat,
}

pub const PREROUTING: &str = "PREROUTING";
pub const OUTPUT: &str = "OUTPUT";

/// Chains every table is born with; they can be referenced but never deleted.
pub const BUILTIN_CHAINS: [&str; 5] = ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

/// A chain identified by `(table, name)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    pub table: Table,
    pub name: &'static str,
}

impl ChainId {
    pub const fn new(table: Table, name: &'static str) -> Self {
        Self { table, name }
    }

    pub fn is_builtin(&self) -> bool {
        BUILTIN_CHAINS.contains(&self.name)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.name)
    }
}

/// Externally routed traffic (TPROXY)
pub const FORWARD_V4: ChainId = ChainId::new(Table::Mangle, "TPFW_V4");
/// DNS hijack for externally routed traffic
pub const FORWARD_DNS_V4: ChainId = ChainId::new(Table::Nat, "TPFW_DNS_V4");
/// Locally originated traffic
pub const LOCAL_V4: ChainId = ChainId::new(Table::Mangle, "TPFW_LOCAL_V4");
/// DNS hijack for locally originated traffic
pub const LOCAL_DNS_V4: ChainId = ChainId::new(Table::Nat, "TPFW_DNS_LOCAL_V4");

pub const MANGLE_PREROUTING: ChainId = ChainId::new(Table::Mangle, PREROUTING);
pub const MANGLE_OUTPUT: ChainId = ChainId::new(Table::Mangle, OUTPUT);
pub const NAT_PREROUTING: ChainId = ChainId::new(Table::Nat, PREROUTING);
pub const NAT_OUTPUT: ChainId = ChainId::new(Table::Nat, OUTPUT);

/// Targets that are iptables extensions rather than user chains.
pub const BUILTIN_TARGETS: [&str; 8] = [
    "ACCEPT", "DROP", "RETURN", "TPROXY", "REDIRECT", "DNAT", "MARK", "REJECT",
];

/// An ordered list of match/target clauses, as passed to iptables after the chain name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// `-j <target>` with nothing else
    pub fn jump(target: &str) -> Self {
        Self::new().args(["-j", target])
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.0.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn as_args(&self) -> &[String] {
        &self.0
    }

    /// Value of the `-j` clause, if any
    pub fn target(&self) -> Option<&str> {
        self.value_of("-j")
    }

    /// Value following the first occurrence of `flag`
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.0
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.0.get(i + 1))
            .map(String::as_str)
    }

    /// True when this rule jumps to a user-defined chain rather than an extension target.
    pub fn jumps_to_chain(&self) -> Option<&str> {
        self.target().filter(|t| !BUILTIN_TARGETS.contains(t))
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}
