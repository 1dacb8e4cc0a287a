use crate::core::chain::Table;
use crate::core::client::OperationError;
use thiserror::Error;

/// Core error types for tpfw
#[derive(Debug, Error)]
pub enum Error {
    /// Chain existence check failed
    #[error("failed to check chain {table}/{chain}: {source}")]
    ChainQuery {
        table: Table,
        chain: String,
        #[source]
        source: OperationError,
    },

    /// Chain creation failed
    #[error("failed to create chain {table}/{chain}: {source}")]
    ChainCreation {
        table: Table,
        chain: String,
        #[source]
        source: OperationError,
    },

    /// Appending or deleting a rule failed
    #[error("failed to {action} rule {table}/{chain} [{rule}]: {source}")]
    RuleMutation {
        action: RuleAction,
        table: Table,
        chain: String,
        rule: String,
        #[source]
        source: OperationError,
    },

    /// Clear-and-delete of a chain failed (typically still referenced by a jump)
    #[error("failed to delete chain {table}/{chain}: {source}")]
    ChainDeletion {
        table: Table,
        chain: String,
        #[source]
        source: OperationError,
    },

    /// Configuration rejected before touching the host
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which rule mutation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RuleAction {
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "delete")]
    Delete,
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Raw diagnostic of the underlying rule-table tool, if this error came from one.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::ChainQuery { source, .. }
            | Self::ChainCreation { source, .. }
            | Self::RuleMutation { source, .. }
            | Self::ChainDeletion { source, .. } => Some(source.message.as_str()),
            _ => None,
        }
    }

    /// The `(table, chain)` the failing operation targeted.
    pub fn chain(&self) -> Option<(Table, &str)> {
        match self {
            Self::ChainQuery { table, chain, .. }
            | Self::ChainCreation { table, chain, .. }
            | Self::RuleMutation { table, chain, .. }
            | Self::ChainDeletion { table, chain, .. } => Some((*table, chain.as_str())),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables diagnostics and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an iptables diagnostic against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify iptables rules")
                .with_suggestion("Run tpfw as root or grant it CAP_NET_ADMIN")
                .with_suggestion("Or set TPFW_ELEVATION_METHOD=sudo to re-run tpfw through sudo")
                .with_suggestion("Check capabilities with: tpfw check");
        }

        if (lower.contains("no such file") && !lower.contains("couldn't load"))
            || lower.contains("command not found")
        {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables-nft  (Arch)")
                .with_suggestion("Or point TPFW_IPTABLES_COMMAND at the binary");
        }

        // Extension modules missing from the kernel
        if lower.contains("couldn't load target `tproxy'")
            || lower.contains("couldn't load target \"tproxy\"")
        {
            return ErrorTranslation::new("The kernel TPROXY target is not available")
                .with_suggestion("Load the module: sudo modprobe xt_TPROXY")
                .with_suggestion("Ensure the kernel is built with CONFIG_NETFILTER_XT_TARGET_TPROXY")
                .with_help("https://docs.kernel.org/networking/tproxy.html");
        }

        if lower.contains("couldn't load match `owner'") || lower.contains("couldn't load match \"owner\"") {
            return ErrorTranslation::new("The owner match extension is not available")
                .with_suggestion("Load the module: sudo modprobe xt_owner");
        }

        if lower.contains("too many links") {
            return ErrorTranslation::new("Chain is still referenced by a jump rule")
                .with_suggestion("Another rule outside tpfw jumps to this chain")
                .with_suggestion("Inspect references: sudo iptables -t mangle -S; sudo iptables -t nat -S");
        }

        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Chain already exists")
                .with_suggestion("A previous run may have left state behind")
                .with_suggestion("Run: tpfw clean");
        }

        if lower.contains("no chain/target/match") || lower.contains("does not exist") {
            return ErrorTranslation::new("iptables chain, target or match not found")
                .with_suggestion("Ensure the chain exists before adding rules to it")
                .with_suggestion("Check loaded extensions: lsmod | grep xt_");
        }

        // xtables lock contention
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Another firewall manager may be modifying rules")
                .with_suggestion("Check for: sudo systemctl status firewalld ufw docker");
        }

        if lower.contains("bad argument") || lower.contains("unknown option") || lower.contains("invalid") {
            return ErrorTranslation::new("iptables rejected the rule syntax")
                .with_suggestion("Check the fwmark format, e.g. 0x29a/0xffffffff")
                .with_suggestion("Check hijack DNS targets are IPv4 addresses or CIDRs")
                .with_suggestion("Preview the generated commands with: tpfw plan apply");
        }

        if lower.contains("incompatible") && lower.contains("nf_tables") {
            return ErrorTranslation::new("Mixed iptables-legacy and iptables-nft rules detected")
                .with_suggestion("Use the same iptables backend as the rest of the system")
                .with_suggestion("Set TPFW_IPTABLES_COMMAND to iptables-legacy or iptables-nft");
        }

        ErrorTranslation::new(format!("iptables error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -t mangle -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
