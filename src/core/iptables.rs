//! [`RuleTableClient`] backed by the `iptables` binary.
//!
//! Every invocation passes `-w` so a concurrent holder of the xtables lock is
//! waited for rather than failing the step. Existence probes rely on iptables
//! exiting with status 1 for "not found"; any other failure is surfaced.

use crate::core::chain::{RuleSpec, Table};
use crate::core::client::{OpResult, OperationError, RuleTableClient};
use std::process::Command;
use tracing::debug;

/// Environment variable overriding the iptables program
pub const IPTABLES_COMMAND_ENV: &str = "TPFW_IPTABLES_COMMAND";

const DEFAULT_PROGRAM: &str = "iptables";

/// Exit status iptables uses for "no such chain/rule"
const EXIT_NOT_FOUND: i32 = 1;

#[derive(Debug, Clone)]
pub struct IptablesCli {
    program: String,
    leading_args: Vec<String>,
}

struct Invocation {
    exit_code: Option<i32>,
    stderr: String,
}

impl Invocation {
    fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn not_found(&self) -> bool {
        self.exit_code == Some(EXIT_NOT_FOUND)
    }

    fn into_error(self) -> OperationError {
        let message = if self.stderr.trim().is_empty() {
            format!("exited with status {}", exit_label(self.exit_code))
        } else {
            self.stderr.trim().to_string()
        };
        OperationError::new(message, self.exit_code)
    }
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

impl IptablesCli {
    /// The system iptables (or `TPFW_IPTABLES_COMMAND`).
    ///
    /// Runs with the privileges of the current process; see
    /// [`elevation`](crate::elevation) for how tpfw gets root.
    pub fn from_env() -> Self {
        let program = std::env::var(IPTABLES_COMMAND_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());
        Self {
            program,
            leading_args: Vec::new(),
        }
    }

    /// Runs `program` instead of the system iptables.
    pub fn direct(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before every iptables argument list (e.g. a wrapper script path).
    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for one operation, without the program name.
    pub fn argv(table: Table, op: &str, chain: &str, rule: Option<&RuleSpec>) -> Vec<String> {
        let mut argv = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        if let Some(rule) = rule {
            argv.extend(rule.as_args().iter().cloned());
        }
        argv
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(argv);
        cmd
    }

    fn invoke(&self, argv: &[String]) -> OpResult<Invocation> {
        debug!("exec: {} {}", self.program, argv.join(" "));

        let output = self
            .command(argv)
            .output()
            .map_err(|e| OperationError::new(format!("failed to spawn {}: {e}", self.program), None))?;

        let invocation = Invocation {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!("exit={}", exit_label(invocation.exit_code));
        Ok(invocation)
    }

    fn run(&self, argv: &[String]) -> OpResult<()> {
        let invocation = self.invoke(argv)?;
        if invocation.success() {
            Ok(())
        } else {
            Err(invocation.into_error())
        }
    }
}

impl RuleTableClient for IptablesCli {
    fn create_chain_if_absent(&self, table: Table, chain: &str) -> OpResult<()> {
        if self.chain_exists(table, chain)? {
            return Ok(());
        }
        self.run(&Self::argv(table, "-N", chain, None))
    }

    fn chain_exists(&self, table: Table, chain: &str) -> OpResult<bool> {
        let mut argv = Self::argv(table, "-L", chain, None);
        argv.push("-n".to_string());

        let invocation = self.invoke(&argv)?;
        if invocation.success() {
            Ok(true)
        } else if invocation.not_found() {
            Ok(false)
        } else {
            Err(invocation.into_error())
        }
    }

    fn append_unique(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        if self.rule_exists(table, chain, rule)? {
            return Ok(());
        }
        self.run(&Self::argv(table, "-A", chain, Some(rule)))
    }

    fn delete_if_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<()> {
        if !self.rule_exists(table, chain, rule)? {
            return Ok(());
        }
        self.run(&Self::argv(table, "-D", chain, Some(rule)))
    }

    fn clear_and_delete_chain(&self, table: Table, chain: &str) -> OpResult<()> {
        if !self.chain_exists(table, chain)? {
            return Ok(());
        }
        self.run(&Self::argv(table, "-F", chain, None))?;
        self.run(&Self::argv(table, "-X", chain, None))
    }

    fn rule_exists(&self, table: Table, chain: &str, rule: &RuleSpec) -> OpResult<bool> {
        let invocation = self.invoke(&Self::argv(table, "-C", chain, Some(rule)))?;
        if invocation.success() {
            Ok(true)
        } else if invocation.not_found() {
            Ok(false)
        } else {
            Err(invocation.into_error())
        }
    }
}
