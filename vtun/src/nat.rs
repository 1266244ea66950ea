//! NAT and forwarding rules via iptables, so the enclave can reach the
//! Internet through the parent.

use ipnet::Ipv4Net;
use std::io;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// NAT configuration errors.
#[derive(Debug, Error)]
pub enum NatError {
    #[error("Failed to execute iptables command: {0}")]
    Command(io::Error),

    #[error("iptables command failed: {0}")]
    IptablesFailed(String),
}

pub type Result<T> = std::result::Result<T, NatError>;

/// A single iptables rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// iptables arguments applying `op` (`-C`, `-A` or `-D`) to this rule.
    pub fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "--wait".to_string(),
            "-t".to_string(),
            self.table.to_string(),
            op.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// The rules letting traffic from `subnet` behind `iface` out to the world,
/// in the order they are installed.
pub fn forwarding_rules(iface: &str, subnet: Ipv4Net) -> Vec<Rule> {
    let subnet = subnet.trunc().to_string();
    vec![
        Rule::new("nat", "POSTROUTING", &["-s", subnet.as_str(), "-j", "MASQUERADE"]),
        Rule::new("filter", "FORWARD", &["-i", iface, "-s", subnet.as_str(), "-j", "ACCEPT"]),
        Rule::new("filter", "FORWARD", &["-o", iface, "-d", subnet.as_str(), "-j", "ACCEPT"]),
    ]
}

/// Somewhere rules can be checked, appended and deleted.
pub trait RuleTable {
    fn exists(&self, rule: &Rule) -> Result<bool>;
    fn append(&self, rule: &Rule) -> Result<()>;
    fn delete(&self, rule: &Rule) -> Result<()>;
}

/// The host's iptables.
pub struct Iptables {
    binary: String,
}

impl Iptables {
    pub fn new() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(args = ?args, "Running {}", self.binary);
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(NatError::Command)
    }
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable for Iptables {
    fn exists(&self, rule: &Rule) -> Result<bool> {
        let output = self.run(&rule.args("-C"))?;
        match output.status.code() {
            Some(0) => Ok(true),
            // Exit status 1 means the rule does not exist.
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(NatError::IptablesFailed(stderr.trim().to_string()))
            }
        }
    }

    fn append(&self, rule: &Rule) -> Result<()> {
        let output = self.run(&rule.args("-A"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NatError::IptablesFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    fn delete(&self, rule: &Rule) -> Result<()> {
        let output = self.run(&rule.args("-D"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NatError::IptablesFailed(stderr.trim().to_string()));
        }
        Ok(())
    }
}

/// Toggles the forwarding rules as a unit.
pub struct Forwarding<T> {
    table: T,
    rules: Vec<Rule>,
}

impl<T: RuleTable> Forwarding<T> {
    pub fn new(table: T, rules: Vec<Rule>) -> Self {
        Self { table, rules }
    }

    /// Install every rule that is not already present.
    pub fn enable(&self) -> Result<()> {
        for rule in &self.rules {
            if !self.table.exists(rule)? {
                self.table.append(rule)?;
            }
        }
        info!(rules = self.rules.len(), "Forwarding rules enabled");
        Ok(())
    }

    /// Remove every rule that is present. Removing absent rules is not an
    /// error.
    pub fn disable(&self) -> Result<()> {
        for rule in &self.rules {
            if self.table.exists(rule)? {
                self.table.delete(rule)?;
            }
        }
        info!(rules = self.rules.len(), "Forwarding rules disabled");
        Ok(())
    }
}
