//! Forward and masquerade rules for pod traffic.
//!
//! Rules are appended only when `iptables -C` reports them missing, so
//! installing them again after a daemon restart changes nothing.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, instrument};

use crate::error::{CniError, Result};

/// A rule in `table`/`chain`, without the `-A`/`-C` verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self { table, chain, spec: spec.iter().map(|s| s.to_string()).collect() }
    }
}

/// Rules letting pod traffic through this node and out to the world.
pub fn forwarding_rules(bridge: &str, host_link: &str, pod_subnet: &str) -> Vec<Rule> {
    vec![
        Rule::new("filter", "FORWARD", &["-i", bridge, "-j", "ACCEPT"]),
        Rule::new("filter", "FORWARD", &["-i", host_link, "-j", "ACCEPT"]),
        Rule::new("nat", "POSTROUTING", &["-s", pod_subnet, "-j", "MASQUERADE"]),
    ]
}

/// `iptables` front end.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self { binary: "iptables".to_string() }
    }
}

impl Iptables {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Install every rule from [`forwarding_rules`].
    #[instrument(skip(self))]
    pub async fn install_forwarding_rules(
        &self,
        bridge: &str,
        host_link: &str,
        pod_subnet: &str,
    ) -> Result<()> {
        for rule in forwarding_rules(bridge, host_link, pod_subnet) {
            self.append_unique(&rule).await?;
        }
        Ok(())
    }

    /// Append `rule` unless an identical one is already there.
    pub async fn append_unique(&self, rule: &Rule) -> Result<()> {
        if self.exists(rule).await? {
            return Ok(());
        }

        let output = self.command("-A", rule).output().await.map_err(|e| self.error(rule, e))?;
        if !output.status.success() {
            return Err(CniError::kernel(
                format!("iptables -t {} -A {} {}", rule.table, rule.chain, rule.spec.join(" ")),
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        info!("added iptables rule: -t {} -A {} {}", rule.table, rule.chain, rule.spec.join(" "));
        Ok(())
    }

    async fn exists(&self, rule: &Rule) -> Result<bool> {
        let status = self
            .command("-C", rule)
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| self.error(rule, e))?;
        Ok(status.success())
    }

    fn command(&self, verb: &str, rule: &Rule) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-w", "-t", rule.table, verb, rule.chain]).args(&rule.spec).stdout(Stdio::null());
        cmd
    }

    fn error(&self, rule: &Rule, e: std::io::Error) -> CniError {
        CniError::kernel(format!("{} -t {} {}", self.binary, rule.table, rule.chain), e.to_string())
    }
}
