//! Packet-filter backends.
//!
//! Every operation the daemon performs against the kernel firewall is
//! expressed as an [`Invocation`] of `ipset`, `iptables` or `ip6tables`.
//! [`PacketFilter`] implementors only decide how an invocation is executed:
//!
//! - [`IptablesFilter`] runs it (optionally through `sudo`) and maps a
//!   non-zero exit to [`PortgateError::ExternalTool`].
//! - [`DryRunFilter`] logs and records it without touching the system.

use super::baseline::RuleSpec;
use crate::error::{PortgateError, PortgateResult};
use portgate_core::{Address, Family};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Boxed future returned by [`PacketFilter`] operations.
pub type FilterFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single external command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Invocation {
    fn new<I, S>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn tables(family: Family) -> &'static str {
        match family {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    fn iptables<I, S>(family: Family, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // `-w` waits for the xtables lock instead of failing under contention.
        let mut inv = Self::new(Self::tables(family), ["-w"]);
        inv.args.extend(args.into_iter().map(Into::into));
        inv
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Name of the ipset backing `set` for the given family.
///
/// ipset sets are single-family, so IPv6 members live in a sibling set.
pub fn family_set_name(set: &str, family: Family) -> String {
    match family {
        Family::V4 => set.to_string(),
        Family::V6 => format!("{set}6"),
    }
}

/// Executes packet-filter invocations.
///
/// Implementors provide [`run`](PacketFilter::run) and
/// [`probe`](PacketFilter::probe); the set and chain operations are built on
/// top of them and are identical for every backend.
pub trait PacketFilter: Send + Sync {
    /// Run an invocation; non-zero exit is an error.
    fn run(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<()>>;

    /// Run a read-only check; `true` when it exits successfully.
    fn probe(&self, inv: Invocation) -> FilterFuture<'_, bool>;

    /// Run a read-only command and capture its standard output.
    fn query(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<String>>;

    /// Create the set for `family` if it does not exist yet.
    fn ensure_set<'a>(
        &'a self,
        set: &'a str,
        family: Family,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        let kind = match family {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        };
        self.run(Invocation::new(
            "ipset",
            [
                "create".to_string(),
                family_set_name(set, family),
                "hash:ip".into(),
                "family".into(),
                kind.into(),
                "-exist".into(),
            ],
        ))
    }

    /// Add `addr`; already-present is success.
    fn add_to_set<'a>(
        &'a self,
        set: &'a str,
        addr: Address,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        self.run(Invocation::new(
            "ipset",
            [
                "add".to_string(),
                family_set_name(set, addr.family()),
                addr.to_string(),
                "-exist".into(),
            ],
        ))
    }

    /// Remove `addr`; absent is success.
    fn remove_from_set<'a>(
        &'a self,
        set: &'a str,
        addr: Address,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        self.run(Invocation::new(
            "ipset",
            [
                "del".to_string(),
                family_set_name(set, addr.family()),
                addr.to_string(),
                "-exist".into(),
            ],
        ))
    }

    /// Current members of the kernel set for `family`.
    fn list_set<'a>(
        &'a self,
        set: &'a str,
        family: Family,
    ) -> FilterFuture<'a, PortgateResult<Vec<Address>>> {
        Box::pin(async move {
            let listing = self
                .query(Invocation::new(
                    "ipset",
                    ["list".to_string(), family_set_name(set, family)],
                ))
                .await?;
            Ok(parse_members(&listing))
        })
    }

    fn flush_set<'a>(
        &'a self,
        set: &'a str,
        family: Family,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        self.run(Invocation::new(
            "ipset",
            ["flush".to_string(), family_set_name(set, family)],
        ))
    }

    /// Create `chain` in the filter table unless it already exists.
    fn ensure_chain<'a>(
        &'a self,
        family: Family,
        chain: &'a str,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        Box::pin(async move {
            if self.probe(Invocation::iptables(family, ["-S", chain])).await {
                return Ok(());
            }
            self.run(Invocation::iptables(family, ["-N", chain])).await
        })
    }

    fn flush_chain<'a>(
        &'a self,
        family: Family,
        chain: &'a str,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        self.run(Invocation::iptables(family, ["-F", chain]))
    }

    /// Make `INPUT` jump to `chain` exactly once.
    fn ensure_jump<'a>(
        &'a self,
        family: Family,
        chain: &'a str,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        Box::pin(async move {
            if self
                .probe(Invocation::iptables(family, ["-C", "INPUT", "-j", chain]))
                .await
            {
                return Ok(());
            }
            self.run(Invocation::iptables(family, ["-I", "INPUT", "1", "-j", chain]))
                .await
        })
    }

    /// Append `rule` to `chain`.
    fn install_rule<'a>(
        &'a self,
        family: Family,
        chain: &'a str,
        rule: &'a RuleSpec,
    ) -> FilterFuture<'a, PortgateResult<()>> {
        let mut args = vec!["-A".to_string(), chain.to_string()];
        args.extend(rule.to_args(family));
        self.run(Invocation::iptables(family, args))
    }
}

/// Extract member addresses from `ipset list` output.
///
/// Members follow the `Members:` header, one per line; extension columns
/// such as `timeout 300` are ignored and unparsable lines skipped.
fn parse_members(listing: &str) -> Vec<Address> {
    listing
        .lines()
        .skip_while(|line| line.trim() != "Members:")
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| Address::parse(token).ok())
        .collect()
}

/// Runs invocations against the real system.
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    /// Prefix every command with `sudo -n`.
    sudo: bool,
    /// Deadline for a single command.
    timeout: Duration,
}

impl IptablesFilter {
    pub fn new(sudo: bool, timeout: Duration) -> Self {
        Self { sudo, timeout }
    }

    fn command(&self, inv: &Invocation, capture_stdout: bool) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(inv.program);
            cmd
        } else {
            Command::new(inv.program)
        };
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(if capture_stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(
        &self,
        inv: &Invocation,
        capture_stdout: bool,
    ) -> PortgateResult<std::process::Output> {
        let line = inv.to_string();
        let mut cmd = self.command(inv, capture_stdout);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PortgateError::external(line, e.to_string())),
            Err(_) => Err(PortgateError::external(
                line,
                format!("timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }
}

impl PacketFilter for IptablesFilter {
    fn run(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<()>> {
        Box::pin(async move {
            let output = self.output(&inv, false).await?;
            if output.status.success() {
                debug!(command = %inv, "packet filter command ok");
                Ok(())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(PortgateError::external(inv.to_string(), stderr))
            }
        })
    }

    fn probe(&self, inv: Invocation) -> FilterFuture<'_, bool> {
        Box::pin(async move {
            self.output(&inv, false)
                .await
                .map(|o| o.status.success())
                .unwrap_or(false)
        })
    }

    fn query(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<String>> {
        Box::pin(async move {
            let output = self.output(&inv, true).await?;
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(PortgateError::external(inv.to_string(), stderr))
            }
        })
    }
}

/// Logs invocations instead of running them.
///
/// Probes always report "absent", so a dry run shows the full command
/// sequence a first-time install would execute.
#[derive(Debug, Default)]
pub struct DryRunFilter {
    log: Mutex<Vec<String>>,
    #[cfg(test)]
    failing: Vec<String>,
}

impl DryRunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation recorded so far, rendered as command lines.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Make every invocation whose command line contains `pattern` fail.
    #[cfg(test)]
    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.failing.push(pattern.to_string());
        self
    }

    fn record(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }
}

impl PacketFilter for DryRunFilter {
    fn run(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<()>> {
        Box::pin(async move {
            let line = inv.to_string();
            info!(command = %line, "dry-run: packet filter command");
            self.record(line.clone());
            #[cfg(test)]
            if self.failing.iter().any(|p| line.contains(p.as_str())) {
                return Err(PortgateError::external(line, "injected failure"));
            }
            Ok(())
        })
    }

    fn probe(&self, inv: Invocation) -> FilterFuture<'_, bool> {
        Box::pin(async move {
            debug!(command = %inv, "dry-run: probe");
            false
        })
    }

    fn query(&self, inv: Invocation) -> FilterFuture<'_, PortgateResult<String>> {
        Box::pin(async move {
            debug!(command = %inv, "dry-run: query");
            self.record(inv.to_string());
            Ok(String::new())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn set_commands_are_idempotent_forms() {
        let filter = DryRunFilter::new();
        filter.add_to_set("allow", addr("1.2.3.4")).await.unwrap();
        filter.remove_from_set("allow", addr("1.2.3.4")).await.unwrap();
        filter.add_to_set("allow", addr("2001:db8::1")).await.unwrap();
        filter.flush_set("allow", Family::V4).await.unwrap();
        assert_eq!(
            filter.commands(),
            vec![
                "ipset add allow 1.2.3.4 -exist",
                "ipset del allow 1.2.3.4 -exist",
                "ipset add allow6 2001:db8::1 -exist",
                "ipset flush allow",
            ]
        );
    }

    #[tokio::test]
    async fn chain_setup_creates_when_probe_fails() {
        let filter = DryRunFilter::new();
        filter.ensure_chain(Family::V4, "PORTGATE").await.unwrap();
        filter.ensure_jump(Family::V6, "PORTGATE").await.unwrap();
        assert_eq!(
            filter.commands(),
            vec![
                "iptables -w -N PORTGATE",
                "ip6tables -w -I INPUT 1 -j PORTGATE",
            ]
        );
    }

    #[tokio::test]
    async fn injected_failure_surfaces_command() {
        let filter = DryRunFilter::new().failing_on("ipset add");
        let err = filter.add_to_set("allow", addr("1.2.3.4")).await.unwrap_err();
        match err {
            PortgateError::ExternalTool { command, stderr } => {
                assert_eq!(command, "ipset add allow 1.2.3.4 -exist");
                assert_eq!(stderr, "injected failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_ipset_listing() {
        let listing = "Name: portgate-allow\n\
                       Type: hash:ip\n\
                       Revision: 4\n\
                       Header: family inet hashsize 1024 maxelem 65536\n\
                       Size in memory: 248\n\
                       References: 2\n\
                       Number of entries: 2\n\
                       Members:\n\
                       198.51.100.4\n\
                       203.0.113.9 timeout 120\n";
        assert_eq!(
            parse_members(listing),
            vec![addr("198.51.100.4"), addr("203.0.113.9")]
        );
        assert!(parse_members("Name: x\nMembers:\n").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_external_tool_error() {
        let filter = IptablesFilter::new(false, Duration::from_secs(5));
        let err = filter
            .run(Invocation::new("portgate-no-such-binary", ["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PortgateError::ExternalTool { .. }));
    }
}
