//! Firewall baseline: the static, ordered rule list installed at start-up.
//!
//! Rules live in a dedicated chain that `INPUT` jumps to. The chain is
//! flushed before every install, so re-applying after a crash or restart
//! never duplicates rules. Order within the chain is enforced by
//! [`Stage`]: preamble accepts, then permanent exemptions, then
//! allowlist-gated admission, then the default-deny terminal rule.

use super::filter::{family_set_name, PacketFilter};
use crate::error::{FailedStep, PortgateError, PortgateResult};
use portgate_core::{Address, Family, PortRange};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Transport protocol of an admission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Per-source rate limit attached to admission rules (`-m hashlimit`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HashLimit {
    /// iptables rate expression, e.g. `"50/second"`.
    pub rate: String,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    100
}

/// Optional hardening applied to admission rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Hardening {
    #[serde(default)]
    pub hashlimit: Option<HashLimit>,
    /// Maximum concurrent TCP connections per source (`-m connlimit`).
    #[serde(default)]
    pub connlimit: Option<u32>,
}

/// Ordering class of a rule. Rules must appear in non-decreasing stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Preamble,
    Exempt,
    Admission,
    Terminal,
}

/// One rule of the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSpec {
    Loopback,
    Established,
    Icmp { limit: Option<String> },
    /// Permanently accepted source address.
    ExemptSource(Address),
    /// The control API port stays reachable regardless of the allowlist.
    ControlPort(u16),
    /// Allowlisted sources may reach the relay's dynamic port range.
    Admission {
        protocol: Protocol,
        set: String,
        ports: PortRange,
        hardening: Hardening,
    },
    /// Sources in the backend set are accepted.
    BackendSource { set: String },
    DefaultDeny,
}

impl RuleSpec {
    pub fn stage(&self) -> Stage {
        match self {
            RuleSpec::Loopback | RuleSpec::Established | RuleSpec::Icmp { .. } => Stage::Preamble,
            RuleSpec::ExemptSource(_) | RuleSpec::ControlPort(_) => Stage::Exempt,
            RuleSpec::Admission { .. } | RuleSpec::BackendSource { .. } => Stage::Admission,
            RuleSpec::DefaultDeny => Stage::Terminal,
        }
    }

    /// Whether the rule is installed into the `family` chain.
    pub fn applies_to(&self, family: Family) -> bool {
        match self {
            RuleSpec::ExemptSource(addr) => addr.family() == family,
            _ => true,
        }
    }

    /// iptables match/target arguments (everything after `-A <chain>`).
    pub fn to_args(&self, family: Family) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));
        match self {
            RuleSpec::Loopback => push(&["-i", "lo"]),
            RuleSpec::Established => push(&["-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED"]),
            RuleSpec::Icmp { limit } => {
                let proto = match family {
                    Family::V4 => "icmp",
                    Family::V6 => "ipv6-icmp",
                };
                push(&["-p", proto]);
                if let Some(rate) = limit {
                    push(&["-m", "limit", "--limit", rate]);
                }
            }
            RuleSpec::ExemptSource(addr) => push(&["-s", &addr.to_string()]),
            RuleSpec::ControlPort(port) => push(&["-p", "tcp", "--dport", &port.to_string()]),
            RuleSpec::Admission {
                protocol,
                set,
                ports,
                hardening,
            } => {
                let set_name = family_set_name(set, family);
                let range = format!("{}:{}", ports.start(), ports.end());
                push(&["-p", protocol.as_str(), "-m", "set", "--match-set", &set_name, "src"]);
                push(&["--dport", &range]);
                if let Some(limit) = &hardening.hashlimit {
                    let name = format!(
                        "pg-{}{}",
                        protocol.as_str(),
                        if family == Family::V4 { 4 } else { 6 }
                    );
                    push(&["-m", "hashlimit", "--hashlimit-upto", &limit.rate]);
                    push(&["--hashlimit-burst", &limit.burst.to_string()]);
                    push(&["--hashlimit-mode", "srcip", "--hashlimit-name", &name]);
                }
                if let (Some(max), Protocol::Tcp) = (hardening.connlimit, protocol) {
                    let mask = if family == Family::V4 { "32" } else { "128" };
                    push(&["-m", "connlimit", "--connlimit-upto", &max.to_string()]);
                    push(&["--connlimit-mask", mask]);
                }
            }
            RuleSpec::BackendSource { set } => {
                let set_name = family_set_name(set, family);
                push(&["-m", "set", "--match-set", &set_name, "src"]);
            }
            RuleSpec::DefaultDeny => {}
        }
        let target = match self {
            RuleSpec::DefaultDeny => "DROP",
            _ => "ACCEPT",
        };
        args.extend(["-j".to_string(), target.to_string()]);
        args
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSpec::Loopback => f.write_str("loopback accept"),
            RuleSpec::Established => f.write_str("established accept"),
            RuleSpec::Icmp { .. } => f.write_str("icmp accept"),
            RuleSpec::ExemptSource(addr) => write!(f, "exempt {addr}"),
            RuleSpec::ControlPort(port) => write!(f, "control port {port}"),
            RuleSpec::Admission { protocol, ports, .. } => {
                write!(f, "{} admission {ports}", protocol.as_str())
            }
            RuleSpec::BackendSource { .. } => f.write_str("backend accept"),
            RuleSpec::DefaultDeny => f.write_str("default deny"),
        }
    }
}

/// Ordered rule list plus the chain and sets it references.
#[derive(Debug, Clone)]
pub struct FirewallBaseline {
    chain: String,
    families: Vec<Family>,
    sets: Vec<String>,
    rules: Vec<RuleSpec>,
}

impl FirewallBaseline {
    pub fn builder(chain: impl Into<String>) -> BaselineBuilder {
        BaselineBuilder {
            chain: chain.into(),
            families: vec![Family::V4],
            sets: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn rules(&self) -> &[RuleSpec] {
        &self.rules
    }
}

/// Collects rules and checks their order on [`build`](BaselineBuilder::build).
#[derive(Debug)]
pub struct BaselineBuilder {
    chain: String,
    families: Vec<Family>,
    sets: Vec<String>,
    rules: Vec<RuleSpec>,
}

impl BaselineBuilder {
    /// Also install the chain for IPv6.
    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        if enabled && !self.families.contains(&Family::V6) {
            self.families.push(Family::V6);
        }
        self
    }

    /// Ensure an address set exists before rules referencing it are installed.
    pub fn set(mut self, name: impl Into<String>) -> Self {
        self.sets.push(name.into());
        self
    }

    pub fn rule(mut self, rule: RuleSpec) -> Self {
        self.rules.push(rule);
        self
    }

    /// Validate ordering and append the default-deny terminal rule.
    pub fn build(mut self) -> PortgateResult<FirewallBaseline> {
        if self.chain.is_empty() {
            return Err(PortgateError::Config("firewall chain name is empty".into()));
        }
        let mut last = Stage::Preamble;
        for rule in &self.rules {
            let stage = rule.stage();
            if stage == Stage::Terminal {
                return Err(PortgateError::Config(
                    "default deny is appended automatically and must not be listed".into(),
                ));
            }
            if stage < last {
                return Err(PortgateError::Config(format!(
                    "rule `{rule}` ({stage:?}) may not follow a {last:?} rule"
                )));
            }
            last = stage;
        }
        self.rules.push(RuleSpec::DefaultDeny);
        Ok(FirewallBaseline {
            chain: self.chain,
            families: self.families,
            sets: self.sets,
            rules: self.rules,
        })
    }
}

/// Outcome of a fully successful [`FirewallPolicy::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub steps: usize,
}

/// Installs a [`FirewallBaseline`] through a [`PacketFilter`].
pub struct FirewallPolicy {
    filter: Arc<dyn PacketFilter>,
}

impl FirewallPolicy {
    pub fn new(filter: Arc<dyn PacketFilter>) -> Self {
        Self { filter }
    }

    /// Install `baseline`, continuing past failed steps.
    ///
    /// Every step is attempted even after an earlier one fails, so the
    /// default-deny rule is installed whenever the chain itself exists.
    /// Any failure turns the result into [`PortgateError::PartialFailure`]
    /// listing exactly the steps that failed.
    pub async fn apply(&self, baseline: &FirewallBaseline) -> PortgateResult<ApplyReport> {
        let mut failed = Vec::new();
        let mut steps = 0usize;
        let chain = baseline.chain.as_str();

        let mut record = |step: String, result: PortgateResult<()>| {
            steps += 1;
            if let Err(e) = result {
                let stderr = match e {
                    PortgateError::ExternalTool { stderr, .. } => stderr,
                    other => other.to_string(),
                };
                warn!(step = %step, stderr = %stderr, "firewall step failed, continuing");
                failed.push(FailedStep { step, stderr });
            }
        };

        for &family in &baseline.families {
            for set in &baseline.sets {
                let result = self.filter.ensure_set(set, family).await;
                let step = format!("{} ensure set {}", tag(family), family_set_name(set, family));
                record(step, result);
            }
        }

        for &family in &baseline.families {
            let result = self.filter.ensure_chain(family, chain).await;
            record(format!("{} ensure chain {chain}", tag(family)), result);
            let result = self.filter.flush_chain(family, chain).await;
            record(format!("{} flush chain {chain}", tag(family)), result);

            for (index, rule) in baseline.rules.iter().enumerate() {
                if !rule.applies_to(family) {
                    continue;
                }
                let result = self.filter.install_rule(family, chain, rule).await;
                record(format!("{} rule {} ({rule})", tag(family), index + 1), result);
            }

            let result = self.filter.ensure_jump(family, chain).await;
            record(format!("{} jump INPUT -> {chain}", tag(family)), result);
        }

        if failed.is_empty() {
            info!(chain, steps, "firewall baseline applied");
            Ok(ApplyReport { steps })
        } else {
            error!(chain, steps, failed = failed.len(), "firewall baseline partially applied");
            Err(PortgateError::PartialFailure {
                failed_steps: failed,
            })
        }
    }
}

fn tag(family: Family) -> &'static str {
    match family {
        Family::V4 => "ipv4",
        Family::V6 => "ipv6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::filter::DryRunFilter;

    fn admission(protocol: Protocol) -> RuleSpec {
        RuleSpec::Admission {
            protocol,
            set: "allow".into(),
            ports: PortRange::default(),
            hardening: Hardening::default(),
        }
    }

    fn baseline() -> FirewallBaseline {
        FirewallBaseline::builder("PORTGATE")
            .set("allow")
            .rule(RuleSpec::Loopback)
            .rule(RuleSpec::Established)
            .rule(RuleSpec::Icmp { limit: None })
            .rule(RuleSpec::ExemptSource(Address::parse("203.0.113.7").unwrap()))
            .rule(RuleSpec::ControlPort(8080))
            .rule(admission(Protocol::Tcp))
            .rule(admission(Protocol::Udp))
            .build()
            .unwrap()
    }

    #[test]
    fn default_deny_is_last() {
        let b = baseline();
        assert_eq!(b.rules().last(), Some(&RuleSpec::DefaultDeny));
        assert_eq!(
            b.rules().iter().filter(|r| **r == RuleSpec::DefaultDeny).count(),
            1
        );
    }

    #[test]
    fn out_of_order_rules_rejected() {
        let err = FirewallBaseline::builder("PORTGATE")
            .rule(admission(Protocol::Tcp))
            .rule(RuleSpec::Loopback)
            .build()
            .unwrap_err();
        assert!(matches!(err, PortgateError::Config(_)));
    }

    #[test]
    fn explicit_default_deny_rejected() {
        assert!(FirewallBaseline::builder("PORTGATE")
            .rule(RuleSpec::DefaultDeny)
            .build()
            .is_err());
    }

    #[test]
    fn admission_args_with_hardening() {
        let rule = RuleSpec::Admission {
            protocol: Protocol::Tcp,
            set: "allow".into(),
            ports: PortRange::default(),
            hardening: Hardening {
                hashlimit: Some(HashLimit {
                    rate: "50/second".into(),
                    burst: 100,
                }),
                connlimit: Some(20),
            },
        };
        assert_eq!(
            rule.to_args(Family::V4).join(" "),
            "-p tcp -m set --match-set allow src --dport 10000:60000 \
             -m hashlimit --hashlimit-upto 50/second --hashlimit-burst 100 \
             --hashlimit-mode srcip --hashlimit-name pg-tcp4 \
             -m connlimit --connlimit-upto 20 --connlimit-mask 32 -j ACCEPT"
        );
    }

    #[test]
    fn connlimit_skipped_for_udp() {
        let rule = RuleSpec::Admission {
            protocol: Protocol::Udp,
            set: "allow".into(),
            ports: PortRange::default(),
            hardening: Hardening {
                hashlimit: None,
                connlimit: Some(20),
            },
        };
        assert!(!rule.to_args(Family::V6).iter().any(|a| a == "connlimit"));
        assert!(rule.to_args(Family::V6).contains(&"allow6".to_string()));
    }

    #[tokio::test]
    async fn apply_installs_in_order() {
        let filter = Arc::new(DryRunFilter::new());
        let policy = FirewallPolicy::new(filter.clone());
        let report = policy.apply(&baseline()).await.unwrap();

        let cmds = filter.commands();
        assert_eq!(report.steps, cmds.len());
        assert_eq!(cmds[0], "ipset create allow hash:ip family inet -exist");
        assert_eq!(cmds[1], "iptables -w -N PORTGATE");
        assert_eq!(cmds[2], "iptables -w -F PORTGATE");
        assert_eq!(cmds[3], "iptables -w -A PORTGATE -i lo -j ACCEPT");
        let deny = cmds
            .iter()
            .position(|c| c == "iptables -w -A PORTGATE -j DROP")
            .unwrap();
        let tcp = cmds.iter().position(|c| c.contains("-p tcp -m set")).unwrap();
        assert!(tcp < deny);
        assert_eq!(cmds.last().unwrap(), "iptables -w -I INPUT 1 -j PORTGATE");
    }

    #[tokio::test]
    async fn one_failing_step_still_installs_default_deny() {
        let filter = Arc::new(DryRunFilter::new().failing_on("--ctstate"));
        let policy = FirewallPolicy::new(filter.clone());
        let err = policy.apply(&baseline()).await.unwrap_err();

        match err {
            PortgateError::PartialFailure { failed_steps } => {
                assert_eq!(failed_steps.len(), 1);
                assert_eq!(failed_steps[0].step, "ipv4 rule 2 (established accept)");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(filter
            .commands()
            .contains(&"iptables -w -A PORTGATE -j DROP".to_string()));
    }

    #[tokio::test]
    async fn ipv6_exempt_only_in_matching_family() {
        let b = FirewallBaseline::builder("PORTGATE")
            .with_ipv6(true)
            .rule(RuleSpec::ExemptSource(Address::parse("2001:db8::5").unwrap()))
            .build()
            .unwrap();
        let filter = Arc::new(DryRunFilter::new());
        FirewallPolicy::new(filter.clone()).apply(&b).await.unwrap();
        let cmds = filter.commands();
        assert!(cmds.contains(&"ip6tables -w -A PORTGATE -s 2001:db8::5 -j ACCEPT".to_string()));
        assert!(!cmds.iter().any(|c| c.starts_with("iptables ") && c.contains("2001:db8::5")));
    }
}
