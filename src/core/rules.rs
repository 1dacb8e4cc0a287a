//! Rule builders shared by the forward and local chains.

use crate::config::{HostConfig, ProxyConfig};
use crate::core::chain::RuleSpec;
use tracing::{debug, warn};

/// Destinations that are never proxied, matched first in order.
pub const RESERVED_NETWORKS: [&str; 8] = [
    "0.0.0.0/8",
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// Group systemd-resolved runs as; its upstream queries must not be hijacked.
pub const SYSTEMD_RESOLVE_GROUP: &str = "systemd-resolve";

pub const LOOPBACK: &str = "127.0.0.1";
pub const WILDCARD: &str = "0.0.0.0";

const DNS_PORT: &str = "53";

/// `-d <net> -j RETURN` for every reserved network, in match order.
pub fn reserved_network_exemptions() -> Vec<RuleSpec> {
    RESERVED_NETWORKS
        .iter()
        .map(|net| RuleSpec::new().args(["-d", net, "-j", "RETURN"]))
        .collect()
}

/// Plain UDP DNS is never intercepted by TPROXY; it is handled by the DNS chains.
pub fn dns_exemption() -> RuleSpec {
    RuleSpec::new().args(["-p", "udp", "--dport", DNS_PORT, "-j", "RETURN"])
}

pub fn uid_exemption(uid: &str) -> RuleSpec {
    RuleSpec::new().args(["-m", "owner", "--uid-owner", uid, "-j", "RETURN"])
}

pub fn gid_exemption(gid: &str) -> RuleSpec {
    RuleSpec::new().args(["-m", "owner", "--gid-owner", gid, "-j", "RETURN"])
}

/// `-p <proto> -j TPROXY` onto the proxy port on the wildcard address, marking with the fwmark.
pub fn tproxy(protocol: &str, proxy: &ProxyConfig, host: &HostConfig) -> RuleSpec {
    RuleSpec::new().args([
        "-p",
        protocol,
        "-j",
        "TPROXY",
        "--on-port",
        &proxy.tproxy_port.to_string(),
        "--on-ip",
        WILDCARD,
        "--tproxy-mark",
        &host.tproxy_mark,
    ])
}

/// One REDIRECT per hijack target, sending its UDP/53 traffic to the local resolver.
pub fn dns_redirects(proxy: &ProxyConfig, host: &HostConfig) -> Vec<RuleSpec> {
    let port = proxy.dns_port.to_string();
    host.hijack_dns
        .iter()
        .map(|target| {
            RuleSpec::new().args([
                "-p",
                "udp",
                "-d",
                target,
                "--dport",
                DNS_PORT,
                "-j",
                "REDIRECT",
                "--to-ports",
                &port,
            ])
        })
        .collect()
}

/// Lets the proxy answer pings to synthetic hosts by DNAT-ing ICMP for the fake-IP block to loopback.
pub fn icmp_fake_ip_dnat(proxy: &ProxyConfig) -> RuleSpec {
    RuleSpec::new().args([
        "-p",
        "icmp",
        "-d",
        &proxy.fake_ip_range.to_string(),
        "-j",
        "DNAT",
        "--to-destination",
        LOOPBACK,
    ])
}

/// Host-environment query for group existence.
pub trait GroupProbe {
    fn group_exists(&self, name: &str) -> bool;
}

impl<F: Fn(&str) -> bool> GroupProbe for F {
    fn group_exists(&self, name: &str) -> bool {
        self(name)
    }
}

/// Looks groups up in the system group database (`/etc/group`, NSS).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGroups;

impl GroupProbe for SystemGroups {
    fn group_exists(&self, name: &str) -> bool {
        match nix::unistd::Group::from_name(name) {
            Ok(group) => group.is_some(),
            Err(e) => {
                warn!("Group lookup for '{name}' failed, treating as absent: {e}");
                false
            }
        }
    }
}

/// Owner-based RETURN rules for locally originated traffic, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerExemptions {
    rules: Vec<RuleSpec>,
}

impl OwnerExemptions {
    /// Proxy user, direct group, then the systemd-resolve group if the host has one.
    pub fn probe<G: GroupProbe + ?Sized>(host: &HostConfig, groups: &G) -> Self {
        let mut rules = vec![
            uid_exemption(&host.clash_user),
            gid_exemption(&host.direct_group),
        ];

        if groups.group_exists(SYSTEMD_RESOLVE_GROUP) {
            rules.push(gid_exemption(SYSTEMD_RESOLVE_GROUP));
        } else {
            debug!("Group {SYSTEMD_RESOLVE_GROUP} not present, skipping its exemption");
        }

        Self { rules }
    }

    pub fn rules(&self) -> &[RuleSpec] {
        &self.rules
    }
}
