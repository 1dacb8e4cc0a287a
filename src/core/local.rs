//! Chains for locally originated traffic (OUTPUT).
//!
//! Both chains start with the owner exemptions: the proxy's own egress must
//! never be looped back into it.

use crate::config::{HostConfig, ProxyConfig};
use crate::core::chain::{ChainId, LOCAL_DNS_V4, LOCAL_V4, MANGLE_OUTPUT, NAT_OUTPUT};
use crate::core::plan::{ChainBuilder, Step};
use crate::core::rules::{self, OwnerExemptions};

/// `mangle/TPFW_LOCAL_V4`: exempts reserved destinations, proxy-owned traffic
/// and plain DNS from the local path, plus the ICMP fake-IP DNAT in nat/OUTPUT.
#[derive(Debug, Clone)]
pub struct LocalRules {
    proxy: ProxyConfig,
    owners: OwnerExemptions,
}

impl LocalRules {
    pub fn new(proxy: ProxyConfig, owners: OwnerExemptions) -> Self {
        Self { proxy, owners }
    }
}

impl ChainBuilder for LocalRules {
    fn chain(&self) -> ChainId {
        LOCAL_V4
    }

    fn hook(&self) -> ChainId {
        MANGLE_OUTPUT
    }

    fn install_steps(&self) -> Vec<Step> {
        let chain = self.chain();
        let mut steps = vec![Step::CreateChain(chain)];

        steps.extend(
            rules::reserved_network_exemptions()
                .into_iter()
                .chain(self.owners.rules().iter().cloned())
                .chain(std::iter::once(rules::dns_exemption()))
                .map(|rule| Step::append(chain, rule)),
        );
        steps.push(Step::append(NAT_OUTPUT, rules::icmp_fake_ip_dnat(&self.proxy)));

        steps
    }

    fn remove_steps(&self) -> Vec<Step> {
        vec![
            Step::Unhook {
                hook: self.hook(),
                chain: self.chain(),
            },
            Step::delete(NAT_OUTPUT, rules::icmp_fake_ip_dnat(&self.proxy)),
        ]
    }
}

/// `nat/TPFW_DNS_LOCAL_V4`: REDIRECT local DNS for each hijack target.
#[derive(Debug, Clone)]
pub struct LocalDns {
    proxy: ProxyConfig,
    host: HostConfig,
    owners: OwnerExemptions,
}

impl LocalDns {
    pub fn new(proxy: ProxyConfig, host: HostConfig, owners: OwnerExemptions) -> Self {
        Self { proxy, host, owners }
    }
}

impl ChainBuilder for LocalDns {
    fn chain(&self) -> ChainId {
        LOCAL_DNS_V4
    }

    fn hook(&self) -> ChainId {
        NAT_OUTPUT
    }

    fn install_steps(&self) -> Vec<Step> {
        let chain = self.chain();
        std::iter::once(Step::CreateChain(chain))
            .chain(
                self.owners
                    .rules()
                    .iter()
                    .cloned()
                    .chain(rules::dns_redirects(&self.proxy, &self.host))
                    .map(|rule| Step::append(chain, rule)),
            )
            .collect()
    }
}
