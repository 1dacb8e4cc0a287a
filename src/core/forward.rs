//! Chains for externally routed traffic (PREROUTING).

use crate::config::{HostConfig, ProxyConfig};
use crate::core::chain::{ChainId, FORWARD_DNS_V4, FORWARD_V4, MANGLE_PREROUTING, NAT_PREROUTING};
use crate::core::plan::{ChainBuilder, Step};
use crate::core::rules;

/// `mangle/TPFW_V4`: TPROXY for routed TCP/UDP, minus reserved destinations and DNS.
#[derive(Debug, Clone)]
pub struct ForwardRules {
    proxy: ProxyConfig,
    host: HostConfig,
}

impl ForwardRules {
    pub fn new(proxy: ProxyConfig, host: HostConfig) -> Self {
        Self { proxy, host }
    }
}

impl ChainBuilder for ForwardRules {
    fn chain(&self) -> ChainId {
        FORWARD_V4
    }

    fn hook(&self) -> ChainId {
        MANGLE_PREROUTING
    }

    fn install_steps(&self) -> Vec<Step> {
        let chain = self.chain();
        let mut steps = vec![Step::CreateChain(chain)];

        steps.extend(
            rules::reserved_network_exemptions()
                .into_iter()
                .map(|rule| Step::append(chain, rule)),
        );
        steps.push(Step::append(chain, rules::dns_exemption()));
        steps.push(Step::append(chain, rules::tproxy("tcp", &self.proxy, &self.host)));
        steps.push(Step::append(chain, rules::tproxy("udp", &self.proxy, &self.host)));
        steps.push(Step::append(
            NAT_PREROUTING,
            rules::icmp_fake_ip_dnat(&self.proxy),
        ));

        steps
    }

    fn remove_steps(&self) -> Vec<Step> {
        vec![
            Step::Unhook {
                hook: self.hook(),
                chain: self.chain(),
            },
            Step::delete(NAT_PREROUTING, rules::icmp_fake_ip_dnat(&self.proxy)),
        ]
    }
}

/// `nat/TPFW_DNS_V4`: REDIRECT routed DNS for each hijack target to the local resolver.
#[derive(Debug, Clone)]
pub struct ForwardDns {
    proxy: ProxyConfig,
    host: HostConfig,
}

impl ForwardDns {
    pub fn new(proxy: ProxyConfig, host: HostConfig) -> Self {
        Self { proxy, host }
    }
}

impl ChainBuilder for ForwardDns {
    fn chain(&self) -> ChainId {
        FORWARD_DNS_V4
    }

    fn hook(&self) -> ChainId {
        NAT_PREROUTING
    }

    fn install_steps(&self) -> Vec<Step> {
        let chain = self.chain();
        std::iter::once(Step::CreateChain(chain))
            .chain(
                rules::dns_redirects(&self.proxy, &self.host)
                    .into_iter()
                    .map(|rule| Step::append(chain, rule)),
            )
            .collect()
    }
}
