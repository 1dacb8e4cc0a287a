#[cfg(test)]
mod lifecycle_tests {
    use crate::core::chain::{
        FORWARD_DNS_V4, FORWARD_V4, LOCAL_DNS_V4, LOCAL_V4, OUTPUT, PREROUTING, RuleSpec, Table,
    };
    use crate::core::error::Error;
    use crate::core::memory::{MemoryRuleTable, OpKind};
    use crate::core::rules::{self, SYSTEMD_RESOLVE_GROUP};
    use crate::core::test_helpers::orchestrator;

    fn count_target(rules: &[RuleSpec], target: &str) -> usize {
        rules.iter().filter(|r| r.target() == Some(target)).count()
    }

    fn icmp_dnat_count(mem: &MemoryRuleTable, chain: &str) -> usize {
        mem.rules(Table::Nat, chain)
            .iter()
            .filter(|r| r.value_of("-p") == Some("icmp") && r.target() == Some("DNAT"))
            .count()
    }

    #[test]
    fn test_apply_installs_all_chains_and_hooks() {
        let mem = MemoryRuleTable::new();
        let orch = orchestrator(&mem, false);
        orch.apply().unwrap();

        for chain in [FORWARD_V4, FORWARD_DNS_V4, LOCAL_V4, LOCAL_DNS_V4] {
            assert!(mem.has_chain(chain.table, chain.name), "{chain} missing");
        }
        assert_eq!(
            mem.rules(Table::Mangle, PREROUTING),
            vec![RuleSpec::jump("TPFW_V4")]
        );
        assert_eq!(
            mem.rules(Table::Mangle, OUTPUT),
            vec![RuleSpec::jump("TPFW_LOCAL_V4")]
        );
        assert!(mem.rules(Table::Nat, PREROUTING).contains(&RuleSpec::jump("TPFW_DNS_V4")));
        assert!(mem.rules(Table::Nat, OUTPUT).contains(&RuleSpec::jump("TPFW_DNS_LOCAL_V4")));
        assert!(orch.status().unwrap().is_applied());
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let mem = MemoryRuleTable::new();
        let orch = orchestrator(&mem, true);
        orch.apply().unwrap();
        let once = mem.snapshot();

        orch.apply().unwrap();
        assert_eq!(mem.snapshot(), once);
    }

    #[test]
    fn test_clean_on_clean_host() {
        let mem = MemoryRuleTable::new();
        let pristine = mem.snapshot();
        let orch = orchestrator(&mem, false);

        orch.clean().unwrap();
        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), pristine);
        assert!(orch.status().unwrap().is_clean());
    }

    #[test]
    fn test_apply_clean_round_trip() {
        let mem = MemoryRuleTable::new();
        let pristine = mem.snapshot();
        let orch = orchestrator(&mem, true);

        orch.apply().unwrap();
        assert_ne!(mem.snapshot(), pristine);
        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), pristine);
    }

    #[test]
    fn test_round_trip_leaves_foreign_rules_alone() {
        let mem = MemoryRuleTable::new();
        let docker = RuleSpec::new().args(["-m", "addrtype", "--dst-type", "LOCAL", "-j", "DOCKER"]);
        mem.seed_chain(Table::Nat, "DOCKER", vec![]);
        mem.seed_chain(Table::Nat, PREROUTING, vec![docker.clone()]);
        let before = mem.snapshot();

        let orch = orchestrator(&mem, false);
        orch.apply().unwrap();
        assert_eq!(mem.rules(Table::Nat, PREROUTING)[0], docker);
        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), before);
    }

    #[test]
    fn test_reserved_returns_precede_tproxy() {
        let mem = MemoryRuleTable::new();
        orchestrator(&mem, false).apply().unwrap();

        let rules = mem.rules(Table::Mangle, "TPFW_V4");
        let first_tproxy = rules
            .iter()
            .position(|r| r.target() == Some("TPROXY"))
            .unwrap();
        let last_reserved = rules
            .iter()
            .rposition(|r| r.value_of("-d").is_some() && r.target() == Some("RETURN"))
            .unwrap();
        assert!(last_reserved < first_tproxy);
        assert_eq!(count_target(&rules, "TPROXY"), 2);
    }

    #[test]
    fn test_owner_exemptions_precede_interception() {
        let mem = MemoryRuleTable::new();
        orchestrator(&mem, true).apply().unwrap();

        let rules = mem.rules(Table::Nat, "TPFW_DNS_LOCAL_V4");
        let first_redirect = rules
            .iter()
            .position(|r| r.target() == Some("REDIRECT"))
            .unwrap();
        for owner in ["--uid-owner", "--gid-owner"] {
            let pos = rules.iter().position(|r| r.value_of(owner).is_some()).unwrap();
            assert!(pos < first_redirect, "{owner} after REDIRECT");
        }

        // The local mangle chain is exemptions only, closed by the DNS RETURN
        let local = mem.rules(Table::Mangle, "TPFW_LOCAL_V4");
        assert!(local.iter().all(|r| r.target() == Some("RETURN")));
        assert_eq!(local.last(), Some(&rules::dns_exemption()));
    }

    #[test]
    fn test_resolve_group_absent() {
        let mem = MemoryRuleTable::new();
        orchestrator(&mem, false).apply().unwrap();

        let referencing = mem
            .snapshot()
            .values()
            .flatten()
            .filter(|r| r.value_of("--gid-owner") == Some(SYSTEMD_RESOLVE_GROUP))
            .count();
        assert_eq!(referencing, 0);
    }

    #[test]
    fn test_resolve_group_present() {
        let mem = MemoryRuleTable::new();
        orchestrator(&mem, true).apply().unwrap();

        for (table, chain) in [(Table::Mangle, "TPFW_LOCAL_V4"), (Table::Nat, "TPFW_DNS_LOCAL_V4")] {
            let rules = mem.rules(table, chain);
            let count = rules
                .iter()
                .filter(|r| {
                    r.value_of("--gid-owner") == Some(SYSTEMD_RESOLVE_GROUP)
                        && r.target() == Some("RETURN")
                })
                .count();
            assert_eq!(count, 1, "{table}/{chain}");
        }
        assert!(
            mem.rules(Table::Mangle, "TPFW_V4")
                .iter()
                .all(|r| r.value_of("--gid-owner").is_none())
        );
    }

    #[test]
    fn test_two_hijack_targets_two_redirects_each() {
        let mem = MemoryRuleTable::new();
        orchestrator(&mem, false).apply().unwrap();

        for chain in ["TPFW_DNS_V4", "TPFW_DNS_LOCAL_V4"] {
            let redirects: Vec<_> = mem
                .rules(Table::Nat, chain)
                .into_iter()
                .filter(|r| r.target() == Some("REDIRECT"))
                .collect();
            assert_eq!(redirects.len(), 2, "{chain}");
            assert!(redirects.iter().all(|r| r.value_of("--to-ports") == Some("1053")));
        }
    }

    #[test]
    fn test_icmp_dnat_lifecycle() {
        let mem = MemoryRuleTable::new();
        let orch = orchestrator(&mem, false);

        orch.apply().unwrap();
        assert_eq!(icmp_dnat_count(&mem, PREROUTING), 1);
        assert_eq!(icmp_dnat_count(&mem, OUTPUT), 1);
        let rule = &mem.rules(Table::Nat, OUTPUT)[0];
        assert_eq!(rule.value_of("-d"), Some("198.18.0.0/16"));
        assert_eq!(rule.value_of("--to-destination"), Some("127.0.0.1"));

        orch.clean().unwrap();
        assert_eq!(icmp_dnat_count(&mem, PREROUTING), 0);
        assert_eq!(icmp_dnat_count(&mem, OUTPUT), 0);
    }

    #[test]
    fn test_hooks_installed_after_population() {
        let mem = MemoryRuleTable::new();
        let steps = orchestrator(&mem, false).plan_apply();

        let first_hook = steps
            .iter()
            .position(|s| s.to_string().contains("-j TPFW_"))
            .unwrap();
        assert_eq!(steps.len() - first_hook, 4);
        let hooks: Vec<_> = steps[first_hook..]
            .iter()
            .flat_map(crate::core::plan::Step::commands)
            .collect();
        assert_eq!(
            hooks,
            [
                "iptables -t mangle -A PREROUTING -j TPFW_V4",
                "iptables -t nat -A PREROUTING -j TPFW_DNS_V4",
                "iptables -t mangle -A OUTPUT -j TPFW_LOCAL_V4",
                "iptables -t nat -A OUTPUT -j TPFW_DNS_LOCAL_V4",
            ]
        );
    }

    #[test]
    fn test_clean_runs_in_reverse_composition() {
        let mem = MemoryRuleTable::new();
        let commands: Vec<String> = orchestrator(&mem, false)
            .plan_clean()
            .iter()
            .flat_map(crate::core::plan::Step::commands)
            .filter(|c| c.contains(" -X "))
            .collect();
        assert_eq!(
            commands,
            [
                "iptables -t nat -X TPFW_DNS_LOCAL_V4",
                "iptables -t mangle -X TPFW_LOCAL_V4",
                "iptables -t nat -X TPFW_DNS_V4",
                "iptables -t mangle -X TPFW_V4",
            ]
        );
    }

    #[test]
    fn test_failed_apply_then_clean_restores_pristine() {
        let mem = MemoryRuleTable::new();
        let pristine = mem.snapshot();
        mem.fail_on(OpKind::CreateChain, Table::Mangle, "TPFW_LOCAL_V4", "boom");

        let orch = orchestrator(&mem, true);
        let err = orch.apply().unwrap_err();
        assert!(matches!(err, Error::ChainCreation { table: Table::Mangle, ref chain, .. } if chain == "TPFW_LOCAL_V4"));

        // Forward chains were populated but never hooked
        assert!(mem.has_chain(Table::Mangle, "TPFW_V4"));
        assert!(mem.rules(Table::Mangle, PREROUTING).is_empty());

        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), pristine);
    }

    #[test]
    fn test_failed_nat_output_append_then_clean_restores_pristine() {
        let mem = MemoryRuleTable::new();
        let pristine = mem.snapshot();
        mem.fail_on(OpKind::Append, Table::Nat, OUTPUT, "iptables: Resource temporarily unavailable.");

        let orch = orchestrator(&mem, false);
        let err = orch.apply().unwrap_err();
        assert!(matches!(err, Error::RuleMutation { .. }));
        assert_eq!(err.diagnostic(), Some("iptables: Resource temporarily unavailable."));

        mem.clear_faults();
        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), pristine);
    }

    #[test]
    fn test_status_after_failed_hook_is_partial() {
        let mem = MemoryRuleTable::new();
        let pristine = mem.snapshot();
        mem.fail_on(OpKind::Append, Table::Mangle, OUTPUT, "boom");

        let orch = orchestrator(&mem, false);
        let err = orch.apply().unwrap_err();
        assert!(matches!(err, Error::RuleMutation { table: Table::Mangle, ref chain, .. } if chain == OUTPUT));
        assert!(mem.rules(Table::Mangle, OUTPUT).is_empty());

        let status = orch.status().unwrap();
        assert!(!status.is_applied());
        assert!(!status.is_clean());
        let hooked: Vec<_> = status.chains.iter().map(|c| (c.exists, c.hooked)).collect();
        assert_eq!(hooked, [(true, true), (true, true), (true, false), (true, false)]);

        mem.clear_faults();
        orch.clean().unwrap();
        assert_eq!(mem.snapshot(), pristine);
    }

    #[test]
    fn test_status_hook_query_error_names_hook_chain() {
        let mem = MemoryRuleTable::new();
        mem.fail_on(OpKind::RuleExists, Table::Nat, PREROUTING, "lock held");

        let err = orchestrator(&mem, false).status().unwrap_err();
        match &err {
            Error::ChainQuery { table, chain, .. } => {
                assert_eq!(*table, Table::Nat);
                assert_eq!(chain, PREROUTING);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_clean_deletion_error_names_own_chain() {
        let mem = MemoryRuleTable::new();
        let orch = orchestrator(&mem, false);
        orch.apply().unwrap();

        mem.fail_on(OpKind::ClearAndDelete, Table::Nat, "TPFW_DNS_LOCAL_V4", "iptables: Too many links.");
        let err = orch.clean().unwrap_err();
        match &err {
            Error::ChainDeletion { table, chain, .. } => {
                assert_eq!(*table, Table::Nat);
                assert_eq!(chain, "TPFW_DNS_LOCAL_V4");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("nat/TPFW_DNS_LOCAL_V4"));

        // The abort happened before the other chains were touched
        assert!(mem.has_chain(Table::Mangle, "TPFW_V4"));

        mem.clear_faults();
        orch.clean().unwrap();
        assert!(orch.status().unwrap().is_clean());
    }

    #[test]
    fn test_foreign_jump_blocks_clean() {
        let mem = MemoryRuleTable::new();
        let orch = orchestrator(&mem, false);
        orch.apply().unwrap();

        // Someone else jumps into our chain from FORWARD
        mem.seed_chain(Table::Mangle, "FORWARD", vec![RuleSpec::jump("TPFW_V4")]);
        let err = orch.clean().unwrap_err();
        assert!(matches!(err, Error::ChainDeletion { ref chain, .. } if chain == "TPFW_V4"));
    }

    #[test]
    fn test_query_error_aborts_clean() {
        let mem = MemoryRuleTable::new();
        mem.fail_on(OpKind::ChainExists, Table::Nat, "TPFW_DNS_V4", "lock held");
        let err = orchestrator(&mem, false).clean().unwrap_err();
        assert!(matches!(err, Error::ChainQuery { table: Table::Nat, .. }));
    }
}

#[cfg(test)]
mod property_tests {
    use crate::config::{AppConfig, HostConfig, ProxyConfig};
    use crate::core::chain::Table;
    use crate::core::memory::MemoryRuleTable;
    use crate::core::orchestrator::Orchestrator;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_target()(a in 1u8..=223, b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) -> String {
            format!("{a}.{b}.{c}.{d}")
        }
    }

    prop_compose! {
        fn arb_config()(
            tproxy_port in 1u16..=65535,
            dns_port in 1u16..=65535,
            hijack in proptest::collection::vec(arb_target(), 1..5),
            mark in any::<u32>(),
        ) -> (ProxyConfig, HostConfig) {
            let mut config = AppConfig::default();
            config.proxy.tproxy_port = tproxy_port;
            config.proxy.dns_port = dns_port;
            config.host.hijack_dns = hijack;
            config.host.tproxy_mark = format!("{mark:#x}");
            let config = config.validate().unwrap();
            (config.proxy, config.host)
        }
    }

    proptest! {
        #[test]
        fn test_apply_idempotent_and_reversible(
            (proxy, host) in arb_config(),
            resolve in any::<bool>(),
        ) {
            let mem = MemoryRuleTable::new();
            let pristine = mem.snapshot();
            let orch = Orchestrator::with_group_probe(&mem, proxy, host, move |_: &str| resolve);

            orch.apply().unwrap();
            let once = mem.snapshot();
            orch.apply().unwrap();
            prop_assert_eq!(&mem.snapshot(), &once);
            prop_assert!(orch.status().unwrap().is_applied());

            orch.clean().unwrap();
            prop_assert_eq!(&mem.snapshot(), &pristine);
            prop_assert!(orch.status().unwrap().is_clean());
        }

        #[test]
        fn test_duplicate_targets_dedup(
            (proxy, mut host) in arb_config(),
        ) {
            let unique: std::collections::BTreeSet<String> = host.hijack_dns.iter().cloned().collect();
            host.hijack_dns.extend(host.hijack_dns.clone());

            let mem = MemoryRuleTable::new();
            Orchestrator::with_group_probe(&mem, proxy, host, |_: &str| false).apply().unwrap();

            let redirects = mem
                .rules(Table::Nat, "TPFW_DNS_V4")
                .iter()
                .filter(|r| r.target() == Some("REDIRECT"))
                .count();
            prop_assert_eq!(redirects, unique.len());
        }
    }
}
