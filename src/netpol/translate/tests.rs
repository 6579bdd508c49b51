use k8s_openapi::api::networking::v1 as networking;
use serde_json::json;

use crate::memstore::KeyValueFrom;

use super::*;

fn policy(value: serde_json::Value) -> Policy {
    let np: networking::NetworkPolicy = serde_json::from_value(value).unwrap();
    Policy::value_from(np).unwrap()
}

fn translate(value: serde_json::Value) -> Translation {
    translate_policy(&policy(value), &TranslateOptions::default()).unwrap()
}

fn set_match(set: &str, flag: &str) -> Vec<String> {
    vec![
        "-m".into(),
        "set".into(),
        "--match-set".into(),
        entry::hashed_name(set),
        flag.into(),
    ]
}

fn tail(target: &str, comment: &str) -> Vec<String> {
    vec![
        "-j".into(),
        target.into(),
        "-m".into(),
        "comment".into(),
        "--comment".into(),
        comment.into(),
    ]
}

fn on_chain(translation: &Translation, chain: Chain) -> Vec<&IptEntry> {
    (translation.entries.iter())
        .filter(|e| e.chain == chain)
        .collect()
}

#[test]
fn test_translation_is_pure() {
    let np = json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "ingress": [
                {
                    "ports": [{"protocol": "TCP", "port": 80}],
                    "from": [
                        {"ipBlock": {"cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"]}},
                        {"namespaceSelector": {"matchLabels": {"env": "prod"}}},
                    ],
                },
            ],
            "egress": [
                {"to": [{"podSelector": {"matchLabels": {"app": "db"}}}]},
            ],
        }
    });

    assert_eq!(translate(np.clone()), translate(np));
}

#[test]
fn test_empty_policy() {
    let t = translate(json!({
        "metadata": {"name": "deny-all", "namespace": "default"},
        "spec": {"podSelector": {}}
    }));

    assert_eq!(t.sets, vec!["ns-default".to_string()]);
    assert_eq!(t.lists, Vec::<String>::new());

    // nothing is allowed; only the two default drops remain
    assert_eq!(
        t.entries,
        vec![
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("ns-default", "dst"),
                    tail("DROP", "DROP-ALL-TO-ns-default"),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("ns-default", "src"),
                    tail("DROP", "DROP-ALL-FROM-ns-default"),
                ]
                .concat(),
            },
        ]
    );
}

#[test]
fn test_ingress_from_namespace() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [
                {"from": [{"namespaceSelector": {"matchLabels": {"env": "prod"}}}]},
            ],
        }
    }));

    assert_eq!(t.sets, vec!["app:web".to_string()]);
    assert_eq!(t.lists, vec!["ns-env:prod".to_string()]);

    assert_eq!(
        t.entries,
        vec![
            IptEntry {
                chain: Chain::IngressFrom,
                specs: [
                    set_match("ns-env:prod", "src"),
                    set_match("app:web", "dst"),
                    tail("ACCEPT", "ALLOW-ns-env:prod-TO-app:web"),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::IngressPort,
                specs: [
                    set_match("app:web", "dst"),
                    tail(
                        "AZURE-NPM-INGRESS-FROM",
                        "ALLOW-ALL-TO-app:web-TO-JUMP-TO-AZURE-NPM-INGRESS-FROM",
                    ),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::IngressFrom,
                specs: [
                    set_match("app:web", "dst"),
                    tail(
                        "AZURE-NPM-TARGET-SETS",
                        "ALLOW-ALL-TO-app:web-TO-JUMP-TO-AZURE-NPM-TARGET-SETS",
                    ),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("app:web", "dst"),
                    tail("DROP", "DROP-ALL-TO-app:web"),
                ]
                .concat(),
            },
        ]
    );
}

#[test]
fn test_ipblock_except_drops_come_first() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [
                {"from": [{"ipBlock": {"cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"]}}]},
            ],
        }
    }));

    let from = on_chain(&t, Chain::IngressFrom);
    assert_eq!(
        from[0].specs,
        [
            vec!["-s".to_string(), "10.1.0.0/16".into()],
            set_match("app:web", "dst"),
            tail("DROP", "DROP-10.1.0.0/16-TO-app:web"),
        ]
        .concat()
    );
    assert_eq!(
        from[1].specs,
        [
            set_match("app:web", "dst"),
            vec!["-s".to_string(), "10.0.0.0/8".into()],
            tail("ACCEPT", "ALLOW-10.0.0.0/8-TO-app:web"),
        ]
        .concat()
    );
}

#[test]
fn test_ports_only() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [{"ports": [{"protocol": "TCP", "port": 80}]}],
        }
    }));

    assert_eq!(
        t.entries,
        vec![
            IptEntry {
                chain: Chain::IngressPort,
                specs: [
                    vec!["-p".to_string(), "TCP".into(), "--dport".into(), "80".into()],
                    set_match("app:web", "dst"),
                    tail("ACCEPT", "ALLOW-ALL-TCP-PORT-80-TO-app:web"),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::IngressPort,
                specs: [
                    set_match("app:web", "dst"),
                    tail(
                        "AZURE-NPM-TARGET-SETS",
                        "ALLOW-ALL-TO-app:web-TO-JUMP-TO-AZURE-NPM-TARGET-SETS",
                    ),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("app:web", "dst"),
                    tail("DROP", "DROP-ALL-TO-app:web"),
                ]
                .concat(),
            },
        ]
    );
}

#[test]
fn test_egress_allow_external() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "egress": [{"to": []}],
        }
    }));

    // explicitly empty `to`: any peer is admitted, even outside the cluster
    assert_eq!(
        t.entries,
        vec![
            IptEntry {
                chain: Chain::EgressPort,
                specs: [
                    set_match("app:web", "src"),
                    tail("ACCEPT", "ALLOW-ALL-FROM-app:web"),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::EgressPort,
                specs: [
                    set_match("app:web", "src"),
                    tail(
                        "AZURE-NPM-TARGET-SETS",
                        "ALLOW-ALL-FROM-app:web-TO-JUMP-TO-AZURE-NPM-TARGET-SETS",
                    ),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("app:web", "dst"),
                    tail("DROP", "DROP-ALL-TO-app:web"),
                ]
                .concat(),
            },
            IptEntry {
                chain: Chain::TargetSets,
                specs: [
                    set_match("app:web", "src"),
                    tail("DROP", "DROP-ALL-FROM-app:web"),
                ]
                .concat(),
            },
        ]
    );
}

#[test]
fn test_egress_to_namespace() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Egress"],
            "egress": [
                {"to": [{"namespaceSelector": {"matchLabels": {"env": "prod"}}}]},
            ],
        }
    }));

    assert_eq!(
        t.entries[0],
        IptEntry {
            chain: Chain::EgressTo,
            specs: [
                set_match("app:web", "src"),
                set_match("ns-env:prod", "dst"),
                tail("ACCEPT", "ALLOW-app:web-TO-ns-env:prod"),
            ]
            .concat(),
        }
    );
    assert_eq!(
        t.entries[1],
        IptEntry {
            chain: Chain::EgressPort,
            specs: [
                set_match("app:web", "src"),
                tail(
                    "AZURE-NPM-EGRESS-TO",
                    "ALLOW-ALL-FROM-app:web-TO-JUMP-TO-AZURE-NPM-EGRESS-TO",
                ),
            ]
            .concat(),
        }
    );
    assert_eq!(t.entries[3].specs.last().unwrap(), "DROP-ALL-FROM-app:web");
}

#[test]
fn test_selector_intersection() {
    let np = json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [
                {"from": [{
                    "podSelector": {"matchLabels": {"app": "a"}},
                    "namespaceSelector": {"matchLabels": {"env": "prod"}},
                }]},
            ],
        }
    });

    let t = translate(np.clone());
    assert!(t.sets.contains(&"app:a".to_string()));
    assert_eq!(t.lists, vec!["ns-env:prod".to_string()]);

    let allows: Vec<_> = (t.entries.iter())
        .filter(|e| e.specs.contains(&"ACCEPT".to_string()))
        .collect();
    assert_eq!(allows.len(), 1);
    assert_eq!(
        allows[0].specs,
        [
            set_match("app:web", "dst"),
            set_match("ns-env:prod", "src"),
            set_match("app:a", "src"),
            tail("ACCEPT", "ALLOW-ns-env:prod-AND-app:a-TO-app:web"),
        ]
        .concat()
    );

    // without intersection support the peer is skipped, not rejected
    let t = translate_policy(
        &policy(np),
        &TranslateOptions {
            selector_intersection: false,
        },
    )
    .unwrap();
    assert_eq!(t.lists, Vec::<String>::new());
    assert_eq!(
        t.entries,
        vec![IptEntry {
            chain: Chain::TargetSets,
            specs: [
                set_match("app:web", "dst"),
                tail("DROP", "DROP-ALL-TO-app:web"),
            ]
            .concat(),
        }]
    );
}

#[test]
fn test_unset_policy_types_enable_both_directions() {
    // no policyTypes: both directions get compiled, and both count as active
    // because each referenced the target's sets
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "ingress": [{"ports": [{"protocol": "TCP", "port": 443}]}],
        }
    }));

    let drops: Vec<_> = on_chain(&t, Chain::TargetSets);
    assert_eq!(drops.len(), 2);
    assert_eq!(drops[0].specs.last().unwrap(), "DROP-ALL-TO-app:web");
    assert_eq!(drops[1].specs.last().unwrap(), "DROP-ALL-FROM-app:web");
}

#[test]
fn test_single_empty_rule_allows_all_without_default_drop() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [{}],
        }
    }));

    assert_eq!(t.lists, vec![ALL_NAMESPACES.to_string()]);
    assert_eq!(
        t.entries,
        vec![IptEntry {
            chain: Chain::IngressPort,
            specs: [
                set_match(ALL_NAMESPACES, "src"),
                set_match("app:web", "dst"),
                tail("ACCEPT", "ALLOW-ALL-TO-app:web-FROM-<ALL-NAMESPACES>"),
            ]
            .concat(),
        }]
    );
}

#[test]
fn test_explicit_types_without_rules_deny_all() {
    let t = translate(json!({
        "metadata": {"name": "default-deny", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress", "Egress"],
        }
    }));

    assert_eq!(t.entries.len(), 2);
    assert!(t.entries.iter().all(|e| e.chain == Chain::TargetSets));
    assert_eq!(t.entries[0].specs.last().unwrap(), "DROP-ALL-TO-app:web");
    assert_eq!(t.entries[1].specs.last().unwrap(), "DROP-ALL-FROM-app:web");
}

#[test]
fn test_sets_and_lists_are_deduplicated() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [
                {"from": [{"namespaceSelector": {"matchLabels": {"env": "prod"}}}]},
                {"from": [{"namespaceSelector": {"matchLabels": {"env": "prod"}}}]},
            ],
        }
    }));

    assert_eq!(t.sets, vec!["app:web".to_string()]);
    assert_eq!(t.lists, vec!["ns-env:prod".to_string()]);
    // entries are not deduplicated, both allows stay
    let allows = (t.entries.iter())
        .filter(|e| e.specs.contains(&"ACCEPT".to_string()))
        .count();
    assert_eq!(allows, 2);
}

#[test]
fn test_target_selector_with_negation() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {
                "matchLabels": {"app": "web"},
                "matchExpressions": [{"key": "env", "operator": "NotIn", "values": ["dev"]}],
            },
            "policyTypes": ["Ingress"],
        }
    }));

    assert_eq!(t.sets, vec!["app:web".to_string(), "env:dev".into()]);
    assert_eq!(
        t.entries,
        vec![IptEntry {
            chain: Chain::TargetSets,
            specs: [
                set_match("app:web", "dst"),
                vec![
                    "-m".to_string(),
                    "set".into(),
                    "!".into(),
                    "--match-set".into(),
                    entry::hashed_name("env:dev"),
                    "dst".into(),
                ],
                tail("DROP", "DROP-ALL-TO-app:web-AND-!env:dev"),
            ]
            .concat(),
        }]
    );
}

#[test]
fn test_entries_are_well_formed() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "testnamespace"},
        "spec": {
            "podSelector": {"matchExpressions": [{"key": "testIn", "operator": "In", "values": ["pod-A"]}]},
            "ingress": [
                {
                    "ports": [{"protocol": "UDP", "port": "dns"}],
                    "from": [
                        {"ipBlock": {"cidr": "10.0.0.0/8", "except": ["10.1.0.0/16", "10.2.0.0/16"]}},
                        {"podSelector": {"matchLabels": {"context": "dev"}}},
                        {
                            "podSelector": {"matchLabels": {"app": "a"}},
                            "namespaceSelector": {"matchLabels": {"env": "prod"}},
                        },
                    ],
                },
            ],
            "egress": [
                {"to": [{"namespaceSelector": {}}]},
            ],
        }
    }));

    assert!(!t.entries.is_empty());
    for e in &t.entries {
        assert!(e.specs.iter().all(|token| !token.is_empty()));
        assert_eq!(e.specs.iter().filter(|t| *t == "-j").count(), 1);

        // the comment trailer is last and its text has no whitespace
        let n = e.specs.len();
        assert_eq!(&e.specs[n - 4..n - 1], &["-m", "comment", "--comment"]);
        let comment = &e.specs[n - 1];
        assert!(!comment.is_empty());
        assert!(!comment.contains(char::is_whitespace));

        // the terminal comes right before the comment trailer
        assert_eq!(e.specs[n - 6], "-j");
    }
}

#[test]
fn test_named_port() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [{"ports": [{"port": "dns"}]}],
        }
    }));

    assert_eq!(
        t.entries[0].specs[..2],
        ["--dport".to_string(), "dns".into()]
    );
    assert_eq!(
        t.entries[0].specs.last().unwrap(),
        "ALLOW-ALL-PORT-dns-TO-app:web"
    );
}

#[test]
fn test_invalid_inputs_abort_translation() {
    let opts = TranslateOptions::default();

    let err = translate_policy(
        &policy(json!({
            "metadata": {"name": "np", "namespace": "default"},
            "spec": {
                "podSelector": {},
                "ingress": [{"from": [{"ipBlock": {"cidr": "10.0.0.0/33"}}]}],
            }
        })),
        &opts,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidCidr(_)));

    // except must be strictly inside the cidr
    let err = translate_policy(
        &policy(json!({
            "metadata": {"name": "np", "namespace": "default"},
            "spec": {
                "podSelector": {},
                "ingress": [{"from": [{"ipBlock": {"cidr": "10.0.0.0/16", "except": ["10.1.0.0/16"]}}]}],
            }
        })),
        &opts,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidCidr(_)));

    let err = translate_policy(
        &policy(json!({
            "metadata": {"name": "np", "namespace": "default"},
            "spec": {
                "podSelector": {},
                "ingress": [{"ports": [{"protocol": "ICMP"}]}],
            }
        })),
        &opts,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidPort(_)));

    let err = translate_policy(
        &policy(json!({
            "metadata": {"name": "np", "namespace": "default"},
            "spec": {
                "podSelector": {},
                "egress": [{"to": [{"podSelector": {
                    "matchExpressions": [{"key": "app", "operator": "In", "values": []}],
                }}]}],
            }
        })),
        &opts,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidSelector(_)));
}

#[test]
fn test_multiple_ports_expand_per_peer() {
    let t = translate(json!({
        "metadata": {"name": "np", "namespace": "default"},
        "spec": {
            "podSelector": {"matchLabels": {"app": "web"}},
            "policyTypes": ["Ingress"],
            "ingress": [
                {
                    "ports": [{"protocol": "TCP", "port": 80}, {"protocol": "TCP", "port": 443}],
                    "from": [{"podSelector": {"matchLabels": {"app": "lb"}}}],
                },
            ],
        }
    }));

    let port_allows: Vec<_> = on_chain(&t, Chain::IngressPort)
        .into_iter()
        .filter(|e| e.specs.contains(&"ACCEPT".to_string()))
        .collect();
    assert_eq!(port_allows.len(), 2);
    assert_eq!(
        port_allows[0].specs,
        [
            set_match("app:web", "dst"),
            set_match("app:lb", "src"),
            vec!["-p".to_string(), "TCP".into(), "--dport".into(), "80".into()],
            tail("ACCEPT", "ALLOW-app:lb-AND-TCP-PORT-80-TO-app:web"),
        ]
        .concat()
    );
}
