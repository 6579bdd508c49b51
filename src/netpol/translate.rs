use cidr::{Cidr as _, IpCidr};
use k8s_openapi::api::networking::v1::{IPBlock, NetworkPolicyPeer, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::debug;
use std::collections::BTreeSet as Set;

use super::entry::{
    self, Chain, EntryBuilder, IptEntry, ALL_NAMESPACES, DPORT_FLAG, DST, DST_IP_FLAG, SRC,
    SRC_IP_FLAG,
};
use super::selector::{self, Op};
use super::{Error, Policy};

#[cfg(test)]
mod tests;

/// Deployment-dependent knobs. Kept explicit so translation stays a pure
/// function of its arguments.
#[derive(Clone, Debug)]
pub struct TranslateOptions {
    /// Accept peers combining a pod selector with a namespace selector.
    /// When disabled such peers are skipped without error, matching
    /// dataplanes that cannot express the intersection.
    pub selector_intersection: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            selector_intersection: true,
        }
    }
}

/// Result of translating one policy: the pod-set and namespace-list names it
/// references (unhashed) and the rules realising it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Translation {
    pub sets: Vec<String>,
    pub lists: Vec<String>,
    pub entries: Vec<IptEntry>,
}

impl Translation {
    pub fn merge(&mut self, other: Translation) {
        self.sets.extend(other.sets);
        self.lists.extend(other.lists);
        self.entries.extend(other.entries);
    }

    /// Drop duplicate set/list names, keeping first occurrences.
    pub fn dedup_names(&mut self) {
        self.sets = unique(std::mem::take(&mut self.sets));
        self.lists = unique(std::mem::take(&mut self.lists));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn port_chain(self) -> Chain {
        match self {
            Direction::Ingress => Chain::IngressPort,
            Direction::Egress => Chain::EgressPort,
        }
    }

    /// The chain holding peer-specific rules (From for ingress, To for egress).
    fn peer_chain(self) -> Chain {
        match self {
            Direction::Ingress => Chain::IngressFrom,
            Direction::Egress => Chain::EgressTo,
        }
    }

    /// set-match flow flag for the governed pods
    fn target_flag(self) -> &'static str {
        match self {
            Direction::Ingress => DST,
            Direction::Egress => SRC,
        }
    }

    /// set-match flow flag for the peer side
    fn peer_flag(self) -> &'static str {
        match self {
            Direction::Ingress => SRC,
            Direction::Egress => DST,
        }
    }

    fn peer_ip_flag(self) -> &'static str {
        match self {
            Direction::Ingress => SRC_IP_FLAG,
            Direction::Egress => DST_IP_FLAG,
        }
    }
}

/// One ingress or egress rule, with the nil/empty distinction preserved for
/// both lists.
struct DirRule<'a> {
    ports: Option<&'a [NetworkPolicyPort]>,
    peers: Option<&'a [NetworkPolicyPeer]>,
}

impl DirRule<'_> {
    fn ports(&self) -> &[NetworkPolicyPort] {
        self.ports.unwrap_or(&[])
    }

    fn peers(&self) -> &[NetworkPolicyPeer] {
        self.peers.unwrap_or(&[])
    }
}

/// The peer shapes the API allows, settled once per peer.
enum PeerKind<'a> {
    IpBlock(&'a IPBlock),
    PodOnly(&'a LabelSelector),
    NsOnly(&'a LabelSelector),
    PodAndNs {
        pod: &'a LabelSelector,
        ns: &'a LabelSelector,
    },
}

fn classify(peer: &NetworkPolicyPeer) -> Option<PeerKind<'_>> {
    if let Some(ref ip_block) = peer.ip_block {
        return Some(PeerKind::IpBlock(ip_block));
    }
    match (peer.pod_selector.as_ref(), peer.namespace_selector.as_ref()) {
        (None, None) => None,
        (Some(pod), None) => Some(PeerKind::PodOnly(pod)),
        (None, Some(ns)) => Some(PeerKind::NsOnly(ns)),
        (Some(pod), Some(ns)) => Some(PeerKind::PodAndNs { pod, ns }),
    }
}

fn validate_ip_block(block: &IPBlock) -> Result<(), Error> {
    if block.cidr.is_empty() {
        return Err(Error::InvalidCidr("empty CIDR".into()));
    }
    let cidr: IpCidr = block
        .cidr
        .parse()
        .map_err(|e| Error::InvalidCidr(format!("{}: {e}", block.cidr)))?;

    for except in block.except.iter().flatten() {
        let sub: IpCidr = except
            .parse()
            .map_err(|e| Error::InvalidCidr(format!("{except}: {e}")))?;
        let inside = sub.network_length() > cidr.network_length()
            && cidr.contains(&sub.first_address())
            && cidr.contains(&sub.last_address());
        if !inside {
            return Err(Error::InvalidCidr(format!(
                "except {except} not strictly inside {}",
                block.cidr
            )));
        }
    }
    Ok(())
}

/// Compile one direction of a policy into rule entries plus the set/list
/// names they reference. Ordering is load-bearing: IPBlock entries (the
/// except DROPs first, then their CIDR ALLOWs) land in a side buffer appended
/// after the selector rules, and the terminal jumps wiring
/// port chain -> peer chain -> target-sets come last.
fn compile_direction(
    ns: &str,
    target_selector: &LabelSelector,
    rules: &[DirRule],
    dir: Direction,
    opts: &TranslateOptions,
) -> Result<Translation, Error> {
    let mut sets = Vec::new();
    let mut lists = Vec::new();
    let mut entries = Vec::new();
    // IPBlock rules; appended after the main entries so except-DROPs stay in
    // the peer chain ahead of the ALLOWs admitting the surrounding CIDR
    let mut peer_entries = Vec::new();
    let mut added_peer_entry = false;
    let mut added_port_entry = false;

    debug!("compiling {dir:?} rules in namespace {ns}");

    let mut target_pairs = selector::parse_selector(target_selector)?;
    if selector::is_match_all(&target_pairs) {
        // empty target selector governs every pod in the policy's namespace
        target_pairs[0].1 = format!("ns-{ns}");
    }
    sets.extend(target_pairs.iter().map(|(_, label)| label.clone()));

    let target_spec = entry::fragment_from_pairs(ns, &target_pairs, dir.target_flag(), false);
    let target_comment = entry::comment_from_selector(ns, target_selector, false)?;

    for rule in rules {
        let ports = rule.ports();
        let port_rule_exists = !ports.is_empty();
        added_port_entry = added_port_entry || port_rule_exists;

        let mut allow_external = false;
        let mut peer_rule_exists = false;
        if let Some(peers) = rule.peers {
            if peers.is_empty() {
                // explicitly empty peer list: admit any peer, in-cluster or not
                peer_rule_exists = true;
                allow_external = true;
            }
            peer_rule_exists =
                peer_rule_exists || peers.iter().any(|peer| classify(peer).is_some());
        }

        if !port_rule_exists && !peer_rule_exists {
            let all_ns = entry::match_set(Op::Include, ALL_NAMESPACES, dir.peer_flag());
            let e = match dir {
                Direction::Ingress => EntryBuilder::new(dir.port_chain())
                    .matches(all_ns)
                    .matches(target_spec.clone())
                    .accept(format!(
                        "ALLOW-ALL-TO-{target_comment}-FROM-{ALL_NAMESPACES}"
                    )),
                Direction::Egress => EntryBuilder::new(dir.port_chain())
                    .matches(target_spec.clone())
                    .matches(all_ns)
                    .accept(format!(
                        "ALLOW-ALL-FROM-{target_comment}-TO-{ALL_NAMESPACES}"
                    )),
            };
            entries.push(e);
            lists.push(ALL_NAMESPACES.to_string());
            continue;
        }

        if port_rule_exists && !peer_rule_exists {
            for port in ports {
                let port_spec = entry::port_fragment(port, DPORT_FLAG)?;
                let port_comment = entry::comment_from_port(port)?;
                let comment = match dir {
                    Direction::Ingress => format!("ALLOW-ALL-{port_comment}-TO-{target_comment}"),
                    Direction::Egress => format!("ALLOW-ALL-TO-{port_comment}-FROM-{target_comment}"),
                };
                entries.push(
                    EntryBuilder::new(dir.port_chain())
                        .matches(port_spec)
                        .matches(target_spec.clone())
                        .accept(comment),
                );
            }
            continue;
        }

        for peer in rule.peers() {
            let Some(kind) = classify(peer) else {
                continue;
            };

            match kind {
                PeerKind::IpBlock(block) => {
                    validate_ip_block(block)?;

                    let excepts = block.except.as_deref().unwrap_or(&[]);
                    for except in excepts {
                        let e = match dir {
                            Direction::Ingress => EntryBuilder::new(dir.peer_chain())
                                .match_cidr(dir.peer_ip_flag(), except)
                                .matches(target_spec.clone())
                                .drop_packets(format!("DROP-{except}-TO-{target_comment}")),
                            Direction::Egress => EntryBuilder::new(dir.peer_chain())
                                .matches(target_spec.clone())
                                .match_cidr(dir.peer_ip_flag(), except)
                                .drop_packets(format!("DROP-{except}-FROM-{target_comment}")),
                        };
                        peer_entries.push(e);
                    }
                    if !excepts.is_empty() {
                        added_peer_entry = true;
                    }

                    if port_rule_exists {
                        for port in ports {
                            let port_spec = entry::port_fragment(port, DPORT_FLAG)?;
                            let port_comment = entry::comment_from_port(port)?;
                            let e = match dir {
                                Direction::Ingress => EntryBuilder::new(dir.port_chain())
                                    .matches(target_spec.clone())
                                    .match_cidr(dir.peer_ip_flag(), &block.cidr)
                                    .matches(port_spec)
                                    .accept(format!(
                                        "ALLOW-{}-:-{port_comment}-TO-{target_comment}",
                                        block.cidr
                                    )),
                                Direction::Egress => EntryBuilder::new(dir.port_chain())
                                    .matches(port_spec)
                                    .matches(target_spec.clone())
                                    .match_cidr(dir.peer_ip_flag(), &block.cidr)
                                    .accept(format!(
                                        "ALLOW-{}-:-{port_comment}-FROM-{target_comment}",
                                        block.cidr
                                    )),
                            };
                            peer_entries.push(e);
                        }
                    } else {
                        let e = match dir {
                            Direction::Ingress => EntryBuilder::new(dir.peer_chain())
                                .matches(target_spec.clone())
                                .match_cidr(dir.peer_ip_flag(), &block.cidr)
                                .accept(format!("ALLOW-{}-TO-{target_comment}", block.cidr)),
                            Direction::Egress => EntryBuilder::new(dir.peer_chain())
                                .match_cidr(dir.peer_ip_flag(), &block.cidr)
                                .matches(target_spec.clone())
                                .accept(format!("ALLOW-{}-FROM-{target_comment}", block.cidr)),
                        };
                        peer_entries.push(e);
                        added_peer_entry = true;
                    }
                }

                PeerKind::NsOnly(sel) => {
                    let pairs = selector::parse_selector(sel)?;
                    if selector::is_match_all(&pairs) {
                        lists.push(ALL_NAMESPACES.to_string());
                    } else {
                        // ns- prefix keeps namespace lists apart from pod sets
                        lists.extend(pairs.iter().map(|(_, label)| format!("ns-{label}")));
                    }

                    let ns_spec = entry::fragment_from_pairs(ns, &pairs, dir.peer_flag(), true);
                    let ns_comment = entry::comment_from_selector(ns, sel, true)?;

                    if port_rule_exists {
                        for port in ports {
                            let port_spec = entry::port_fragment(port, DPORT_FLAG)?;
                            let port_comment = entry::comment_from_port(port)?;
                            let e = match dir {
                                Direction::Ingress => EntryBuilder::new(dir.port_chain())
                                    .matches(target_spec.clone())
                                    .matches(ns_spec.clone())
                                    .matches(port_spec)
                                    .accept(format!(
                                        "ALLOW-{ns_comment}-AND-{port_comment}-TO-{target_comment}"
                                    )),
                                Direction::Egress => EntryBuilder::new(dir.port_chain())
                                    .matches(ns_spec.clone())
                                    .matches(port_spec)
                                    .matches(target_spec.clone())
                                    .accept(format!(
                                        "ALLOW-{ns_comment}-AND-{port_comment}-FROM-{target_comment}"
                                    )),
                            };
                            entries.push(e);
                        }
                    } else {
                        let e = match dir {
                            Direction::Ingress => EntryBuilder::new(dir.peer_chain())
                                .matches(ns_spec)
                                .matches(target_spec.clone())
                                .accept(format!("ALLOW-{ns_comment}-TO-{target_comment}")),
                            Direction::Egress => EntryBuilder::new(dir.peer_chain())
                                .matches(target_spec.clone())
                                .matches(ns_spec)
                                .accept(format!("ALLOW-{target_comment}-TO-{ns_comment}")),
                        };
                        entries.push(e);
                        added_peer_entry = true;
                    }
                }

                PeerKind::PodOnly(sel) => {
                    let pairs = selector::parse_selector(sel)?;
                    if selector::is_match_all(&pairs) {
                        sets.push(format!("ns-{ns}"));
                    } else {
                        sets.extend(pairs.iter().map(|(_, label)| label.clone()));
                    }

                    let pod_spec = entry::fragment_from_pairs(ns, &pairs, dir.peer_flag(), false);
                    let pod_comment = entry::comment_from_selector(ns, sel, false)?;

                    if port_rule_exists {
                        for port in ports {
                            let port_spec = entry::port_fragment(port, DPORT_FLAG)?;
                            let port_comment = entry::comment_from_port(port)?;
                            let e = match dir {
                                Direction::Ingress => EntryBuilder::new(dir.port_chain())
                                    .matches(target_spec.clone())
                                    .matches(pod_spec.clone())
                                    .matches(port_spec)
                                    .accept(format!(
                                        "ALLOW-{pod_comment}-AND-{port_comment}-TO-{target_comment}"
                                    )),
                                Direction::Egress => EntryBuilder::new(dir.port_chain())
                                    .matches(pod_spec.clone())
                                    .matches(port_spec)
                                    .matches(target_spec.clone())
                                    .accept(format!(
                                        "ALLOW-{pod_comment}-AND-{port_comment}-FROM-{target_comment}"
                                    )),
                            };
                            entries.push(e);
                        }
                    } else {
                        let e = match dir {
                            Direction::Ingress => EntryBuilder::new(dir.peer_chain())
                                .matches(pod_spec)
                                .matches(target_spec.clone())
                                .accept(format!("ALLOW-{pod_comment}-TO-{target_comment}")),
                            Direction::Egress => EntryBuilder::new(dir.peer_chain())
                                .matches(target_spec.clone())
                                .matches(pod_spec)
                                .accept(format!("ALLOW-{target_comment}-TO-{pod_comment}")),
                        };
                        entries.push(e);
                        added_peer_entry = true;
                    }
                }

                PeerKind::PodAndNs { pod, ns: ns_sel } => {
                    // matching pods of matching namespaces; skipped without
                    // error on dataplanes that cannot intersect selectors
                    if !opts.selector_intersection {
                        continue;
                    }

                    let ns_pairs = selector::parse_selector(ns_sel)?;
                    lists.extend(ns_pairs.iter().map(|(_, label)| format!("ns-{label}")));

                    let pod_pairs = selector::parse_selector(pod)?;
                    sets.extend(pod_pairs.iter().map(|(_, label)| label.clone()));

                    let ns_spec = entry::fragment_from_pairs(ns, &ns_pairs, dir.peer_flag(), true);
                    let pod_spec =
                        entry::fragment_from_pairs(ns, &pod_pairs, dir.peer_flag(), false);
                    let ns_comment = entry::comment_from_selector(ns, ns_sel, true)?;
                    let pod_comment = entry::comment_from_selector(ns, pod, false)?;

                    if port_rule_exists {
                        for port in ports {
                            let port_spec = entry::port_fragment(port, DPORT_FLAG)?;
                            let port_comment = entry::comment_from_port(port)?;
                            let e = match dir {
                                Direction::Ingress => EntryBuilder::new(dir.port_chain())
                                    .matches(ns_spec.clone())
                                    .matches(pod_spec.clone())
                                    .matches(target_spec.clone())
                                    .matches(port_spec)
                                    .accept(format!(
                                        "ALLOW-{ns_comment}-AND-{pod_comment}-AND-{port_comment}-TO-{target_comment}"
                                    )),
                                Direction::Egress => EntryBuilder::new(dir.port_chain())
                                    .matches(target_spec.clone())
                                    .matches(ns_spec.clone())
                                    .matches(pod_spec.clone())
                                    .matches(port_spec)
                                    .accept(format!(
                                        "ALLOW-{target_comment}-TO-{ns_comment}-AND-{pod_comment}-AND-{port_comment}"
                                    )),
                            };
                            entries.push(e);
                        }
                    } else {
                        let comment = match dir {
                            Direction::Ingress => {
                                format!("ALLOW-{ns_comment}-AND-{pod_comment}-TO-{target_comment}")
                            }
                            Direction::Egress => {
                                format!("ALLOW-{target_comment}-TO-{ns_comment}-AND-{pod_comment}")
                            }
                        };
                        entries.push(
                            EntryBuilder::new(dir.peer_chain())
                                .matches(target_spec.clone())
                                .matches(ns_spec)
                                .matches(pod_spec)
                                .accept(comment),
                        );
                        added_peer_entry = true;
                    }
                }
            }
        }

        if allow_external {
            let comment = match dir {
                Direction::Ingress => format!("ALLOW-ALL-TO-{target_comment}"),
                Direction::Egress => format!("ALLOW-ALL-FROM-{target_comment}"),
            };
            entries.push(
                EntryBuilder::new(dir.port_chain())
                    .matches(target_spec.clone())
                    .accept(comment),
            );
            if dir == Direction::Egress {
                // jump out of the port chain even though no port rule was seen
                added_port_entry = true;
            }
        }
    }

    entries.append(&mut peer_entries);

    let jump_comment = |chain: Chain| match dir {
        Direction::Ingress => format!("ALLOW-ALL-TO-{target_comment}-TO-JUMP-TO-{chain}"),
        Direction::Egress => format!("ALLOW-ALL-FROM-{target_comment}-TO-JUMP-TO-{chain}"),
    };

    if added_port_entry && !added_peer_entry {
        // port-only policy: whatever passed the port matches continues to
        // default-drop evaluation
        entries.push(
            EntryBuilder::new(dir.port_chain())
                .matches(target_spec.clone())
                .jump(Chain::TargetSets, jump_comment(Chain::TargetSets)),
        );
    } else if added_peer_entry {
        entries.push(
            EntryBuilder::new(dir.port_chain())
                .matches(target_spec.clone())
                .jump(dir.peer_chain(), jump_comment(dir.peer_chain())),
        );
        entries.push(
            EntryBuilder::new(dir.peer_chain())
                .matches(target_spec.clone())
                .jump(Chain::TargetSets, jump_comment(Chain::TargetSets)),
        );
    }

    Ok(Translation {
        sets: drop_empty(sets),
        lists: drop_empty(lists),
        entries,
    })
}

/// Default-drop rules on the target-sets chain for the active directions.
fn default_drop_entries(
    ns: &str,
    target_selector: &LabelSelector,
    has_ingress: bool,
    has_egress: bool,
) -> Result<Vec<IptEntry>, Error> {
    let mut target_pairs = selector::parse_selector(target_selector)?;
    if selector::is_match_all(&target_pairs) {
        target_pairs[0].1 = format!("ns-{ns}");
    }
    let target_comment = entry::comment_from_selector(ns, target_selector, false)?;

    let mut entries = Vec::new();
    if has_ingress {
        entries.push(
            EntryBuilder::new(Chain::TargetSets)
                .matches(entry::fragment_from_pairs(ns, &target_pairs, DST, false))
                .drop_packets(format!("DROP-ALL-TO-{target_comment}")),
        );
    }
    if has_egress {
        entries.push(
            EntryBuilder::new(Chain::TargetSets)
                .matches(entry::fragment_from_pairs(ns, &target_pairs, SRC, false))
                .drop_packets(format!("DROP-ALL-FROM-{target_comment}")),
        );
    }
    Ok(entries)
}

/// A single rule with neither ports nor peers admits all traffic for its
/// direction, so no default-drop should back it.
fn is_allow_all(rules_present: bool, rules: &[DirRule]) -> bool {
    rules_present
        && rules.len() == 1
        && rules[0].ports().is_empty()
        && rules[0].peers().is_empty()
}

/// Translate one NetworkPolicy into the ipset names it needs and the rules
/// realising it. Pure: equal inputs produce equal outputs, in the same
/// order. Validation failures abort the whole translation.
pub fn translate_policy(
    policy: &Policy,
    opts: &TranslateOptions,
) -> Result<Translation, Error> {
    let ns = policy.namespace.as_str();

    let ingress_rules: Vec<DirRule> = (policy.ingress.iter().flatten())
        .map(|rule| DirRule {
            ports: rule.ports.as_deref(),
            peers: rule.from.as_deref(),
        })
        .collect();
    let egress_rules: Vec<DirRule> = (policy.egress.iter().flatten())
        .map(|rule| DirRule {
            ports: rule.ports.as_deref(),
            peers: rule.to.as_deref(),
        })
        .collect();

    let mut result = Translation::default();
    let mut has_ingress = false;
    let mut has_egress = false;

    if policy.policy_types.is_empty() {
        let ingress =
            compile_direction(ns, &policy.pod_selector, &ingress_rules, Direction::Ingress, opts)?;
        let egress =
            compile_direction(ns, &policy.pod_selector, &egress_rules, Direction::Egress, opts)?;

        // long-standing behaviour, kept as-is: with no explicit policyTypes a
        // direction is considered active when its compilation referenced any
        // set (the target's sets always do)
        has_ingress = !ingress.sets.is_empty();
        has_egress = !egress.sets.is_empty();

        result.merge(ingress);
        result.merge(egress);
    } else {
        for ptype in &policy.policy_types {
            match ptype.as_str() {
                "Ingress" => {
                    result.merge(compile_direction(
                        ns,
                        &policy.pod_selector,
                        &ingress_rules,
                        Direction::Ingress,
                        opts,
                    )?);
                    has_ingress = !is_allow_all(policy.ingress.is_some(), &ingress_rules);
                }
                "Egress" => {
                    result.merge(compile_direction(
                        ns,
                        &policy.pod_selector,
                        &egress_rules,
                        Direction::Egress,
                        opts,
                    )?);
                    has_egress = !is_allow_all(policy.egress.is_some(), &egress_rules);
                }
                other => debug!("ignoring unknown policy type {other}"),
            }
        }
    }

    result.entries.extend(default_drop_entries(
        ns,
        &policy.pod_selector,
        has_ingress,
        has_egress,
    )?);
    result.dedup_names();

    Ok(result)
}

fn drop_empty(values: Vec<String>) -> Vec<String> {
    values.into_iter().filter(|v| !v.is_empty()).collect()
}

fn unique(values: Vec<String>) -> Vec<String> {
    let mut seen = Set::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}
