use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::Write;
use std::net::Ipv4Addr;

use super::entry::{hashed_name, ALL_NAMESPACES};
use crate::state::State;

/// Desired ipset contents, keyed by raw (unhashed) set name: `pods` are
/// hash:ip sets of pod addresses, `namespaces` are list:set sets whose
/// members are per-namespace pod sets.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sets {
    pub pods: Map<String, Set<Ipv4Addr>>,
    pub namespaces: Map<String, Set<String>>,
}

/// Resolve every referenced set and list name against the cluster state.
/// Every known namespace gets its `ns-<name>` pod set and an entry in the
/// all-namespaces list, referenced or not, so peer rules never dangle.
pub fn materialize(state: &State, set_names: &[String], list_names: &[String]) -> Sets {
    let mut sets = Sets::default();

    for (name, _) in state.nses.iter() {
        sets.pods.entry(format!("ns-{name}")).or_default();
    }
    for name in set_names {
        sets.pods.entry(name.clone()).or_default();
    }

    for (key, pod) in state.pods.iter() {
        if pod.host_network {
            continue; // host-network pods share the node address, never theirs
        }
        for ip in &pod.ipsv4 {
            sets.pods
                .entry(format!("ns-{}", key.namespace))
                .or_default()
                .insert(*ip);
            for name in set_names {
                if label_match(name, &pod.labels) {
                    sets.pods.entry(name.clone()).or_default().insert(*ip);
                }
            }
        }
    }

    let all: Set<String> = state.nses.iter().map(|(name, _)| format!("ns-{name}")).collect();
    sets.namespaces.insert(ALL_NAMESPACES.to_string(), all);

    for list in list_names {
        if list == ALL_NAMESPACES {
            continue;
        }
        let members = sets.namespaces.entry(list.clone()).or_default();
        let Some(label) = list.strip_prefix("ns-") else {
            continue;
        };
        for (name, ns) in state.nses.iter() {
            if label_match(label, &ns.labels) {
                members.insert(format!("ns-{name}"));
            }
        }
    }

    sets
}

/// Does a canonical label (`key`, `key:value` or `key:v1,v2,...`) select
/// these object labels?
fn label_match(label: &str, labels: &Map<String, String>) -> bool {
    match label.split_once(':') {
        None => !label.is_empty() && labels.contains_key(label),
        Some((key, values)) => labels
            .get(key)
            .is_some_and(|value| values.split(',').any(|candidate| candidate == value)),
    }
}

/// Render an `ipset restore` script (to be run with -exist). Pod sets come
/// first so list members always exist by the time they are referenced.
pub fn restore_script(sets: &Sets) -> String {
    let mut out = String::new();
    macro_rules! w {
        ($($tt:tt)*) => {
            out.write_fmt(format_args!($($tt)*)).unwrap();
            out.push('\n');
        };
    }

    for (name, ips) in &sets.pods {
        let hashed = hashed_name(name);
        w!("create {hashed} hash:ip family inet");
        w!("flush {hashed}");
        for ip in ips {
            w!("add {hashed} {ip}");
        }
    }

    for (name, members) in &sets.namespaces {
        let hashed = hashed_name(name);
        w!("create {hashed} list:set");
        w!("flush {hashed}");
        for member in members {
            w!("add {hashed} {}", hashed_name(member));
        }
    }

    out
}
