use k8s_openapi::{
    api::networking::v1::NetworkPolicyPort,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    apimachinery::pkg::util::intstr::IntOrString,
};
use sha2::{Digest, Sha256};

use super::selector::{self, Op};
use super::Error;

// iptables argument vocabulary; every token below is passed verbatim
pub const PROTOCOL_FLAG: &str = "-p";
pub const DPORT_FLAG: &str = "--dport";
pub const SPORT_FLAG: &str = "--sport";
pub const SRC_IP_FLAG: &str = "-s";
pub const DST_IP_FLAG: &str = "-d";
pub const MODULE_FLAG: &str = "-m";
pub const SET_MODULE: &str = "set";
pub const MATCH_SET_FLAG: &str = "--match-set";
pub const COMMENT_MODULE: &str = "comment";
pub const COMMENT_FLAG: &str = "--comment";
pub const JUMP_FLAG: &str = "-j";
pub const ACCEPT: &str = "ACCEPT";
pub const DROP: &str = "DROP";
pub const SRC: &str = "src";
pub const DST: &str = "dst";

/// Synthetic list covering every namespace's pod set.
pub const ALL_NAMESPACES: &str = "<ALL-NAMESPACES>";

/// Prefix of every materialised ipset name.
pub const SET_NAME_PREFIX: &str = "azure-npm-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Chain {
    IngressPort,
    IngressFrom,
    EgressPort,
    EgressTo,
    TargetSets,
}

impl Chain {
    pub const ALL: [Chain; 5] = [
        Chain::IngressPort,
        Chain::IngressFrom,
        Chain::EgressPort,
        Chain::EgressTo,
        Chain::TargetSets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Chain::IngressPort => "AZURE-NPM-INGRESS-PORT",
            Chain::IngressFrom => "AZURE-NPM-INGRESS-FROM",
            Chain::EgressPort => "AZURE-NPM-EGRESS-PORT",
            Chain::EgressTo => "AZURE-NPM-EGRESS-TO",
            Chain::TargetSets => "AZURE-NPM-TARGET-SETS",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One rule: the chain it belongs to and the argument tokens handed verbatim
/// to iptables. Specs always hold the match predicates first, then a single
/// `-j` terminal, then the comment tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IptEntry {
    pub chain: Chain,
    pub specs: Vec<String>,
}

/// Builds an IptEntry; the finishing methods append the terminal and comment,
/// so a finished entry cannot have matches after its `-j`.
pub struct EntryBuilder {
    chain: Chain,
    specs: Vec<String>,
}

impl EntryBuilder {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            specs: Vec::new(),
        }
    }

    pub fn matches(mut self, fragment: impl IntoIterator<Item = String>) -> Self {
        self.specs.extend(fragment);
        self
    }

    pub fn match_cidr(mut self, flag: &str, cidr: &str) -> Self {
        self.specs.push(flag.into());
        self.specs.push(cidr.into());
        self
    }

    pub fn accept(self, comment: String) -> IptEntry {
        self.finish(ACCEPT, comment)
    }

    pub fn drop_packets(self, comment: String) -> IptEntry {
        self.finish(DROP, comment)
    }

    pub fn jump(self, chain: Chain, comment: String) -> IptEntry {
        self.finish(chain.name(), comment)
    }

    fn finish(mut self, target: &str, comment: String) -> IptEntry {
        self.specs.extend([
            JUMP_FLAG.into(),
            target.into(),
            MODULE_FLAG.into(),
            COMMENT_MODULE.into(),
            COMMENT_FLAG.into(),
            comment,
        ]);
        IptEntry {
            chain: self.chain,
            specs: self.specs,
        }
    }
}

/// Stable ipset name for a label. This is an interop contract with the set
/// manager: the prefix plus the first 64 bits of SHA-256 over the label
/// bytes, as 16 hex digits.
pub fn hashed_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("{SET_NAME_PREFIX}{:016x}", u64::from_be_bytes(prefix))
}

fn protocol(port: &NetworkPolicyPort) -> Result<Option<&str>, Error> {
    match port.protocol.as_deref() {
        None => Ok(None),
        Some(proto @ ("TCP" | "UDP" | "SCTP")) => Ok(Some(proto)),
        Some(proto) => Err(Error::InvalidPort(format!("unknown protocol {proto}"))),
    }
}

fn port_value(port: &NetworkPolicyPort) -> Result<Option<String>, Error> {
    match port.port.as_ref() {
        None => Ok(None),
        Some(IntOrString::Int(p)) => {
            if !(1..=65535).contains(p) {
                return Err(Error::InvalidPort(format!("port {p} out of range")));
            }
            Ok(Some(p.to_string()))
        }
        Some(IntOrString::String(name)) => {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Error::InvalidPort(format!("bad named port {name:?}")));
            }
            Ok(Some(name.clone()))
        }
    }
}

/// `[-p <proto>] [--sport|--dport <port>]`, omitting absent halves.
pub fn port_fragment(port: &NetworkPolicyPort, port_flag: &str) -> Result<Vec<String>, Error> {
    let mut spec = Vec::new();
    if let Some(proto) = protocol(port)? {
        spec.push(PROTOCOL_FLAG.into());
        spec.push(proto.into());
    }
    if let Some(value) = port_value(port)? {
        spec.push(port_flag.into());
        spec.push(value);
    }
    Ok(spec)
}

/// `<PROTO>-PORT-<port>`, `<PROTO>` or `PORT-<port>`.
pub fn comment_from_port(port: &NetworkPolicyPort) -> Result<String, Error> {
    let mut comment = String::new();
    if let Some(proto) = protocol(port)? {
        comment.push_str(proto);
        if port.port.is_some() {
            comment.push('-');
        }
    }
    if let Some(value) = port_value(port)? {
        comment.push_str("PORT-");
        comment.push_str(&value);
    }
    Ok(comment)
}

/// `-m set [!] --match-set <hashed> <src|dst>`
pub fn match_set(op: Op, set: &str, flag: &str) -> Vec<String> {
    let mut spec = vec![MODULE_FLAG.into(), SET_MODULE.into()];
    if op == Op::Exclude {
        spec.push("!".into());
    }
    spec.extend([MATCH_SET_FLAG.into(), hashed_name(set), flag.into()]);
    spec
}

/// Match fragment over pre-parsed selector pairs. The match-all sentinel
/// resolves to the scope set: the policy namespace's pod set, or the
/// all-namespaces list for namespace selectors.
pub fn fragment_from_pairs(
    ns: &str,
    pairs: &[(Op, String)],
    flag: &str,
    is_namespace: bool,
) -> Vec<String> {
    if selector::is_match_all(pairs) {
        let set = if is_namespace {
            ALL_NAMESPACES.to_string()
        } else {
            format!("ns-{ns}")
        };
        return match_set(Op::Include, &set, flag);
    }

    let mut spec = Vec::new();
    for (op, label) in pairs {
        let set = if is_namespace {
            format!("ns-{label}")
        } else {
            label.clone()
        };
        spec.extend(match_set(*op, &set, flag));
    }
    spec
}

/// Human-readable selector rendering used in `--comment` tokens: the pairs as
/// `[ns-][!]label` joined by `-AND-`, or the scope set name when empty.
pub fn comment_from_selector(
    ns: &str,
    selector: &LabelSelector,
    is_namespace: bool,
) -> Result<String, Error> {
    let pairs = selector::parse_selector(selector)?;
    if selector::is_match_all(&pairs) {
        return Ok(if is_namespace {
            ALL_NAMESPACES.into()
        } else {
            format!("ns-{ns}")
        });
    }

    let prefix = if is_namespace { "ns-" } else { "" };
    let rendered: Vec<_> = pairs
        .iter()
        .map(|(op, label)| format!("{prefix}{}{label}", op.token()))
        .collect();
    Ok(rendered.join("-AND-"))
}
