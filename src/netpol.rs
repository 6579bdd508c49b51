pub mod entry;
pub mod ipset;
pub mod iptables;
pub mod selector;
pub mod translate;

use crate::{memstore::KeyValueFrom, state::keys};

use k8s_openapi::{
    api::networking::v1::{
        NetworkPolicy, NetworkPolicyEgressRule as EgressRule,
        NetworkPolicyIngressRule as IngressRule,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};

/// A NetworkPolicy reduced to what rule generation needs. Absent and empty
/// rule lists are kept distinct: an empty `from`/`to` allows any peer while
/// an absent one does not.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub namespace: String,
    pub pod_selector: LabelSelector,
    pub policy_types: Vec<String>,
    pub ingress: Option<Vec<IngressRule>>,
    pub egress: Option<Vec<EgressRule>>,
}

impl KeyValueFrom<NetworkPolicy> for Policy {
    type Key = keys::Object;

    fn key_from(v: &NetworkPolicy) -> Option<Self::Key> {
        keys::Object::try_from(&v.metadata).ok()
    }

    fn value_from(v: NetworkPolicy) -> Option<Self> {
        let spec = v.spec?;
        Some(Self {
            namespace: v.metadata.namespace?,
            policy_types: spec.policy_types.unwrap_or_default(),
            pod_selector: spec.pod_selector,
            ingress: spec.ingress,
            egress: spec.egress,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    /// Never surfaced today: peers needing an unsupported dataplane feature
    /// are skipped during translation. Kept in the taxonomy for callers that
    /// match exhaustively.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
}
