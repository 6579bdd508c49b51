use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use std::collections::BTreeMap as Map;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{kube_watch, memstore, netpol::Policy};

pub mod keys;


pub struct State {
    pub netpols: memstore::Map<networking::NetworkPolicy, Policy>,
    pub pods: memstore::Map<core::Pod, Pod>,
    pub nses: memstore::Map<core::Namespace, Namespace>,
}

impl State {
    pub fn new() -> Self {
        Self {
            netpols: memstore::Map::new(),
            pods: memstore::Map::new(),
            nses: memstore::Map::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.netpols.is_ready() && self.pods.is_ready() && self.nses.is_ready()
    }

    pub fn ingest(&mut self, event: kube_watch::Event) -> bool {
        use kube_watch::Event::*;
        match event {
            NetworkPolicy(e) => self.netpols.ingest(*e),
            Pod(e) => self.pods.ingest(*e),
            Namespace(e) => self.nses.ingest(*e),
        }
    }

    /// Wait for the next event, then drain whatever else is already queued.
    /// `None` means the sender side is gone.
    pub async fn ingest_events(
        &mut self,
        rx: &mut crate::kube_watch::EventReceiver,
    ) -> Option<bool> {
        let mut updated = self.ingest(rx.recv().await?);

        while let Ok(e) = rx.try_recv() {
            updated |= self.ingest(e);
        }

        Some(updated)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pod {
    pub labels: Map<String, String>,
    pub ipsv4: Vec<Ipv4Addr>,
    pub ipsv6: Vec<Ipv6Addr>,
    pub host_network: bool,
}

impl memstore::KeyValueFrom<core::Pod> for Pod {
    type Key = keys::Object;

    fn key_from(v: &core::Pod) -> Option<Self::Key> {
        keys::Object::try_from(&v.metadata).ok()
    }

    fn value_from(v: core::Pod) -> Option<Self> {
        let spec = v.spec?;
        let status = v.status.unwrap_or_default();

        let mut ipsv4 = Vec::new();
        let mut ipsv6 = Vec::new();
        for pod_ip in status.pod_ips.unwrap_or_default() {
            match pod_ip.ip.parse() {
                Ok(IpAddr::V4(ip)) => ipsv4.push(ip),
                Ok(IpAddr::V6(ip)) => ipsv6.push(ip),
                Err(_) => {} // tolerated, the apiserver should not send those
            }
        }

        Some(Self {
            labels: v.metadata.labels.unwrap_or_default(),
            ipsv4,
            ipsv6,
            host_network: spec.host_network.unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Namespace {
    pub labels: Map<String, String>,
}

impl memstore::KeyValueFrom<core::Namespace> for Namespace {
    type Key = String;

    fn key_from(v: &core::Namespace) -> Option<Self::Key> {
        v.metadata.name.clone()
    }

    fn value_from(v: core::Namespace) -> Option<Self> {
        Some(Self {
            labels: v.metadata.labels.unwrap_or_default(),
        })
    }
}
