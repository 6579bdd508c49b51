use eyre::Result;

use knpm::netpol;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Namespace to watch instead of the whole cluster.
    pub namespace: Option<String>,

    /// Kubernetes API server URL
    pub cluster_url: Option<String>,

    /// Kubernetes watch events buffer size
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// NetworkPolicy enforcement through iptables and ipset.
    pub netpol: Option<netpol::iptables::Config>,
}
fn default_event_buffer() -> usize {
    100
}

impl Config {
    /// parse the cluster_url
    pub fn cluster_url(&self) -> Result<Option<http::Uri>> {
        match self.cluster_url {
            None => Ok(None),
            Some(ref v) => Ok(Some(v.parse()?)),
        }
    }
}
