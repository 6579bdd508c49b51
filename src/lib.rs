pub mod kube_watch;
pub mod memstore;
pub mod netpol;
pub mod state;

pub struct Context {
    pub namespace: Option<String>,
    pub kube: kube::Client,
}
