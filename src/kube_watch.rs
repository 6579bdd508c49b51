use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use kube::{api::Api, runtime::watcher, Client};
use log::{error, info};
use tokio::sync::mpsc;

// boxed everything to avoid large enum
#[derive(Debug)]
pub enum Event {
    NetworkPolicy(Box<watcher::Event<networking::NetworkPolicy>>),
    Namespace(Box<watcher::Event<core::Namespace>>),
    Pod(Box<watcher::Event<core::Pod>>),
}

pub type EventReceiver = mpsc::Receiver<Event>;

pub struct Config {
    pub namespace: Option<String>,
    pub client: Client,
    pub watcher_config: watcher::Config,
}

impl Config {
    fn namespaced_api<K>(&self) -> Api<K>
    where
        K: kube::api::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            None => Api::all(self.client.clone()),
            Some(ns) => Api::namespaced(self.client.clone(), ns.as_str()),
        }
    }

    pub fn watch_to(&self, tx: mpsc::Sender<Event>) {
        tokio::spawn(watch_to_events(
            self.namespaced_api(),
            self.watcher_config.clone(),
            tx.clone(),
            Event::NetworkPolicy,
        ));

        // peer selectors reach across namespaces, so pods and namespaces are
        // watched cluster-wide even when policies are namespace-scoped
        tokio::spawn(watch_to_events(
            Api::all(self.client.clone()),
            self.watcher_config.clone(),
            tx.clone(),
            Event::Namespace,
        ));

        tokio::spawn(watch_to_events(
            Api::all(self.client.clone()),
            self.watcher_config.clone(),
            tx.clone(),
            Event::Pod,
        ));
    }
}

async fn watch_to_events<K>(
    api: Api<K>,
    watcher_config: watcher::Config,
    tx: mpsc::Sender<Event>,
    map: fn(Box<watcher::Event<K>>) -> Event,
) where
    K: kube::api::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let resource = api.resource_url().to_string();
    info!("starting watch on {resource}");

    let mut watcher = watcher(api, watcher_config).boxed();

    loop {
        let event = match watcher.try_next().await {
            Ok(v) => v,
            Err(e) => {
                error!("watch error: {resource}: {e}");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(event) = event else {
            info!("watch on {resource} stopped");
            return;
        };

        if tx.send(map(Box::new(event))).await.is_err() {
            info!("receiver of {resource} stopped");
            return;
        }
    }
}
