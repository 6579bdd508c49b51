use clap::Parser;
use eyre::format_err;
use kube::{runtime::watcher, Client};
use log::{error, info};
use std::process::exit;
use std::sync::Arc;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

use knpm::kube_watch;

pub mod config;

/// Kubernetes NetworkPolicy enforcement for iptables hosts
#[derive(Parser)]
#[command(version, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "KNPM_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "KNPM_LOG_STYLE")]
    log_style: String,

    /// Config file path.
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,
}

const ABOUT: &str = r#"
Kubernetes NetworkPolicy enforcement for iptables hosts

Watch the Kubernetes API server and keep the node's packet filter in sync:
- ipset sets for pod labels and namespaces
- iptables chains realising NetworkPolicy semantics
"#;

type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    use config::*;
    let config = tokio::fs::read(&cli.config)
        .await
        .map_err(|e| format_err!("read config failed: {}: {e}", cli.config))?;
    let config: Config =
        serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?;

    let cluster_url = config
        .cluster_url()
        .map_err(|e| format_err!("invalid cluster_url: {e}"))?;

    if cli.test_config {
        return Ok(());
    }

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        select! {
            _ = sigterm.recv() => println!("Received SIGTERM"),
            _ = sigint.recv() => println!("Received SIGINT"),
        };
        exit(0);
    });

    info!(
        "starting knpm {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT")
    );

    let mut kube_cfg = kube::Config::infer().await?;
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);

    let kube: Client = kube_cfg.try_into()?;

    match &config.namespace {
        None => info!("watching all namespaces"),
        Some(ns) => info!("watching namespace {ns}"),
    };

    let ctx = Arc::new(knpm::Context {
        namespace: config.namespace.clone(),
        kube,
    });

    let watch_config = kube_watch::Config {
        client: ctx.kube.clone(),
        watcher_config: watcher::Config::default(),
        namespace: ctx.namespace.clone(),
    };

    let (tx, rx) = mpsc::channel(config.event_buffer);
    watch_config.watch_to(tx);

    let Some(netpol_config) = config.netpol else {
        return Err(format_err!("no netpol configuration, nothing to do"));
    };

    let mut tasks = Tasks::new();
    {
        let ctx = ctx.clone();
        tasks.spawn(async move {
            (
                "netpol:iptables".to_string(),
                knpm::netpol::iptables::watch(ctx, netpol_config, rx).await,
            )
        });
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => {
                error!("task wait failed: {e}");
            }
            Ok((name, Ok(_))) => {
                info!("task {name} finished");
                continue;
            }
            Ok((name, Err(e))) => {
                error!("task {name} finished with error: {e}");
            }
        }
        exit(1);
    }

    error!("all tasks finished");
    exit(1); // this is actually unexpected
}
