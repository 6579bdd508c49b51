use eyre::{format_err, Result};
use itertools::Itertools;
use log::{debug, error};
use std::fmt::Write;
use std::sync::Arc;
use xxhash_rust::xxh3;

use super::entry::{Chain, IptEntry};
use super::ipset;
use super::translate::{self, TranslateOptions, Translation};
use crate::{kube_watch::EventReceiver, state::State};

/// Parent chain hooked into FORWARD; everything else hangs off it.
const PARENT_CHAIN: &str = "AZURE-NPM";

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Accept peers combining pod and namespace selectors (requires a
    /// cluster where every node runs a dataplane supporting it).
    #[serde(default = "default_selector_intersection")]
    selector_intersection: bool,
}
fn default_selector_intersection() -> bool {
    true
}

impl Config {
    fn options(&self) -> TranslateOptions {
        TranslateOptions {
            selector_intersection: self.selector_intersection,
        }
    }
}

pub async fn watch(
    _ctx: Arc<crate::Context>,
    cfg: Config,
    mut events: EventReceiver,
) -> Result<()> {
    let opts = cfg.options();

    ensure_forward_jump().await?;

    let mut prev = 0u128;
    let mut state = State::new();

    loop {
        let Some(updated) = state.ingest_events(&mut events).await else {
            return Ok(());
        };
        if !updated || !state.is_ready() {
            continue;
        }

        let mut total = Translation::default();
        for (key, netpol) in state.netpols.iter() {
            match translate::translate_policy(netpol, &opts) {
                Ok(translation) => total.merge(translation),
                Err(e) => error!("invalid network policy (ignored): {key}: {e}"),
            }
        }
        total.dedup_names();

        let desired = ipset::materialize(&state, &total.sets, &total.lists);
        let ipset_script = ipset::restore_script(&desired);
        let iptables_script = restore_script(&total.entries);

        let h = xxh3::xxh3_128(ipset_script.as_bytes())
            ^ xxh3::xxh3_128(iptables_script.as_bytes());
        if prev == h {
            continue;
        }

        debug!("applying ipset sets:\n{ipset_script}");
        if !pipe_to("ipset", &["-exist", "restore"], &ipset_script).await? {
            continue;
        }

        debug!("applying iptables rules:\n{iptables_script}");
        if !pipe_to("iptables-restore", &["--noflush", "-w"], &iptables_script).await? {
            continue;
        }

        prev = h;
    }
}

/// Render the filter-table rules for iptables-restore. Declaring our chains
/// makes --noflush replace their contents while leaving the rest of the
/// table alone.
fn restore_script(entries: &[IptEntry]) -> String {
    let mut out = String::new();
    macro_rules! w {
        ($($tt:tt)*) => {
            out.write_fmt(format_args!($($tt)*)).unwrap();
            out.push('\n');
        };
    }

    w!("*filter");
    w!(":{PARENT_CHAIN} - [0:0]");
    for chain in Chain::ALL {
        w!(":{chain} - [0:0]");
    }
    for chain in [Chain::IngressPort, Chain::EgressPort, Chain::TargetSets] {
        w!("-A {PARENT_CHAIN} -j {chain}");
    }
    for entry in entries {
        w!("-A {} {}", entry.chain, entry.specs.iter().join(" "));
    }
    w!("COMMIT");

    out
}

async fn ensure_forward_jump() -> Result<()> {
    // the chain must exist before FORWARD can reference it
    iptables(&["-N", PARENT_CHAIN]).await?;

    if iptables(&["-C", "FORWARD", "-j", PARENT_CHAIN]).await? {
        return Ok(());
    }
    if !iptables(&["-I", "FORWARD", "-j", PARENT_CHAIN]).await? {
        return Err(format_err!("failed to hook {PARENT_CHAIN} into FORWARD"));
    }
    Ok(())
}

async fn iptables(args: &[&str]) -> Result<bool> {
    let status = tokio::process::Command::new("iptables")
        .arg("-w")
        .args(args)
        .status()
        .await?;
    Ok(status.success())
}

async fn pipe_to(program: &str, args: &[&str], input: &str) -> Result<bool> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .spawn()?;

    let mut input_rd = std::io::Cursor::new(input.as_bytes());
    let stdin = child.stdin.as_mut().expect("stdin must exist");
    tokio::io::copy(&mut input_rd, stdin).await?;

    let status = child.wait().await?;
    if !status.success() {
        error!("{program} failed");
        for (i, line) in input.lines().enumerate() {
            eprintln!("  {:3}: {line}", i + 1);
        }
        return Ok(false);
    }
    Ok(true)
}
