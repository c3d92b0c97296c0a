//! MicroView host agent
//!
//! Runs on the server hosting pods. Admits pods over the local registry,
//! backs each one with a named shared-memory segment, exposes that segment
//! to the NIC agent as a remote-readable RDMA region, and watches pod
//! liveness to tear down sessions whose process has gone away.

mod control_plane;
mod registry;
mod session;
mod watcher;

use anyhow::{bail, Context, Result};
use control_plane::ControlPlane;
use crossbeam_channel::Receiver;
use log::{error, info};
use registry::Registry;
use session::HostConfig;
use std::path::Path;
use std::sync::Arc;

fn main() {
    env_logger::init();

    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{:#}", e);
            eprintln!("usage: host-agent <DPU-address> <DPU-port> <block-size> <num-blocks>");
            std::process::exit(1);
        }
    };

    let (sig_tx, sig_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = sig_tx.send(());
    })
    .expect("Error setting Ctrl+C handler");

    if let Err(e) = run(cfg, sig_rx) {
        error!("host agent failed: {:#}", e);
        std::process::exit(1);
    }
}

fn parse_args() -> Result<HostConfig> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        bail!("expected 4 arguments, got {}", args.len() - 1);
    }

    Ok(HostConfig {
        dpu_addr: args[1].clone(),
        dpu_port: args[2].parse().context("invalid DPU port")?,
        block_size: args[3].parse().context("invalid block size")?,
        num_blocks: args[4].parse().context("invalid number of blocks")?,
    })
}

fn run(cfg: HostConfig, sig_rx: Receiver<()>) -> Result<()> {
    info!(
        "🚀 MicroView host agent, DPU peer {}:{} (block size {}, {} blocks per pod)",
        cfg.dpu_addr, cfg.dpu_port, cfg.block_size, cfg.num_blocks
    );

    let cfg = Arc::new(cfg);
    let cp = Arc::new(ControlPlane::new());

    let (registry, admitted) = Registry::start(cfg.block_size, Path::new(registry::PORT_FILE))?;
    info!(
        "pods can register on 127.0.0.1:{} (advertised in {})",
        registry.port(),
        registry::PORT_FILE
    );
    let _watcher = watcher::spawn(Arc::clone(&cp));

    loop {
        crossbeam_channel::select! {
            recv(admitted) -> pod => {
                let pod = pod.context("registry channel closed")?;
                info!("Starting RDMA session for pod {}", pod.pid);
                // The session thread terminates on its own once the
                // connection unwinds.
                let _ = session::spawn(Arc::clone(&cfg), pod, Arc::clone(&cp))?;
            }
            recv(sig_rx) -> _ => {
                info!("Terminating agent");
                return Ok(());
            }
        }
    }
}
