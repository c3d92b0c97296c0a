//! MicroView NIC agent
//!
//! Runs on the SmartNIC/DPU. Accepts one RDMA connection per pod from the
//! host agent, learns each pod's remote region from its MR advertisement,
//! and harvests every live pod with a synchronized batch of one-sided READs
//! at each tick of the sampling clock.

mod scheduler;
mod session;

use anyhow::{bail, Context, Result};
use fabric::rdma::cm::{CmEventType, CmId, EventChannel};
use fabric::slots::SlotsExhausted;
use log::{error, info, warn};
use scheduler::Scheduler;
use session::{NicConfig, NicConnection};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 10;

fn main() {
    env_logger::init();

    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{:#}", e);
            eprintln!("usage: nic-agent <listen-port> <sampling-interval-sec> <block-size> <num-blocks>");
            std::process::exit(1);
        }
    };

    ctrlc::set_handler(|| {
        info!("CTRL+C detected, exiting...");
        std::process::exit(0);
    })
    .expect("Error setting Ctrl+C handler");

    if let Err(e) = run(cfg) {
        error!("nic-agent failed: {:#}", e);
        std::process::exit(1);
    }
}

fn parse_args() -> Result<NicConfig> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        bail!("expected 4 arguments, got {}", args.len() - 1);
    }

    let listen_port = args[1].parse().context("invalid listen port")?;
    let interval_sec: u64 = args[2].parse().context("invalid sampling interval")?;
    let block_size = args[3].parse().context("invalid block size")?;
    let num_blocks = args[4].parse().context("invalid number of blocks")?;

    Ok(NicConfig {
        listen_port,
        sampling_interval: Duration::from_secs(interval_sec),
        block_size,
        num_blocks,
    })
}

fn run(cfg: NicConfig) -> Result<()> {
    let shared = Arc::new(Scheduler::new(fabric::MAX_CONNECTIONS));
    let _ticker = Arc::clone(&shared).spawn_ticker(cfg.sampling_interval);

    let channel = EventChannel::new()?;
    let mut listener = CmId::create(&channel)?;
    let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), cfg.listen_port);
    listener.bind(&bind_addr)?;
    listener.listen(LISTEN_BACKLOG)?;
    info!("listening on port {}", cfg.listen_port);

    let mut conns: HashMap<usize, NicConnection> = HashMap::new();

    loop {
        let event = channel.get_event()?;
        match event.kind {
            CmEventType::ConnectRequest => {
                info!("received connection request");
                match NicConnection::build(&shared, event.id, &cfg) {
                    Ok(conn) => {
                        conns.insert(conn.logical_id(), conn);
                    }
                    // The per-index tables are statically sized; running out
                    // of slots is unrecoverable.
                    Err(e) if e.downcast_ref::<SlotsExhausted>().is_some() => return Err(e),
                    Err(e) => warn!("rejecting connection: {:#}", e),
                }
            }
            CmEventType::Established => info!("connection established"),
            CmEventType::Disconnected => session::teardown(&shared, &mut conns, event.id),
            other => bail!("unexpected CM event {:?} (status {})", other, event.status),
        }
    }
}
