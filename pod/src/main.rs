//! Demo metric producer
//!
//! Registers with the host agent's registry, maps the shared segment it is
//! handed back, and writes a fresh counter sample into it once per second.
//! The NIC agent harvests the segment behind this process's back; when the
//! pod exits, the liveness watcher tears the session down.

use anyhow::{bail, Context, Result};
use fabric::shm::{SharedSegment, SEGMENT_NAME_LEN};
use log::info;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const PORT_FILE: &str = ".port";

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <host-address>", args[0]);
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1]) {
        eprintln!("pod failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(host: &str) -> Result<()> {
    let port: u16 = std::fs::read_to_string(PORT_FILE)
        .context("failed to read registry port file")?
        .trim()
        .parse()
        .context("invalid registry port")?;

    let name = register(host, port)?;
    info!("control plane assigned memory region {}", name);

    let segment = SharedSegment::open(&name)?;
    produce_metrics(&segment)
}

/// Send this process's id, get the segment name back.
fn register(host: &str, port: u16) -> Result<String> {
    let mut sock = TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to registry at {}:{}", host, port))?;

    let pid = std::process::id();
    sock.write_all(&pid.to_be_bytes())
        .context("failed to send pod id")?;

    let mut reply = [0u8; SEGMENT_NAME_LEN];
    sock.read_exact(&mut reply)
        .context("failed to read segment name")?;

    parse_segment_name(&reply)
}

fn parse_segment_name(reply: &[u8]) -> Result<String> {
    let name = reply.split(|b| *b == 0).next().unwrap_or(&[]);
    let name = std::str::from_utf8(name).context("segment name is not UTF-8")?;
    if name.is_empty() {
        bail!("registry returned an empty segment name");
    }
    Ok(name.to_string())
}

fn produce_metrics(segment: &SharedSegment) -> Result<()> {
    info!("producing metrics into {}", segment.name());

    loop {
        let value: u8 = rand::random();
        let sample = format!("{:x}", value);
        segment.write_bytes(sample.as_bytes())?;
        std::thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_name_is_nul_trimmed() {
        let mut reply = [0u8; SEGMENT_NAME_LEN];
        reply[..8].copy_from_slice(b"shm-4242");
        assert_eq!(parse_segment_name(&reply).unwrap(), "shm-4242");
    }

    #[test]
    fn empty_reply_is_rejected() {
        let reply = [0u8; SEGMENT_NAME_LEN];
        assert!(parse_segment_name(&reply).is_err());
    }
}
