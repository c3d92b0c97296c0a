//! Shared-memory registry
//!
//! Local TCP service pods register with at startup. The wire format is
//! deliberately tiny: the pod sends its process id as 4 network-order
//! bytes, the registry creates a shared segment named after it and answers
//! with the name, NUL-padded to a fixed 256 bytes, then closes the socket.
//!
//! The ephemeral listen port is published to a well-known file so pods on
//! the same host can find the registry without configuration.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use fabric::shm::{self, SharedSegment, SEGMENT_NAME_LEN};
use log::{info, warn};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

/// Port-advertisement file, written to the working directory.
pub const PORT_FILE: &str = ".port";

/// A pod that completed registration; the segment is owned by whoever
/// consumes this (the RDMA session takes it over).
pub struct AdmittedPod {
    pub pid: u32,
    pub segment: SharedSegment,
}

/// Running registry; dropping it stops the accept loop.
pub struct Registry {
    port: u16,
    _runtime: Runtime,
}

impl Registry {
    /// Bind an ephemeral port, publish it to `port_file` and start
    /// accepting registrations. A bind or publish failure is fatal.
    pub fn start(block_size: usize, port_file: &Path) -> Result<(Self, Receiver<AdmittedPod>)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Failed to create Tokio runtime")?;

        let listener = runtime
            .block_on(TcpListener::bind(("0.0.0.0", 0)))
            .context("Failed to bind registry listener")?;
        let port = listener
            .local_addr()
            .context("Failed to get registry address")?
            .port();

        std::fs::write(port_file, port.to_string())
            .with_context(|| format!("failed to publish port to {}", port_file.display()))?;

        info!("📡 registry listening on port {}", port);

        let (tx, rx) = crossbeam_channel::unbounded();
        runtime.spawn(accept_loop(listener, block_size, tx));

        Ok((
            Self {
                port,
                _runtime: runtime,
            },
            rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn accept_loop(listener: TcpListener, block_size: usize, tx: Sender<AdmittedPod>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    // A failed registration aborts only this pod; the
                    // listener keeps accepting.
                    match admit(socket, block_size).await {
                        Ok(pod) => {
                            let _ = tx.send(pod);
                        }
                        Err(e) => warn!("registration from {} failed: {:#}", peer, e),
                    }
                });
            }
            Err(e) => warn!("Accept error: {}", e),
        }
    }
}

async fn admit(mut socket: TcpStream, block_size: usize) -> Result<AdmittedPod> {
    socket.set_nodelay(true)?;

    let mut pid_buf = [0u8; 4];
    socket
        .read_exact(&mut pid_buf)
        .await
        .context("failed to read pod id")?;
    let pid = u32::from_be_bytes(pid_buf);
    info!("** New pod with pid {} registered **", pid);

    let name = shm::segment_name(pid);
    let segment = SharedSegment::create(&name, block_size)?;
    info!("created memory region {} ({} bytes)", name, block_size);

    let mut reply = [0u8; SEGMENT_NAME_LEN];
    reply[..name.len()].copy_from_slice(name.as_bytes());
    socket
        .write_all(&reply)
        .await
        .context("failed to send segment name")?;
    socket.flush().await?;

    Ok(AdmittedPod { pid, segment })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn registration_round_trip() {
        let port_file =
            std::env::temp_dir().join(format!("microview_port_{}", std::process::id()));
        let (registry, admitted) = Registry::start(1024, &port_file).unwrap();

        // The published port matches the bound one.
        let published: u16 = std::fs::read_to_string(&port_file)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(published, registry.port());

        // A peer that connects and vanishes must not take the registry down.
        drop(TcpStream::connect(("127.0.0.1", registry.port())).unwrap());

        let pid: u32 = 3_900_000_000;
        let mut sock = TcpStream::connect(("127.0.0.1", registry.port())).unwrap();
        sock.write_all(&pid.to_be_bytes()).unwrap();

        let mut reply = [0u8; SEGMENT_NAME_LEN];
        sock.read_exact(&mut reply).unwrap();
        let name_bytes = reply.split(|b| *b == 0).next().unwrap();
        let name = std::str::from_utf8(name_bytes).unwrap();
        assert_eq!(name, format!("shm-{}", pid));
        assert!(reply[name.len()..].iter().all(|b| *b == 0));

        let pod = admitted.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pod.pid, pid);
        assert_eq!(pod.segment.len(), 1024);

        // The named object exists and has the advertised size.
        let reopened = SharedSegment::open(name).unwrap();
        assert_eq!(reopened.len(), 1024);

        pod.segment.unlink().unwrap();
        std::fs::remove_file(&port_file).unwrap();
    }
}
