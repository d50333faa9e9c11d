//! UDP receiver for parsed-packet datagrams.
//!
//! Each datagram carries one JSON flat field mapping. Decoded packets are
//! offered to every engine through the [`FanOut`]; undecodable datagrams
//! are counted and skipped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::fanout::FanOut;
use crate::metrics;
use crate::packet::parse_packet;

/// UDP receiver statistics
#[derive(Debug, Default)]
pub struct UdpStats {
    /// Total datagrams received
    pub received: AtomicU64,

    /// Datagrams decoded into packets
    pub parsed: AtomicU64,

    pub parse_errors: AtomicU64,

    pub bytes_received: AtomicU64,
}

impl UdpStats {
    pub fn snapshot(&self) -> UdpStatsSnapshot {
        UdpStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpStatsSnapshot {
    pub received: u64,
    pub parsed: u64,
    pub parse_errors: u64,
    pub bytes_received: u64,
}

/// UDP receiver configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub bind_addr: String,

    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,

    /// Socket receive buffer (SO_RCVBUF)
    pub socket_buffer_size: Option<usize>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: crate::defaults::UDP_BIND_ADDR.to_string(),
            recv_buffer_size: 65536,
            socket_buffer_size: Some(4 * 1024 * 1024),
        }
    }
}

/// UDP receiver
pub struct UdpReceiver {
    socket: UdpSocket,
    fanout: Arc<FanOut>,
    stats: Arc<UdpStats>,
    recv_buffer_size: usize,
}

impl UdpReceiver {
    /// Create and bind a new UDP receiver
    pub async fn bind(config: UdpConfig, fanout: Arc<FanOut>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr).await?;

        // Bursts from the capture side outpace a default-sized buffer
        #[cfg(unix)]
        if let Some(buf_size) = config.socket_buffer_size {
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            let size = buf_size as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                tracing::warn!(
                    size = buf_size,
                    error = %std::io::Error::last_os_error(),
                    "Failed to set SO_RCVBUF"
                );
            }
        }

        tracing::info!(addr = %config.bind_addr, "UDP receiver bound");

        Ok(Self {
            socket,
            fanout,
            stats: Arc::new(UdpStats::default()),
            recv_buffer_size: config.recv_buffer_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> Arc<UdpStats> {
        Arc::clone(&self.stats)
    }

    /// Run the receive loop until the task is cancelled
    pub async fn run(&self) {
        let mut buf = vec![0u8; self.recv_buffer_size];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);

                    self.process_datagram(&buf[..len], addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "UDP recv error");
                }
            }
        }
    }

    fn process_datagram(&self, data: &[u8], addr: SocketAddr) {
        match parse_packet(data) {
            Ok(packet) => {
                self.stats.parsed.fetch_add(1, Ordering::Relaxed);
                metrics::record_datagram("parsed");

                let result = self.fanout.publish(packet);
                tracing::trace!(addr = %addr, ?result, "Packet published");
            }
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_datagram("error");
                tracing::debug!(addr = %addr, error = %e, "Parse error");
            }
        }
    }
}
