use std::{net::SocketAddr, time::Duration};
use tokio::net::{TcpStream, UdpSocket};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Checks whether an upstream endpoint accepts connections.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: SocketAddr, udp: bool) -> bool;
}

/// Probes by connecting. A UDP "connect" only succeeds when the address is
/// routable.
#[derive(Clone, Debug)]
pub struct ConnectProber {
    timeout: Duration,
}

// === impl ConnectProber ===

impl Default for ConnectProber {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

#[async_trait::async_trait]
impl Prober for ConnectProber {
    async fn probe(&self, addr: SocketAddr, udp: bool) -> bool {
        let connect = async {
            if udp {
                let bind: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await
            } else {
                TcpStream::connect(addr).await.map(drop)
            }
        };
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::debug!(%addr, %error, "Probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(%addr, "Probe timed out");
                false
            }
        }
    }
}
