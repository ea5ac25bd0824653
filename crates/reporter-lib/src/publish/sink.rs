//! Remote collector transport

use crate::config::MasterConfig;
use crate::models::CachedRecord;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;

/// Destination for metric records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Send one record; any error means the remote is unreachable
    async fn deliver(&self, record: &CachedRecord) -> Result<()>;

    /// Check reachability without sending data
    async fn probe(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Delivers records as newline-delimited JSON, one connection per record
#[derive(Debug, Clone)]
pub struct NetworkSink {
    transport: Transport,
    family: Family,
    addr: String,
    timeout: Duration,
}

impl NetworkSink {
    /// `protocol` is one of `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`
    pub fn new(protocol: &str, addr: impl Into<String>, timeout: Duration) -> Result<Self> {
        let (transport, family) = match protocol.trim().to_ascii_lowercase().as_str() {
            "tcp" => (Transport::Tcp, Family::Any),
            "tcp4" => (Transport::Tcp, Family::V4),
            "tcp6" => (Transport::Tcp, Family::V6),
            "udp" => (Transport::Udp, Family::Any),
            "udp4" => (Transport::Udp, Family::V4),
            "udp6" => (Transport::Udp, Family::V6),
            other => bail!("Unsupported master protocol `{}`", other),
        };

        let addr = addr.into();
        if addr.trim().is_empty() {
            bail!("Master address must not be empty");
        }

        Ok(Self {
            transport,
            family,
            addr,
            timeout,
        })
    }

    pub fn from_config(config: &MasterConfig) -> Result<Self> {
        Self::new(&config.protocol, config.addr.clone(), config.send_timeout())
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let family = self.family;
        lookup_host(self.addr.as_str())
            .await
            .with_context(|| format!("Failed to resolve {}", self.addr))?
            .find(|a| match family {
                Family::Any => true,
                Family::V4 => a.is_ipv4(),
                Family::V6 => a.is_ipv6(),
            })
            .with_context(|| format!("No usable address for {}", self.addr))
    }

    async fn connect_tcp(&self) -> Result<TcpStream> {
        let target = self.resolve().await?;
        TcpStream::connect(target)
            .await
            .with_context(|| format!("Failed to connect to {}", target))
    }

    async fn connect_udp(&self) -> Result<UdpSocket> {
        let target = self.resolve().await?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await.context("Failed to bind UDP socket")?;
        socket
            .connect(target)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", target))?;
        Ok(socket)
    }

    async fn send_line(&self, line: &[u8]) -> Result<()> {
        match self.transport {
            Transport::Tcp => {
                let mut stream = self.connect_tcp().await?;
                stream.write_all(line).await.context("Failed to write record")?;
                stream.shutdown().await.context("Failed to close connection")?;
            }
            Transport::Udp => {
                let socket = self.connect_udp().await?;
                socket.send(line).await.context("Failed to send datagram")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for NetworkSink {
    async fn deliver(&self, record: &CachedRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to encode record")?;
        line.push(b'\n');

        timeout(self.timeout, self.send_line(&line))
            .await
            .with_context(|| format!("Delivery to {} timed out", self.addr))?
    }

    async fn probe(&self) -> Result<()> {
        let attempt = async {
            match self.transport {
                Transport::Tcp => self.connect_tcp().await.map(drop),
                Transport::Udp => self.connect_udp().await.map(drop),
            }
        };

        timeout(self.timeout, attempt)
            .await
            .with_context(|| format!("Probe of {} timed out", self.addr))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn record() -> CachedRecord {
        CachedRecord::new("c1", Utc::now(), json!({ "cpu_usage_percent": 12.5 }))
    }

    #[test]
    fn test_protocol_parsing() {
        let timeout = Duration::from_secs(1);
        assert_eq!(
            NetworkSink::new("TCP", "localhost:4000", timeout).unwrap().transport(),
            Transport::Tcp
        );
        assert_eq!(
            NetworkSink::new("udp6", "localhost:4000", timeout).unwrap().transport(),
            Transport::Udp
        );
        assert!(NetworkSink::new("sctp", "localhost:4000", timeout).is_err());
        assert!(NetworkSink::new("tcp", "", timeout).is_err());
    }

    #[tokio::test]
    async fn test_tcp_delivery_writes_one_json_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = NetworkSink::new("tcp4", addr.to_string(), Duration::from_secs(1)).unwrap();

        let sent = record();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = tokio::io::BufReader::new(socket).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        sink.deliver(&sent).await.unwrap();
        let line = server.await.unwrap();
        let received: CachedRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_udp_delivery() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        let sink = NetworkSink::new("udp", addr.to_string(), Duration::from_secs(1)).unwrap();

        sink.deliver(&record()).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(buf[n - 1], b'\n');
        let received: CachedRecord = serde_json::from_slice(&buf[..n - 1]).unwrap();
        assert_eq!(received.container_id, "c1");
    }

    #[tokio::test]
    async fn test_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = NetworkSink::new("tcp", addr.to_string(), Duration::from_secs(1)).unwrap();

        sink.probe().await.unwrap();

        drop(listener);
        assert!(sink.probe().await.is_err());
        assert!(sink.deliver(&record()).await.is_err());
    }
}
