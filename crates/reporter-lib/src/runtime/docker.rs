//! Docker Engine API client
//!
//! Speaks HTTP/1.1 over the daemon's unix socket or a TCP endpoint. Each
//! request uses its own connection so long-lived streams (events, stats)
//! never block short requests.

use super::{EventStream, RuntimeClient, StatsStream};
use crate::models::{ContainerSummary, RawStatSnapshot, RuntimeEvent};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::Response;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Socket used when neither the configuration nor `DOCKER_HOST` name one
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Port assumed for `tcp://` endpoints without one
const DEFAULT_TCP_PORT: u16 = 2375;

/// `filters={"type":["container"]}`, url-encoded
const CONTAINER_EVENTS_PATH: &str = "/events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D";

/// Items buffered between the body reader and the consumer
const STREAM_BUFFER: usize = 1;

/// Where the Docker daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl DockerEndpoint {
    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port`
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw).with_context(|| format!("Invalid docker host `{}`", raw))?;

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    bail!("Docker host `{}` has no socket path", raw);
                }
                Ok(DockerEndpoint::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" => {
                let host = url
                    .host_str()
                    .with_context(|| format!("Docker host `{}` has no host", raw))?
                    .to_string();
                let port = url.port().unwrap_or(if url.scheme() == "http" {
                    80
                } else {
                    DEFAULT_TCP_PORT
                });
                Ok(DockerEndpoint::Tcp { host, port })
            }
            other => bail!("Unsupported docker host scheme `{}`", other),
        }
    }

    /// Configured host, then `DOCKER_HOST`, then the local socket
    pub fn resolve(configured: Option<&str>) -> Result<Self> {
        let from_env = std::env::var("DOCKER_HOST").ok();
        match configured
            .filter(|h| !h.trim().is_empty())
            .or(from_env.as_deref().filter(|h| !h.trim().is_empty()))
        {
            Some(host) => Self::parse(host.trim()),
            None => Ok(DockerEndpoint::Unix(PathBuf::from(DEFAULT_DOCKER_SOCKET))),
        }
    }

    fn authority(&self) -> String {
        match self {
            DockerEndpoint::Unix(_) => "localhost".to_string(),
            DockerEndpoint::Tcp { host, port } => format!("{}:{}", host, port),
        }
    }
}

impl fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            DockerEndpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// Splits a byte stream into newline-terminated lines.
///
/// Chunk boundaries from the transport do not line up with JSON documents,
/// so partial lines are held until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed (blank lines dropped)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            if let Some(line) = trimmed(line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever remains once the stream ended without a final newline
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        trimmed(std::mem::take(&mut self.pending))
    }
}

fn trimmed(mut line: Vec<u8>) -> Option<Vec<u8>> {
    while matches!(line.last(), Some(b'\n' | b'\r' | b' ' | b'\t')) {
        line.pop();
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        None
    } else {
        Some(line)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
}

impl From<ListEntry> for ContainerSummary {
    fn from(entry: ListEntry) -> Self {
        let name = entry
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        ContainerSummary {
            id: entry.id,
            name,
            running: entry.state == "running",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectState,
}

impl From<InspectResponse> for ContainerSummary {
    fn from(inspect: InspectResponse) -> Self {
        ContainerSummary {
            id: inspect.id,
            name: inspect.name.trim_start_matches('/').to_string(),
            running: inspect.state.running,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventActor {
    #[serde(rename = "ID", default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
    // Pre-1.22 daemons only fill these
    #[serde(default)]
    status: String,
    #[serde(default)]
    id: String,
}

impl From<EventMessage> for RuntimeEvent {
    fn from(msg: EventMessage) -> Self {
        let action = if msg.action.is_empty() { msg.status } else { msg.action };
        let actor_id = if msg.actor.id.is_empty() { msg.id } else { msg.actor.id };
        RuntimeEvent::new(action, actor_id)
    }
}

fn decode_event(line: &[u8]) -> Result<RuntimeEvent> {
    let msg: EventMessage = serde_json::from_slice(line).context("Failed to decode event")?;
    Ok(msg.into())
}

fn decode_stats(line: &[u8]) -> Result<RawStatSnapshot> {
    serde_json::from_slice(line).context("Failed to decode stats snapshot")
}

/// Docker Engine API implementation of [`RuntimeClient`]
pub struct DockerClient {
    endpoint: DockerEndpoint,
}

impl DockerClient {
    pub fn new(endpoint: DockerEndpoint) -> Self {
        Self { endpoint }
    }

    async fn connect(&self) -> Result<SendRequest<Empty<Bytes>>> {
        match &self.endpoint {
            DockerEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("Failed to connect to {}", path.display()))?;
                handshake(stream).await
            }
            DockerEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
                handshake(stream).await
            }
        }
    }

    /// Issue a GET and fail on a non-success status
    async fn get(&self, path: &str) -> Result<Response<Incoming>> {
        let mut sender = self.connect().await?;

        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .header(http::header::HOST, self.endpoint.authority())
            .body(Empty::<Bytes>::new())
            .context("Failed to build request")?;

        let response = sender
            .send_request(request)
            .await
            .with_context(|| format!("Request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).trim().to_string())
                .unwrap_or_default();
            bail!("Docker API {} returned {}: {}", path, status, body);
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self
            .get(path)
            .await?
            .into_body()
            .collect()
            .await
            .with_context(|| format!("Failed to read response of {}", path))?
            .to_bytes();

        serde_json::from_slice(&body)
            .with_context(|| format!("Failed to decode response of {}", path))
    }

    /// Decode a newline-delimited JSON body on a background task.
    ///
    /// The task ends (and the connection closes) once the receiver is dropped.
    fn spawn_line_stream<T, F>(
        response: Response<Incoming>,
        decode: F,
        label: String,
    ) -> ReceiverStream<Result<T>>
    where
        T: Send + 'static,
        F: Fn(&[u8]) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut body = response.into_body();

        tokio::spawn(async move {
            let mut splitter = LineSplitter::new();

            while let Some(frame) = body.frame().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("Stream transport failed")))
                            .await;
                        return;
                    }
                };
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                for line in splitter.push(&data) {
                    if tx.send(decode(&line)).await.is_err() {
                        debug!(stream = %label, "Stream consumer gone, closing");
                        return;
                    }
                }
            }

            if let Some(line) = splitter.finish() {
                let _ = tx.send(decode(&line)).await;
            }
            debug!(stream = %label, "Stream ended");
        });

        ReceiverStream::new(rx)
    }
}

async fn handshake<S>(stream: S) -> Result<SendRequest<Empty<Bytes>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .context("HTTP handshake with docker daemon failed")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "Docker connection error");
        }
    });

    Ok(sender)
}

#[async_trait]
impl RuntimeClient for DockerClient {
    async fn ping(&self) -> Result<()> {
        self.get("/_ping")
            .await
            .with_context(|| format!("Docker daemon at {} is not reachable", self.endpoint))?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let entries: Vec<ListEntry> = self.get_json("/containers/json").await?;
        Ok(entries.into_iter().map(ContainerSummary::from).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSummary> {
        let inspect: InspectResponse = self.get_json(&format!("/containers/{}/json", id)).await?;
        Ok(inspect.into())
    }

    async fn stream_events(&self) -> Result<EventStream> {
        let response = self.get(CONTAINER_EVENTS_PATH).await?;
        Ok(Box::pin(Self::spawn_line_stream(
            response,
            decode_event,
            "events".to_string(),
        )))
    }

    async fn stream_stats(&self, id: &str) -> Result<StatsStream> {
        let response = self.get(&format!("/containers/{}/stats?stream=true", id)).await?;
        Ok(Box::pin(Self::spawn_line_stream(
            response,
            decode_stats,
            format!("stats:{}", id),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventAction;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            DockerEndpoint::parse("unix:///var/run/docker.sock").unwrap(),
            DockerEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            DockerEndpoint::parse("tcp://10.0.0.5:2376").unwrap(),
            DockerEndpoint::Tcp {
                host: "10.0.0.5".to_string(),
                port: 2376
            }
        );
        assert_eq!(
            DockerEndpoint::parse("tcp://docker").unwrap(),
            DockerEndpoint::Tcp {
                host: "docker".to_string(),
                port: DEFAULT_TCP_PORT
            }
        );
        assert!(DockerEndpoint::parse("npipe:////./pipe/docker_engine").is_err());
        assert!(DockerEndpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_configured_host_wins() {
        let endpoint = DockerEndpoint::resolve(Some("tcp://daemon:2375")).unwrap();
        assert_eq!(endpoint.to_string(), "tcp://daemon:2375");
    }

    #[test]
    fn test_line_splitter_joins_chunks() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(b"{\"a\":").is_empty());
        let lines = splitter.push(b"1}\n{\"b\":2}\r\n\n{\"c\"");
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);

        assert!(splitter.push(b":3}").is_empty());
        assert_eq!(splitter.finish(), Some(b"{\"c\":3}".to_vec()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_list_entry_conversion() {
        let json = r#"[{"Id":"abc123","Names":["/web"],"State":"running","Image":"nginx"}]"#;
        let entries: Vec<ListEntry> = serde_json::from_str(json).unwrap();
        let summary = ContainerSummary::from(entries.into_iter().next().unwrap());

        assert_eq!(summary.id, "abc123");
        assert_eq!(summary.name, "web");
        assert!(summary.running);
    }

    #[test]
    fn test_inspect_conversion() {
        let json = r#"{"Id":"abc123","Name":"/db","State":{"Running":false,"Status":"exited"}}"#;
        let inspect: InspectResponse = serde_json::from_str(json).unwrap();
        let summary = ContainerSummary::from(inspect);

        assert_eq!(summary.name, "db");
        assert!(!summary.running);
    }

    #[test]
    fn test_event_decoding() {
        let event = decode_event(
            br#"{"Type":"container","Action":"start","Actor":{"ID":"abc","Attributes":{}}}"#,
        )
        .unwrap();
        assert_eq!(event.action, EventAction::Start);
        assert_eq!(event.actor_id, "abc");

        let legacy = decode_event(br#"{"status":"stop","id":"def"}"#).unwrap();
        assert_eq!(legacy.action, EventAction::Stop);
        assert_eq!(legacy.actor_id, "def");

        assert!(decode_event(b"garbage").is_err());
    }

    #[test]
    fn test_stats_decoding() {
        let line = br#"{"id":"abc","cpu_stats":{"cpu_usage":{"total_usage":400},"system_cpu_usage":2000,"online_cpus":2},"memory_stats":{"usage":100,"limit":1000,"stats":{"inactive_file":10}}}"#;
        let snapshot = decode_stats(line).unwrap();

        assert_eq!(snapshot.cpu_stats.system_cpu_usage, 2000);
        assert_eq!(snapshot.memory_stats.stats["inactive_file"], 10);
        assert!(decode_stats(b"{\"cpu_stats\":").is_err());
    }
}
