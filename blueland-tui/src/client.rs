/*!
 * Blueland Daemon Client
 * JSON IPC communication with bluelandd
 */

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::app::Update;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    DiscoverDevices,
    PairConnDevice { address: String },
    DisconnectDevice { address: String },
    RemoveDevice { address: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Error, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum DaemonError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("no such device")]
    NotFound,
    #[error("already done")]
    AlreadyExists,
    #[error("another pairing is in progress")]
    Busy,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("rejected")]
    Rejected,
    #[error("timed out")]
    Timeout,
    #[error("bluetooth service unavailable")]
    StackUnavailable,
    #[error("{0}")]
    InternalFailure(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub discovered: bool,
    pub paired: bool,
    pub trusted: bool,
    pub connected: bool,
    pub rssi: Option<i16>,
    #[serde(default)]
    pub uuids: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub pending_authentication: bool,
}

impl Device {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DaemonStatus {
    pub devices: usize,
    pub subscribers: usize,
    pub discovering: bool,
    pub agent_registered: bool,
    #[serde(default)]
    pub pending_authentication: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Devices { devices: Vec<Device> },
    Device { device: Device },
    Success { message: String },
    Status { status: DaemonStatus },
    Error {
        error: DaemonError,
        stage: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum DeviceEvent {
    Changed { device: Device },
    Removed { address: String },
}

#[derive(Debug, Clone)]
pub struct BluelandClient {
    socket_path: PathBuf,
}

impl BluelandClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connecting to {}", self.socket_path.display()))?;
        let (reader, mut writer) = stream.into_split();

        let request_json = serde_json::to_string(request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut response_str = String::new();
        BufReader::new(reader).read_line(&mut response_str).await?;
        let response: Response = serde_json::from_str(&response_str)
            .with_context(|| format!("unexpected reply: {}", response_str.trim()))?;

        Ok(response)
    }
}

/// Follows the daemon's event socket, forwarding every record until the
/// daemon closes it or the app stops listening.
pub async fn follow_events(events_path: PathBuf, updates: mpsc::UnboundedSender<Update>) {
    let reason = match read_events(&events_path, &updates).await {
        Ok(()) => "event stream closed".to_string(),
        Err(e) => format!("event stream lost: {e}"),
    };
    let _ = updates.send(Update::Disconnected(reason));
}

async fn read_events(events_path: &Path, updates: &mpsc::UnboundedSender<Update>) -> Result<()> {
    let stream = UnixStream::connect(events_path)
        .await
        .with_context(|| format!("connecting to {}", events_path.display()))?;
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let event: DeviceEvent = serde_json::from_str(&line)?;
        if updates.send(Update::Event(event)).is_err() {
            break;
        }
    }
    Ok(())
}

/// `$XDG_RUNTIME_DIR/blueland`, or `/run/user/<uid>/blueland` when unset.
pub fn runtime_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())));
    base.join("blueland")
}
