/*!
 * IPC Server for Blueland Daemon
 * JSON protocol over Unix socket
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::coordinator::Handle;
use crate::device::{Address, Device};
use crate::error::BtError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    DiscoverDevices,
    PairConnDevice { address: String },
    DeviceState { address: String },
    DisconnectDevice { address: String },
    RemoveDevice { address: String },
    SendFile { address: String, path: PathBuf },
    Status,
}

/// Stage of `PairConnDevice` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pair,
    Trust,
    Connect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub devices: usize,
    pub subscribers: usize,
    pub discovering: bool,
    pub agent_registered: bool,
    pub pending_authentication: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Devices { devices: Vec<Device> },
    Device { device: Device },
    Success { message: String },
    Status { status: DaemonStatus },
    Error {
        error: BtError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        message: String,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }

    pub fn error(error: BtError) -> Self {
        Response::Error {
            message: error.to_string(),
            error,
            stage: None,
        }
    }

    pub fn stage_error(stage: Stage, error: BtError) -> Self {
        Response::Error {
            message: format!("{:?} failed: {}", stage, error),
            error,
            stage: Some(stage),
        }
    }
}

pub struct IpcServer {
    listener: UnixListener,
    handle: Handle,
}

impl IpcServer {
    pub fn new(listener: UnixListener, handle: Handle) -> Self {
        Self { listener, handle }
    }

    pub async fn run(self) {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let handle = self.handle.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handle).await {
                            tracing::debug!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: UnixStream, handle: Handle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request = line.trim();
        if !request.is_empty() {
            tracing::debug!("Received request: {}", request);

            let response = match serde_json::from_str::<Request>(request) {
                Ok(request) => handle.request(request).await,
                Err(e) => Response::error(BtError::InternalFailure(format!("malformed request: {e}"))),
            };

            let response_json = serde_json::to_string(&response)?;
            writer.write_all(response_json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        line.clear();
    }

    Ok(())
}

/// Sends one request to a running daemon and waits for its response.
pub async fn send_request(socket_path: &Path, request: &Request) -> Result<Response> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let request_json = serde_json::to_string(request)?;
    writer.write_all(request_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut response_str = String::new();
    BufReader::new(reader).read_line(&mut response_str).await?;
    let response: Response = serde_json::from_str(&response_str)?;

    Ok(response)
}
