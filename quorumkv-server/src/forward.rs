//! Wire format for operations forwarded between nodes.
//!
//! One JSON object per line in each direction, one request per connection:
//!
//! ```text
//! -> {"type":"set","key":"k","value":"v"}
//! <- {"status":"ok"}
//! -> {"type":"join","addr":"10.0.0.2:7001"}
//! <- {"status":"error","message":"node is not the leader"}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use quorumkv_core::Command;

use crate::error::ForwardError;

/// An operation sent to the node believed to be leader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardRequest {
    Set { key: String, value: String },
    Delete { key: String },
    /// Add the node with this consensus address to the voter set.
    Join { addr: String },
}

impl From<Command> for ForwardRequest {
    fn from(command: Command) -> Self {
        match command {
            Command::Set { key, value } => ForwardRequest::Set { key, value },
            Command::Delete { key } => ForwardRequest::Delete { key },
        }
    }
}

/// Outcome of a forwarded operation. Error text is passed on unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ForwardResponse {
    Ok,
    Error { message: String },
}

impl ForwardResponse {
    pub fn error(message: impl Into<String>) -> Self {
        ForwardResponse::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ForwardResponse::Ok)
    }
}

/// Send one request to `addr` and wait for its response.
pub async fn send_forward(
    addr: &str,
    request: &ForwardRequest,
    timeout: Duration,
) -> Result<ForwardResponse, ForwardError> {
    tokio::time::timeout(timeout, round_trip(addr, request))
        .await
        .map_err(|_| ForwardError::Timeout(timeout))?
}

async fn round_trip(addr: &str, request: &ForwardRequest) -> Result<ForwardResponse, ForwardError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ForwardError::Connect {
            addr: addr.to_string(),
            source,
        })?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut json = serde_json::to_vec(request)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(ForwardError::ConnectionClosed);
    }
    Ok(serde_json::from_str(line.trim())?)
}
