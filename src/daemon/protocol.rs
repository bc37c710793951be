//! Client protocol wire types and framing
//!
//! Each message on the daemon socket is `<u32 length, big-endian><UTF-8 JSON
//! body>`. Requests carry `{op, args}`, responses `{ok, value | error}`. The
//! `subscribe` op switches the connection into a push stream of
//! `{event, agent_id, payload}` objects until disconnection.

use camino::Utf8PathBuf;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::types::{ModeFlags, Verdict};

/// Upper bound on a single frame. Checkpoint contexts are the largest
/// payloads and stay far below this.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Arguments for `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartArgs {
    pub project_dir: Utf8PathBuf,
    pub spec_file: Utf8PathBuf,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default)]
    pub mode_flags: ModeFlags,
}

fn default_target_branch() -> String {
    "main".to_string()
}

/// Arguments for `resolve_checkpoint`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveArgs {
    pub agent_id: u64,
    pub checkpoint_id: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifications: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_notes: Option<String>,
}

/// Client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    Ping,
    List,
    Start(StartArgs),
    Stop { agent_id: u64 },
    Status { agent_id: u64 },
    Remove { agent_id: u64 },
    Subscribe { agent_id: Option<u64> },
    ResolveCheckpoint(ResolveArgs),
    Shutdown,
}

/// Daemon response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(message.into()),
        }
    }

    /// Unwrap into the carried value or a remote error.
    pub fn into_value(self) -> Result<Value, ProtocolError> {
        if self.ok {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            Err(ProtocolError::Remote {
                message: self.error.unwrap_or_else(|| "unspecified daemon error".into()),
            })
        }
    }
}

/// One entry in a subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    pub agent_id: u64,
    pub payload: Value,
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| ProtocolError::MalformedFrame {
        reason: format!("serialization failed: {e}"),
    })?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. Returns `None` on clean EOF.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<Option<T>, ProtocolError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body).map_err(|e| ProtocolError::MalformedFrame {
        reason: e.to_string(),
    })?;
    Ok(Some(message))
}
