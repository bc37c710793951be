//! Daemon client
//!
//! Used by the CLI (and any other ephemeral front end) to command the daemon
//! over the Unix socket. One request per call; `subscribe` converts the
//! connection into an event stream.

use camino::Utf8Path;
use serde_json::Value;
use tokio::net::UnixStream;

use crate::error::ProtocolError;
use crate::types::{AgentRecord, Checkpoint, Verdict};

use super::protocol::{read_frame, write_frame, Event, Request, ResolveArgs, Response, StartArgs};

/// Client connection to the daemon.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon socket.
    pub async fn connect(socket_path: &Utf8Path) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(socket_path.as_std_path())
            .await
            .map_err(|e| ProtocolError::Remote {
                message: format!("cannot connect to daemon at {socket_path}: {e} (is the daemon running?)"),
            })?;
        Ok(Self { stream })
    }

    /// Send one request and await its response value.
    pub async fn request(&mut self, request: Request) -> Result<Value, ProtocolError> {
        write_frame(&mut self.stream, &request).await?;
        let response: Response = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| ProtocolError::Remote {
                message: "daemon closed the connection".to_string(),
            })?;
        response.into_value()
    }

    pub async fn ping(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.request(Request::Ping).await.is_ok())
    }

    pub async fn list(&mut self) -> Result<Vec<AgentRecord>, ProtocolError> {
        let value = self.request(Request::List).await?;
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame {
            reason: format!("unexpected list payload: {e}"),
        })
    }

    pub async fn start(&mut self, args: StartArgs) -> Result<AgentRecord, ProtocolError> {
        let value = self.request(Request::Start(args)).await?;
        parse_record(value)
    }

    pub async fn status(&mut self, agent_id: u64) -> Result<AgentRecord, ProtocolError> {
        let value = self.request(Request::Status { agent_id }).await?;
        parse_record(value)
    }

    pub async fn stop(&mut self, agent_id: u64) -> Result<AgentRecord, ProtocolError> {
        let value = self.request(Request::Stop { agent_id }).await?;
        parse_record(value)
    }

    pub async fn remove(&mut self, agent_id: u64) -> Result<AgentRecord, ProtocolError> {
        let value = self.request(Request::Remove { agent_id }).await?;
        parse_record(value)
    }

    pub async fn resolve_checkpoint(
        &mut self,
        agent_id: u64,
        checkpoint_id: &str,
        verdict: Verdict,
        modifications: Option<Value>,
        human_notes: Option<String>,
    ) -> Result<Checkpoint, ProtocolError> {
        let value = self
            .request(Request::ResolveCheckpoint(ResolveArgs {
                agent_id,
                checkpoint_id: checkpoint_id.to_string(),
                verdict,
                modifications,
                human_notes,
            }))
            .await?;
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame {
            reason: format!("unexpected checkpoint payload: {e}"),
        })
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.request(Request::Shutdown).await.map(|_| ())
    }

    /// Switch this connection into a subscription. Returns the initial agent
    /// snapshot; subsequent events arrive via [`next_event`](Self::next_event).
    pub async fn subscribe(&mut self, agent_id: Option<u64>) -> Result<Vec<AgentRecord>, ProtocolError> {
        write_frame(&mut self.stream, &Request::Subscribe { agent_id }).await?;
        let response: Response = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| ProtocolError::Remote {
                message: "daemon closed the connection".to_string(),
            })?;
        let value = response.into_value()?;
        serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame {
            reason: format!("unexpected snapshot payload: {e}"),
        })
    }

    /// Next event on a subscribed connection; `None` when the daemon closes.
    pub async fn next_event(&mut self) -> Result<Option<Event>, ProtocolError> {
        read_frame(&mut self.stream).await
    }
}

fn parse_record(value: Value) -> Result<AgentRecord, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedFrame {
        reason: format!("unexpected agent record payload: {e}"),
    })
}
