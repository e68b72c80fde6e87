//! UI-agnostic client state types
//!
//! These are shared between every front end (CLI, desktop shell, etc.) and
//! don't depend on any specific UI framework.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the connection to the interpretation backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single interpretation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Idle,
    Processing,
    Streaming,
    Complete,
    Error,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Idle => "idle",
            ProcessingState::Processing => "processing",
            ProcessingState::Streaming => "streaming",
            ProcessingState::Complete => "complete",
            ProcessingState::Error => "error",
        }
    }

    /// True once the server has finished with the request, successfully or not
    pub fn is_finished(&self) -> bool {
        matches!(self, ProcessingState::Complete | ProcessingState::Error)
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fragment of streamed interpretation text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    pub chunk_type: Option<String>,
}

/// The pair of states observers are notified about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub connection: ConnectionState,
    pub processing: ProcessingState,
}

/// Everything the client knows at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientSnapshot {
    pub connection: ConnectionState,
    pub processing: ProcessingState,
    pub session_id: Option<String>,
    pub interpretation: String,
    /// Message from the last server `error` frame
    pub error: Option<String>,
    /// Message describing the last transport failure
    pub connection_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl ClientSnapshot {
    pub fn state_change(&self) -> StateChange {
        StateChange {
            connection: self.connection,
            processing: self.processing,
        }
    }
}

/// Events published to channel subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ProcessingChanged {
        from: ProcessingState,
        to: ProcessingState,
    },
    SessionAssigned(String),
    Chunk(StreamChunk),
    ServerError(String),
    ConnectionError(String),
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    ReconnectExhausted,
}
