use thiserror::Error;

/// Errors reported by the interpretation client.
///
/// Calls only return `NotConnected`, `EmptyQuery` and `ClientClosed`.
/// Transport and server failures arrive asynchronously through state changes
/// and events; front ends report them as `Transport` and `Server`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected to the interpretation service")]
    NotConnected,
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("connection error: {0}")]
    Transport(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("interpretation client has shut down")]
    ClientClosed,
}

/// Failure opening or driving a transport connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
}
