pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod websocket;

// Re-export main types for convenience
pub use auth::{StaticToken, TokenProvider};
pub use backoff::ReconnectPolicy;
pub use client::{ClientConfig, InterpretationClient};
pub use config::Config;
pub use error::{ClientError, TransportError};
pub use protocol::{
    ChartData, HouseCusp, InboundMessage, InterpretationRequest, InterpretationType,
    OutboundMessage, PlanetPosition, ProtocolError,
};
pub use state::{
    ClientEvent, ClientSnapshot, ConnectionState, ProcessingState, StateChange, StreamChunk,
};
pub use transport::{Connection, Connector, OutboundFrame, TransportEvent};
pub use websocket::WebSocketConnector;
