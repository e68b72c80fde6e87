//! Wire format of the interpretation socket
//!
//! Every frame is a JSON text message of the shape `{"type": ..., "data": ...}`.
//! Outbound frames are plain serde enums. Inbound frames are decoded by hand
//! from a loose envelope so that unknown types can be logged and skipped
//! instead of failing the whole connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Fixed path of the interpretation endpoint on the backend origin
pub const INTERPRET_PATH: &str = "/api/v1/ai/interpret";

/// Close code sent on manual disconnect; suppresses reconnection
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the socket went away without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when the keepalive declares the connection dead
pub const KEEPALIVE_TIMEOUT: u16 = 4000;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for '{kind}': {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported backend scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid backend origin: {0}")]
    InvalidOrigin(#[from] url::ParseError),
}

/// Derive the socket URL from the configured backend origin.
///
/// `http` becomes `ws`, `https` becomes `wss`. Any path or query on the origin
/// is replaced by the interpretation endpoint.
pub fn interpret_url(origin: &Url) -> Result<Url, ProtocolError> {
    let scheme = match origin.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
    };

    let mut url = origin.clone();
    url.set_scheme(scheme)
        .map_err(|_| ProtocolError::UnsupportedScheme(origin.scheme().to_string()))?;
    url.set_path(INTERPRET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Which flavour of reading the backend should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationType {
    #[default]
    Natal,
    Transit,
    Synastry,
    Progression,
    SolarReturn,
    General,
}

impl InterpretationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpretationType::Natal => "natal",
            InterpretationType::Transit => "transit",
            InterpretationType::Synastry => "synastry",
            InterpretationType::Progression => "progression",
            InterpretationType::SolarReturn => "solar_return",
            InterpretationType::General => "general",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "natal" => Some(InterpretationType::Natal),
            "transit" => Some(InterpretationType::Transit),
            "synastry" => Some(InterpretationType::Synastry),
            "progression" => Some(InterpretationType::Progression),
            "solar_return" => Some(InterpretationType::SolarReturn),
            "general" => Some(InterpretationType::General),
            _ => None,
        }
    }

    pub fn all() -> Vec<InterpretationType> {
        vec![
            InterpretationType::Natal,
            InterpretationType::Transit,
            InterpretationType::Synastry,
            InterpretationType::Progression,
            InterpretationType::SolarReturn,
            InterpretationType::General,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanetPosition {
    pub name: String,
    /// Ecliptic longitude in degrees, 0..360
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house: Option<u8>,
    #[serde(default)]
    pub retrograde: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseCusp {
    pub house: u8,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
}

/// Chart payload forwarded verbatim to the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    #[serde(default)]
    pub planets: Vec<PlanetPosition>,
    #[serde(default)]
    pub houses: Vec<HouseCusp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ascendant: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midheaven: Option<f64>,
}

/// A user question plus the chart it is about
#[derive(Debug, Clone, PartialEq)]
pub struct InterpretationRequest {
    pub query: String,
    pub chart_data: ChartData,
    pub interpretation_type: InterpretationType,
}

impl InterpretationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            chart_data: ChartData::default(),
            interpretation_type: InterpretationType::default(),
        }
    }

    pub fn with_chart(mut self, chart_data: ChartData) -> Self {
        self.chart_data = chart_data;
        self
    }

    pub fn with_type(mut self, interpretation_type: InterpretationType) -> Self {
        self.interpretation_type = interpretation_type;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.query.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretPayload {
    pub chart_data: ChartData,
    pub interpretation_type: InterpretationType,
    pub user_token: Option<String>,
    pub query: String,
}

/// Serializes as `{}` so that `ping` carries an empty `data` object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    Interpret(InterpretPayload),
    Ping(Empty),
}

impl OutboundMessage {
    pub fn interpret(request: &InterpretationRequest, user_token: Option<String>) -> Self {
        OutboundMessage::Interpret(InterpretPayload {
            chart_data: request.chart_data.clone(),
            interpretation_type: request.interpretation_type,
            user_token,
            query: request.query.clone(),
        })
    }

    pub fn ping() -> Self {
        OutboundMessage::Ping(Empty {})
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Interpret(_) => "interpret",
            OutboundMessage::Ping(_) => "ping",
        }
    }

    pub fn to_json(&self) -> String {
        // A derived Serialize over strings, numbers and vecs cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Connected { session_id: String },
    ProcessingStart,
    StreamChunk { chunk: String, chunk_type: Option<String> },
    Complete,
    Error { error: String },
    Pong,
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ConnectedData {
    session_id: String,
}

#[derive(Deserialize)]
struct ChunkData {
    chunk: String,
    #[serde(default)]
    chunk_type: Option<String>,
}

#[derive(Deserialize)]
struct ErrorData {
    #[serde(default)]
    error: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
        kind: kind.to_string(),
        source,
    })
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let Envelope { kind, data } = envelope;

        let message = match kind.as_str() {
            "connected" => {
                let data: ConnectedData = payload(&kind, data)?;
                InboundMessage::Connected {
                    session_id: data.session_id,
                }
            }
            "processing_start" => InboundMessage::ProcessingStart,
            "stream_chunk" => {
                let data: ChunkData = payload(&kind, data)?;
                InboundMessage::StreamChunk {
                    chunk: data.chunk,
                    chunk_type: data.chunk_type,
                }
            }
            "complete" => InboundMessage::Complete,
            "error" => {
                // The backend occasionally sends `error` with no payload
                let error = if data.is_null() {
                    None
                } else {
                    payload::<ErrorData>(&kind, data)?.error
                };
                InboundMessage::Error {
                    error: error.unwrap_or_else(|| "Unknown error".to_string()),
                }
            }
            "pong" => InboundMessage::Pong,
            _ => InboundMessage::Unknown { kind },
        };

        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Connected { .. } => "connected",
            InboundMessage::ProcessingStart => "processing_start",
            InboundMessage::StreamChunk { .. } => "stream_chunk",
            InboundMessage::Complete => "complete",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Pong => "pong",
            InboundMessage::Unknown { kind } => kind,
        }
    }
}
