//! Connection and request state machine
//!
//! The machine performs no I/O. Every input returns the list of effects the
//! driver has to carry out (open a socket, send a frame, arm a timer, notify
//! observers). This keeps every transition testable without a runtime.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use crate::protocol::{
    InboundMessage, InterpretationRequest, OutboundMessage, KEEPALIVE_TIMEOUT, NORMAL_CLOSURE,
};
use crate::state::{ClientEvent, ClientSnapshot, ConnectionState, ProcessingState, StreamChunk};

/// Generic message surfaced for every transport-level failure
pub const CONNECTION_ERROR: &str = "connection error";

/// Identifies one transport instance so late events from a replaced
/// connection can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Open(ConnectionId),
    Send(ConnectionId, OutboundMessage),
    Close(ConnectionId, u16),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartKeepalive,
    StopKeepalive,
    Emit(ClientEvent),
}

#[derive(Debug, Clone)]
pub struct Machine {
    policy: ReconnectPolicy,
    max_missed_pongs: u32,
    connection: ConnectionState,
    processing: ProcessingState,
    session_id: Option<String>,
    interpretation: String,
    error: Option<String>,
    connection_error: Option<String>,
    attempt: u32,
    missed_pongs: u32,
    current: Option<ConnectionId>,
    next_id: u64,
    reconnect_pending: bool,
}

impl Machine {
    pub fn new(policy: ReconnectPolicy, max_missed_pongs: u32) -> Self {
        Self {
            policy,
            max_missed_pongs,
            connection: ConnectionState::Disconnected,
            processing: ProcessingState::Idle,
            session_id: None,
            interpretation: String::new(),
            error: None,
            connection_error: None,
            attempt: 0,
            missed_pongs: 0,
            current: None,
            next_id: 0,
            reconnect_pending: false,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn processing(&self) -> ProcessingState {
        self.processing
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn interpretation(&self) -> &str {
        &self.interpretation
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            connection: self.connection,
            processing: self.processing,
            session_id: self.session_id.clone(),
            interpretation: self.interpretation.clone(),
            error: self.error.clone(),
            connection_error: self.connection_error.clone(),
            reconnect_attempt: self.attempt,
        }
    }

    /// Manual connect. Restarts the backoff cycle, so it also recovers from
    /// an exhausted retry budget.
    pub fn connect(&mut self) -> Vec<Effect> {
        if matches!(
            self.connection,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            debug!(state = %self.connection, "connect ignored");
            return Vec::new();
        }

        let mut effects = Vec::new();
        self.attempt = 0;
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
        self.open_transport(&mut effects);
        effects
    }

    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }

        if let Some(id) = self.current.take() {
            if self.connection == ConnectionState::Connected {
                effects.push(Effect::StopKeepalive);
            }
            effects.push(Effect::Close(id, NORMAL_CLOSURE));
        }

        self.session_id = None;
        self.missed_pongs = 0;
        self.set_connection(ConnectionState::Disconnected, &mut effects);
        effects
    }

    /// Validate and send one interpretation request.
    ///
    /// The in-flight request, if any, is simply superseded; the server owns
    /// ordering of requests within a session.
    pub fn submit(
        &mut self,
        request: &InterpretationRequest,
        user_token: Option<String>,
    ) -> Result<Vec<Effect>, ClientError> {
        let id = match (self.connection, self.current) {
            (ConnectionState::Connected, Some(id)) => id,
            _ => return Err(ClientError::NotConnected),
        };
        if request.is_blank() {
            return Err(ClientError::EmptyQuery);
        }

        let mut effects = Vec::new();
        self.interpretation.clear();
        self.error = None;
        self.set_processing(ProcessingState::Processing, &mut effects);
        info!(
            interpretation_type = request.interpretation_type.as_str(),
            "submitting interpretation request"
        );
        effects.push(Effect::Send(
            id,
            OutboundMessage::interpret(request, user_token),
        ));
        Ok(effects)
    }

    pub fn clear_interpretation(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.interpretation.clear();
        self.error = None;
        self.set_processing(ProcessingState::Idle, &mut effects);
        effects
    }

    pub fn on_open(&mut self, id: ConnectionId) -> Vec<Effect> {
        if self.current != Some(id) || self.connection != ConnectionState::Connecting {
            debug!(connection = id.0, "closing superseded transport");
            return vec![Effect::Close(id, NORMAL_CLOSURE)];
        }

        let mut effects = Vec::new();
        self.attempt = 0;
        self.missed_pongs = 0;
        self.connection_error = None;
        self.set_connection(ConnectionState::Connected, &mut effects);
        effects.push(Effect::StartKeepalive);
        effects
    }

    pub fn on_connect_failed(&mut self, id: ConnectionId, reason: &str) -> Vec<Effect> {
        if self.current != Some(id) {
            return Vec::new();
        }
        warn!(connection = id.0, %reason, "connection attempt failed");

        let mut effects = Vec::new();
        self.current = None;
        self.connection_error = Some(CONNECTION_ERROR.to_string());
        self.set_connection(ConnectionState::Error, &mut effects);
        effects.push(Effect::Emit(ClientEvent::ConnectionError(
            CONNECTION_ERROR.to_string(),
        )));
        self.schedule_reconnect(&mut effects);
        effects
    }

    pub fn on_closed(&mut self, id: ConnectionId, code: u16) -> Vec<Effect> {
        if self.current != Some(id) {
            debug!(connection = id.0, code, "ignoring close of stale transport");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.connection == ConnectionState::Connected {
            effects.push(Effect::StopKeepalive);
        }
        self.current = None;
        self.session_id = None;
        self.missed_pongs = 0;
        self.set_connection(ConnectionState::Disconnected, &mut effects);

        if code == NORMAL_CLOSURE {
            info!(connection = id.0, "connection closed normally");
        } else {
            warn!(connection = id.0, code, "connection closed unexpectedly");
            self.schedule_reconnect(&mut effects);
        }
        effects
    }

    pub fn on_frame(&mut self, id: ConnectionId, text: &str) -> Vec<Effect> {
        if self.current != Some(id) {
            return Vec::new();
        }

        match InboundMessage::parse(text) {
            Ok(message) => self.on_message(message),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                Vec::new()
            }
        }
    }

    pub fn on_message(&mut self, message: InboundMessage) -> Vec<Effect> {
        let mut effects = Vec::new();

        match message {
            InboundMessage::Connected { session_id } => {
                info!(%session_id, "session assigned");
                self.session_id = Some(session_id.clone());
                effects.push(Effect::Emit(ClientEvent::SessionAssigned(session_id)));
            }
            InboundMessage::ProcessingStart => {
                self.interpretation.clear();
                self.set_processing(ProcessingState::Processing, &mut effects);
            }
            InboundMessage::StreamChunk { chunk, chunk_type } => {
                self.interpretation.push_str(&chunk);
                self.set_processing(ProcessingState::Streaming, &mut effects);
                effects.push(Effect::Emit(ClientEvent::Chunk(StreamChunk {
                    text: chunk,
                    chunk_type,
                })));
            }
            InboundMessage::Complete => {
                self.set_processing(ProcessingState::Complete, &mut effects);
            }
            InboundMessage::Error { error } => {
                warn!(%error, "server reported an error");
                self.error = Some(error.clone());
                self.set_processing(ProcessingState::Error, &mut effects);
                effects.push(Effect::Emit(ClientEvent::ServerError(error)));
            }
            InboundMessage::Pong => {
                self.missed_pongs = 0;
            }
            InboundMessage::Unknown { kind } => {
                warn!(%kind, "ignoring unrecognized message type");
            }
        }

        effects
    }

    /// Periodic keepalive. Sends a ping, or declares the connection dead when
    /// too many pings went unanswered.
    pub fn on_keepalive_tick(&mut self) -> Vec<Effect> {
        let id = match (self.connection, self.current) {
            (ConnectionState::Connected, Some(id)) => id,
            _ => return Vec::new(),
        };

        if self.max_missed_pongs > 0 && self.missed_pongs >= self.max_missed_pongs {
            warn!(
                missed = self.missed_pongs,
                "keepalive unanswered, dropping connection"
            );
            let mut effects = vec![Effect::Close(id, KEEPALIVE_TIMEOUT)];
            effects.extend(self.on_closed(id, KEEPALIVE_TIMEOUT));
            return effects;
        }

        self.missed_pongs += 1;
        vec![Effect::Send(id, OutboundMessage::ping())]
    }

    pub fn on_reconnect_timer(&mut self) -> Vec<Effect> {
        if !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;

        if matches!(
            self.connection,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Vec::new();
        }

        info!(attempt = self.attempt, "reconnecting");
        let mut effects = Vec::new();
        self.open_transport(&mut effects);
        effects
    }

    fn open_transport(&mut self, effects: &mut Vec<Effect>) {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.current = Some(id);
        self.set_connection(ConnectionState::Connecting, effects);
        effects.push(Effect::Open(id));
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        match self.policy.delay_for(self.attempt) {
            Some(delay) => {
                self.attempt += 1;
                self.reconnect_pending = true;
                info!(
                    attempt = self.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                effects.push(Effect::Emit(ClientEvent::ReconnectScheduled {
                    attempt: self.attempt,
                    delay_ms: delay.as_millis() as u64,
                }));
                effects.push(Effect::ScheduleReconnect(delay));
            }
            None => {
                warn!(
                    attempts = self.attempt,
                    "reconnect attempts exhausted, giving up"
                );
                self.connection_error = Some(CONNECTION_ERROR.to_string());
                self.set_connection(ConnectionState::Error, effects);
                effects.push(Effect::Emit(ClientEvent::ReconnectExhausted));
            }
        }
    }

    fn set_connection(&mut self, to: ConnectionState, effects: &mut Vec<Effect>) {
        if self.connection == to {
            return;
        }
        let from = self.connection;
        self.connection = to;
        debug!(%from, %to, "connection state changed");
        effects.push(Effect::Emit(ClientEvent::ConnectionChanged { from, to }));
    }

    fn set_processing(&mut self, to: ProcessingState, effects: &mut Vec<Effect>) {
        if self.processing == to {
            return;
        }
        let from = self.processing;
        self.processing = to;
        debug!(%from, %to, "processing state changed");
        effects.push(Effect::Emit(ClientEvent::ProcessingChanged { from, to }));
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default(), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(machine: &mut Machine) -> ConnectionId {
        let effects = machine.connect();
        let id = effects
            .iter()
            .find_map(|e| match e {
                Effect::Open(id) => Some(*id),
                _ => None,
            })
            .expect("connect should open a transport");
        machine.on_open(id);
        id
    }

    fn frame(machine: &mut Machine, id: ConnectionId, text: &str) -> Vec<Effect> {
        machine.on_frame(id, text)
    }

    fn scheduled(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect(d) => Some(*d),
            _ => None,
        })
    }

    fn opens(effects: &[Effect]) -> Vec<ConnectionId> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Open(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_opens_and_starts_keepalive() {
        let mut machine = Machine::default();
        let effects = machine.connect();
        assert_eq!(machine.connection(), ConnectionState::Connecting);
        let id = opens(&effects)[0];

        let effects = machine.on_open(id);
        assert_eq!(machine.connection(), ConnectionState::Connected);
        assert!(effects.contains(&Effect::StartKeepalive));
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        assert!(machine.connect().is_empty());

        let mut connecting = Machine::default();
        connecting.connect();
        assert!(connecting.connect().is_empty());
        assert_eq!(machine.current, Some(id));
    }

    #[test]
    fn test_submit_requires_connection() {
        let mut machine = Machine::default();
        let request = InterpretationRequest::new("Tell me about my sun sign");
        assert_eq!(
            machine.submit(&request, None),
            Err(ClientError::NotConnected)
        );

        machine.connect();
        assert_eq!(
            machine.submit(&request, None),
            Err(ClientError::NotConnected)
        );
        assert_eq!(machine.processing(), ProcessingState::Idle);
    }

    #[test]
    fn test_submit_rejects_blank_query() {
        let mut machine = Machine::default();
        opened(&mut machine);
        assert_eq!(
            machine.submit(&InterpretationRequest::new("   \n"), None),
            Err(ClientError::EmptyQuery)
        );
    }

    #[test]
    fn test_sun_sign_scenario() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        frame(
            &mut machine,
            id,
            r#"{"type":"connected","data":{"session_id":"abc"}}"#,
        );
        assert_eq!(machine.session_id(), Some("abc"));

        let effects = machine
            .submit(
                &InterpretationRequest::new("Tell me about my sun sign"),
                Some("token".to_string()),
            )
            .unwrap();
        assert_eq!(machine.processing(), ProcessingState::Processing);
        let sent: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, Effect::Send(_, OutboundMessage::Interpret(_))))
            .collect();
        assert_eq!(sent.len(), 1);

        frame(&mut machine, id, r#"{"type":"processing_start"}"#);
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"Your sun ","chunk_type":"text"}}"#,
        );
        assert_eq!(machine.processing(), ProcessingState::Streaming);
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"is in Leo.","chunk_type":"text"}}"#,
        );
        frame(&mut machine, id, r#"{"type":"complete"}"#);

        assert_eq!(machine.interpretation(), "Your sun is in Leo.");
        assert_eq!(machine.processing(), ProcessingState::Complete);
    }

    #[test]
    fn test_chunks_concatenate_in_arrival_order() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        let chunks = ["a", "", "bc", " ", "d\n", "éf", "a"];
        for chunk in chunks {
            let text = serde_json::json!({"type": "stream_chunk", "data": {"chunk": chunk}});
            frame(&mut machine, id, &text.to_string());
        }
        assert_eq!(machine.interpretation(), chunks.concat());
    }

    #[test]
    fn test_server_error_preserves_partial_text() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        machine
            .submit(&InterpretationRequest::new("Tell me about my moon"), None)
            .unwrap();
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"Your moon "}}"#,
        );
        let effects = frame(
            &mut machine,
            id,
            r#"{"type":"error","data":{"error":"rate limited"}}"#,
        );

        assert_eq!(machine.processing(), ProcessingState::Error);
        assert_eq!(machine.error(), Some("rate limited"));
        assert_eq!(machine.interpretation(), "Your moon ");
        assert!(effects.contains(&Effect::Emit(ClientEvent::ServerError(
            "rate limited".to_string()
        ))));
        assert_eq!(machine.connection(), ConnectionState::Connected);
    }

    #[test]
    fn test_processing_start_clears_previous_text() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"old"}}"#,
        );
        frame(&mut machine, id, r#"{"type":"processing_start"}"#);
        assert_eq!(machine.interpretation(), "");
        assert_eq!(machine.processing(), ProcessingState::Processing);
    }

    #[test]
    fn test_submit_while_streaming_starts_over() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        machine
            .submit(&InterpretationRequest::new("Tell me about my moon"), None)
            .unwrap();
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"Your moon "}}"#,
        );
        frame(
            &mut machine,
            id,
            r#"{"type":"error","data":{"error":"rate limited"}}"#,
        );
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"late text"}}"#,
        );
        assert_eq!(machine.processing(), ProcessingState::Streaming);

        let effects = machine
            .submit(&InterpretationRequest::new("And my rising sign?"), None)
            .unwrap();

        assert_eq!(machine.interpretation(), "");
        assert_eq!(machine.error(), None);
        assert_eq!(machine.processing(), ProcessingState::Processing);
        let sent: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(sent_on, OutboundMessage::Interpret(payload)) => {
                    Some((*sent_on, payload.query.as_str()))
                }
                Effect::Send(..) => panic!("unexpected send: {:?}", e),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![(id, "And my rising sign?")]);
    }

    #[test]
    fn test_unknown_and_malformed_frames_are_ignored() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        let before = machine.snapshot();
        assert!(frame(&mut machine, id, r#"{"type":"typing"}"#).is_empty());
        assert!(frame(&mut machine, id, "{{nope").is_empty());
        assert_eq!(machine.snapshot(), before);
    }

    #[test]
    fn test_abnormal_close_schedules_reconnect() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        frame(
            &mut machine,
            id,
            r#"{"type":"connected","data":{"session_id":"abc"}}"#,
        );

        let effects = machine.on_closed(id, 1006);
        assert_eq!(machine.connection(), ConnectionState::Disconnected);
        assert_eq!(machine.session_id(), None);
        assert!(effects.contains(&Effect::StopKeepalive));
        assert_eq!(scheduled(&effects), Some(Duration::from_millis(1000)));

        let effects = machine.on_reconnect_timer();
        assert_eq!(machine.connection(), ConnectionState::Connecting);
        assert_eq!(opens(&effects).len(), 1);
    }

    #[test]
    fn test_normal_close_does_not_reconnect() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        let effects = machine.on_closed(id, NORMAL_CLOSURE);
        assert_eq!(machine.connection(), ConnectionState::Disconnected);
        assert_eq!(scheduled(&effects), None);
        assert!(!machine.reconnect_pending());
    }

    #[test]
    fn test_backoff_sequence_and_cap() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);

        let mut delays = Vec::new();
        let mut effects = machine.on_closed(id, 1006);
        loop {
            match scheduled(&effects) {
                Some(delay) => delays.push(delay.as_millis() as u64),
                None => break,
            }
            let reopen = machine.on_reconnect_timer();
            let id = opens(&reopen)[0];
            effects = machine.on_connect_failed(id, "refused");
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
        assert_eq!(machine.connection(), ConnectionState::Error);
        assert!(effects.contains(&Effect::Emit(ClientEvent::ReconnectExhausted)));
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_successful_reconnect_resets_attempts() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        machine.on_closed(id, 1006);
        let id = opens(&machine.on_reconnect_timer())[0];
        machine.on_connect_failed(id, "refused");
        assert_eq!(machine.attempt(), 2);

        let id = opens(&machine.on_reconnect_timer())[0];
        machine.on_open(id);
        assert_eq!(machine.attempt(), 0);

        let effects = machine.on_closed(id, 1011);
        assert_eq!(scheduled(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_manual_connect_restarts_after_exhaustion() {
        let policy = ReconnectPolicy {
            max_attempts: 1,
            ..ReconnectPolicy::default()
        };
        let mut machine = Machine::new(policy, 3);
        let id = opened(&mut machine);
        machine.on_closed(id, 1006);
        let id = opens(&machine.on_reconnect_timer())[0];
        machine.on_connect_failed(id, "refused");
        assert_eq!(machine.connection(), ConnectionState::Error);

        let effects = machine.connect();
        assert_eq!(opens(&effects).len(), 1);
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn test_disconnect_cancels_pending_reconnect() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        machine.on_closed(id, 1006);
        assert!(machine.reconnect_pending());

        let effects = machine.disconnect();
        assert!(effects.contains(&Effect::CancelReconnect));
        assert_eq!(machine.connection(), ConnectionState::Disconnected);
        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_disconnect_closes_normally_and_is_idempotent() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        frame(
            &mut machine,
            id,
            r#"{"type":"connected","data":{"session_id":"abc"}}"#,
        );

        let effects = machine.disconnect();
        assert!(effects.contains(&Effect::Close(id, NORMAL_CLOSURE)));
        assert!(effects.contains(&Effect::StopKeepalive));
        assert_eq!(machine.session_id(), None);

        assert!(machine.disconnect().is_empty());
        // The socket reports its close after we already let go of it
        assert!(machine.on_closed(id, NORMAL_CLOSURE).is_empty());
        assert!(!machine.reconnect_pending());
    }

    #[test]
    fn test_late_open_after_disconnect_is_closed() {
        let mut machine = Machine::default();
        let id = opens(&machine.connect())[0];
        machine.disconnect();
        let effects = machine.on_open(id);
        assert_eq!(effects, vec![Effect::Close(id, NORMAL_CLOSURE)]);
        assert_eq!(machine.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stale_frames_are_ignored() {
        let mut machine = Machine::default();
        let old = opened(&mut machine);
        machine.on_closed(old, 1006);
        let new = opens(&machine.on_reconnect_timer())[0];
        machine.on_open(new);

        assert!(frame(
            &mut machine,
            old,
            r#"{"type":"stream_chunk","data":{"chunk":"ghost"}}"#
        )
        .is_empty());
        assert_eq!(machine.interpretation(), "");
    }

    #[test]
    fn test_keepalive_pings_and_pong_resets() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);

        let effects = machine.on_keepalive_tick();
        assert_eq!(effects, vec![Effect::Send(id, OutboundMessage::ping())]);
        machine.on_keepalive_tick();
        assert_eq!(machine.missed_pongs(), 2);

        frame(&mut machine, id, r#"{"type":"pong"}"#);
        assert_eq!(machine.missed_pongs(), 0);
    }

    #[test]
    fn test_keepalive_drops_dead_connection() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        for _ in 0..3 {
            machine.on_keepalive_tick();
        }

        let effects = machine.on_keepalive_tick();
        assert!(effects.contains(&Effect::Close(id, KEEPALIVE_TIMEOUT)));
        assert_eq!(machine.connection(), ConnectionState::Disconnected);
        assert_eq!(scheduled(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_clear_interpretation() {
        let mut machine = Machine::default();
        let id = opened(&mut machine);
        frame(
            &mut machine,
            id,
            r#"{"type":"stream_chunk","data":{"chunk":"text"}}"#,
        );
        machine.clear_interpretation();
        assert_eq!(machine.interpretation(), "");
        assert_eq!(machine.processing(), ProcessingState::Idle);
    }
}
