//! WebSocket connection handler.
//!
//! Each connection runs one [`SignalingSession`]:
//!
//! ```text
//! Connecting ──(identifier allocated, assignIdentity sent)──► Active
//! Active     ──(read error / close frame / evicted)────────► Closed
//! ```
//!
//! The session reads one frame at a time. Outbound traffic goes through the
//! participant's queue and a separate writer task, so a slow socket never
//! holds up whoever is sending to it.

use std::fmt;

use axum::extract::ws::{Message, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ProtocolError, RelayError, Result};
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::registry::{ConnectionId, Outbound, PeerHandle};
use crate::router::{MessageRouter, RouteResult};
use crate::state::RelayState;

/// Transport-independent view of a WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping/pong; the transport answers these itself.
    Control,
    Close,
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(_) | Message::Pong(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Control => Message::Pong(Vec::new()),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Handle a single WebSocket connection until it closes.
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let (sink, stream) = socket.split();
    let reader = stream.map(|result| {
        result
            .map(Frame::from)
            .map_err(|e| RelayError::Transport(e.to_string()))
    });
    let writer = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(Message::from(frame))));

    run_session(state, reader, writer).await;
}

/// Drive one session over any frame stream and sink.
pub async fn run_session<R, W>(state: RelayState, reader: R, writer: W)
where
    R: Stream<Item = Result<Frame>> + Unpin + Send,
    W: Sink<Frame> + Unpin + Send + 'static,
    W::Error: fmt::Display,
{
    let Some((mut session, writer_task)) = SignalingSession::connect(state, writer).await else {
        return;
    };
    session.run(reader, writer_task).await;
    session.close();
}

/// Per-connection control loop.
pub struct SignalingSession {
    state: RelayState,
    router: MessageRouter,
    id: String,
    connection: ConnectionId,
    phase: SessionState,
}

impl SignalingSession {
    /// `Connecting`: allocate an identifier, tell the client, start the
    /// writer task, then announce the new roster.
    async fn connect<W>(state: RelayState, mut writer: W) -> Option<(Self, JoinHandle<()>)>
    where
        W: Sink<Frame> + Unpin + Send + 'static,
        W::Error: fmt::Display,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(tx);
        let connection = handle.connection();

        let id = match state.registry.register_unique(state.names.as_ref(), handle) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(connection = %connection, error = %e, "Could not allocate identifier");
                let _ = writer.send(Frame::Close).await;
                return None;
            }
        };

        let mut session = Self {
            router: MessageRouter::new(state.registry.clone()),
            state,
            id,
            connection,
            phase: SessionState::Connecting,
        };

        // Written directly so it is the first frame the client sees, ahead of
        // anything already queued for this participant.
        tracing::info!(id = session.id.as_str(), "Sending client ID");
        if let Err(e) = send_frame(&mut writer, &ServerMessage::assign_identity(&session.id)).await {
            tracing::warn!(id = session.id.as_str(), error = %e, "Could not send identity");
            session.close();
            return None;
        }

        let writer_task = tokio::spawn(write_outbound(session.id.clone(), writer, rx));

        session.enter(SessionState::Active);
        session.router.broadcast_roster();

        Some((session, writer_task))
    }

    /// `Active`: process inbound frames until the transport or the writer ends.
    async fn run<R>(&mut self, mut reader: R, mut writer_task: JoinHandle<()>)
    where
        R: Stream<Item = Result<Frame>> + Unpin,
    {
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Frame::Text(text))) => match protocol::decode(&text) {
                        Ok(message) => self.dispatch(message).await,
                        Err(ProtocolError::UnknownType(kind)) => {
                            tracing::warn!(id = self.id.as_str(), kind = kind.as_str(), "Unknown message type");
                        }
                        Err(e) => {
                            tracing::warn!(id = self.id.as_str(), error = %e, data = text.as_str(), "Error parsing message");
                        }
                    },
                    Some(Ok(Frame::Binary(_))) => {
                        tracing::warn!(id = self.id.as_str(), error = %ProtocolError::Binary, "Dropping frame");
                    }
                    Some(Ok(Frame::Control)) => {}
                    Some(Ok(Frame::Close)) => {
                        tracing::info!(id = self.id.as_str(), "Client sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(id = self.id.as_str(), error = %e, "Error reading message");
                        break;
                    }
                    None => break,
                },
                _ = &mut writer_task => {
                    tracing::info!(id = self.id.as_str(), "Outbound side closed");
                    break;
                }
            }
        }

        writer_task.abort();
    }

    /// Route one message and record call lifecycle for offers and hangups.
    async fn dispatch(&self, message: ClientMessage) {
        let from = self.id.as_str();
        tracing::debug!(id = from, kind = message.kind(), "Message received");

        match message {
            ClientMessage::Offer { ref to, .. } => {
                let to = to.clone();
                if self.router.route(from, message) == RouteResult::Delivered {
                    self.state.ledger.call_started(from, &to);
                }
            }

            ClientMessage::Hangup { to, from: _, payload } => {
                let target = match to.filter(|to| !to.is_empty()) {
                    Some(to) => {
                        self.state.ledger.call_ended(from, &to);
                        Some(to)
                    }
                    None => {
                        tracing::info!(id = from, "Hangup without target, looking up active call");
                        let found = self.state.ledger.hangup_without_target(from).await;
                        if found.is_none() {
                            tracing::info!(id = from, "No active call found");
                        }
                        found
                    }
                };

                if let Some(to) = target {
                    self.router.route(from, ClientMessage::Hangup {
                        to: Some(to),
                        from: None,
                        payload,
                    });
                }
            }

            other => {
                self.router.route(from, other);
            }
        }
    }

    /// `Closed`: leave the registry and announce the new roster.
    fn close(&mut self) {
        if self.phase == SessionState::Closed {
            return;
        }
        self.enter(SessionState::Closed);
        self.state.registry.unregister_connection(&self.id, self.connection);
        self.router.broadcast_roster();
        tracing::info!(id = self.id.as_str(), "Client disconnected");
    }

    fn enter(&mut self, next: SessionState) {
        tracing::debug!(id = self.id.as_str(), from = ?self.phase, to = ?next, "Session state change");
        self.phase = next;
    }
}

async fn send_frame<W>(writer: &mut W, message: &ServerMessage) -> std::result::Result<(), String>
where
    W: Sink<Frame> + Unpin,
    W::Error: fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    writer.send(Frame::Text(json)).await.map_err(|e| e.to_string())
}

/// Drain a participant's queue into its socket.
async fn write_outbound<W>(id: String, mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: Sink<Frame> + Unpin,
    W::Error: fmt::Display,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(message) => {
                if let Err(e) = send_frame(&mut writer, &message).await {
                    tracing::warn!(id = id.as_str(), error = %e, "Error sending message");
                    break;
                }
            }
            Outbound::Close => {
                tracing::info!(id = id.as_str(), "Disconnecting old client");
                let _ = writer.send(Frame::Close).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerHandle;
    use crate::state::RelayConfig;
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct TestClient {
        id: String,
        inbound: fmpsc::UnboundedSender<Result<Frame>>,
        outbound: fmpsc::UnboundedReceiver<Frame>,
        task: JoinHandle<()>,
    }

    impl TestClient {
        async fn connect(state: &RelayState) -> Self {
            let (inbound, reader) = fmpsc::unbounded();
            let (writer, mut outbound) = fmpsc::unbounded();
            let task = tokio::spawn(run_session(state.clone(), reader, writer));

            let id = match next_frame(&mut outbound).await {
                Frame::Text(text) => match serde_json::from_str::<ServerMessage>(&text).unwrap() {
                    ServerMessage::AssignIdentity { data } => data.client_id,
                    other => panic!("Expected assignIdentity first, got {:?}", other),
                },
                other => panic!("Expected text frame, got {:?}", other),
            };

            Self {
                id,
                inbound,
                outbound,
                task,
            }
        }

        fn send(&self, value: serde_json::Value) {
            self.send_raw(&value.to_string());
        }

        fn send_raw(&self, text: &str) {
            self.inbound
                .unbounded_send(Ok(Frame::Text(text.to_string())))
                .unwrap();
        }

        /// Next message that is not a roster update.
        async fn next_signal(&mut self) -> ServerMessage {
            loop {
                match self.next_message().await {
                    ServerMessage::RosterUpdate { .. } => continue,
                    other => return other,
                }
            }
        }

        /// Next roster update matching `ids`.
        async fn roster_eventually(&mut self, ids: &[&str]) {
            let mut expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            expected.sort();
            loop {
                if let ServerMessage::RosterUpdate { data } = self.next_message().await {
                    if data.user_ids == expected {
                        return;
                    }
                }
            }
        }

        async fn next_message(&mut self) -> ServerMessage {
            match next_frame(&mut self.outbound).await {
                Frame::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("Expected text frame, got {:?}", other),
            }
        }

        /// Drain everything currently queued, waiting briefly for stragglers.
        async fn drain(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(Some(frame)) =
                tokio::time::timeout(Duration::from_millis(100), self.outbound.next()).await
            {
                frames.push(frame);
            }
            frames
        }
    }

    async fn next_frame(rx: &mut fmpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(WAIT, rx.next())
            .await
            .expect("timed out waiting for frame")
            .expect("writer closed")
    }

    /// Poll the ledger until `check` holds.
    async fn ledger_eventually<F>(state: &RelayState, check: F) -> Vec<crate::ledger::CallRecord>
    where
        F: Fn(&[crate::ledger::CallRecord]) -> bool,
    {
        for _ in 0..100 {
            let calls = state.ledger.list_calls(None).await.unwrap();
            if check(&calls) {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ledger never reached the expected state");
    }

    #[tokio::test]
    async fn test_connect_assigns_distinct_identities() {
        let state = RelayState::in_memory();
        let mut p1 = TestClient::connect(&state).await;
        let mut p2 = TestClient::connect(&state).await;

        assert_ne!(p1.id, p2.id);
        assert!(state.registry.is_online(&p1.id));
        assert!(state.registry.is_online(&p2.id));

        let ids = [p1.id.clone(), p2.id.clone()];
        let both: Vec<&str> = ids.iter().map(String::as_str).collect();
        p1.roster_eventually(&both).await;
        p2.roster_eventually(&both).await;
    }

    #[tokio::test]
    async fn test_stopped_ledger_does_not_block_delivery() {
        let state = RelayState::with_ledger(RelayConfig::default(), LedgerHandle::stopped());
        let p1 = TestClient::connect(&state).await;
        let mut p2 = TestClient::connect(&state).await;

        p1.send(json!({ "type": "offer", "to": p2.id, "offer": { "type": "offer", "sdp": "v=0" } }));
        assert!(matches!(
            p2.next_signal().await,
            ServerMessage::Offer { ref from, .. } if *from == p1.id
        ));
        assert_eq!(state.ledger.stats().dropped_events, 1);

        p1.send(json!({ "type": "answer", "to": p2.id, "answer": { "type": "answer", "sdp": "v=0" } }));
        assert!(matches!(p2.next_signal().await, ServerMessage::Answer { .. }));

        p1.send(json!({ "type": "hangup", "to": p2.id }));
        assert!(matches!(p2.next_signal().await, ServerMessage::Hangup { .. }));
        assert_eq!(state.ledger.stats().dropped_events, 2);
    }

    #[tokio::test]
    async fn test_offer_delivered_and_call_opened() {
        let state = RelayState::in_memory();
        let p1 = TestClient::connect(&state).await;
        let mut p2 = TestClient::connect(&state).await;

        p1.send(json!({
            "type": "offer",
            "from": p1.id,
            "to": p2.id,
            "offer": { "type": "offer", "sdp": "v=0" }
        }));

        match p2.next_signal().await {
            ServerMessage::Offer { from, to, payload } => {
                assert_eq!(from, p1.id);
                assert_eq!(to, p2.id);
                assert_eq!(payload["offer"]["sdp"], "v=0");
            }
            other => panic!("Expected offer, got {:?}", other),
        }

        let calls = ledger_eventually(&state, |calls| calls.len() == 1).await;
        assert_eq!(calls[0].from, p1.id);
        assert_eq!(calls[0].to, p2.id);
        assert!(calls[0].is_open());
    }

    #[tokio::test]
    async fn test_hangup_without_target_routes_to_caller() {
        let state = RelayState::in_memory();
        let mut p1 = TestClient::connect(&state).await;
        let mut p2 = TestClient::connect(&state).await;

        p1.send(json!({ "type": "mediaOffer", "to": p2.id, "offer": { "sdp": "v=0" } }));
        assert!(matches!(p2.next_signal().await, ServerMessage::Offer { .. }));
        ledger_eventually(&state, |calls| calls.len() == 1).await;

        p2.send(json!({ "type": "hangup", "from": p2.id }));

        match p1.next_signal().await {
            ServerMessage::Hangup { from, to, .. } => {
                assert_eq!(from, p2.id);
                assert_eq!(to.as_deref(), Some(p1.id.as_str()));
            }
            other => panic!("Expected hangup, got {:?}", other),
        }

        let calls = ledger_eventually(&state, |calls| calls.iter().all(|c| !c.is_open())).await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].duration >= 0.0);
        assert_eq!(state.ledger.stats().calls_ended, 1);
    }

    #[tokio::test]
    async fn test_hangup_with_no_call_is_silent() {
        let state = RelayState::in_memory();
        let mut p3 = TestClient::connect(&state).await;
        let before = state.registry.snapshot_ids();

        p3.send(json!({ "type": "hangup" }));

        for _ in 0..100 {
            if state.ledger.stats().inconsistencies == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.ledger.stats().inconsistencies, 1);
        assert_eq!(state.ledger.count_calls().await.unwrap(), 0);
        assert_eq!(state.registry.snapshot_ids(), before);

        // Only roster updates ever reach p3.
        for frame in p3.drain().await {
            match frame {
                Frame::Text(text) => assert!(matches!(
                    serde_json::from_str::<ServerMessage>(&text).unwrap(),
                    ServerMessage::RosterUpdate { .. }
                )),
                other => panic!("Unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_transport_error_unregisters_and_broadcasts() {
        let state = RelayState::in_memory();
        let p1 = TestClient::connect(&state).await;
        let mut p2 = TestClient::connect(&state).await;

        p1.inbound
            .unbounded_send(Err(RelayError::Transport("connection reset".to_string())))
            .unwrap();
        tokio::time::timeout(WAIT, p1.task).await.unwrap().unwrap();

        assert!(!state.registry.is_online(&p1.id));
        let id = p2.id.clone();
        p2.roster_eventually(&[id.as_str()]).await;
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_keep_session() {
        let state = RelayState::in_memory();
        let mut p1 = TestClient::connect(&state).await;
        p1.drain().await;

        p1.send_raw("this is not json");
        p1.send(json!({ "type": "dance" }));
        p1.send(json!({ "type": "offer", "sdp": "missing to" }));
        p1.inbound.unbounded_send(Ok(Frame::Binary(vec![1, 2, 3]))).unwrap();
        p1.send(json!({ "type": "requestUserList" }));

        let id = p1.id.clone();
        p1.roster_eventually(&[id.as_str()]).await;
        assert!(state.registry.is_online(&p1.id));
    }

    #[tokio::test]
    async fn test_offer_to_absent_peer_opens_no_call() {
        let state = RelayState::in_memory();
        let mut p1 = TestClient::connect(&state).await;

        p1.send(json!({ "type": "offer", "to": "👻 Ghost", "offer": {} }));
        p1.send(json!({ "type": "requestRoster" }));
        let id = p1.id.clone();
        p1.roster_eventually(&[id.as_str()]).await;

        assert_eq!(state.ledger.count_calls().await.unwrap(), 0);
        assert_eq!(state.registry.snapshot_ids(), vec![p1.id.clone()]);
    }

    #[tokio::test]
    async fn test_evicted_session_leaves_successor() {
        let state = RelayState::in_memory();
        let mut p1 = TestClient::connect(&state).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let successor = PeerHandle::new(tx);
        let successor_conn = successor.connection();
        state.registry.register(&p1.id, successor);

        let frames = p1.drain().await;
        assert_eq!(frames.last(), Some(&Frame::Close));
        tokio::time::timeout(WAIT, p1.task).await.unwrap().unwrap();

        let current = state.registry.lookup(&p1.id).unwrap();
        assert_eq!(current.connection(), successor_conn);
    }

    #[tokio::test]
    async fn test_close_frame_ends_session() {
        let state = RelayState::in_memory();
        let p1 = TestClient::connect(&state).await;

        p1.inbound.unbounded_send(Ok(Frame::Close)).unwrap();
        tokio::time::timeout(WAIT, p1.task).await.unwrap().unwrap();

        assert_eq!(state.registry.online_count(), 0);
    }
}
