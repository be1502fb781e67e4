mod calls;
mod friends;
mod presence;
mod relay;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::util::generate_id;
use calls::{CallRegistry, InitiateRejection};
use duochat_proto::call::{
    AnswerMadePayload, CallBusyPayload, CallEndReason, CallEndedPayload, CallMadePayload,
    CallRejectedPayload, CallUnavailablePayload, CallUserPayload, EndCallPayload,
    IceCandidateDownPayload, IceCandidateUpPayload, MakeAnswerPayload, RejectCallPayload,
};
use duochat_proto::{
    ClientEvent, MessageRecord, ReadyPayload, SendMessagePayload, ServerEvent,
};
use duochat_storage::{SessionRecord, Storage, StorageError, StoredMessage};
use friends::{FriendshipGate, FriendshipStore};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use presence::{PresenceEntry, PresenceRegistry};
use relay::{MessageLog, MessageRelay};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 128;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Unauthorized,
    Codec,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Codec => write!(f, "codec failure"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

/// Outbound channel items for one connection. `Close` forces the owning
/// task to shut the socket down, used when a presence entry is displaced
/// by a reconnect of the same identity.
pub enum Outbound {
    Event(ServerEvent),
    Close(&'static str),
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    presence: PresenceRegistry,
    calls: CallRegistry,
    relay: MessageRelay,
    gate: Arc<FriendshipGate>,
}

impl AppState {
    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(
            duochat_storage::connect(&config.postgres_dsn)
                .await
                .map_err(|_| ServerError::Storage)?,
        );
        storage.migrate().await.map_err(|_| ServerError::Storage)?;
        let storage_timeout = Duration::from_secs(config.storage_timeout_seconds);
        let gate = Arc::new(FriendshipGate::new(
            Arc::clone(&storage) as Arc<dyn FriendshipStore>,
            Duration::from_secs(config.friendship_cache_ttl_seconds),
            storage_timeout,
        ));
        let relay = MessageRelay::new(
            Arc::clone(&gate),
            Arc::clone(&storage) as Arc<dyn MessageLog>,
            storage_timeout,
        );
        Ok(Arc::new(AppState {
            config,
            storage,
            metrics: Arc::new(Metrics::new()),
            presence: PresenceRegistry::new(),
            calls: CallRegistry::new(),
            relay,
            gate,
        }))
    }
}

#[derive(Clone)]
pub struct RelayApp {
    state: Arc<AppState>,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

impl RelayApp {
    pub fn new(state: Arc<AppState>) -> Self {
        RelayApp { state }
    }

    /// Drives one client connection from TCP accept to teardown. Events
    /// from this connection are handled in submission order; pushes to it
    /// from other connections queue on the outbound channel.
    pub async fn process_connect(self, stream: TcpStream, remote: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(remote = %remote, "websocket accept failed: {}", err);
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        let session = match self.perform_handshake(&mut ws_tx, &mut ws_rx).await {
            Ok(session) => session,
            Err(err) => {
                debug!(remote = %remote, "handshake failed: {}", err);
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
        };
        let user_id = session.user_id;
        let socket_id = generate_id(&format!("socket:{}", user_id));

        let (tx_out, mut rx_out) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
        let entry = PresenceEntry {
            socket_id: socket_id.clone(),
            sender: tx_out.clone(),
        };
        if let Some(displaced) = self.state.presence.register(&user_id, entry).await {
            info!(user = %user_id, "presence replaced by newer connection");
            let _ = displaced.sender.send(Outbound::Close("session-replaced")).await;
            // The displaced handle is as good as disconnected; its calls
            // end now so the counterparty is not left ringing forever.
            self.teardown_calls(&user_id).await;
        }
        self.state.metrics.incr_connections();
        info!(remote = %remote, user = %user_id, socket = %socket_id, "connection established");

        let ready = ServerEvent::Ready(ReadyPayload {
            user_id: user_id.clone(),
            socket_id: socket_id.clone(),
            keepalive_interval: self.state.config.connection_keepalive,
        });
        if self.send_self(&mut ws_tx, ready).await.is_err() {
            self.cleanup_connection(&user_id, &socket_id).await;
            return;
        }

        let mut keepalive = interval(Duration::from_secs(self.state.config.connection_keepalive));
        keepalive.tick().await;

        loop {
            tokio::select! {
                outbound = rx_out.recv() => match outbound {
                    Some(Outbound::Event(event)) => {
                        if self.send_self(&mut ws_tx, event).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        info!(user = %user_id, socket = %socket_id, reason, "closing connection");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        self.state.metrics.mark_ingress();
                        let responses = self.dispatch_event(&user_id, &socket_id, &text).await;
                        let mut failed = false;
                        for event in responses {
                            if self.send_self(&mut ws_tx, event).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {
                        debug!(user = %user_id, "ignoring non-text frame");
                    }
                    Some(Err(err)) => {
                        debug!(user = %user_id, "read failure: {}", err);
                        break;
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.cleanup_connection(&user_id, &socket_id).await;
    }

    /// In-band handshake: the first frame must be a `hello` event whose
    /// token resolves to a live session issued by the auth collaborator.
    async fn perform_handshake(
        &self,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsSource,
    ) -> Result<SessionRecord, ServerError> {
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        let text = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = timeout(remaining, ws_rx.next())
                .await
                .map_err(|_| ServerError::Io)?;
            match frame {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(_)) | None => return Err(ServerError::Io),
                Some(Err(_)) => return Err(ServerError::Io),
            }
        };
        let token = match ClientEvent::decode(&text) {
            Ok(ClientEvent::Hello(payload)) => payload.token,
            Ok(_) => {
                self.send_handshake_error(ws_tx, "invalid-request", "expected hello")
                    .await;
                return Err(ServerError::Codec);
            }
            Err(err) => {
                self.send_handshake_error(ws_tx, "invalid-request", err.to_string())
                    .await;
                return Err(ServerError::Codec);
            }
        };
        let lookup = timeout(
            Duration::from_secs(self.state.config.storage_timeout_seconds),
            self.state.storage.load_session(&token),
        )
        .await;
        let session = match lookup {
            Ok(Ok(session)) => session,
            Ok(Err(StorageError::Missing)) => {
                self.send_handshake_error(ws_tx, "unauthorized", "unknown session")
                    .await;
                return Err(ServerError::Unauthorized);
            }
            Ok(Err(err)) => {
                warn!("session lookup failed: {}", err);
                self.send_handshake_error(ws_tx, "storage-failure", "session lookup failed")
                    .await;
                return Err(ServerError::Storage);
            }
            Err(_) => {
                warn!("session lookup timed out");
                self.send_handshake_error(ws_tx, "storage-failure", "session lookup timed out")
                    .await;
                return Err(ServerError::Storage);
            }
        };
        if session.is_expired(chrono::Utc::now()) {
            self.send_handshake_error(ws_tx, "unauthorized", "session expired")
                .await;
            return Err(ServerError::Unauthorized);
        }
        Ok(session)
    }

    async fn send_handshake_error(&self, ws_tx: &mut WsSink, kind: &str, message: impl Into<String>) {
        let _ = self.send_self(ws_tx, ServerEvent::error(kind, message)).await;
    }

    async fn send_self(&self, ws_tx: &mut WsSink, event: ServerEvent) -> Result<(), ServerError> {
        let text = event.encode().map_err(|_| ServerError::Codec)?;
        ws_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    /// Routes one decoded event. Returns the events owed to the sending
    /// connection; pushes to peers go through their presence entries.
    async fn dispatch_event(
        &self,
        user_id: &str,
        socket_id: &str,
        text: &str,
    ) -> Vec<ServerEvent> {
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                debug!(user = user_id, "undecodable event: {}", err);
                return vec![ServerEvent::error("invalid-request", err.to_string())];
            }
        };
        match event {
            ClientEvent::Hello(_) => {
                // Repeated hello after the handshake is a protocol
                // violation; dropped without a response.
                debug!(user = user_id, "hello on established connection");
                Vec::new()
            }
            ClientEvent::SendMessage(payload) => self.handle_send_message(user_id, payload).await,
            ClientEvent::CallUser(payload) => {
                self.handle_call_user(user_id, socket_id, payload).await
            }
            ClientEvent::MakeAnswer(payload) => self.handle_make_answer(user_id, payload).await,
            ClientEvent::IceCandidate(payload) => self.handle_ice_candidate(user_id, payload).await,
            ClientEvent::RejectCall(payload) => self.handle_reject_call(user_id, payload).await,
            ClientEvent::EndCall(payload) => self.handle_end_call(user_id, payload).await,
        }
    }

    async fn handle_send_message(
        &self,
        user_id: &str,
        payload: SendMessagePayload,
    ) -> Vec<ServerEvent> {
        let stored = match self
            .state
            .relay
            .send(user_id, &payload.receiver_id, &payload.content)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                self.state.metrics.mark_message_rejected();
                return vec![ServerEvent::message_error(err.kind(), err.to_string())];
            }
        };
        self.state.metrics.mark_message_relayed();
        let record = message_record(stored);
        let delivered = self
            .forward_to_user(&record.receiver_id, ServerEvent::Message(record.clone()))
            .await;
        if !delivered {
            debug!(
                user = user_id,
                receiver = %record.receiver_id,
                "receiver offline, message kept for history fetch"
            );
        }
        vec![ServerEvent::Message(record)]
    }

    async fn handle_call_user(
        &self,
        user_id: &str,
        socket_id: &str,
        payload: CallUserPayload,
    ) -> Vec<ServerEvent> {
        let callee = payload.to;
        if callee.trim().is_empty() || callee == user_id {
            return vec![ServerEvent::error("invalid-request", "invalid call target")];
        }
        match self.state.gate.can_exchange(user_id, &callee).await {
            Ok(true) => {}
            Ok(false) => {
                return vec![ServerEvent::error(
                    "forbidden",
                    "Cannot call this user. You are not friends.",
                )];
            }
            Err(err) => {
                warn!(user = user_id, "call authorization failed: {}", err);
                return vec![ServerEvent::error("storage-failure", "Failed to place call.")];
            }
        }
        let callee_entry = self.state.presence.lookup(&callee).await;
        let session = match self
            .state
            .calls
            .initiate(user_id, &callee, callee_entry.is_some())
            .await
        {
            Ok(session) => session,
            Err(rejection) => {
                self.state.metrics.mark_call_rejected();
                return vec![initiate_rejection_event(rejection, user_id, &callee)];
            }
        };
        let offer = CallMadePayload {
            offer: payload.offer,
            from: user_id.to_string(),
            from_socket_id: socket_id.to_string(),
        };
        let delivered = match callee_entry {
            Some(entry) => entry
                .sender
                .send(Outbound::Event(ServerEvent::CallMade(offer)))
                .await
                .is_ok(),
            None => false,
        };
        if !delivered {
            // Callee vanished between the presence lookup and the push.
            self.state.calls.terminate(user_id, &callee).await;
            self.state.metrics.mark_call_rejected();
            return vec![ServerEvent::CallUnavailable(CallUnavailablePayload {
                user_id: callee.clone(),
                message: format!("User {} is not online.", callee),
            })];
        }
        self.state.metrics.mark_call_started();
        info!(call = %session.call_id, caller = user_id, callee = %callee, "call ringing");
        Vec::new()
    }

    async fn handle_make_answer(
        &self,
        user_id: &str,
        payload: MakeAnswerPayload,
    ) -> Vec<ServerEvent> {
        // The socket id hint in the payload is not trusted; the session
        // table and presence registry are authoritative for routing.
        let caller = payload.to_user_id;
        let session = match self.state.calls.answer(user_id, &caller).await {
            Some(session) => session,
            None => {
                debug!(user = user_id, "answer without a ringing session");
                return Vec::new();
            }
        };
        info!(call = %session.call_id, callee = user_id, "call answered");
        let delivered = self
            .forward_to_user(
                &caller,
                ServerEvent::AnswerMade(AnswerMadePayload {
                    answer: payload.answer,
                    from: user_id.to_string(),
                }),
            )
            .await;
        if !delivered {
            // The caller is gone; its disconnect cleanup notifies us.
            debug!(call = %session.call_id, "caller disappeared before answer delivery");
        }
        Vec::new()
    }

    async fn handle_ice_candidate(
        &self,
        user_id: &str,
        payload: IceCandidateUpPayload,
    ) -> Vec<ServerEvent> {
        let peer = payload.to_user_id;
        if !self.state.calls.relay_candidate(user_id, &peer).await {
            // Expected after teardown races; harmless.
            debug!(user = user_id, "dropping candidate without a session");
            return Vec::new();
        }
        self.forward_to_user(
            &peer,
            ServerEvent::IceCandidate(IceCandidateDownPayload {
                candidate: payload.candidate,
                from: user_id.to_string(),
            }),
        )
        .await;
        Vec::new()
    }

    async fn handle_reject_call(
        &self,
        user_id: &str,
        payload: RejectCallPayload,
    ) -> Vec<ServerEvent> {
        let peer = payload.to_user_id;
        let session = match self.state.calls.reject(user_id, &peer).await {
            Some(session) => session,
            None => {
                debug!(user = user_id, "reject without a ringing session");
                return Vec::new();
            }
        };
        self.state.metrics.mark_call_rejected();
        info!(call = %session.call_id, by = user_id, "call rejected");
        self.forward_to_user(
            &peer,
            ServerEvent::CallRejected(CallRejectedPayload {
                from: user_id.to_string(),
            }),
        )
        .await;
        Vec::new()
    }

    async fn handle_end_call(&self, user_id: &str, payload: EndCallPayload) -> Vec<ServerEvent> {
        let peer = payload.to_user_id;
        let session = match self.state.calls.terminate(user_id, &peer).await {
            Some(session) => session,
            // Already discarded: the double hang-up race resolves here.
            None => return Vec::new(),
        };
        self.state.metrics.mark_call_ended();
        info!(call = %session.call_id, by = user_id, "call ended");
        self.forward_to_user(
            &peer,
            ServerEvent::CallEnded(CallEndedPayload {
                from: user_id.to_string(),
                reason: CallEndReason::Hangup,
            }),
        )
        .await;
        Vec::new()
    }

    async fn forward_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        match self.state.presence.lookup(user_id).await {
            Some(entry) => entry.sender.send(Outbound::Event(event)).await.is_ok(),
            None => false,
        }
    }

    /// Ends every call the user is party to and notifies counterparties
    /// with reason `peer-disconnected`.
    async fn teardown_calls(&self, user_id: &str) {
        for session in self.state.calls.drop_party(user_id).await {
            self.state.metrics.mark_call_ended();
            info!(call = %session.call_id, user = user_id, "call ended by disconnect");
            if let Some(peer) = session.peer_of(user_id) {
                let delivered = self
                    .forward_to_user(
                        peer,
                        ServerEvent::CallEnded(CallEndedPayload {
                            from: user_id.to_string(),
                            reason: CallEndReason::PeerDisconnected,
                        }),
                    )
                    .await;
                if !delivered {
                    debug!(call = %session.call_id, "counterparty offline during teardown");
                }
            }
        }
    }

    /// Guarded teardown: call cleanup only runs when this connection
    /// still owned the presence entry, so a replaced connection cannot
    /// destroy sessions created by its successor.
    async fn cleanup_connection(&self, user_id: &str, socket_id: &str) {
        let owned = self.state.presence.remove(user_id, socket_id).await;
        if owned {
            self.teardown_calls(user_id).await;
        }
        self.state.metrics.decr_connections();
        info!(user = user_id, socket = socket_id, "connection closed");
    }
}

fn message_record(stored: StoredMessage) -> MessageRecord {
    MessageRecord {
        id: stored.id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        content: stored.content,
        created_at: stored.created_at,
    }
}

fn initiate_rejection_event(
    rejection: InitiateRejection,
    caller: &str,
    callee: &str,
) -> ServerEvent {
    match rejection {
        InitiateRejection::AlreadyInCall => ServerEvent::CallBusy(CallBusyPayload {
            user_id: caller.to_string(),
            message: "You are already in a call.".to_string(),
        }),
        InitiateRejection::CalleeBusy => ServerEvent::CallBusy(CallBusyPayload {
            user_id: callee.to_string(),
            message: format!("User {} is currently busy.", callee),
        }),
        InitiateRejection::CalleeUnavailable => {
            ServerEvent::CallUnavailable(CallUnavailablePayload {
                user_id: callee.to_string(),
                message: format!("User {} is not online.", callee),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_events_name_the_busy_party() {
        match initiate_rejection_event(InitiateRejection::AlreadyInCall, "1", "2") {
            ServerEvent::CallBusy(payload) => assert_eq!(payload.user_id, "1"),
            other => panic!("unexpected event: {:?}", other),
        }
        match initiate_rejection_event(InitiateRejection::CalleeBusy, "1", "2") {
            ServerEvent::CallBusy(payload) => assert_eq!(payload.user_id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
        match initiate_rejection_event(InitiateRejection::CalleeUnavailable, "1", "2") {
            ServerEvent::CallUnavailable(payload) => assert_eq!(payload.user_id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
