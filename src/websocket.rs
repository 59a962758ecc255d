//! # WebSocket Session Handler
//!
//! One `ClientSession` actor per connection on `/ws`. The actor is the transport side
//! of a hub connection: it feeds inbound frames to the hub and router, and executes
//! the `ClientCommand`s the hub pushes into its mailbox.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: `/ws?roomCode=12345&isHost=false&targetLangs=Spanish,French`
//! 2. **Join**: with a room code the join handshake runs immediately; without one the
//!    client may send `join_room` later (its first request settles the role), or stays
//!    a free-floating translation client. Either way it is closed if it has not joined
//!    when the join window expires.
//! 3. **Content**: binary audio frames, or `text_submit` (hosts only)
//! 4. **Streaming**: `stream_start` routes subsequent audio into a streaming session
//!    until `stream_stop`
//! 5. **Liveness**: the hub's heartbeat sends protocol pings; protocol pongs and
//!    `ping`/`pong` JSON messages both count as answers
//!
//! ## Actor Model:
//! Hub commands arrive as actor messages, so every write to the socket happens on the
//! actor's own context. Router work (collaborator calls) runs on spawned tasks and
//! re-enters the hub when done.

use crate::hub::{ClientCommand, ClientSink, ConnectionId, DeliveryError, Role, SharedHub};
use crate::lifecycle::join_room;
use crate::protocol::{classify, parse_text_message, ClientMessage, Inbound, JoinParams, JoinQuery, ServerMessage};
use crate::rooms::DurableRooms;
use crate::router::Router;
use crate::services::{StreamEvent, StreamSession, StreamingTranscriber};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Hub-side handle to a session actor's mailbox.
pub struct SessionSink(Addr<ClientSession>);

impl ClientSink for SessionSink {
    fn push(&self, command: ClientCommand) -> Result<(), DeliveryError> {
        if !self.0.connected() {
            return Err(DeliveryError("session stopped".to_string()));
        }
        self.0.do_send(command);
        Ok(())
    }
}

/// WebSocket actor for one client connection.
pub struct ClientSession {
    id: ConnectionId,
    params: JoinParams,
    hub: SharedHub,
    durable: DurableRooms,
    router: Router,
    streaming: Arc<dyn StreamingTranscriber>,
    app_state: web::Data<AppState>,
    /// Open streaming transcription session, owned by this connection only
    stream_session: Option<Box<dyn StreamSession>>,
    join_timeout: Duration,
    join_timer: Option<SpawnHandle>,
}

impl ClientSession {
    pub fn new(params: JoinParams, app_state: web::Data<AppState>) -> Self {
        Self {
            id: ConnectionId::new(),
            params,
            hub: app_state.hub.clone(),
            durable: app_state.durable.clone(),
            router: app_state.router.clone(),
            streaming: app_state.streaming.clone(),
            join_timeout: app_state.config.rooms.join_timeout(),
            app_state,
            stream_session: None,
            join_timer: None,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(e) => error!(conn_id = %self.id, error = %e, "Failed to serialize outbound message"),
        }
    }

    /// Run the join handshake off the actor, then settle the join timer.
    fn start_join(&mut self, code: String, requested_role: Option<Role>, ctx: &mut ws::WebsocketContext<Self>) {
        let hub = self.hub.clone();
        let durable = self.durable.clone();
        let id = self.id;

        let join = async move { join_room(&hub, &durable, id, &code, requested_role).await };
        ctx.spawn(join.into_actor(self).map(|result, act, ctx| {
            if result.is_ok() {
                if let Some(timer) = act.join_timer.take() {
                    ctx.cancel_future(timer);
                }
            }
        }));
    }

    /// Text frames must be structured messages; a malformed one is reported back.
    fn handle_text_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_text_message(text) {
            Ok(message) => self.handle_client_message(message, ctx),
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "Malformed text message");
                self.send(ctx, &ServerMessage::error(format!("Malformed message: {}", e)));
            }
        }
    }

    /// Binary frames are tried as structured messages first, otherwise taken as audio.
    fn handle_payload(&mut self, payload: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        match classify(payload) {
            Inbound::Structured(message) => self.handle_client_message(message, ctx),
            Inbound::Audio(audio) => self.handle_audio(audio, ctx),
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::TextSubmit { text, lang } => {
                let router = self.router.clone();
                let id = self.id;
                actix_web::rt::spawn(async move { router.handle_text(id, text, lang).await });
            }
            ClientMessage::JoinRoom {
                room_code,
                is_host,
                target_langs,
            } => {
                if let Some(languages) = target_langs {
                    self.hub.lock().set_languages(self.id, languages.into_languages());
                }
                let requested = is_host.map(|host| if host { Role::Host } else { Role::Student });
                self.start_join(room_code.trim().to_string(), requested, ctx);
            }
            ClientMessage::SetLanguages { target_langs } => {
                self.hub.lock().set_languages(self.id, target_langs.into_languages());
            }
            ClientMessage::StreamStart { lang } => self.start_streaming(lang, ctx),
            ClientMessage::StreamStop => self.stop_streaming(ctx),
            keepalive @ (ClientMessage::Ping | ClientMessage::Pong) => {
                if let Some(reply) = self.keepalive_reply(&keepalive) {
                    self.send(ctx, &reply);
                }
            }
        }
    }

    fn mark_alive(&self) {
        self.hub.lock().mark_alive(self.id);
    }

    /// Any keepalive message counts as a liveness answer; a `ping` is answered.
    fn keepalive_reply(&self, message: &ClientMessage) -> Option<ServerMessage> {
        self.mark_alive();
        matches!(message, ClientMessage::Ping).then_some(ServerMessage::Pong)
    }

    fn handle_audio(&mut self, audio: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(session) = self.stream_session.as_mut() {
            if let Err(e) = session.send(audio) {
                warn!(conn_id = %self.id, error = %e, "Streaming session rejected audio");
                self.stream_session = None;
                self.send(ctx, &ServerMessage::error("Streaming session ended unexpectedly"));
            }
            return;
        }

        let router = self.router.clone();
        let id = self.id;
        actix_web::rt::spawn(async move { router.handle_audio(id, audio).await });
    }

    fn start_streaming(&mut self, lang: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.hub.lock().authorize_submission(self.id) {
            return;
        }
        if self.stream_session.is_some() {
            self.send(ctx, &ServerMessage::error("A streaming session is already open"));
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.stream_session = Some(self.streaming.open_session(events_tx));
        ctx.add_stream(UnboundedReceiverStream::new(events_rx));

        info!(conn_id = %self.id, lang = ?lang, "Streaming session started");
        self.send(ctx, &ServerMessage::info("Streaming started"));
    }

    fn stop_streaming(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        match self.stream_session.take() {
            Some(mut session) => {
                session.close();
                info!(conn_id = %self.id, "Streaming session stopped");
                self.send(ctx, &ServerMessage::info("Streaming stopped"));
            }
            None => self.send(ctx, &ServerMessage::error("No streaming session is open")),
        }
    }
}

impl Actor for ClientSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(conn_id = %self.id, role = %self.params.role(), room_code = ?self.params.room_code, "WebSocket connection started");
        self.app_state.connection_opened();

        self.hub.lock().register(
            self.id,
            self.params.requested_role,
            self.params.target_languages.clone(),
            Box::new(SessionSink(ctx.address())),
        );

        match self.params.room_code.clone() {
            Some(code) => self.start_join(code, None, ctx),
            None => {
                let timer = ctx.run_later(self.join_timeout, |act, _ctx| {
                    act.join_timer = None;
                    act.hub.lock().expire_unjoined(act.id);
                });
                self.join_timer = Some(timer);
                self.send(
                    ctx,
                    &ServerMessage::info("Connected. Send join_room to join a classroom, or submit content directly."),
                );
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut session) = self.stream_session.take() {
            session.close();
        }
        self.hub.lock().disconnect(self.id);
        self.app_state.connection_closed();
        info!(conn_id = %self.id, "WebSocket connection stopped");
    }
}

/// Execute commands pushed by the hub.
impl Handler<ClientCommand> for ClientSession {
    type Result = ();

    fn handle(&mut self, command: ClientCommand, ctx: &mut Self::Context) {
        match command {
            ClientCommand::Send(message) => self.send(ctx, &message),
            ClientCommand::Probe => ctx.ping(b""),
            ClientCommand::Terminate => {
                debug!(conn_id = %self.id, "Terminating connection");
                ctx.stop();
            }
            ClientCommand::Close { reason } => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(reason),
                }));
                ctx.stop();
            }
        }
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text_frame(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_payload(data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.mark_alive();
            }
            Ok(ws::Message::Pong(_)) => self.mark_alive(),
            Ok(ws::Message::Close(reason)) => {
                info!(conn_id = %self.id, reason = ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(conn_id = %self.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(conn_id = %self.id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Results from this connection's streaming session.
impl StreamHandler<StreamEvent> for ClientSession {
    fn handle(&mut self, event: StreamEvent, ctx: &mut Self::Context) {
        match event {
            StreamEvent::Partial(text) => self.send(ctx, &ServerMessage::Partial { data: text }),
            StreamEvent::Final(text) => {
                let router = self.router.clone();
                let id = self.id;
                actix_web::rt::spawn(async move { router.deliver_final(id, text, None).await });
            }
            StreamEvent::Error(message) => {
                self.send(ctx, &ServerMessage::error(format!("Streaming transcription failed: {}", message)));
            }
        }
    }

    // The session ending must not stop the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(conn_id = %self.id, "Streaming event stream finished");
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Parses the join parameters from the query string and hands the upgraded connection
/// to a new `ClientSession` actor.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<JoinQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let params = JoinParams::from(query.into_inner());
    debug!(peer = ?req.connection_info().peer_addr(), params = ?params, "WebSocket upgrade requested");

    ws::start(ClientSession::new(params, app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::RecordingSink;
    use crate::state::tests::test_state;

    fn registered_session() -> (ClientSession, RecordingSink) {
        let state = web::Data::new(test_state());
        let session = ClientSession::new(JoinParams::from(JoinQuery::default()), state);
        let sink = RecordingSink::default();
        session
            .hub
            .lock()
            .register(session.id, session.params.requested_role, vec![], Box::new(sink.clone()));
        (session, sink)
    }

    #[test]
    fn test_session_takes_join_window_from_config() {
        let state = web::Data::new(test_state());
        let session = ClientSession::new(JoinParams::from(JoinQuery::default()), state);

        assert_eq!(session.join_timeout, Duration::from_secs(60));
        assert_eq!(session.params.role(), Role::Host);
        assert!(session.stream_session.is_none());
    }

    #[test]
    fn test_keepalive_messages_answer_probes() {
        let (session, sink) = registered_session();

        session.hub.lock().sweep_liveness();
        assert!(!session.hub.lock().is_alive(session.id));
        assert_eq!(session.keepalive_reply(&ClientMessage::Ping), Some(ServerMessage::Pong));
        assert!(session.hub.lock().is_alive(session.id));

        session.hub.lock().sweep_liveness();
        assert_eq!(session.keepalive_reply(&ClientMessage::Pong), None);
        assert!(session.hub.lock().is_alive(session.id));
        assert!(!sink.was_terminated());
    }

    #[test]
    fn test_protocol_pong_keeps_connection() {
        let (session, sink) = registered_session();

        for _ in 0..3 {
            assert!(session.hub.lock().sweep_liveness().is_empty());
            session.mark_alive();
        }
        assert!(!sink.was_terminated());
        assert_eq!(session.hub.lock().stats().connections, 1);
    }
}
