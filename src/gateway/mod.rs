pub mod events;
pub mod frame;
pub mod heartbeat;
pub mod limiter;
pub mod session;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::GatewayConfig;
use crate::error::{CloseOutcome, GatewayError};
use events::{classify_close_code, opcode, CloseAction, Command, Event, MemberQuery, WirePayload};
use frame::FrameDecoder;
use limiter::CommandLimiter;
use session::Session;

/// Ceiling on serialized outbound payloads other than IDENTIFY. The server
/// force-closes the connection for anything larger, so sending must fail
/// locally first.
pub const MAX_COMMAND_BYTES: usize = 4096;

/// Pause before re-identifying after a non-resumable INVALID_SESSION, so an
/// immediate reconnect does not trip the same invalidation again.
pub const INVALID_SESSION_COOLDOWN: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// One gateway connection slot for one shard.
///
/// `run` drives a single connection lifetime and returns how it ended; it
/// never reconnects on its own. The owning supervisor inspects the
/// `CloseOutcome` (or fatal error) together with `session()` to decide
/// between RESUME, fresh IDENTIFY, or giving up, then calls `run` again on
/// the same value; session state carries over.
pub struct Shard {
    config: GatewayConfig,
    session: Arc<Mutex<Session>>,
    event_tx: mpsc::UnboundedSender<Event>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    limiter: CommandLimiter,
}

/// Clonable handle for issuing commands to a running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ShardHandle {
    /// Returns false if the shard has been dropped.
    pub fn send(&self, command: Command) -> bool {
        self.cmd_tx.send(command).is_ok()
    }

    pub fn update_presence(&self, presence: Value) -> bool {
        self.send(Command::UpdatePresence(presence))
    }

    pub fn update_voice_state(
        &self,
        guild_id: impl Into<String>,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    ) -> bool {
        self.send(Command::UpdateVoiceState {
            guild_id: guild_id.into(),
            channel_id,
            self_mute,
            self_deaf,
        })
    }

    pub fn request_guild_members(
        &self,
        guild_id: impl Into<String>,
        query: MemberQuery,
        presences: bool,
    ) -> bool {
        self.send(Command::RequestGuildMembers {
            guild_id: guild_id.into(),
            query,
            presences,
        })
    }

    /// Ask the shard to close the connection. `Shard::run` returns
    /// `CloseOutcome::Closed`.
    pub fn close(&self) -> bool {
        self.send(Command::Close)
    }
}

/// What the receive loop should do after handling one payload or command.
enum Flow {
    Continue,
    Done(CloseOutcome),
}

impl Shard {
    pub fn new(
        config: GatewayConfig,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> (Self, ShardHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(Session::new(
            config.shard_id,
            config.shard_count,
        )));
        (
            Self {
                config,
                session,
                event_tx,
                cmd_rx,
                limiter: CommandLimiter::default(),
            },
            ShardHandle { cmd_tx },
        )
    }

    /// Snapshot of the current session state (id, sequence, heartbeat
    /// latency). Valid between runs; this is what a supervisor stores to
    /// decide on resume.
    pub fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }

    /// Connect and serve one connection lifetime.
    pub async fn run(&mut self) -> Result<CloseOutcome, GatewayError> {
        let result = self.run_inner().await;
        let _ = self.event_tx.send(Event::Disconnected);
        result
    }

    async fn run_inner(&mut self) -> Result<CloseOutcome, GatewayError> {
        let url = self.config.connect_url();
        tracing::debug!(%url, shard_id = self.config.shard_id, "connecting to gateway");

        let (ws, _response) = connect_async(&url).await?;
        let (sink, mut stream) = ws.split();
        let mut decoder = FrameDecoder::new();

        let mut conn = Connection {
            config: &self.config,
            session: &self.session,
            event_tx: &self.event_tx,
            limiter: &self.limiter,
            sink,
        };

        // The first payload must be HELLO.
        let hello = loop {
            let msg = match stream.next().await {
                Some(msg) => msg?,
                None => {
                    return Err(GatewayError::Protocol(
                        "connection closed before HELLO".into(),
                    ))
                }
            };
            match msg {
                Message::Text(text) => break FrameDecoder::decode_text(&text)?,
                Message::Binary(data) => {
                    if let Some(payload) = decoder.feed(&data)? {
                        break payload;
                    }
                }
                Message::Close(frame) => return conn.close_result(close_frame_code(frame)),
                _ => {}
            }
        };

        if hello.op != opcode::HELLO {
            return Err(GatewayError::Protocol(format!(
                "expected HELLO opcode 10 but received {}",
                hello.op
            )));
        }

        let interval_ms = hello
            .d
            .as_ref()
            .and_then(|d| d["heartbeat_interval"].as_u64())
            .ok_or_else(|| GatewayError::Protocol("HELLO without heartbeat_interval".into()))?;
        let interval = Duration::from_millis(interval_ms);
        self.session.lock().unwrap().heartbeat_interval = interval;

        tracing::debug!(interval_ms, "received HELLO");
        let _ = self.event_tx.send(Event::Connected);

        // RESUME if a session survived the last connection, else IDENTIFY.
        let handshake = {
            let session = self.session.lock().unwrap();
            match session.session_id {
                Some(ref id) => {
                    tracing::debug!(session_id = %id, seq = ?session.sequence, "resuming");
                    events::resume(&self.config.token, id, session.sequence)
                }
                None => {
                    tracing::debug!("identifying");
                    events::identify(&self.config)
                }
            }
        };
        conn.send(&handshake).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut heartbeat_task = tokio::spawn(heartbeat::run(
            self.session.clone(),
            interval,
            out_tx,
            shutdown_rx,
        ));

        let outcome = loop {
            tokio::select! {
                _verdict = &mut heartbeat_task => {
                    // The heartbeat task only exits early on a zombie
                    // connection. Tear down locally; do not wait on the
                    // transport for a close handshake.
                    break Ok(CloseOutcome::Reconnect { resumable: true });
                }
                Some(payload) = out_rx.recv() => {
                    if let Err(e) = conn.send(&payload).await {
                        break Err(e);
                    }
                }
                Some(command) = self.cmd_rx.recv() => {
                    match conn.handle_command(command).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Done(outcome)) => break Ok(outcome),
                        Err(e) => break Err(e),
                    }
                }
                msg = stream.next() => {
                    let flow = match msg {
                        None => Ok(Flow::Done(CloseOutcome::Reconnect { resumable: true })),
                        Some(Err(e)) => Err(GatewayError::from(e)),
                        Some(Ok(msg)) => conn.handle_message(msg, &mut decoder).await,
                    };
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Done(outcome)) => break Ok(outcome),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let _ = shutdown_tx.send(true);
        heartbeat_task.abort();
        outcome
    }
}

/// Per-connection state shared by the receive-loop handlers.
struct Connection<'a> {
    config: &'a GatewayConfig,
    session: &'a Arc<Mutex<Session>>,
    event_tx: &'a mpsc::UnboundedSender<Event>,
    limiter: &'a CommandLimiter,
    sink: WsSink,
}

impl Connection<'_> {
    /// Serialize and send one payload, enforcing the size ceiling and the
    /// command limiter. IDENTIFY is exempt from the ceiling.
    async fn send(&mut self, payload: &Value) -> Result<(), GatewayError> {
        let text = serde_json::to_string(payload)?;
        let op = payload["op"].as_u64();

        if op != Some(opcode::IDENTIFY as u64) && text.len() > MAX_COMMAND_BYTES {
            tracing::error!(
                size = text.len(),
                op,
                "dropping outbound payload over the {MAX_COMMAND_BYTES} byte ceiling"
            );
            return Err(GatewayError::PayloadTooLarge { size: text.len() });
        }

        self.limiter.acquire().await;
        tracing::debug!(op, size = text.len(), "sending payload");
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<Flow, GatewayError> {
        let payload = match command {
            Command::Close => {
                let _ = self
                    .sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                return Ok(Flow::Done(CloseOutcome::Closed));
            }
            Command::UpdatePresence(presence) => events::status_update(presence),
            Command::UpdateVoiceState {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            } => events::voice_state_update(&guild_id, channel_id.as_deref(), self_mute, self_deaf),
            Command::RequestGuildMembers {
                guild_id,
                query,
                presences,
            } => events::request_guild_members(&guild_id, &query, presences),
            Command::Raw(payload) => payload,
        };
        self.send(&payload).await?;
        Ok(Flow::Continue)
    }

    async fn handle_message(
        &mut self,
        msg: Message,
        decoder: &mut FrameDecoder,
    ) -> Result<Flow, GatewayError> {
        match msg {
            Message::Text(text) => {
                let payload = FrameDecoder::decode_text(&text)?;
                self.handle_payload(payload).await
            }
            Message::Binary(data) => match decoder.feed(&data)? {
                Some(payload) => self.handle_payload(payload).await,
                None => Ok(Flow::Continue),
            },
            Message::Close(frame) => {
                let code = close_frame_code(frame);
                tracing::debug!(code, "server closed the connection");
                self.close_result(code).map(Flow::Done)
            }
            _ => Ok(Flow::Continue),
        }
    }

    async fn handle_payload(&mut self, payload: WirePayload) -> Result<Flow, GatewayError> {
        match payload.op {
            opcode::DISPATCH => {
                let name = payload.t.unwrap_or_default();
                let seq = payload.s.unwrap_or_default();
                let data = payload.d.unwrap_or(Value::Null);

                // The stored sequence must reflect this payload before the
                // owner sees the event.
                {
                    let mut session = self.session.lock().unwrap();
                    session.sequence = Some(seq);
                    if name == "READY" {
                        session.session_id =
                            data["session_id"].as_str().map(str::to_string);
                        tracing::debug!(session_id = ?session.session_id, "session is READY");
                    }
                }

                if name == "RESUMED" {
                    tracing::debug!("session RESUMED");
                    let _ = self.event_tx.send(Event::Resumed);
                }

                let _ = self.event_tx.send(Event::Dispatch { name, seq, data });
                Ok(Flow::Continue)
            }
            opcode::HEARTBEAT => {
                // Server-requested heartbeat, answered out of cadence.
                let seq = self.session.lock().unwrap().sequence;
                self.send(&events::heartbeat(seq)).await?;
                Ok(Flow::Continue)
            }
            opcode::RECONNECT => {
                tracing::debug!("server requested a reconnect");
                let _ = self.event_tx.send(Event::Reconnect);
                Ok(Flow::Done(CloseOutcome::Reconnect { resumable: true }))
            }
            opcode::INVALID_SESSION => {
                let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                tracing::debug!(resumable, "server invalidated the session");
                let _ = self.event_tx.send(Event::InvalidSession { resumable });
                if resumable {
                    Ok(Flow::Done(CloseOutcome::Reconnect { resumable: true }))
                } else {
                    self.session.lock().unwrap().invalidate();
                    tokio::time::sleep(INVALID_SESSION_COOLDOWN).await;
                    Ok(Flow::Done(CloseOutcome::Reconnect { resumable: false }))
                }
            }
            opcode::HEARTBEAT_ACK => {
                let mut session = self.session.lock().unwrap();
                session.record_heartbeat_ack();
                tracing::debug!(latency = ?session.heartbeat_latency, "received HEARTBEAT_ACK");
                Ok(Flow::Continue)
            }
            op => {
                tracing::debug!(op, "ignoring unexpected opcode");
                Ok(Flow::Continue)
            }
        }
    }

    /// Map a server close code to the outcome or fatal error it demands.
    fn close_result(&self, code: u16) -> Result<CloseOutcome, GatewayError> {
        match classify_close_code(code) {
            CloseAction::AuthFailed => Err(GatewayError::AuthenticationFailed),
            CloseAction::InvalidShard => Err(GatewayError::InvalidShard),
            CloseAction::ShardingRequired => Err(GatewayError::ShardingRequired),
            CloseAction::FreshIdentify => {
                self.session.lock().unwrap().invalidate();
                Ok(CloseOutcome::Reconnect { resumable: false })
            }
            CloseAction::Resume => Ok(CloseOutcome::Reconnect { resumable: true }),
        }
    }
}

fn close_frame_code(frame: Option<CloseFrame>) -> u16 {
    frame.map(|f| u16::from(f.code)).unwrap_or(1005)
}
