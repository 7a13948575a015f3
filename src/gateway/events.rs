use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::GatewayConfig;

/// Opcodes for gateway payloads.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const STATUS_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes the gateway may end the connection with.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
}

/// How a server-initiated close should be followed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// The session survived; reconnect and RESUME.
    Resume,
    /// The session is gone; reconnect with a fresh IDENTIFY.
    FreshIdentify,
    /// 4004: the token was rejected.
    AuthFailed,
    /// 4010: the shard id/count pair was rejected.
    InvalidShard,
    /// 4011: the bot must shard to connect.
    ShardingRequired,
}

/// Classify a close code into the follow-up action it demands.
///
/// Codes not in the table (including 1000/1001 when the server sent them)
/// are treated conservatively as resumable.
pub fn classify_close_code(code: u16) -> CloseAction {
    match code {
        close_code::AUTH_FAILED => CloseAction::AuthFailed,
        close_code::INVALID_SHARD => CloseAction::InvalidShard,
        close_code::SHARDING_REQUIRED => CloseAction::ShardingRequired,
        close_code::INVALID_SEQ | close_code::SESSION_TIMED_OUT => CloseAction::FreshIdentify,
        _ => CloseAction::Resume,
    }
}

/// Gateway payload envelope. `s` and `t` only appear on DISPATCH.
#[derive(Debug, Serialize, Deserialize)]
pub struct WirePayload {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Events delivered to the shard owner, in wire-receive order.
#[derive(Debug, Clone)]
pub enum Event {
    /// HELLO was received and the handshake is under way.
    Connected,
    /// The connection ended; `Shard::run` is about to return.
    Disconnected,
    /// A DISPATCH payload. The stored sequence is already updated when
    /// this is delivered.
    Dispatch {
        name: String,
        seq: u64,
        data: Value,
    },
    /// The server confirmed a RESUME; missed events were replayed.
    Resumed,
    /// The server invalidated the session (opcode 9).
    InvalidSession { resumable: bool },
    /// The server asked for a reconnect (opcode 7).
    Reconnect,
}

/// Member query constraints for REQUEST_GUILD_MEMBERS. The two forms are
/// mutually exclusive on the wire, so they are mutually exclusive here.
#[derive(Debug, Clone)]
pub enum MemberQuery {
    /// Username prefix filter; an empty query with limit 0 requests
    /// everyone.
    Query { query: String, limit: u32 },
    UserIds(Vec<String>),
}

/// Commands the shard owner can issue through a `ShardHandle`.
#[derive(Debug)]
pub enum Command {
    UpdatePresence(Value),
    UpdateVoiceState {
        guild_id: String,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    },
    RequestGuildMembers {
        guild_id: String,
        query: MemberQuery,
        presences: bool,
    },
    /// A pre-built `{op, d}` payload, for commands this enum does not
    /// model.
    Raw(Value),
    Close,
}

pub fn heartbeat(seq: Option<u64>) -> Value {
    json!({ "op": opcode::HEARTBEAT, "d": seq })
}

pub fn identify(config: &GatewayConfig) -> Value {
    let mut d = json!({
        "token": config.token,
        "compress": false,
        "large_threshold": config.large_threshold,
        "properties": {
            "$os": std::env::consts::OS,
            "$browser": "cordial",
            "$device": "cordial",
        },
    });

    if config.shard_count > 1 {
        d["shard"] = json!([config.shard_id, config.shard_count]);
    }
    if let Some(intents) = config.intents {
        d["intents"] = json!(intents);
    }
    if let Some(ref presence) = config.presence {
        d["presence"] = presence.clone();
    }

    json!({ "op": opcode::IDENTIFY, "d": d })
}

pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> Value {
    json!({
        "op": opcode::RESUME,
        "d": { "token": token, "session_id": session_id, "seq": seq },
    })
}

/// Build a STATUS_UPDATE payload, filling the fields the server requires
/// but callers rarely care about.
pub fn status_update(mut presence: Value) -> Value {
    if let Some(obj) = presence.as_object_mut() {
        obj.entry("since").or_insert(Value::Null);
        obj.entry("game").or_insert(Value::Null);
        obj.entry("status").or_insert(json!("online"));
        obj.entry("afk").or_insert(json!(false));
    }
    json!({ "op": opcode::STATUS_UPDATE, "d": presence })
}

pub fn voice_state_update(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> Value {
    json!({
        "op": opcode::VOICE_STATE_UPDATE,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        },
    })
}

pub fn request_guild_members(guild_id: &str, query: &MemberQuery, presences: bool) -> Value {
    let mut d = json!({ "guild_id": guild_id, "presences": presences });
    match query {
        MemberQuery::Query { query, limit } => {
            d["query"] = json!(query);
            d["limit"] = json!(limit);
        }
        MemberQuery::UserIds(ids) => {
            d["user_ids"] = json!(ids);
        }
    }
    json!({ "op": opcode::REQUEST_GUILD_MEMBERS, "d": d })
}
