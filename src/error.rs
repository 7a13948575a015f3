use std::fmt;

/// How a finished gateway connection should be followed up.
///
/// `Shard::run` resolves every expected exit into one of these values so the
/// owning supervisor can decide between a fresh IDENTIFY, a RESUME, or
/// stopping entirely. Fatal conditions surface as `GatewayError` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The connection ended in a way that allows reconnecting. When
    /// `resumable` is true the stored session id and sequence are still
    /// valid and the next connection should RESUME; otherwise it must
    /// IDENTIFY from scratch.
    Reconnect { resumable: bool },
    /// The caller requested the close via `ShardHandle::close`. No
    /// reconnect is implied.
    Closed,
}

#[derive(Debug)]
pub enum GatewayError {
    /// Close code 4004: the token was rejected. Never retried.
    AuthenticationFailed,
    /// Close code 4010: the shard id/count pair was rejected. Never retried.
    InvalidShard,
    /// Close code 4011: the bot must shard to connect. Never retried.
    ShardingRequired,
    /// A serialized outbound payload exceeded the transport ceiling. It
    /// never reached the socket; sending it would have force-closed the
    /// connection server-side.
    PayloadTooLarge { size: usize },
    /// The server broke the protocol contract (e.g. the first payload was
    /// not HELLO).
    Protocol(String),
    Transport(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
    Decompress(flate2::DecompressError),
}

impl GatewayError {
    /// True for errors the supervisor must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthenticationFailed
                | GatewayError::InvalidShard
                | GatewayError::ShardingRequired
                | GatewayError::PayloadTooLarge { .. }
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AuthenticationFailed => {
                write!(f, "gateway rejected the token (close code 4004)")
            }
            GatewayError::InvalidShard => {
                write!(f, "gateway rejected the shard configuration (close code 4010)")
            }
            GatewayError::ShardingRequired => {
                write!(f, "too many guilds for one connection, sharding required (close code 4011)")
            }
            GatewayError::PayloadTooLarge { size } => {
                write!(f, "outbound payload of {size} bytes exceeds the transport ceiling")
            }
            GatewayError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            GatewayError::Transport(e) => write!(f, "websocket transport error: {e}"),
            GatewayError::Json(e) => write!(f, "payload decode error: {e}"),
            GatewayError::Decompress(e) => write!(f, "zlib stream error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(e)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Json(e)
    }
}

impl From<flate2::DecompressError> for GatewayError {
    fn from(e: flate2::DecompressError) -> Self {
        GatewayError::Decompress(e)
    }
}

#[derive(Debug)]
pub enum HttpError {
    /// 400 from the API. The request itself is malformed; retrying cannot
    /// help.
    BadRequest { message: String },
    /// 401: missing or invalid token.
    Unauthorized { message: String },
    /// 403: the token lacks permission for the resource.
    Forbidden { message: String },
    /// 404: the resource does not exist.
    NotFound { message: String },
    /// Any other 4xx status except 429.
    ClientError { status: u16, message: String },
    /// A 5xx that survived every retry attempt.
    ServerError { status: u16, message: String },
    /// Transient failures (5xx, rate-limit misses, malformed error pages)
    /// kept occurring until the backoff sequence ran out.
    RetriesExhausted { attempts: u32 },
    Transport(reqwest::Error),
    /// A 2xx arrived with a body that was not the JSON we asked for.
    UnexpectedBody { content_type: String },
}

impl HttpError {
    /// True when the failure is the caller's fault and a retry with the
    /// same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HttpError::BadRequest { .. }
                | HttpError::Unauthorized { .. }
                | HttpError::Forbidden { .. }
                | HttpError::NotFound { .. }
                | HttpError::ClientError { .. }
        )
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::BadRequest { message } => write!(f, "400 bad request: {message}"),
            HttpError::Unauthorized { message } => write!(f, "401 unauthorized: {message}"),
            HttpError::Forbidden { message } => write!(f, "403 forbidden: {message}"),
            HttpError::NotFound { message } => write!(f, "404 not found: {message}"),
            HttpError::ClientError { status, message } => {
                write!(f, "client error {status}: {message}")
            }
            HttpError::ServerError { status, message } => {
                write!(f, "server error {status}: {message}")
            }
            HttpError::RetriesExhausted { attempts } => {
                write!(f, "request failed after {attempts} attempts")
            }
            HttpError::Transport(e) => write!(f, "http transport error: {e}"),
            HttpError::UnexpectedBody { content_type } => {
                write!(f, "expected a JSON response but received {content_type}")
            }
        }
    }
}

impl std::error::Error for HttpError {}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        HttpError::Transport(e)
    }
}
