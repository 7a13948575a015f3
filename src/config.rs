use serde_json::Value;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
pub const DEFAULT_REST_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_API_VERSION: u8 = 10;

/// Members-per-guild threshold above which the gateway stops sending the
/// full member list automatically. The API accepts 50..=250.
pub const DEFAULT_LARGE_THRESHOLD: u32 = 250;

/// Configuration for one gateway shard connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot token, without the `Bot ` prefix.
    pub token: String,
    pub gateway_url: String,
    pub version: u8,
    /// Enables zlib-stream transport compression on the connection.
    pub compress: bool,
    pub shard_id: u32,
    pub shard_count: u32,
    pub large_threshold: u32,
    /// Intent bitfield sent with IDENTIFY, restricting delivered event
    /// categories. `None` omits the field.
    pub intents: Option<u64>,
    /// Initial presence payload, sent verbatim inside IDENTIFY.
    pub presence: Option<Value>,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            version: DEFAULT_API_VERSION,
            compress: true,
            shard_id: 0,
            shard_count: 1,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            intents: None,
            presence: None,
        }
    }

    pub fn shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard_id = shard_id;
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn intents(mut self, intents: u64) -> Self {
        self.intents = Some(intents);
        self
    }

    pub fn presence(mut self, presence: Value) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Full connect URL including the query string the gateway expects.
    pub fn connect_url(&self) -> String {
        let mut url = format!(
            "{}/?v={}&encoding=json",
            self.gateway_url.trim_end_matches('/'),
            self.version
        );
        if self.compress {
            url.push_str("&compress=zlib-stream");
        }
        url
    }
}

/// Configuration for the rate-limited REST client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Authorization header value, including the `Bot ` or `Bearer ` prefix.
    pub token: Option<String>,
    pub base_url: String,
    /// Upper bound on retry attempts for transient failures. The backoff
    /// sequence may give up earlier.
    pub max_retries: u32,
}

impl HttpConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            base_url: DEFAULT_REST_URL.to_string(),
            max_retries: 10,
        }
    }

    /// A client with no Authorization header, for the handful of routes
    /// that take none.
    pub fn unauthenticated() -> Self {
        Self {
            token: None,
            base_url: DEFAULT_REST_URL.to_string(),
            max_retries: 10,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}
