pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;

pub use backoff::ExponentialBackoff;
pub use config::{GatewayConfig, HttpConfig};
pub use error::{CloseOutcome, GatewayError, HttpError};
pub use gateway::events::Event;
pub use gateway::{Shard, ShardHandle};
pub use http::routes::{CompiledRoute, Route};
pub use http::{RequestOptions, RestClient};
