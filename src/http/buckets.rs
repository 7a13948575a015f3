use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::routes::CompiledRoute;

/// Bucket hash assigned to routes the server has not classified yet. The
/// first request on a template goes out optimistically under this hash
/// and its response headers teach us the real one.
pub const UNKNOWN_HASH: &str = "UNKNOWN";

struct BucketState {
    limit: u32,
    remaining: u32,
    reset_at: Instant,
}

/// One rate-limit window, shared by every route the server maps to the
/// same bucket hash + major parameters.
pub struct Bucket {
    /// False only for the UNKNOWN bucket, which admits everything.
    limited: bool,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            limited: true,
            state: Mutex::new(BucketState {
                limit: 1,
                remaining: 1,
                reset_at: Instant::now(),
            }),
        }
    }

    fn unlimited() -> Self {
        Self { limited: false, ..Self::new() }
    }

    /// Take one slot, suspending until the window resets when none are
    /// left. The decrement is pessimistic; response headers correct it.
    pub async fn acquire(&self) {
        if !self.limited {
            return;
        }
        loop {
            let reset_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now >= state.reset_at {
                    // The window expired; the next response will carry
                    // the authoritative numbers for the new one.
                    state.remaining = state.limit;
                }
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return;
                }
                state.reset_at
            };
            tracing::debug!("rate-limit bucket exhausted, waiting for window reset");
            tokio::time::sleep_until(reset_at).await;
        }
    }

    /// Overwrite the window with the authoritative header values.
    pub async fn update(&self, limit: u32, remaining: u32, reset_at: Instant) {
        let mut state = self.state.lock().await;
        state.limit = limit;
        state.remaining = remaining;
        state.reset_at = reset_at;
    }
}

/// Maps routes to their live rate-limit buckets.
///
/// Two layers: the template of a compiled route maps to the bucket hash
/// the server last assigned it, and that hash qualified by the major
/// parameters maps to the actual bucket. Buckets are corrected in place
/// as headers arrive, never destroyed.
#[derive(Default)]
pub struct BucketStore {
    hashes: DashMap<String, String>,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bucket gating `route` right now. Routes with no learned hash
    /// get a bucket that never limits.
    pub fn bucket_for(&self, route: &CompiledRoute) -> Arc<Bucket> {
        let initial = self
            .hashes
            .get(&route.template_key())
            .map(|h| h.clone())
            .unwrap_or_else(|| UNKNOWN_HASH.to_string());
        let unknown = initial == UNKNOWN_HASH;
        self.buckets
            .entry(route.bucket_key(&initial))
            .or_insert_with(|| {
                Arc::new(if unknown { Bucket::unlimited() } else { Bucket::new() })
            })
            .clone()
    }

    /// Fold one response's rate-limit headers back in: remember the hash
    /// for the template and correct the bucket it points at.
    pub async fn update(
        &self,
        route: &CompiledRoute,
        hash: &str,
        limit: u32,
        remaining: u32,
        reset_at: Instant,
    ) {
        self.hashes.insert(route.template_key(), hash.to_string());
        let bucket = self
            .buckets
            .entry(route.bucket_key(hash))
            .or_insert_with(|| Arc::new(Bucket::new()))
            .clone();
        bucket.update(limit, remaining, reset_at).await;
    }
}

/// The API-wide lock a `global: true` 429 arms. While locked, every
/// request on every route waits; all of them resume together when the
/// lock expires.
#[derive(Default)]
pub struct GlobalGate {
    locked_until: std::sync::Mutex<Option<Instant>>,
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) {
        loop {
            let until = {
                let mut locked = self.locked_until.lock().unwrap();
                match *locked {
                    Some(until) if Instant::now() < until => until,
                    _ => {
                        *locked = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(until).await;
        }
    }

    /// Arm the lock for `retry_after`. A longer existing lock wins.
    pub fn lock(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut locked = self.locked_until.lock().unwrap();
        if locked.is_none_or(|t| t < until) {
            *locked = Some(until);
        }
    }
}
