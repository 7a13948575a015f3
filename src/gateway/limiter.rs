use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Commands allowed per window on one gateway connection.
pub const COMMANDS_PER_WINDOW: u32 = 120;
pub const WINDOW: Duration = Duration::from_secs(60);

struct State {
    remaining: u32,
    reset_at: Instant,
}

/// Windowed limiter for outbound gateway commands (120/60s). Exhausted
/// acquires queue until the window rolls over; nothing is dropped.
pub struct CommandLimiter {
    limit: u32,
    period: Duration,
    state: Mutex<State>,
}

impl CommandLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            state: Mutex::new(State {
                remaining: limit,
                reset_at: Instant::now() + period,
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let reset_at = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                if now >= state.reset_at {
                    state.remaining = self.limit;
                    state.reset_at = now + self.period;
                }
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return;
                }
                state.reset_at
            };
            tracing::warn!("gateway command limit reached, queueing until window reset");
            tokio::time::sleep_until(reset_at).await;
        }
    }
}

impl Default for CommandLimiter {
    fn default() -> Self {
        Self::new(COMMANDS_PER_WINDOW, WINDOW)
    }
}
