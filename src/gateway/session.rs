use std::time::Duration;

use tokio::time::Instant;

/// State for one gateway session, shared between the receive loop and the
/// heartbeat task. `session_id` and `sequence` survive reconnects so the
/// next connection can RESUME; everything else is per-connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    pub shard_id: u32,
    pub shard_count: u32,
    pub heartbeat_interval: Duration,
    pub last_heartbeat_sent: Instant,
    pub last_heartbeat_ack: Instant,
    /// Round-trip of the most recent HEARTBEAT/ACK pair.
    pub heartbeat_latency: Option<Duration>,
}

impl Session {
    pub fn new(shard_id: u32, shard_count: u32) -> Self {
        let now = Instant::now();
        Self {
            session_id: None,
            sequence: None,
            shard_id,
            shard_count,
            heartbeat_interval: Duration::ZERO,
            last_heartbeat_sent: now,
            last_heartbeat_ack: now,
            heartbeat_latency: None,
        }
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget the session entirely. Used when the server signals a
    /// non-resumable invalidation.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
    }

    pub fn record_heartbeat_sent(&mut self) {
        self.last_heartbeat_sent = Instant::now();
    }

    pub fn record_heartbeat_ack(&mut self) {
        self.last_heartbeat_ack = Instant::now();
        self.heartbeat_latency = Some(self.last_heartbeat_ack - self.last_heartbeat_sent);
    }

    /// A heartbeat was sent but no ACK has arrived since. Checked right
    /// before each scheduled heartbeat; true means the connection is a
    /// zombie and must be torn down locally.
    pub fn is_zombie(&self) -> bool {
        self.last_heartbeat_ack < self.last_heartbeat_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_is_not_zombie() {
        let session = Session::new(0, 1);
        assert!(!session.is_zombie());
        assert!(!session.can_resume());
    }

    #[test]
    fn test_unacked_heartbeat_marks_zombie() {
        let mut session = Session::new(0, 1);
        session.record_heartbeat_sent();
        assert!(session.is_zombie());
        session.record_heartbeat_ack();
        assert!(!session.is_zombie());
        assert!(session.heartbeat_latency.is_some());
    }

    #[test]
    fn test_invalidate_clears_resume_state() {
        let mut session = Session::new(0, 1);
        session.session_id = Some("sess".into());
        session.sequence = Some(10);
        assert!(session.can_resume());
        session.invalidate();
        assert!(!session.can_resume());
        assert_eq!(session.sequence, None);
    }
}
