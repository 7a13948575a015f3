use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::events;
use super::session::Session;

/// Why the heartbeat task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// A heartbeat went unacknowledged for a full interval. The connection
    /// must be torn down locally without waiting on the transport.
    Zombie,
    /// The connection is shutting down normally.
    Stopped,
}

/// Heartbeat keep-alive loop, spawned per connection and owned by it.
///
/// Every `interval` this checks the shared session for a missing ACK and
/// then queues a HEARTBEAT through the outbound channel, so the send goes
/// through the same limiter-gated path as every other command.
pub async fn run(
    session: Arc<Mutex<Session>>,
    interval: Duration,
    out_tx: mpsc::UnboundedSender<Value>,
    mut shutdown: watch::Receiver<bool>,
) -> HeartbeatOutcome {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return HeartbeatOutcome::Stopped,
        }

        let seq = {
            let mut session = session.lock().unwrap();
            if session.is_zombie() {
                tracing::warn!(
                    shard_id = session.shard_id,
                    "no HEARTBEAT_ACK since last heartbeat, connection is a zombie"
                );
                return HeartbeatOutcome::Zombie;
            }
            session.record_heartbeat_sent();
            session.sequence
        };

        tracing::debug!(?seq, "sending HEARTBEAT");
        if out_tx.send(events::heartbeat(seq)).is_err() {
            // Receive loop is gone; nothing left to keep alive.
            return HeartbeatOutcome::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_tick_at_interval() {
        let session = Arc::new(Mutex::new(Session::new(0, 1)));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            session.clone(),
            Duration::from_secs(10),
            out_tx,
            shutdown_rx,
        ));

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first["op"], events::opcode::HEARTBEAT);
        // Ack it so the next tick does not see a zombie.
        session.lock().unwrap().record_heartbeat_ack();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(second["op"], events::opcode::HEARTBEAT);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_reports_zombie() {
        let session = Arc::new(Mutex::new(Session::new(0, 1)));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            session.clone(),
            Duration::from_secs(10),
            out_tx,
            shutdown_rx,
        ));

        // First heartbeat goes out; never acknowledge it.
        let _ = out_rx.recv().await.unwrap();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Zombie);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_loop() {
        let session = Arc::new(Mutex::new(Session::new(0, 1)));
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            session,
            Duration::from_secs(3600),
            out_tx,
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), HeartbeatOutcome::Stopped);
    }
}
