//! Liveness sweep for sessions that stopped sending heartbeats.
//!
//! Every session carries a deadline pushed forward by HEARTBEAT and DATA
//! packets. The monitor periodically closes sessions past their deadline,
//! which tears their connections down.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::session::SessionRegistry;

/// Background task closing silent sessions.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    sessions: Arc<SessionRegistry>,
    sweep_interval: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl HeartbeatMonitor {
    pub fn new(sessions: Arc<SessionRegistry>, sweep_interval: Duration) -> Self {
        Self {
            sessions,
            sweep_interval,
            stop_tx: None,
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; sweeping runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let sessions = self.sessions.clone();
        let sweep_interval = self.sweep_interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep(&sessions, Instant::now());
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("heartbeat_monitor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Close every session whose deadline has passed. Returns how many closed.
    pub fn sweep(sessions: &SessionRegistry, now: Instant) -> usize {
        let mut closed = 0;
        for session in sessions.expired(now) {
            tracing::info!(
                "session {} ({}) missed heartbeats, closing",
                session.id(),
                session.peer()
            );
            if sessions.close_session(&session) {
                closed += 1;
            }
        }
        closed
    }
}
