//! Server metrics for observability
//!
//! Counters are plain atomics bumped from session tasks; `snapshot()` gives a
//! serializable view for logs or a status endpoint.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Session metrics
    /// Currently open sessions
    pub active_sessions: AtomicU64,
    /// Sessions opened since server start
    pub total_sessions: AtomicU64,
    /// Joins refused by the authenticator
    pub auth_failures: AtomicU64,

    // Command metrics
    pub commands_received: AtomicU64,
    pub commands_sent: AtomicU64,

    // Change arbitration
    pub changes_accepted: AtomicU64,
    pub changes_rejected: AtomicU64,

    // Forced closes
    /// Sessions closed for missing heartbeats
    pub liveness_disconnects: AtomicU64,
    /// Sessions closed because their outbound queue was full
    pub backpressure_closes: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn change_accepted(&self) {
        self.changes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn change_rejected(&self) {
        self.changes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn liveness_disconnect(&self) {
        self.liveness_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_close(&self) {
        self.backpressure_closes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total: self.total_sessions.load(Ordering::Relaxed),
                auth_failures: self.auth_failures.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                sent: self.commands_sent.load(Ordering::Relaxed),
            },
            changes: ChangeMetrics {
                accepted: self.changes_accepted.load(Ordering::Relaxed),
                rejected: self.changes_rejected.load(Ordering::Relaxed),
            },
            disconnects: DisconnectMetrics {
                liveness: self.liveness_disconnects.load(Ordering::Relaxed),
                backpressure: self.backpressure_closes.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub commands: CommandMetrics,
    pub changes: ChangeMetrics,
    pub disconnects: DisconnectMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total: u64,
    pub auth_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMetrics {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectMetrics {
    pub liveness: u64,
    pub backpressure: u64,
}
