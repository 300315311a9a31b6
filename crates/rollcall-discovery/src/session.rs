//! In-memory registry of discovery sessions
//!
//! One orchestrator task owns each session and is its only writer; pollers
//! and cancel requests go through the same lock. The map itself is never
//! handed out, only clones of individual sessions.

use chrono::{DateTime, Utc};
use rollcall_core::DeviceRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// How long finished sessions stay readable
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(300);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Scanning,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Which sweep a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Every address in range is probed
    Static,
    /// Cached devices in range are emitted first, the rest probed
    Dhcp,
}

/// Snapshot of one discovery run
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySession {
    pub id: String,
    pub mode: ScanMode,
    pub status: SessionStatus,
    /// 0-100
    pub progress: u8,
    /// Addresses to probe over the network
    pub total: usize,
    /// Addresses probed so far
    pub current: usize,
    /// Copies of the devices found so far; treat as a set keyed by MAC
    pub found_devices: Vec<DeviceRecord>,
    pub cancelled: bool,
    pub message: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DiscoverySession {
    fn new(id: String, mode: ScanMode) -> Self {
        Self {
            id,
            mode,
            status: SessionStatus::Initializing,
            progress: 0,
            total: 0,
            current: 0,
            found_devices: Vec::new(),
            cancelled: false,
            message: "Initializing discovery".to_string(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

struct TrackedSession {
    session: DiscoverySession,
    finished: Option<Instant>,
}

/// Lock-guarded session store
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, TrackedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session in `initializing` and return its id
    pub fn create_session(&self, mode: ScanMode) -> String {
        let id = Uuid::new_v4().to_string();
        let tracked = TrackedSession {
            session: DiscoverySession::new(id.clone(), mode),
            finished: None,
        };
        self.lock().insert(id.clone(), tracked);
        debug!(session = %id, mode = ?mode, "Created discovery session");
        id
    }

    /// Copy of the session's current state
    pub fn get(&self, id: &str) -> Option<DiscoverySession> {
        self.lock().get(id).map(|t| t.session.clone())
    }

    /// Apply `mutate` to the session under the lock.
    ///
    /// Terminal sessions are frozen: the mutation is skipped and `false`
    /// returned, as it is for unknown ids. Reaching a terminal status stamps
    /// `finished_at` and starts the retention clock.
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut DiscoverySession),
    {
        let mut sessions = self.lock();
        let Some(tracked) = sessions.get_mut(id) else {
            return false;
        };
        if tracked.session.status.is_terminal() {
            return false;
        }

        mutate(&mut tracked.session);
        tracked.session.progress = tracked.session.progress.min(100);

        if tracked.session.status.is_terminal() && tracked.finished.is_none() {
            tracked.finished = Some(Instant::now());
            tracked.session.finished_at = Some(Utc::now());
            info!(
                session = %id,
                status = ?tracked.session.status,
                found = tracked.session.found_devices.len(),
                "Discovery session finished"
            );
        }
        true
    }

    /// Request cancellation. Returns `false` for unknown ids; a finished
    /// session is acknowledged without change.
    pub fn cancel(&self, id: &str) -> bool {
        let mut sessions = self.lock();
        let Some(tracked) = sessions.get_mut(id) else {
            return false;
        };
        if !tracked.session.status.is_terminal() && !tracked.session.cancelled {
            tracked.session.cancelled = true;
            tracked.session.message = "Cancellation requested".to_string();
            info!(session = %id, "Discovery cancellation requested");
        }
        true
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.lock().get(id).map(|t| t.session.cancelled).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop finished sessions older than `retention`
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, tracked| match tracked.finished {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
        before - sessions.len()
    }

    /// Periodically purge expired sessions in the background
    pub fn spawn_reaper(self: &Arc<Self>, retention: Duration, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let purged = registry.purge_expired(retention);
                if purged > 0 {
                    debug!(purged, remaining = registry.len(), "Purged expired discovery sessions");
                }
            }
        })
    }
}
