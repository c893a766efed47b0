//! Device-side convergence rules
//!
//! Highest revision wins. Timestamps are never consulted because device
//! clocks may be skewed. A device copy of the session only accepts an
//! update whose revision is strictly newer than what it holds.

use chrono::{DateTime, Duration, Utc};

use crate::models::{Command, SessionSnapshot};

/// True if `incoming` should replace a copy at revision `held`
pub fn supersedes(incoming: u64, held: Option<u64>) -> bool {
    held.is_none_or(|held| incoming > held)
}

/// What happened to an update offered to a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Silent drop: revision not newer than the held copy
    StaleIgnored,
    /// Broadcast refused until a fresh fetch after reconnect
    AwaitingResync,
}

/// A command sent by this device and not yet confirmed by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub request_id: String,
    pub command: Command,
    pub issued_at: DateTime<Utc>,
}

/// A device's local, read-only copy of the session
#[derive(Debug, Clone)]
pub struct DeviceReplica {
    device_id: String,
    snapshot: Option<SessionSnapshot>,
    pending: Option<PendingCommand>,
    awaiting_resync: bool,
    ack_timeout: Duration,
}

impl DeviceReplica {
    pub fn new(device_id: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            snapshot: None,
            pending: None,
            awaiting_resync: false,
            ack_timeout,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn revision(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.revision)
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    pub fn is_awaiting_resync(&self) -> bool {
        self.awaiting_resync
    }

    /// Offer a pushed update
    pub fn apply_broadcast(&mut self, update: SessionSnapshot) -> ApplyOutcome {
        if self.awaiting_resync {
            return ApplyOutcome::AwaitingResync;
        }
        self.accept_if_newer(update)
    }

    /// Install the result of an explicit fetch.
    ///
    /// After a reconnect the fetched state is taken as-is; otherwise the
    /// usual revision rule applies.
    pub fn apply_fetched(&mut self, fetched: SessionSnapshot) -> ApplyOutcome {
        if self.awaiting_resync {
            self.awaiting_resync = false;
            self.pending = None;
            self.snapshot = Some(fetched);
            return ApplyOutcome::Applied;
        }
        self.accept_if_newer(fetched)
    }

    pub fn mark_issued(&mut self, request_id: impl Into<String>, command: Command, now: DateTime<Utc>) {
        self.pending = Some(PendingCommand {
            request_id: request_id.into(),
            command,
            issued_at: now,
        });
    }

    /// Hub confirmed the pending command; the state itself arrives by broadcast
    pub fn acknowledge(&mut self, request_id: &str) -> bool {
        match &self.pending {
            Some(p) if p.request_id == request_id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// The pending command went unconfirmed for too long: re-fetch instead of assuming success
    pub fn needs_refetch(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_resync
            || self
                .pending
                .as_ref()
                .is_some_and(|p| now - p.issued_at >= self.ack_timeout)
    }

    /// Missed broadcasts are never replayed, so distrust pushes until a fetch lands
    pub fn on_disconnect(&mut self) {
        self.awaiting_resync = true;
        self.pending = None;
    }

    fn accept_if_newer(&mut self, update: SessionSnapshot) -> ApplyOutcome {
        if supersedes(update.revision, self.revision()) {
            self.snapshot = Some(update);
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::StaleIgnored
        }
    }
}
