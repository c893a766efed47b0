//! Connected device registry
//!
//! Tracks live devices for one session and fans out state updates. Delivery
//! is fire-and-forget: each device gets a bounded channel and a full or
//! closed channel simply misses the update. Devices resynchronise with a
//! fresh fetch when they reconnect.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

use crate::conflict;
use crate::models::{DeviceConnection, SessionSnapshot};

pub type UpdateReceiver = mpsc::Receiver<SessionSnapshot>;

struct DeviceEntry {
    connection: DeviceConnection,
    sender: mpsc::Sender<SessionSnapshot>,
    generation: u64,
}

/// A registration handed to the connection task
pub struct DeviceLease {
    pub connection: DeviceConnection,
    pub updates: UpdateReceiver,
    /// Identifies this registration when the same device id reconnects
    pub generation: u64,
}

/// Live devices keyed by device id
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    next_generation: std::sync::atomic::AtomicU64,
    channel_capacity: usize,
}

impl DeviceRegistry {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Register a device, replacing any previous registration with the same id
    pub async fn register(&self, device_id: &str, now: DateTime<Utc>) -> DeviceLease {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let connection = DeviceConnection {
            device_id: device_id.to_string(),
            connected_at_utc: now,
            last_seen_at_utc: now,
            last_delivered_revision: 0,
        };

        let replaced = self.devices.write().await.insert(
            device_id.to_string(),
            DeviceEntry {
                connection: connection.clone(),
                sender: tx,
                generation,
            },
        );

        if replaced.is_some() {
            tracing::debug!(device_id, "Replaced existing device registration");
        }

        DeviceLease {
            connection,
            updates: rx,
            generation,
        }
    }

    pub async fn unregister(&self, device_id: &str) -> bool {
        self.devices.write().await.remove(device_id).is_some()
    }

    /// Unregister only if `generation` is still the current registration
    pub async fn release(&self, device_id: &str, generation: u64) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get(device_id) {
            Some(entry) if entry.generation == generation => {
                devices.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Record traffic from a device
    pub async fn touch(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        match self.devices.write().await.get_mut(device_id) {
            Some(entry) => {
                entry.connection.last_seen_at_utc = now;
                true
            }
            None => false,
        }
    }

    /// Push a snapshot to every device that has not seen this revision yet.
    ///
    /// Never waits on a device. Returns the number of devices the update was
    /// queued for.
    pub async fn broadcast(&self, snapshot: &SessionSnapshot) -> usize {
        let mut devices = self.devices.write().await;
        let mut delivered = 0;

        for (device_id, entry) in devices.iter_mut() {
            if !conflict::supersedes(
                snapshot.revision,
                Some(entry.connection.last_delivered_revision),
            ) {
                continue;
            }

            match entry.sender.try_send(snapshot.clone()) {
                Ok(()) => {
                    entry.connection.last_delivered_revision = snapshot.revision;
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(device_id = %device_id, revision = snapshot.revision, "Device lagging, update dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(device_id = %device_id, "Device channel closed");
                }
            }
        }

        delivered
    }

    /// Remove devices with no traffic within `idle`; returns their ids
    pub async fn sweep_idle(&self, now: DateTime<Utc>, idle: Duration) -> Vec<String> {
        let mut devices = self.devices.write().await;
        let stale: Vec<String> = devices
            .iter()
            .filter(|(_, entry)| now - entry.connection.last_seen_at_utc > idle)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            devices.remove(id);
        }

        stale
    }

    pub async fn connection(&self, device_id: &str) -> Option<DeviceConnection> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.connection.clone())
    }

    pub async fn connections(&self) -> Vec<DeviceConnection> {
        self.devices
            .read()
            .await
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Drop every registration; connection tasks see their channel close
    pub async fn clear(&self) -> usize {
        let mut devices = self.devices.write().await;
        let count = devices.len();
        devices.clear();
        count
    }
}
