//! Synchronization hub
//!
//! One actor task per session owns the authoritative [`TimerSession`] and
//! counter. Devices, the ticker and the reset scheduler all reach it through
//! the same bounded request channel, so mutations are applied strictly one
//! at a time in arrival order. Every accepted mutation is broadcast to the
//! session's [`DeviceRegistry`], issuer included.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::clock::SharedClock;
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Command, CommandOutcome, MAX_DAILY_COUNT, ResetConfiguration, SessionCounterState,
    SessionResetEvent, SessionSnapshot, SessionType, TimerPolicy, TimerSession, TriggerKind,
};
use crate::notify::{NotificationKind, Notifier};
use crate::registry::DeviceRegistry;
use crate::scheduler::{self, ScheduledResetTask};

/// Tunables shared by every hub
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub policy: TimerPolicy,
    pub default_reset: ResetConfiguration,
    /// How long a caller waits for its own command to be confirmed
    pub ack_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// None disables the background ticker (tests drive ticks by hand)
    pub tick_interval: Option<Duration>,
    pub request_capacity: usize,
    pub device_channel_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            policy: TimerPolicy::default(),
            default_reset: ResetConfiguration::default(),
            ack_timeout: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(30),
            tick_interval: Some(Duration::from_secs(1)),
            request_capacity: 64,
            device_channel_capacity: 32,
        }
    }
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum HubRequest {
    Command {
        command: Command,
        device_id: String,
        reply: Reply<CommandOutcome>,
    },
    Tick {
        delta_secs: u64,
        reply: Reply<CommandOutcome>,
    },
    ScheduledReset {
        reply: Reply<CommandOutcome>,
    },
    Fetch {
        reply: Reply<SessionSnapshot>,
    },
    Checkpoint {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a session's hub; cheap to clone
#[derive(Clone)]
pub struct HubHandle {
    session_id: Arc<str>,
    tx: mpsc::Sender<HubRequest>,
    registry: Arc<DeviceRegistry>,
    ack_timeout: Duration,
}

impl HubHandle {
    /// Start the actor for a session, seeded from a checkpoint if one exists
    pub fn spawn(
        session_id: &str,
        seed: Option<SessionSnapshot>,
        settings: &HubSettings,
        clock: SharedClock,
        store: Arc<Database>,
        notifier: Notifier,
    ) -> Self {
        let now = clock.now();
        let registry = Arc::new(DeviceRegistry::new(settings.device_channel_capacity));

        let (timer, counter, reset_config, stored_target) = match seed {
            Some(snapshot) => (
                snapshot.timer,
                snapshot.counter,
                snapshot.reset_config,
                snapshot.next_reset_utc,
            ),
            None => (
                TimerSession::new(session_id, &settings.policy, now),
                SessionCounterState::default(),
                settings.default_reset.clone(),
                None,
            ),
        };

        let (reset_config, schedule) = match ScheduledResetTask::plan(&reset_config, now) {
            // A target that passed while the server was down still fires once.
            Ok(schedule) => match stored_target {
                Some(target)
                    if reset_config.enabled
                        && target <= now
                        && counter.last_reset_utc.is_none_or(|last| last < target) =>
                (
                    reset_config,
                    ScheduledResetTask {
                        next_fire_utc: Some(target),
                    },
                ),
                _ => (reset_config, schedule),
            },
            Err(e) => {
                tracing::warn!(
                    session_id,
                    error = %e,
                    "Stored reset configuration unusable, falling back to default"
                );
                let fallback = settings.default_reset.clone();
                let schedule = ScheduledResetTask::plan(&fallback, now).unwrap_or_default();
                (fallback, schedule)
            }
        };

        let actor = HubActor {
            session_id: session_id.to_string(),
            timer,
            counter,
            reset_config,
            schedule,
            policy: settings.policy.clone(),
            clock,
            registry: registry.clone(),
            store,
            notifier,
            dirty: false,
            unrecorded: Vec::new(),
        };

        let (tx, rx) = mpsc::channel(settings.request_capacity.max(1));
        tokio::spawn(actor.run(rx, settings.checkpoint_interval));

        Self {
            session_id: Arc::from(session_id),
            tx,
            registry,
            ack_timeout: settings.ack_timeout,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Submit a control command on behalf of a device
    pub async fn submit(&self, command: Command, device_id: &str) -> SyncResult<CommandOutcome> {
        let device_id = device_id.to_string();
        self.request(|reply| HubRequest::Command {
            command,
            device_id,
            reply,
        })
        .await
    }

    /// Advance a running timer by `delta_secs`
    pub async fn tick(&self, delta_secs: u64) -> SyncResult<CommandOutcome> {
        self.request(|reply| HubRequest::Tick { delta_secs, reply }).await
    }

    /// Fire the daily reset if the hub's own schedule says it is due
    pub async fn fire_scheduled_reset(&self) -> SyncResult<CommandOutcome> {
        self.request(|reply| HubRequest::ScheduledReset { reply }).await
    }

    /// Current authoritative state (resync pull)
    pub async fn fetch(&self) -> SyncResult<SessionSnapshot> {
        self.request(|reply| HubRequest::Fetch { reply }).await
    }

    /// Persist now, regardless of the checkpoint interval
    pub async fn checkpoint(&self) -> SyncResult<()> {
        self.request(|reply| HubRequest::Checkpoint { reply }).await
    }

    /// Checkpoint and stop the actor; registered devices are dropped
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HubRequest::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.registry.clear().await;
    }

    /// Send a request and wait (bounded) for the actor's answer.
    ///
    /// Timing out only abandons the wait; the actor still applies the request.
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HubRequest,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        let wait = async {
            self.tx
                .send(build(reply))
                .await
                .map_err(|_| SyncError::HubUnavailable)?;
            rx.await.map_err(|_| SyncError::HubUnavailable)?
        };

        match tokio::time::timeout(self.ack_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::AckTimeout(self.ack_timeout.as_secs())),
        }
    }
}

struct HubActor {
    session_id: String,
    timer: TimerSession,
    counter: SessionCounterState,
    reset_config: ResetConfiguration,
    schedule: ScheduledResetTask,
    policy: TimerPolicy,
    clock: SharedClock,
    registry: Arc<DeviceRegistry>,
    store: Arc<Database>,
    notifier: Notifier,
    /// Accepted mutations since the last checkpoint
    dirty: bool,
    /// Reset events the store has not accepted yet, oldest first
    unrecorded: Vec<SessionResetEvent>,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::Receiver<HubRequest>, checkpoint_every: Duration) {
        let mut checkpoint = tokio::time::interval(checkpoint_every);
        checkpoint.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::debug!(session_id = %self.session_id, revision = self.timer.revision, "Hub started");

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        if !self.handle(request).await {
                            break;
                        }
                    }
                    None => {
                        self.persist_if_dirty();
                        break;
                    }
                },
                _ = checkpoint.tick() => self.persist_if_dirty(),
            }
        }

        tracing::debug!(session_id = %self.session_id, "Hub stopped");
    }

    /// Returns false once the hub should stop
    async fn handle(&mut self, request: HubRequest) -> bool {
        // A dropped reply receiver means the caller gave up waiting; the
        // mutation stands either way.
        match request {
            HubRequest::Command {
                command,
                device_id,
                reply,
            } => {
                let result = self.apply_command(command, &device_id).await;
                let _ = reply.send(result);
            }
            HubRequest::Tick { delta_secs, reply } => {
                let result = self.apply_tick(delta_secs).await;
                let _ = reply.send(result);
            }
            HubRequest::ScheduledReset { reply } => {
                let result = self.apply_scheduled_reset().await;
                let _ = reply.send(result);
            }
            HubRequest::Fetch { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            HubRequest::Checkpoint { reply } => {
                let result = self.persist().map_err(SyncError::from);
                let _ = reply.send(result);
            }
            HubRequest::Shutdown { reply } => {
                self.persist_if_dirty();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn apply_command(&mut self, command: Command, device_id: &str) -> SyncResult<CommandOutcome> {
        let now = self.clock.now();
        let name = command.name();

        let result = match command {
            Command::Start => tolerate_invalid_transition(self.timer.start(now)),
            Command::Pause => tolerate_invalid_transition(self.timer.pause(now)),
            Command::Reset => {
                self.timer.reset(&self.policy, now);
                Ok(true)
            }
            Command::Skip => {
                self.timer.skip(&self.policy, now);
                Ok(true)
            }
            Command::SetCount { count } => self.set_count(count, now),
            Command::ResetCount => self.reset_counter(TriggerKind::Manual, now).map(|_| true),
            Command::ConfigureReset {
                timezone,
                reset_time,
                enabled,
            } => self.configure_reset(timezone, &reset_time, enabled, now),
        };

        match result {
            Ok(applied) => {
                let outcome = self.finish(applied).await;
                tracing::info!(
                    session_id = %self.session_id,
                    device_id,
                    command = name,
                    applied,
                    revision = outcome.snapshot.revision,
                    "Command processed"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::info!(
                    session_id = %self.session_id,
                    device_id,
                    command = name,
                    error = %e,
                    "Command rejected"
                );
                Err(e)
            }
        }
    }

    async fn apply_tick(&mut self, delta_secs: u64) -> SyncResult<CommandOutcome> {
        let now = self.clock.now();
        let completed = self.timer.tick(delta_secs, &self.policy, now)?;

        if let Some(kind) = completed {
            if kind == SessionType::Work {
                self.counter.today_count = (self.counter.today_count + 1).min(MAX_DAILY_COUNT);
                if let Some(n) = self.counter.manual_override.as_mut() {
                    *n = (*n + 1).min(MAX_DAILY_COUNT);
                }
            }
            self.notifier
                .publish(NotificationKind::SessionCompleted, &self.session_id, now);
            tracing::info!(
                session_id = %self.session_id,
                completed = ?kind,
                next = ?self.timer.session_type,
                "Timer block completed"
            );
        }

        Ok(self.finish(true).await)
    }

    async fn apply_scheduled_reset(&mut self) -> SyncResult<CommandOutcome> {
        let now = self.clock.now();

        // Re-check inside the serialized path: a second request for the same
        // window finds last_reset already past the target.
        if !self.schedule.is_due(now, self.counter.last_reset_utc) {
            return Ok(self.finish(false).await);
        }

        if let Some(target) = self.schedule.next_fire_utc
            && now - target > chrono::Duration::minutes(5)
        {
            tracing::warn!(
                session_id = %self.session_id,
                target = %target,
                now = %now,
                "Reset window missed, firing once now"
            );
        }

        self.reset_counter(TriggerKind::Scheduled, now)?;
        Ok(self.finish(true).await)
    }

    fn set_count(&mut self, count: i64, now: DateTime<Utc>) -> SyncResult<bool> {
        let count = u32::try_from(count)
            .ok()
            .filter(|n| *n <= MAX_DAILY_COUNT)
            .ok_or_else(|| {
                SyncError::InvalidInput(format!("count must be 0-{}, got {}", MAX_DAILY_COUNT, count))
            })?;

        self.counter.manual_override = Some(count);
        self.counter.today_count = count;
        self.timer.touch(now);
        Ok(true)
    }

    /// Clear the counter and override together, record the audit event, replan
    fn reset_counter(&mut self, trigger: TriggerKind, now: DateTime<Utc>) -> SyncResult<()> {
        let schedule = ScheduledResetTask::plan(&self.reset_config, now)?;
        let previous_count = self.counter.displayed_count();

        self.counter.today_count = 0;
        self.counter.manual_override = None;
        self.counter.last_reset_utc = Some(now);
        self.schedule = schedule;
        self.timer.touch(now);

        let event = SessionResetEvent {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            previous_count,
            new_count: 0,
            fired_at_utc: now,
            trigger_kind: trigger,
        };
        self.unrecorded.push(event);
        self.record_reset_events();

        self.notifier
            .publish(NotificationKind::CounterReset, &self.session_id, now);
        tracing::info!(
            session_id = %self.session_id,
            trigger = trigger.as_str(),
            previous_count,
            next_reset = ?self.schedule.next_fire_utc,
            "Counter reset"
        );
        Ok(())
    }

    fn configure_reset(
        &mut self,
        timezone: String,
        reset_time: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> SyncResult<bool> {
        let config = ResetConfiguration {
            timezone,
            reset_time: reset_time.parse()?,
            enabled,
        };
        let schedule = ScheduledResetTask::plan(&config, now)?;

        if config == self.reset_config {
            return Ok(false);
        }

        let re_enabled = config.enabled && !self.reset_config.enabled;
        self.reset_config = config;
        self.schedule = schedule;
        self.timer.touch(now);

        // While disabled a day boundary may have passed without a reset.
        if re_enabled
            && let Some(last) = self.counter.last_reset_utc
            && last < scheduler::previous_fire(&self.reset_config, now)?
        {
            self.reset_counter(TriggerKind::ConfigChange, now)?;
        }

        Ok(true)
    }

    async fn finish(&mut self, applied: bool) -> CommandOutcome {
        let snapshot = self.snapshot();
        if applied {
            self.dirty = true;
            let delivered = self.registry.broadcast(&snapshot).await;
            tracing::debug!(
                session_id = %self.session_id,
                revision = snapshot.revision,
                delivered,
                "State broadcast"
            );
        }
        CommandOutcome { snapshot, applied }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            timer: self.timer.clone(),
            counter: self.counter.clone(),
            reset_config: self.reset_config.clone(),
            next_reset_utc: self.schedule.next_fire_utc,
            revision: self.timer.revision,
        }
    }

    /// Append queued reset events in order, stopping at the first failure
    fn record_reset_events(&mut self) {
        while let Some(event) = self.unrecorded.first() {
            if let Err(e) = self.store.append_reset_event(event) {
                tracing::error!(
                    session_id = %self.session_id,
                    pending = self.unrecorded.len(),
                    error = %e,
                    "Failed to record reset event, retrying at next checkpoint"
                );
                return;
            }
            self.unrecorded.remove(0);
        }
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        self.record_reset_events();
        self.store.save(&self.session_id, &self.snapshot())?;
        // Stay dirty so the checkpoint timer keeps retrying the audit log.
        self.dirty = !self.unrecorded.is_empty();
        Ok(())
    }

    fn persist_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        match self.persist() {
            Ok(()) => {
                tracing::debug!(session_id = %self.session_id, revision = self.timer.revision, "Checkpoint saved");
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Checkpoint failed");
            }
        }
    }
}

/// Multi-device races make Start/Pause collisions normal; report them as no-ops
fn tolerate_invalid_transition(result: SyncResult<()>) -> SyncResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(SyncError::InvalidTransition(reason)) => {
            tracing::debug!(reason = %reason, "Ignoring redundant transition");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Directory of live hubs, one per session id
pub struct Hubs {
    hubs: RwLock<HashMap<String, HubHandle>>,
    settings: HubSettings,
    clock: SharedClock,
    store: Arc<Database>,
    notifier: Notifier,
}

impl Hubs {
    pub fn new(settings: HubSettings, clock: SharedClock, store: Arc<Database>, notifier: Notifier) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            settings,
            clock,
            store,
            notifier,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Hub for a session, created (and seeded from the store) on first use
    pub async fn get_or_create(&self, session_id: &str) -> SyncResult<HubHandle> {
        if let Some(hub) = self.hubs.read().await.get(session_id) {
            return Ok(hub.clone());
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(session_id) {
            return Ok(hub.clone());
        }

        let seed = self.store.load(session_id)?;
        let resumed = seed.is_some();
        let hub = HubHandle::spawn(
            session_id,
            seed,
            &self.settings,
            self.clock.clone(),
            self.store.clone(),
            self.notifier.clone(),
        );

        if let Some(interval) = self.settings.tick_interval {
            start_ticker(hub.clone(), self.clock.clone(), interval);
        }

        tracing::info!(session_id, resumed, "Session hub created");
        hubs.insert(session_id.to_string(), hub.clone());
        Ok(hub)
    }

    /// Start a hub for every checkpointed session so their resets are scheduled
    /// without waiting for a device to reconnect
    pub async fn restore_all(&self) -> SyncResult<usize> {
        let ids = self.store.list_session_ids()?;
        for id in &ids {
            self.get_or_create(id).await?;
        }
        tracing::info!(count = ids.len(), "Restored session hubs");
        Ok(ids.len())
    }

    pub async fn all(&self) -> Vec<HubHandle> {
        self.hubs.read().await.values().cloned().collect()
    }

    /// Unregister devices idle longer than `idle` across every session
    pub async fn sweep_idle(&self, idle: chrono::Duration) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for hub in self.all().await {
            let stale = hub.registry().sweep_idle(now, idle).await;
            for device_id in &stale {
                tracing::info!(session_id = %hub.session_id(), device_id = %device_id, "Idle device unregistered");
            }
            removed += stale.len();
        }
        removed
    }

    /// Checkpoint and stop every hub
    pub async fn shutdown_all(&self) {
        let hubs: Vec<HubHandle> = self.hubs.write().await.drain().map(|(_, h)| h).collect();
        let count = hubs.len();
        for hub in hubs {
            hub.shutdown().await;
        }
        tracing::info!(count, "All session hubs stopped");
    }
}

/// Feed wall-clock progress into a hub as Tick requests.
///
/// Ticks on a stopped timer are rejected by the state machine and ignored
/// here; the task ends once the hub is gone.
pub fn start_ticker(
    hub: HubHandle,
    clock: SharedClock,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = clock.now();

        loop {
            ticker.tick().await;
            let now = clock.now();
            let delta = (now - last).num_seconds();
            if delta < 1 {
                continue;
            }
            last += chrono::Duration::seconds(delta);

            match hub.tick(delta as u64).await {
                Ok(_) | Err(SyncError::InvalidTransition(_)) => {}
                Err(SyncError::HubUnavailable) => break,
                Err(e) => {
                    tracing::warn!(session_id = %hub.session_id(), error = %e, "Tick failed");
                }
            }
        }
    })
}

/// Periodically evict devices with no traffic inside the idle window
pub fn start_sweeper(
    hubs: Arc<Hubs>,
    interval: Duration,
    idle: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let removed = hubs.sweep_idle(idle).await;
            if removed > 0 {
                tracing::debug!(removed, "Liveness sweep");
            }
        }
    })
}
