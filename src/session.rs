//! Timer session state machine
//!
//! The only legal transitions for a [`TimerSession`]:
//!
//! ```text
//! Stopped --start--> Running --pause--> Stopped
//!    any  --reset--> Stopped(Work)
//!    any  --skip---> Stopped(next in rotation)
//! Running --tick---> Running | rotation on completion
//! ```
//!
//! Every accepted transition bumps `revision` by exactly one. Nothing here
//! retries; illegal transitions come back as `SyncError::InvalidTransition`
//! and leave the session untouched.

use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};
use crate::models::{SessionType, TimerPolicy, TimerSession};

/// Coarse state derived from the session fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped(SessionType),
    Running(SessionType),
}

impl TimerSession {
    /// Fresh session: stopped, first Work block
    pub fn new(id: impl Into<String>, policy: &TimerPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            session_type: SessionType::Work,
            duration_seconds: policy.duration_for(SessionType::Work),
            elapsed_seconds: 0,
            is_running: false,
            revision: 0,
            completed_work_sessions: 0,
            updated_at_utc: now,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.is_running {
            SessionState::Running(self.session_type)
        } else {
            SessionState::Stopped(self.session_type)
        }
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.duration_seconds.saturating_sub(self.elapsed_seconds)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        match self.state() {
            SessionState::Stopped(_) => {
                self.is_running = true;
                self.bump(now);
                Ok(())
            }
            SessionState::Running(_) => Err(SyncError::InvalidTransition(
                "timer is already running".to_string(),
            )),
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        match self.state() {
            SessionState::Running(_) => {
                self.is_running = false;
                self.bump(now);
                Ok(())
            }
            SessionState::Stopped(_) => Err(SyncError::InvalidTransition(
                "timer is not running".to_string(),
            )),
        }
    }

    /// Back to a stopped Work block; restarts the rotation
    pub fn reset(&mut self, policy: &TimerPolicy, now: DateTime<Utc>) {
        self.session_type = SessionType::Work;
        self.duration_seconds = policy.duration_for(SessionType::Work);
        self.elapsed_seconds = 0;
        self.is_running = false;
        self.completed_work_sessions = 0;
        self.bump(now);
    }

    /// Advance the rotation; the timer is always left stopped
    pub fn skip(&mut self, policy: &TimerPolicy, now: DateTime<Utc>) {
        self.rotate(policy);
        self.is_running = false;
        self.bump(now);
    }

    /// Advance elapsed time while running.
    ///
    /// Returns the session type that just completed, if the tick reached the
    /// end of the current block.
    pub fn tick(
        &mut self,
        elapsed_delta_seconds: u64,
        policy: &TimerPolicy,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<SessionType>> {
        if !self.is_running {
            return Err(SyncError::InvalidTransition(
                "cannot tick a stopped timer".to_string(),
            ));
        }

        self.elapsed_seconds = self
            .elapsed_seconds
            .saturating_add(elapsed_delta_seconds)
            .min(self.duration_seconds);

        let mut completed = None;
        if self.elapsed_seconds == self.duration_seconds {
            completed = Some(self.session_type);
            self.rotate(policy);
            self.is_running = !policy.wait_for_interaction;
        }

        self.bump(now);
        Ok(completed)
    }

    /// Record a mutation of session-level data that is not a timer transition
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.bump(now);
    }

    fn rotate(&mut self, policy: &TimerPolicy) {
        let next = match self.session_type {
            SessionType::Work => {
                self.completed_work_sessions = self.completed_work_sessions.saturating_add(1);
                let frequency = policy.long_break_frequency;
                if frequency > 0 && self.completed_work_sessions % frequency == 0 {
                    SessionType::LongBreak
                } else {
                    SessionType::ShortBreak
                }
            }
            SessionType::ShortBreak | SessionType::LongBreak => SessionType::Work,
        };

        self.session_type = next;
        self.duration_seconds = policy.duration_for(next);
        self.elapsed_seconds = 0;
    }

    fn bump(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at_utc = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    fn session() -> (TimerSession, TimerPolicy) {
        let policy = TimerPolicy::default();
        (TimerSession::new("alice", &policy, now()), policy)
    }

    #[test]
    fn starts_stopped_in_work() {
        let (s, policy) = session();
        assert_eq!(s.state(), SessionState::Stopped(SessionType::Work));
        assert_eq!(s.duration_seconds, policy.work_secs);
        assert_eq!(s.revision, 0);
    }

    #[test]
    fn start_pause_cycle_bumps_revision() {
        let (mut s, _) = session();
        s.start(now()).unwrap();
        assert_eq!(s.state(), SessionState::Running(SessionType::Work));
        assert_eq!(s.revision, 1);

        s.pause(now()).unwrap();
        assert_eq!(s.state(), SessionState::Stopped(SessionType::Work));
        assert_eq!(s.revision, 2);
    }

    #[test]
    fn illegal_transitions_leave_state_untouched() {
        let (mut s, _) = session();
        let before = s.clone();
        assert!(matches!(s.pause(now()), Err(SyncError::InvalidTransition(_))));
        assert_eq!(s, before);

        s.start(now()).unwrap();
        let running = s.clone();
        assert!(matches!(s.start(now()), Err(SyncError::InvalidTransition(_))));
        assert_eq!(s, running);
    }

    #[test]
    fn pause_freezes_elapsed() {
        let (mut s, policy) = session();
        s.start(now()).unwrap();
        s.tick(90, &policy, now()).unwrap();
        s.pause(now()).unwrap();
        assert_eq!(s.elapsed_seconds, 90);
        assert!(s.tick(10, &policy, now()).is_err());
        assert_eq!(s.elapsed_seconds, 90);
    }

    #[test]
    fn reset_is_idempotent_apart_from_revision() {
        let (mut s, policy) = session();
        s.skip(&policy, now());
        s.start(now()).unwrap();
        s.tick(30, &policy, now()).unwrap();

        s.reset(&policy, now());
        let once = s.clone();
        s.reset(&policy, now());

        assert_eq!(s.session_type, once.session_type);
        assert_eq!(s.elapsed_seconds, once.elapsed_seconds);
        assert_eq!(s.is_running, once.is_running);
        assert_eq!(s.session_type, SessionType::Work);
        assert_eq!(s.elapsed_seconds, 0);
        assert!(!s.is_running);
        assert_eq!(s.revision, once.revision + 1);
    }

    #[test]
    fn skip_rotation_with_long_break_every_fourth() {
        let (mut s, policy) = session();
        assert_eq!(policy.long_break_frequency, 4);

        let observed: Vec<SessionType> = (0..11)
            .map(|_| {
                s.skip(&policy, now());
                s.session_type
            })
            .collect();

        use SessionType::*;
        assert_eq!(
            observed,
            vec![
                ShortBreak, Work, ShortBreak, Work, ShortBreak, Work, LongBreak, Work, ShortBreak,
                Work, ShortBreak
            ]
        );
    }

    #[test]
    fn skip_always_stops() {
        let (mut s, policy) = session();
        s.start(now()).unwrap();
        s.tick(10, &policy, now()).unwrap();
        s.skip(&policy, now());
        assert!(!s.is_running);
        assert_eq!(s.elapsed_seconds, 0);
        assert_eq!(s.duration_seconds, policy.short_break_secs);
    }

    #[test]
    fn tick_caps_and_rolls_over() {
        let (mut s, policy) = session();
        s.start(now()).unwrap();
        let rev = s.revision;

        let completed = s.tick(policy.work_secs + 500, &policy, now()).unwrap();
        assert_eq!(completed, Some(SessionType::Work));
        assert_eq!(s.session_type, SessionType::ShortBreak);
        assert_eq!(s.elapsed_seconds, 0);
        assert!(s.is_running);
        assert_eq!(s.revision, rev + 1);
    }

    #[test]
    fn tick_waits_for_interaction_when_configured() {
        let policy = TimerPolicy {
            wait_for_interaction: true,
            ..Default::default()
        };
        let mut s = TimerSession::new("bob", &policy, now());
        s.start(now()).unwrap();
        s.tick(policy.work_secs, &policy, now()).unwrap();
        assert_eq!(s.state(), SessionState::Stopped(SessionType::ShortBreak));
    }

    #[test]
    fn partial_tick_does_not_complete() {
        let (mut s, policy) = session();
        s.start(now()).unwrap();
        assert_eq!(s.tick(60, &policy, now()).unwrap(), None);
        assert_eq!(s.remaining_seconds(), policy.work_secs - 60);
    }
}
