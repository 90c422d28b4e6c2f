use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One contiguous stretch of foreground time owned by a single executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSession {
    #[serde(rename = "app_name")]
    pub title: String,
    #[serde(rename = "exe_path")]
    pub executable_path: String,
    #[serde(rename = "time_start")]
    pub start: i64,
    #[serde(rename = "time_end")]
    pub end: i64,
}

impl UsageSession {
    pub fn new(title: &str, executable_path: &str, now: i64) -> Self {
        Self {
            title: title.to_string(),
            executable_path: executable_path.to_string(),
            start: now,
            end: now,
        }
    }

    pub fn duration_secs(&self) -> i64 {
        self.end - self.start
    }

    fn extend_to(&mut self, now: i64) {
        self.end = self.end.max(now);
    }
}

/// What a detach does to the "last observed executable" marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityPolicy {
    /// Saves are invisible to session merging: the next tick on the same
    /// executable resumes from where the detached session ended.
    #[default]
    Preserve,
    /// Every save is a session break.
    Reset,
}

impl ContinuityPolicy {
    pub fn label(self) -> &'static str {
        match self {
            Self::Preserve => "preserve",
            Self::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone)]
struct Resume {
    title: String,
    from: i64,
}

/// Idle / tracking state machine over foreground observations.
///
/// Only the trailing session is ever mutated; everything before it is closed.
#[derive(Debug, Default)]
pub struct SessionAggregator {
    sessions: Vec<UsageSession>,
    last_executable: String,
    resume: Option<Resume>,
    policy: ContinuityPolicy,
}

impl SessionAggregator {
    pub fn new(policy: ContinuityPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn tick(&mut self, now: i64, title: &str, executable_path: &str) {
        if executable_path.is_empty() {
            if !self.last_executable.is_empty()
                && let Some(trailing) = self.sessions.last_mut()
            {
                trailing.extend_to(now);
            }
            self.last_executable.clear();
            self.resume = None;
            return;
        }

        if executable_path != self.last_executable {
            // After an idle tick the trailing session is already closed.
            if !self.last_executable.is_empty()
                && let Some(trailing) = self.sessions.last_mut()
            {
                trailing.extend_to(now);
            }
            debug!(executable = executable_path, at = now, "session opened");
            self.sessions
                .push(UsageSession::new(title, executable_path, now));
            self.last_executable = executable_path.to_string();
            self.resume = None;
            return;
        }

        match self.sessions.last_mut() {
            Some(trailing) => trailing.extend_to(now),
            None => {
                // Same executable as before a detach: open the continuation segment.
                let (title, start) = match self.resume.take() {
                    Some(resume) => (resume.title, resume.from.min(now)),
                    None => (title.to_string(), now),
                };
                let mut session = UsageSession::new(&title, executable_path, start);
                session.extend_to(now);
                self.sessions.push(session);
            }
        }
    }

    pub fn detach_all(&mut self) -> Vec<UsageSession> {
        let detached = std::mem::take(&mut self.sessions);
        match self.policy {
            ContinuityPolicy::Preserve => {
                self.resume = match detached.last() {
                    Some(trailing) if !self.last_executable.is_empty() => Some(Resume {
                        title: trailing.title.clone(),
                        from: trailing.end,
                    }),
                    Some(_) => None,
                    None => self.resume.take(),
                };
            }
            ContinuityPolicy::Reset => {
                self.last_executable.clear();
                self.resume = None;
            }
        }
        detached
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_tracking(&self) -> bool {
        !self.last_executable.is_empty()
    }

    pub fn policy(&self) -> ContinuityPolicy {
        self.policy
    }
}

/// Shared handle over the aggregator. Every operation holds the lock only for
/// the in-memory work; callers do their I/O after the guard is gone.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    inner: Arc<Mutex<SessionAggregator>>,
}

impl SessionLog {
    pub fn new(policy: ContinuityPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionAggregator::new(policy))),
        }
    }

    pub fn tick(&self, now: i64, title: &str, executable_path: &str) {
        self.lock().tick(now, title, executable_path);
    }

    pub fn detach_all(&self) -> Vec<UsageSession> {
        self.lock().detach_all()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn policy(&self) -> ContinuityPolicy {
        self.lock().policy()
    }

    fn lock(&self) -> MutexGuard<'_, SessionAggregator> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
