use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::default(),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Match,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Match => "match",
        }
    }
}

/// Content key of one logical notification: the like id or match pair id,
/// never a delivery sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub kind: NotificationKind,
    pub subject: String,
    pub recipient: String,
}

impl CooldownKey {
    pub fn new(kind: NotificationKind, subject: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            recipient: recipient.into(),
        }
    }
}

#[derive(Default)]
struct DedupState {
    fired: HashMap<CooldownKey, Instant>,
    alerts: HashSet<(String, String)>,
}

/// Session-scoped notification deduplication.
///
/// Holds a cooldown map that swallows re-fires of the same key inside the
/// window, and the set of in-app alerts the user has not dismissed yet.
pub struct NotificationDeduper {
    clock: Arc<dyn Clock>,
    window: Duration,
    state: Mutex<DedupState>,
}

impl NotificationDeduper {
    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            clock,
            window,
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a firing of `key` unless one was recorded within the window.
    /// Returns whether the caller may fire.
    pub fn try_fire(&self, key: &CooldownKey) -> bool {
        let now = self.clock.now();
        let window = self.window;
        let mut state = self.lock();
        state
            .fired
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        if state.fired.contains_key(key) {
            return false;
        }
        state.fired.insert(key.clone(), now);
        true
    }

    /// Drop a recorded firing that never reached the user.
    pub fn forget(&self, key: &CooldownKey) {
        self.lock().fired.remove(key);
    }

    /// Mark an alert as shown. Returns `false` if it was already active.
    pub fn open_alert(&self, pair_id: &str, recipient: &str) -> bool {
        self.lock()
            .alerts
            .insert((pair_id.to_string(), recipient.to_string()))
    }

    pub fn dismiss_alert(&self, pair_id: &str, recipient: &str) -> bool {
        self.lock()
            .alerts
            .remove(&(pair_id.to_string(), recipient.to_string()))
    }

    pub fn is_alert_active(&self, pair_id: &str, recipient: &str) -> bool {
        self.lock()
            .alerts
            .contains(&(pair_id.to_string(), recipient.to_string()))
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.fired.clear();
        state.alerts.clear();
    }
}
