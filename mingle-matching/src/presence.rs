use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Who is signed in on this device and whether the app is in front.
pub trait SessionContext: Send + Sync + 'static {
    fn current_session_id(&self) -> Option<String>;
    fn is_app_foreground(&self) -> bool;

    fn is_in_app(&self, session_id: &str) -> bool {
        self.is_app_foreground() && self.current_session_id().as_deref() == Some(session_id)
    }
}

pub struct LocalSession {
    session_id: RwLock<Option<String>>,
    foreground: AtomicBool,
}

impl LocalSession {
    pub fn new() -> Self {
        Self {
            session_id: RwLock::new(None),
            foreground: AtomicBool::new(true),
        }
    }

    pub fn sign_in(&self, session_id: &str) {
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
    }

    pub fn sign_out(&self) {
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext for LocalSession {
    fn current_session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_app_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }
}
