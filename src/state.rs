use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::AppConfig;
use crate::services::ai::LlmProvider;
use crate::services::notify::NotificationProvider;
use crate::services::sessions::{CallLocks, SessionStore};

pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub config: AppConfig,
    pub understanding: Box<dyn LlmProvider>,
    pub notifier: Box<dyn NotificationProvider>,
    pub sessions: Box<dyn SessionStore>,
    pub call_locks: CallLocks,
}
