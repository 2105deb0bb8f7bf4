use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::models::{CallSession, CallTurn, SessionStage, TimePreference};

/// Pluggable per-call session persistence. The engine never touches the
/// backing store directly, so live calls survive a process restart and
/// additional instances can share state through the same database.
pub trait SessionStore: Send + Sync {
    fn load(&self, call_id: &str) -> anyhow::Result<Option<CallSession>>;
    fn save(&self, session: &CallSession) -> anyhow::Result<()>;
    fn remove(&self, call_id: &str) -> anyhow::Result<()>;
    /// Remove sessions idle since before `cutoff`, returning them so the
    /// caller can release any held slots.
    fn sweep_inactive(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<CallSession>>;
}

// Accumulated dialogue fields ride in one JSON column; missing keys
// deserialize to defaults so the shape can grow without a migration.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionData {
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    time_preference: Option<TimePreference>,
    #[serde(default)]
    proposed_slot_id: Option<String>,
    #[serde(default)]
    rejected_slot_ids: Vec<String>,
    #[serde(default)]
    turns: Vec<CallTurn>,
}

pub struct SqliteSessionStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

fn fmt_ts(dt: &DateTime<Utc>) -> String {
    crate::db::queries::fmt_ts(dt)
}

fn parse_session_row(row: &rusqlite::Row) -> anyhow::Result<CallSession> {
    let stage_str: String = row.get(3)?;
    let data_json: String = row.get(4)?;
    let created_str: String = row.get(7)?;
    let activity_str: String = row.get(8)?;

    let data: SessionData = serde_json::from_str(&data_json).unwrap_or_default();

    Ok(CallSession {
        call_id: row.get(0)?,
        business_id: row.get(1)?,
        caller_phone: row.get(2)?,
        stage: SessionStage::parse(&stage_str),
        service_id: data.service_id,
        customer_name: data.customer_name,
        time_preference: data.time_preference,
        proposed_slot_id: data.proposed_slot_id,
        rejected_slot_ids: data.rejected_slot_ids,
        turns: data.turns,
        retries: row.get(5)?,
        silences: row.get(6)?,
        created_at: crate::db::queries::parse_ts(&created_str)?,
        last_activity: crate::db::queries::parse_ts(&activity_str)?,
    })
}

const SESSION_COLUMNS: &str =
    "call_id, business_id, caller_phone, stage, data, retries, silences, created_at, last_activity";

impl SessionStore for SqliteSessionStore {
    fn load(&self, call_id: &str) -> anyhow::Result<Option<CallSession>> {
        let db = self.db.lock().unwrap();
        let result = db.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM call_sessions WHERE call_id = ?1"),
            params![call_id],
            |row| Ok(parse_session_row(row)),
        );

        match result {
            Ok(session) => Ok(Some(session?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, session: &CallSession) -> anyhow::Result<()> {
        let data = serde_json::to_string(&SessionData {
            service_id: session.service_id.clone(),
            customer_name: session.customer_name.clone(),
            time_preference: session.time_preference.clone(),
            proposed_slot_id: session.proposed_slot_id.clone(),
            rejected_slot_ids: session.rejected_slot_ids.clone(),
            turns: session.turns.clone(),
        })?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO call_sessions (call_id, business_id, caller_phone, stage, data, retries, silences, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(call_id) DO UPDATE SET
               stage = excluded.stage,
               data = excluded.data,
               retries = excluded.retries,
               silences = excluded.silences,
               last_activity = excluded.last_activity",
            params![
                session.call_id,
                session.business_id,
                session.caller_phone,
                session.stage.as_str(),
                data,
                session.retries,
                session.silences,
                fmt_ts(&session.created_at),
                fmt_ts(&session.last_activity),
            ],
        )?;
        Ok(())
    }

    fn remove(&self, call_id: &str) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM call_sessions WHERE call_id = ?1", params![call_id])?;
        Ok(())
    }

    fn sweep_inactive(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<CallSession>> {
        let db = self.db.lock().unwrap();

        let mut stmt = db.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions WHERE last_activity <= ?1"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(&cutoff)], |row| Ok(parse_session_row(row)))?;

        let mut stale = vec![];
        for row in rows {
            stale.push(row??);
        }
        drop(stmt);

        db.execute(
            "DELETE FROM call_sessions WHERE last_activity <= ?1",
            params![fmt_ts(&cutoff)],
        )?;

        Ok(stale)
    }
}

/// Single-writer discipline per call id. Telephony adapters can deliver
/// overlapping events for one call; the per-call mutex serializes them
/// without blocking other calls.
#[derive(Default)]
pub struct CallLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CallLocks {
    pub fn acquire(&self, call_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(call_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, call_id: &str) {
        let mut map = self.inner.lock().unwrap();
        map.remove(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    fn store() -> SqliteSessionStore {
        let conn = db::init_db(":memory:").unwrap();
        SqliteSessionStore::new(Arc::new(Mutex::new(conn)))
    }

    fn ts(s: &str) -> DateTime<Utc> {
        crate::db::queries::parse_ts(s).unwrap()
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = store();
        let now = ts("2026-08-04T13:00:00Z");

        let mut session = CallSession::new("call-1", "biz-1", "+15551234567", now);
        session.stage = SessionStage::AwaitingConfirmation;
        session.service_id = Some("cut".to_string());
        session.customer_name = Some("Alice".to_string());
        session.proposed_slot_id = Some("slot-9".to_string());
        session.rejected_slot_ids = vec!["slot-8".to_string()];
        session.turns.push(CallTurn::caller("hi"));
        session.retries = 1;
        store.save(&session).unwrap();

        let loaded = store.load("call-1").unwrap().unwrap();
        assert_eq!(loaded.stage, SessionStage::AwaitingConfirmation);
        assert_eq!(loaded.service_id.as_deref(), Some("cut"));
        assert_eq!(loaded.customer_name.as_deref(), Some("Alice"));
        assert_eq!(loaded.proposed_slot_id.as_deref(), Some("slot-9"));
        assert_eq!(loaded.rejected_slot_ids, vec!["slot-8".to_string()]);
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.retries, 1);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let store = store();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_sweep_removes_only_stale() {
        let store = store();
        let now = ts("2026-08-04T13:00:00Z");

        let stale = CallSession::new("call-old", "biz-1", "+15550001111", now - Duration::minutes(30));
        let fresh = CallSession::new("call-new", "biz-1", "+15550002222", now);
        store.save(&stale).unwrap();
        store.save(&fresh).unwrap();

        let swept = store.sweep_inactive(now - Duration::minutes(5)).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].call_id, "call-old");

        assert!(store.load("call-old").unwrap().is_none());
        assert!(store.load("call-new").unwrap().is_some());
    }
}
