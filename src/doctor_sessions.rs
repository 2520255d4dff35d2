//! Doctor-session registry: clinical time blocks appointments book into.
//!
//! A clinical session is identified by `doctorId_date_startTime_endTime`.
//! The core reads this registry for the arrival-unmark guard (a departed
//! and paid doctor session freezes arrivals) and for refund notes.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::DbState;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorSession {
    pub id: String,
    pub doctor_id: String,
    pub doctor_name: Option<String>,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub is_departed: bool,
    pub is_paid: bool,
}

/// Composite session id: `doctorId_date_startTime_endTime`.
pub fn session_key(doctor_id: &str, date: &str, start_time: &str, end_time: &str) -> String {
    format!("{doctor_id}_{date}_{start_time}_{end_time}")
}

/// Get a clinical session by its composite id.
pub fn get_session(db: &DbState, session_id: &str) -> Result<Option<DoctorSession>> {
    let conn = db.conn.lock()?;
    get_session_with_conn(&conn, session_id)
}

pub(crate) fn get_session_with_conn(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<DoctorSession>> {
    let session = conn
        .query_row(
            "SELECT id, doctor_id, doctor_name, date, start_time, end_time,
                    is_departed, is_paid
             FROM doctor_sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok(DoctorSession {
                    id: row.get(0)?,
                    doctor_id: row.get(1)?,
                    doctor_name: row.get(2)?,
                    date: row.get(3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    is_departed: row.get(6)?,
                    is_paid: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(session)
}

/// Insert or replace a clinical session record.
pub fn upsert_session(db: &DbState, session: &DoctorSession) -> Result<()> {
    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO doctor_sessions (id, doctor_id, doctor_name, date, start_time,
                                      end_time, is_departed, is_paid, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(id) DO UPDATE SET
            doctor_name = excluded.doctor_name,
            is_departed = excluded.is_departed,
            is_paid = excluded.is_paid,
            updated_at = excluded.updated_at",
        params![
            session.id,
            session.doctor_id,
            session.doctor_name,
            session.date,
            session.start_time,
            session.end_time,
            session.is_departed,
            session.is_paid,
            now,
        ],
    )?;
    Ok(())
}

/// Mark a session's departure/settlement flags.
pub fn set_departure(db: &DbState, session_id: &str, is_departed: bool, is_paid: bool) -> Result<()> {
    let conn = db.conn.lock()?;
    conn.execute(
        "UPDATE doctor_sessions SET is_departed = ?1, is_paid = ?2,
                updated_at = datetime('now')
         WHERE id = ?3",
        params![is_departed, is_paid, session_id],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_session_key_format() {
        assert_eq!(
            session_key("doc1", "2024-01-01", "09:00", "12:00"),
            "doc1_2024-01-01_09:00_12:00"
        );
    }

    #[test]
    fn test_upsert_and_departure_flags() {
        let db = test_db();
        let id = session_key("doc1", "2024-01-01", "09:00", "12:00");
        upsert_session(
            &db,
            &DoctorSession {
                id: id.clone(),
                doctor_id: "doc1".into(),
                doctor_name: Some("Dr. Silva".into()),
                date: "2024-01-01".into(),
                start_time: "09:00".into(),
                end_time: "12:00".into(),
                is_departed: false,
                is_paid: false,
            },
        )
        .unwrap();

        set_departure(&db, &id, true, true).unwrap();

        let loaded = get_session(&db, &id).unwrap().unwrap();
        assert!(loaded.is_departed);
        assert!(loaded.is_paid);

        assert!(get_session(&db, "missing").unwrap().is_none());
    }
}
