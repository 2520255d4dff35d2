//! Read-only attendance gate for appointment and POS actions.
//!
//! Fails closed: no attendance record today, or no open clock session,
//! means not valid. Never mutates state and must be re-evaluated per
//! gated action; an open session can close between calls.

use serde::Serialize;

use crate::attendance;
use crate::db::DbState;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceValidation {
    pub is_valid: bool,
    /// `time_in` of the open clock session when valid.
    pub clocked_in_at: Option<String>,
    pub message: String,
}

/// Gate for appointment creation.
pub fn validate_for_appointments(db: &DbState, staff_id: &str) -> Result<AttendanceValidation> {
    validate(db, staff_id, "creating appointments")
}

/// Gate for POS actions.
pub fn validate_for_pos(db: &DbState, staff_id: &str) -> Result<AttendanceValidation> {
    validate(db, staff_id, "POS actions")
}

fn validate(db: &DbState, staff_id: &str, action: &str) -> Result<AttendanceValidation> {
    let Some(att) = attendance::get_today_attendance(db, staff_id)? else {
        return Ok(AttendanceValidation {
            is_valid: false,
            clocked_in_at: None,
            message: format!("No attendance record for today. Clock in before {action}."),
        });
    };

    match att.open_session() {
        Some(session) => Ok(AttendanceValidation {
            is_valid: true,
            clocked_in_at: Some(session.time_in.clone()),
            message: format!("Clocked in since {}", session.time_in),
        }),
        None => Ok(AttendanceValidation {
            is_valid: false,
            clocked_in_at: None,
            message: format!("No open clock session. Clock in before {action}."),
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::{params, Connection};

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

    fn seed_staff(db: &DbState, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO staff (id, display_name, email, role, created_at, updated_at)
             VALUES (?1, ?1, 'x@clinic.test', 'staff', datetime('now'), datetime('now'))",
            params![id],
        )
        .unwrap();
    }

    #[test]
    fn test_fails_closed_without_record() {
        let db = test_db();
        let v = validate_for_appointments(&db, "s1").unwrap();
        assert!(!v.is_valid);
        assert!(v.clocked_in_at.is_none());
    }

    #[test]
    fn test_valid_while_clocked_in_then_invalid_after_out() {
        let db = test_db();
        seed_staff(&db, "s1");

        let att = crate::attendance::clock_in(&db, "s1", None, None).unwrap();

        let v = validate_for_pos(&db, "s1").unwrap();
        assert!(v.is_valid);
        assert!(v.clocked_in_at.is_some());

        crate::attendance::clock_out(&db, &att.id, None, None).unwrap();

        // Re-evaluation reflects the closed session
        let v = validate_for_pos(&db, "s1").unwrap();
        assert!(!v.is_valid);
    }
}
