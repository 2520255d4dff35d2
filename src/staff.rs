//! Staff directory: identity lookups and auth-user sync.
//!
//! The only role the core branches on is `"doctor"`; doctors are exempt
//! from cashier-session linking when booking appointments.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{OpsError, Result};

/// Role string that exempts a user from cashier-session gating.
pub const DOCTOR_ROLE: &str = "doctor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Staff {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: String,
}

impl Staff {
    pub fn is_doctor(&self) -> bool {
        self.role == DOCTOR_ROLE
    }
}

/// Look up a staff member by id.
pub fn get_staff_by_id(db: &DbState, id: &str) -> Result<Option<Staff>> {
    let conn = db.conn.lock()?;
    get_staff_with_conn(&conn, id)
}

/// Connection-level lookup for callers already inside a transaction.
pub(crate) fn get_staff_with_conn(conn: &Connection, id: &str) -> Result<Option<Staff>> {
    let staff = conn
        .query_row(
            "SELECT id, display_name, email, role FROM staff WHERE id = ?1",
            params![id],
            |row| {
                Ok(Staff {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    email: row.get(2)?,
                    role: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(staff)
}

/// Upsert a staff record from an authenticated user.
///
/// New records default to the `staff` role; an existing record keeps its
/// role and display name unless a new display name is provided.
pub fn sync_auth_user_to_staff(
    db: &DbState,
    uid: &str,
    email: &str,
    display_name: Option<&str>,
) -> Result<Staff> {
    if uid.is_empty() {
        return Err(OpsError::NotAuthenticated);
    }

    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO staff (id, display_name, email, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'staff', ?4, ?4)
         ON CONFLICT(id) DO UPDATE SET
            email = excluded.email,
            display_name = CASE WHEN ?5 THEN excluded.display_name ELSE staff.display_name END,
            updated_at = excluded.updated_at",
        params![
            uid,
            display_name.unwrap_or(""),
            email,
            now,
            display_name.is_some(),
        ],
    )?;

    info!(staff_id = %uid, "Synced auth user to staff directory");

    get_staff_with_conn(&conn, uid)?
        .ok_or_else(|| OpsError::not_found("Staff", uid))
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
    fn test_sync_creates_then_updates() {
        let db = test_db();

        let created =
            sync_auth_user_to_staff(&db, "u-1", "a@clinic.test", Some("Dr. A")).unwrap();
        assert_eq!(created.display_name, "Dr. A");
        assert_eq!(created.role, "staff");

        // Second sync without a display name keeps the existing one
        let updated = sync_auth_user_to_staff(&db, "u-1", "new@clinic.test", None).unwrap();
        assert_eq!(updated.display_name, "Dr. A");
        assert_eq!(updated.email, "new@clinic.test");
    }

    #[test]
    fn test_sync_preserves_role() {
        let db = test_db();
        sync_auth_user_to_staff(&db, "u-2", "d@clinic.test", Some("Dr. D")).unwrap();

        let conn = db.conn.lock().unwrap();
        conn.execute("UPDATE staff SET role = 'doctor' WHERE id = 'u-2'", [])
            .unwrap();
        drop(conn);

        let synced = sync_auth_user_to_staff(&db, "u-2", "d@clinic.test", None).unwrap();
        assert!(synced.is_doctor(), "role should survive re-sync");
    }

    #[test]
    fn test_get_missing_staff() {
        let db = test_db();
        assert!(get_staff_by_id(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_sync_requires_uid() {
        let db = test_db();
        let err = sync_auth_user_to_staff(&db, "", "x@clinic.test", None).unwrap_err();
        assert!(matches!(err, OpsError::NotAuthenticated));
    }
}
