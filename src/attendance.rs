//! Staff attendance ledger: clock-in/out sessions, derived hours and
//! overtime, admin upserts, and record deletion.
//!
//! One `attendance` row per staff member per day holds zero or more
//! clock sessions. At most one session per record may be open (clocked
//! in, not yet out); that invariant is checked in the clock-in
//! transaction and backstopped by a partial unique index.
//!
//! **Rules:**
//! - `hours_worked` = (time_out − time_in) in ms / 3,600,000, rounded to 2 dp
//! - `total_hours_worked` = sum over *closed* sessions only
//! - `overtime` = max(0, total_hours_worked − 10)
//!
//! Records written before clock sessions existed carry a single
//! `time_in`/`time_out` pair on the attendance row itself; reads expose
//! them as one synthesized session (never written back).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{OpsError, Result};
use crate::photos::PhotoStore;
use crate::staff;

/// Daily hours beyond which overtime accrues.
pub const OVERTIME_THRESHOLD_HOURS: f64 = 10.0;
/// Hours separating a half day from a full day for admin-marked records.
pub const FULL_DAY_HOURS: f64 = 8.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

const VALID_STATUSES: &[&str] = &[
    "present",
    "present_half",
    "present_full",
    "absent",
    "leave",
    "holiday",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSession {
    pub id: String,
    pub time_in: String,
    pub time_out: Option<String>,
    pub hours_worked: f64,
    pub notes: Option<String>,
    pub photo_in_url: Option<String>,
    pub photo_out_url: Option<String>,
}

impl ClockSession {
    pub fn is_open(&self) -> bool {
        self.time_out.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attendance {
    pub id: String,
    pub staff_id: String,
    pub date: String,
    pub status: String,
    pub clock_sessions: Vec<ClockSession>,
    pub total_hours_worked: f64,
    pub overtime: f64,
    pub notes: Option<String>,
}

impl Attendance {
    pub fn open_session(&self) -> Option<&ClockSession> {
        self.clock_sessions.iter().find(|s| s.is_open())
    }
}

/// Admin-supplied fields for `mark_attendance`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarkAttendanceData {
    pub time_in: Option<String>,
    pub time_out: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Clock in
// ---------------------------------------------------------------------------

/// Clock a staff member in for today.
///
/// Creates today's attendance record on the first clock-in and appends a
/// new open clock session. Fails with `OpenSessionExists` if a session
/// is already open; the caller must clock out first.
pub fn clock_in(
    db: &DbState,
    staff_id: &str,
    notes: Option<&str>,
    photo_url: Option<&str>,
) -> Result<Attendance> {
    if staff_id.trim().is_empty() {
        return Err(OpsError::NotAuthenticated);
    }

    let conn = db.conn.lock()?;

    if staff::get_staff_with_conn(&conn, staff_id)?.is_none() {
        return Err(OpsError::StaffNotFound(staff_id.to_string()));
    }

    let now = Utc::now().to_rfc3339();
    let date = today_key();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<String> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM attendance WHERE staff_id = ?1 AND date = ?2",
                params![staff_id, date],
                |row| row.get(0),
            )
            .optional()?;

        let attendance_id = match existing {
            Some(id) => {
                if has_open_session(&conn, &id)? {
                    return Err(OpsError::OpenSessionExists);
                }
                materialize_legacy_pair(&conn, &id, &now)?;
                conn.execute(
                    "UPDATE attendance SET status = 'present', updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO attendance (id, staff_id, date, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'present', ?4, ?4)",
                    params![id, staff_id, date, now],
                )?;
                id
            }
        };

        conn.execute(
            "INSERT INTO clock_sessions (id, attendance_id, time_in, notes, photo_in_url,
                                         created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                Uuid::new_v4().to_string(),
                attendance_id,
                now,
                notes,
                photo_url,
                now,
            ],
        )?;

        Ok(attendance_id)
    })();

    let attendance_id = match result {
        Ok(id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| OpsError::Storage(format!("commit: {e}")))?;
            id
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(staff_id = %staff_id, attendance_id = %attendance_id, "Clocked in");

    load_attendance(&conn, &attendance_id)?
        .ok_or_else(|| OpsError::not_found("Attendance", attendance_id))
}

// ---------------------------------------------------------------------------
// Clock out
// ---------------------------------------------------------------------------

/// Close the open clock session on an attendance record.
///
/// Computes the session's worked hours, then re-derives
/// `total_hours_worked` (closed sessions only) and `overtime`.
pub fn clock_out(
    db: &DbState,
    attendance_id: &str,
    notes: Option<&str>,
    photo_url: Option<&str>,
) -> Result<Attendance> {
    let conn = db.conn.lock()?;

    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE id = ?1",
            params![attendance_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(OpsError::not_found("Attendance", attendance_id));
    }

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<()> {
        let open: Option<(String, String)> = conn
            .query_row(
                "SELECT id, time_in FROM clock_sessions
                 WHERE attendance_id = ?1 AND time_out IS NULL",
                params![attendance_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match open {
            Some((session_id, time_in)) => {
                let hours = hours_between(&time_in, &now)?;
                conn.execute(
                    "UPDATE clock_sessions SET
                        time_out = ?1, hours_worked = ?2,
                        notes = COALESCE(?3, notes),
                        photo_out_url = COALESCE(?4, photo_out_url),
                        updated_at = ?1
                     WHERE id = ?5",
                    params![now, hours, notes, photo_url, session_id],
                )?;
            }
            None => {
                // Legacy record: a single open pair on the attendance row itself
                let legacy: Option<String> = conn
                    .query_row(
                        "SELECT time_in FROM attendance
                         WHERE id = ?1 AND time_in IS NOT NULL AND time_out IS NULL
                           AND NOT EXISTS (SELECT 1 FROM clock_sessions WHERE attendance_id = ?1)",
                        params![attendance_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let time_in = legacy.ok_or(OpsError::NoOpenSession)?;
                let hours = hours_between(&time_in, &now)?;
                // Legacy rows have no per-session photo slots, so
                // photo_url cannot be stored on this path.
                conn.execute(
                    "UPDATE attendance SET time_out = ?1, total_hours_worked = ?2,
                            overtime = ?3, notes = COALESCE(?4, notes), updated_at = ?1
                     WHERE id = ?5",
                    params![
                        now,
                        hours,
                        (hours - OVERTIME_THRESHOLD_HOURS).max(0.0),
                        notes,
                        attendance_id,
                    ],
                )?;
                return Ok(());
            }
        }

        recompute_totals(&conn, attendance_id, &now)
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| OpsError::Storage(format!("commit: {e}")))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(attendance_id = %attendance_id, "Clocked out");

    load_attendance(&conn, attendance_id)?
        .ok_or_else(|| OpsError::not_found("Attendance", attendance_id))
}

/// Promote a closed legacy pair on the attendance row into a real
/// clock session before new sessions are appended.
///
/// The synthesized read-time session only appears while the record has
/// no children, so without this step the legacy pair's hours would fall
/// out of later `recompute_totals` sums. The stored total is carried
/// over as the pair's `hours_worked` and the legacy columns are cleared.
fn materialize_legacy_pair(conn: &Connection, attendance_id: &str, now: &str) -> Result<()> {
    let legacy: Option<(String, String, f64)> = conn
        .query_row(
            "SELECT time_in, time_out, total_hours_worked FROM attendance
             WHERE id = ?1 AND time_in IS NOT NULL AND time_out IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM clock_sessions WHERE attendance_id = ?1)",
            params![attendance_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((time_in, time_out, hours)) = legacy else {
        return Ok(());
    };

    conn.execute(
        "INSERT INTO clock_sessions (id, attendance_id, time_in, time_out, hours_worked,
                                     created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            Uuid::new_v4().to_string(),
            attendance_id,
            time_in,
            time_out,
            hours,
            now,
        ],
    )?;
    conn.execute(
        "UPDATE attendance SET time_in = NULL, time_out = NULL, updated_at = ?1 WHERE id = ?2",
        params![now, attendance_id],
    )?;
    Ok(())
}

/// Re-derive `total_hours_worked` and `overtime` from closed sessions.
fn recompute_totals(conn: &Connection, attendance_id: &str, now: &str) -> Result<()> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(hours_worked), 0) FROM clock_sessions
         WHERE attendance_id = ?1 AND time_out IS NOT NULL",
        params![attendance_id],
        |row| row.get(0),
    )?;
    let total = round2(total);
    let overtime = round2((total - OVERTIME_THRESHOLD_HOURS).max(0.0));

    conn.execute(
        "UPDATE attendance SET total_hours_worked = ?1, overtime = ?2, updated_at = ?3
         WHERE id = ?4",
        params![total, overtime, now, attendance_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get today's attendance record for a staff member, if any.
pub fn get_today_attendance(db: &DbState, staff_id: &str) -> Result<Option<Attendance>> {
    let conn = db.conn.lock()?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE staff_id = ?1 AND date = ?2",
            params![staff_id, today_key()],
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => load_attendance(&conn, &id),
        None => Ok(None),
    }
}

/// Get an attendance record by id.
pub fn get_attendance(db: &DbState, id: &str) -> Result<Option<Attendance>> {
    let conn = db.conn.lock()?;
    load_attendance(&conn, id)
}

// ---------------------------------------------------------------------------
// Admin upsert
// ---------------------------------------------------------------------------

/// Administrative upsert for a specific day, bypassing the clock flow.
///
/// When creating a fresh record with both times given, the status is
/// derived as `present_half` (< 8 h) or `present_full` (≥ 8 h) unless
/// explicitly overridden; overtime accrues beyond 10 h.
pub fn mark_attendance(
    db: &DbState,
    staff_id: &str,
    date: &str,
    data: &MarkAttendanceData,
) -> Result<Attendance> {
    if let Some(status) = data.status.as_deref() {
        if !VALID_STATUSES.contains(&status) {
            return Err(OpsError::Invalid(format!(
                "Invalid attendance status: {status}"
            )));
        }
    }

    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    let existing: Option<(String, Option<String>, Option<String>, String, f64, f64)> = conn
        .query_row(
            "SELECT id, time_in, time_out, status, total_hours_worked, overtime
             FROM attendance WHERE staff_id = ?1 AND date = ?2",
            params![staff_id, date],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    let (id, time_in, time_out, prior_status, prior_total, prior_overtime) = match existing {
        Some((id, ti, to, st, total, ot)) => (id, ti, to, Some(st), total, ot),
        None => (Uuid::new_v4().to_string(), None, None, None, 0.0, 0.0),
    };

    let time_in = data.time_in.clone().or(time_in);
    let time_out = data.time_out.clone().or(time_out);

    let (total, overtime) = match (time_in.as_deref(), time_out.as_deref()) {
        (Some(ti), Some(to)) => {
            let hours = hours_between(ti, to)?;
            (hours, round2((hours - OVERTIME_THRESHOLD_HOURS).max(0.0)))
        }
        // A status-only edit keeps totals derived from clock sessions
        _ => (prior_total, prior_overtime),
    };

    let both_times = time_in.is_some() && time_out.is_some();
    let status = match &data.status {
        Some(s) => s.clone(),
        None if both_times => {
            if total < FULL_DAY_HOURS {
                "present_half".to_string()
            } else {
                "present_full".to_string()
            }
        }
        None => prior_status.unwrap_or_else(|| "present".to_string()),
    };

    conn.execute(
        "INSERT INTO attendance (id, staff_id, date, status, total_hours_worked, overtime,
                                 time_in, time_out, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(staff_id, date) DO UPDATE SET
            status = excluded.status,
            total_hours_worked = excluded.total_hours_worked,
            overtime = excluded.overtime,
            time_in = excluded.time_in,
            time_out = excluded.time_out,
            notes = COALESCE(excluded.notes, attendance.notes),
            updated_at = excluded.updated_at",
        params![
            id, staff_id, date, status, total, overtime, time_in, time_out, data.notes, now,
        ],
    )?;

    info!(staff_id = %staff_id, date = %date, status = %status, "Attendance marked");

    load_attendance(&conn, &id)?.ok_or_else(|| OpsError::not_found("Attendance", id))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Delete an attendance record and its session photos.
///
/// Photo deletion is best-effort and isolated per item: one bad url is
/// logged and does not block the remaining deletions or the row delete.
pub fn delete_attendance(db: &DbState, photos: &PhotoStore, id: &str) -> Result<()> {
    let conn = db.conn.lock()?;

    let attendance =
        load_attendance(&conn, id)?.ok_or_else(|| OpsError::not_found("Attendance", id))?;

    for session in &attendance.clock_sessions {
        for url in [&session.photo_in_url, &session.photo_out_url]
            .into_iter()
            .flatten()
        {
            if let Err(e) = photos.delete_by_url(url) {
                warn!(attendance_id = %id, url = %url, "Photo deletion failed: {e}");
            }
        }
    }

    conn.execute("DELETE FROM attendance WHERE id = ?1", params![id])?;

    info!(attendance_id = %id, "Attendance deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Loading + helpers
// ---------------------------------------------------------------------------

/// Load an attendance record with its clock sessions.
///
/// Legacy rows (no child sessions, single `time_in`/`time_out` pair on
/// the attendance row) get one synthesized session, a read-time
/// adapter that is never persisted.
pub(crate) fn load_attendance(conn: &Connection, id: &str) -> Result<Option<Attendance>> {
    let header: Option<(String, String, String, f64, f64, Option<String>, Option<String>, Option<String>)> =
        conn.query_row(
            "SELECT staff_id, date, status, total_hours_worked, overtime,
                    time_in, time_out, notes
             FROM attendance WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )
        .optional()?;

    let Some((staff_id, date, status, total, overtime, legacy_in, legacy_out, notes)) = header
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, time_in, time_out, hours_worked, notes, photo_in_url, photo_out_url
         FROM clock_sessions WHERE attendance_id = ?1 ORDER BY time_in",
    )?;
    let mut sessions: Vec<ClockSession> = stmt
        .query_map(params![id], |row| {
            Ok(ClockSession {
                id: row.get(0)?,
                time_in: row.get(1)?,
                time_out: row.get(2)?,
                hours_worked: row.get(3)?,
                notes: row.get(4)?,
                photo_in_url: row.get(5)?,
                photo_out_url: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<_, _>>()?;

    if sessions.is_empty() {
        if let Some(time_in) = legacy_in {
            sessions.push(ClockSession {
                id: format!("{id}-legacy"),
                time_in,
                time_out: legacy_out,
                hours_worked: total,
                notes: None,
                photo_in_url: None,
                photo_out_url: None,
            });
        }
    }

    Ok(Some(Attendance {
        id: id.to_string(),
        staff_id,
        date,
        status,
        clock_sessions: sessions,
        total_hours_worked: total,
        overtime,
        notes,
    }))
}

fn has_open_session(conn: &Connection, attendance_id: &str) -> Result<bool> {
    let open: i64 = conn.query_row(
        "SELECT COUNT(*) FROM clock_sessions
         WHERE attendance_id = ?1 AND time_out IS NULL",
        params![attendance_id],
        |row| row.get(0),
    )?;
    if open > 0 {
        return Ok(true);
    }
    // Legacy open pair counts too
    let legacy_open: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attendance
         WHERE id = ?1 AND time_in IS NOT NULL AND time_out IS NULL
           AND NOT EXISTS (SELECT 1 FROM clock_sessions WHERE attendance_id = ?1)",
        params![attendance_id],
        |row| row.get(0),
    )?;
    Ok(legacy_open > 0)
}

pub(crate) fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Millisecond delta between two RFC 3339 timestamps, in hours, 2 dp.
fn hours_between(time_in: &str, time_out: &str) -> Result<f64> {
    let t_in = DateTime::parse_from_rfc3339(time_in)
        .map_err(|e| OpsError::Invalid(format!("bad time_in {time_in}: {e}")))?;
    let t_out = DateTime::parse_from_rfc3339(time_out)
        .map_err(|e| OpsError::Invalid(format!("bad time_out {time_out}: {e}")))?;
    let ms = t_out.signed_duration_since(t_in).num_milliseconds() as f64;
    Ok(round2(ms / MS_PER_HOUR))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;
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

    fn seed_staff(db: &DbState, id: &str, role: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO staff (id, display_name, email, role, created_at, updated_at)
             VALUES (?1, ?1, 'x@clinic.test', ?2, datetime('now'), datetime('now'))",
            params![id, role],
        )
        .unwrap();
    }

    /// Shift the open session's time_in into the past by `hours`.
    fn backdate_open_session(db: &DbState, attendance_id: &str, hours: i64) {
        let past = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE clock_sessions SET time_in = ?1
             WHERE attendance_id = ?2 AND time_out IS NULL",
            params![past, attendance_id],
        )
        .unwrap();
    }

    #[test]
    fn test_first_clock_in_creates_record() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let att = clock_in(&db, "s1", None, None).expect("clock in");
        assert_eq!(att.status, "present");
        assert_eq!(att.clock_sessions.len(), 1);
        assert!(att.clock_sessions[0].is_open());
        assert_eq!(att.total_hours_worked, 0.0);
    }

    #[test]
    fn test_second_clock_in_rejected_while_open() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        clock_in(&db, "s1", None, None).unwrap();
        let err = clock_in(&db, "s1", None, None).unwrap_err();
        assert!(matches!(err, OpsError::OpenSessionExists));
    }

    #[test]
    fn test_clock_in_unknown_staff() {
        let db = test_db();
        let err = clock_in(&db, "ghost", None, None).unwrap_err();
        assert!(matches!(err, OpsError::StaffNotFound(_)));

        let err = clock_in(&db, "  ", None, None).unwrap_err();
        assert!(matches!(err, OpsError::NotAuthenticated));
    }

    #[test]
    fn test_clock_out_computes_hours() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let att = clock_in(&db, "s1", None, None).unwrap();
        backdate_open_session(&db, &att.id, 2);

        let att = clock_out(&db, &att.id, None, None).expect("clock out");
        assert!((att.total_hours_worked - 2.0).abs() < 0.02);
        assert_eq!(att.overtime, 0.0);
        assert!(att.open_session().is_none());
    }

    #[test]
    fn test_overtime_beyond_ten_hours() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let att = clock_in(&db, "s1", None, None).unwrap();
        backdate_open_session(&db, &att.id, 12);

        let att = clock_out(&db, &att.id, None, None).unwrap();
        assert!((att.total_hours_worked - 12.0).abs() < 0.02);
        assert!((att.overtime - 2.0).abs() < 0.02);
    }

    #[test]
    fn test_total_sums_closed_sessions() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let att = clock_in(&db, "s1", None, None).unwrap();
        backdate_open_session(&db, &att.id, 3);
        clock_out(&db, &att.id, None, None).unwrap();

        let att = clock_in(&db, "s1", None, None).unwrap();
        backdate_open_session(&db, &att.id, 2);
        let att = clock_out(&db, &att.id, None, None).unwrap();

        assert_eq!(att.clock_sessions.len(), 2);
        assert!((att.total_hours_worked - 5.0).abs() < 0.05);
    }

    #[test]
    fn test_clock_out_without_open_session() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let att = clock_in(&db, "s1", None, None).unwrap();
        clock_out(&db, &att.id, None, None).unwrap();

        let err = clock_out(&db, &att.id, None, None).unwrap_err();
        assert!(matches!(err, OpsError::NoOpenSession));

        let err = clock_out(&db, "missing", None, None).unwrap_err();
        assert!(matches!(err, OpsError::NotFound { .. }));
    }

    #[test]
    fn test_legacy_record_synthesizes_session() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO attendance (id, staff_id, date, status, total_hours_worked, overtime,
                                     time_in, time_out, created_at, updated_at)
             VALUES ('att-legacy', 's1', ?1, 'present_full', 8.0, 0.0,
                     '2024-01-01T08:00:00+00:00', '2024-01-01T16:00:00+00:00',
                     datetime('now'), datetime('now'))",
            params![today_key()],
        )
        .unwrap();
        drop(conn);

        let att = get_today_attendance(&db, "s1").unwrap().expect("record");
        assert_eq!(att.clock_sessions.len(), 1);
        let session = &att.clock_sessions[0];
        assert!(!session.is_open());
        assert_eq!(session.hours_worked, 8.0);
    }

    #[test]
    fn test_legacy_hours_survive_new_clock_session() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO attendance (id, staff_id, date, status, total_hours_worked, overtime,
                                     time_in, time_out, created_at, updated_at)
             VALUES ('att-legacy', 's1', ?1, 'present_full', 8.0, 0.0,
                     '2024-01-01T08:00:00+00:00', '2024-01-01T16:00:00+00:00',
                     datetime('now'), datetime('now'))",
            params![today_key()],
        )
        .unwrap();
        drop(conn);

        // Clocking in again promotes the legacy pair to a real session
        let att = clock_in(&db, "s1", None, None).unwrap();
        assert_eq!(att.clock_sessions.len(), 2);
        assert!(!att.clock_sessions[0].is_open());
        assert_eq!(att.clock_sessions[0].hours_worked, 8.0);
        assert!(att.clock_sessions[1].is_open());

        backdate_open_session(&db, &att.id, 2);
        let att = clock_out(&db, &att.id, None, None).unwrap();
        assert_eq!(att.clock_sessions.len(), 2);
        assert!((att.total_hours_worked - 10.0).abs() < 0.02);
    }

    #[test]
    fn test_legacy_open_record_clocks_out() {
        let db = test_db();
        let two_hours_ago = (Utc::now() - Duration::hours(2)).to_rfc3339();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO attendance (id, staff_id, date, status, time_in,
                                     created_at, updated_at)
             VALUES ('att-legacy', 's1', ?1, 'present', ?2, datetime('now'), datetime('now'))",
            params![today_key(), two_hours_ago],
        )
        .unwrap();
        drop(conn);

        let att = clock_out(&db, "att-legacy", Some("left early"), None).unwrap();
        assert!((att.total_hours_worked - 2.0).abs() < 0.02);
        assert_eq!(att.notes.as_deref(), Some("left early"));
    }

    #[test]
    fn test_mark_attendance_derives_half_and_full() {
        let db = test_db();

        let half = mark_attendance(
            &db,
            "s1",
            "2024-03-01",
            &MarkAttendanceData {
                time_in: Some("2024-03-01T08:00:00+00:00".into()),
                time_out: Some("2024-03-01T12:00:00+00:00".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(half.status, "present_half");
        assert_eq!(half.total_hours_worked, 4.0);

        let full = mark_attendance(
            &db,
            "s2",
            "2024-03-01",
            &MarkAttendanceData {
                time_in: Some("2024-03-01T08:00:00+00:00".into()),
                time_out: Some("2024-03-01T19:30:00+00:00".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(full.status, "present_full");
        assert_eq!(full.total_hours_worked, 11.5);
        assert_eq!(full.overtime, 1.5);
    }

    #[test]
    fn test_mark_attendance_status_override_and_update() {
        let db = test_db();

        let leave = mark_attendance(
            &db,
            "s1",
            "2024-03-02",
            &MarkAttendanceData {
                status: Some("leave".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(leave.status, "leave");

        // Upsert on the same day updates in place
        let updated = mark_attendance(
            &db,
            "s1",
            "2024-03-02",
            &MarkAttendanceData {
                status: Some("holiday".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.id, leave.id);
        assert_eq!(updated.status, "holiday");

        let err = mark_attendance(
            &db,
            "s1",
            "2024-03-03",
            &MarkAttendanceData {
                status: Some("vacationing".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, OpsError::Invalid(_)));
    }

    #[test]
    fn test_delete_attendance_removes_photos_best_effort() {
        let db = test_db();
        seed_staff(&db, "s1", "staff");

        let dir = std::env::temp_dir().join("clinic_ops_att_delete_test");
        let _ = std::fs::remove_dir_all(&dir);
        let photos = PhotoStore::new(&dir).unwrap();
        let url = photos
            .save_attendance_photo(b"img", "s1", "cs", crate::photos::PhotoKind::ClockIn)
            .unwrap();

        let att = clock_in(&db, "s1", None, Some(&url)).unwrap();

        // Second url is bogus; deletion must continue past it
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE clock_sessions SET photo_out_url = 'https://nope/x.jpg'
             WHERE attendance_id = ?1",
            params![att.id],
        )
        .unwrap();
        drop(conn);

        delete_attendance(&db, &photos, &att.id).expect("delete");

        assert!(get_attendance(&db, &att.id).unwrap().is_none());
        // Photo file is gone
        assert!(photos.delete_by_url(&url).is_ok());

        let err = delete_attendance(&db, &photos, "missing").unwrap_err();
        assert!(matches!(err, OpsError::NotFound { .. }));
    }
}
