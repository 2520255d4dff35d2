//! Per-clinical-session appointment numbering.
//!
//! Every appointment gets a monotonically increasing position number
//! within its (doctor, date, session) group. `next_number` runs on the
//! caller's connection so the scan and the subsequent insert share one
//! `BEGIN IMMEDIATE` transaction, so concurrent bookings for the same
//! session serialize instead of racing to the same number.
//!
//! `fix_invalid_session_appointment_numbers` is the batch repair for
//! groups whose numbering went bad (missing/non-positive values) or
//! went sparse after cancellations: non-cancelled members are re-sorted
//! by creation time and renumbered contiguously from 1.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{OpsError, Result};

/// Next position number for the given clinical session.
///
/// Takes the maximum positive number among non-cancelled matches and
/// returns max + 1. Fails open: an unexpected read error logs and
/// returns 1 rather than blocking the booking.
pub fn next_number(conn: &Connection, doctor_id: &str, date: &str, session_id: &str) -> i64 {
    let max: std::result::Result<Option<i64>, _> = conn.query_row(
        "SELECT MAX(session_appointment_number) FROM appointments
         WHERE doctor_id = ?1 AND date = ?2 AND session_id = ?3
           AND status != 'cancelled'
           AND session_appointment_number > 0",
        params![doctor_id, date, session_id],
        |row| row.get(0),
    );

    match max {
        Ok(max) => max.unwrap_or(0) + 1,
        Err(e) => {
            warn!(
                doctor_id = %doctor_id,
                session_id = %session_id,
                "Sequence scan failed, falling back to 1: {e}"
            );
            1
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct RepairReport {
    pub groups_repaired: usize,
    pub appointments_updated: usize,
}

/// Batch repair of session appointment numbering.
///
/// Groups all appointments by (doctor_id, date, session_id). A group is
/// repaired when any non-cancelled member has a missing or non-positive
/// number, or when the numbers are not the contiguous set 1..=n.
/// Only rows whose number actually changes are written. Running the
/// repair twice in a row is a no-op the second time.
pub fn fix_invalid_session_appointment_numbers(db: &DbState) -> Result<RepairReport> {
    let conn = db.conn.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<RepairReport> {
        let mut stmt = conn.prepare(
            "SELECT id, doctor_id, date, session_id, session_appointment_number, created_at
             FROM appointments WHERE status != 'cancelled'
             ORDER BY created_at",
        )?;

        // (doctor_id, date, session_id) -> [(appointment_id, number, created_at)]
        let mut groups: BTreeMap<(String, String, String), Vec<(String, Option<i64>, String)>> =
            BTreeMap::new();

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        for row in rows {
            let (id, doctor_id, date, session_id, number, created_at) = row?;
            groups
                .entry((doctor_id, date, session_id))
                .or_default()
                .push((id, number, created_at));
        }

        let mut report = RepairReport::default();

        for (key, mut members) in groups {
            if !needs_repair(&members) {
                continue;
            }
            // id tiebreak keeps the repair stable when created_at ties
            members.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

            let mut updated = 0;
            for (position, (id, number, _)) in members.iter().enumerate() {
                let expected = position as i64 + 1;
                if *number == Some(expected) {
                    continue;
                }
                conn.execute(
                    "UPDATE appointments SET session_appointment_number = ?1,
                            updated_at = datetime('now')
                     WHERE id = ?2",
                    params![expected, id],
                )?;
                updated += 1;
            }

            if updated > 0 {
                info!(
                    doctor_id = %key.0,
                    date = %key.1,
                    session_id = %key.2,
                    updated,
                    "Repaired session appointment numbering"
                );
                report.groups_repaired += 1;
                report.appointments_updated += updated;
            }
        }

        Ok(report)
    })();

    match result {
        Ok(report) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| OpsError::Storage(format!("commit: {e}")))?;
            Ok(report)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// A group needs repair when any number is missing/non-positive, or the
/// set is not exactly 1..=n (duplicates or cancellation gaps).
fn needs_repair(members: &[(String, Option<i64>, String)]) -> bool {
    let mut numbers: Vec<i64> = Vec::with_capacity(members.len());
    for (_, number, _) in members {
        match number {
            Some(n) if *n > 0 => numbers.push(*n),
            _ => return true,
        }
    }
    numbers.sort_unstable();
    numbers
        .iter()
        .enumerate()
        .any(|(i, n)| *n != i as i64 + 1)
}

// ===========================================================================
// Tests
// ===========================================================================
