//! Cashier cash-drawer session lifecycle and running aggregates.
//!
//! State machine per user: none → active → ended (terminal; a new
//! session may be opened afterwards, never two active at once for the
//! same user). Sales, expenses, and appointment payments accumulate on
//! the active session; `end_session` freezes the aggregates.
//!
//! Incremental aggregate bumps are single `x = x + ?` updates inside a
//! transaction; `update_session_appointment_count` is the idempotent
//! full recompute that re-derives the appointment aggregates from the
//! appointments table and self-heals any missed increment.
//!
//! Only one active session per user is an invariant. One active session
//! clinic-wide is policy, not enforced here; `has_any_active_session`
//! exists so the UI can suppress its "open a session?" prompt.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{OpsError, Result};

/// Per-currency amount map, e.g. `{"lkr": 25000.0}`.
pub type Amounts = BTreeMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashierSession {
    pub id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub start_date: String,
    pub end_date: Option<String>,
    pub starting_amounts: Amounts,
    pub ending_amounts: Option<Amounts>,
    pub is_active: bool,
    pub status: String,
    pub sale_ids: Vec<String>,
    pub total_sales_amount: f64,
    pub expense_ids: Vec<String>,
    pub total_expenses: f64,
    pub appointment_ids: Vec<String>,
    pub appointments_count: i64,
    pub total_doctor_fees: f64,
    pub appointment_cash_payments: f64,
    pub appointment_card_payments: f64,
    pub total_paid_appointments: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartSessionRequest {
    pub user_id: String,
    pub user_name: Option<String>,
    pub start_date: Option<String>,
    pub starting_amounts: Option<Amounts>,
}

// ---------------------------------------------------------------------------
// Start session
// ---------------------------------------------------------------------------

/// Open a new cashier session for a user.
///
/// The active-session check and the insert share one transaction, and a
/// partial unique index on `(user_id) WHERE is_active = 1` backstops it.
pub fn start_session(db: &DbState, req: &StartSessionRequest) -> Result<CashierSession> {
    if req.user_id.trim().is_empty() {
        return Err(OpsError::NotAuthenticated);
    }

    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();
    let session_id = Uuid::new_v4().to_string();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<()> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM cashier_sessions WHERE user_id = ?1 AND is_active = 1",
                params![req.user_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(OpsError::SessionAlreadyActive);
        }

        let starting = req.starting_amounts.clone().unwrap_or_default();
        conn.execute(
            "INSERT INTO cashier_sessions (
                id, user_id, user_name, start_date, starting_amounts,
                is_active, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, 'active', ?6, ?6)",
            params![
                session_id,
                req.user_id,
                req.user_name,
                req.start_date.clone().unwrap_or_else(|| now.clone()),
                serde_json::to_string(&starting)
                    .map_err(|e| OpsError::Storage(format!("encode amounts: {e}")))?,
                now,
            ],
        )?;
        Ok(())
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

    info!(session_id = %session_id, user_id = %req.user_id, "Cashier session started");

    load_session(&conn, &session_id)?
        .ok_or_else(|| OpsError::not_found("CashierSession", session_id))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get a session by id.
pub fn get_session(db: &DbState, session_id: &str) -> Result<Option<CashierSession>> {
    let conn = db.conn.lock()?;
    load_session(&conn, session_id)
}

/// Get the active session for a user (at most one by invariant).
pub fn get_active_session(db: &DbState, user_id: &str) -> Result<Option<CashierSession>> {
    let conn = db.conn.lock()?;
    active_session_id(&conn, user_id)?
        .map(|id| {
            load_session(&conn, &id)?.ok_or_else(|| OpsError::not_found("CashierSession", id))
        })
        .transpose()
}

pub(crate) fn active_session_id(conn: &Connection, user_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM cashier_sessions WHERE user_id = ?1 AND is_active = 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Whether any user has an active session. Advisory only, used by the
/// UI to decide whether to prompt for opening a session.
pub fn has_any_active_session(db: &DbState) -> Result<bool> {
    let conn = db.conn.lock()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cashier_sessions WHERE is_active = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ---------------------------------------------------------------------------
// Incremental aggregates
// ---------------------------------------------------------------------------

/// Link a sale to the session and add its amount to the sales total.
pub fn add_sale_to_session(
    db: &DbState,
    session_id: &str,
    sale_id: &str,
    amount: f64,
) -> Result<()> {
    append_ref(db, session_id, RefList::Sales, sale_id, amount)
}

/// Link an expense to the session and add its amount to the expense total.
pub fn add_expense_to_session(
    db: &DbState,
    session_id: &str,
    expense_id: &str,
    amount: f64,
) -> Result<()> {
    append_ref(db, session_id, RefList::Expenses, expense_id, amount)
}

/// Link an appointment to the session: appends the id, bumps the count,
/// and adds the doctor fee.
pub fn add_appointment_to_session(
    db: &DbState,
    session_id: &str,
    appointment_id: &str,
    doctor_fee: f64,
) -> Result<()> {
    append_ref(db, session_id, RefList::Appointments, appointment_id, doctor_fee)
}

/// Unlink an appointment: removes the id, drops the count, subtracts the
/// doctor fee.
pub fn remove_appointment_from_session(
    db: &DbState,
    session_id: &str,
    appointment_id: &str,
    doctor_fee: f64,
) -> Result<()> {
    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<()> {
        require_active(&conn, session_id)?;

        let mut ids = read_id_list(&conn, session_id, "appointment_ids")?;
        let before = ids.len();
        ids.retain(|id| id != appointment_id);
        if ids.len() == before {
            // Nothing linked under that id; leave totals untouched
            return Ok(());
        }

        conn.execute(
            "UPDATE cashier_sessions SET
                appointment_ids = ?1,
                appointments_count = MAX(appointments_count - 1, 0),
                total_doctor_fees = total_doctor_fees - ?2,
                updated_at = ?3
             WHERE id = ?4",
            params![encode_id_list(&ids)?, doctor_fee, now, session_id],
        )?;
        Ok(())
    })();

    finish_tx(&conn, result)
}

enum RefList {
    Sales,
    Expenses,
    Appointments,
}

impl RefList {
    fn list_col(&self) -> &'static str {
        match self {
            RefList::Sales => "sale_ids",
            RefList::Expenses => "expense_ids",
            RefList::Appointments => "appointment_ids",
        }
    }
}

fn append_ref(
    db: &DbState,
    session_id: &str,
    list: RefList,
    ref_id: &str,
    amount: f64,
) -> Result<()> {
    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<()> {
        require_active(&conn, session_id)?;

        let mut ids = read_id_list(&conn, session_id, list.list_col())?;
        if ids.iter().any(|id| id == ref_id) {
            // Already linked; don't double-count
            return Ok(());
        }
        ids.push(ref_id.to_string());
        let encoded = encode_id_list(&ids)?;

        match list {
            RefList::Sales => conn.execute(
                "UPDATE cashier_sessions SET
                    sale_ids = ?1, total_sales_amount = total_sales_amount + ?2,
                    updated_at = ?3
                 WHERE id = ?4",
                params![encoded, amount, now, session_id],
            )?,
            RefList::Expenses => conn.execute(
                "UPDATE cashier_sessions SET
                    expense_ids = ?1, total_expenses = total_expenses + ?2,
                    updated_at = ?3
                 WHERE id = ?4",
                params![encoded, amount, now, session_id],
            )?,
            RefList::Appointments => conn.execute(
                "UPDATE cashier_sessions SET
                    appointment_ids = ?1,
                    appointments_count = appointments_count + 1,
                    total_doctor_fees = total_doctor_fees + ?2,
                    updated_at = ?3
                 WHERE id = ?4",
                params![encoded, amount, now, session_id],
            )?,
        };
        Ok(())
    })();

    finish_tx(&conn, result)
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Recompute the session's appointment aggregates from scratch.
///
/// Rescans every non-cancelled appointment whose `cashier_session_id`
/// points at this session and re-derives ids, count, doctor fees, the
/// cash/card payment split, and the paid count. Idempotent; runs after
/// appointment mutations and as the final step of `end_session`.
pub fn update_session_appointment_count(db: &DbState, session_id: &str) -> Result<()> {
    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = recompute_appointments(&conn, session_id, &now);
    finish_tx(&conn, result)
}

fn recompute_appointments(conn: &Connection, session_id: &str, now: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM cashier_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(OpsError::not_found("CashierSession", session_id));
    }

    let mut stmt = conn.prepare(
        "SELECT id, doctor_fee, total_charge, is_paid, refunded, payment_method
         FROM appointments
         WHERE cashier_session_id = ?1 AND status != 'cancelled'
         ORDER BY created_at",
    )?;

    let mut ids: Vec<String> = Vec::new();
    let mut doctor_fees = 0.0;
    let mut cash = 0.0;
    let mut card = 0.0;
    let mut paid_count: i64 = 0;

    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    for row in rows {
        let (id, fee, charge, is_paid, refunded, method) = row?;
        ids.push(id);
        doctor_fees += fee;
        if is_paid && !refunded {
            paid_count += 1;
            match method.as_deref() {
                Some("card") => card += charge,
                _ => cash += charge,
            }
        }
    }

    conn.execute(
        "UPDATE cashier_sessions SET
            appointment_ids = ?1,
            appointments_count = ?2,
            total_doctor_fees = ?3,
            appointment_cash_payments = ?4,
            appointment_card_payments = ?5,
            total_paid_appointments = ?6,
            updated_at = ?7
         WHERE id = ?8",
        params![
            encode_id_list(&ids)?,
            ids.len() as i64,
            doctor_fees,
            cash,
            card,
            paid_count,
            now,
            session_id,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// End session
// ---------------------------------------------------------------------------

/// Close an active session: run a final appointment recompute, then
/// freeze the aggregates and record the counted ending amounts.
pub fn end_session(
    db: &DbState,
    session_id: &str,
    ending_amounts: Option<&Amounts>,
) -> Result<CashierSession> {
    let conn = db.conn.lock()?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<()> {
        let is_active: Option<bool> = conn
            .query_row(
                "SELECT is_active FROM cashier_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match is_active {
            None => return Err(OpsError::not_found("CashierSession", session_id)),
            Some(false) => return Err(OpsError::AlreadyEnded),
            Some(true) => {}
        }

        // Reconcile-at-close: the final recompute catches any missed
        // incremental update during the session.
        recompute_appointments(&conn, session_id, &now)?;

        let ending = ending_amounts
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| OpsError::Storage(format!("encode amounts: {e}")))?;

        conn.execute(
            "UPDATE cashier_sessions SET
                end_date = ?1, ending_amounts = ?2,
                is_active = 0, status = 'ended', updated_at = ?1
             WHERE id = ?3",
            params![now, ending, session_id],
        )?;
        Ok(())
    })();

    finish_tx(&conn, result)?;

    info!(session_id = %session_id, "Cashier session ended");

    load_session(&conn, session_id)?
        .ok_or_else(|| OpsError::not_found("CashierSession", session_id))
}

// ---------------------------------------------------------------------------
// Row loading + helpers
// ---------------------------------------------------------------------------

/// Load a session, upgrading legacy singular amounts to the map shape.
pub(crate) fn load_session(conn: &Connection, id: &str) -> Result<Option<CashierSession>> {
    struct Raw {
        user_id: String,
        user_name: Option<String>,
        start_date: String,
        end_date: Option<String>,
        starting_amounts: Option<String>,
        ending_amounts: Option<String>,
        starting_amount: Option<f64>,
        ending_amount: Option<f64>,
        is_active: bool,
        status: String,
        sale_ids: String,
        total_sales_amount: f64,
        expense_ids: String,
        total_expenses: f64,
        appointment_ids: String,
        appointments_count: i64,
        total_doctor_fees: f64,
        appointment_cash_payments: f64,
        appointment_card_payments: f64,
        total_paid_appointments: i64,
    }

    let raw: Option<Raw> = conn
        .query_row(
            "SELECT user_id, user_name, start_date, end_date,
                    starting_amounts, ending_amounts, starting_amount, ending_amount,
                    is_active, status,
                    sale_ids, total_sales_amount, expense_ids, total_expenses,
                    appointment_ids, appointments_count, total_doctor_fees,
                    appointment_cash_payments, appointment_card_payments,
                    total_paid_appointments
             FROM cashier_sessions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Raw {
                    user_id: row.get(0)?,
                    user_name: row.get(1)?,
                    start_date: row.get(2)?,
                    end_date: row.get(3)?,
                    starting_amounts: row.get(4)?,
                    ending_amounts: row.get(5)?,
                    starting_amount: row.get(6)?,
                    ending_amount: row.get(7)?,
                    is_active: row.get(8)?,
                    status: row.get(9)?,
                    sale_ids: row.get(10)?,
                    total_sales_amount: row.get(11)?,
                    expense_ids: row.get(12)?,
                    total_expenses: row.get(13)?,
                    appointment_ids: row.get(14)?,
                    appointments_count: row.get(15)?,
                    total_doctor_fees: row.get(16)?,
                    appointment_cash_payments: row.get(17)?,
                    appointment_card_payments: row.get(18)?,
                    total_paid_appointments: row.get(19)?,
                })
            },
        )
        .optional()?;

    let Some(raw) = raw else {
        return Ok(None);
    };

    let currency = db::default_currency(conn);
    let starting_amounts =
        upgrade_amounts(raw.starting_amounts.as_deref(), raw.starting_amount, &currency)
            .unwrap_or_default();
    let ending_amounts =
        upgrade_amounts(raw.ending_amounts.as_deref(), raw.ending_amount, &currency);

    Ok(Some(CashierSession {
        id: id.to_string(),
        user_id: raw.user_id,
        user_name: raw.user_name,
        start_date: raw.start_date,
        end_date: raw.end_date,
        starting_amounts,
        ending_amounts,
        is_active: raw.is_active,
        status: raw.status,
        sale_ids: decode_id_list(&raw.sale_ids),
        total_sales_amount: raw.total_sales_amount,
        expense_ids: decode_id_list(&raw.expense_ids),
        total_expenses: raw.total_expenses,
        appointment_ids: decode_id_list(&raw.appointment_ids),
        appointments_count: raw.appointments_count,
        total_doctor_fees: raw.total_doctor_fees,
        appointment_cash_payments: raw.appointment_cash_payments,
        appointment_card_payments: raw.appointment_card_payments,
        total_paid_appointments: raw.total_paid_appointments,
    }))
}

/// Prefer the JSON amounts map; fall back to the legacy singular column.
fn upgrade_amounts(json: Option<&str>, legacy: Option<f64>, currency: &str) -> Option<Amounts> {
    if let Some(json) = json {
        return serde_json::from_str(json).ok();
    }
    legacy.map(|v| {
        let mut map = Amounts::new();
        map.insert(currency.to_string(), v);
        map
    })
}

fn require_active(conn: &Connection, session_id: &str) -> Result<()> {
    let is_active: Option<bool> = conn
        .query_row(
            "SELECT is_active FROM cashier_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    match is_active {
        None => Err(OpsError::not_found("CashierSession", session_id)),
        Some(false) => Err(OpsError::InactiveSession),
        Some(true) => Ok(()),
    }
}

fn read_id_list(conn: &Connection, session_id: &str, column: &str) -> Result<Vec<String>> {
    // column names come from RefList, never from input
    let json: String = conn.query_row(
        &format!("SELECT {column} FROM cashier_sessions WHERE id = ?1"),
        params![session_id],
        |row| row.get(0),
    )?;
    Ok(decode_id_list(&json))
}

fn decode_id_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn encode_id_list(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids).map_err(|e| OpsError::Storage(format!("encode id list: {e}")))
}

fn finish_tx(conn: &Connection, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| OpsError::Storage(format!("commit: {e}")))?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
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

    fn start(db: &DbState, user_id: &str) -> CashierSession {
        start_session(
            db,
            &StartSessionRequest {
                user_id: user_id.to_string(),
                user_name: Some("Cashier".to_string()),
                ..Default::default()
            },
        )
        .expect("start session")
    }

    fn seed_appointment(db: &DbState, id: &str, session_id: &str, fee: f64, charge: f64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO appointments (id, doctor_id, patient_name, date, session_id,
                                       session_appointment_number, status, doctor_fee,
                                       total_charge, cashier_session_id, created_at, updated_at)
             VALUES (?1, 'doc1', 'Pat', '2024-01-01', 'doc1_2024-01-01_09:00_12:00',
                     1, 'scheduled', ?2, ?3, ?4, datetime('now'), datetime('now'))",
            params![id, fee, charge, session_id],
        )
        .unwrap();
    }

    #[test]
    fn test_start_end_restart_lifecycle() {
        let db = test_db();

        let s1 = start(&db, "u1");
        assert!(s1.is_active);
        assert_eq!(s1.status, "active");
        assert_eq!(s1.total_sales_amount, 0.0);
        assert!(s1.sale_ids.is_empty());

        // Second start for the same user is rejected
        let err = start_session(
            &db,
            &StartSessionRequest {
                user_id: "u1".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, OpsError::SessionAlreadyActive));

        // End, then a new session is allowed
        let mut ending = Amounts::new();
        ending.insert("lkr".to_string(), 42_000.0);
        let ended = end_session(&db, &s1.id, Some(&ending)).unwrap();
        assert!(!ended.is_active);
        assert_eq!(ended.status, "ended");
        assert!(ended.end_date.is_some());
        assert_eq!(ended.ending_amounts.unwrap().get("lkr"), Some(&42_000.0));

        let s2 = start(&db, "u1");
        assert_ne!(s2.id, s1.id);
    }

    #[test]
    fn test_global_active_check_is_advisory() {
        let db = test_db();
        assert!(!has_any_active_session(&db).unwrap());

        start(&db, "u1");
        assert!(has_any_active_session(&db).unwrap());

        // A different user can still open a session
        let s2 = start(&db, "u2");
        assert!(s2.is_active);
    }

    #[test]
    fn test_add_sale_and_expense() {
        let db = test_db();
        let s = start(&db, "u1");

        add_sale_to_session(&db, &s.id, "sale-1", 1500.0).unwrap();
        add_sale_to_session(&db, &s.id, "sale-2", 500.0).unwrap();
        // Duplicate link is a no-op
        add_sale_to_session(&db, &s.id, "sale-1", 1500.0).unwrap();

        add_expense_to_session(&db, &s.id, "exp-1", 300.0).unwrap();

        let s = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(s.sale_ids, vec!["sale-1", "sale-2"]);
        assert_eq!(s.total_sales_amount, 2000.0);
        assert_eq!(s.expense_ids, vec!["exp-1"]);
        assert_eq!(s.total_expenses, 300.0);
    }

    #[test]
    fn test_writes_require_active_session() {
        let db = test_db();
        let s = start(&db, "u1");
        end_session(&db, &s.id, None).unwrap();

        let err = add_sale_to_session(&db, &s.id, "sale-1", 100.0).unwrap_err();
        assert!(matches!(err, OpsError::InactiveSession));

        let err = add_expense_to_session(&db, "missing", "exp-1", 100.0).unwrap_err();
        assert!(matches!(err, OpsError::NotFound { .. }));

        let err = end_session(&db, &s.id, None).unwrap_err();
        assert!(matches!(err, OpsError::AlreadyEnded));
    }

    #[test]
    fn test_add_and_remove_appointment() {
        let db = test_db();
        let s = start(&db, "u1");

        add_appointment_to_session(&db, &s.id, "apt-1", 2000.0).unwrap();
        add_appointment_to_session(&db, &s.id, "apt-2", 2500.0).unwrap();

        let loaded = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(loaded.appointments_count, 2);
        assert_eq!(loaded.total_doctor_fees, 4500.0);

        remove_appointment_from_session(&db, &s.id, "apt-1", 2000.0).unwrap();
        // Removing an unknown id leaves totals untouched
        remove_appointment_from_session(&db, &s.id, "apt-x", 999.0).unwrap();

        let loaded = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(loaded.appointment_ids, vec!["apt-2"]);
        assert_eq!(loaded.appointments_count, 1);
        assert_eq!(loaded.total_doctor_fees, 2500.0);
    }

    #[test]
    fn test_recompute_is_idempotent_and_self_heals() {
        let db = test_db();
        let s = start(&db, "u1");

        // Appointments written directly (as if an increment was missed)
        seed_appointment(&db, "apt-1", &s.id, 2000.0, 5000.0);
        seed_appointment(&db, "apt-2", &s.id, 1500.0, 3000.0);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE appointments SET is_paid = 1, payment_method = 'cash' WHERE id = 'apt-1'",
                [],
            )
            .unwrap();
            conn.execute(
                "UPDATE appointments SET is_paid = 1, payment_method = 'card' WHERE id = 'apt-2'",
                [],
            )
            .unwrap();
        }

        update_session_appointment_count(&db, &s.id).unwrap();
        let first = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(first.appointments_count, 2);
        assert_eq!(first.total_doctor_fees, 3500.0);
        assert_eq!(first.appointment_cash_payments, 5000.0);
        assert_eq!(first.appointment_card_payments, 3000.0);
        assert_eq!(first.total_paid_appointments, 2);

        // Second run changes nothing
        update_session_appointment_count(&db, &s.id).unwrap();
        let second = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(second.appointment_ids, first.appointment_ids);
        assert_eq!(second.appointment_cash_payments, first.appointment_cash_payments);

        // Cancelled appointments drop out on the next recompute
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE appointments SET status = 'cancelled', is_paid = 0 WHERE id = 'apt-2'",
                [],
            )
            .unwrap();
        }
        update_session_appointment_count(&db, &s.id).unwrap();
        let third = get_session(&db, &s.id).unwrap().unwrap();
        assert_eq!(third.appointments_count, 1);
        assert_eq!(third.total_doctor_fees, 2000.0);
        assert_eq!(third.appointment_card_payments, 0.0);
    }

    #[test]
    fn test_end_session_runs_final_recompute() {
        let db = test_db();
        let s = start(&db, "u1");
        seed_appointment(&db, "apt-1", &s.id, 1000.0, 2500.0);

        // No incremental add ever ran; end_session reconciles
        let ended = end_session(&db, &s.id, None).unwrap();
        assert_eq!(ended.appointments_count, 1);
        assert_eq!(ended.total_doctor_fees, 1000.0);
    }

    #[test]
    fn test_legacy_singular_amounts_upgrade_on_read() {
        let db = test_db();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cashier_sessions (id, user_id, start_date, starting_amount,
                                           ending_amount, is_active, status,
                                           created_at, updated_at)
             VALUES ('legacy-1', 'u9', datetime('now'), 5000.0, 7500.0, 0, 'ended',
                     datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        drop(conn);

        let s = get_session(&db, "legacy-1").unwrap().unwrap();
        assert_eq!(s.starting_amounts.get(db::DEFAULT_CURRENCY), Some(&5000.0));
        assert_eq!(
            s.ending_amounts.unwrap().get(db::DEFAULT_CURRENCY),
            Some(&7500.0)
        );
    }
}
