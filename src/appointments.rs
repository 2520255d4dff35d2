//! Appointment orchestration: creation, payment, refund, arrival.
//!
//! Coordinates the attendance gate, the cashier-session gate/link, the
//! session sequencer, and the expense ledger. Gating checks run before
//! any write and block the action; post-write bookkeeping (session
//! aggregate recompute, refund expense) is best-effort: the primary
//! record has already been durably written and is never rolled back for
//! a secondary aggregate's failure.
//!
//! State machine per appointment: scheduled → completed(paid) →
//! refunded, with cancelled reachable from any pre-completion state.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cashier;
use crate::db::DbState;
use crate::doctor_sessions;
use crate::error::{OpsError, Result};
use crate::expenses::{self, NewExpense};
use crate::sequencer;
use crate::staff;
use crate::validation;

/// Expense category that refunds are booked under.
pub const REFUND_CATEGORY: &str = "Refunds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub charge: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentPayment {
    pub is_paid: bool,
    pub paid_at: Option<String>,
    pub paid_by: Option<String>,
    pub method: Option<String>,
    pub transaction_id: Option<String>,
    pub refunded: bool,
    pub paid_in_appointments: bool,
    pub paid_through_pos: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub doctor_id: String,
    pub doctor_name: Option<String>,
    pub patient_name: String,
    pub patient_phone: Option<String>,
    pub date: String,
    pub session_id: String,
    pub session_appointment_number: Option<i64>,
    pub status: String,
    pub procedures: Vec<Procedure>,
    pub total_charge: f64,
    pub doctor_fee: f64,
    pub is_arrived: bool,
    pub cashier_session_id: Option<String>,
    pub payment: AppointmentPayment,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAppointmentRequest {
    /// Authenticated caller; when present, attendance and cashier-session
    /// gates apply (doctors are exempt from the cashier gate).
    pub user_id: Option<String>,
    pub doctor_id: String,
    pub doctor_name: Option<String>,
    pub patient_name: String,
    pub patient_phone: Option<String>,
    pub date: String,
    pub session_id: String,
    pub procedures: Vec<Procedure>,
    pub total_charge: Option<f64>,
    pub doctor_fee: Option<f64>,
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Create an appointment.
///
/// Gates run first: the caller must be clocked in, and non-doctor
/// callers must have an active cashier session (which the appointment
/// is linked to). The sequence number is assigned inside the insert
/// transaction so concurrent bookings for the same clinical session
/// cannot collide.
pub fn create_appointment(db: &DbState, req: &CreateAppointmentRequest) -> Result<Appointment> {
    let mut linked_session: Option<String> = None;

    if let Some(user_id) = req.user_id.as_deref() {
        let gate = validation::validate_for_appointments(db, user_id)?;
        if !gate.is_valid {
            return Err(OpsError::MustMarkAttendance);
        }

        let caller = staff::get_staff_by_id(db, user_id)?
            .ok_or_else(|| OpsError::StaffNotFound(user_id.to_string()))?;
        if !caller.is_doctor() {
            match cashier::get_active_session(db, user_id)? {
                Some(session) => linked_session = Some(session.id),
                None => return Err(OpsError::NoCashierSession),
            }
        }
    }

    if req.session_id.trim().is_empty() {
        return Err(OpsError::MissingSessionId);
    }

    let total_charge = req
        .total_charge
        .unwrap_or_else(|| req.procedures.iter().map(|p| p.charge).sum());

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    let conn = db.conn.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| OpsError::Storage(format!("begin transaction: {e}")))?;

    let result = (|| -> Result<i64> {
        let number = sequencer::next_number(&conn, &req.doctor_id, &req.date, &req.session_id);

        conn.execute(
            "INSERT INTO appointments (
                id, doctor_id, doctor_name, patient_name, patient_phone, date,
                session_id, session_appointment_number, status, procedures,
                total_charge, doctor_fee, cashier_session_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'scheduled', ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                req.doctor_id,
                req.doctor_name,
                req.patient_name,
                req.patient_phone,
                req.date,
                req.session_id,
                number,
                serde_json::to_string(&req.procedures)
                    .map_err(|e| OpsError::Storage(format!("encode procedures: {e}")))?,
                total_charge,
                req.doctor_fee.unwrap_or(0.0),
                linked_session,
                now,
            ],
        )?;
        Ok(number)
    })();

    let number = match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| OpsError::Storage(format!("commit: {e}")))?;
            n
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };
    drop(conn);

    info!(
        appointment_id = %id,
        session_id = %req.session_id,
        number,
        "Appointment created"
    );

    // Best-effort: the appointment stands even if the aggregate
    // recompute fails.
    if let Some(session_id) = &linked_session {
        if let Err(e) = cashier::update_session_appointment_count(db, session_id) {
            warn!(
                appointment_id = %id,
                cashier_session_id = %session_id,
                "Session aggregate recompute failed after create: {e}"
            );
        }
    }

    let conn = db.conn.lock()?;
    load_appointment(&conn, &id)?.ok_or_else(|| OpsError::not_found("Appointment", id))
}

/// Cancel an appointment (pre-completion states only).
pub fn cancel_appointment(db: &DbState, id: &str) -> Result<Appointment> {
    let conn = db.conn.lock()?;

    let appt =
        load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))?;
    if appt.status == "completed" {
        return Err(OpsError::Invalid(
            "Cannot cancel a completed appointment".into(),
        ));
    }

    conn.execute(
        "UPDATE appointments SET status = 'cancelled', updated_at = datetime('now')
         WHERE id = ?1",
        params![id],
    )?;
    drop(conn);

    info!(appointment_id = %id, "Appointment cancelled");

    if let Some(session_id) = &appt.cashier_session_id {
        if let Err(e) = cashier::update_session_appointment_count(db, session_id) {
            warn!(
                appointment_id = %id,
                cashier_session_id = %session_id,
                "Session aggregate recompute failed after cancel: {e}"
            );
        }
    }

    let conn = db.conn.lock()?;
    load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))
}

// ---------------------------------------------------------------------------
// Payment
// ---------------------------------------------------------------------------

/// Record payment taken on the appointments screen.
pub fn process_payment(
    db: &DbState,
    id: &str,
    method: PaymentMethod,
    paid_by: Option<&str>,
) -> Result<Appointment> {
    record_payment(db, id, method, paid_by, PaymentChannel::Appointments)
}

/// Record payment taken through the POS.
pub fn process_pos_payment(
    db: &DbState,
    id: &str,
    method: PaymentMethod,
    paid_by: Option<&str>,
) -> Result<Appointment> {
    record_payment(db, id, method, paid_by, PaymentChannel::Pos)
}

enum PaymentChannel {
    Appointments,
    Pos,
}

fn record_payment(
    db: &DbState,
    id: &str,
    method: PaymentMethod,
    paid_by: Option<&str>,
    channel: PaymentChannel,
) -> Result<Appointment> {
    let conn = db.conn.lock()?;

    let appt =
        load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))?;
    if appt.status == "cancelled" {
        return Err(OpsError::Invalid(
            "Cannot take payment for a cancelled appointment".into(),
        ));
    }
    if appt.payment.is_paid {
        return Err(OpsError::Invalid("Appointment is already paid".into()));
    }

    let now = Utc::now().to_rfc3339();
    let transaction_id = format!("TXN-{}", Uuid::new_v4().simple());
    let (in_appointments, through_pos) = match channel {
        PaymentChannel::Appointments => (true, false),
        PaymentChannel::Pos => (false, true),
    };

    conn.execute(
        "UPDATE appointments SET
            is_paid = 1, paid_at = ?1, paid_by = ?2, payment_method = ?3,
            transaction_id = ?4, paid_in_appointments = ?5, paid_through_pos = ?6,
            status = 'completed', updated_at = ?1
         WHERE id = ?7",
        params![
            now,
            paid_by,
            method.as_str(),
            transaction_id,
            in_appointments,
            through_pos,
            id,
        ],
    )?;
    drop(conn);

    info!(
        appointment_id = %id,
        method = %method.as_str(),
        transaction_id = %transaction_id,
        "Appointment payment recorded"
    );

    if let Some(session_id) = &appt.cashier_session_id {
        if let Err(e) = cashier::update_session_appointment_count(db, session_id) {
            warn!(
                appointment_id = %id,
                cashier_session_id = %session_id,
                "Session aggregate recompute failed after payment: {e}"
            );
        }
    }

    let conn = db.conn.lock()?;
    load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))
}

// ---------------------------------------------------------------------------
// Refund
// ---------------------------------------------------------------------------

/// Refund a paid appointment.
///
/// Marks the payment refunded and resets the arrival flag, then books a
/// compensating expense under the "Refunds" category (created on first
/// use). Expense failure is logged; the refund stands.
pub fn process_refund(db: &DbState, id: &str) -> Result<Appointment> {
    let conn = db.conn.lock()?;

    let appt =
        load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))?;
    if !appt.payment.is_paid || appt.payment.refunded {
        return Err(OpsError::CannotRefundUnpaid);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE appointments SET refunded = 1, is_arrived = 0, updated_at = ?1
         WHERE id = ?2",
        params![now, id],
    )?;
    drop(conn);

    info!(appointment_id = %id, amount = %appt.total_charge, "Appointment refunded");

    if let Err(e) = book_refund_expense(db, &appt) {
        warn!(
            appointment_id = %id,
            "Refund expense booking failed (refund stands): {e}"
        );
    }

    if let Some(session_id) = &appt.cashier_session_id {
        if let Err(e) = cashier::update_session_appointment_count(db, session_id) {
            warn!(
                appointment_id = %id,
                cashier_session_id = %session_id,
                "Session aggregate recompute failed after refund: {e}"
            );
        }
    }

    let conn = db.conn.lock()?;
    load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))
}

fn book_refund_expense(db: &DbState, appt: &Appointment) -> Result<()> {
    let category = expenses::get_or_create_category(db, REFUND_CATEGORY)?;

    let details = match doctor_sessions::get_session(db, &appt.session_id)? {
        Some(ds) => format!(
            "Refund for appointment #{} of {} with {} ({} {}-{})",
            appt.session_appointment_number.unwrap_or(0),
            appt.patient_name,
            ds.doctor_name.unwrap_or_else(|| appt.doctor_id.clone()),
            ds.date,
            ds.start_time,
            ds.end_time,
        ),
        None => format!(
            "Refund for appointment #{} of {} (session {})",
            appt.session_appointment_number.unwrap_or(0),
            appt.patient_name,
            appt.session_id,
        ),
    };

    expenses::create_expense(
        db,
        &NewExpense {
            amount: appt.total_charge,
            details,
            date: None,
            category_id: Some(category.id),
            category_name: Some(category.name),
            cashier_session_id: appt.cashier_session_id.clone(),
        },
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Arrival
// ---------------------------------------------------------------------------

/// Set or clear the patient-arrived flag.
///
/// Unmarking is blocked once the appointment is paid-and-arrived and its
/// doctor session has been marked departed and paid; once the session is
/// settled the arrival record must stay put.
pub fn update_patient_arrival(db: &DbState, id: &str, is_arrived: bool) -> Result<Appointment> {
    let conn = db.conn.lock()?;

    let appt =
        load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))?;

    if !is_arrived && appt.payment.is_paid && appt.is_arrived {
        if let Some(ds) = doctor_sessions::get_session_with_conn(&conn, &appt.session_id)? {
            if ds.is_departed && ds.is_paid {
                return Err(OpsError::CannotChangeArrival);
            }
        }
    }

    conn.execute(
        "UPDATE appointments SET is_arrived = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![is_arrived, id],
    )?;

    load_appointment(&conn, id)?.ok_or_else(|| OpsError::not_found("Appointment", id))
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn get_appointment(db: &DbState, id: &str) -> Result<Option<Appointment>> {
    let conn = db.conn.lock()?;
    load_appointment(&conn, id)
}

pub(crate) fn load_appointment(conn: &Connection, id: &str) -> Result<Option<Appointment>> {
    let appt = conn
        .query_row(
            "SELECT doctor_id, doctor_name, patient_name, patient_phone, date,
                    session_id, session_appointment_number, status, procedures,
                    total_charge, doctor_fee, is_arrived, cashier_session_id,
                    is_paid, paid_at, paid_by, payment_method, transaction_id,
                    refunded, paid_in_appointments, paid_through_pos, created_at
             FROM appointments WHERE id = ?1",
            params![id],
            |row| {
                let procedures_json: String = row.get(8)?;
                Ok(Appointment {
                    id: id.to_string(),
                    doctor_id: row.get(0)?,
                    doctor_name: row.get(1)?,
                    patient_name: row.get(2)?,
                    patient_phone: row.get(3)?,
                    date: row.get(4)?,
                    session_id: row.get(5)?,
                    session_appointment_number: row.get(6)?,
                    status: row.get(7)?,
                    procedures: serde_json::from_str(&procedures_json).unwrap_or_default(),
                    total_charge: row.get(9)?,
                    doctor_fee: row.get(10)?,
                    is_arrived: row.get(11)?,
                    cashier_session_id: row.get(12)?,
                    payment: AppointmentPayment {
                        is_paid: row.get(13)?,
                        paid_at: row.get(14)?,
                        paid_by: row.get(15)?,
                        method: row.get(16)?,
                        transaction_id: row.get(17)?,
                        refunded: row.get(18)?,
                        paid_in_appointments: row.get(19)?,
                        paid_through_pos: row.get(20)?,
                    },
                    created_at: row.get(21)?,
                })
            },
        )
        .optional()?;
    Ok(appt)
}

// ===========================================================================
// Tests
// ===========================================================================
