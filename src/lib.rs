//! Clinic operations core: attendance, cashier sessions, appointment
//! orchestration, and reconciliation over an embedded SQLite store.
//!
//! The crate is a library, not a service. Callers construct a
//! [`db::DbState`] via [`db::init`] (or an in-memory connection in
//! tests) and invoke module functions against it. All writes that span
//! a check and a mutation run inside `BEGIN IMMEDIATE` transactions,
//! with partial unique indexes backstopping the single-open-session
//! rules.
//!
//! Module map:
//! - [`attendance`]: clock sessions, worked-hours totals, status rules
//! - [`validation`]: the clocked-in gate used before POS and booking
//! - [`cashier`]: cash-drawer session lifecycle and aggregates
//! - [`appointments`]: booking, payment, refund, arrival
//! - [`sequencer`]: per-clinical-session appointment numbering
//! - [`doctor_sessions`]: clinical session registry and settlement flags
//! - [`expenses`]: expense ledger (refunds book here)
//! - [`staff`], [`photos`]: supporting records and attendance photos

pub mod appointments;
pub mod attendance;
pub mod cashier;
pub mod db;
pub mod doctor_sessions;
pub mod error;
pub mod expenses;
pub mod logging;
pub mod photos;
pub mod sequencer;
pub mod staff;
pub mod validation;

pub use db::DbState;
pub use error::{OpsError, Result};
