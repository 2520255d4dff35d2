//! Local SQLite database layer for the clinic ops core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the shared `DbState` handle the operation modules work
//! against. All multi-statement writes in this crate run inside
//! `BEGIN IMMEDIATE` transactions on this connection, which is what
//! serializes the read-then-write sequences (appointment numbering,
//! session aggregates, start-session checks).

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Fallback currency code for amount maps when no setting is stored.
pub const DEFAULT_CURRENCY: &str = "lkr";

/// Initialize the database at `{data_dir}/clinic.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("clinic.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: staff directory, settings, and attendance tables.
///
/// `attendance` keeps the legacy single `time_in`/`time_out` columns so
/// records imported from the pre-clock-session schema read back as one
/// synthesized session. New writes always go through `clock_sessions`.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- staff directory
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL DEFAULT 'staff',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- attendance (one row per staff member per day)
        CREATE TABLE IF NOT EXISTS attendance (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'present'
                CHECK (status IN ('present', 'present_half', 'present_full',
                                  'absent', 'leave', 'holiday')),
            total_hours_worked REAL NOT NULL DEFAULT 0,
            overtime REAL NOT NULL DEFAULT 0,
            -- legacy single-pair shape (pre clock_sessions records)
            time_in TEXT,
            time_out TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(staff_id, date)
        );

        -- clock_sessions (clock-in/out pairs within a day)
        CREATE TABLE IF NOT EXISTS clock_sessions (
            id TEXT PRIMARY KEY,
            attendance_id TEXT NOT NULL,
            time_in TEXT NOT NULL,
            time_out TEXT,
            hours_worked REAL NOT NULL DEFAULT 0,
            notes TEXT,
            photo_in_url TEXT,
            photo_out_url TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(attendance_id) REFERENCES attendance(id) ON DELETE CASCADE
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_attendance_staff_date ON attendance(staff_id, date);
        CREATE INDEX IF NOT EXISTS idx_clock_sessions_attendance
            ON clock_sessions(attendance_id);
        -- At most one open clock session per attendance record
        CREATE UNIQUE INDEX IF NOT EXISTS idx_clock_sessions_open_unique
            ON clock_sessions(attendance_id)
            WHERE time_out IS NULL;

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (staff, attendance, clock_sessions)");
    Ok(())
}

/// Migration v2: cashier session table.
///
/// Aggregate id lists are JSON TEXT columns; totals are REAL columns
/// bumped with single-statement `x = x + ?` updates and re-derived in
/// full by the reconciliation pass. The legacy singular
/// `starting_amount`/`ending_amount` columns carry pre-multi-currency
/// records and are upgraded to the amounts map at read time.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cashier_sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_name TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT,
            starting_amounts TEXT,
            ending_amounts TEXT,
            -- legacy singular amounts (pre amount-map records)
            starting_amount REAL,
            ending_amount REAL,
            is_active INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'ended')),
            sale_ids TEXT NOT NULL DEFAULT '[]',
            total_sales_amount REAL NOT NULL DEFAULT 0,
            expense_ids TEXT NOT NULL DEFAULT '[]',
            total_expenses REAL NOT NULL DEFAULT 0,
            appointment_ids TEXT NOT NULL DEFAULT '[]',
            appointments_count INTEGER NOT NULL DEFAULT 0,
            total_doctor_fees REAL NOT NULL DEFAULT 0,
            appointment_cash_payments REAL NOT NULL DEFAULT 0,
            appointment_card_payments REAL NOT NULL DEFAULT 0,
            total_paid_appointments INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cashier_sessions_user ON cashier_sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_cashier_sessions_active ON cashier_sessions(is_active);
        -- One active session per user, enforced at the storage layer as a
        -- backstop for the transactional start_session check
        CREATE UNIQUE INDEX IF NOT EXISTS idx_cashier_sessions_user_active_unique
            ON cashier_sessions(user_id)
            WHERE is_active = 1;

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (cashier_sessions)");
    Ok(())
}

/// Migration v3: appointments and the doctor-session registry.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS appointments (
            id TEXT PRIMARY KEY,
            doctor_id TEXT NOT NULL,
            doctor_name TEXT,
            patient_name TEXT NOT NULL,
            patient_phone TEXT,
            date TEXT NOT NULL,
            session_id TEXT NOT NULL,
            session_appointment_number INTEGER,
            status TEXT NOT NULL DEFAULT 'scheduled'
                CHECK (status IN ('scheduled', 'completed', 'cancelled')),
            procedures TEXT NOT NULL DEFAULT '[]',
            total_charge REAL NOT NULL DEFAULT 0,
            doctor_fee REAL NOT NULL DEFAULT 0,
            is_arrived INTEGER NOT NULL DEFAULT 0,
            cashier_session_id TEXT,
            is_paid INTEGER NOT NULL DEFAULT 0,
            paid_at TEXT,
            paid_by TEXT,
            payment_method TEXT CHECK (payment_method IN ('cash', 'card')),
            transaction_id TEXT,
            refunded INTEGER NOT NULL DEFAULT 0,
            paid_in_appointments INTEGER NOT NULL DEFAULT 0,
            paid_through_pos INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- doctor_sessions (clinical session registry)
        CREATE TABLE IF NOT EXISTS doctor_sessions (
            id TEXT PRIMARY KEY,
            doctor_id TEXT NOT NULL,
            doctor_name TEXT,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            is_departed INTEGER NOT NULL DEFAULT 0,
            is_paid INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Indexes for sequencing + session-link scans
        CREATE INDEX IF NOT EXISTS idx_appointments_sequence
            ON appointments(doctor_id, date, session_id);
        CREATE INDEX IF NOT EXISTS idx_appointments_cashier_session
            ON appointments(cashier_session_id);
        CREATE INDEX IF NOT EXISTS idx_appointments_status ON appointments(status);
        CREATE INDEX IF NOT EXISTS idx_doctor_sessions_doctor_date
            ON doctor_sessions(doctor_id, date);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (appointments, doctor_sessions)");
    Ok(())
}

/// Migration v4: expense ledger tables.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS expense_categories (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            amount REAL NOT NULL,
            details TEXT NOT NULL DEFAULT '',
            date TEXT NOT NULL,
            category_id TEXT,
            category_name TEXT,
            cashier_session_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(category_id) REFERENCES expense_categories(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_expenses_category ON expenses(category_id);
        CREATE INDEX IF NOT EXISTS idx_expenses_session ON expenses(cashier_session_id);
        CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        format!("migration v4: {e}")
    })?;

    info!("Applied migration v4 (expenses, expense_categories)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Currency code used when upgrading legacy singular amounts to the
/// amounts-map shape.
pub fn default_currency(conn: &Connection) -> String {
    get_setting(conn, "clinic", "default_currency").unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
