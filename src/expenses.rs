//! Expense ledger: categories and expense entries.
//!
//! Thin collaborator surface. The core itself only writes here from
//! refund processing, which books a compensating "Refunds" expense.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{OpsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseCategory {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub amount: f64,
    pub details: String,
    pub date: String,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub cashier_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewExpense {
    pub amount: f64,
    pub details: String,
    pub date: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub cashier_session_id: Option<String>,
}

/// Record an expense entry.
pub fn create_expense(db: &DbState, new: &NewExpense) -> Result<Expense> {
    let conn = db.conn.lock()?;
    create_expense_with_conn(&conn, new)
}

pub(crate) fn create_expense_with_conn(conn: &Connection, new: &NewExpense) -> Result<Expense> {
    if new.amount <= 0.0 {
        return Err(OpsError::Invalid("Expense amount must be positive".into()));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let date = new.date.clone().unwrap_or_else(|| now.clone());

    conn.execute(
        "INSERT INTO expenses (id, amount, details, date, category_id, category_name,
                               cashier_session_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            new.amount,
            new.details,
            date,
            new.category_id,
            new.category_name,
            new.cashier_session_id,
            now,
        ],
    )?;

    info!(expense_id = %id, amount = %new.amount, "Expense recorded");

    Ok(Expense {
        id,
        amount: new.amount,
        details: new.details.clone(),
        date,
        category_id: new.category_id.clone(),
        category_name: new.category_name.clone(),
        cashier_session_id: new.cashier_session_id.clone(),
    })
}

/// List all expense categories.
pub fn get_all_categories(db: &DbState) -> Result<Vec<ExpenseCategory>> {
    let conn = db.conn.lock()?;
    let mut stmt =
        conn.prepare("SELECT id, name, description FROM expense_categories ORDER BY name")?;
    let categories = stmt
        .query_map([], |row| {
            Ok(ExpenseCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<_, _>>()?;
    Ok(categories)
}

/// Create a category. Fails on a duplicate name.
pub fn create_category(
    db: &DbState,
    name: &str,
    description: Option<&str>,
) -> Result<ExpenseCategory> {
    let conn = db.conn.lock()?;
    if find_category(&conn, name)?.is_some() {
        return Err(OpsError::Invalid(format!(
            "Expense category already exists: {name}"
        )));
    }
    insert_category(&conn, name, description)
}

/// Fetch a category by name, creating it when absent.
pub fn get_or_create_category(db: &DbState, name: &str) -> Result<ExpenseCategory> {
    let conn = db.conn.lock()?;
    get_or_create_category_with_conn(&conn, name)
}

pub(crate) fn get_or_create_category_with_conn(
    conn: &Connection,
    name: &str,
) -> Result<ExpenseCategory> {
    if let Some(existing) = find_category(conn, name)? {
        return Ok(existing);
    }
    insert_category(conn, name, None)
}

fn find_category(conn: &Connection, name: &str) -> Result<Option<ExpenseCategory>> {
    let category = conn
        .query_row(
            "SELECT id, name, description FROM expense_categories WHERE name = ?1",
            params![name],
            |row| {
                Ok(ExpenseCategory {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(category)
}

fn insert_category(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
) -> Result<ExpenseCategory> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO expense_categories (id, name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, name, description, now],
    )?;
    info!(category = %name, "Expense category created");
    Ok(ExpenseCategory {
        id,
        name: name.to_string(),
        description: description.map(String::from),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
