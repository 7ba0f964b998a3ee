//! Account (tenant) table operations

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::Account;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'Etc/UTC',
            features TEXT NOT NULL DEFAULT '[]',
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create accounts table")?;
    Ok(())
}

fn map_row(row: &Row) -> rusqlite::Result<Account> {
    let features_json: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        timezone: row.get(2)?,
        features: serde_json::from_str(&features_json).unwrap_or_default(),
        deleted: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

const COLUMNS: &str = "id, name, timezone, features, deleted, created_at";

pub fn insert(conn: &Connection, account: &Account) -> Result<()> {
    let features_json =
        serde_json::to_string(&account.features).context("Failed to serialize account features")?;
    conn.execute(
        r#"
        INSERT INTO accounts (id, name, timezone, features, deleted, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            account.id,
            account.name,
            account.timezone,
            features_json,
            account.deleted as i64,
            account.created_at
        ],
    )
    .with_context(|| format!("Failed to insert account: {}", account.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load account: {}", id))?;
    Ok(account)
}
