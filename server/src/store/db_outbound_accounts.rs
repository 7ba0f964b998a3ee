//! Outbound account (sending identity) table operations
//!
//! Streak fields on this table are mutated only through `apply_streak`,
//! driven by the streak tracker; warmup auto-completion is driven by the
//! scheduler's warmup sweep.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{OutboundAccount, OutboundAccountStatus, WarmupPlan};
use tracing::debug;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_accounts (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            handle TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            warmup_enabled INTEGER NOT NULL DEFAULT 0,
            warmup_start_date INTEGER,
            warmup_day_caps TEXT NOT NULL DEFAULT '[]',
            streak_days INTEGER NOT NULL DEFAULT 0,
            streak_last_send_date INTEGER,
            rest_until INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts (id)
        )
        "#,
        [],
    )
    .context("Failed to create outbound_accounts table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbound_accounts_account_id
         ON outbound_accounts(account_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbound_accounts_warmup
         ON outbound_accounts(warmup_enabled, warmup_start_date)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, account_id, handle, status, warmup_enabled, warmup_start_date, \
                       warmup_day_caps, streak_days, streak_last_send_date, rest_until, created_at";

fn map_row(row: &Row) -> rusqlite::Result<OutboundAccount> {
    let status_text: String = row.get(3)?;
    let caps_json: String = row.get(6)?;
    Ok(OutboundAccount {
        id: row.get(0)?,
        account_id: row.get(1)?,
        handle: row.get(2)?,
        status: OutboundAccountStatus::parse(&status_text).unwrap_or(OutboundAccountStatus::New),
        warmup: WarmupPlan {
            enabled: row.get::<_, i64>(4)? != 0,
            start_date: row.get(5)?,
            day_caps: serde_json::from_str(&caps_json).unwrap_or_default(),
        },
        streak_days: row.get(7)?,
        streak_last_send_date: row.get(8)?,
        rest_until: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub fn insert(conn: &Connection, account: &OutboundAccount) -> Result<()> {
    let caps_json = serde_json::to_string(&account.warmup.day_caps)
        .context("Failed to serialize warmup day caps")?;
    conn.execute(
        r#"
        INSERT INTO outbound_accounts
            (id, account_id, handle, status, warmup_enabled, warmup_start_date,
             warmup_day_caps, streak_days, streak_last_send_date, rest_until, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            account.id,
            account.account_id,
            account.handle,
            account.status.as_str(),
            account.warmup.enabled as i64,
            account.warmup.start_date,
            caps_json,
            account.streak_days,
            account.streak_last_send_date,
            account.rest_until,
            account.created_at
        ],
    )
    .with_context(|| format!("Failed to insert outbound account: {}", account.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<OutboundAccount>> {
    let account = conn
        .query_row(
            &format!("SELECT {} FROM outbound_accounts WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load outbound account: {}", id))?;
    Ok(account)
}

/// Outbound accounts whose enabled warmup started at or before `cutoff`.
pub fn list_warmup_completable(conn: &Connection, cutoff: i64) -> Result<Vec<OutboundAccount>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM outbound_accounts
         WHERE warmup_enabled = 1 AND warmup_start_date IS NOT NULL
           AND warmup_start_date <= ?1",
        COLUMNS
    ))?;
    let accounts = stmt
        .query_map(params![cutoff], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list warmup-completable outbound accounts")?;
    Ok(accounts)
}

/// Mark an outbound account's warmup finished and the account ready.
///
/// Conditional on the warmup still being enabled so the sweep is idempotent.
pub fn complete_warmup(conn: &Connection, id: &str) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE outbound_accounts
        SET status = 'ready', warmup_enabled = 0
        WHERE id = ?1 AND warmup_enabled = 1
        "#,
        params![id],
    )?;
    Ok(updated == 1)
}

/// Persist the result of a streak-tracker decision.
pub fn apply_streak(
    conn: &Connection,
    id: &str,
    streak_days: i64,
    streak_last_send_date: i64,
    rest_until: Option<i64>,
) -> Result<()> {
    debug!(
        outbound_account_id = %id,
        streak_days,
        rest_until = ?rest_until,
        "Applying streak update"
    );
    conn.execute(
        r#"
        UPDATE outbound_accounts
        SET streak_days = ?1, streak_last_send_date = ?2, rest_until = ?3
        WHERE id = ?4
        "#,
        params![streak_days, streak_last_send_date, rest_until, id],
    )
    .with_context(|| format!("Failed to apply streak update for outbound account: {}", id))?;
    Ok(())
}
