//! Sender (live session) table operations
//!
//! A sender row is created the first time an agent authenticates for an
//! outbound account. The `status` column tracks the store's view of
//! liveness; the in-memory registry is reconciled against it through
//! heartbeats and the stale-sender sweep.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{Sender, SenderStatus};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS senders (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            outbound_account_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'offline',
            last_heartbeat INTEGER,
            daily_limit INTEGER,
            test_mode INTEGER NOT NULL DEFAULT 0,
            restricted_until INTEGER,
            restriction_reason TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts (id),
            FOREIGN KEY (outbound_account_id) REFERENCES outbound_accounts (id)
        )
        "#,
        [],
    )
    .context("Failed to create senders table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_senders_account_id ON senders(account_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_senders_status_heartbeat
         ON senders(status, last_heartbeat)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_senders_outbound_account
         ON senders(outbound_account_id)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, account_id, outbound_account_id, status, last_heartbeat, daily_limit, \
                       test_mode, restricted_until, restriction_reason, created_at";

fn map_row(row: &Row) -> rusqlite::Result<Sender> {
    let status_text: String = row.get(3)?;
    Ok(Sender {
        id: row.get(0)?,
        account_id: row.get(1)?,
        outbound_account_id: row.get(2)?,
        status: SenderStatus::parse(&status_text).unwrap_or(SenderStatus::Offline),
        last_heartbeat: row.get(4)?,
        daily_limit: row.get(5)?,
        test_mode: row.get::<_, i64>(6)? != 0,
        restricted_until: row.get(7)?,
        restriction_reason: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn insert(conn: &Connection, sender: &Sender) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO senders
            (id, account_id, outbound_account_id, status, last_heartbeat, daily_limit,
             test_mode, restricted_until, restriction_reason, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            sender.id,
            sender.account_id,
            sender.outbound_account_id,
            sender.status.as_str(),
            sender.last_heartbeat,
            sender.daily_limit,
            sender.test_mode,
            sender.restricted_until,
            sender.restriction_reason,
            sender.created_at
        ],
    )
    .with_context(|| format!("Failed to insert sender: {}", sender.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Sender>> {
    let sender = conn
        .query_row(
            &format!("SELECT {} FROM senders WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load sender: {}", id))?;
    Ok(sender)
}

/// All senders backed by any of the given outbound accounts.
pub fn for_outbound_accounts(
    conn: &Connection,
    outbound_account_ids: &[String],
) -> Result<Vec<Sender>> {
    if outbound_account_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = outbound_account_ids
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM senders WHERE outbound_account_id IN ({}) ORDER BY created_at ASC, id ASC",
        COLUMNS, placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    let senders = stmt
        .query_map(rusqlite::params_from_iter(outbound_account_ids.iter()), map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list senders for outbound accounts")?;
    Ok(senders)
}

/// Mark a sender online with a fresh heartbeat (agent connect).
pub fn set_online(conn: &Connection, id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE senders SET status = 'online', last_heartbeat = ?1 WHERE id = ?2",
        params![now, id],
    )
    .with_context(|| format!("Failed to mark sender online: {}", id))?;
    Ok(())
}

/// Mark a sender offline (agent disconnect or stale heartbeat).
pub fn set_offline(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE senders SET status = 'offline' WHERE id = ?1",
        params![id],
    )
    .with_context(|| format!("Failed to mark sender offline: {}", id))?;
    Ok(())
}

/// Renew a sender's heartbeat.
pub fn heartbeat(conn: &Connection, id: &str, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE senders SET last_heartbeat = ?1 WHERE id = ?2",
        params![now, id],
    )
    .with_context(|| format!("Failed to record heartbeat for sender: {}", id))?;
    Ok(())
}

/// Online senders whose heartbeat is older than `cutoff`.
///
/// Returns `(sender_id, account_id)` pairs; callers flip each to offline and
/// notify the owning account.
pub fn list_stale_online(conn: &Connection, cutoff: i64) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id FROM senders
         WHERE status = 'online' AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
    )?;
    let rows = stmt
        .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list stale online senders")?;
    Ok(rows)
}

/// Put a sender into restriction cooldown.
pub fn restrict(
    conn: &Connection,
    id: &str,
    restricted_until: i64,
    reason: &str,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE senders
        SET status = 'restricted', restricted_until = ?1, restriction_reason = ?2
        WHERE id = ?3
        "#,
        params![restricted_until, reason, id],
    )
    .with_context(|| format!("Failed to restrict sender: {}", id))?;
    Ok(())
}
