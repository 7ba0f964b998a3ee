//! Outbound lead (target profile) table operations

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::OutboundLead;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS outbound_leads (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            username TEXT NOT NULL,
            name TEXT,
            bio TEXT,
            followers INTEGER,
            messaged INTEGER NOT NULL DEFAULT 0,
            replied INTEGER NOT NULL DEFAULT 0,
            thread_id TEXT,
            dm_date INTEGER,
            last_message TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts (id)
        )
        "#,
        [],
    )
    .context("Failed to create outbound_leads table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_outbound_leads_account_username
         ON outbound_leads(account_id, username)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, account_id, username, name, bio, followers, messaged, replied, \
                       thread_id, dm_date, last_message, created_at";

fn map_row(row: &Row) -> rusqlite::Result<OutboundLead> {
    Ok(OutboundLead {
        id: row.get(0)?,
        account_id: row.get(1)?,
        username: row.get(2)?,
        name: row.get(3)?,
        bio: row.get(4)?,
        followers: row.get(5)?,
        messaged: row.get::<_, i64>(6)? != 0,
        replied: row.get::<_, i64>(7)? != 0,
        thread_id: row.get(8)?,
        dm_date: row.get(9)?,
        last_message: row.get(10)?,
        created_at: row.get(11)?,
    })
}

pub fn insert(conn: &Connection, lead: &OutboundLead) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO outbound_leads
            (id, account_id, username, name, bio, followers, messaged, replied,
             thread_id, dm_date, last_message, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            lead.id,
            lead.account_id,
            lead.username,
            lead.name,
            lead.bio,
            lead.followers,
            lead.messaged as i64,
            lead.replied as i64,
            lead.thread_id,
            lead.dm_date,
            lead.last_message,
            lead.created_at
        ],
    )
    .with_context(|| format!("Failed to insert outbound lead: {}", lead.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<OutboundLead>> {
    let lead = conn
        .query_row(
            &format!("SELECT {} FROM outbound_leads WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load outbound lead: {}", id))?;
    Ok(lead)
}

/// Record a delivered direct message on the target profile.
///
/// `thread_id` is kept when the agent did not report one.
pub fn mark_messaged(
    conn: &Connection,
    id: &str,
    message: &str,
    thread_id: Option<&str>,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE outbound_leads
        SET messaged = 1, dm_date = ?1, last_message = ?2,
            thread_id = COALESCE(?3, thread_id)
        WHERE id = ?4
        "#,
        params![now, message, thread_id, id],
    )
    .with_context(|| format!("Failed to mark outbound lead messaged: {}", id))?;
    Ok(())
}
