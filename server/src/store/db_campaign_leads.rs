//! Campaign lead table operations
//!
//! Every status transition here is a conditional update keyed on the current
//! status; callers pair each transition with the matching stats shift on the
//! campaign row inside one transaction.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{CampaignLead, LeadStatus};

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS campaign_leads (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            outbound_lead_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            sender_id TEXT,
            queued_at INTEGER,
            task_id TEXT,
            custom_message TEXT,
            message_used TEXT,
            template_index INTEGER,
            failed_sender_ids TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            manual_override INTEGER NOT NULL DEFAULT 0,
            sent_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (campaign_id, outbound_lead_id),
            FOREIGN KEY (campaign_id) REFERENCES campaigns (id),
            FOREIGN KEY (outbound_lead_id) REFERENCES outbound_leads (id)
        )
        "#,
        [],
    )
    .context("Failed to create campaign_leads table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_campaign_leads_campaign_status
         ON campaign_leads(campaign_id, status, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_campaign_leads_sender_updated
         ON campaign_leads(sender_id, updated_at)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, campaign_id, outbound_lead_id, status, sender_id, queued_at, task_id, \
                       custom_message, message_used, template_index, failed_sender_ids, \
                       last_error, manual_override, sent_at, created_at, updated_at";

fn map_row(row: &Row) -> rusqlite::Result<CampaignLead> {
    let status_text: String = row.get(3)?;
    let failed_json: String = row.get(10)?;
    Ok(CampaignLead {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        outbound_lead_id: row.get(2)?,
        status: LeadStatus::parse(&status_text).unwrap_or(LeadStatus::Pending),
        sender_id: row.get(4)?,
        queued_at: row.get(5)?,
        task_id: row.get(6)?,
        custom_message: row.get(7)?,
        message_used: row.get(8)?,
        template_index: row.get(9)?,
        failed_sender_ids: serde_json::from_str(&failed_json).unwrap_or_default(),
        last_error: row.get(11)?,
        manual_override: row.get::<_, i64>(12)? != 0,
        sent_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub fn insert(conn: &Connection, lead: &CampaignLead) -> Result<()> {
    let failed_json = serde_json::to_string(&lead.failed_sender_ids)
        .context("Failed to serialize failed sender ids")?;
    conn.execute(
        r#"
        INSERT INTO campaign_leads
            (id, campaign_id, outbound_lead_id, status, sender_id, queued_at, task_id,
             custom_message, message_used, template_index, failed_sender_ids, last_error,
             manual_override, sent_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        params![
            lead.id,
            lead.campaign_id,
            lead.outbound_lead_id,
            lead.status.as_str(),
            lead.sender_id,
            lead.queued_at,
            lead.task_id,
            lead.custom_message,
            lead.message_used,
            lead.template_index,
            failed_json,
            lead.last_error,
            lead.manual_override as i64,
            lead.sent_at,
            lead.created_at,
            lead.updated_at
        ],
    )
    .with_context(|| format!("Failed to insert campaign lead: {}", lead.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<CampaignLead>> {
    let lead = conn
        .query_row(
            &format!("SELECT {} FROM campaign_leads WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load campaign lead: {}", id))?;
    Ok(lead)
}

/// Atomically lease the oldest pending lead of a campaign to a sender.
///
/// The update is conditioned on `status = 'pending'` so a concurrent
/// transition loses cleanly; the caller runs this inside a transaction
/// together with the stats shift.
pub fn acquire_oldest_pending(
    conn: &Connection,
    campaign_id: &str,
    sender_id: &str,
    now: i64,
) -> Result<Option<CampaignLead>> {
    let candidate: Option<String> = conn
        .query_row(
            r#"
            SELECT id FROM campaign_leads
            WHERE campaign_id = ?1 AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
            params![campaign_id],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to select pending lead for campaign: {}", campaign_id))?;

    let Some(lead_id) = candidate else {
        return Ok(None);
    };

    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'queued', sender_id = ?1, queued_at = ?2, updated_at = ?2
        WHERE id = ?3 AND status = 'pending'
        "#,
        params![sender_id, now, lead_id],
    )?;
    if updated == 0 {
        return Ok(None);
    }

    get(conn, &lead_id)
}

/// Attach the created task and the message used to a freshly leased lead.
pub fn attach_task(
    conn: &Connection,
    lead_id: &str,
    task_id: &str,
    message_used: &str,
    template_index: Option<i64>,
    now: i64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE campaign_leads
        SET task_id = ?1, message_used = ?2, template_index = ?3, updated_at = ?4
        WHERE id = ?5
        "#,
        params![task_id, message_used, template_index, now, lead_id],
    )
    .with_context(|| format!("Failed to attach task to campaign lead: {}", lead_id))?;
    Ok(())
}

/// Return queued leads with an expired lease to pending.
///
/// Returns the number of leads reclaimed; the caller shifts stats by the
/// same amount. Running the sweep twice is a no-op the second time.
pub fn reclaim_stale_queued(
    conn: &Connection,
    campaign_id: &str,
    cutoff: i64,
    now: i64,
) -> Result<usize> {
    let reclaimed = conn
        .execute(
            r#"
            UPDATE campaign_leads
            SET status = 'pending', sender_id = NULL, queued_at = NULL, task_id = NULL,
                updated_at = ?1
            WHERE campaign_id = ?2 AND status = 'queued' AND queued_at < ?3
            "#,
            params![now, campaign_id, cutoff],
        )
        .with_context(|| format!("Failed to reclaim stale leases for campaign: {}", campaign_id))?;
    Ok(reclaimed)
}

/// Conditionally return one queued lead to pending (stale-task path).
pub fn release_queued(conn: &Connection, lead_id: &str, now: i64) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'pending', sender_id = NULL, queued_at = NULL, task_id = NULL,
            updated_at = ?1
        WHERE id = ?2 AND status = 'queued'
        "#,
        params![now, lead_id],
    )?;
    Ok(updated == 1)
}

/// Move a queued lead to sent (completion path). Conditional on `queued` so
/// replayed completion reports are no-ops.
pub fn mark_sent(conn: &Connection, lead_id: &str, now: i64) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'sent', sent_at = ?1, updated_at = ?1
        WHERE id = ?2 AND status = 'queued'
        "#,
        params![now, lead_id],
    )?;
    Ok(updated == 1)
}

/// Move a queued lead to failed with the reported error.
pub fn mark_failed(conn: &Connection, lead_id: &str, error: &str, now: i64) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'failed', last_error = ?1, updated_at = ?2
        WHERE id = ?3 AND status = 'queued'
        "#,
        params![error, now, lead_id],
    )?;
    Ok(updated == 1)
}

/// Terminally skip a lead whose target is gone or already messaged.
///
/// The lead is freshly queued when this runs, so the condition mirrors the
/// other terminal transitions.
pub fn mark_skipped(conn: &Connection, lead_id: &str, reason: &str, now: i64) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'skipped', last_error = ?1, sender_id = NULL, queued_at = NULL,
            task_id = NULL, updated_at = ?2
        WHERE id = ?3 AND status = 'queued'
        "#,
        params![reason, now, lead_id],
    )?;
    Ok(updated == 1)
}

/// Reset one failed or skipped lead to pending for a user-initiated retry.
///
/// The sender that previously worked the lead is recorded in
/// `failed_sender_ids`. Returns the prior status when the reset applied.
pub fn reset_for_retry(conn: &Connection, lead_id: &str, now: i64) -> Result<Option<LeadStatus>> {
    let Some(lead) = get(conn, lead_id)? else {
        return Ok(None);
    };
    if lead.status != LeadStatus::Failed && lead.status != LeadStatus::Skipped {
        return Ok(None);
    }

    let mut failed_ids = lead.failed_sender_ids.clone();
    if let Some(sender_id) = &lead.sender_id {
        if !failed_ids.contains(sender_id) {
            failed_ids.push(sender_id.clone());
        }
    }
    let failed_json =
        serde_json::to_string(&failed_ids).context("Failed to serialize failed sender ids")?;

    let updated = conn.execute(
        r#"
        UPDATE campaign_leads
        SET status = 'pending', sender_id = NULL, queued_at = NULL, task_id = NULL,
            last_error = NULL, failed_sender_ids = ?1, updated_at = ?2
        WHERE id = ?3 AND status IN ('failed', 'skipped')
        "#,
        params![failed_json, now, lead_id],
    )?;

    Ok(if updated == 1 { Some(lead.status) } else { None })
}

/// Sends attributed to one sender in a unix-time range, optionally scoped to
/// a single campaign. Counts leads currently queued or sent whose last
/// transition falls inside the range.
pub fn count_sender_sends_in_range(
    conn: &Connection,
    sender_id: &str,
    start: i64,
    end: i64,
    campaign_id: Option<&str>,
) -> Result<i64> {
    let count = match campaign_id {
        Some(cid) => conn.query_row(
            r#"
            SELECT COUNT(*) FROM campaign_leads
            WHERE sender_id = ?1 AND campaign_id = ?2 AND status IN ('sent', 'queued')
              AND updated_at >= ?3 AND updated_at < ?4
            "#,
            params![sender_id, cid, start, end],
            |row| row.get::<_, i64>(0),
        ),
        None => conn.query_row(
            r#"
            SELECT COUNT(*) FROM campaign_leads
            WHERE sender_id = ?1 AND status IN ('sent', 'queued')
              AND updated_at >= ?2 AND updated_at < ?3
            "#,
            params![sender_id, start, end],
            |row| row.get::<_, i64>(0),
        ),
    }
    .with_context(|| format!("Failed to count sends for sender: {}", sender_id))?;
    Ok(count)
}

/// Number of leads the scheduler could still work for a campaign.
pub fn count_open(conn: &Connection, campaign_id: &str) -> Result<i64> {
    let count = conn
        .query_row(
            r#"
            SELECT COUNT(*) FROM campaign_leads
            WHERE campaign_id = ?1 AND status IN ('pending', 'queued')
            "#,
            params![campaign_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("Failed to count open leads for campaign: {}", campaign_id))?;
    Ok(count)
}

/// Total number of leads attached to a campaign.
pub fn count_total(conn: &Connection, campaign_id: &str) -> Result<i64> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM campaign_leads WHERE campaign_id = ?1",
            params![campaign_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("Failed to count leads for campaign: {}", campaign_id))?;
    Ok(count)
}
