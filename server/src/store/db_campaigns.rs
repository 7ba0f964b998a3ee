//! Campaign table operations
//!
//! The campaign row carries the schedule, the round-robin cursors, the burst
//! state, and the aggregated per-status lead counters. Cursor advances are
//! written in the same statement as `last_sent_at` so a dispatch commit is a
//! single conditional update.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{
    BurstParams, Campaign, CampaignMode, CampaignSchedule, CampaignStats, CampaignStatus,
    LeadStatus, PacingMode,
};
use tracing::debug;

pub fn create_table(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            mode TEXT NOT NULL DEFAULT 'auto',
            templates TEXT NOT NULL DEFAULT '[]',
            outbound_account_ids TEXT NOT NULL DEFAULT '[]',
            timezone TEXT NOT NULL DEFAULT 'Etc/UTC',
            active_hours_start INTEGER NOT NULL DEFAULT 9,
            active_hours_end INTEGER NOT NULL DEFAULT 21,
            pacing_mode TEXT NOT NULL DEFAULT 'smooth',
            daily_limit_per_sender INTEGER,
            burst_min_delay_seconds INTEGER NOT NULL DEFAULT 30,
            burst_max_delay_seconds INTEGER NOT NULL DEFAULT 120,
            burst_messages_per_group INTEGER NOT NULL DEFAULT 5,
            burst_min_break_seconds INTEGER NOT NULL DEFAULT 600,
            burst_max_break_seconds INTEGER NOT NULL DEFAULT 1800,
            last_sender_index INTEGER NOT NULL DEFAULT -1,
            last_message_index INTEGER NOT NULL DEFAULT 0,
            last_sent_at INTEGER,
            burst_sent_in_group INTEGER NOT NULL DEFAULT 0,
            burst_break_until INTEGER,
            stats_pending INTEGER NOT NULL DEFAULT 0,
            stats_queued INTEGER NOT NULL DEFAULT 0,
            stats_sent INTEGER NOT NULL DEFAULT 0,
            stats_delivered INTEGER NOT NULL DEFAULT 0,
            stats_replied INTEGER NOT NULL DEFAULT 0,
            stats_failed INTEGER NOT NULL DEFAULT 0,
            stats_skipped INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts (id)
        )
        "#,
        [],
    )
    .context("Failed to create campaigns table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_campaigns_account_id ON campaigns(account_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_campaigns_status_mode ON campaigns(status, mode)",
        [],
    )?;

    Ok(())
}

const COLUMNS: &str = "id, account_id, name, status, mode, templates, outbound_account_ids, \
                       timezone, active_hours_start, active_hours_end, pacing_mode, \
                       daily_limit_per_sender, burst_min_delay_seconds, burst_max_delay_seconds, \
                       burst_messages_per_group, burst_min_break_seconds, burst_max_break_seconds, \
                       last_sender_index, last_message_index, last_sent_at, burst_sent_in_group, \
                       burst_break_until, stats_pending, stats_queued, stats_sent, \
                       stats_delivered, stats_replied, stats_failed, stats_skipped, created_at";

fn map_row(row: &Row) -> rusqlite::Result<Campaign> {
    let status_text: String = row.get(3)?;
    let mode_text: String = row.get(4)?;
    let templates_json: String = row.get(5)?;
    let outbound_ids_json: String = row.get(6)?;
    let pacing_text: String = row.get(10)?;

    Ok(Campaign {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        status: CampaignStatus::parse(&status_text).unwrap_or(CampaignStatus::Draft),
        mode: CampaignMode::parse(&mode_text).unwrap_or(CampaignMode::Auto),
        templates: serde_json::from_str(&templates_json).unwrap_or_default(),
        outbound_account_ids: serde_json::from_str(&outbound_ids_json).unwrap_or_default(),
        schedule: CampaignSchedule {
            timezone: row.get(7)?,
            active_hours_start: row.get(8)?,
            active_hours_end: row.get(9)?,
            pacing_mode: PacingMode::parse(&pacing_text).unwrap_or(PacingMode::Smooth),
            daily_limit_per_sender: row.get(11)?,
            burst: BurstParams {
                min_delay_seconds: row.get::<_, i64>(12)?.max(0) as u64,
                max_delay_seconds: row.get::<_, i64>(13)?.max(0) as u64,
                messages_per_group: row.get::<_, i64>(14)?.max(0) as u32,
                min_break_seconds: row.get::<_, i64>(15)?.max(0) as u64,
                max_break_seconds: row.get::<_, i64>(16)?.max(0) as u64,
            },
        },
        last_sender_index: row.get(17)?,
        last_message_index: row.get(18)?,
        last_sent_at: row.get(19)?,
        burst_sent_in_group: row.get(20)?,
        burst_break_until: row.get(21)?,
        stats: CampaignStats {
            pending: row.get(22)?,
            queued: row.get(23)?,
            sent: row.get(24)?,
            delivered: row.get(25)?,
            replied: row.get(26)?,
            failed: row.get(27)?,
            skipped: row.get(28)?,
        },
        created_at: row.get(29)?,
    })
}

pub fn insert(conn: &Connection, campaign: &Campaign) -> Result<()> {
    let templates_json =
        serde_json::to_string(&campaign.templates).context("Failed to serialize templates")?;
    let outbound_ids_json = serde_json::to_string(&campaign.outbound_account_ids)
        .context("Failed to serialize outbound account ids")?;

    conn.execute(
        r#"
        INSERT INTO campaigns
            (id, account_id, name, status, mode, templates, outbound_account_ids,
             timezone, active_hours_start, active_hours_end, pacing_mode,
             daily_limit_per_sender, burst_min_delay_seconds, burst_max_delay_seconds,
             burst_messages_per_group, burst_min_break_seconds, burst_max_break_seconds,
             last_sender_index, last_message_index, last_sent_at, burst_sent_in_group,
             burst_break_until, stats_pending, stats_queued, stats_sent, stats_delivered,
             stats_replied, stats_failed, stats_skipped, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)
        "#,
        params![
            campaign.id,
            campaign.account_id,
            campaign.name,
            campaign.status.as_str(),
            campaign.mode.as_str(),
            templates_json,
            outbound_ids_json,
            campaign.schedule.timezone,
            campaign.schedule.active_hours_start,
            campaign.schedule.active_hours_end,
            campaign.schedule.pacing_mode.as_str(),
            campaign.schedule.daily_limit_per_sender,
            campaign.schedule.burst.min_delay_seconds as i64,
            campaign.schedule.burst.max_delay_seconds as i64,
            campaign.schedule.burst.messages_per_group as i64,
            campaign.schedule.burst.min_break_seconds as i64,
            campaign.schedule.burst.max_break_seconds as i64,
            campaign.last_sender_index,
            campaign.last_message_index,
            campaign.last_sent_at,
            campaign.burst_sent_in_group,
            campaign.burst_break_until,
            campaign.stats.pending,
            campaign.stats.queued,
            campaign.stats.sent,
            campaign.stats.delivered,
            campaign.stats.replied,
            campaign.stats.failed,
            campaign.stats.skipped,
            campaign.created_at
        ],
    )
    .with_context(|| format!("Failed to insert campaign: {}", campaign.id))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Campaign>> {
    let campaign = conn
        .query_row(
            &format!("SELECT {} FROM campaigns WHERE id = ?1", COLUMNS),
            params![id],
            map_row,
        )
        .optional()
        .with_context(|| format!("Failed to load campaign: {}", id))?;
    Ok(campaign)
}

/// Active campaigns driven by the scheduler.
pub fn list_active_auto(conn: &Connection) -> Result<Vec<Campaign>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM campaigns WHERE status = 'active' AND mode = 'auto'
         ORDER BY created_at ASC, id ASC",
        COLUMNS
    ))?;
    let campaigns = stmt
        .query_map([], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list active auto-mode campaigns")?;
    Ok(campaigns)
}

/// All active campaigns, regardless of mode (lease reclamation scope).
pub fn list_active(conn: &Connection) -> Result<Vec<Campaign>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM campaigns WHERE status = 'active' ORDER BY created_at ASC, id ASC",
        COLUMNS
    ))?;
    let campaigns = stmt
        .query_map([], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list active campaigns")?;
    Ok(campaigns)
}

pub fn set_status(conn: &Connection, id: &str, status: CampaignStatus) -> Result<()> {
    conn.execute(
        "UPDATE campaigns SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id],
    )
    .with_context(|| format!("Failed to set campaign status: {}", id))?;
    Ok(())
}

/// Transition an active campaign to completed once it has no open leads.
///
/// Conditional on the live counters so a campaign that re-acquired work in
/// the meantime is left alone.
pub fn complete_if_drained(conn: &Connection, id: &str) -> Result<bool> {
    let updated = conn.execute(
        r#"
        UPDATE campaigns
        SET status = 'completed'
        WHERE id = ?1 AND status = 'active' AND stats_pending = 0 AND stats_queued = 0
        "#,
        params![id],
    )?;
    Ok(updated == 1)
}

/// Commit one dispatch: advance the cursors, stamp the send, and count the
/// send toward the current burst group.
///
/// `new_message_index` is unchanged when the lead carried a custom message.
pub fn commit_dispatch(
    conn: &Connection,
    id: &str,
    new_sender_index: i64,
    new_message_index: i64,
    now: i64,
    count_burst_send: bool,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE campaigns
        SET last_sender_index = ?1,
            last_message_index = ?2,
            last_sent_at = ?3,
            burst_sent_in_group = burst_sent_in_group + ?4
        WHERE id = ?5
        "#,
        params![
            new_sender_index,
            new_message_index,
            now,
            count_burst_send as i64,
            id
        ],
    )
    .with_context(|| format!("Failed to commit dispatch for campaign: {}", id))?;
    Ok(())
}

/// Start a burst group break and reset the in-group counter.
pub fn start_burst_break(conn: &Connection, id: &str, break_until: i64) -> Result<()> {
    conn.execute(
        "UPDATE campaigns SET burst_break_until = ?1, burst_sent_in_group = 0 WHERE id = ?2",
        params![break_until, id],
    )
    .with_context(|| format!("Failed to start burst break for campaign: {}", id))?;
    Ok(())
}

/// Clear an expired burst break.
pub fn clear_burst_break(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE campaigns SET burst_break_until = NULL WHERE id = ?1",
        params![id],
    )
    .with_context(|| format!("Failed to clear burst break for campaign: {}", id))?;
    Ok(())
}

/// Reset burst counters when the last send happened on an earlier local day.
pub fn reset_burst_state(conn: &Connection, id: &str) -> Result<()> {
    debug!(campaign_id = %id, "Resetting burst state for a new local day");
    conn.execute(
        "UPDATE campaigns SET burst_sent_in_group = 0, burst_break_until = NULL WHERE id = ?1",
        params![id],
    )
    .with_context(|| format!("Failed to reset burst state for campaign: {}", id))?;
    Ok(())
}

/// Campaign-wide sends counted for pacing: leads queued or sent whose last
/// transition falls inside the local-day range.
pub fn count_sends_in_range(conn: &Connection, id: &str, start: i64, end: i64) -> Result<i64> {
    let count = conn
        .query_row(
            r#"
            SELECT COUNT(*) FROM campaign_leads
            WHERE campaign_id = ?1 AND status IN ('sent', 'queued')
              AND updated_at >= ?2 AND updated_at < ?3
            "#,
            params![id, start, end],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("Failed to count sends for campaign: {}", id))?;
    Ok(count)
}

fn stats_column(status: LeadStatus) -> &'static str {
    match status {
        LeadStatus::Pending => "stats_pending",
        LeadStatus::Queued => "stats_queued",
        LeadStatus::Sent => "stats_sent",
        LeadStatus::Delivered => "stats_delivered",
        LeadStatus::Replied => "stats_replied",
        LeadStatus::Failed => "stats_failed",
        LeadStatus::Skipped => "stats_skipped",
    }
}

/// Move `n` leads between two stats counters in one write.
///
/// Every lead status transition calls this inside the same transaction as
/// the lead update, keeping the counter sum equal to the lead count.
pub fn shift_stats(
    conn: &Connection,
    id: &str,
    from: LeadStatus,
    to: LeadStatus,
    n: i64,
) -> Result<()> {
    if n == 0 || from == to {
        return Ok(());
    }
    let from_col = stats_column(from);
    let to_col = stats_column(to);
    let sql = format!(
        "UPDATE campaigns SET {from_col} = MAX({from_col} - ?1, 0), {to_col} = {to_col} + ?1
         WHERE id = ?2"
    );
    conn.execute(&sql, params![n, id])
        .with_context(|| format!("Failed to shift campaign stats for: {}", id))?;
    Ok(())
}

/// Count a newly attached lead in the pending bucket.
pub fn bump_pending(conn: &Connection, id: &str, n: i64) -> Result<()> {
    conn.execute(
        "UPDATE campaigns SET stats_pending = stats_pending + ?1 WHERE id = ?2",
        params![n, id],
    )
    .with_context(|| format!("Failed to bump pending count for campaign: {}", id))?;
    Ok(())
}
