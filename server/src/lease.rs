//! Lease manager
//!
//! Owns the at-most-once binding between campaign leads and senders. A lease
//! is the `pending -> queued` transition performed by `acquire`; leases not
//! resolved by reconciliation within their deadline are returned to
//! `pending` by the sweeps, which the scheduler runs at the top of every
//! tick. All underlying writes are status-conditional, so the sweeps are
//! idempotent and safe against concurrent reconciliation.

use crate::store::Store;
use anyhow::Result;
use shared::config::ServerConfig;
use shared::model::{CampaignLead, CampaignMode};
use tracing::{debug, info, warn};

/// Leases the oldest pending lead of a campaign to the chosen sender.
///
/// Returns `None` when the campaign has no pending leads.
pub async fn acquire(
    store: &mut Store,
    campaign_id: &str,
    sender_id: &str,
    now: i64,
) -> Result<Option<CampaignLead>> {
    let lead = store.acquire_lead(campaign_id, sender_id, now).await?;
    if let Some(lead) = &lead {
        debug!(
            campaign_id = %campaign_id,
            sender_id = %sender_id,
            lead_id = %lead.id,
            "Lead leased"
        );
    }
    Ok(lead)
}

/// Returns expired leases across all active campaigns to `pending`.
///
/// Auto-mode campaigns reclaim after `stale_lease_auto_seconds`; manual-mode
/// campaigns get the longer `stale_lease_manual_seconds` window. Returns the
/// total number of leads reclaimed.
pub async fn reclaim_stale_leases(
    store: &mut Store,
    config: &ServerConfig,
    now: i64,
) -> Result<usize> {
    let campaigns = store.list_active_campaigns().await?;

    let mut total = 0;
    for campaign in campaigns {
        let threshold = match campaign.mode {
            CampaignMode::Auto => config.stale_lease_auto_seconds,
            CampaignMode::Manual => config.stale_lease_manual_seconds,
        };
        let cutoff = now - threshold;

        match store.reclaim_stale_leases(&campaign.id, cutoff, now).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                info!(
                    campaign_id = %campaign.id,
                    reclaimed,
                    "Returned stale leases to pending"
                );
                total += reclaimed;
            }
            Err(e) => {
                warn!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Stale-lease sweep failed for campaign"
                );
            }
        }
    }
    Ok(total)
}

/// Fails open tasks older than the task deadline and frees their leads.
///
/// Returns the number of tasks failed.
pub async fn reclaim_stale_tasks(
    store: &mut Store,
    config: &ServerConfig,
    now: i64,
) -> Result<usize> {
    let cutoff = now - config.stale_task_threshold_seconds;
    let reclaimed = store.reclaim_stale_tasks(cutoff, now).await?;

    for item in &reclaimed {
        info!(
            task_id = %item.task.id,
            sender_id = ?item.task.sender_id,
            lead_released = item.lead_released,
            "Timed out stale task"
        );
    }
    Ok(reclaimed.len())
}
