//! Reconciliation of agent task reports
//!
//! Applies completion and failure reports to the task, the campaign lead,
//! the target profile, and the campaign stats, then notifies the owning
//! account over the registry. Handlers run concurrently with the scheduler
//! tick; the store's status-conditional updates make replayed or racing
//! reports no-ops.

use crate::registry::AgentRegistry;
use crate::store::Store;
use anyhow::{anyhow, Result};
use shared::api::{CompletionReport, FailureReport, ServerEvent};
use shared::config::ServerConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Applies a successful completion report for a task.
pub async fn handle_completion(
    store: &Arc<Mutex<Store>>,
    registry: &AgentRegistry,
    task_id: &str,
    report: &CompletionReport,
    now: i64,
) -> Result<()> {
    let applied = {
        let mut store = store.lock().await;
        store.complete_task(task_id, report, now).await?
    };

    let Some(applied) = applied else {
        return Err(anyhow!("Unknown task: {}", task_id));
    };

    if !applied.task_transitioned {
        debug!(task_id = %task_id, "Replayed completion report ignored");
        return Ok(());
    }

    info!(
        task_id = %task_id,
        campaign_id = ?applied.task.campaign_id,
        sender_id = ?applied.task.sender_id,
        lead_updated = applied.lead_transitioned,
        agent_timestamp = ?report.timestamp,
        "Task completed"
    );

    registry
        .push_to_account(
            &applied.task.account_id,
            ServerEvent::TaskCompleted {
                task_id: task_id.to_string(),
                campaign_lead_id: applied.task.campaign_lead_id.clone(),
                username: report.username.clone(),
                thread_id: report.thread_id.clone(),
            },
        )
        .await;

    Ok(())
}

/// Applies a failure report for a task.
///
/// Restriction-class failures additionally quarantine the sender for the
/// configured cooldown and notify the account.
pub async fn handle_failure(
    store: &Arc<Mutex<Store>>,
    registry: &AgentRegistry,
    config: &ServerConfig,
    task_id: &str,
    report: &FailureReport,
    now: i64,
) -> Result<()> {
    let applied = {
        let mut store = store.lock().await;
        store.fail_task(task_id, report, now).await?
    };

    let Some(applied) = applied else {
        return Err(anyhow!("Unknown task: {}", task_id));
    };

    if !applied.task_transitioned {
        debug!(task_id = %task_id, "Replayed failure report ignored");
        return Ok(());
    }

    warn!(
        task_id = %task_id,
        campaign_id = ?applied.task.campaign_id,
        sender_id = ?applied.task.sender_id,
        error_type = ?report.error_type,
        error = %report.error,
        agent_timestamp = ?report.timestamp,
        "Task failed"
    );

    if report.error_type.restricts_sender() {
        if let Some(sender_id) = &applied.task.sender_id {
            let restricted_until = now + config.restriction_hours * 3600;
            {
                let mut store = store.lock().await;
                store
                    .restrict_sender(sender_id, restricted_until, &report.error)
                    .await?;
            }
            info!(
                sender_id = %sender_id,
                restricted_until,
                "Sender restricted after failure"
            );
            registry
                .push_to_account(
                    &applied.task.account_id,
                    ServerEvent::SenderRestricted {
                        sender_id: sender_id.clone(),
                        reason: report.error.clone(),
                        restricted_until,
                    },
                )
                .await;
        }
    }

    registry
        .push_to_account(
            &applied.task.account_id,
            ServerEvent::TaskFailed {
                task_id: task_id.to_string(),
                campaign_lead_id: applied.task.campaign_lead_id.clone(),
                error: report.error.clone(),
            },
        )
        .await;

    Ok(())
}
