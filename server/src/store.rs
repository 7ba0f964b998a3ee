//! Durable state for the dispatch server
//!
//! This module owns the SQLite store holding campaigns, campaign leads,
//! outbound accounts, senders, outbound leads, and tasks. It is the single
//! source of truth; the in-memory agent registry only caches reachability.
//!
//! Every state transition is expressed as a conditional update keyed on the
//! current status, so concurrent reconciliation reports, sweeps, and the
//! scheduler cannot double-apply an effect. Transitions that must move a
//! campaign stats counter run in the same transaction as the lead update.

// Entity-specific table modules
mod db_accounts;
mod db_campaign_leads;
mod db_campaigns;
mod db_outbound_accounts;
mod db_outbound_leads;
mod db_senders;
mod db_tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::api::{CompletionReport, FailureKind, FailureReport};
use shared::model::{
    Account, Campaign, CampaignLead, CampaignStatus, LeadStatus, OutboundAccount, OutboundLead,
    Sender, SenderStatus, Task,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The default name for the server's database file.
const DATABASE_FILE: &str = "dispatch.db";

/// A reconciliation report applied to the store.
///
/// `task` is the row as loaded before the terminal write; the flags say
/// which of the conditional updates actually fired.
#[derive(Debug)]
pub struct ReconcileApplied {
    pub task: Task,
    pub task_transitioned: bool,
    pub lead_transitioned: bool,
}

/// One task failed by the stale-task sweep or the operator reset.
#[derive(Debug)]
pub struct ReclaimedTask {
    pub task: Task,
    pub lead_released: bool,
}

/// Manages the SQLite store for the dispatch server.
pub struct Store {
    /// The path to the SQLite database file.
    db_path: PathBuf,
    /// The active database connection, opened lazily.
    connection: Option<Connection>,
}

impl Store {
    /// Creates a new `Store` manager, ensuring the data directory exists.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
        })
    }

    /// Initializes the database by creating tables and indexes if they don't
    /// exist. Idempotent and safe to call on every server startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing store at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_accounts::create_table(conn)?;
        db_outbound_accounts::create_table(conn)?;
        db_senders::create_table(conn)?;
        db_campaigns::create_table(conn)?;
        db_outbound_leads::create_table(conn)?;
        db_campaign_leads::create_table(conn)?;
        db_tasks::create_table(conn)?;

        info!("Store initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection, creating
    /// it if needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode is good for concurrency.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key constraints")?;

            conn.busy_timeout(std::time::Duration::from_secs(30))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("Database connection should exist after initialization in get_connection()"))
    }

    /// Runs a truncating WAL checkpoint. Returns the number of checkpointed
    /// frames.
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context("Failed to run WAL checkpoint")?;

        if busy != 0 {
            warn!("WAL checkpoint could not complete: database busy");
        }
        debug!(log_frames, checkpointed, "WAL checkpoint finished");
        Ok(checkpointed)
    }

    /// Deletes terminal tasks older than the retention window.
    pub async fn cleanup_old_data(&mut self, retention_days: u32, now: i64) -> Result<usize> {
        let cutoff = now - i64::from(retention_days) * 86400;
        let conn = self.get_connection()?;
        let removed = db_tasks::cleanup_terminal_before(conn, cutoff)?;
        if removed > 0 {
            info!(removed, "Cleaned up old terminal tasks");
        }
        Ok(removed)
    }

    /// Closes the database connection.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close database cleanly: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn insert_account(&mut self, account: &Account) -> Result<()> {
        db_accounts::insert(self.get_connection()?, account)
    }

    pub async fn get_account(&mut self, id: &str) -> Result<Option<Account>> {
        db_accounts::get(self.get_connection()?, id)
    }

    // ------------------------------------------------------------------
    // Outbound accounts
    // ------------------------------------------------------------------

    pub async fn insert_outbound_account(&mut self, account: &OutboundAccount) -> Result<()> {
        db_outbound_accounts::insert(self.get_connection()?, account)
    }

    pub async fn get_outbound_account(&mut self, id: &str) -> Result<Option<OutboundAccount>> {
        db_outbound_accounts::get(self.get_connection()?, id)
    }

    /// Completes every warmup whose start date is at or before `cutoff`.
    /// Returns the accounts whose warmup finished on this sweep.
    pub async fn auto_complete_warmups(&mut self, cutoff: i64) -> Result<Vec<OutboundAccount>> {
        let conn = self.get_connection()?;
        let candidates = db_outbound_accounts::list_warmup_completable(conn, cutoff)?;

        let mut completed = Vec::new();
        for account in candidates {
            if db_outbound_accounts::complete_warmup(conn, &account.id)? {
                completed.push(account);
            }
        }
        Ok(completed)
    }

    pub async fn apply_streak(
        &mut self,
        outbound_account_id: &str,
        streak_days: i64,
        streak_last_send_date: i64,
        rest_until: Option<i64>,
    ) -> Result<()> {
        db_outbound_accounts::apply_streak(
            self.get_connection()?,
            outbound_account_id,
            streak_days,
            streak_last_send_date,
            rest_until,
        )
    }

    // ------------------------------------------------------------------
    // Senders
    // ------------------------------------------------------------------

    pub async fn insert_sender(&mut self, sender: &Sender) -> Result<()> {
        db_senders::insert(self.get_connection()?, sender)
    }

    pub async fn get_sender(&mut self, id: &str) -> Result<Option<Sender>> {
        db_senders::get(self.get_connection()?, id)
    }

    /// Binds an authenticated agent session to a sender row.
    ///
    /// An existing sender is marked online with a fresh heartbeat; an
    /// unknown sender id creates the session row on first authentication,
    /// which requires the outbound account id.
    pub async fn register_sender_session(
        &mut self,
        sender_id: &str,
        account_id: &str,
        outbound_account_id: Option<&str>,
        now: i64,
    ) -> Result<Sender> {
        let conn = self.get_connection()?;

        if let Some(existing) = db_senders::get(conn, sender_id)? {
            db_senders::set_online(conn, sender_id, now)?;
            debug!(sender_id = %sender_id, "Sender session re-registered");
            return Ok(Sender {
                status: SenderStatus::Online,
                last_heartbeat: Some(now),
                ..existing
            });
        }

        let outbound_account_id = outbound_account_id.ok_or_else(|| {
            anyhow::anyhow!(
                "First authentication for sender {} requires an outbound account id",
                sender_id
            )
        })?;

        let sender = Sender {
            id: sender_id.to_string(),
            account_id: account_id.to_string(),
            outbound_account_id: outbound_account_id.to_string(),
            status: SenderStatus::Online,
            last_heartbeat: Some(now),
            daily_limit: None,
            test_mode: false,
            restricted_until: None,
            restriction_reason: None,
            created_at: now,
        };
        db_senders::insert(conn, &sender)?;
        info!(sender_id = %sender_id, account_id = %account_id, "Registered new sender");
        Ok(sender)
    }

    pub async fn sender_heartbeat(&mut self, sender_id: &str, now: i64) -> Result<()> {
        db_senders::heartbeat(self.get_connection()?, sender_id, now)
    }

    pub async fn set_sender_offline(&mut self, sender_id: &str) -> Result<()> {
        db_senders::set_offline(self.get_connection()?, sender_id)
    }

    /// Flips online senders with heartbeats older than `cutoff` to offline.
    /// Returns `(sender_id, account_id)` pairs for notification.
    pub async fn sweep_stale_senders(&mut self, cutoff: i64) -> Result<Vec<(String, String)>> {
        let conn = self.get_connection()?;
        let stale = db_senders::list_stale_online(conn, cutoff)?;
        for (sender_id, _) in &stale {
            db_senders::set_offline(conn, sender_id)?;
        }
        Ok(stale)
    }

    pub async fn restrict_sender(
        &mut self,
        sender_id: &str,
        restricted_until: i64,
        reason: &str,
    ) -> Result<()> {
        db_senders::restrict(self.get_connection()?, sender_id, restricted_until, reason)
    }

    /// Senders backed by the campaign's outbound accounts, in stable order.
    pub async fn senders_for_campaign(&mut self, campaign: &Campaign) -> Result<Vec<Sender>> {
        db_senders::for_outbound_accounts(self.get_connection()?, &campaign.outbound_account_ids)
    }

    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    pub async fn insert_campaign(&mut self, campaign: &Campaign) -> Result<()> {
        db_campaigns::insert(self.get_connection()?, campaign)
    }

    pub async fn get_campaign(&mut self, id: &str) -> Result<Option<Campaign>> {
        db_campaigns::get(self.get_connection()?, id)
    }

    pub async fn list_active_auto_campaigns(&mut self) -> Result<Vec<Campaign>> {
        db_campaigns::list_active_auto(self.get_connection()?)
    }

    pub async fn list_active_campaigns(&mut self) -> Result<Vec<Campaign>> {
        db_campaigns::list_active(self.get_connection()?)
    }

    pub async fn set_campaign_status(&mut self, id: &str, status: CampaignStatus) -> Result<()> {
        db_campaigns::set_status(self.get_connection()?, id, status)
    }

    pub async fn complete_campaign_if_drained(&mut self, id: &str) -> Result<bool> {
        db_campaigns::complete_if_drained(self.get_connection()?, id)
    }

    pub async fn commit_dispatch(
        &mut self,
        campaign_id: &str,
        new_sender_index: i64,
        new_message_index: i64,
        now: i64,
        count_burst_send: bool,
    ) -> Result<()> {
        db_campaigns::commit_dispatch(
            self.get_connection()?,
            campaign_id,
            new_sender_index,
            new_message_index,
            now,
            count_burst_send,
        )
    }

    pub async fn start_burst_break(&mut self, campaign_id: &str, break_until: i64) -> Result<()> {
        db_campaigns::start_burst_break(self.get_connection()?, campaign_id, break_until)
    }

    pub async fn clear_burst_break(&mut self, campaign_id: &str) -> Result<()> {
        db_campaigns::clear_burst_break(self.get_connection()?, campaign_id)
    }

    pub async fn reset_burst_state(&mut self, campaign_id: &str) -> Result<()> {
        db_campaigns::reset_burst_state(self.get_connection()?, campaign_id)
    }

    /// Sends counted toward today's pacing for a campaign.
    pub async fn count_campaign_sends_in_range(
        &mut self,
        campaign_id: &str,
        start: i64,
        end: i64,
    ) -> Result<i64> {
        db_campaigns::count_sends_in_range(self.get_connection()?, campaign_id, start, end)
    }

    // ------------------------------------------------------------------
    // Campaign leads
    // ------------------------------------------------------------------

    /// Attaches a lead to its campaign, counting it as pending.
    pub async fn add_campaign_lead(&mut self, lead: &CampaignLead) -> Result<()> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        db_campaign_leads::insert(&tx, lead)?;
        db_campaigns::bump_pending(&tx, &lead.campaign_id, 1)?;
        tx.commit().context("Failed to commit campaign lead insert")?;
        Ok(())
    }

    pub async fn get_campaign_lead(&mut self, id: &str) -> Result<Option<CampaignLead>> {
        db_campaign_leads::get(self.get_connection()?, id)
    }

    /// Leases the oldest pending lead of a campaign to a sender, moving it
    /// to `queued` and shifting the stats counters in the same transaction.
    pub async fn acquire_lead(
        &mut self,
        campaign_id: &str,
        sender_id: &str,
        now: i64,
    ) -> Result<Option<CampaignLead>> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let lead = db_campaign_leads::acquire_oldest_pending(&tx, campaign_id, sender_id, now)?;
        if lead.is_some() {
            db_campaigns::shift_stats(&tx, campaign_id, LeadStatus::Pending, LeadStatus::Queued, 1)?;
        }
        tx.commit().context("Failed to commit lead acquisition")?;
        Ok(lead)
    }

    /// Returns queued leads with leases older than `cutoff` to pending.
    pub async fn reclaim_stale_leases(
        &mut self,
        campaign_id: &str,
        cutoff: i64,
        now: i64,
    ) -> Result<usize> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let reclaimed = db_campaign_leads::reclaim_stale_queued(&tx, campaign_id, cutoff, now)?;
        if reclaimed > 0 {
            db_campaigns::shift_stats(
                &tx,
                campaign_id,
                LeadStatus::Queued,
                LeadStatus::Pending,
                reclaimed as i64,
            )?;
        }
        tx.commit().context("Failed to commit lease reclamation")?;
        Ok(reclaimed)
    }

    /// Creates a pending task and attaches it to the leased lead in one
    /// transaction.
    pub async fn create_task_for_lead(
        &mut self,
        task: &Task,
        lead_id: &str,
        template_index: Option<i64>,
        now: i64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        db_tasks::insert(&tx, task)?;
        db_campaign_leads::attach_task(&tx, lead_id, &task.id, &task.message, template_index, now)?;
        tx.commit().context("Failed to commit task creation")?;
        Ok(())
    }

    /// Terminally skips a queued lead (missing or already-messaged target).
    pub async fn skip_lead(
        &mut self,
        lead_id: &str,
        campaign_id: &str,
        reason: &str,
        now: i64,
    ) -> Result<bool> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let skipped = db_campaign_leads::mark_skipped(&tx, lead_id, reason, now)?;
        if skipped {
            db_campaigns::shift_stats(&tx, campaign_id, LeadStatus::Queued, LeadStatus::Skipped, 1)?;
        }
        tx.commit().context("Failed to commit lead skip")?;
        Ok(skipped)
    }

    /// Resets the given failed/skipped leads to pending, recording the
    /// failing sender on each. Returns the number actually reset.
    pub async fn retry_leads(
        &mut self,
        campaign_id: &str,
        lead_ids: &[String],
        now: i64,
    ) -> Result<usize> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let mut reset = 0;
        for lead_id in lead_ids {
            if let Some(prior) = db_campaign_leads::reset_for_retry(&tx, lead_id, now)? {
                db_campaigns::shift_stats(&tx, campaign_id, prior, LeadStatus::Pending, 1)?;
                reset += 1;
            }
        }
        tx.commit().context("Failed to commit lead retry")?;
        Ok(reset)
    }

    /// Per-sender sends counted toward caps in a local-day range.
    pub async fn count_sender_sends_in_range(
        &mut self,
        sender_id: &str,
        start: i64,
        end: i64,
        campaign_id: Option<&str>,
    ) -> Result<i64> {
        db_campaign_leads::count_sender_sends_in_range(
            self.get_connection()?,
            sender_id,
            start,
            end,
            campaign_id,
        )
    }

    pub async fn count_open_leads(&mut self, campaign_id: &str) -> Result<i64> {
        db_campaign_leads::count_open(self.get_connection()?, campaign_id)
    }

    pub async fn count_total_leads(&mut self, campaign_id: &str) -> Result<i64> {
        db_campaign_leads::count_total(self.get_connection()?, campaign_id)
    }

    // ------------------------------------------------------------------
    // Outbound leads
    // ------------------------------------------------------------------

    pub async fn insert_outbound_lead(&mut self, lead: &OutboundLead) -> Result<()> {
        db_outbound_leads::insert(self.get_connection()?, lead)
    }

    pub async fn get_outbound_lead(&mut self, id: &str) -> Result<Option<OutboundLead>> {
        db_outbound_leads::get(self.get_connection()?, id)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn get_task(&mut self, id: &str) -> Result<Option<Task>> {
        db_tasks::get(self.get_connection()?, id)
    }

    pub async fn has_open_task(&mut self, sender_id: &str, campaign_id: &str) -> Result<bool> {
        db_tasks::has_open_for(self.get_connection()?, sender_id, campaign_id)
    }

    /// Atomically picks up the oldest pending task for an account.
    pub async fn pickup_task(
        &mut self,
        account_id: &str,
        sender_id: Option<&str>,
        now: i64,
    ) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;
        let task = db_tasks::pickup_next(&tx, account_id, sender_id, now)?;
        tx.commit().context("Failed to commit task pickup")?;
        Ok(task)
    }

    /// Applies a completion report: task terminal, target profile marked
    /// messaged, lead moved to sent, stats shifted. One transaction; every
    /// step conditional, so replays are no-ops.
    pub async fn complete_task(
        &mut self,
        task_id: &str,
        report: &CompletionReport,
        now: i64,
    ) -> Result<Option<ReconcileApplied>> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let Some(task) = db_tasks::get(&tx, task_id)? else {
            return Ok(None);
        };

        let task_transitioned = db_tasks::complete(&tx, task_id, report, now)?;

        let mut lead_transitioned = false;
        if task_transitioned {
            if let Some(outbound_lead_id) = &task.outbound_lead_id {
                db_outbound_leads::mark_messaged(
                    &tx,
                    outbound_lead_id,
                    &task.message,
                    report.thread_id.as_deref(),
                    now,
                )?;
            }
            if let Some(lead_id) = &task.campaign_lead_id {
                lead_transitioned = db_campaign_leads::mark_sent(&tx, lead_id, now)?;
                if lead_transitioned {
                    if let Some(campaign_id) = &task.campaign_id {
                        db_campaigns::shift_stats(
                            &tx,
                            campaign_id,
                            LeadStatus::Queued,
                            LeadStatus::Sent,
                            1,
                        )?;
                    }
                }
            }
        }

        tx.commit().context("Failed to commit task completion")?;
        Ok(Some(ReconcileApplied {
            task,
            task_transitioned,
            lead_transitioned,
        }))
    }

    /// Applies a failure report: task terminal, lead moved to failed, stats
    /// shifted. Sender restriction is a separate write owned by the caller.
    pub async fn fail_task(
        &mut self,
        task_id: &str,
        report: &FailureReport,
        now: i64,
    ) -> Result<Option<ReconcileApplied>> {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let Some(task) = db_tasks::get(&tx, task_id)? else {
            return Ok(None);
        };

        let task_transitioned = db_tasks::fail(&tx, task_id, report, now)?;

        let mut lead_transitioned = false;
        if task_transitioned {
            if let Some(lead_id) = &task.campaign_lead_id {
                lead_transitioned = db_campaign_leads::mark_failed(&tx, lead_id, &report.error, now)?;
                if lead_transitioned {
                    if let Some(campaign_id) = &task.campaign_id {
                        db_campaigns::shift_stats(
                            &tx,
                            campaign_id,
                            LeadStatus::Queued,
                            LeadStatus::Failed,
                            1,
                        )?;
                    }
                }
            }
        }

        tx.commit().context("Failed to commit task failure")?;
        Ok(Some(ReconcileApplied {
            task,
            task_transitioned,
            lead_transitioned,
        }))
    }

    /// Fails every open task created before `cutoff` and returns queued
    /// leads they held to pending.
    pub async fn reclaim_stale_tasks(&mut self, cutoff: i64, now: i64) -> Result<Vec<ReclaimedTask>> {
        let report = FailureReport {
            error: "Task timed out".to_string(),
            error_type: FailureKind::Timeout,
            stack_trace: None,
            timestamp: None,
        };
        self.fail_open_tasks(db_tasks::list_stale_open, cutoff, &report, now)
            .await
    }

    /// Operator "reset stuck tasks": fails every open task for the account
    /// and returns their queued leads to pending.
    pub async fn reset_stuck_tasks(
        &mut self,
        account_id: &str,
        now: i64,
    ) -> Result<Vec<ReclaimedTask>> {
        let report = FailureReport {
            error: "Reset by operator".to_string(),
            error_type: FailureKind::Unknown,
            stack_trace: None,
            timestamp: None,
        };
        let account_id = account_id.to_string();
        self.fail_open_tasks(
            move |conn: &Connection, _| db_tasks::list_open_for_account(conn, &account_id),
            0,
            &report,
            now,
        )
        .await
    }

    async fn fail_open_tasks<F>(
        &mut self,
        list: F,
        cutoff: i64,
        report: &FailureReport,
        now: i64,
    ) -> Result<Vec<ReclaimedTask>>
    where
        F: Fn(&Connection, i64) -> Result<Vec<Task>>,
    {
        let conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let open = list(&tx, cutoff)?;
        let mut reclaimed = Vec::with_capacity(open.len());
        for task in open {
            if !db_tasks::fail(&tx, &task.id, report, now)? {
                continue;
            }
            let mut lead_released = false;
            if let Some(lead_id) = &task.campaign_lead_id {
                lead_released = db_campaign_leads::release_queued(&tx, lead_id, now)?;
                if lead_released {
                    if let Some(campaign_id) = &task.campaign_id {
                        db_campaigns::shift_stats(
                            &tx,
                            campaign_id,
                            LeadStatus::Queued,
                            LeadStatus::Pending,
                            1,
                        )?;
                    }
                }
            }
            reclaimed.push(ReclaimedTask {
                task,
                lead_released,
            });
        }

        tx.commit().context("Failed to commit open-task reclamation")?;
        Ok(reclaimed)
    }
}
