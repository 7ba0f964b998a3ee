//! Dispatch scheduler
//!
//! The periodic control loop. Each tick sweeps stale senders, completes due
//! warmups, reclaims expired leases and tasks, then makes a single dispatch
//! attempt per active auto-mode campaign: pick the next eligible sender by
//! round-robin, lease the oldest pending lead, render the message, create
//! the task, and push it to the agent.
//!
//! Ticks never overlap: the loop driving `run_tick` is a single task and
//! skips missed fires. A failure inside one campaign's dispatch is logged
//! and the tick moves on to the next campaign.

use crate::eligibility::{self, EligibilityParams};
use crate::lease;
use crate::pacing;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::streak;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use shared::api::{EtaHint, NextSendResponse, ServerEvent, TaskPayload};
use shared::config::ServerConfig;
use shared::model::{
    Campaign, CampaignLead, CampaignStatus, PacingMode, Sender, SenderStatus, Task, TaskStatus,
    TaskType,
};
use shared::{template, timeutil};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The scheduler owns no state of its own beyond handles to the store, the
/// registry, and the configuration; all durable state lives in the store.
pub struct Scheduler {
    store: Arc<Mutex<Store>>,
    registry: AgentRegistry,
    config: Arc<ServerConfig>,
}

impl Scheduler {
    pub fn new(store: Arc<Mutex<Store>>, registry: AgentRegistry, config: Arc<ServerConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Runs one full tick at the current wall-clock time.
    pub async fn run_tick(&self) -> Result<()> {
        self.run_tick_at(shared::current_timestamp()).await
    }

    /// Runs one full tick at an explicit instant (tests drive this).
    pub async fn run_tick_at(&self, now: i64) -> Result<()> {
        // Sweeps are best-effort: a failure is logged and the next tick
        // re-runs them.
        if let Err(e) = self.sweep_stale_senders(now).await {
            error!(error = %e, "Stale-sender sweep failed");
        }
        if let Err(e) = self.complete_due_warmups(now).await {
            error!(error = %e, "Warmup completion sweep failed");
        }
        {
            let mut store = self.store.lock().await;
            if let Err(e) = lease::reclaim_stale_leases(&mut store, &self.config, now).await {
                error!(error = %e, "Stale-lease sweep failed");
            }
            if let Err(e) = lease::reclaim_stale_tasks(&mut store, &self.config, now).await {
                error!(error = %e, "Stale-task sweep failed");
            }
        }

        let campaigns = {
            let mut store = self.store.lock().await;
            store.list_active_auto_campaigns().await?
        };

        for campaign in campaigns {
            if let Err(e) = self.dispatch_campaign(&campaign, now).await {
                error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Campaign dispatch failed; continuing with next campaign"
                );
            }
        }

        Ok(())
    }

    /// Marks online senders without a recent heartbeat offline and notifies
    /// their accounts.
    async fn sweep_stale_senders(&self, now: i64) -> Result<()> {
        let cutoff = now - self.config.stale_sender_threshold_seconds;
        let stale = {
            let mut store = self.store.lock().await;
            store.sweep_stale_senders(cutoff).await?
        };

        for (sender_id, account_id) in stale {
            info!(sender_id = %sender_id, "Sender heartbeat stale, marked offline");
            self.registry.forget(&sender_id).await;
            self.registry
                .push_to_account(&account_id, ServerEvent::SenderOffline { sender_id })
                .await;
        }
        Ok(())
    }

    /// Completes warmups that have run their full horizon.
    async fn complete_due_warmups(&self, now: i64) -> Result<()> {
        let cutoff = now - self.config.warmup_horizon_days * 86400;
        let completed = {
            let mut store = self.store.lock().await;
            store.auto_complete_warmups(cutoff).await?
        };

        for account in completed {
            info!(
                outbound_account_id = %account.id,
                handle = %account.handle,
                "Warmup completed, outbound account ready"
            );
        }
        Ok(())
    }

    /// One dispatch attempt for a single campaign (steps a-q).
    async fn dispatch_campaign(&self, campaign: &Campaign, now: i64) -> Result<()> {
        let tz = timeutil::parse_tz(&campaign.schedule.timezone);
        let burst_mode = campaign.schedule.pacing_mode == PacingMode::Burst;

        // a. A burst group never spans local days.
        let mut burst_sent_in_group = campaign.burst_sent_in_group;
        let mut burst_break_until = campaign.burst_break_until;
        if burst_mode {
            if let Some(last_sent_at) = campaign.last_sent_at {
                if timeutil::local_date(last_sent_at, tz) < timeutil::local_date(now, tz) {
                    let mut store = self.store.lock().await;
                    store.reset_burst_state(&campaign.id).await?;
                    burst_sent_in_group = 0;
                    burst_break_until = None;
                }
            }
        }

        // b. Senders backing the campaign's outbound accounts.
        let senders = {
            let mut store = self.store.lock().await;
            store.senders_for_campaign(campaign).await?
        };
        if senders.is_empty() {
            debug!(campaign_id = %campaign.id, "No senders linked, skipping");
            return Ok(());
        }
        let online_count = senders
            .iter()
            .filter(|s| s.status == SenderStatus::Online)
            .count();

        // c. Any online sender in test mode puts the campaign in test mode.
        let test_mode = senders
            .iter()
            .any(|s| s.status == SenderStatus::Online && s.test_mode);

        // d. Active-hours gate.
        if !test_mode
            && !timeutil::within_active_hours(
                now,
                tz,
                campaign.schedule.active_hours_start,
                campaign.schedule.active_hours_end,
            )
        {
            return Ok(());
        }

        // e. Burst break gate; an expired break is cleared on the way past.
        if !test_mode {
            if let Some(break_until) = burst_break_until {
                if break_until > now {
                    return Ok(());
                }
                let mut store = self.store.lock().await;
                store.clear_burst_break(&campaign.id).await?;
            }
        }

        // f. Sends already counted toward today's pacing.
        let (day_start, day_end) = timeutil::local_day_range(now, tz);
        let sent_today = {
            let mut store = self.store.lock().await;
            store
                .count_campaign_sends_in_range(&campaign.id, day_start, day_end)
                .await?
        };

        // g. Delay until the next send.
        let daily_cap = campaign
            .schedule
            .daily_limit_per_sender
            .unwrap_or(self.config.default_daily_limit);
        let delay = if test_mode {
            self.config.test_mode_delay_seconds
        } else {
            match campaign.schedule.pacing_mode {
                PacingMode::Smooth => {
                    let jitter = {
                        let mut rng = rand::rng();
                        pacing::sample_jitter(&mut rng)
                    };
                    pacing::smooth_delay(
                        &campaign.schedule,
                        daily_cap,
                        online_count,
                        sent_today,
                        timeutil::seconds_into_local_day(now, tz),
                        self.config.pacing_floor_seconds,
                        self.config.pacing_window_floor_seconds,
                        jitter,
                    )
                }
                PacingMode::Burst => {
                    let mut rng = rand::rng();
                    pacing::burst_delay(&campaign.schedule.burst, &mut rng)
                }
            }
        };

        // h. Too soon since the last send. The 0.8 factor absorbs tick
        // jitter so a send due "in about one tick" is not pushed a full
        // period out.
        if !test_mode {
            if let Some(last_sent_at) = campaign.last_sent_at {
                let elapsed = now - last_sent_at;
                if (elapsed as f64) < 0.8 * delay as f64 {
                    return Ok(());
                }
            }
        }

        // i. Round-robin sender selection with the eligibility filter.
        let account_tz = self.account_timezone(campaign, tz).await;
        let params = EligibilityParams {
            now,
            today_local_midnight: timeutil::local_midnight(now, tz),
            local_day_range: (day_start, day_end),
            test_mode,
            default_daily_limit: self.config.default_daily_limit,
        };
        let Some((chosen_index, sender)) =
            self.select_sender(campaign, &senders, &params).await?
        else {
            debug!(campaign_id = %campaign.id, "No eligible sender this tick");
            return Ok(());
        };

        // j. Lease the oldest pending lead.
        let lead = {
            let mut store = self.store.lock().await;
            lease::acquire(&mut store, &campaign.id, &sender.id, now).await?
        };
        let Some(lead) = lead else {
            let mut store = self.store.lock().await;
            if store.count_open_leads(&campaign.id).await? == 0
                && store.complete_campaign_if_drained(&campaign.id).await?
            {
                info!(campaign_id = %campaign.id, "Campaign drained, marked completed");
            }
            return Ok(());
        };

        // k. Load the target; skip leads whose target vanished or was
        // already messaged from another campaign.
        let outbound_lead = {
            let mut store = self.store.lock().await;
            store.get_outbound_lead(&lead.outbound_lead_id).await?
        };
        let outbound_lead = match outbound_lead {
            Some(ol) if ol.messaged => {
                self.skip_lead(campaign, &lead, "Target already messaged", now)
                    .await?;
                return Ok(());
            }
            Some(ol) => ol,
            None => {
                self.skip_lead(campaign, &lead, "Target profile missing", now)
                    .await?;
                return Ok(());
            }
        };

        // l. Message selection: a pre-generated custom message wins and
        // leaves the template cursor untouched.
        let (message, template_index, advance_cursor) =
            match lead.custom_message.as_deref().filter(|m| !m.is_empty()) {
                Some(custom) => (custom.to_string(), None, false),
                None => {
                    if campaign.templates.is_empty() {
                        self.skip_lead(campaign, &lead, "No message template available", now)
                            .await?;
                        return Ok(());
                    }
                    let index =
                        campaign.last_message_index.rem_euclid(campaign.templates.len() as i64);
                    let rendered =
                        template::render(&campaign.templates[index as usize], &outbound_lead);
                    (rendered, Some(index), true)
                }
            };

        // m. Commit the dispatch: advance cursors, stamp the send, create
        // the task, and attach it to the lead.
        let new_message_index = match template_index {
            Some(index) if advance_cursor => {
                (index + 1).rem_euclid(campaign.templates.len() as i64)
            }
            _ => campaign.last_message_index,
        };
        let task = Task {
            id: shared::new_id(),
            account_id: campaign.account_id.clone(),
            task_type: TaskType::SendDirectMessage,
            target_username: outbound_lead.username.clone(),
            message: message.clone(),
            sender_id: Some(sender.id.clone()),
            campaign_id: Some(campaign.id.clone()),
            campaign_lead_id: Some(lead.id.clone()),
            outbound_lead_id: Some(outbound_lead.id.clone()),
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        };
        {
            let mut store = self.store.lock().await;
            store
                .commit_dispatch(
                    &campaign.id,
                    chosen_index as i64,
                    new_message_index,
                    now,
                    burst_mode,
                )
                .await?;
            store
                .create_task_for_lead(&task, &lead.id, template_index, now)
                .await
                .context("Task creation after lease")?;
        }
        if burst_mode {
            burst_sent_in_group += 1;
        }

        info!(
            campaign_id = %campaign.id,
            sender_id = %sender.id,
            lead_id = %lead.id,
            task_id = %task.id,
            target = %outbound_lead.username,
            "Dispatched task"
        );

        // n. Push the task to the agent; the pull path remains as fallback.
        let delivered = self
            .registry
            .push_to_sender(&sender.id, ServerEvent::TaskNew(task_payload(&task)))
            .await;
        if !delivered {
            warn!(
                sender_id = %sender.id,
                task_id = %task.id,
                "Task push undelivered; waiting for agent pull"
            );
        }

        // o. Advance the sending streak for the outbound account.
        {
            let mut store = self.store.lock().await;
            streak::track(&mut store, &sender.outbound_account_id, account_tz, now).await?;
        }

        // p. Close the burst group when it is full.
        if burst_mode && burst_sent_in_group >= i64::from(campaign.schedule.burst.messages_per_group)
        {
            let group_break = {
                let mut rng = rand::rng();
                pacing::burst_break(&campaign.schedule.burst, &mut rng)
            };
            let mut store = self.store.lock().await;
            store
                .start_burst_break(&campaign.id, now + group_break as i64)
                .await?;
            debug!(
                campaign_id = %campaign.id,
                break_seconds = group_break,
                "Burst group complete, break scheduled"
            );
        }

        // q. ETA hints for the senders next in rotation.
        self.push_eta_hints(campaign, &senders, chosen_index, delay)
            .await;

        Ok(())
    }

    /// Round-robin over the campaign's sender list starting after the
    /// cursor; the first sender passing the eligibility filter wins.
    async fn select_sender<'a>(
        &self,
        campaign: &Campaign,
        senders: &'a [Sender],
        params: &EligibilityParams,
    ) -> Result<Option<(usize, &'a Sender)>> {
        let count = senders.len();
        let start = (campaign.last_sender_index + 1).rem_euclid(count as i64) as usize;

        for offset in 0..count {
            let index = (start + offset) % count;
            let sender = &senders[index];

            let outbound_account = {
                let mut store = self.store.lock().await;
                store.get_outbound_account(&sender.outbound_account_id).await?
            };
            let Some(outbound_account) = outbound_account else {
                debug!(
                    sender_id = %sender.id,
                    "Sender has no outbound account row, skipping"
                );
                continue;
            };

            let verdict = {
                let mut store = self.store.lock().await;
                eligibility::evaluate(&mut store, campaign, sender, &outbound_account, params)
                    .await?
            };
            match verdict {
                None => return Ok(Some((index, sender))),
                Some(reason) => {
                    debug!(
                        campaign_id = %campaign.id,
                        sender_id = %sender.id,
                        reason = %reason,
                        "Sender ineligible"
                    );
                }
            }
        }
        Ok(None)
    }

    /// The tenant calendar used for streak tracking, defaulting to the
    /// campaign zone when the account row is missing or has a bad zone.
    async fn account_timezone(&self, campaign: &Campaign, fallback: Tz) -> Tz {
        let account = {
            let mut store = self.store.lock().await;
            store.get_account(&campaign.account_id).await
        };
        match account {
            Ok(Some(account)) => timeutil::parse_tz(&account.timezone),
            _ => fallback,
        }
    }

    async fn skip_lead(
        &self,
        campaign: &Campaign,
        lead: &CampaignLead,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        warn!(
            campaign_id = %campaign.id,
            lead_id = %lead.id,
            reason = %reason,
            "Skipping lead"
        );
        let mut store = self.store.lock().await;
        store.skip_lead(&lead.id, &campaign.id, reason, now).await?;
        Ok(())
    }

    /// Tells each online sender when its next task is expected: the k-th
    /// online sender after the chosen one gets `delay * (k + 1)`.
    async fn push_eta_hints(
        &self,
        campaign: &Campaign,
        senders: &[Sender],
        chosen_index: usize,
        delay: u64,
    ) {
        let pending_leads = {
            let mut store = self.store.lock().await;
            store.count_open_leads(&campaign.id).await.unwrap_or(0)
        };

        let count = senders.len();
        let mut k: u64 = 0;
        for offset in 1..=count {
            let index = (chosen_index + offset) % count;
            let sender = &senders[index];
            if sender.status != SenderStatus::Online {
                continue;
            }
            let hint = ServerEvent::TaskEta(EtaHint {
                next_in_seconds: delay * (k + 1),
                pending_leads,
            });
            self.registry.push_to_sender(&sender.id, hint).await;
            k += 1;
        }
    }

    /// Jitter-free estimate of a campaign's next send for UI polling.
    pub async fn estimate_next_send(&self, campaign_id: &str) -> Result<Option<NextSendResponse>> {
        let now = shared::current_timestamp();
        let campaign = {
            let mut store = self.store.lock().await;
            store.get_campaign(campaign_id).await?
        };
        let Some(campaign) = campaign else {
            return Ok(None);
        };

        let tz = timeutil::parse_tz(&campaign.schedule.timezone);
        let within = timeutil::within_active_hours(
            now,
            tz,
            campaign.schedule.active_hours_start,
            campaign.schedule.active_hours_end,
        );

        let (senders, pending_leads, sent_today) = {
            let mut store = self.store.lock().await;
            let senders = store.senders_for_campaign(&campaign).await?;
            let pending = store.count_open_leads(&campaign.id).await?;
            let (day_start, day_end) = timeutil::local_day_range(now, tz);
            let sent = store
                .count_campaign_sends_in_range(&campaign.id, day_start, day_end)
                .await?;
            (senders, pending, sent)
        };
        let online_count = senders
            .iter()
            .filter(|s| s.status == SenderStatus::Online)
            .count();

        if campaign.status != CampaignStatus::Active || !within {
            return Ok(Some(NextSendResponse {
                next_in_seconds: None,
                pending_leads,
                within_active_hours: within,
            }));
        }

        if let Some(break_until) = campaign.burst_break_until {
            if break_until > now {
                return Ok(Some(NextSendResponse {
                    next_in_seconds: Some((break_until - now).max(0) as u64),
                    pending_leads,
                    within_active_hours: within,
                }));
            }
        }

        let daily_cap = campaign
            .schedule
            .daily_limit_per_sender
            .unwrap_or(self.config.default_daily_limit);
        let delay = match campaign.schedule.pacing_mode {
            PacingMode::Smooth => pacing::smooth_delay_estimate(
                &campaign.schedule,
                daily_cap,
                online_count,
                sent_today,
                timeutil::seconds_into_local_day(now, tz),
                self.config.pacing_floor_seconds,
                self.config.pacing_window_floor_seconds,
            ),
            // The midpoint keeps repeated polls stable without sampling.
            PacingMode::Burst => {
                (campaign.schedule.burst.min_delay_seconds
                    + campaign.schedule.burst.max_delay_seconds)
                    / 2
            }
        };

        let next_in = match campaign.last_sent_at {
            Some(last_sent_at) => (last_sent_at + delay as i64 - now).max(0) as u64,
            None => 0,
        };

        Ok(Some(NextSendResponse {
            next_in_seconds: Some(next_in),
            pending_leads,
            within_active_hours: within,
        }))
    }
}

/// Wire payload for a task row.
pub fn task_payload(task: &Task) -> TaskPayload {
    TaskPayload {
        id: task.id.clone(),
        task_type: task.task_type.as_str().to_string(),
        target_username: task.target_username.clone(),
        message: task.message.clone(),
        sender_id: task.sender_id.clone(),
        campaign_id: task.campaign_id.clone(),
        campaign_lead_id: task.campaign_lead_id.clone(),
        outbound_lead_id: task.outbound_lead_id.clone(),
        attempts: task.attempts,
        created_at: task.created_at,
    }
}
