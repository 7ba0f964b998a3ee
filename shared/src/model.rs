//! Domain model for the dispatch system
//!
//! This module defines the entities the scheduler and reconciliation paths
//! operate on: accounts, outbound accounts, senders, campaigns, campaign
//! leads, outbound leads, and tasks, together with their status enums and
//! the campaign schedule shape.
//!
//! Timestamps are unix seconds (`i64`). Calendar computations (local hour,
//! local midnight) are performed by `crate::timeutil` against the time zone
//! recorded on the campaign or the owning account.

use crate::api::{CompletionReport, FailureReport};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a live sender session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderStatus {
    Online,
    Offline,
    Restricted,
}

impl SenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderStatus::Online => "online",
            SenderStatus::Offline => "offline",
            SenderStatus::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "online" => Ok(SenderStatus::Online),
            "offline" => Ok(SenderStatus::Offline),
            "restricted" => Ok(SenderStatus::Restricted),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown sender status: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Lifecycle status of an outbound account (a sending identity).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundAccountStatus {
    New,
    Warming,
    Ready,
    Restricted,
    Disabled,
}

impl OutboundAccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundAccountStatus::New => "new",
            OutboundAccountStatus::Warming => "warming",
            OutboundAccountStatus::Ready => "ready",
            OutboundAccountStatus::Restricted => "restricted",
            OutboundAccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "new" => Ok(OutboundAccountStatus::New),
            "warming" => Ok(OutboundAccountStatus::Warming),
            "ready" => Ok(OutboundAccountStatus::Ready),
            "restricted" => Ok(OutboundAccountStatus::Restricted),
            "disabled" => Ok(OutboundAccountStatus::Disabled),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown outbound account status: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown campaign status: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Whether the scheduler drives the campaign or an operator does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignMode {
    Auto,
    Manual,
}

impl CampaignMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignMode::Auto => "auto",
            CampaignMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "auto" => Ok(CampaignMode::Auto),
            "manual" => Ok(CampaignMode::Manual),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown campaign mode: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Pacing model for a campaign schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    Smooth,
    Burst,
}

impl PacingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingMode::Smooth => "smooth",
            PacingMode::Burst => "burst",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "smooth" => Ok(PacingMode::Smooth),
            "burst" => Ok(PacingMode::Burst),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown pacing mode: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Work status of a single campaign lead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Replied,
    Failed,
    Skipped,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Queued => "queued",
            LeadStatus::Sent => "sent",
            LeadStatus::Delivered => "delivered",
            LeadStatus::Replied => "replied",
            LeadStatus::Failed => "failed",
            LeadStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(LeadStatus::Pending),
            "queued" => Ok(LeadStatus::Queued),
            "sent" => Ok(LeadStatus::Sent),
            "delivered" => Ok(LeadStatus::Delivered),
            "replied" => Ok(LeadStatus::Replied),
            "failed" => Ok(LeadStatus::Failed),
            "skipped" => Ok(LeadStatus::Skipped),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown lead status: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// Execution status of a dispatched task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown task status: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// A tenant organization. All per-tenant state is scoped by this id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// IANA time-zone id used as the default calendar for streak tracking.
    pub timezone: String,
    /// Feature flags, mutated by the tenant-management surface.
    #[serde(default)]
    pub features: Vec<String>,
    pub deleted: bool,
    pub created_at: i64,
}

/// Per-day ramp schedule applied to an outbound account in its first days.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarmupPlan {
    pub enabled: bool,
    /// Unix timestamp of the day the ramp started.
    pub start_date: Option<i64>,
    /// Cap for warmup day N at index N-1. Days beyond the schedule reuse the
    /// last entry; an empty schedule means no warmup cap.
    pub day_caps: Vec<u32>,
}

impl WarmupPlan {
    /// Returns the cap applicable to 1-based warmup day `day`, or `None`
    /// when the schedule is empty.
    pub fn cap_for_day(&self, day: i64) -> Option<u32> {
        if self.day_caps.is_empty() || day < 1 {
            return None;
        }
        let idx = ((day - 1) as usize).min(self.day_caps.len() - 1);
        Some(self.day_caps[idx])
    }
}

/// A sending identity owned by one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundAccount {
    pub id: String,
    pub account_id: String,
    pub handle: String,
    pub status: OutboundAccountStatus,
    pub warmup: WarmupPlan,
    /// Consecutive local days with at least one send.
    pub streak_days: i64,
    /// Unix timestamp of the last send that advanced the streak.
    pub streak_last_send_date: Option<i64>,
    /// Mandatory rest window end; the account must not send while
    /// `rest_until` is beyond the current local midnight.
    pub rest_until: Option<i64>,
    pub created_at: i64,
}

/// A live, authenticated session backing an outbound account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub account_id: String,
    pub outbound_account_id: String,
    pub status: SenderStatus,
    pub last_heartbeat: Option<i64>,
    /// Per-sender daily cap; campaigns may override it.
    pub daily_limit: Option<u32>,
    pub test_mode: bool,
    pub restricted_until: Option<i64>,
    pub restriction_reason: Option<String>,
    pub created_at: i64,
}

/// Burst-pacing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstParams {
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub messages_per_group: u32,
    pub min_break_seconds: u64,
    pub max_break_seconds: u64,
}

impl Default for BurstParams {
    fn default() -> Self {
        Self {
            min_delay_seconds: 30,
            max_delay_seconds: 120,
            messages_per_group: 5,
            min_break_seconds: 600,
            max_break_seconds: 1800,
        }
    }
}

/// The schedule block of a campaign: when it may send and how fast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignSchedule {
    /// IANA time-zone id the active window and day boundaries are computed in.
    pub timezone: String,
    /// Active window start hour, inclusive, 0..=24 local time.
    pub active_hours_start: u32,
    /// Active window end hour, exclusive, 0..=24 local time.
    pub active_hours_end: u32,
    pub pacing_mode: PacingMode,
    /// Smooth-mode per-sender daily cap; falls back to the sender's own
    /// limit, then the server default.
    pub daily_limit_per_sender: Option<u32>,
    #[serde(default)]
    pub burst: BurstParams,
}

impl CampaignSchedule {
    /// Validates the schedule at input time.
    ///
    /// Cross-midnight windows are not supported: `end <= start` is rejected
    /// rather than interpreted as wrap-around.
    pub fn validate(&self) -> crate::Result<()> {
        if self.active_hours_start > 24 || self.active_hours_end > 24 {
            return Err(crate::DispatchError::Validation(
                "Active hours must be within 0..=24".to_string(),
            )
            .into());
        }
        if self.active_hours_end <= self.active_hours_start {
            return Err(crate::DispatchError::Validation(format!(
                "Active window [{}, {}) is empty",
                self.active_hours_start, self.active_hours_end
            ))
            .into());
        }
        if self.burst.min_delay_seconds > self.burst.max_delay_seconds {
            return Err(crate::DispatchError::Validation(
                "Burst min_delay_seconds exceeds max_delay_seconds".to_string(),
            )
            .into());
        }
        if self.burst.min_break_seconds > self.burst.max_break_seconds {
            return Err(crate::DispatchError::Validation(
                "Burst min_break_seconds exceeds max_break_seconds".to_string(),
            )
            .into());
        }
        if self.burst.messages_per_group == 0 {
            return Err(crate::DispatchError::Validation(
                "Burst messages_per_group must be greater than zero".to_string(),
            )
            .into());
        }
        if let Some(0) = self.daily_limit_per_sender {
            return Err(crate::DispatchError::Validation(
                "daily_limit_per_sender must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Aggregated per-status lead counters kept on the campaign row.
///
/// The sum of all counters always equals the campaign's total number of
/// leads; every lead status transition adjusts the two affected counters in
/// the same write.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignStats {
    pub pending: i64,
    pub queued: i64,
    pub sent: i64,
    pub delivered: i64,
    pub replied: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl CampaignStats {
    pub fn total(&self) -> i64 {
        self.pending
            + self.queued
            + self.sent
            + self.delivered
            + self.replied
            + self.failed
            + self.skipped
    }

    /// Number of leads the scheduler could still work.
    pub fn open(&self) -> i64 {
        self.pending + self.queued
    }
}

/// A named work plan: messages x outbound accounts x leads under a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub mode: CampaignMode,
    /// Ordered message templates, cycled by `last_message_index`.
    pub templates: Vec<String>,
    /// Outbound accounts this campaign sends from.
    pub outbound_account_ids: Vec<String>,
    pub schedule: CampaignSchedule,
    /// Round-robin cursor over the campaign's sender list.
    pub last_sender_index: i64,
    /// Round-robin cursor over `templates`.
    pub last_message_index: i64,
    pub last_sent_at: Option<i64>,
    /// Sends in the current burst group.
    pub burst_sent_in_group: i64,
    /// End of the current burst break, if one is in effect.
    pub burst_break_until: Option<i64>,
    pub stats: CampaignStats,
    pub created_at: i64,
}

/// The join of one target with one campaign; the unit of work status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignLead {
    pub id: String,
    pub campaign_id: String,
    pub outbound_lead_id: String,
    pub status: LeadStatus,
    pub sender_id: Option<String>,
    pub queued_at: Option<i64>,
    pub task_id: Option<String>,
    /// Pre-generated message that bypasses template rendering.
    pub custom_message: Option<String>,
    /// Message actually dispatched for this lead.
    pub message_used: Option<String>,
    /// Template cursor value used, when a template was rendered.
    pub template_index: Option<i64>,
    /// Senders that previously failed this lead; recorded on retry.
    pub failed_sender_ids: Vec<String>,
    pub last_error: Option<String>,
    /// Set when an operator forced the status by hand.
    pub manual_override: bool,
    pub sent_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A target profile, shared by reference across campaigns of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundLead {
    pub id: String,
    pub account_id: String,
    pub username: String,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub followers: Option<i64>,
    /// Set once any campaign has messaged this profile.
    pub messaged: bool,
    pub replied: bool,
    pub thread_id: Option<String>,
    pub dm_date: Option<i64>,
    pub last_message: Option<String>,
    pub created_at: i64,
}

/// The kind of work a task asks an agent to perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SendDirectMessage,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SendDirectMessage => "send_direct_message",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "send_direct_message" => Ok(TaskType::SendDirectMessage),
            other => Err(crate::DispatchError::Validation(format!(
                "Unknown task type: '{}'",
                other
            ))
            .into()),
        }
    }
}

/// The executable unit dispatched to an agent for one campaign lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub account_id: String,
    pub task_type: TaskType,
    pub target_username: String,
    pub message: String,
    pub sender_id: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_lead_id: Option<String>,
    pub outbound_lead_id: Option<String>,
    pub status: TaskStatus,
    pub attempts: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub result: Option<CompletionReport>,
    pub error: Option<FailureReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> CampaignSchedule {
        CampaignSchedule {
            timezone: "Etc/UTC".to_string(),
            active_hours_start: 9,
            active_hours_end: 21,
            pacing_mode: PacingMode::Smooth,
            daily_limit_per_sender: Some(24),
            burst: BurstParams::default(),
        }
    }

    #[test]
    fn test_schedule_validation_accepts_sane_window() {
        assert!(schedule().validate().is_ok());
    }

    #[test]
    fn test_schedule_validation_rejects_empty_window() {
        let mut s = schedule();
        s.active_hours_start = 21;
        s.active_hours_end = 9;
        assert!(s.validate().is_err());

        s.active_hours_start = 9;
        s.active_hours_end = 9;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_schedule_validation_rejects_inverted_burst_delays() {
        let mut s = schedule();
        s.burst.min_delay_seconds = 200;
        s.burst.max_delay_seconds = 100;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_warmup_cap_lookup() {
        let plan = WarmupPlan {
            enabled: true,
            start_date: Some(0),
            day_caps: vec![2, 5, 10],
        };
        assert_eq!(plan.cap_for_day(1), Some(2));
        assert_eq!(plan.cap_for_day(3), Some(10));
        // Days beyond the schedule reuse the last entry.
        assert_eq!(plan.cap_for_day(30), Some(10));
        assert_eq!(plan.cap_for_day(0), None);

        let empty = WarmupPlan {
            enabled: true,
            start_date: Some(0),
            day_caps: vec![],
        };
        assert_eq!(empty.cap_for_day(1), None);
    }

    #[test]
    fn test_stats_total_and_open() {
        let stats = CampaignStats {
            pending: 3,
            queued: 2,
            sent: 5,
            delivered: 1,
            replied: 1,
            failed: 2,
            skipped: 1,
        };
        assert_eq!(stats.total(), 15);
        assert_eq!(stats.open(), 5);
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            LeadStatus::Pending,
            LeadStatus::Queued,
            LeadStatus::Sent,
            LeadStatus::Delivered,
            LeadStatus::Replied,
            LeadStatus::Failed,
            LeadStatus::Skipped,
        ] {
            assert_eq!(LeadStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(LeadStatus::parse("bogus").is_err());
        assert_eq!(TaskStatus::InProgress.as_str(), "in_progress");
        assert_eq!(
            TaskStatus::parse("in_progress").unwrap(),
            TaskStatus::InProgress
        );
    }
}
