//! Agent protocol and REST API types for the dispatch system
//!
//! This module defines the messages exchanged over the per-agent WebSocket
//! channel and the request/response types used by the REST endpoints that
//! feed or inspect the scheduler.
//!
//! Channel messages are a closed tagged enum: unknown event kinds fail
//! deserialization at the boundary and are rejected with a logged error
//! rather than being passed through. Report fields agents tend to send
//! loosely typed (boolean-ish flags, stringified or ISO 8601 timestamps)
//! are normalized here via the coercions in `crate::utils`.

use crate::utils::{to_boolean, to_date};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Accepts `true`/`"yes"`/`"1"`/`1` and friends for boolean fields.
fn boolean_from_loose<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    to_boolean(&value).ok_or_else(|| D::Error::custom("expected a boolean-like value"))
}

/// Accepts unix seconds, stringified numbers, and ISO 8601 strings for
/// timestamp fields; null and the empty string mean "not reported".
fn date_from_loose<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(to_date(&value))
}

/// Failure classes reported by agents.
///
/// Only the four platform-restriction kinds quarantine the sender; the rest
/// fail the task and lead without touching the sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    #[serde(rename = "IG_RESTRICTED")]
    IgRestricted,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "ACTION_BLOCKED")]
    ActionBlocked,
    #[serde(rename = "CHALLENGE_REQUIRED")]
    ChallengeRequired,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "NETWORK_ERROR")]
    NetworkError,
    #[serde(rename = "UNKNOWN")]
    #[serde(other)]
    Unknown,
}

impl FailureKind {
    /// Whether this failure class puts the sender into a restriction cooldown.
    pub fn restricts_sender(&self) -> bool {
        matches!(
            self,
            FailureKind::IgRestricted
                | FailureKind::RateLimited
                | FailureKind::ActionBlocked
                | FailureKind::ChallengeRequired
        )
    }
}

/// Successful completion report for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    #[serde(deserialize_with = "boolean_from_loose")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Agent-reported completion instant, normalized to unix seconds at
    /// the boundary.
    #[serde(default, deserialize_with = "date_from_loose")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Failure report for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub error: String,
    pub error_type: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Agent-reported failure instant, normalized to unix seconds at the
    /// boundary.
    #[serde(default, deserialize_with = "date_from_loose")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Task payload pushed to an agent (`task:new`) or returned by pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub target_username: String,
    pub message: String,
    pub sender_id: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_lead_id: Option<String>,
    pub outbound_lead_id: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
}

/// Next-task hint pushed to a sender (`task:eta`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaHint {
    pub next_in_seconds: u64,
    pub pending_leads: i64,
}

/// Events sent by an agent over its channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AgentEvent {
    /// Authenticate the channel and bind it to a sender.
    #[serde(rename = "auth")]
    Auth {
        api_key: String,
        account_id: String,
        sender_id: String,
        /// The sending identity behind this session; required the first
        /// time a sender authenticates so the session row can be created.
        #[serde(default)]
        outbound_account_id: Option<String>,
    },
    /// Liveness renewal; expected at least every 15 seconds.
    #[serde(rename = "heartbeat")]
    Heartbeat,
    /// Pull the oldest pending task for this account.
    #[serde(rename = "task:pickup")]
    TaskPickup {
        /// When set, only tasks assigned to this sender (or to no sender)
        /// are considered.
        #[serde(default)]
        sender_scoped: bool,
    },
    /// Report a finished task.
    #[serde(rename = "task:complete")]
    TaskComplete {
        task_id: String,
        result: CompletionReport,
    },
    /// Report a failed task.
    #[serde(rename = "task:fail")]
    TaskFail {
        task_id: String,
        error: FailureReport,
    },
}

/// Events sent by the server to an agent or fanned out to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "auth-ok")]
    AuthOk {
        account_id: String,
        sender_id: String,
    },
    #[serde(rename = "auth-error")]
    AuthError { message: String },
    /// A freshly created task for this sender.
    #[serde(rename = "task:new")]
    TaskNew(TaskPayload),
    /// Hint about when this sender's next task is expected.
    #[serde(rename = "task:eta")]
    TaskEta(EtaHint),
    /// Response to `task:pickup`; `task` is `None` when nothing is pending.
    #[serde(rename = "task:pickup-result")]
    TaskPickupResult { task: Option<TaskPayload> },
    /// Account-wide: a task completed.
    #[serde(rename = "task:completed")]
    TaskCompleted {
        task_id: String,
        campaign_lead_id: Option<String>,
        username: Option<String>,
        thread_id: Option<String>,
    },
    /// Account-wide: a task failed.
    #[serde(rename = "task:failed")]
    TaskFailed {
        task_id: String,
        campaign_lead_id: Option<String>,
        error: String,
    },
    /// Account-wide: a sender entered restriction cooldown.
    #[serde(rename = "sender-restricted")]
    SenderRestricted {
        sender_id: String,
        reason: String,
        restricted_until: i64,
    },
    /// Account-wide: a sender came online.
    #[serde(rename = "sender-online")]
    SenderOnline { sender_id: String },
    /// Account-wide: a sender went offline.
    #[serde(rename = "sender-offline")]
    SenderOffline { sender_id: String },
}

/// Request body for POST /api/v1/tasks/pickup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupRequest {
    pub account_id: String,
    /// When present, restricts pickup to tasks for this sender or tasks
    /// with no sender assigned.
    #[serde(default)]
    pub sender_id: Option<String>,
}

/// Response body for POST /api/v1/tasks/pickup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupResponse {
    pub task: Option<TaskPayload>,
}

/// Request body for POST /api/v1/campaigns/{id}/leads/retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLeadsRequest {
    /// Leads to reset; only `failed` and `skipped` leads are eligible.
    pub lead_ids: Vec<String>,
}

/// Response body for POST /api/v1/campaigns/{id}/leads/retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLeadsResponse {
    pub reset: usize,
}

/// Response body for POST /api/v1/accounts/{id}/tasks/reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetTasksResponse {
    pub tasks_failed: usize,
    pub leads_reset: usize,
}

/// Response body for GET /api/v1/campaigns/{id}/next-send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextSendResponse {
    /// Jitter-free estimate of seconds until the next send; `None` when the
    /// campaign cannot currently send (inactive, outside hours, on break).
    pub next_in_seconds: Option<u64>,
    pub pending_leads: i64,
    pub within_active_hours: bool,
}

/// HTTP headers used for authentication and metadata
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
    pub const SENDER_ID: &str = "X-Sender-Id";
}

/// API endpoint paths
pub mod endpoints {
    pub const AGENT_WS: &str = "/api/v1/agent/ws";
    pub const TASK_PICKUP: &str = "/api/v1/tasks/pickup";
    pub const TASK_COMPLETE: &str = "/api/v1/tasks/{id}/complete";
    pub const TASK_FAIL: &str = "/api/v1/tasks/{id}/fail";
    pub const CAMPAIGN_NEXT_SEND: &str = "/api/v1/campaigns/{id}/next-send";
    pub const CAMPAIGN_RETRY_LEADS: &str = "/api/v1/campaigns/{id}/leads/retry";
    pub const ACCOUNT_RESET_TASKS: &str = "/api/v1/accounts/{id}/tasks/reset";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_event_round_trip() {
        let json = r#"{"type":"task:complete","data":{"task_id":"t1","result":{"success":true,"username":"alice","thread_id":"th9"}}}"#;
        let event: AgentEvent = serde_json::from_str(json).unwrap();
        match event {
            AgentEvent::TaskComplete { task_id, result } => {
                assert_eq!(task_id, "t1");
                assert!(result.success);
                assert_eq!(result.thread_id.as_deref(), Some("th9"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_kind_is_rejected() {
        let json = r#"{"type":"reply:check","data":{}}"#;
        assert!(serde_json::from_str::<AgentEvent>(json).is_err());
    }

    #[test]
    fn test_failure_kind_restriction_classes() {
        assert!(FailureKind::IgRestricted.restricts_sender());
        assert!(FailureKind::RateLimited.restricts_sender());
        assert!(FailureKind::ActionBlocked.restricts_sender());
        assert!(FailureKind::ChallengeRequired.restricts_sender());
        assert!(!FailureKind::Timeout.restricts_sender());
        assert!(!FailureKind::Unknown.restricts_sender());
    }

    #[test]
    fn test_loose_completion_report_is_normalized() {
        // Browser agents send boolean-ish flags and ISO 8601 timestamps;
        // both are normalized while deserializing.
        let report: CompletionReport = serde_json::from_str(
            r#"{"success":"yes","username":"alice","timestamp":"2024-03-04T12:30:00Z"}"#,
        )
        .unwrap();
        assert!(report.success);
        assert_eq!(report.timestamp, Some(1709555400));

        // Stringified unix seconds work too; empty strings mean "absent".
        let report: CompletionReport =
            serde_json::from_str(r#"{"success":1,"timestamp":"1700000000"}"#).unwrap();
        assert!(report.success);
        assert_eq!(report.timestamp, Some(1700000000));

        let report: CompletionReport =
            serde_json::from_str(r#"{"success":true,"timestamp":""}"#).unwrap();
        assert_eq!(report.timestamp, None);

        // A flag that coerces to nothing is rejected at the boundary.
        assert!(serde_json::from_str::<CompletionReport>(r#"{"success":null}"#).is_err());
    }

    #[test]
    fn test_loose_failure_report_timestamp() {
        let report: FailureReport = serde_json::from_str(
            r#"{"error":"boom","error_type":"RATE_LIMITED","timestamp":1709555400}"#,
        )
        .unwrap();
        assert_eq!(report.timestamp, Some(1709555400));

        let report: FailureReport =
            serde_json::from_str(r#"{"error":"boom","error_type":"RATE_LIMITED"}"#).unwrap();
        assert_eq!(report.timestamp, None);
    }

    #[test]
    fn test_failure_kind_unknown_fallback() {
        // An unrecognized error_type string maps to Unknown instead of
        // failing the whole report.
        let report: FailureReport = serde_json::from_str(
            r#"{"error":"boom","error_type":"SOMETHING_NEW"}"#,
        )
        .unwrap();
        assert_eq!(report.error_type, FailureKind::Unknown);
        assert!(!report.error_type.restricts_sender());
    }

    #[test]
    fn test_server_event_serialization_tags() {
        let event = ServerEvent::SenderOffline {
            sender_id: "s1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"sender-offline""#));
    }
}
