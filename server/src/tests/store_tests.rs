//! Tests for the store: conditional transitions, stats coherence, pickup,
//! retry, and the operator reset.

use super::fixtures::*;
use shared::api::{CompletionReport, FailureKind, FailureReport};
use shared::model::{CampaignStatus, LeadStatus, TaskStatus};

fn completion() -> CompletionReport {
    CompletionReport {
        success: true,
        username: Some("user_c1_0".to_string()),
        thread_id: Some("thread-1".to_string()),
        timestamp: None,
    }
}

fn failure(kind: FailureKind) -> FailureReport {
    FailureReport {
        error: "send failed".to_string(),
        error_type: kind,
        stack_trace: None,
        timestamp: None,
    }
}

async fn dispatch_one(store: &std::sync::Arc<tokio::sync::Mutex<crate::store::Store>>) -> String {
    let (scheduler, _registry) = make_scheduler(store);
    scheduler.run_tick_at(NINE_AM).await.unwrap();

    let mut s = store.lock().await;
    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Queued);
    lead.task_id.expect("queued lead should carry a task id")
}

#[tokio::test]
async fn test_add_lead_counts_pending() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 3).await;

    let mut s = store.lock().await;
    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.pending, 3);
    assert_eq!(campaign.stats.total(), 3);
    assert_eq!(s.count_total_leads("c1").await.unwrap(), 3);
}

#[tokio::test]
async fn test_lead_uniqueness_per_campaign() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    let duplicate = campaign_lead("dup", "c1", "c1_ol0", 99);
    assert!(s.add_campaign_lead(&duplicate).await.is_err());
    // The failed insert must not disturb the stats.
    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.pending, 1);
}

#[tokio::test]
async fn test_acquire_lead_is_oldest_first_and_shifts_stats() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 3).await;

    let mut s = store.lock().await;
    let lead = s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    assert_eq!(lead.id, "c1_cl0");
    assert_eq!(lead.status, LeadStatus::Queued);
    assert_eq!(lead.sender_id.as_deref(), Some("s1"));
    assert_eq!(lead.queued_at, Some(NINE_AM));

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.pending, 2);
    assert_eq!(campaign.stats.queued, 1);
    assert_eq!(campaign.stats.total(), 3);
}

#[tokio::test]
async fn test_acquire_returns_none_when_drained() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    assert!(s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().is_some());
    assert!(s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().is_none());
}

#[tokio::test]
async fn test_complete_task_full_effects() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    let applied = s
        .complete_task(&task_id, &completion(), NINE_AM + 60)
        .await
        .unwrap()
        .unwrap();
    assert!(applied.task_transitioned);
    assert!(applied.lead_transitioned);

    let task = s.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_at, Some(NINE_AM + 60));
    assert!(task.result.is_some());

    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Sent);
    assert_eq!(lead.sent_at, Some(NINE_AM + 60));

    let target = s.get_outbound_lead("c1_ol0").await.unwrap().unwrap();
    assert!(target.messaged);
    assert_eq!(target.dm_date, Some(NINE_AM + 60));
    assert_eq!(target.thread_id.as_deref(), Some("thread-1"));
    assert!(target.last_message.is_some());

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.queued, 0);
    assert_eq!(campaign.stats.sent, 1);
    assert_eq!(campaign.stats.total(), 1);
}

#[tokio::test]
async fn test_replayed_completion_is_noop() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    s.complete_task(&task_id, &completion(), NINE_AM + 60)
        .await
        .unwrap();
    let replay = s
        .complete_task(&task_id, &completion(), NINE_AM + 120)
        .await
        .unwrap()
        .unwrap();
    assert!(!replay.task_transitioned);
    assert!(!replay.lead_transitioned);

    // Timestamps and stats are untouched by the replay.
    let task = s.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.completed_at, Some(NINE_AM + 60));
    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.sent, 1);
    assert_eq!(campaign.stats.total(), 1);
}

#[tokio::test]
async fn test_fail_task_marks_lead_failed() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    let applied = s
        .fail_task(&task_id, &failure(FailureKind::Unknown), NINE_AM + 60)
        .await
        .unwrap()
        .unwrap();
    assert!(applied.task_transitioned);
    assert!(applied.lead_transitioned);

    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Failed);
    assert_eq!(lead.last_error.as_deref(), Some("send failed"));

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.failed, 1);
    assert_eq!(campaign.stats.total(), 1);
}

#[tokio::test]
async fn test_pickup_task_flips_status_and_counts_attempts() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    let picked = s
        .pickup_task("a1", Some("s1"), NINE_AM + 5)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.id, task_id);
    assert_eq!(picked.status, TaskStatus::InProgress);
    assert_eq!(picked.attempts, 1);
    assert_eq!(picked.started_at, Some(NINE_AM + 5));

    // Nothing else is pending.
    assert!(s.pickup_task("a1", Some("s1"), NINE_AM + 6).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pickup_scoped_to_other_sender_sees_nothing() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    dispatch_one(&store).await;

    let mut s = store.lock().await;
    assert!(s
        .pickup_task("a1", Some("someone_else"), NINE_AM + 5)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_retry_records_failed_sender() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    s.fail_task(&task_id, &failure(FailureKind::Unknown), NINE_AM + 60)
        .await
        .unwrap();

    let reset = s
        .retry_leads("c1", &["c1_cl0".to_string()], NINE_AM + 120)
        .await
        .unwrap();
    assert_eq!(reset, 1);

    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Pending);
    assert_eq!(lead.failed_sender_ids, vec!["s1".to_string()]);
    assert!(lead.sender_id.is_none());
    assert!(lead.task_id.is_none());
    assert!(lead.last_error.is_none());

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.pending, 1);
    assert_eq!(campaign.stats.failed, 0);
    assert_eq!(campaign.stats.total(), 1);

    // Retrying a pending lead is a no-op.
    let reset = s
        .retry_leads("c1", &["c1_cl0".to_string()], NINE_AM + 180)
        .await
        .unwrap();
    assert_eq!(reset, 0);
}

#[tokio::test]
async fn test_reset_stuck_tasks_for_account() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    let reclaimed = s.reset_stuck_tasks("a1", NINE_AM + 30).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert!(reclaimed[0].lead_released);

    let task = s.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Pending);

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.pending, 1);
    assert_eq!(campaign.stats.queued, 0);
    assert_eq!(campaign.stats.total(), 1);

    // Running the reset again finds nothing.
    assert!(s.reset_stuck_tasks("a1", NINE_AM + 60).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_campaign_completes_only_when_drained() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    assert!(!s.complete_campaign_if_drained("c1").await.unwrap());

    let lead = s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    assert!(!s.complete_campaign_if_drained("c1").await.unwrap());

    s.skip_lead(&lead.id, "c1", "gone", NINE_AM + 1).await.unwrap();
    assert!(s.complete_campaign_if_drained("c1").await.unwrap());

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_warmup_auto_completion() {
    let (store, _dir) = setup_store().await;
    let mut s = store.lock().await;
    s.insert_account(&account("a1")).await.unwrap();

    let mut oa = outbound_account("oa1", "a1");
    oa.status = shared::model::OutboundAccountStatus::Warming;
    oa.warmup.enabled = true;
    oa.warmup.start_date = Some(NINE_AM - 15 * 86400);
    s.insert_outbound_account(&oa).await.unwrap();

    let mut young = outbound_account("oa2", "a1");
    young.status = shared::model::OutboundAccountStatus::Warming;
    young.warmup.enabled = true;
    young.warmup.start_date = Some(NINE_AM - 3 * 86400);
    s.insert_outbound_account(&young).await.unwrap();

    let completed = s
        .auto_complete_warmups(NINE_AM - 14 * 86400)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, "oa1");

    let oa1 = s.get_outbound_account("oa1").await.unwrap().unwrap();
    assert_eq!(oa1.status, shared::model::OutboundAccountStatus::Ready);
    assert!(!oa1.warmup.enabled);

    let oa2 = s.get_outbound_account("oa2").await.unwrap().unwrap();
    assert!(oa2.warmup.enabled);

    // Idempotent: a second sweep finds nothing.
    assert!(s
        .auto_complete_warmups(NINE_AM - 14 * 86400)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_stale_sender_sweep() {
    let (store, _dir) = setup_store().await;
    let mut s = store.lock().await;
    s.insert_account(&account("a1")).await.unwrap();
    s.insert_outbound_account(&outbound_account("oa1", "a1")).await.unwrap();

    let mut fresh = sender("s1", "a1", "oa1");
    fresh.last_heartbeat = Some(NINE_AM - 10);
    s.insert_sender(&fresh).await.unwrap();

    let mut stale = sender("s2", "a1", "oa1");
    stale.last_heartbeat = Some(NINE_AM - 120);
    s.insert_sender(&stale).await.unwrap();

    let swept = s.sweep_stale_senders(NINE_AM - 60).await.unwrap();
    assert_eq!(swept, vec![("s2".to_string(), "a1".to_string())]);

    let s2 = s.get_sender("s2").await.unwrap().unwrap();
    assert_eq!(s2.status, shared::model::SenderStatus::Offline);
    let s1 = s.get_sender("s1").await.unwrap().unwrap();
    assert_eq!(s1.status, shared::model::SenderStatus::Online);
}

#[tokio::test]
async fn test_cleanup_removes_only_old_terminal_tasks() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 2).await;
    let task_id = dispatch_one(&store).await;

    let mut s = store.lock().await;
    s.complete_task(&task_id, &completion(), NINE_AM).await.unwrap();

    // Young terminal task survives a 30-day retention pass.
    assert_eq!(s.cleanup_old_data(30, NINE_AM + 86400).await.unwrap(), 0);
    // A pass far in the future removes it.
    assert_eq!(
        s.cleanup_old_data(30, NINE_AM + 40 * 86400).await.unwrap(),
        1
    );
    assert!(s.get_task(&task_id).await.unwrap().is_none());
}
