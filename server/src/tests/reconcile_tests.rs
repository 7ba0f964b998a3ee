//! Tests for the reconciliation handlers: completion and failure effects,
//! sender restriction, and account notifications.

use super::fixtures::*;
use crate::reconcile;
use crate::registry::AgentRegistry;
use shared::api::{CompletionReport, FailureKind, FailureReport, ServerEvent};
use shared::model::{LeadStatus, SenderStatus, TaskStatus};
use tokio::sync::mpsc;

async fn dispatch_and_get_task_id(
    store: &std::sync::Arc<tokio::sync::Mutex<crate::store::Store>>,
) -> String {
    let (scheduler, _registry) = make_scheduler(store);
    scheduler.run_tick_at(NINE_AM).await.unwrap();
    let mut s = store.lock().await;
    s.get_campaign_lead("c1_cl0")
        .await
        .unwrap()
        .unwrap()
        .task_id
        .expect("dispatch should attach a task")
}

#[tokio::test]
async fn test_completion_notifies_account() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_and_get_task_id(&store).await;

    let registry = AgentRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register("listener", "a1", tx).await;

    let report = CompletionReport {
        success: true,
        username: Some("user_c1_0".to_string()),
        thread_id: Some("th-1".to_string()),
        timestamp: None,
    };
    reconcile::handle_completion(&store, &registry, &task_id, &report, NINE_AM + 30)
        .await
        .unwrap();

    match rx.try_recv().unwrap() {
        ServerEvent::TaskCompleted {
            task_id: event_task,
            campaign_lead_id,
            username,
            thread_id,
        } => {
            assert_eq!(event_task, task_id);
            assert_eq!(campaign_lead_id.as_deref(), Some("c1_cl0"));
            assert_eq!(username.as_deref(), Some("user_c1_0"));
            assert_eq!(thread_id.as_deref(), Some("th-1"));
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    let mut s = store.lock().await;
    let task = s.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_replayed_completion_sends_no_second_event() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_and_get_task_id(&store).await;

    let registry = AgentRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register("listener", "a1", tx).await;

    let report = CompletionReport {
        success: true,
        username: None,
        thread_id: None,
        timestamp: None,
    };
    reconcile::handle_completion(&store, &registry, &task_id, &report, NINE_AM + 30)
        .await
        .unwrap();
    reconcile::handle_completion(&store, &registry, &task_id, &report, NINE_AM + 60)
        .await
        .unwrap();

    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err(), "replay must not emit a second event");
}

#[tokio::test]
async fn test_restriction_class_failure_quarantines_sender() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_and_get_task_id(&store).await;
    let config = test_config();

    let registry = AgentRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.register("listener", "a1", tx).await;

    let report = FailureReport {
        error: "account restricted".to_string(),
        error_type: FailureKind::IgRestricted,
        stack_trace: None,
        timestamp: None,
    };
    reconcile::handle_failure(&store, &registry, &config, &task_id, &report, NINE_AM + 30)
        .await
        .unwrap();

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    assert_eq!(sender.status, SenderStatus::Restricted);
    assert_eq!(sender.restricted_until, Some(NINE_AM + 30 + 24 * 3600));
    assert_eq!(sender.restriction_reason.as_deref(), Some("account restricted"));

    let lead = s.get_campaign_lead("c1_cl0").await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Failed);

    let campaign = s.get_campaign("c1").await.unwrap().unwrap();
    assert_eq!(campaign.stats.failed, 1);
    assert_eq!(campaign.stats.total(), 1);

    // Both the restriction and the failure are announced.
    let mut saw_restricted = false;
    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            ServerEvent::SenderRestricted {
                sender_id,
                restricted_until,
                ..
            } => {
                assert_eq!(sender_id, "s1");
                assert_eq!(restricted_until, NINE_AM + 30 + 24 * 3600);
                saw_restricted = true;
            }
            ServerEvent::TaskFailed { task_id: t, .. } => {
                assert_eq!(t, task_id);
                saw_failed = true;
            }
            _ => {}
        }
    }
    assert!(saw_restricted);
    assert!(saw_failed);
}

#[tokio::test]
async fn test_plain_failure_leaves_sender_alone() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let task_id = dispatch_and_get_task_id(&store).await;
    let config = test_config();
    let registry = AgentRegistry::new();

    let report = FailureReport {
        error: "profile not found".to_string(),
        error_type: FailureKind::Unknown,
        stack_trace: None,
        timestamp: None,
    };
    reconcile::handle_failure(&store, &registry, &config, &task_id, &report, NINE_AM + 30)
        .await
        .unwrap();

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    assert_eq!(sender.status, SenderStatus::Online);
    assert!(sender.restricted_until.is_none());
}

#[tokio::test]
async fn test_unknown_task_is_an_error() {
    let (store, _dir) = setup_store().await;
    seed_campaign(&store, "c1", &["s1"], 1).await;
    let registry = AgentRegistry::new();

    let report = CompletionReport {
        success: true,
        username: None,
        thread_id: None,
        timestamp: None,
    };
    let result =
        reconcile::handle_completion(&store, &registry, "no-such-task", &report, NINE_AM).await;
    assert!(result.is_err());
}
