//! Tests for the eligibility filter: check ordering, caps, rest days,
//! warmup, the restriction cooldown, and the test-mode override.

use super::fixtures::*;
use crate::eligibility::{self, EligibilityParams, Ineligibility};
use shared::model::{OutboundAccountStatus, SenderStatus};
use shared::timeutil;

fn params(test_mode: bool) -> EligibilityParams {
    let tz = timeutil::parse_tz("Etc/UTC");
    EligibilityParams {
        now: NINE_AM,
        today_local_midnight: timeutil::local_midnight(NINE_AM, tz),
        local_day_range: timeutil::local_day_range(NINE_AM, tz),
        test_mode,
        default_daily_limit: 50,
    }
}

#[tokio::test]
async fn test_offline_sender_is_first_reason() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    let mut sender = s.get_sender("s1").await.unwrap().unwrap();
    sender.status = SenderStatus::Offline;
    // Even with a rest day in place, offline wins because it is checked
    // first.
    let mut oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();
    oa.rest_until = Some(NINE_AM + 86400);

    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::Offline));
}

#[tokio::test]
async fn test_restriction_cooldown_blocks_even_when_online() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    let mut sender = s.get_sender("s1").await.unwrap().unwrap();
    // Status flipped back to online by hand, but the cooldown holds.
    sender.status = SenderStatus::Online;
    sender.restricted_until = Some(NINE_AM + 3600);
    let oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();

    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(
        verdict,
        Some(Ineligibility::Restricted {
            until: NINE_AM + 3600
        })
    );

    // An expired cooldown no longer blocks.
    sender.restricted_until = Some(NINE_AM - 1);
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, None);
}

#[tokio::test]
async fn test_rest_day_blocks_sender() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let mut oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();

    // Rest window covering tomorrow blocks today.
    let tz = timeutil::parse_tz("Etc/UTC");
    let rest_until = timeutil::local_midnight_plus_days(NINE_AM, tz, 2);
    oa.rest_until = Some(rest_until);
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::Resting { until: rest_until }));

    // A window ending at today's midnight does not.
    oa.rest_until = Some(timeutil::local_midnight(NINE_AM, tz));
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, None);
}

#[tokio::test]
async fn test_warmup_day_cap() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 3).await;

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let mut oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();
    oa.status = OutboundAccountStatus::Warming;
    oa.warmup.enabled = true;
    // Day 3 of the ramp (started two days ago), cap 2.
    oa.warmup.start_date = Some(NINE_AM - 2 * 86400);
    oa.warmup.day_caps = vec![0, 1, 2, 5];

    // Nothing sent yet: eligible.
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, None);

    // Two sends today across any campaign exhaust the day-3 cap.
    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(
        verdict,
        Some(Ineligibility::WarmupCapReached {
            day: 3,
            cap: 2,
            sent: 2
        })
    );
}

#[tokio::test]
async fn test_warmup_zero_cap_day_pauses_sending() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 1).await;

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let mut oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();
    oa.status = OutboundAccountStatus::Warming;
    oa.warmup.enabled = true;
    oa.warmup.start_date = Some(NINE_AM - 3600); // day 1
    oa.warmup.day_caps = vec![0, 2];

    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::WarmupPaused { day: 1 }));
}

#[tokio::test]
async fn test_daily_cap_boundary() {
    let (store, _dir) = setup_store().await;
    let mut c = seed_campaign(&store, "c1", &["s1"], 60).await;
    c.schedule.daily_limit_per_sender = Some(50);

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();

    // 49 sends today: the 50th is allowed.
    for _ in 0..49 {
        s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    }
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, None);

    // The 50th send closes the day for this sender.
    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::DailyCapReached { cap: 50, sent: 50 }));
}

#[tokio::test]
async fn test_daily_cap_falls_back_to_sender_then_default() {
    let (store, _dir) = setup_store().await;
    let mut c = seed_campaign(&store, "c1", &["s1"], 5).await;
    c.schedule.daily_limit_per_sender = None;

    let mut s = store.lock().await;
    let mut sender = s.get_sender("s1").await.unwrap().unwrap();
    sender.daily_limit = Some(2);
    let oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();

    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();
    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();

    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::DailyCapReached { cap: 2, sent: 2 }));

    // Without a sender limit the server default (50) applies.
    sender.daily_limit = None;
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, None);
}

#[tokio::test]
async fn test_open_task_blocks_even_in_test_mode() {
    let (store, _dir) = setup_store().await;
    let c = seed_campaign(&store, "c1", &["s1"], 2).await;
    let (scheduler, _registry) = make_scheduler(&store);
    scheduler.run_tick_at(NINE_AM).await.unwrap();

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();

    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::TaskOutstanding));

    // Test mode skips caps and rest but never the outstanding-task check.
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(true))
        .await
        .unwrap();
    assert_eq!(verdict, Some(Ineligibility::TaskOutstanding));
}

#[tokio::test]
async fn test_test_mode_skips_rest_warmup_and_caps() {
    let (store, _dir) = setup_store().await;
    let mut c = seed_campaign(&store, "c1", &["s1"], 5).await;
    c.schedule.daily_limit_per_sender = Some(1);

    let mut s = store.lock().await;
    let sender = s.get_sender("s1").await.unwrap().unwrap();
    let mut oa = s.get_outbound_account("oa_s1").await.unwrap().unwrap();
    oa.status = OutboundAccountStatus::Warming;
    oa.warmup.enabled = true;
    oa.warmup.start_date = Some(NINE_AM - 3600);
    oa.warmup.day_caps = vec![0];
    oa.rest_until = Some(NINE_AM + 7 * 86400);

    s.acquire_lead("c1", "s1", NINE_AM).await.unwrap().unwrap();

    // All of rest, warmup pause, and the daily cap would block...
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(false))
        .await
        .unwrap();
    assert!(verdict.is_some());

    // ...but test mode waves them through.
    let verdict = eligibility::evaluate(&mut s, &c, &sender, &oa, &params(true))
        .await
        .unwrap();
    assert_eq!(verdict, None);
}
