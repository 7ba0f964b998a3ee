//! Consecutive-sending-day streak tracker
//!
//! Each outbound account carries a counter of consecutive local days with at
//! least one send. The tracker runs once per successful lease and is
//! idempotent per local calendar day. Five straight days earn one mandatory
//! rest day; ten earn two and reset the counter.

use crate::store::Store;
use anyhow::Result;
use chrono_tz::Tz;
use shared::model::OutboundAccount;
use shared::timeutil;
use tracing::{debug, info};

/// The streak fields to persist after a send advanced the streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreakUpdate {
    pub streak_days: i64,
    pub last_send_date: i64,
    pub rest_until: Option<i64>,
}

/// Computes the streak transition for a send happening at `now`.
///
/// Returns `None` when the streak was already advanced today (the tracker
/// ran earlier in the same local day).
pub fn compute(account: &OutboundAccount, now: i64, tz: Tz) -> Option<StreakUpdate> {
    let today = timeutil::local_date(now, tz);

    if let Some(last) = account.streak_last_send_date {
        if timeutil::local_date(last, tz) == today {
            return None;
        }
    }

    let resumed_after_rest = account
        .rest_until
        .map(|rest_until| rest_until <= now)
        .unwrap_or(false);
    let sent_yesterday = account
        .streak_last_send_date
        .map(|last| timeutil::local_days_between(last, now, tz) == 1)
        .unwrap_or(false);

    let mut streak = if resumed_after_rest || sent_yesterday {
        account.streak_days + 1
    } else {
        1
    };

    let mut rest_until = None;
    if streak == 5 {
        // One full rest day; the streak survives it.
        rest_until = Some(timeutil::local_midnight_plus_days(now, tz, 2));
    } else if streak >= 10 {
        // Two full rest days and the counter starts over.
        rest_until = Some(timeutil::local_midnight_plus_days(now, tz, 3));
        streak = 0;
    }

    Some(StreakUpdate {
        streak_days: streak,
        last_send_date: now,
        rest_until,
    })
}

/// Advances the streak for the outbound account behind a dispatched sender.
pub async fn track(store: &mut Store, outbound_account_id: &str, tz: Tz, now: i64) -> Result<()> {
    let Some(account) = store.get_outbound_account(outbound_account_id).await? else {
        debug!(
            outbound_account_id = %outbound_account_id,
            "Streak tracking skipped: outbound account not found"
        );
        return Ok(());
    };

    let Some(update) = compute(&account, now, tz) else {
        return Ok(());
    };

    if update.rest_until.is_some() {
        info!(
            outbound_account_id = %outbound_account_id,
            streak_days = update.streak_days,
            rest_until = ?update.rest_until,
            "Streak threshold reached, scheduling rest window"
        );
    }

    store
        .apply_streak(
            outbound_account_id,
            update.streak_days,
            update.last_send_date,
            update.rest_until,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{OutboundAccountStatus, WarmupPlan};

    const DAY: i64 = 86400;
    // 2024-03-04 12:00:00 UTC
    const NOON: i64 = 1709553600;

    fn tz() -> Tz {
        timeutil::parse_tz("Etc/UTC")
    }

    fn account(streak: i64, last_send: Option<i64>, rest_until: Option<i64>) -> OutboundAccount {
        OutboundAccount {
            id: "oa1".to_string(),
            account_id: "a1".to_string(),
            handle: "sender_one".to_string(),
            status: OutboundAccountStatus::Ready,
            warmup: WarmupPlan {
                enabled: false,
                start_date: None,
                day_caps: vec![],
            },
            streak_days: streak,
            streak_last_send_date: last_send,
            rest_until,
            created_at: 0,
        }
    }

    #[test]
    fn test_first_send_starts_streak_at_one() {
        let update = compute(&account(0, None, None), NOON, tz()).unwrap();
        assert_eq!(update.streak_days, 1);
        assert_eq!(update.last_send_date, NOON);
        assert_eq!(update.rest_until, None);
    }

    #[test]
    fn test_same_day_send_is_idempotent() {
        let earlier = NOON - 3600;
        assert_eq!(compute(&account(3, Some(earlier), None), NOON, tz()), None);
    }

    #[test]
    fn test_consecutive_day_increments() {
        let update = compute(&account(2, Some(NOON - DAY), None), NOON, tz()).unwrap();
        assert_eq!(update.streak_days, 3);
        assert_eq!(update.rest_until, None);
    }

    #[test]
    fn test_gap_resets_to_one() {
        let update = compute(&account(4, Some(NOON - 3 * DAY), None), NOON, tz()).unwrap();
        assert_eq!(update.streak_days, 1);
    }

    #[test]
    fn test_fifth_day_schedules_one_rest_day() {
        let update = compute(&account(4, Some(NOON - DAY), None), NOON, tz()).unwrap();
        assert_eq!(update.streak_days, 5);
        let midnight = timeutil::local_midnight(NOON, tz());
        assert_eq!(update.rest_until, Some(midnight + 2 * DAY));
    }

    #[test]
    fn test_streak_resumes_after_expired_rest() {
        // Day 5 triggered a rest window; two days later the window has
        // expired and the streak continues from where it left off.
        let rest_until = timeutil::local_midnight(NOON, tz()); // expired by noon
        let update = compute(
            &account(5, Some(NOON - 2 * DAY), Some(rest_until)),
            NOON,
            tz(),
        )
        .unwrap();
        assert_eq!(update.streak_days, 6);
        assert_eq!(update.rest_until, None);
    }

    #[test]
    fn test_tenth_day_schedules_two_rest_days_and_resets() {
        let update = compute(&account(9, Some(NOON - DAY), None), NOON, tz()).unwrap();
        assert_eq!(update.streak_days, 0);
        let midnight = timeutil::local_midnight(NOON, tz());
        assert_eq!(update.rest_until, Some(midnight + 3 * DAY));
    }
}
