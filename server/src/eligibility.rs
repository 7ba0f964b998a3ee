//! Sender eligibility filter
//!
//! Decides whether a candidate sender may carry the next send of a campaign.
//! Checks run in a fixed order and the first failure wins, so the returned
//! reason is deterministic. A campaign-level test-mode override (any online
//! sender with `test_mode`) skips the rest, warmup, and daily-cap checks but
//! never the online check or the outstanding-task check.

use crate::store::Store;
use anyhow::Result;
use shared::model::{Campaign, OutboundAccount, OutboundAccountStatus, Sender, SenderStatus};
use std::fmt;

/// Why a sender cannot take the next send. The variants are ordered the way
/// the checks run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligibility {
    /// Sender session is not online.
    Offline,
    /// Sender is inside a restriction cooldown window.
    Restricted { until: i64 },
    /// The outbound account is on a mandatory rest day.
    Resting { until: i64 },
    /// The warmup schedule allots zero sends for this warmup day.
    WarmupPaused { day: i64 },
    /// The warmup cap for this day is spent.
    WarmupCapReached { day: i64, cap: u32, sent: i64 },
    /// The per-campaign daily cap for this sender is spent.
    DailyCapReached { cap: u32, sent: i64 },
    /// A task for this (sender, campaign) pair is already open.
    TaskOutstanding,
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligibility::Offline => write!(f, "sender offline"),
            Ineligibility::Restricted { until } => {
                write!(f, "sender restricted until {}", until)
            }
            Ineligibility::Resting { until } => {
                write!(f, "outbound account resting until {}", until)
            }
            Ineligibility::WarmupPaused { day } => {
                write!(f, "warmup day {} allows no sends", day)
            }
            Ineligibility::WarmupCapReached { day, cap, sent } => {
                write!(f, "warmup day {} cap reached ({}/{})", day, sent, cap)
            }
            Ineligibility::DailyCapReached { cap, sent } => {
                write!(f, "daily cap reached ({}/{})", sent, cap)
            }
            Ineligibility::TaskOutstanding => write!(f, "task already outstanding"),
        }
    }
}

/// Calendar and policy context for one eligibility pass, computed once per
/// campaign dispatch.
#[derive(Debug, Clone)]
pub struct EligibilityParams {
    pub now: i64,
    /// Start of the current local day in the campaign's zone.
    pub today_local_midnight: i64,
    /// Half-open unix range of the current local day.
    pub local_day_range: (i64, i64),
    /// Campaign-level test-mode override.
    pub test_mode: bool,
    /// Fallback daily cap when neither campaign nor sender sets one.
    pub default_daily_limit: u32,
}

/// Evaluates the eligibility checks for one sender in order.
///
/// Returns `None` when the sender is eligible, otherwise the first reason
/// that disqualifies it.
pub async fn evaluate(
    store: &mut Store,
    campaign: &Campaign,
    sender: &Sender,
    outbound_account: &OutboundAccount,
    params: &EligibilityParams,
) -> Result<Option<Ineligibility>> {
    // 1. Online state; a restriction cooldown keeps the sender out even if
    //    its status was flipped back by hand.
    if sender.status != SenderStatus::Online {
        return Ok(Some(Ineligibility::Offline));
    }
    if let Some(until) = sender.restricted_until {
        if until > params.now {
            return Ok(Some(Ineligibility::Restricted { until }));
        }
    }

    if !params.test_mode {
        // 2. Mandatory rest day on the outbound account.
        if let Some(rest_until) = outbound_account.rest_until {
            if rest_until > params.today_local_midnight {
                return Ok(Some(Ineligibility::Resting { until: rest_until }));
            }
        }

        // 3. Warmup ramp cap, counted across all campaigns.
        if outbound_account.status == OutboundAccountStatus::Warming {
            if let Some(start_date) = outbound_account.warmup.start_date {
                let day = (params.now - start_date).div_euclid(86400) + 1;
                if let Some(cap) = outbound_account.warmup.cap_for_day(day) {
                    if cap == 0 {
                        return Ok(Some(Ineligibility::WarmupPaused { day }));
                    }
                    let (start, end) = params.local_day_range;
                    let sent = store
                        .count_sender_sends_in_range(&sender.id, start, end, None)
                        .await?;
                    if sent >= i64::from(cap) {
                        return Ok(Some(Ineligibility::WarmupCapReached { day, cap, sent }));
                    }
                }
            }
        }

        // 4. Per-campaign daily cap for this sender.
        let cap = campaign
            .schedule
            .daily_limit_per_sender
            .or(sender.daily_limit)
            .unwrap_or(params.default_daily_limit);
        let (start, end) = params.local_day_range;
        let sent = store
            .count_sender_sends_in_range(&sender.id, start, end, Some(&campaign.id))
            .await?;
        if sent >= i64::from(cap) {
            return Ok(Some(Ineligibility::DailyCapReached { cap, sent }));
        }
    }

    // 5. At most one open task per (sender, campaign).
    if store.has_open_task(&sender.id, &campaign.id).await? {
        return Ok(Some(Ineligibility::TaskOutstanding));
    }

    Ok(None)
}
