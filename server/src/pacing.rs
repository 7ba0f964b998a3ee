//! Pacing calculator
//!
//! Pure functions that decide how long a campaign waits between sends.
//! Randomness is injected by the caller: the scheduler passes a sampled
//! jitter factor or an RNG, while UI estimates pass zero jitter so repeated
//! polls return a stable value.

use rand::Rng;
use shared::model::{BurstParams, CampaignSchedule};

/// Smooth-mode delay in seconds until the next send.
///
/// Spreads the remaining daily budget over the remaining active window:
/// with `N = cap x online senders` and `sent` messages already out today,
/// the base delay is `remaining_window_seconds / remaining_messages`,
/// jittered by `jitter` (a factor in [-0.2, 0.2]). The result never exceeds
/// the fresh-start pace `window_length / N` and never drops below
/// `floor_seconds`. The remaining window is floored at
/// `window_floor_seconds` so the division stays sane near the window edge.
#[allow(clippy::too_many_arguments)]
pub fn smooth_delay(
    schedule: &CampaignSchedule,
    daily_cap_per_sender: u32,
    online_sender_count: usize,
    sent_today_total: i64,
    seconds_into_local_day: i64,
    floor_seconds: u64,
    window_floor_seconds: u64,
    jitter: f64,
) -> u64 {
    let cap_total = i64::from(daily_cap_per_sender) * online_sender_count.max(1) as i64;
    let remaining_messages = (cap_total - sent_today_total).max(1);

    let window_end_seconds = i64::from(schedule.active_hours_end) * 3600;
    let remaining_seconds =
        (window_end_seconds - seconds_into_local_day).max(window_floor_seconds as i64);

    let base = remaining_seconds as f64 / remaining_messages as f64;
    let jittered = base * (1.0 + jitter);

    let window_length_seconds = i64::from(
        schedule
            .active_hours_end
            .saturating_sub(schedule.active_hours_start),
    ) * 3600;
    let full_window_pace = window_length_seconds as f64 / cap_total as f64;

    let clamped = jittered.min(full_window_pace).max(floor_seconds as f64);
    clamped.round() as u64
}

/// Jitter-free smooth-mode estimate for UI polling.
#[allow(clippy::too_many_arguments)]
pub fn smooth_delay_estimate(
    schedule: &CampaignSchedule,
    daily_cap_per_sender: u32,
    online_sender_count: usize,
    sent_today_total: i64,
    seconds_into_local_day: i64,
    floor_seconds: u64,
    window_floor_seconds: u64,
) -> u64 {
    smooth_delay(
        schedule,
        daily_cap_per_sender,
        online_sender_count,
        sent_today_total,
        seconds_into_local_day,
        floor_seconds,
        window_floor_seconds,
        0.0,
    )
}

/// Sample a smooth-mode jitter factor, uniform in [-0.2, 0.2].
pub fn sample_jitter<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.random_range(-0.2..=0.2)
}

/// Burst-mode delay between sends within a group, uniform in
/// `[min_delay_seconds, max_delay_seconds]`.
pub fn burst_delay<R: Rng + ?Sized>(burst: &BurstParams, rng: &mut R) -> u64 {
    if burst.min_delay_seconds >= burst.max_delay_seconds {
        return burst.min_delay_seconds;
    }
    rng.random_range(burst.min_delay_seconds..=burst.max_delay_seconds)
}

/// Burst-mode group break duration, uniform in
/// `[min_break_seconds, max_break_seconds]`.
pub fn burst_break<R: Rng + ?Sized>(burst: &BurstParams, rng: &mut R) -> u64 {
    if burst.min_break_seconds >= burst.max_break_seconds {
        return burst.min_break_seconds;
    }
    rng.random_range(burst.min_break_seconds..=burst.max_break_seconds)
}
