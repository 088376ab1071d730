//! Publish-time slot allocator.
//!
//! Pure calendar math over the per-pool slot configuration. The generation
//! orchestrator consumes `slots_ahead` plus the daily cap; `is_available`
//! keeps two publications from landing inside the same tolerance window.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::config::SlotConfig;

fn slot_on(date: NaiveDate, slot: &SlotConfig) -> Option<DateTime<Utc>> {
    date.and_hms_opt(u32::from(slot.hour), u32::from(slot.minute), 0)
        .map(|t| t.and_utc())
}

fn enabled_sorted(slots: &[SlotConfig]) -> Vec<&SlotConfig> {
    let mut enabled: Vec<&SlotConfig> = slots.iter().filter(|s| s.enabled).collect();
    enabled.sort_by_key(|s| (s.hour, s.minute));
    enabled
}

/// Earliest enabled slot strictly after `now` on the current day, falling
/// back to the earliest slot tomorrow. `None` when no slot is enabled.
pub fn next_slot(slots: &[SlotConfig], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let enabled = enabled_sorted(slots);
    let today = now.date_naive();

    for slot in &enabled {
        if let Some(t) = slot_on(today, slot) {
            if t > now {
                return Some(t);
            }
        }
    }

    let tomorrow = today.succ_opt()?;
    enabled.first().and_then(|slot| slot_on(tomorrow, slot))
}

/// Every enabled slot in `(now, now + hours_ahead]` across today and
/// tomorrow, ascending.
pub fn slots_ahead(
    slots: &[SlotConfig],
    now: DateTime<Utc>,
    hours_ahead: i64,
) -> Vec<DateTime<Utc>> {
    let limit = now + Duration::hours(hours_ahead);
    let enabled = enabled_sorted(slots);
    let today = now.date_naive();

    let mut out: Vec<DateTime<Utc>> = Vec::new();
    let mut days = vec![today];
    if let Some(tomorrow) = today.succ_opt() {
        days.push(tomorrow);
    }
    for day in days {
        for slot in &enabled {
            if let Some(t) = slot_on(day, slot) {
                if t > now && t <= limit {
                    out.push(t);
                }
            }
        }
    }
    out.sort();
    out
}

/// A slot is unavailable when any existing planned time lies within
/// `tolerance_minutes` of it (absolute difference, inclusive).
pub fn is_available(
    target: DateTime<Utc>,
    existing: &[DateTime<Utc>],
    tolerance_minutes: i64,
) -> bool {
    let tolerance = Duration::minutes(tolerance_minutes);
    !existing.iter().any(|e| (*e - target).abs() <= tolerance)
}
