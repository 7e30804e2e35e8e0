//! Time arithmetic and viewer-local rendering.
//!
//! Everything is stored as UTC milliseconds. Rendering takes the viewer's
//! offset in minutes east of UTC, and `now` is always passed in.

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// Largest offset any real timezone uses.
pub const MAX_OFFSET_MINUTES: i32 = 14 * 60;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whole minutes in `delta_ms`, rounded up and never negative.
pub fn minutes_ceil(delta_ms: i64) -> i64 {
    if delta_ms <= 0 {
        return 0;
    }
    (delta_ms + MINUTE_MS - 1) / MINUTE_MS
}

fn zone(offset_minutes: i32) -> FixedOffset {
    let clamped = offset_minutes.clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES);
    FixedOffset::east_opt(clamped * 60).unwrap_or_else(|| Utc.fix())
}

fn local(ms: i64, offset_minutes: i32) -> DateTime<FixedOffset> {
    let tz = zone(offset_minutes);
    tz.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::default().with_timezone(&tz))
}

/// `"7:05 PM"`
pub fn format_local_time(ms: i64, offset_minutes: i32) -> String {
    local(ms, offset_minutes).format("%-I:%M %p").to_string()
}

/// `"Today at 7:05 PM"`, `"Tomorrow at 7:05 PM"` or `"Oct 19, 7:05 PM"`.
pub fn format_local_date_time(ms: i64, now: i64, offset_minutes: i32) -> String {
    if is_today(ms, now, offset_minutes) {
        return format!("Today at {}", format_local_time(ms, offset_minutes));
    }
    let date = local(ms, offset_minutes).date_naive();
    let today = local(now, offset_minutes).date_naive();
    if today.succ_opt() == Some(date) {
        return format!("Tomorrow at {}", format_local_time(ms, offset_minutes));
    }
    local(ms, offset_minutes).format("%b %-d, %-I:%M %p").to_string()
}

/// Default start for a new ping: the next ten-minute mark in the viewer's
/// clock, seconds dropped. A time inside a boundary minute stays there.
pub fn next_rounded_10_minutes(now: i64, offset_minutes: i32) -> i64 {
    let shift = offset_minutes.clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES) as i64 * MINUTE_MS;
    let local_minute = (now + shift).div_euclid(MINUTE_MS);
    let rounded = (local_minute + 9).div_euclid(10) * 10;
    rounded * MINUTE_MS - shift
}

/// `"Now"`, `"12m"`, `"1h 5m"`, `"2h"`, `"1d 3h"`, `"2d"`.
pub fn time_until(future: i64, now: i64) -> String {
    let diff = future - now;
    if diff <= 0 {
        return "Now".to_string();
    }

    let total = minutes_ceil(diff);
    if total < 60 {
        return format!("{}m", total);
    }

    let hours = total / 60;
    let minutes = total % 60;
    if hours < 24 {
        return if minutes > 0 { format!("{}h {}m", hours, minutes) } else { format!("{}h", hours) };
    }

    let days = hours / 24;
    let rem_hours = hours % 24;
    if rem_hours > 0 { format!("{}d {}h", days, rem_hours) } else { format!("{}d", days) }
}

/// `"Just now"`, `"12m ago"`, `"1h 5m ago"`, `"3d ago"`.
pub fn time_since(past: i64, now: i64) -> String {
    let total = (now - past).div_euclid(MINUTE_MS);
    if total <= 0 {
        return "Just now".to_string();
    }
    if total < 60 {
        return format!("{}m ago", total);
    }

    let hours = total / 60;
    if hours < 24 {
        let minutes = total % 60;
        return if minutes > 0 {
            format!("{}h {}m ago", hours, minutes)
        } else {
            format!("{}h ago", hours)
        };
    }

    let days = hours / 24;
    let rem_hours = hours % 24;
    if rem_hours > 0 { format!("{}d {}h ago", days, rem_hours) } else { format!("{}d ago", days) }
}

pub fn is_today(ms: i64, now: i64, offset_minutes: i32) -> bool {
    local(ms, offset_minutes).date_naive() == local(now, offset_minutes).date_naive()
}

/// `"UTC+2"`, `"UTC-8"`, `"UTC+5:30"`.
pub fn timezone_offset_label(offset_minutes: i32) -> String {
    let sign = if offset_minutes >= 0 { '+' } else { '-' };
    let abs = offset_minutes.unsigned_abs();
    let hours = abs / 60;
    let minutes = abs % 60;
    if minutes == 0 {
        format!("UTC{}{}", sign, hours)
    } else {
        format!("UTC{}{}:{:02}", sign, hours, minutes)
    }
}

pub fn notification_text(scheduled_at: i64, creator_name: &str, offset_minutes: i32) -> String {
    format!("{} start playing at {}", creator_name, format_local_time(scheduled_at, offset_minutes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * HOUR_MS;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp_millis()
    }

    #[test]
    fn formats_twelve_hour_clock() {
        let t = at(2024, 3, 10, 19, 5, 0);
        assert_eq!(format_local_time(t, 0), "7:05 PM");
        assert_eq!(format_local_time(t, 120), "9:05 PM");
        assert_eq!(format_local_time(t, -8 * 60), "11:05 AM");
        assert_eq!(format_local_time(at(2024, 3, 10, 0, 0, 0), 0), "12:00 AM");
    }

    #[test]
    fn formats_relative_dates() {
        let now = at(2024, 3, 10, 18, 0, 0);
        assert_eq!(format_local_date_time(at(2024, 3, 10, 19, 5, 0), now, 0), "Today at 7:05 PM");
        assert_eq!(format_local_date_time(at(2024, 3, 11, 9, 0, 0), now, 0), "Tomorrow at 9:00 AM");
        assert_eq!(format_local_date_time(at(2024, 3, 14, 9, 30, 0), now, 0), "Mar 14, 9:30 AM");
        // 23:30 UTC is already tomorrow at UTC+2
        assert_eq!(format_local_date_time(at(2024, 3, 10, 23, 30, 0), now, 120), "Tomorrow at 1:30 AM");
    }

    #[test]
    fn rounds_up_to_ten_minutes() {
        assert_eq!(next_rounded_10_minutes(at(2024, 3, 10, 19, 3, 20), 0), at(2024, 3, 10, 19, 10, 0));
        assert_eq!(next_rounded_10_minutes(at(2024, 3, 10, 19, 51, 0), 0), at(2024, 3, 10, 20, 0, 0));
        assert_eq!(next_rounded_10_minutes(at(2024, 3, 10, 19, 20, 45), 0), at(2024, 3, 10, 19, 20, 0));
        assert_eq!(next_rounded_10_minutes(at(2024, 3, 10, 23, 55, 0), 0), at(2024, 3, 11, 0, 0, 0));
    }

    #[test]
    fn rounding_follows_the_viewer_clock() {
        // 19:03 UTC is 00:33 at UTC+5:30, so the next mark is 00:40 local
        let now = at(2024, 3, 10, 19, 3, 0);
        assert_eq!(next_rounded_10_minutes(now, 330), at(2024, 3, 10, 19, 10, 0));
        let now = at(2024, 3, 10, 19, 1, 0);
        assert_eq!(next_rounded_10_minutes(now, 330), at(2024, 3, 10, 19, 10, 0));
        let now = at(2024, 3, 10, 19, 2, 0);
        assert_eq!(format_local_time(next_rounded_10_minutes(now, 330), 330), "12:40 AM");
        let now = at(2024, 3, 10, 19, 0, 0);
        assert_eq!(format_local_time(next_rounded_10_minutes(now, 330), 330), "12:30 AM");
    }

    #[test]
    fn time_until_buckets() {
        let now = 0;
        assert_eq!(time_until(-5, now), "Now");
        assert_eq!(time_until(1, now), "1m");
        assert_eq!(time_until(12 * MINUTE_MS, now), "12m");
        assert_eq!(time_until(65 * MINUTE_MS, now), "1h 5m");
        assert_eq!(time_until(2 * HOUR_MS, now), "2h");
        assert_eq!(time_until(DAY_MS + 3 * HOUR_MS, now), "1d 3h");
        assert_eq!(time_until(2 * DAY_MS, now), "2d");
    }

    #[test]
    fn time_since_buckets() {
        let now = 10 * DAY_MS;
        assert_eq!(time_since(now - 30_000, now), "Just now");
        assert_eq!(time_since(now + 5_000, now), "Just now");
        assert_eq!(time_since(now - 12 * MINUTE_MS, now), "12m ago");
        assert_eq!(time_since(now - 65 * MINUTE_MS, now), "1h 5m ago");
        assert_eq!(time_since(now - 3 * HOUR_MS, now), "3h ago");
        assert_eq!(time_since(now - 3 * DAY_MS, now), "3d ago");
        assert_eq!(time_since(now - DAY_MS - 2 * HOUR_MS, now), "1d 2h ago");
    }

    #[test]
    fn today_respects_offset() {
        let now = at(2024, 3, 10, 22, 0, 0);
        let later = at(2024, 3, 10, 23, 30, 0);
        assert!(is_today(later, now, 0));
        assert!(!is_today(later, now, 60));
    }

    #[test]
    fn offset_labels() {
        assert_eq!(timezone_offset_label(120), "UTC+2");
        assert_eq!(timezone_offset_label(-480), "UTC-8");
        assert_eq!(timezone_offset_label(330), "UTC+5:30");
        assert_eq!(timezone_offset_label(0), "UTC+0");
    }

    #[test]
    fn notification_uses_local_time() {
        let t = at(2024, 3, 10, 19, 30, 0);
        assert_eq!(notification_text(t, "Dana", 60), "Dana start playing at 8:30 PM");
    }

    #[test]
    fn minutes_round_up() {
        assert_eq!(minutes_ceil(0), 0);
        assert_eq!(minutes_ceil(-1), 0);
        assert_eq!(minutes_ceil(1), 1);
        assert_eq!(minutes_ceil(MINUTE_MS), 1);
        assert_eq!(minutes_ceil(MINUTE_MS + 1), 2);
    }
}
