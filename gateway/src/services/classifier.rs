//! Time-window punch classification
//!
//! Pure function over a rule slice. The slice order is the declaration order
//! used to break priority ties, so callers must pass rules as stored (by id).

use crate::db::models::TimeWindowRule;
use crate::punch::PunchType;
use time::{PrimitiveDateTime, Time};

/// Pick the punch type for `at`, or `None` when no active rule covers it.
///
/// A rule matches when it is active, lists the weekday of `at`, and the
/// time of day falls in `[start, end)`. `end < start` spans midnight; an
/// equal start and end is an empty window. Among matches the lowest
/// priority wins, then the earliest rule in the slice.
pub fn classify(at: PrimitiveDateTime, rules: &[TimeWindowRule]) -> Option<PunchType> {
    let weekday = at.weekday().number_days_from_monday();
    let time_of_day = at.time();

    rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.active)
        .filter(|(_, rule)| rule.days_of_week.contains(&weekday))
        .filter(|(_, rule)| window_contains(rule.start_time, rule.end_time, time_of_day))
        .min_by_key(|(index, rule)| (rule.priority, *index))
        .map(|(_, rule)| rule.punch_type)
}

/// Half-open membership test with midnight wrap
pub fn window_contains(start: Time, end: Time, t: Time) -> bool {
    if start < end {
        start <= t && t < end
    } else if end < start {
        t >= start || t < end
    } else {
        false
    }
}
