//! Merges member responses to a ping into arrival groups.
//!
//! A summary is rendered for one viewer: names fall back to "You" for the
//! viewer and labels are in the viewer's local clock.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::schedule::{self, MINUTE_MS};
use crate::types::{Group, Ping, ResponseStatus};

const UNKNOWN_NAME: &str = "Member";

/// Who the summary is rendered for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Viewer<'a> {
    pub user_id: Option<&'a str>,
    pub offset_minutes: i32,
}

/// Members arriving at the same local minute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub time: i64,
    pub label: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "minutes")]
pub enum Countdown {
    StartsIn(i64),
    TimeLeft(i64),
}

impl Countdown {
    pub fn label(self) -> String {
        match self {
            Self::StartsIn(m) => format!("{}m until start", m),
            Self::TimeLeft(m) => format!("{}m left", m),
        }
    }
}

/// An ETA button offered to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaChoice {
    pub minutes: i64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingSummary {
    pub ping_id: String,
    pub created_by: String,
    pub base_time: i64,
    /// `"Today at 7:10 PM"` style start label.
    pub start_label: String,
    /// `"12m"` until start, `"Now"` once started.
    pub starts_in: String,
    pub expires_at: i64,
    pub headline: String,
    /// Push text for members who have not answered.
    pub notification: String,
    pub earliest_time: i64,
    pub earliest_label: String,
    pub earliest_names: Vec<String>,
    pub buckets: Vec<Bucket>,
    pub next_round: Vec<String>,
    pub pending: Vec<String>,
    pub declined: Vec<String>,
    pub countdown: Countdown,
    pub countdown_label: String,
    pub viewer_responded: bool,
    pub selection_title: String,
    pub eta_choices: Vec<EtaChoice>,
    pub is_empty: bool,
}

/// Resolves the label for every uid the summary may mention.
fn name_map(group: &Group, names: &HashMap<String, String>, viewer: Option<&str>) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = group
        .members_by_uid
        .iter()
        .map(|uid| {
            let name = names.get(uid).cloned().unwrap_or_else(|| UNKNOWN_NAME.to_string());
            (uid.clone(), name)
        })
        .collect();

    if let Some(uid) = viewer {
        map.entry(uid.to_string()).or_insert_with(|| "You".to_string());
    }
    map.entry(group.created_by.clone()).or_insert_with(|| "Creator".to_string());
    map
}

pub fn summarize(
    ping: &Ping,
    group: &Group,
    names: &HashMap<String, String>,
    viewer: Viewer<'_>,
    now: i64,
    eta_options: &[i64],
) -> PingSummary {
    let offset = viewer.offset_minutes;
    let base = ping.base_time();
    let labels = name_map(group, names, viewer.user_id);

    let mut buckets: Vec<Bucket> = Vec::new();
    let mut bucket_index: HashMap<String, usize> = HashMap::new();
    let mut next_round = Vec::new();
    let mut pending = Vec::new();
    let mut declined = Vec::new();
    let mut targets = Vec::new();

    // Responders first, then silent members, each once.
    let mut seen: HashSet<&str> = HashSet::new();
    let uids = ping
        .responses
        .iter()
        .map(|r| r.user_id.as_str())
        .chain(group.members_by_uid.iter().map(String::as_str));

    for uid in uids {
        if !seen.insert(uid) {
            continue;
        }
        let name = labels.get(uid).cloned().unwrap_or_else(|| UNKNOWN_NAME.to_string());

        let Some(response) = ping.response_of(uid) else {
            pending.push(name);
            continue;
        };

        match (response.status, response.eta_minutes) {
            (ResponseStatus::Declined, _) => declined.push(name),
            (ResponseStatus::Pending, _) => pending.push(name),
            (ResponseStatus::Eta, None) => next_round.push(name),
            (ResponseStatus::Eta, Some(minutes)) => {
                let target = base + minutes.max(0) * MINUTE_MS;
                let label = schedule::format_local_time(target, offset);
                match bucket_index.get(&label) {
                    Some(&i) => {
                        let bucket = &mut buckets[i];
                        bucket.time = bucket.time.min(target);
                        bucket.names.push(name);
                    }
                    None => {
                        bucket_index.insert(label.clone(), buckets.len());
                        buckets.push(Bucket { time: target, label, names: vec![name] });
                    }
                }
                targets.push(target);
            }
        }
    }

    buckets.sort_by_key(|b| b.time);

    let earliest_time = targets.iter().copied().min().unwrap_or(base);
    let earliest_label = schedule::format_local_time(earliest_time, offset);
    let earliest_names = buckets
        .iter()
        .find(|b| b.label == earliest_label)
        .map(|b| b.names.clone())
        .unwrap_or_default();

    let headline = if earliest_names.is_empty() {
        format!("Start playing at {}", earliest_label)
    } else {
        format!("{} start playing at {}", earliest_names.join(", "), earliest_label)
    };

    let creator_name = labels
        .get(&ping.created_by)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_NAME.to_string());
    let notification = schedule::notification_text(base, &creator_name, offset);

    let countdown = if now < base {
        Countdown::StartsIn(schedule::minutes_ceil(base - now))
    } else {
        Countdown::TimeLeft(schedule::minutes_ceil(ping.expires_at - now))
    };

    let viewer_responded = viewer.user_id.is_some_and(|uid| ping.response_of(uid).is_some());
    let viewer_created = viewer.user_id == Some(ping.created_by.as_str());
    let selection_title = if viewer_responded || viewer_created {
        "Change start time"
    } else {
        "Will you join?"
    };

    let eta_choices = eta_options
        .iter()
        .map(|&minutes| EtaChoice {
            minutes,
            label: schedule::format_local_time(base + minutes * MINUTE_MS, offset),
        })
        .collect();

    let is_empty = buckets.is_empty() && next_round.is_empty() && pending.is_empty() && declined.is_empty();

    PingSummary {
        ping_id: ping.id.clone(),
        created_by: ping.created_by.clone(),
        base_time: base,
        start_label: schedule::format_local_date_time(base, now, offset),
        starts_in: schedule::time_until(base, now),
        expires_at: ping.expires_at,
        headline,
        notification,
        earliest_time,
        earliest_label,
        earliest_names,
        buckets,
        next_round,
        pending,
        declined,
        countdown,
        countdown_label: countdown.label(),
        viewer_responded,
        selection_title: selection_title.to_string(),
        eta_choices,
        is_empty,
    }
}
