use serde::Serialize;

use crate::schemas::{Group, Settlement, Timestamp, UserId};

pub const RECENT_ACTIVITY_LIMIT: usize = 20;

const UNKNOWN_GROUP: &str = "Unknown";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActivityEvent {
    Expense {
        id: String,
        group_id: String,
        group_name: String,
        description: String,
        amount: f64,
        paid_by: UserId,
        date: Timestamp,
    },
    Settle {
        id: String,
        group_id: String,
        group_name: String,
        from_user_id: UserId,
        to_user_id: UserId,
        amount: f64,
        date: Timestamp,
    },
}

impl ActivityEvent {
    pub fn date(&self) -> Timestamp {
        match self {
            ActivityEvent::Expense { date, .. } | ActivityEvent::Settle { date, .. } => *date,
        }
    }
}

/// Expenses of every group plus every settlement, newest first, capped at
/// [`RECENT_ACTIVITY_LIMIT`]. Equal timestamps keep expenses before settlements and
/// otherwise input order.
pub fn recent_activity(groups: &[Group], settlements: &[Settlement]) -> Vec<ActivityEvent> {
    let expenses = groups.iter().flat_map(|group| {
        group.expenses.iter().map(move |e| ActivityEvent::Expense {
            id: e.id.clone(),
            group_id: group.id.clone(),
            group_name: group.name.clone(),
            description: e.description.clone(),
            amount: e.amount,
            paid_by: e.paid_by.clone(),
            date: e.date,
        })
    });
    let settles = settlements.iter().map(|s| ActivityEvent::Settle {
        id: s.id.clone(),
        group_id: s.group_id.clone(),
        group_name: groups
            .iter()
            .find(|g| g.id == s.group_id)
            .map_or_else(|| UNKNOWN_GROUP.to_string(), |g| g.name.clone()),
        from_user_id: s.from_user_id.clone(),
        to_user_id: s.to_user_id.clone(),
        amount: s.amount,
        date: s.date,
    });

    let mut activity: Vec<ActivityEvent> = expenses.chain(settles).collect();
    // sort_by is stable
    activity.sort_by(|a, b| b.date().cmp(&a.date()));
    activity.truncate(RECENT_ACTIVITY_LIMIT);
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::{expense, group, settlement};
    use chrono::Duration;

    fn at(mut e: crate::schemas::Expense, minutes: i64) -> crate::schemas::Expense {
        e.date += Duration::minutes(minutes);
        e
    }

    #[test]
    fn test_activity_is_newest_first_and_capped() {
        let groups = vec![
            group(
                "g1",
                &["a", "b"],
                (0..15).map(|i| at(expense(&format!("x{i}"), 1.0, "a", &["a", "b"]), i)).collect(),
            ),
            group(
                "g2",
                &["a", "c"],
                (0..15).map(|i| at(expense(&format!("y{i}"), 2.0, "c", &["a", "c"]), i * 2)).collect(),
            ),
        ];
        let activity = recent_activity(&groups, &[]);
        assert_eq!(activity.len(), RECENT_ACTIVITY_LIMIT);
        assert!(activity.windows(2).all(|w| w[0].date() >= w[1].date()));
        assert!(matches!(&activity[0], ActivityEvent::Expense { id, .. } if id == "y14"));
    }

    #[test]
    fn test_settlement_for_unloaded_group_is_labelled_unknown() {
        let groups = vec![group("g1", &["a", "b"], vec![])];
        let mut late = settlement("s2", "g1", "b", "a", 5.0);
        late.date += Duration::hours(1);
        let activity = recent_activity(&groups, &[settlement("s1", "gone", "a", "b", 3.0), late]);

        assert_eq!(activity.len(), 2);
        match &activity[0] {
            ActivityEvent::Settle { id, group_name, .. } => {
                assert_eq!(id, "s2");
                assert_eq!(group_name, "group g1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &activity[1] {
            ActivityEvent::Settle { group_name, .. } => assert_eq!(group_name, "Unknown"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_equal_timestamps_keep_input_order() {
        let groups = vec![group(
            "g1",
            &["a", "b"],
            vec![expense("e1", 1.0, "a", &["a"]), expense("e2", 1.0, "a", &["a"])],
        )];
        let settlements = vec![settlement("s1", "g1", "b", "a", 1.0)];
        let ids: Vec<String> = recent_activity(&groups, &settlements)
            .into_iter()
            .map(|event| match event {
                ActivityEvent::Expense { id, .. } | ActivityEvent::Settle { id, .. } => id,
            })
            .collect();
        assert_eq!(ids, vec!["e1", "e2", "s1"]);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let groups = vec![group("g1", &["a"], vec![expense("e1", 1.0, "a", &["a"])])];
        let json = serde_json::to_value(&recent_activity(&groups, &[])[0]).unwrap();
        assert_eq!(json["type"], "expense");
        assert_eq!(json["group_name"], "group g1");
    }
}
