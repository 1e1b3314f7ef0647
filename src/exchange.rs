use serde::Serialize;

use crate::balance::calculate_pairwise_balance;
use crate::schemas::{Group, Settlement, UserId};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Exchange {
    pub payer: UserId,
    pub receiver: UserId,
    pub amount: f64,
}

/// What one member still has to settle inside a group, member by member.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SettleUpSummary {
    /// Exchanges where `user` is the receiver.
    pub owed_to_user: Vec<Exchange>,
    /// Exchanges where `user` is the payer.
    pub owed_by_user: Vec<Exchange>,
    pub total_spent: f64,
}

impl SettleUpSummary {
    pub fn all_settled(&self) -> bool {
        self.owed_to_user.is_empty() && self.owed_by_user.is_empty() && self.total_spent == 0.0
    }
}

pub fn settle_up_summary(group: &Group, settlements: &[Settlement], user: &str) -> SettleUpSummary {
    let mut summary = SettleUpSummary {
        total_spent: group
            .expenses
            .iter()
            .filter(|e| e.paid_by == user)
            .map(|e| e.amount)
            .sum(),
        ..Default::default()
    };

    for member in group.members.iter().filter(|m| *m != user) {
        let net = calculate_pairwise_balance(group, settlements, user, member);
        if net > 0.0 {
            summary.owed_to_user.push(Exchange {
                payer: member.clone(),
                receiver: user.to_string(),
                amount: net,
            });
        } else if net < 0.0 {
            summary.owed_by_user.push(Exchange {
                payer: user.to_string(),
                receiver: member.clone(),
                amount: net.abs(),
            });
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::{expense, group, settlement};

    #[test]
    fn test_summary_splits_debtors_and_creditors() {
        let g = group(
            "g",
            &["a", "b", "c"],
            vec![
                expense("e1", 90.0, "a", &["a", "b", "c"]),
                expense("e2", 40.0, "c", &["a", "c"]),
            ],
        );
        let summary = settle_up_summary(&g, &[], "a");
        assert_eq!(summary.total_spent, 90.0);
        // c is owed 20 back for e2, which nets against their 30 share of e1.
        assert_eq!(
            summary.owed_to_user,
            vec![
                Exchange {
                    payer: "b".to_string(),
                    receiver: "a".to_string(),
                    amount: 30.0,
                },
                Exchange {
                    payer: "c".to_string(),
                    receiver: "a".to_string(),
                    amount: 10.0,
                },
            ]
        );
        assert!(summary.owed_by_user.is_empty());
    }

    #[test]
    fn test_settled_pairs_are_omitted() {
        let g = group("g", &["a", "b"], vec![expense("e1", 20.0, "b", &["a", "b"])]);
        let summary = settle_up_summary(&g, &[], "a");
        assert_eq!(summary.owed_by_user[0].receiver, "b");
        assert_eq!(summary.owed_by_user[0].amount, 10.0);

        let settled = settle_up_summary(&g, &[settlement("s1", "g", "a", "b", 10.0)], "a");
        assert!(settled.owed_by_user.is_empty());
        assert!(settled.owed_to_user.is_empty());
        assert!(settled.all_settled());
        assert!(!settle_up_summary(&g, &[], "b").all_settled());
        assert!(settle_up_summary(&group("g", &["a", "b"], vec![]), &[], "a").all_settled());
    }
}
