use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

use crate::schemas::{Expense, Group, Settlement, UserId};

/// Signed net amount per member: positive is owed to the member, negative is owed by them.
pub type Balance = HashMap<UserId, f64>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TotalBalance {
    pub total_owed: f64,
    pub total_owing: f64,
}

fn share_of(expense: &Expense) -> Option<f64> {
    if expense.split_between.is_empty() {
        warn!(expense_id = %expense.id, "Skipping expense with an empty split set");
        return None;
    }
    Some(expense.amount / expense.split_between.len() as f64)
}

fn in_group<'a>(
    group: &'a Group,
    settlements: &'a [Settlement],
) -> impl Iterator<Item = &'a Settlement> + 'a {
    settlements.iter().filter(move |s| s.group_id == group.id)
}

pub fn calculate_balances(group: &Group, settlements: &[Settlement]) -> Balance {
    let mut balance: Balance = group.members.iter().map(|m| (m.clone(), 0.0)).collect();
    for expense in &group.expenses {
        let Some(amount_per_receiver) = share_of(expense) else {
            continue;
        };
        *balance.entry(expense.paid_by.clone()).or_insert(0.0) += expense.amount;
        for receiver in &expense.split_between {
            *balance.entry(receiver.clone()).or_insert(0.0) -= amount_per_receiver;
        }
    }
    // Paying someone back reduces the payer's debt.
    for settle in in_group(group, settlements) {
        *balance.entry(settle.from_user_id.clone()).or_insert(0.0) += settle.amount;
        *balance.entry(settle.to_user_id.clone()).or_insert(0.0) -= settle.amount;
    }
    balance
}

/// Positive when `user_b` owes `user_a`, negative when `user_a` owes `user_b`.
///
/// Only expenses whose split set contains both users count. Callers must pass two
/// different ids.
pub fn calculate_pairwise_balance(
    group: &Group,
    settlements: &[Settlement],
    user_a: &str,
    user_b: &str,
) -> f64 {
    let mut net = 0.0;
    for expense in &group.expenses {
        let shares_a = expense.split_between.iter().any(|m| m == user_a);
        let shares_b = expense.split_between.iter().any(|m| m == user_b);
        if !shares_a || !shares_b {
            continue;
        }
        let Some(share) = share_of(expense) else {
            continue;
        };
        if expense.paid_by == user_a {
            net += share;
        } else if expense.paid_by == user_b {
            net -= share;
        }
    }
    for settle in in_group(group, settlements) {
        if settle.from_user_id == user_a && settle.to_user_id == user_b {
            net += settle.amount;
        } else if settle.from_user_id == user_b && settle.to_user_id == user_a {
            net -= settle.amount;
        }
    }
    net
}

pub fn total_balance(user_id: &str, groups: &[Group], settlements: &[Settlement]) -> TotalBalance {
    let mut total = TotalBalance::default();
    for group in groups {
        let balance = calculate_balances(group, settlements)
            .get(user_id)
            .copied()
            .unwrap_or(0.0);
        if balance > 0.0 {
            total.total_owed += balance;
        } else if balance < 0.0 {
            total.total_owing += balance.abs();
        }
    }
    total
}
