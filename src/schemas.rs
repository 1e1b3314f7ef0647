use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type Timestamp = DateTime<Utc>;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
}

/// One-directional friendship edge owned by the signed-in user.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Friend {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub added_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<UserId>,
    pub created_by: UserId,
    pub created_at: Timestamp,
    /// Filled by the sync layer, newest first. Stores return groups without them.
    #[serde(default)]
    pub expenses: Vec<Expense>,
}

impl Group {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Expense {
    pub id: String,
    pub description: String,
    pub amount: f64,
    pub paid_by: UserId,
    pub split_between: Vec<UserId>,
    pub date: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Settlement {
    pub id: String,
    pub group_id: String,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount: f64,
    pub date: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct NewExpense {
    pub description: String,
    pub amount: f64,
    pub paid_by: UserId,
    pub split_between: Vec<UserId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewGroup {
    pub name: String,
    pub members: Vec<UserId>,
    pub created_by: UserId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewSettlement {
    pub group_id: String,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub amount: f64,
}
