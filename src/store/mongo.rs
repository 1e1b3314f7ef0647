//! MongoDB ledger store.
//!
//! Subscriptions are built on change streams, so the deployment must be a replica set.
//! A change anywhere in the watched collections re-runs the query and emits the full
//! result.

use std::future::Future;

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Document};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use mongodb::{options::ReplaceOptions, Client, Collection, Database};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_in_filter, LedgerStore, SnapshotStream};
use crate::error::{LedgerError, Result};
use crate::schemas::{
    Expense, Friend, Group, NewExpense, NewGroup, NewSettlement, Settlement, User,
};

const USERS: &str = "users";
const FRIENDS: &str = "friends";
const GROUPS: &str = "groups";
const EXPENSES: &str = "expenses";
const SETTLEMENTS: &str = "settledExpenses";

#[derive(Clone, Debug, Deserialize, Serialize)]
struct UserDoc {
    #[serde(rename = "_id")]
    id: String,
    email: String,
    name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct FriendDoc {
    #[serde(rename = "_id")]
    id: String,
    owner_id: String,
    friend_id: String,
    email: String,
    name: String,
    added_at: bson::DateTime,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupDoc {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    members: Vec<String>,
    created_by: String,
    created_at: bson::DateTime,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseDoc {
    #[serde(rename = "_id")]
    id: String,
    group_id: String,
    description: String,
    amount: f64,
    paid_by: String,
    split_between: Vec<String>,
    date: bson::DateTime,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementDoc {
    #[serde(rename = "_id")]
    id: String,
    group_id: String,
    from_user_id: String,
    to_user_id: String,
    amount: f64,
    date: bson::DateTime,
}

impl From<UserDoc> for User {
    fn from(d: UserDoc) -> Self {
        User {
            id: d.id,
            email: d.email,
            name: d.name,
        }
    }
}

impl From<FriendDoc> for Friend {
    fn from(d: FriendDoc) -> Self {
        Friend {
            id: d.friend_id,
            email: d.email,
            name: d.name,
            added_at: d.added_at.to_chrono(),
        }
    }
}

impl From<GroupDoc> for Group {
    fn from(d: GroupDoc) -> Self {
        Group {
            id: d.id,
            name: d.name,
            members: d.members,
            created_by: d.created_by,
            created_at: d.created_at.to_chrono(),
            expenses: Vec::new(),
        }
    }
}

impl From<ExpenseDoc> for Expense {
    fn from(d: ExpenseDoc) -> Self {
        Expense {
            id: d.id,
            description: d.description,
            amount: d.amount,
            paid_by: d.paid_by,
            split_between: d.split_between,
            date: d.date.to_chrono(),
        }
    }
}

impl From<SettlementDoc> for Settlement {
    fn from(d: SettlementDoc) -> Self {
        Settlement {
            id: d.id,
            group_id: d.group_id,
            from_user_id: d.from_user_id,
            to_user_id: d.to_user_id,
            amount: d.amount,
            date: d.date.to_chrono(),
        }
    }
}

fn friend_key(owner_id: &str, friend_id: &str) -> String {
    format!("{owner_id}:{friend_id}")
}

#[derive(Clone)]
pub struct MongoLedgerStore {
    db: Database,
}

impl MongoLedgerStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self::new(client.database(database)))
    }

    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn users(&self) -> Collection<UserDoc> {
        self.db.collection(USERS)
    }

    fn friends(&self) -> Collection<FriendDoc> {
        self.db.collection(FRIENDS)
    }

    fn groups(&self) -> Collection<GroupDoc> {
        self.db.collection(GROUPS)
    }

    fn expenses(&self) -> Collection<ExpenseDoc> {
        self.db.collection(EXPENSES)
    }

    fn settlements(&self) -> Collection<SettlementDoc> {
        self.db.collection(SETTLEMENTS)
    }

    /// One tick per change event in any of `collections`.
    async fn changes(&self, collections: &[&str]) -> Result<BoxStream<'static, Result<()>>> {
        let mut streams = Vec::with_capacity(collections.len());
        for name in collections {
            let changes = self.db.collection::<Document>(name).watch(None, None).await?;
            debug!(collection = *name, "Opened change stream");
            streams.push(
                changes
                    .map(|event| event.map(|_| ()).map_err(LedgerError::from))
                    .boxed(),
            );
        }
        Ok(stream::select_all(streams).boxed())
    }
}

/// Emits `fetch()` once up front and again after every change tick.
fn snapshots<T, F, Fut>(changes: BoxStream<'static, Result<()>>, fetch: F) -> SnapshotStream<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    stream::once(futures::future::ready(Ok(())))
        .chain(changes)
        .then(move |change| {
            let next = fetch();
            async move {
                change?;
                next.await
            }
        })
        .boxed()
}

#[async_trait]
impl LedgerStore for MongoLedgerStore {
    async fn watch_friends(&self, owner_id: &str) -> Result<SnapshotStream<Vec<Friend>>> {
        let changes = self.changes(&[FRIENDS]).await?;
        let store = self.clone();
        let owner_id = owner_id.to_string();
        Ok(snapshots(changes, move || {
            let store = store.clone();
            let owner_id = owner_id.clone();
            async move { store.fetch_friends(&owner_id).await }
        }))
    }

    async fn watch_groups(&self, member_id: &str) -> Result<SnapshotStream<Vec<Group>>> {
        // Expense writes re-emit the groups too, so nested expenses stay live.
        let changes = self.changes(&[GROUPS, EXPENSES]).await?;
        let store = self.clone();
        let member_id = member_id.to_string();
        Ok(snapshots(changes, move || {
            let store = store.clone();
            let member_id = member_id.clone();
            async move { store.fetch_groups(&member_id).await }
        }))
    }

    async fn watch_settlements(
        &self,
        group_ids: &[String],
    ) -> Result<SnapshotStream<Vec<Settlement>>> {
        check_in_filter(group_ids)?;
        let changes = self.changes(&[SETTLEMENTS]).await?;
        let store = self.clone();
        let group_ids = group_ids.to_vec();
        Ok(snapshots(changes, move || {
            let store = store.clone();
            let group_ids = group_ids.clone();
            async move { store.fetch_settlements(&group_ids).await }
        }))
    }

    async fn fetch_friends(&self, owner_id: &str) -> Result<Vec<Friend>> {
        let docs: Vec<FriendDoc> = self
            .friends()
            .find(doc! { "ownerId": owner_id }, None)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Friend::from).collect())
    }

    async fn fetch_friend(&self, owner_id: &str, friend_id: &str) -> Result<Option<Friend>> {
        let found = self
            .friends()
            .find_one(doc! { "_id": friend_key(owner_id, friend_id) }, None)
            .await?;
        Ok(found.map(Friend::from))
    }

    async fn fetch_groups(&self, member_id: &str) -> Result<Vec<Group>> {
        let docs: Vec<GroupDoc> = self
            .groups()
            .find(doc! { "members": member_id }, None)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Group::from).collect())
    }

    async fn fetch_expenses(&self, group_id: &str) -> Result<Vec<Expense>> {
        let docs: Vec<ExpenseDoc> = self
            .expenses()
            .find(doc! { "groupId": group_id }, None)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Expense::from).collect())
    }

    async fn fetch_settlements(&self, group_ids: &[String]) -> Result<Vec<Settlement>> {
        check_in_filter(group_ids)?;
        let docs: Vec<SettlementDoc> = self
            .settlements()
            .find(doc! { "groupId": { "$in": group_ids.to_vec() } }, None)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Settlement::from).collect())
    }

    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>> {
        let found = self.users().find_one(doc! { "_id": user_id }, None).await?;
        Ok(found.map(User::from))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let found = self.users().find_one(doc! { "email": email }, None).await?;
        Ok(found.map(User::from))
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        let user_doc = UserDoc {
            id: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
        };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.users()
            .replace_one(doc! { "_id": user.id.as_str() }, user_doc, options)
            .await?;
        Ok(())
    }

    async fn put_friend(&self, owner_id: &str, friend: &User) -> Result<Friend> {
        let friend_doc = FriendDoc {
            id: friend_key(owner_id, &friend.id),
            owner_id: owner_id.to_string(),
            friend_id: friend.id.clone(),
            email: friend.email.clone(),
            name: friend.name.clone(),
            added_at: bson::DateTime::now(),
        };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.friends()
            .replace_one(doc! { "_id": friend_doc.id.as_str() }, &friend_doc, options)
            .await?;
        Ok(friend_doc.into())
    }

    async fn delete_friend(&self, owner_id: &str, friend_id: &str) -> Result<()> {
        self.friends()
            .delete_one(doc! { "_id": friend_key(owner_id, friend_id) }, None)
            .await?;
        Ok(())
    }

    async fn create_group(&self, group: &NewGroup) -> Result<Group> {
        let group_doc = GroupDoc {
            id: ObjectId::new().to_hex(),
            name: group.name.clone(),
            members: group.members.clone(),
            created_by: group.created_by.clone(),
            created_at: bson::DateTime::now(),
        };
        self.groups().insert_one(&group_doc, None).await?;
        Ok(group_doc.into())
    }

    async fn add_group_members(&self, group_id: &str, member_ids: &[String]) -> Result<()> {
        let result = self
            .groups()
            .update_one(
                doc! { "_id": group_id },
                doc! { "$addToSet": { "members": { "$each": member_ids.to_vec() } } },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.groups()
            .delete_one(doc! { "_id": group_id }, None)
            .await?;
        Ok(())
    }

    async fn create_expense(&self, group_id: &str, expense: &NewExpense) -> Result<Expense> {
        let expense_doc = ExpenseDoc {
            id: ObjectId::new().to_hex(),
            group_id: group_id.to_string(),
            description: expense.description.clone(),
            amount: expense.amount,
            paid_by: expense.paid_by.clone(),
            split_between: expense.split_between.clone(),
            date: bson::DateTime::now(),
        };
        self.expenses().insert_one(&expense_doc, None).await?;
        Ok(expense_doc.into())
    }

    async fn update_expense_split(
        &self,
        group_id: &str,
        expense_id: &str,
        split_between: &[String],
    ) -> Result<()> {
        let result = self
            .expenses()
            .update_one(
                doc! { "_id": expense_id, "groupId": group_id },
                doc! { "$set": { "splitBetween": split_between.to_vec() } },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(LedgerError::ExpenseNotFound(expense_id.to_string()));
        }
        Ok(())
    }

    async fn delete_expense(&self, group_id: &str, expense_id: &str) -> Result<()> {
        self.expenses()
            .delete_one(doc! { "_id": expense_id, "groupId": group_id }, None)
            .await?;
        Ok(())
    }

    async fn create_settlement(&self, settlement: &NewSettlement) -> Result<Settlement> {
        let settlement_doc = SettlementDoc {
            id: ObjectId::new().to_hex(),
            group_id: settlement.group_id.clone(),
            from_user_id: settlement.from_user_id.clone(),
            to_user_id: settlement.to_user_id.clone(),
            amount: settlement.amount,
            date: bson::DateTime::now(),
        };
        self.settlements().insert_one(&settlement_doc, None).await?;
        Ok(settlement_doc.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expense_doc_uses_camel_case_fields() {
        let expense_doc = ExpenseDoc {
            id: "e1".to_string(),
            group_id: "g1".to_string(),
            description: "Dinner".to_string(),
            amount: 90.0,
            paid_by: "alice".to_string(),
            split_between: vec!["alice".to_string(), "bob".to_string()],
            date: bson::DateTime::from_millis(0),
        };
        let document = bson::to_document(&expense_doc).unwrap();
        assert_eq!(document.get_str("_id").unwrap(), "e1");
        assert_eq!(document.get_str("paidBy").unwrap(), "alice");
        assert_eq!(document.get_array("splitBetween").unwrap().len(), 2);

        let expense: Expense = bson::from_document::<ExpenseDoc>(document).unwrap().into();
        assert_eq!(expense.paid_by, "alice");
        assert_eq!(expense.date.timestamp(), 0);
    }

    #[test]
    fn test_friend_doc_maps_friend_id() {
        let friend: Friend = FriendDoc {
            id: friend_key("alice", "bob"),
            owner_id: "alice".to_string(),
            friend_id: "bob".to_string(),
            email: "bob@example.com".to_string(),
            name: "Bob".to_string(),
            added_at: bson::DateTime::from_millis(1_000),
        }
        .into();
        assert_eq!(friend.id, "bob");
        assert_eq!(friend.added_at.timestamp(), 1);
    }
}
