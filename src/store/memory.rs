//! In-process ledger store.
//!
//! Every write bumps a single revision counter and every open subscription re-runs its
//! query on each bump. Timestamps come from a logical clock that advances one second per
//! created record, so ordering is deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use super::{check_in_filter, LedgerStore, SnapshotStream};
use crate::error::{LedgerError, Result};
use crate::schemas::{
    Expense, Friend, Group, NewExpense, NewGroup, NewSettlement, Settlement, Timestamp, User,
};

// 2024-01-01T00:00:00Z
const CLOCK_START: i64 = 1_704_067_200;

#[derive(Default)]
struct Tables {
    next_id: u64,
    users: HashMap<String, User>,
    friends: Vec<(String, Friend)>,
    groups: Vec<Group>,
    expenses: Vec<(String, Expense)>,
    settlements: Vec<Settlement>,
}

impl Tables {
    fn next(&mut self, prefix: &str) -> (String, Timestamp) {
        self.next_id += 1;
        let at = Utc
            .timestamp_opt(CLOCK_START + self.next_id as i64, 0)
            .single()
            .unwrap_or_default();
        (format!("{prefix}-{}", self.next_id), at)
    }

    fn friends_of(&self, owner_id: &str) -> Vec<Friend> {
        self.friends
            .iter()
            .filter(|(owner, _)| owner == owner_id)
            .map(|(_, friend)| friend.clone())
            .collect()
    }

    fn groups_of(&self, member_id: &str) -> Vec<Group> {
        self.groups
            .iter()
            .filter(|g| g.is_member(member_id))
            .cloned()
            .collect()
    }

    fn settlements_in(&self, group_ids: &[String]) -> Vec<Settlement> {
        self.settlements
            .iter()
            .filter(|s| group_ids.contains(&s.group_id))
            .cloned()
            .collect()
    }
}

/// Injected failures. Only tests set them.
#[derive(Default)]
struct Faults {
    offline: bool,
    expense_reads: usize,
    settlement_groups: Vec<String>,
}

struct Inner {
    tables: Mutex<Tables>,
    revision: watch::Sender<u64>,
    faults: Mutex<Faults>,
    #[cfg(test)]
    settlement_watches: Mutex<Vec<Vec<String>>>,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn online(&self) -> Result<()> {
        if self.faults().offline {
            return Err(LedgerError::Store("store offline".to_string()));
        }
        Ok(())
    }

    fn read_expenses(&self) -> Result<()> {
        let mut faults = self.faults();
        if faults.expense_reads > 0 {
            faults.expense_reads -= 1;
            return Err(LedgerError::Store("expense read failed".to_string()));
        }
        Ok(())
    }

    fn read_settlements(&self, group_ids: &[String]) -> Result<()> {
        if group_ids
            .iter()
            .any(|id| self.faults().settlement_groups.contains(id))
        {
            return Err(LedgerError::Store("settlement subscription failed".to_string()));
        }
        Ok(())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

#[derive(Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                revision,
                faults: Mutex::new(Faults::default()),
                #[cfg(test)]
                settlement_watches: Mutex::new(Vec::new()),
            }),
        }
    }

    /// While offline every call fails and open subscriptions end with an error on the
    /// next revision.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.inner.faults().offline = offline;
        self.inner.bump();
    }

    /// The next `count` expense reads fail. Subscriptions are not affected.
    #[cfg(test)]
    pub fn fail_expense_reads(&self, count: usize) {
        self.inner.faults().expense_reads = count;
    }

    /// Settlement subscriptions covering `group_id` fail from their next emission on.
    #[cfg(test)]
    pub fn fail_settlements_for(&self, group_id: &str) {
        self.inner
            .faults()
            .settlement_groups
            .push(group_id.to_string());
        self.inner.bump();
    }

    /// Group id sets of every settlement subscription opened so far.
    #[cfg(test)]
    pub fn settlement_watches(&self) -> Vec<Vec<String>> {
        self.inner
            .settlement_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inserts a settlement with an explicit id and timestamp.
    #[cfg(test)]
    pub fn insert_settlement(&self, settlement: Settlement) {
        self.inner.tables().settlements.push(settlement);
        self.inner.bump();
    }

    fn snapshots<T, F>(&self, query: F) -> SnapshotStream<T>
    where
        T: Send + 'static,
        F: Fn(&Inner) -> Result<T> + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        let query = Arc::new(query);
        let rx = inner.revision.subscribe();
        stream::unfold(Some((rx, true)), move |state| {
            let inner = inner.clone();
            let query = query.clone();
            async move {
                let (mut rx, first) = state?;
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                match inner.online().and_then(|()| query(inner.as_ref())) {
                    Ok(snapshot) => Some((Ok(snapshot), Some((rx, false)))),
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn watch_friends(&self, owner_id: &str) -> Result<SnapshotStream<Vec<Friend>>> {
        self.inner.online()?;
        let owner_id = owner_id.to_string();
        Ok(self.snapshots(move |inner| Ok(inner.tables().friends_of(&owner_id))))
    }

    async fn watch_groups(&self, member_id: &str) -> Result<SnapshotStream<Vec<Group>>> {
        self.inner.online()?;
        let member_id = member_id.to_string();
        Ok(self.snapshots(move |inner| Ok(inner.tables().groups_of(&member_id))))
    }

    async fn watch_settlements(
        &self,
        group_ids: &[String],
    ) -> Result<SnapshotStream<Vec<Settlement>>> {
        check_in_filter(group_ids)?;
        self.inner.online()?;
        #[cfg(test)]
        self.inner
            .settlement_watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group_ids.to_vec());
        let group_ids = group_ids.to_vec();
        Ok(self.snapshots(move |inner| {
            inner.read_settlements(&group_ids)?;
            Ok(inner.tables().settlements_in(&group_ids))
        }))
    }

    async fn fetch_friends(&self, owner_id: &str) -> Result<Vec<Friend>> {
        self.inner.online()?;
        Ok(self.inner.tables().friends_of(owner_id))
    }

    async fn fetch_friend(&self, owner_id: &str, friend_id: &str) -> Result<Option<Friend>> {
        self.inner.online()?;
        Ok(self
            .inner
            .tables()
            .friends
            .iter()
            .find(|(owner, f)| owner == owner_id && f.id == friend_id)
            .map(|(_, f)| f.clone()))
    }

    async fn fetch_groups(&self, member_id: &str) -> Result<Vec<Group>> {
        self.inner.online()?;
        Ok(self.inner.tables().groups_of(member_id))
    }

    async fn fetch_expenses(&self, group_id: &str) -> Result<Vec<Expense>> {
        self.inner.online()?;
        self.inner.read_expenses()?;
        Ok(self
            .inner
            .tables()
            .expenses
            .iter()
            .filter(|(g, _)| g == group_id)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn fetch_settlements(&self, group_ids: &[String]) -> Result<Vec<Settlement>> {
        check_in_filter(group_ids)?;
        self.inner.online()?;
        Ok(self.inner.tables().settlements_in(group_ids))
    }

    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>> {
        self.inner.online()?;
        Ok(self.inner.tables().users.get(user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.inner.online()?;
        Ok(self
            .inner
            .tables()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        self.inner.online()?;
        self.inner
            .tables()
            .users
            .insert(user.id.clone(), user.clone());
        self.inner.bump();
        Ok(())
    }

    async fn put_friend(&self, owner_id: &str, friend: &User) -> Result<Friend> {
        self.inner.online()?;
        let created = {
            let mut tables = self.inner.tables();
            let (_, added_at) = tables.next("friend");
            let created = Friend {
                id: friend.id.clone(),
                email: friend.email.clone(),
                name: friend.name.clone(),
                added_at,
            };
            tables
                .friends
                .retain(|(owner, f)| !(owner == owner_id && f.id == friend.id));
            tables.friends.push((owner_id.to_string(), created.clone()));
            created
        };
        self.inner.bump();
        Ok(created)
    }

    async fn delete_friend(&self, owner_id: &str, friend_id: &str) -> Result<()> {
        self.inner.online()?;
        self.inner
            .tables()
            .friends
            .retain(|(owner, f)| !(owner == owner_id && f.id == friend_id));
        self.inner.bump();
        Ok(())
    }

    async fn create_group(&self, group: &NewGroup) -> Result<Group> {
        self.inner.online()?;
        let created = {
            let mut tables = self.inner.tables();
            let (id, created_at) = tables.next("group");
            let created = Group {
                id,
                name: group.name.clone(),
                members: group.members.clone(),
                created_by: group.created_by.clone(),
                created_at,
                expenses: Vec::new(),
            };
            tables.groups.push(created.clone());
            created
        };
        self.inner.bump();
        Ok(created)
    }

    async fn add_group_members(&self, group_id: &str, member_ids: &[String]) -> Result<()> {
        self.inner.online()?;
        {
            let mut tables = self.inner.tables();
            let group = tables
                .groups
                .iter_mut()
                .find(|g| g.id == group_id)
                .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))?;
            for id in member_ids {
                if !group.is_member(id) {
                    group.members.push(id.clone());
                }
            }
        }
        self.inner.bump();
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.inner.online()?;
        self.inner.tables().groups.retain(|g| g.id != group_id);
        self.inner.bump();
        Ok(())
    }

    async fn create_expense(&self, group_id: &str, expense: &NewExpense) -> Result<Expense> {
        self.inner.online()?;
        let created = {
            let mut tables = self.inner.tables();
            let (id, date) = tables.next("expense");
            let created = Expense {
                id,
                description: expense.description.clone(),
                amount: expense.amount,
                paid_by: expense.paid_by.clone(),
                split_between: expense.split_between.clone(),
                date,
            };
            tables
                .expenses
                .push((group_id.to_string(), created.clone()));
            created
        };
        self.inner.bump();
        Ok(created)
    }

    async fn update_expense_split(
        &self,
        group_id: &str,
        expense_id: &str,
        split_between: &[String],
    ) -> Result<()> {
        self.inner.online()?;
        {
            let mut tables = self.inner.tables();
            let (_, expense) = tables
                .expenses
                .iter_mut()
                .find(|(g, e)| g == group_id && e.id == expense_id)
                .ok_or_else(|| LedgerError::ExpenseNotFound(expense_id.to_string()))?;
            expense.split_between = split_between.to_vec();
        }
        self.inner.bump();
        Ok(())
    }

    async fn delete_expense(&self, group_id: &str, expense_id: &str) -> Result<()> {
        self.inner.online()?;
        self.inner
            .tables()
            .expenses
            .retain(|(g, e)| !(g == group_id && e.id == expense_id));
        self.inner.bump();
        Ok(())
    }

    async fn create_settlement(&self, settlement: &NewSettlement) -> Result<Settlement> {
        self.inner.online()?;
        let created = {
            let mut tables = self.inner.tables();
            let (id, date) = tables.next("settlement");
            let created = Settlement {
                id,
                group_id: settlement.group_id.clone(),
                from_user_id: settlement.from_user_id.clone(),
                to_user_id: settlement.to_user_id.clone(),
                amount: settlement.amount,
                date,
            };
            tables.settlements.push(created.clone());
            created
        };
        self.inner.bump();
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User {
            id: "alice".to_string(),
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_watch_emits_initial_snapshot_then_changes() {
        let store = MemoryLedgerStore::new();
        let mut groups = store.watch_groups("alice").await.unwrap();
        assert!(groups.next().await.unwrap().unwrap().is_empty());

        store
            .create_group(&NewGroup {
                name: "Trip".to_string(),
                members: vec!["alice".to_string(), "bob".to_string()],
                created_by: "alice".to_string(),
            })
            .await
            .unwrap();
        let snapshot = groups.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "Trip");
    }

    #[tokio::test]
    async fn test_offline_store_fails_calls_and_ends_streams() {
        let store = MemoryLedgerStore::new();
        store.put_user(&alice()).await.unwrap();
        let mut friends = store.watch_friends("alice").await.unwrap();
        assert!(friends.next().await.unwrap().is_ok());

        store.set_offline(true);
        assert!(friends.next().await.unwrap().is_err());
        assert!(friends.next().await.is_none());
        assert!(store.fetch_user("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_settlement_queries_respect_in_limit() {
        let store = MemoryLedgerStore::new();
        let ids: Vec<String> = (0..11).map(|i| format!("g{i}")).collect();
        assert!(store.fetch_settlements(&ids).await.is_err());
        assert!(store.watch_settlements(&ids[..10]).await.is_ok());
        assert_eq!(store.settlement_watches().len(), 1);
    }

    #[tokio::test]
    async fn test_add_group_members_is_a_set_union() {
        let store = MemoryLedgerStore::new();
        let group = store
            .create_group(&NewGroup {
                name: "Flat".to_string(),
                members: vec!["alice".to_string()],
                created_by: "alice".to_string(),
            })
            .await
            .unwrap();
        store
            .add_group_members(&group.id, &["bob".to_string(), "alice".to_string()])
            .await
            .unwrap();
        let groups = store.fetch_groups("bob").await.unwrap();
        assert_eq!(groups[0].members, vec!["alice", "bob"]);
    }
}
