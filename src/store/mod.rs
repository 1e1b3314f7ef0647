//! Ledger store collaborator.
//!
//! The sync layer only talks to storage through [`LedgerStore`]. Subscriptions come back
//! as [`SnapshotStream`]s: every item is the full current result of the query, the first
//! item is emitted right after subscribing, and dropping the stream unsubscribes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{LedgerError, Result};
use crate::schemas::{
    Expense, Friend, Group, NewExpense, NewGroup, NewSettlement, Settlement, User,
};

pub mod memory;
pub mod mongo;

/// Maximum number of values accepted by an `in` filter (settlements by group id).
pub const IN_QUERY_LIMIT: usize = 10;

pub type SnapshotStream<T> = BoxStream<'static, Result<T>>;

/// Splits ids into consecutive chunks that each fit into one `in` filter.
pub fn chunk_ids(ids: &[String]) -> Vec<Vec<String>> {
    ids.chunks(IN_QUERY_LIMIT).map(<[String]>::to_vec).collect()
}

pub(crate) fn check_in_filter(ids: &[String]) -> Result<()> {
    if ids.len() > IN_QUERY_LIMIT {
        return Err(LedgerError::FilterTooLarge {
            limit: IN_QUERY_LIMIT,
            actual: ids.len(),
        });
    }
    Ok(())
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn watch_friends(&self, owner_id: &str) -> Result<SnapshotStream<Vec<Friend>>>;
    /// Groups containing `member_id`, emitted without their expenses.
    async fn watch_groups(&self, member_id: &str) -> Result<SnapshotStream<Vec<Group>>>;
    /// At most [`IN_QUERY_LIMIT`] group ids.
    async fn watch_settlements(
        &self,
        group_ids: &[String],
    ) -> Result<SnapshotStream<Vec<Settlement>>>;

    async fn fetch_friends(&self, owner_id: &str) -> Result<Vec<Friend>>;
    async fn fetch_friend(&self, owner_id: &str, friend_id: &str) -> Result<Option<Friend>>;
    async fn fetch_groups(&self, member_id: &str) -> Result<Vec<Group>>;
    async fn fetch_expenses(&self, group_id: &str) -> Result<Vec<Expense>>;
    /// At most [`IN_QUERY_LIMIT`] group ids.
    async fn fetch_settlements(&self, group_ids: &[String]) -> Result<Vec<Settlement>>;
    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn put_user(&self, user: &User) -> Result<()>;
    /// `added_at` is assigned by the store.
    async fn put_friend(&self, owner_id: &str, friend: &User) -> Result<Friend>;
    async fn delete_friend(&self, owner_id: &str, friend_id: &str) -> Result<()>;
    async fn create_group(&self, group: &NewGroup) -> Result<Group>;
    /// Set union: ids already in the group are not added twice.
    async fn add_group_members(&self, group_id: &str, member_ids: &[String]) -> Result<()>;
    async fn delete_group(&self, group_id: &str) -> Result<()>;
    async fn create_expense(&self, group_id: &str, expense: &NewExpense) -> Result<Expense>;
    async fn update_expense_split(
        &self,
        group_id: &str,
        expense_id: &str,
        split_between: &[String],
    ) -> Result<()>;
    async fn delete_expense(&self, group_id: &str, expense_id: &str) -> Result<()>;
    async fn create_settlement(&self, settlement: &NewSettlement) -> Result<Settlement>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("g{i}")).collect()
    }

    #[test]
    fn test_chunk_ids_splits_by_in_limit() {
        let chunks = chunk_ids(&ids(25));
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(chunks[1][0], "g10");
        assert!(chunk_ids(&[]).is_empty());
    }

    #[test]
    fn test_check_in_filter() {
        assert!(check_in_filter(&ids(10)).is_ok());
        assert!(matches!(
            check_in_filter(&ids(11)),
            Err(LedgerError::FilterTooLarge { limit: 10, actual: 11 })
        ));
    }
}
