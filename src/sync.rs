//! Live local snapshot of one signed-in user's ledger.
//!
//! Three independent listeners feed the snapshot: friends, groups (with a secondary
//! expense read per group) and settlements, one listener per chunk of at most
//! [`IN_QUERY_LIMIT`] group ids. Each listener replaces only its own slice. Failed
//! listeners log the error and empty their slice; commands propagate their errors.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use futures::future::try_join_all;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::activity::{recent_activity, ActivityEvent};
use crate::balance::{
    calculate_balances, calculate_pairwise_balance, total_balance, Balance, TotalBalance,
};
use crate::error::{LedgerError, Result};
use crate::exchange::{settle_up_summary, SettleUpSummary};
use crate::identity::{IdentityResolver, UserCache};
use crate::schemas::{
    Expense, Friend, Group, NewExpense, NewGroup, NewSettlement, Settlement, User, UserId,
};
use crate::store::{chunk_ids, LedgerStore, SnapshotStream, IN_QUERY_LIMIT};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LedgerState {
    pub friends: Vec<Friend>,
    pub groups: Vec<Group>,
    pub settlements: Vec<Settlement>,
    /// True until the first groups emission of a session.
    pub loading: bool,
    /// True while [`SyncCoordinator::refresh_data`] runs.
    pub refreshing: bool,
}

impl LedgerState {
    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == group_id)
    }
}

/// Replaces the settlements of one chunk, leaving every other chunk untouched.
pub fn merge_chunk(settlements: &mut Vec<Settlement>, chunk: &[String], fresh: Vec<Settlement>) {
    settlements.retain(|s| !chunk.contains(&s.group_id));
    settlements.extend(fresh);
}

/// Aborts the listener task when unsubscribed or dropped.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn spawn<F>(listener: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(listener),
        }
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner {
    generation: u64,
    user: Option<User>,
    state: LedgerState,
}

struct Shared {
    inner: RwLock<Inner>,
    revision: Arc<watch::Sender<u64>>,
}

impl Shared {
    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn notify(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Writes are dropped once the session that produced them has ended.
    fn apply(&self, generation: u64, f: impl FnOnce(&mut LedgerState)) -> bool {
        {
            let mut inner = self.write();
            if inner.generation != generation {
                return false;
            }
            f(&mut inner.state);
        }
        self.notify();
        true
    }
}

struct Session {
    group_ids: Arc<watch::Sender<Vec<String>>>,
    _listeners: Vec<SubscriptionHandle>,
}

async fn load_expenses(store: &dyn LedgerStore, groups: Vec<Group>) -> Result<Vec<Group>> {
    try_join_all(groups.into_iter().map(|mut group| async move {
        let mut expenses = store.fetch_expenses(&group.id).await?;
        expenses.sort_by(|a, b| b.date.cmp(&a.date));
        group.expenses = expenses;
        Ok::<_, LedgerError>(group)
    }))
    .await
}

fn group_ids(groups: &[Group]) -> Vec<String> {
    groups.iter().map(|g| g.id.clone()).collect()
}

/// Applies every snapshot until the stream fails or ends; a failure runs `reset`.
async fn follow<T>(
    label: &'static str,
    opened: Result<SnapshotStream<T>>,
    mut apply: impl FnMut(T),
    reset: impl FnOnce(),
) {
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            error!(subscription = label, error = %e, "Error opening subscription");
            reset();
            return;
        }
    };
    while let Some(next) = stream.next().await {
        match next {
            Ok(snapshot) => apply(snapshot),
            Err(e) => {
                error!(subscription = label, error = %e, "Error fetching {label}");
                reset();
                return;
            }
        }
    }
    debug!(subscription = label, "Subscription ended");
}

pub struct SyncCoordinator {
    store: Arc<dyn LedgerStore>,
    shared: Arc<Shared>,
    identity: IdentityResolver,
    session: Mutex<Option<Session>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        let (revision, _) = watch::channel(0);
        let revision = Arc::new(revision);
        let identity = IdentityResolver::new(store.clone(), UserCache::new(), revision.clone());
        Self {
            store,
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    generation: 0,
                    user: None,
                    state: LedgerState::default(),
                }),
                revision,
            }),
            identity,
            session: Mutex::new(None),
        }
    }

    /// Bumped on every local state change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn snapshot(&self) -> LedgerState {
        self.shared.read(|inner| inner.state.clone())
    }

    pub fn current_user(&self) -> Option<User> {
        self.shared.read(|inner| inner.user.clone())
    }

    /// Ends any running session, then starts the listeners for `user`.
    /// Must be called from within a tokio runtime.
    pub fn sign_in(&self, user: User) {
        self.sign_out();
        info!(user_id = %user.id, "Starting ledger sync");

        let generation = {
            let mut inner = self.shared.write();
            inner.generation += 1;
            inner.user = Some(user.clone());
            inner.state = LedgerState {
                loading: true,
                ..Default::default()
            };
            inner.generation
        };
        self.shared.notify();

        let (group_ids_tx, group_ids_rx) = watch::channel(Vec::new());
        let group_ids_tx = Arc::new(group_ids_tx);
        let listeners = vec![
            SubscriptionHandle::spawn(Self::friends_listener(
                self.store.clone(),
                self.shared.clone(),
                generation,
                user.id.clone(),
            )),
            SubscriptionHandle::spawn(Self::groups_listener(
                self.store.clone(),
                self.shared.clone(),
                self.identity.clone(),
                group_ids_tx.clone(),
                generation,
                user.id.clone(),
            )),
            SubscriptionHandle::spawn(Self::settlements_listener(
                self.store.clone(),
                self.shared.clone(),
                generation,
                group_ids_rx,
            )),
        ];
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            group_ids: group_ids_tx,
            _listeners: listeners,
        });
    }

    /// Tears down every listener and clears local state and the user cache.
    pub fn sign_out(&self) {
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_none() && self.current_user().is_none() {
            return;
        }
        drop(previous);
        {
            let mut inner = self.shared.write();
            inner.generation += 1;
            if let Some(user) = inner.user.take() {
                info!(user_id = %user.id, "Stopped ledger sync");
            }
            inner.state = LedgerState::default();
        }
        self.identity.cache().clear();
        self.shared.notify();
    }

    async fn friends_listener(
        store: Arc<dyn LedgerStore>,
        shared: Arc<Shared>,
        generation: u64,
        user_id: UserId,
    ) {
        let opened = store.watch_friends(&user_id).await;
        follow(
            "friends",
            opened,
            |friends| {
                shared.apply(generation, |s| s.friends = friends);
            },
            || {
                shared.apply(generation, |s| s.friends.clear());
            },
        )
        .await;
    }

    async fn groups_listener(
        store: Arc<dyn LedgerStore>,
        shared: Arc<Shared>,
        identity: IdentityResolver,
        group_ids_tx: Arc<watch::Sender<Vec<String>>>,
        generation: u64,
        user_id: UserId,
    ) {
        // Outer error ends the subscription; inner error only fails this emission.
        let reader = store.clone();
        let opened = store.watch_groups(&user_id).await.map(|groups| {
            groups
                .then(move |snapshot| {
                    let reader = reader.clone();
                    async move {
                        match snapshot {
                            Ok(groups) => Ok(load_expenses(reader.as_ref(), groups).await),
                            Err(e) => Err(e),
                        }
                    }
                })
                .boxed()
        });
        let clear = || {
            shared.apply(generation, |s| {
                s.groups.clear();
                s.loading = false;
            });
            group_ids_tx.send_replace(Vec::new());
        };
        follow(
            "groups",
            opened,
            |loaded: Result<Vec<Group>>| {
                let groups = match loaded {
                    Ok(groups) => groups,
                    Err(e) => {
                        error!(subscription = "groups", error = %e, "Error fetching expenses");
                        clear();
                        return;
                    }
                };
                let ids = group_ids(&groups);
                let friends = shared.read(|inner| inner.state.friends.clone());
                identity.prefetch_members(&user_id, &groups, &friends);
                let applied = shared.apply(generation, |s| {
                    s.groups = groups;
                    s.loading = false;
                });
                if applied {
                    group_ids_tx.send_if_modified(|current| {
                        let changed = *current != ids;
                        *current = ids;
                        changed
                    });
                }
            },
            &clear,
        )
        .await;
    }

    /// Reopens one listener per chunk whenever the tracked group ids change.
    async fn settlements_listener(
        store: Arc<dyn LedgerStore>,
        shared: Arc<Shared>,
        generation: u64,
        mut group_ids_rx: watch::Receiver<Vec<String>>,
    ) {
        let mut chunk_listeners: Vec<SubscriptionHandle> = Vec::new();
        loop {
            let ids = group_ids_rx.borrow_and_update().clone();
            for handle in chunk_listeners.drain(..) {
                handle.unsubscribe();
            }
            shared.apply(generation, |s| s.settlements.retain(|x| ids.contains(&x.group_id)));

            for chunk in chunk_ids(&ids) {
                debug!(groups = chunk.len(), "Subscribing to settlements chunk");
                chunk_listeners.push(SubscriptionHandle::spawn(Self::settlement_chunk_listener(
                    store.clone(),
                    shared.clone(),
                    generation,
                    chunk,
                )));
            }

            if group_ids_rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn settlement_chunk_listener(
        store: Arc<dyn LedgerStore>,
        shared: Arc<Shared>,
        generation: u64,
        chunk: Vec<String>,
    ) {
        let opened = store.watch_settlements(&chunk).await;
        follow(
            "settlements",
            opened,
            |fresh| {
                shared.apply(generation, |s| merge_chunk(&mut s.settlements, &chunk, fresh));
            },
            || {
                shared.apply(generation, |s| {
                    merge_chunk(&mut s.settlements, &chunk, Vec::new())
                });
            },
        )
        .await;
    }

    fn session_user(&self) -> Option<(User, u64)> {
        self.shared
            .read(|inner| inner.user.clone().map(|u| (u, inner.generation)))
    }

    fn require_user(&self) -> Result<User> {
        self.current_user().ok_or(LedgerError::NotSignedIn)
    }

    fn loaded_group(&self, group_id: &str) -> Result<Group> {
        self.shared
            .read(|inner| inner.state.group(group_id).cloned())
            .ok_or_else(|| LedgerError::GroupNotFound(group_id.to_string()))
    }

    /// One-shot reload of friends, groups with expenses and settlements.
    /// Failures are logged and leave whatever was already replaced.
    pub async fn refresh_data(&self) {
        let Some((user, generation)) = self.session_user() else {
            return;
        };
        self.shared.apply(generation, |s| s.refreshing = true);
        if let Err(e) = self.reload(&user.id, generation).await {
            error!(error = %e, "Error refreshing data");
        }
        self.shared.apply(generation, |s| s.refreshing = false);
    }

    async fn reload(&self, user_id: &str, generation: u64) -> Result<()> {
        let friends = self.store.fetch_friends(user_id).await?;
        self.shared.apply(generation, |s| s.friends = friends);

        let groups = self.store.fetch_groups(user_id).await?;
        let groups = load_expenses(self.store.as_ref(), groups).await?;
        let ids = group_ids(&groups);
        let friends = self.shared.read(|inner| inner.state.friends.clone());
        self.identity.prefetch_members(user_id, &groups, &friends);
        if !self.shared.apply(generation, |s| s.groups = groups) {
            return Ok(());
        }
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            session.group_ids.send_if_modified(|current| {
                let changed = *current != ids;
                current.clone_from(&ids);
                changed
            });
        }

        let mut settlements = Vec::new();
        for chunk in ids.chunks(IN_QUERY_LIMIT) {
            settlements.extend(self.store.fetch_settlements(chunk).await?);
        }
        self.shared.apply(generation, |s| s.settlements = settlements);
        Ok(())
    }

    pub async fn add_friend(&self, email: &str, name: Option<&str>) -> Result<Friend> {
        let user = self.require_user()?;
        let email = email.trim();
        let found = self
            .store
            .find_user_by_email(email)
            .await?
            .ok_or(LedgerError::UserNotFound)?;
        if found.id == user.id {
            return Err(LedgerError::CannotAddSelf);
        }
        if self.store.fetch_friend(&user.id, &found.id).await?.is_some() {
            return Err(LedgerError::AlreadyFriend);
        }

        let display_name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| (!found.name.is_empty()).then(|| found.name.clone()))
            .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string());
        let friend = self
            .store
            .put_friend(
                &user.id,
                &User {
                    name: display_name,
                    ..found
                },
            )
            .await?;
        info!(friend_id = %friend.id, "Friend added");
        Ok(friend)
    }

    pub async fn delete_friend(&self, friend_id: &str) -> Result<()> {
        let user = self.require_user()?;
        self.store.delete_friend(&user.id, friend_id).await
    }

    /// The signed-in user is always the first member.
    pub async fn create_group(&self, name: &str, member_ids: &[String]) -> Result<Group> {
        let user = self.require_user()?;
        let mut members = vec![user.id.clone()];
        for id in member_ids {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        self.store
            .create_group(&NewGroup {
                name: name.to_string(),
                members,
                created_by: user.id,
            })
            .await
    }

    pub async fn add_member_to_group(&self, group_id: &str, member_ids: &[String]) -> Result<()> {
        self.require_user()?;
        self.store
            .add_group_members(group_id, member_ids)
            .await
            .inspect_err(|e| error!(group_id, error = %e, "Error adding member to group"))
    }

    /// Deletes the group's expenses, then the group. Settlements are kept as history.
    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.require_user()?;
        let expenses = self.store.fetch_expenses(group_id).await?;
        try_join_all(
            expenses
                .iter()
                .map(|e| self.store.delete_expense(group_id, &e.id)),
        )
        .await?;
        self.store.delete_group(group_id).await
    }

    pub async fn add_expense(&self, group_id: &str, expense: NewExpense) -> Result<Expense> {
        self.require_user()?;
        let group = self.loaded_group(group_id)?;
        validate_expense(&group, &expense)?;
        let created = self
            .store
            .create_expense(group_id, &expense)
            .await
            .inspect_err(|e| error!(group_id, error = %e, "Error adding expense"))?;
        info!(group_id, expense_id = %created.id, "Expense added");
        Ok(created)
    }

    pub async fn update_expense_split(
        &self,
        group_id: &str,
        expense_id: &str,
        split_between: Vec<UserId>,
    ) -> Result<()> {
        self.require_user()?;
        let group = self.loaded_group(group_id)?;
        validate_split(&group, &split_between)?;
        self.store
            .update_expense_split(group_id, expense_id, &split_between)
            .await
            .inspect_err(|e| error!(group_id, expense_id, error = %e, "Error updating expense"))
    }

    pub async fn delete_expense(&self, group_id: &str, expense_id: &str) -> Result<()> {
        self.require_user()?;
        self.store.delete_expense(group_id, expense_id).await
    }

    pub async fn settle_up(
        &self,
        group_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        amount: f64,
    ) -> Result<Settlement> {
        self.require_user()?;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::InvalidSettlement(
                "amount must be positive".to_string(),
            ));
        }
        if from_user_id == to_user_id {
            return Err(LedgerError::InvalidSettlement(
                "cannot settle with yourself".to_string(),
            ));
        }
        self.store
            .create_settlement(&NewSettlement {
                group_id: group_id.to_string(),
                from_user_id: from_user_id.to_string(),
                to_user_id: to_user_id.to_string(),
                amount,
            })
            .await
            .inspect_err(|e| error!(group_id, error = %e, "Error settling up"))
    }

    /// Empty when the group is not loaded.
    pub fn calculate_balances(&self, group_id: &str) -> Balance {
        self.shared.read(|inner| {
            inner
                .state
                .group(group_id)
                .map(|g| calculate_balances(g, &inner.state.settlements))
                .unwrap_or_default()
        })
    }

    /// Zero when the group is not loaded.
    pub fn calculate_pairwise_balance(&self, group_id: &str, user_a: &str, user_b: &str) -> f64 {
        self.shared.read(|inner| {
            inner.state.group(group_id).map_or(0.0, |g| {
                calculate_pairwise_balance(g, &inner.state.settlements, user_a, user_b)
            })
        })
    }

    pub fn total_balance(&self, user_id: &str) -> TotalBalance {
        self.shared
            .read(|inner| total_balance(user_id, &inner.state.groups, &inner.state.settlements))
    }

    pub fn settle_up_summary(&self, group_id: &str, user_id: &str) -> Option<SettleUpSummary> {
        self.shared.read(|inner| {
            inner
                .state
                .group(group_id)
                .map(|g| settle_up_summary(g, &inner.state.settlements, user_id))
        })
    }

    pub fn recent_activity(&self) -> Vec<ActivityEvent> {
        self.shared
            .read(|inner| recent_activity(&inner.state.groups, &inner.state.settlements))
    }

    pub fn user_name(&self, user_id: &str) -> String {
        self.shared.read(|inner| {
            self.identity
                .user_name(user_id, inner.user.as_ref(), &inner.state.friends)
        })
    }

    pub fn user_email(&self, user_id: &str) -> String {
        self.shared.read(|inner| {
            self.identity
                .user_email(user_id, inner.user.as_ref(), &inner.state.friends)
        })
    }
}

fn validate_split(group: &Group, split_between: &[UserId]) -> Result<()> {
    if split_between.is_empty() {
        return Err(LedgerError::InvalidExpense(
            "split set must not be empty".to_string(),
        ));
    }
    if let Some(outsider) = split_between.iter().find(|m| !group.is_member(m)) {
        return Err(LedgerError::InvalidExpense(format!(
            "{outsider} is not a member of the group"
        )));
    }
    Ok(())
}

fn validate_expense(group: &Group, expense: &NewExpense) -> Result<()> {
    if !expense.amount.is_finite() || expense.amount <= 0.0 {
        return Err(LedgerError::InvalidExpense(
            "amount must be positive".to_string(),
        ));
    }
    if !group.is_member(&expense.paid_by) {
        return Err(LedgerError::InvalidExpense(format!(
            "{} is not a member of the group",
            expense.paid_by
        )));
    }
    validate_split(group, &expense.split_between)
}
