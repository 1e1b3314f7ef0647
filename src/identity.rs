//! Display names and emails for user ids.
//!
//! Lookups go current user, then friends, then the [`UserCache`]. A miss in
//! [`IdentityResolver::user_name`] starts a background profile fetch and answers
//! `"Unknown"` until the cache is filled.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::schemas::{Friend, Group, User, UserId};
use crate::store::LedgerStore;

pub const UNKNOWN_USER: &str = "Unknown";
pub const CURRENT_USER_LABEL: &str = "You";

/// Profiles of non-friends, keyed by user id. A fresh fetch overwrites the entry.
#[derive(Clone, Default)]
pub struct UserCache {
    users: Arc<RwLock<HashMap<UserId, User>>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn has(&self, user_id: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(user_id)
    }

    pub fn put(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id.clone(), user);
    }

    pub fn evict(&self, user_id: &str) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }

    pub fn clear(&self) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates
        .iter()
        .copied()
        .find(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_USER)
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn LedgerStore>,
    cache: UserCache,
    revision: Arc<watch::Sender<u64>>,
}

impl IdentityResolver {
    /// `revision` is bumped whenever a background fetch fills the cache.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: UserCache,
        revision: Arc<watch::Sender<u64>>,
    ) -> Self {
        Self {
            store,
            cache,
            revision,
        }
    }

    pub fn cache(&self) -> &UserCache {
        &self.cache
    }

    pub fn user_name(&self, user_id: &str, current: Option<&User>, friends: &[Friend]) -> String {
        if user_id.is_empty() {
            return UNKNOWN_USER.to_string();
        }
        if current.is_some_and(|u| u.id == user_id) {
            return CURRENT_USER_LABEL.to_string();
        }
        if let Some(friend) = friends.iter().find(|f| f.id == user_id) {
            return first_non_empty(&[friend.name.as_str(), friend.email.as_str()]).to_string();
        }
        if let Some(user) = self.cache.get(user_id) {
            return first_non_empty(&[user.name.as_str(), user.email.as_str()]).to_string();
        }
        self.fetch_in_background(vec![user_id.to_string()]);
        UNKNOWN_USER.to_string()
    }

    /// Same lookup order as [`Self::user_name`], but never fetches.
    pub fn user_email(&self, user_id: &str, current: Option<&User>, friends: &[Friend]) -> String {
        if let Some(user) = current.filter(|u| u.id == user_id) {
            return user.email.clone();
        }
        if let Some(friend) = friends.iter().find(|f| f.id == user_id) {
            return first_non_empty(&[friend.email.as_str()]).to_string();
        }
        if let Some(user) = self.cache.get(user_id) {
            return first_non_empty(&[user.email.as_str()]).to_string();
        }
        UNKNOWN_USER.to_string()
    }

    /// Fetches every group member that is neither the current user, a friend, nor cached.
    pub fn prefetch_members(
        &self,
        current_id: &str,
        groups: &[Group],
        friends: &[Friend],
    ) -> Option<JoinHandle<()>> {
        let missing: BTreeSet<UserId> = groups
            .iter()
            .flat_map(|g| g.members.iter())
            .filter(|id| *id != current_id)
            .filter(|id| !friends.iter().any(|f| &f.id == *id))
            .filter(|id| !self.cache.has(id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return None;
        }
        self.fetch_in_background(missing.into_iter().collect())
    }

    fn fetch_in_background(&self, user_ids: Vec<UserId>) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime available, skipping profile fetch");
            return None;
        };
        let store = self.store.clone();
        let cache = self.cache.clone();
        let revision = self.revision.clone();
        Some(runtime.spawn(async move {
            let fetches = user_ids.iter().map(|id| store.fetch_user(id));
            let mut changed = false;
            for (id, result) in user_ids.iter().zip(join_all(fetches).await) {
                match result {
                    Ok(Some(user)) => {
                        cache.put(user);
                        changed = true;
                    }
                    Ok(None) => {
                        debug!(user_id = %id, "No profile for user");
                        if cache.has(id) {
                            cache.evict(id);
                            changed = true;
                        }
                    }
                    Err(e) => error!(user_id = %id, error = %e, "Error fetching user"),
                }
            }
            if changed {
                revision.send_modify(|r| *r += 1);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::tests::group;
    use crate::store::memory::MemoryLedgerStore;
    use chrono::Utc;

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: name.to_string(),
        }
    }

    fn friend(id: &str, name: &str) -> Friend {
        Friend {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: name.to_string(),
            added_at: Utc::now(),
        }
    }

    async fn resolver_with(users: &[User]) -> IdentityResolver {
        let store = MemoryLedgerStore::new();
        for u in users {
            store.put_user(u).await.unwrap();
        }
        let (revision, _) = watch::channel(0);
        IdentityResolver::new(Arc::new(store), UserCache::new(), Arc::new(revision))
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let resolver = resolver_with(&[]).await;
        let me = user("me", "Me");
        let friends = vec![friend("bob", "Bobby"), friend("nameless", "")];
        resolver.cache().put(user("carol", "Carol"));

        assert_eq!(resolver.user_name("me", Some(&me), &friends), "You");
        assert_eq!(resolver.user_name("bob", Some(&me), &friends), "Bobby");
        assert_eq!(
            resolver.user_name("nameless", Some(&me), &friends),
            "nameless@example.com"
        );
        assert_eq!(resolver.user_name("carol", Some(&me), &friends), "Carol");
        assert_eq!(resolver.user_name("", Some(&me), &friends), "Unknown");

        assert_eq!(resolver.user_email("me", Some(&me), &friends), "me@example.com");
        assert_eq!(resolver.user_email("carol", Some(&me), &friends), "carol@example.com");
    }

    #[tokio::test]
    async fn test_unknown_name_upgrades_after_background_fetch() {
        let resolver = resolver_with(&[user("dave", "Dave")]).await;
        assert_eq!(resolver.user_name("dave", None, &[]), "Unknown");

        for _ in 0..200 {
            if resolver.cache().has("dave") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(resolver.user_name("dave", None, &[]), "Dave");
    }

    #[tokio::test]
    async fn test_email_lookup_never_fetches() {
        let resolver = resolver_with(&[user("erin", "Erin")]).await;
        assert_eq!(resolver.user_email("erin", None, &[]), "Unknown");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!resolver.cache().has("erin"));
    }

    #[tokio::test]
    async fn test_prefetch_only_fetches_missing_members() {
        let resolver = resolver_with(&[user("x", "X"), user("y", "Y")]).await;
        resolver.cache().put(user("y", "Cached Y"));
        let groups = vec![group("g", &["me", "bob", "x", "y"], vec![])];
        let friends = vec![friend("bob", "Bob")];

        resolver
            .prefetch_members("me", &groups, &friends)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(resolver.cache().get("x").unwrap().name, "X");
        assert_eq!(resolver.cache().get("y").unwrap().name, "Cached Y");
        assert!(!resolver.cache().has("bob"));
        assert!(resolver.prefetch_members("me", &groups, &friends).is_none());
    }

    #[tokio::test]
    async fn test_fetch_miss_evicts_stale_profile() {
        let resolver = resolver_with(&[]).await;
        resolver.cache().put(user("z", "Z"));
        resolver.cache().put(user("z", "Zed"));
        assert_eq!(resolver.cache().get("z").unwrap().name, "Zed");

        resolver
            .fetch_in_background(vec!["z".to_string()])
            .unwrap()
            .await
            .unwrap();
        assert!(!resolver.cache().has("z"));
        assert_eq!(resolver.user_name("z", None, &[]), "Unknown");
    }
}
