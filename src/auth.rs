//! Tool authorization gate
//!
//! Decisions are made fresh on every call from the directory's current
//! view of the user's groups, so a revoked membership denies the very
//! next call.

use crate::tools::{ServerPolicy, ToolCatalog};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Source of truth for group membership
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn groups_of(&self, user: &str) -> BTreeSet<String>;
}

/// Group directory held in memory, loaded from configuration
#[derive(Default)]
pub struct StaticGroupDirectory {
    groups: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl StaticGroupDirectory {
    pub fn new(groups: HashMap<String, Vec<String>>) -> Self {
        Self {
            groups: RwLock::new(
                groups
                    .into_iter()
                    .map(|(user, groups)| (user, groups.into_iter().collect()))
                    .collect(),
            ),
        }
    }

    pub fn grant(&self, user: &str, group: &str) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn revoke(&self, user: &str, group: &str) {
        if let Some(groups) = self
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(user)
        {
            groups.remove(group);
        }
    }
}

#[async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn groups_of(&self, user: &str) -> BTreeSet<String> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    UnknownServer,
    MissingGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Pure access rule: membership in any required group grants access, and
/// a server with no required groups is open. Exclusivity plays no part
/// here; it is enforced when tools are selected.
pub fn decide(user_groups: &BTreeSet<String>, policy: &ServerPolicy) -> bool {
    policy.required_groups.is_empty() || !policy.required_groups.is_disjoint(user_groups)
}

pub struct ToolAuthorizer {
    catalog: Arc<ToolCatalog>,
    directory: Arc<dyn GroupDirectory>,
}

impl ToolAuthorizer {
    pub fn new(catalog: Arc<ToolCatalog>, directory: Arc<dyn GroupDirectory>) -> Self {
        Self { catalog, directory }
    }

    pub async fn authorize(&self, user: &str, server: &str) -> Decision {
        let Some(server) = self.catalog.get(server) else {
            return Decision::Deny(Denial::UnknownServer);
        };
        let groups = self.directory.groups_of(user).await;
        if decide(&groups, server.policy()) {
            Decision::Allow
        } else {
            Decision::Deny(Denial::MissingGroup)
        }
    }

    /// Servers `user` may currently call
    pub async fn visible_servers(&self, user: &str) -> Vec<String> {
        let groups = self.directory.groups_of(user).await;
        self.catalog
            .server_names()
            .filter(|name| {
                self.catalog
                    .get(name)
                    .is_some_and(|server| decide(&groups, server.policy()))
            })
            .map(str::to_string)
            .collect()
    }
}
