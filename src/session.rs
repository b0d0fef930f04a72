//! Process-local conversation state.
//!
//! Scope records map a user id to the grant topic their questions are
//! interpreted against, with a lazy 30-minute TTL. The deny set holds
//! users flagged abusive and only ever grows. Both are volatile: losing
//! them on restart is acceptable because scope is a conversational
//! convenience, not durable state. DashMap keeps per-user operations
//! safe without a global lock; concurrent writes for the same user are
//! last-write-wins, which is fine for a single human sender.

use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use crate::grants::GrantKey;

pub const DEFAULT_SCOPE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy)]
struct ScopeRecord {
    grant: GrantKey,
    set_at: Instant,
}

pub struct SessionStore {
    ttl: Duration,
    scopes: DashMap<String, ScopeRecord>,
    denied: DashSet<String>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            scopes: DashMap::new(),
            denied: DashSet::new(),
        }
    }

    /// Upsert the user's scope with the current timestamp.
    pub fn set_scope(&self, user_id: &str, grant: GrantKey) {
        self.scopes.insert(
            user_id.to_string(),
            ScopeRecord {
                grant,
                set_at: Instant::now(),
            },
        );
    }

    /// Current scope if within TTL. A stale record is removed on read and
    /// treated as absent.
    pub fn scope(&self, user_id: &str) -> Option<GrantKey> {
        let expired = match self.scopes.get(user_id) {
            Some(record) => {
                if record.set_at.elapsed() <= self.ttl {
                    return Some(record.grant);
                }
                true
            }
            None => false,
        };
        if expired {
            self.scopes.remove(user_id);
        }
        None
    }

    pub fn clear_scope(&self, user_id: &str) {
        self.scopes.remove(user_id);
    }

    pub fn deny(&self, user_id: &str) {
        self.denied.insert(user_id.to_string());
    }

    pub fn is_denied(&self, user_id: &str) -> bool {
        self.denied.contains(user_id)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SCOPE_TTL)
    }
}
