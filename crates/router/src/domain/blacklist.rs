//! Post-win user blacklisting.
//!
//! An agent can ask that a user it just won is kept away from it (or from
//! its whole account) for a while, optionally only on the site that was won.
//! Entries expire on their own; the store is consulted as a dynamic check
//! after the static pipeline.

use chrono::{DateTime, Utc};
use model::{
    agent::{AgentConfig, BlacklistKind, BlacklistScope},
    ids::AgentId,
    request::BidRequest,
};
use shared::timeout_map::TimeoutMap;

/// Who the entry shields, what user it names, and optionally where.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    scope: String,
    user: String,
    site: Option<String>,
}

#[derive(Default)]
pub struct BlacklistStore {
    entries: TimeoutMap<Key, ()>,
}

impl BlacklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records the winning agent's policy for the request's user.
    pub fn note_win(
        &mut self,
        config: &AgentConfig,
        agent: &AgentId,
        request: &BidRequest,
        host: &str,
        now: DateTime<Utc>,
    ) {
        if !config.blacklist.is_active() {
            return;
        }
        let Some(user) = user_of(request) else {
            return;
        };
        let site = match config.blacklist.kind {
            BlacklistKind::Off => return,
            BlacklistKind::User => None,
            BlacklistKind::UserOnSite => Some(host.to_owned()),
        };
        let duration = chrono::Duration::from_std(config.blacklist.duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.entries.insert(
            Key {
                scope: scope_of(config, agent),
                user: user.to_owned(),
                site,
            },
            (),
            now + duration,
        );
    }

    /// Is this agent currently barred from this request's user?
    pub fn matches(
        &self,
        config: &AgentConfig,
        agent: &AgentId,
        request: &BidRequest,
        host: &str,
    ) -> bool {
        if !config.blacklist.is_active() {
            return false;
        }
        let Some(user) = user_of(request) else {
            return false;
        };
        let scope = scope_of(config, agent);
        let everywhere = Key {
            scope: scope.clone(),
            user: user.to_owned(),
            site: None,
        };
        let here = Key {
            scope,
            user: user.to_owned(),
            site: Some(host.to_owned()),
        };
        self.entries.contains_key(&everywhere) || self.entries.contains_key(&here)
    }

    /// Drops entries whose hold has lapsed.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        let _ = self.entries.expire(now);
    }
}

fn user_of(request: &BidRequest) -> Option<&str> {
    request
        .user_ids
        .exchange_id
        .as_deref()
        .or(request.user_ids.provider_id.as_deref())
}

fn scope_of(config: &AgentConfig, agent: &AgentId) -> String {
    match config.blacklist.scope {
        BlacklistScope::Agent => agent.as_str().to_owned(),
        BlacklistScope::Account => config.account.parent().to_owned(),
    }
}
