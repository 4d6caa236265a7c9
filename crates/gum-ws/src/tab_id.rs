//! Tab identity and role resolution.
//!
//! The tab id doubles as dashboard id, server path segment and bus name
//! suffix. A design tab mints its own; a preview tab opened from a design
//! tab inherits it through the `parentTabId` query parameter, which is what
//! makes the two tabs share one server connection.

use crate::context::Role;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Session storage key for a design tab's identity.
pub const DESIGN_TAB_KEY: &str = "gum_design_tab_id";
/// Session storage key for a preview tab's identity.
pub const PREVIEW_TAB_KEY: &str = "gum_preview_tab_id";
/// Query parameter linking a preview tab to its design tab.
pub const PARENT_TAB_PARAM: &str = "parentTabId";

const MIN_TAB_ID_LEN: usize = 5;

/// Per-tab key/value storage that survives reloads of the same tab.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory session storage.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

/// Outcome of role selection for one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDecision {
    pub role: Role,
    pub tab_id: String,
    pub parent_id: Option<String>,
}

fn storage_key(is_design: bool) -> &'static str {
    if is_design {
        DESIGN_TAB_KEY
    } else {
        PREVIEW_TAB_KEY
    }
}

fn is_valid_token(token: &str) -> bool {
    token.len() >= MIN_TAB_ID_LEN
}

/// Extract a usable `parentTabId` from a query string (leading `?` optional).
pub fn parent_tab_id(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .find(|(k, _)| k == PARENT_TAB_PARAM)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| is_valid_token(v))
}

/// Resolve this tab's identity, persisting it on first use.
pub fn resolve_tab_id(is_design: bool, query: &str, session: &dyn SessionStore) -> String {
    let key = storage_key(is_design);

    if let Some(existing) = session.get(key).filter(|t| is_valid_token(t)) {
        return existing;
    }

    if !is_design {
        if let Some(parent) = parent_tab_id(query) {
            debug!(tab_id = %parent, "Adopting parent tab id");
            session.set(key, &parent);
            return parent;
        }
    }

    let fresh = Uuid::new_v4().to_string();
    debug!(tab_id = %fresh, is_design, "Generated tab id");
    session.set(key, &fresh);
    fresh
}

/// Decide whether this tab leads or follows, and under which id.
///
/// A design tab always leads. A preview tab follows only when it was opened
/// with a valid `parentTabId`; a standalone preview leads under its own id.
pub fn resolve_role(query: &str, session: &dyn SessionStore, is_design: bool) -> RoleDecision {
    let parent_id = if is_design {
        None
    } else {
        parent_tab_id(query)
    };
    let tab_id = resolve_tab_id(is_design, query, session);
    let role = if parent_id.is_some() {
        Role::Follower
    } else {
        Role::Leader
    };

    RoleDecision {
        role,
        tab_id,
        parent_id,
    }
}

/// Forget this tab's identity so the next connect mints a new one.
pub fn clear_tab_id(is_design: bool, session: &dyn SessionStore) {
    session.remove(storage_key(is_design));
}
