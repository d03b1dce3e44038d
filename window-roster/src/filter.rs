//! Owner filtering.
//!
//! Decides which applications are left out of discovery entirely: they get no
//! window records and no windowless placeholder.

use crate::config::FilterConfig;
use crate::types::OwnerInfo;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Owners that are always filtered and cannot be unblocked.
/// Note: These are exact matches. For pattern matching, see ALWAYS_FILTERED_PATTERNS.
pub const ALWAYS_FILTERED_OWNERS: &[&str] = &[
    // Ourselves - never list our own preview panels
    "window-roster",
    "com.apple.Spotlight",
];

/// Patterns for always-filtered owners (supports glob wildcards).
pub const ALWAYS_FILTERED_PATTERNS: &[&str] = &["*window-roster*", "*window_roster*"];

/// Filter deciding which owners take part in discovery
pub struct OwnerFilter {
    config: FilterConfig,
    /// Compiled patterns for blocked owners
    blocked_patterns: Vec<glob::Pattern>,
}

impl OwnerFilter {
    /// Create a new owner filter with the given configuration
    pub fn new(config: FilterConfig) -> Self {
        let blocked_patterns = compile_patterns(&config.blocked_owners);
        Self {
            config,
            blocked_patterns,
        }
    }

    /// Check an owner by bundle id first, then by display name
    pub fn is_filtered(&self, owner: &OwnerInfo) -> bool {
        self.is_blocked(owner.filter_id()) || self.is_blocked(&owner.display_name)
    }

    /// Check a single identifier against the static list and the
    /// configurable blocklist
    pub fn is_blocked(&self, id: &str) -> bool {
        if Self::is_always_filtered(id) {
            debug!("Owner '{}' is always filtered", id);
            return true;
        }

        for pattern in &self.blocked_patterns {
            if pattern.matches(id) {
                debug!("Owner '{}' filtered by pattern '{}'", id, pattern);
                return true;
            }
        }
        false
    }

    /// Checks both exact matches and glob patterns
    pub fn is_always_filtered(id: &str) -> bool {
        if ALWAYS_FILTERED_OWNERS.iter().any(|&blocked| blocked == id) {
            return true;
        }

        ALWAYS_FILTERED_PATTERNS
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .any(|pattern| pattern.matches(id))
    }

    /// Block an owner at runtime
    pub fn block_owner(&mut self, id: &str) {
        if !self.config.blocked_owners.iter().any(|b| b == id) {
            self.config.blocked_owners.push(id.to_string());
            self.blocked_patterns = compile_patterns(&self.config.blocked_owners);
        }
    }

    /// Unblock an owner at runtime (always-filtered owners stay filtered)
    pub fn unblock_owner(&mut self, id: &str) {
        self.config.blocked_owners.retain(|b| b != id);
        self.blocked_patterns = compile_patterns(&self.config.blocked_owners);
    }
}

impl Default for OwnerFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

/// Filter shared by discovery and purification, updatable at runtime
#[derive(Clone, Default)]
pub struct SharedFilter(Arc<RwLock<OwnerFilter>>);

impl SharedFilter {
    pub fn new(filter: OwnerFilter) -> Self {
        Self(Arc::new(RwLock::new(filter)))
    }

    pub fn is_filtered(&self, owner: &OwnerInfo) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_filtered(owner)
    }

    pub fn block_owner(&self, id: &str) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .block_owner(id);
    }

    pub fn unblock_owner(&self, id: &str) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unblock_owner(id);
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<glob::Pattern> {
    patterns
        .iter()
        .filter_map(|pattern| {
            glob::Pattern::new(pattern)
                .map_err(|e| {
                    tracing::warn!("Invalid blocked owner pattern '{}': {}", pattern, e);
                    e
                })
                .ok()
        })
        .collect()
}
