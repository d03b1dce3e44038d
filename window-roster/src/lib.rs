//! Window Roster - live window inventory and preview pool
//!
//! This crate keeps a trustworthy picture of which windows exist on the
//! machine by reconciling three imperfect sources:
//!
//! - **Primary capture**: on-screen windows with real geometry and imagery
//! - **Accessibility**: per-application UI trees, minimized windows included
//! - **Window server**: every window on every space, coarse metadata only
//!
//! # Architecture
//!
//! A [`WindowDiscoveryReconciler`] merges the sources into the per-owner
//! [`OwnerWindowCache`], a [`CachePurifier`] drops what no longer exists, and
//! a [`LiveCaptureResourceManager`] keeps a bounded pool of live streams for
//! the windows being previewed. [`WindowRoster`] ties them together.

pub mod cache;
pub mod config;
pub mod filter;
pub mod matching;
pub mod purifier;
pub mod reconciler;
pub mod roster;
pub mod sources;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use cache::{OwnerWindowCache, OwnerWindows, Upsert};
pub use config::Config;
pub use filter::{OwnerFilter, SharedFilter, ALWAYS_FILTERED_OWNERS, ALWAYS_FILTERED_PATTERNS};
pub use matching::{word_overlap, MatchPolicy};
pub use purifier::{CachePurifier, PurifyReport};
pub use reconciler::{DiscoveryReport, DiscoverySources, DiscoveryTarget, WindowDiscoveryReconciler};
pub use roster::{Providers, RefreshReport, RosterStatus, WindowRoster};
pub use stream::{LiveCaptureResourceManager, SessionState, StreamSession};
pub use types::{
    AxRef, Frame, KeepAlive, OwnerId, OwnerInfo, RecordKind, SourceError, SpaceId, StreamError,
    StreamQuality, WindowBounds, WindowId, WindowKey, WindowRecord, WindowSlot, WindowSummary,
};
