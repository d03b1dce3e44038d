//! The roster facade.
//!
//! Wires discovery, purification and the live capture pool together over a
//! set of injected providers. This is the only type the UI layer talks to.

use crate::cache::OwnerWindowCache;
use crate::config::Config;
use crate::filter::{OwnerFilter, SharedFilter};
use crate::matching::MatchPolicy;
use crate::purifier::{CachePurifier, PurifyReport};
use crate::reconciler::{DiscoveryReport, DiscoverySources, DiscoveryTarget, WindowDiscoveryReconciler};
use crate::sources::{
    AccessibilitySource, OwnerSource, PrimaryCaptureSource, SpaceSource, StreamProvider,
    WindowServerSource,
};
use crate::stream::LiveCaptureResourceManager;
use crate::types::{Frame, KeepAlive, OwnerId, StreamQuality, WindowId, WindowKey, WindowRecord};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything the roster needs from the platform
#[derive(Clone)]
pub struct Providers {
    pub primary: Arc<dyn PrimaryCaptureSource>,
    pub accessibility: Arc<dyn AccessibilitySource>,
    pub window_server: Arc<dyn WindowServerSource>,
    pub spaces: Arc<dyn SpaceSource>,
    pub owners: Arc<dyn OwnerSource>,
    pub streams: Arc<dyn StreamProvider>,
}

impl Providers {
    fn discovery(&self) -> DiscoverySources {
        DiscoverySources {
            primary: self.primary.clone(),
            accessibility: self.accessibility.clone(),
            window_server: self.window_server.clone(),
            spaces: self.spaces.clone(),
            owners: self.owners.clone(),
        }
    }
}

/// Outcome of one discover-then-purify refresh
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub discovery: DiscoveryReport,
    pub purify: PurifyReport,
}

/// Roster status information
#[derive(Debug, Clone, Serialize)]
pub struct RosterStatus {
    pub owners: usize,
    pub windows: usize,
    /// Cross-space and windowless placeholders among `windows`
    pub placeholders: usize,
    pub live_sessions: usize,
    pub live_capacity: usize,
    pub refresh_passes: u64,
    /// Whether the last refresh could use the primary capture source
    pub capture_available: Option<bool>,
}

pub struct WindowRoster {
    config: Config,
    cache: Arc<OwnerWindowCache>,
    filter: SharedFilter,
    reconciler: WindowDiscoveryReconciler,
    purifier: CachePurifier,
    live: Arc<LiveCaptureResourceManager>,
    passes: AtomicU64,
    last_refresh: Mutex<Option<RefreshReport>>,
    shutdown: CancellationToken,
}

impl WindowRoster {
    pub fn new(config: Config, providers: Providers) -> Self {
        let cache = Arc::new(OwnerWindowCache::new());
        let filter = SharedFilter::new(OwnerFilter::new(config.filter.clone()));

        let reconciler = WindowDiscoveryReconciler::new(
            cache.clone(),
            providers.discovery(),
            filter.clone(),
            MatchPolicy::from_config(&config.matching),
            config.discovery.clone(),
        );
        let purifier = CachePurifier::new(
            cache.clone(),
            providers.window_server.clone(),
            providers.spaces.clone(),
            providers.owners.clone(),
            filter.clone(),
        );
        let live = Arc::new(LiveCaptureResourceManager::new(
            providers.streams.clone(),
            config.streaming.clone(),
        ));

        Self {
            config,
            cache,
            filter,
            reconciler,
            purifier,
            live,
            passes: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cache(&self) -> &Arc<OwnerWindowCache> {
        &self.cache
    }

    pub fn live(&self) -> &Arc<LiveCaptureResourceManager> {
        &self.live
    }

    /// Configured grace period for live sessions after the panel closes
    pub fn keep_alive(&self) -> KeepAlive {
        self.config.streaming.keep_alive()
    }

    /// Discover, then purge what no longer exists
    pub async fn refresh(&self, target: DiscoveryTarget) -> RefreshReport {
        let discovery = self.reconciler.discover(target).await;
        let purify = self.purifier.purify(target).await;
        let report = RefreshReport { discovery, purify };

        self.passes.fetch_add(1, Ordering::Relaxed);
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Snapshot of the cache for the UI
    pub fn list_windows(&self, owner: Option<OwnerId>) -> Vec<WindowRecord> {
        self.cache.snapshot(owner)
    }

    pub fn touch(&self, key: &WindowKey) -> bool {
        self.cache.touch(key)
    }

    pub async fn request_live_preview(
        &self,
        window_id: WindowId,
        quality: Option<StreamQuality>,
        frame_rate: Option<u32>,
    ) -> watch::Receiver<Option<Frame>> {
        self.live
            .request_live_preview(window_id, quality, frame_rate)
            .await
    }

    pub fn release_preview(&self, window_id: WindowId, keep_alive: KeepAlive) {
        self.live.release(window_id, keep_alive);
    }

    pub fn panel_opened(&self) {
        self.live.panel_opened();
    }

    pub async fn panel_closed(&self, keep_alive: KeepAlive) {
        self.live.panel_closed(keep_alive).await;
    }

    /// Leave an owner out from the next refresh on
    pub fn block_owner(&self, id: &str) {
        info!("Blocking owner '{}'", id);
        self.filter.block_owner(id);
    }

    pub fn unblock_owner(&self, id: &str) {
        info!("Unblocking owner '{}'", id);
        self.filter.unblock_owner(id);
    }

    pub fn status(&self) -> RosterStatus {
        let last = self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|report| report.discovery.primary_available);
        let records = self.cache.snapshot(None);
        RosterStatus {
            owners: self.cache.owners().len(),
            windows: records.len(),
            placeholders: records.iter().filter(|r| r.kind.is_placeholder()).count(),
            live_sessions: self.live.len(),
            live_capacity: self.live.capacity(),
            refresh_passes: self.passes.load(Ordering::Relaxed),
            capture_available: last,
        }
    }

    /// Refresh every `interval` until [`WindowRoster::shutdown`] is called
    pub async fn run(&self, interval: Duration, mut on_refresh: impl FnMut(&RefreshReport)) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Roster running with {:?} refresh interval", interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.refresh(DiscoveryTarget::AllOwners).await;
                    on_refresh(&report);
                }
            }
        }
        debug!("Roster refresh loop stopped");
    }

    /// Stop the refresh loop and every live session
    pub async fn shutdown(&self) {
        info!("Shutting down window roster");
        self.shutdown.cancel();
        self.live.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStreams, FakeSystem};
    use crate::types::{RecordKind, WindowBounds};

    fn roster(system: &Arc<FakeSystem>, streams: &Arc<FakeStreams>) -> WindowRoster {
        let providers = Providers {
            primary: system.clone(),
            accessibility: system.clone(),
            window_server: system.clone(),
            spaces: system.clone(),
            owners: system.clone(),
            streams: streams.clone(),
        };
        WindowRoster::new(Config::default(), providers)
    }

    #[tokio::test]
    async fn test_refresh_lists_windows() {
        let system = FakeSystem::new();
        system.add_owner(100, "Editor");
        system.add_owner(200, "Finder");
        system.add_window(100, 1, "main.rs", WindowBounds::new(0, 0, 800, 600));
        let roster = roster(&system, &FakeStreams::new());

        let report = roster.refresh(DiscoveryTarget::AllOwners).await;

        assert_eq!(report.discovery.capture_backed, 1);
        let windows = roster.list_windows(None);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].owner, 100);
        assert_eq!(windows[1].kind, RecordKind::WindowlessPlaceholder);
        assert_eq!(roster.list_windows(Some(100)).len(), 1);

        let status = roster.status();
        assert_eq!(status.owners, 2);
        assert_eq!(status.windows, 2);
        assert_eq!(status.placeholders, 1);
        assert_eq!(status.refresh_passes, 1);
        assert_eq!(status.capture_available, Some(true));
    }

    #[tokio::test]
    async fn test_closed_window_disappears_on_next_refresh() {
        let system = FakeSystem::new();
        system.add_owner(100, "Editor");
        system.add_window(100, 1, "a", WindowBounds::new(0, 0, 800, 600));
        system.add_window(100, 2, "b", WindowBounds::new(40, 40, 800, 600));
        let roster = roster(&system, &FakeStreams::new());
        roster.refresh(DiscoveryTarget::AllOwners).await;

        system.close_window(1);
        roster.refresh(DiscoveryTarget::AllOwners).await;

        let ids: Vec<_> = roster.list_windows(None).iter().filter_map(|r| r.window_id()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_block_owner_at_runtime() {
        let system = FakeSystem::new();
        system.add_owner(100, "Editor");
        system.add_window(100, 1, "a", WindowBounds::new(0, 0, 800, 600));
        let roster = roster(&system, &FakeStreams::new());
        roster.refresh(DiscoveryTarget::AllOwners).await;
        assert_eq!(roster.list_windows(None).len(), 1);

        roster.block_owner("com.example.editor");
        roster.refresh(DiscoveryTarget::AllOwners).await;
        assert!(roster.list_windows(None).is_empty());

        roster.unblock_owner("com.example.editor");
        roster.refresh(DiscoveryTarget::AllOwners).await;
        assert_eq!(roster.list_windows(None).len(), 1);
    }

    #[tokio::test]
    async fn test_touch_marks_access() {
        let system = FakeSystem::new();
        system.add_owner(100, "Editor");
        system.add_window(100, 1, "a", WindowBounds::new(0, 0, 800, 600));
        let roster = roster(&system, &FakeStreams::new());
        roster.refresh(DiscoveryTarget::AllOwners).await;

        assert!(roster.touch(&WindowKey::window(100, 1)));
        assert!(!roster.touch(&WindowKey::window(100, 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_refreshes_until_shutdown() {
        let system = FakeSystem::new();
        system.add_owner(100, "Editor");
        let streams = FakeStreams::new();
        let roster = Arc::new(roster(&system, &streams));
        roster.request_live_preview(5, None, None).await;

        let runner = {
            let roster = roster.clone();
            tokio::spawn(async move {
                let mut seen = 0;
                roster.run(Duration::from_secs(1), |_| seen += 1).await;
                seen
            })
        };
        tokio::time::sleep(Duration::from_millis(3500)).await;
        roster.shutdown().await;

        let refreshes = runner.await.unwrap();
        assert!(refreshes >= 3, "only {} refreshes", refreshes);
        assert_eq!(roster.status().live_sessions, 0);
        assert_eq!(streams.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_close_then_reopen_keeps_previews() {
        let system = FakeSystem::new();
        let streams = FakeStreams::new();
        let roster = roster(&system, &streams);
        for id in 1..=5 {
            roster.request_live_preview(id, None, None).await;
        }

        roster.panel_closed(roster.keep_alive()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        roster.panel_opened();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(roster.status().live_sessions, 5);
        assert_eq!(streams.closed(), 0);
    }
}
