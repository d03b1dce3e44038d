//! Window discovery.
//!
//! A discovery pass merges three partial views of the desktop into the
//! [`OwnerWindowCache`]:
//!
//! 1. Visible windows from the primary capture source, kept only when they
//!    can be tied to an accessibility element of their owner
//! 2. Accessibility elements not matched in step 1 (minimized, hidden,
//!    fullscreen elsewhere), resolved to a window id and captured
//! 3. Window-server windows nobody else reported, recorded as cross-space
//!    placeholders
//! 4. A windowless placeholder for owners that ended up with no windows
//!
//! Passes only add and update. Removal is the purifier's job, which keeps
//! concurrent discovery and purification from fighting over records.

use crate::cache::{OwnerWindowCache, Upsert};
use crate::config::DiscoveryConfig;
use crate::filter::SharedFilter;
use crate::matching::MatchPolicy;
use crate::sources::{
    AccessibilityHandle, AccessibilitySource, AxSnapshot, OwnerSource, PrimaryCaptureSource,
    ServerWindow, SpaceSource, VisibleWindow, WindowCandidate, WindowServerSource,
};
use crate::types::{
    Frame, OwnerId, OwnerInfo, RecordKind, SourceError, SpaceId, WindowId, WindowRecord, WindowSlot,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Which owners a pass covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryTarget {
    Owner(OwnerId),
    AllOwners,
}

/// The providers a pass reads from
#[derive(Clone)]
pub struct DiscoverySources {
    pub primary: Arc<dyn PrimaryCaptureSource>,
    pub accessibility: Arc<dyn AccessibilitySource>,
    pub window_server: Arc<dyn WindowServerSource>,
    pub spaces: Arc<dyn SpaceSource>,
    pub owners: Arc<dyn OwnerSource>,
}

/// Counters describing what one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub owners_scanned: usize,
    pub owners_filtered: usize,
    pub owners_gone: usize,
    pub capture_backed: usize,
    pub accessibility_only: usize,
    pub cross_space: usize,
    pub windowless: usize,
    pub inserted: usize,
    pub dropped_unmatched: usize,
    pub unresolved_handles: usize,
    pub capture_failures: usize,
    pub primary_available: bool,
}

/// Where a still image for a candidate may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureRoute {
    Primary,
    PrimaryThenServer,
    Server,
}

/// System-wide listings fetched once per pass and shared by every owner
struct PassContext {
    /// `None` when the primary source could not be used
    visible: Option<Vec<VisibleWindow>>,
    /// Normal-layer windows on every space
    server: Vec<ServerWindow>,
    /// Spaces currently shown, assumed for visible windows of unknown membership
    current_spaces: Vec<SpaceId>,
}

impl PassContext {
    fn visible_for(&self, owner: OwnerId) -> impl Iterator<Item = &VisibleWindow> {
        self.visible
            .iter()
            .flatten()
            .filter(move |window| window.owner == owner)
    }

    fn server_for(&self, owner: OwnerId) -> impl Iterator<Item = &ServerWindow> {
        self.server.iter().filter(move |window| window.owner == owner)
    }
}

pub struct WindowDiscoveryReconciler {
    cache: Arc<OwnerWindowCache>,
    sources: DiscoverySources,
    filter: SharedFilter,
    policy: MatchPolicy,
    config: DiscoveryConfig,
}

impl WindowDiscoveryReconciler {
    pub fn new(
        cache: Arc<OwnerWindowCache>,
        sources: DiscoverySources,
        filter: SharedFilter,
        policy: MatchPolicy,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            cache,
            sources,
            filter,
            policy,
            config,
        }
    }

    /// Run one discovery pass
    pub async fn discover(&self, target: DiscoveryTarget) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        let owners = match target {
            DiscoveryTarget::Owner(pid) => match self.sources.owners.owner(pid) {
                Some(owner) => vec![owner],
                None => {
                    let removed = self.cache.remove_owner(pid);
                    debug!("Owner {} is not running, dropped {} records", pid, removed);
                    report.owners_gone = 1;
                    return report;
                }
            },
            DiscoveryTarget::AllOwners => self.sources.owners.running_owners(),
        };

        let context = self.gather().await;
        report.primary_available = context.visible.is_some();

        for owner in &owners {
            if self.filter.is_filtered(owner) {
                self.cache.remove_owner(owner.pid);
                report.owners_filtered += 1;
                continue;
            }
            report.owners_scanned += 1;
            self.discover_owner(owner, &context, &mut report).await;
        }

        debug!(
            "Discovery pass over {} owners: {} captured, {} accessibility-only, {} cross-space, {} windowless, {} dropped",
            report.owners_scanned,
            report.capture_backed,
            report.accessibility_only,
            report.cross_space,
            report.windowless,
            report.dropped_unmatched
        );
        report
    }

    async fn gather(&self) -> PassContext {
        let visible = match self.sources.primary.list_visible_windows().await {
            Ok(windows) => Some(windows),
            Err(SourceError::PermissionUnavailable) => {
                debug!("Screen capture permission unavailable, skipping visible window pass");
                None
            }
            Err(e) => {
                warn!("Failed to list visible windows: {}", e);
                None
            }
        };

        let mut server = Vec::new();
        match self.sources.window_server.list_all_window_ids(true).await {
            Ok(ids) => {
                for id in ids {
                    if let Some(window) = self.sources.window_server.metadata(id).await {
                        if window.is_normal() {
                            server.push(window);
                        }
                    }
                }
            }
            Err(e) => warn!("Failed to list window server windows: {}", e),
        }

        let current_spaces = match self.sources.spaces.current_workspace_ids().await {
            Ok(spaces) => spaces,
            Err(e) => {
                debug!("Current spaces unavailable: {}", e);
                Vec::new()
            }
        };

        PassContext {
            visible,
            server,
            current_spaces,
        }
    }

    async fn discover_owner(&self, owner: &OwnerInfo, context: &PassContext, report: &mut DiscoveryReport) {
        let pid = owner.pid;

        let handles = match self.sources.accessibility.list_windows(pid).await {
            Ok(handles) => handles,
            Err(e) => {
                debug!("No accessibility windows for owner {}: {}", pid, e);
                Vec::new()
            }
        };
        let elements: Vec<(Arc<dyn AccessibilityHandle>, AxSnapshot)> = handles
            .into_iter()
            .filter_map(|handle| AxSnapshot::read(handle.as_ref()).map(|snapshot| (handle, snapshot)))
            .collect();

        // Window ids accounted for in this pass, and elements already used
        let mut seen: HashSet<WindowId> = HashSet::new();
        let mut used: HashSet<u64> = HashSet::new();

        // Step 1: visible windows tied to an accessibility element
        let mut batch = Vec::new();
        for window in context.visible_for(pid) {
            seen.insert(window.id);
            match self.match_visible(window, &elements, &used) {
                Some(index) => {
                    let (handle, snapshot) = &elements[index];
                    used.insert(handle.token());
                    let mut candidate = WindowCandidate::from_visible(window, handle.clone(), snapshot);
                    candidate.is_hidden = owner.is_hidden;
                    batch.push((candidate, CaptureRoute::Primary));
                }
                None => {
                    trace!(
                        "Dropping visible window {} of owner {}: no accessibility element",
                        window.id,
                        pid
                    );
                    report.dropped_unmatched += 1;
                }
            }
        }
        self.capture_and_store(batch, RecordKind::CaptureBacked, &context.current_spaces, report)
            .await;

        // Step 2: elements the primary source could not see
        let cached = self.cache.read(pid);
        let fallback_route = if context.visible.is_some() {
            CaptureRoute::PrimaryThenServer
        } else {
            CaptureRoute::Server
        };
        let mut batch = Vec::new();
        for (handle, snapshot) in &elements {
            if used.contains(&handle.token()) {
                continue;
            }
            if matches!(handle.has_close_control(), Ok(false)) {
                trace!("Skipping auxiliary element of owner {}", pid);
                continue;
            }

            let window_id = snapshot
                .window_id
                .or_else(|| self.map_to_server(pid, snapshot, handle.token(), context, &seen, &cached));
            let Some(window_id) = window_id else {
                trace!(
                    "Could not resolve element {:?} of owner {} to a window",
                    snapshot.title,
                    pid
                );
                report.unresolved_handles += 1;
                continue;
            };
            if !seen.insert(window_id) {
                continue;
            }
            used.insert(handle.token());

            let mut candidate = WindowCandidate::from_handle(pid, window_id, handle.clone(), snapshot);
            candidate.is_hidden = owner.is_hidden;
            if candidate.bounds.is_none() {
                candidate.bounds = context
                    .server_for(pid)
                    .find(|window| window.id == window_id)
                    .map(|window| window.bounds);
            }
            batch.push((candidate, fallback_route));
        }
        self.capture_and_store(batch, RecordKind::AccessibilityOnly, &[], report)
            .await;

        // Step 3: windows only the window server knows about
        if self.config.include_cross_space {
            let batch: Vec<_> = context
                .server_for(pid)
                .filter(|window| seen.insert(window.id))
                .map(|window| {
                    let mut candidate = WindowCandidate::from_server(window);
                    candidate.is_hidden = owner.is_hidden;
                    (candidate, CaptureRoute::Server)
                })
                .collect();
            self.capture_and_store(batch, RecordKind::CrossSpacePlaceholder, &[], report)
                .await;
        }

        // Step 4: placeholder for owners without windows anywhere, including
        // windows left out of the cache on other spaces
        let in_grace = self.in_launch_grace(owner);
        let has_server_windows = context.server_for(pid).next().is_some();
        let placeholder = WindowRecord::windowless(owner);
        let added = self.cache.mutate(pid, |windows| {
            if windows.real_count() > 0 || has_server_windows {
                windows.remove(&WindowSlot::Windowless);
                None
            } else if in_grace {
                None
            } else {
                Some(windows.upsert(placeholder))
            }
        });
        match added {
            Some(outcome) => {
                report.windowless += 1;
                if outcome == Upsert::Inserted {
                    report.inserted += 1;
                }
            }
            None if in_grace => trace!("Owner {} launched recently, not yet windowless", pid),
            None => {}
        }
    }

    /// Find the accessibility element behind a visible window: by window id
    /// when the element exposes one, else by title and geometry
    fn match_visible(
        &self,
        window: &VisibleWindow,
        elements: &[(Arc<dyn AccessibilityHandle>, AxSnapshot)],
        used: &HashSet<u64>,
    ) -> Option<usize> {
        let unused: Vec<(usize, &AxSnapshot)> = elements
            .iter()
            .enumerate()
            .filter(|(_, (handle, _))| !used.contains(&handle.token()))
            .map(|(index, (_, snapshot))| (index, snapshot))
            .collect();

        unused
            .iter()
            .find(|(_, snapshot)| snapshot.window_id == Some(window.id))
            .or_else(|| {
                unused.iter().find(|(_, snapshot)| {
                    snapshot.window_id.is_none()
                        && self.policy.matches(
                            window.title.as_deref(),
                            Some(&window.bounds),
                            snapshot.title.as_deref(),
                            snapshot.bounds.as_ref(),
                        )
                })
            })
            .map(|(index, _)| *index)
    }

    /// Resolve an element without a window id against the owner's window
    /// server windows that nobody has claimed yet
    fn map_to_server(
        &self,
        owner: OwnerId,
        snapshot: &AxSnapshot,
        token: u64,
        context: &PassContext,
        seen: &HashSet<WindowId>,
        cached: &[WindowRecord],
    ) -> Option<WindowId> {
        let held_by_other_element = |id: WindowId| {
            cached.iter().any(|record| {
                record.window_id() == Some(id)
                    && record
                        .ax
                        .as_ref()
                        .is_some_and(|ax| ax.token() != token && ax.handle.is_valid())
            })
        };

        context
            .server_for(owner)
            .filter(|window| !seen.contains(&window.id))
            .filter(|window| !held_by_other_element(window.id))
            .find(|window| {
                self.policy.loosely_matches(
                    snapshot.title.as_deref(),
                    snapshot.bounds.as_ref(),
                    window.title.as_deref(),
                    Some(&window.bounds),
                )
            })
            .map(|window| window.id)
    }

    fn in_launch_grace(&self, owner: &OwnerInfo) -> bool {
        let Some(launched_at) = owner.launched_at else {
            return false;
        };
        match (Utc::now() - launched_at).to_std() {
            Ok(age) => age < self.config.launch_grace(),
            // launched "in the future": clock skew, treat as just launched
            Err(_) => true,
        }
    }

    /// Capture stills for a batch with bounded concurrency, then merge the
    /// results into the cache in batch order. `fallback_spaces` stands in for
    /// membership the space source could not report.
    async fn capture_and_store(
        &self,
        batch: Vec<(WindowCandidate, CaptureRoute)>,
        kind: RecordKind,
        fallback_spaces: &[SpaceId],
        report: &mut DiscoveryReport,
    ) {
        if batch.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.capture_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, (candidate, route)) in batch.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let primary = self.sources.primary.clone();
            let server = self.sources.window_server.clone();
            let spaces = self.sources.spaces.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, candidate, None, Vec::new());
                };
                let window_id = candidate.window_id;
                let frame = capture_still(route, window_id, primary.as_ref(), server.as_ref()).await;
                let membership = match spaces.workspaces_containing(window_id).await {
                    Ok(membership) => membership,
                    Err(e) => {
                        trace!("Space membership of window {} unavailable: {}", window_id, e);
                        Vec::new()
                    }
                };
                (index, candidate, frame, membership)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Capture task failed: {}", e),
            }
        }
        results.sort_by_key(|(index, ..)| *index);

        for (_, mut candidate, frame, membership) in results {
            if frame.is_none() {
                report.capture_failures += 1;
            }
            candidate.spaces = if membership.is_empty() {
                fallback_spaces.to_vec()
            } else {
                membership
            };
            trace!(
                "Storing {} window {} of owner {}",
                kind.as_str(),
                candidate.window_id,
                candidate.owner
            );
            let record = candidate.into_record(kind).with_image(frame);
            if self.cache.upsert(record) == Upsert::Inserted {
                report.inserted += 1;
            }
            match kind {
                RecordKind::CaptureBacked => report.capture_backed += 1,
                RecordKind::AccessibilityOnly => report.accessibility_only += 1,
                RecordKind::CrossSpacePlaceholder => report.cross_space += 1,
                RecordKind::WindowlessPlaceholder => report.windowless += 1,
            }
        }
    }
}

async fn capture_still(
    route: CaptureRoute,
    window_id: WindowId,
    primary: &dyn PrimaryCaptureSource,
    server: &dyn WindowServerSource,
) -> Option<Frame> {
    if route != CaptureRoute::Server {
        match primary.capture_still(window_id).await {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(SourceError::PermissionUnavailable) => {}
            Err(e) => debug!("Primary capture of window {} failed: {}", window_id, e),
        }
        if route == CaptureRoute::Primary {
            return None;
        }
    }

    match server.capture_still(window_id).await {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Window server capture of window {} failed: {}", window_id, e);
            None
        }
    }
}
