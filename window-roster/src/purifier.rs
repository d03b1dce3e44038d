//! Cache purification.
//!
//! Removes records for windows that no longer exist and owners that are gone,
//! while keeping windows that merely stopped answering through accessibility.
//! The window server's full listing (every space, invisible windows included)
//! is the authority on existence: a window it still lists is only ever marked
//! unreachable, never deleted.

use crate::cache::OwnerWindowCache;
use crate::filter::SharedFilter;
use crate::reconciler::DiscoveryTarget;
use crate::sources::{AxSnapshot, OwnerSource, SpaceSource, WindowServerSource};
use crate::types::{OwnerId, SpaceId, WindowId, WindowSlot};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurifyReport {
    pub owners_removed: usize,
    pub windows_removed: usize,
    pub placeholders_removed: usize,
    pub marked_unreachable: usize,
    pub refreshed: usize,
    /// The window listing could not be fetched, nothing was touched
    pub skipped: bool,
}

/// What was learned about one cached window before taking the owner lock
struct Probe {
    /// Element the record was bound to when probed
    token: Option<u64>,
    snapshot: Option<AxSnapshot>,
    spaces: Option<Vec<SpaceId>>,
}

pub struct CachePurifier {
    cache: Arc<OwnerWindowCache>,
    window_server: Arc<dyn WindowServerSource>,
    spaces: Arc<dyn SpaceSource>,
    owners: Arc<dyn OwnerSource>,
    filter: SharedFilter,
}

impl CachePurifier {
    pub fn new(
        cache: Arc<OwnerWindowCache>,
        window_server: Arc<dyn WindowServerSource>,
        spaces: Arc<dyn SpaceSource>,
        owners: Arc<dyn OwnerSource>,
        filter: SharedFilter,
    ) -> Self {
        Self {
            cache,
            window_server,
            spaces,
            owners,
            filter,
        }
    }

    pub async fn purify(&self, target: DiscoveryTarget) -> PurifyReport {
        let mut report = PurifyReport::default();

        // Without the authoritative listing every window would look closed
        let existing: HashSet<WindowId> = match self.window_server.list_all_window_ids(true).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!("Cannot list windows, skipping purge: {}", e);
                report.skipped = true;
                return report;
            }
        };

        let owners = match target {
            DiscoveryTarget::Owner(pid) => vec![pid],
            DiscoveryTarget::AllOwners => self.cache.owners(),
        };

        for pid in owners {
            self.purify_owner(pid, &existing, &mut report).await;
        }

        if report != PurifyReport::default() {
            debug!(
                "Purge removed {} owners and {} windows, {} windows unreachable",
                report.owners_removed, report.windows_removed, report.marked_unreachable
            );
        }
        report
    }

    async fn purify_owner(&self, pid: OwnerId, existing: &HashSet<WindowId>, report: &mut PurifyReport) {
        let owner = match self.owners.owner(pid) {
            Some(owner) if !self.filter.is_filtered(&owner) => owner,
            Some(_) => {
                trace!("Owner {} is filtered, dropping its records", pid);
                report.windows_removed += self.cache.remove_owner(pid);
                report.owners_removed += 1;
                return;
            }
            None => {
                trace!("Owner {} terminated, dropping its records", pid);
                report.windows_removed += self.cache.remove_owner(pid);
                report.owners_removed += 1;
                return;
            }
        };

        // Accessibility and space queries cross process boundaries, so they
        // all run before the owner lock is taken
        let mut probes: HashMap<WindowId, Probe> = HashMap::new();
        for record in self.cache.read(pid) {
            let Some(id) = record.window_id() else {
                continue;
            };
            if !existing.contains(&id) {
                continue;
            }
            let snapshot = record
                .ax
                .as_ref()
                .and_then(|ax| AxSnapshot::read(ax.handle.as_ref()));
            let spaces = if snapshot.is_some() {
                None
            } else {
                match self.spaces.workspaces_containing(id).await {
                    Ok(spaces) if !spaces.is_empty() => Some(spaces),
                    Ok(_) => None,
                    Err(e) => {
                        trace!("Space membership of window {} unavailable: {}", id, e);
                        None
                    }
                }
            };
            probes.insert(
                id,
                Probe {
                    token: record.ax.as_ref().map(|ax| ax.token()),
                    snapshot,
                    spaces,
                },
            );
        }

        self.cache.mutate(pid, |windows| {
            let before = windows.len();
            windows.retain(|record| match record.window_id() {
                Some(id) => existing.contains(&id),
                None => true,
            });
            report.windows_removed += before - windows.len();

            for record in windows.iter_mut() {
                let Some(window_id) = record.window_id() else {
                    continue;
                };
                // Records written or re-bound since the probe are left for the next sweep
                let Some(probe) = probes.remove(&window_id) else {
                    continue;
                };
                if probe.token != record.ax.as_ref().map(|ax| ax.token()) {
                    continue;
                }

                match (&mut record.ax, probe.snapshot) {
                    (Some(ax), Some(snapshot)) => {
                        ax.reachable = true;
                        record.is_minimized = snapshot.is_minimized;
                        record.is_fullscreen = snapshot.is_fullscreen;
                        if let Some(title) = snapshot.title.filter(|t| !t.trim().is_empty()) {
                            record.title = Some(title);
                        }
                        report.refreshed += 1;
                    }
                    (ax, _) => {
                        if let Some(ax) = ax {
                            if ax.reachable {
                                trace!("Window {} of owner {} became unreachable", window_id, pid);
                                report.marked_unreachable += 1;
                            }
                            ax.reachable = false;
                        }
                        if let Some(spaces) = probe.spaces {
                            record.space_membership = spaces.into_iter().collect();
                        }
                    }
                }
            }

            if windows.real_count() > 0 && windows.remove(&WindowSlot::Windowless).is_some() {
                report.placeholders_removed += 1;
            }
        });

        if owner.is_hidden {
            self.cache.mutate(pid, |windows| {
                for record in windows.iter_mut() {
                    record.is_hidden = true;
                }
            });
        }
    }
}
