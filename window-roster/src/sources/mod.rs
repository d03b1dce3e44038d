//! Discovery source integrations.
//!
//! Window knowledge comes from three independent providers, none of which sees
//! the whole picture:
//! - Primary capture: visible windows with real geometry and direct imagery
//! - Accessibility: per-process UI trees, including minimized/hidden windows
//! - Window server: every window system-wide, but only coarse metadata
//!
//! Space membership and running applications come from two small auxiliary
//! providers. The adapters at the bottom of this module normalize provider
//! output into a common [`WindowCandidate`].

pub mod unavailable;
pub mod window_server;

use crate::types::{
    AxRef, Frame, OwnerId, OwnerInfo, RecordKind, SourceError, SpaceId, StreamQuality,
    WindowBounds, WindowId, WindowRecord, WindowSlot,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Window layer of ordinary application windows
pub const NORMAL_WINDOW_LAYER: i32 = 0;

/// A window reported by the primary capture source
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleWindow {
    pub id: WindowId,
    pub owner: OwnerId,
    pub title: Option<String>,
    pub bounds: WindowBounds,
}

/// Coarse metadata reported by the window server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerWindow {
    pub id: WindowId,
    pub owner: OwnerId,
    pub title: Option<String>,
    pub bounds: WindowBounds,
    pub layer: i32,
}

impl ServerWindow {
    pub fn is_normal(&self) -> bool {
        self.layer == NORMAL_WINDOW_LAYER
    }
}

/// Screen-capture enumeration of on-screen windows. Permission gated.
#[async_trait::async_trait]
pub trait PrimaryCaptureSource: Send + Sync {
    async fn list_visible_windows(&self) -> Result<Vec<VisibleWindow>, SourceError>;

    async fn capture_still(&self, window_id: WindowId) -> Result<Option<Frame>, SourceError>;
}

/// A reference into another process's UI tree. Any accessor may start
/// failing with [`SourceError::StaleHandle`] at any time.
pub trait AccessibilityHandle: fmt::Debug + Send + Sync {
    /// Stable identity of the underlying UI element
    fn token(&self) -> u64;

    /// System window id, when the platform exposes the mapping
    fn window_id(&self) -> Result<Option<WindowId>, SourceError>;

    fn title(&self) -> Result<Option<String>, SourceError>;

    fn is_minimized(&self) -> Result<bool, SourceError>;

    fn is_fullscreen(&self) -> Result<bool, SourceError>;

    fn bounds(&self) -> Result<Option<WindowBounds>, SourceError>;

    fn has_close_control(&self) -> Result<bool, SourceError>;

    fn is_valid(&self) -> bool {
        self.title().is_ok()
    }
}

/// Per-process accessibility enumeration
#[async_trait::async_trait]
pub trait AccessibilitySource: Send + Sync {
    async fn list_windows(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<Arc<dyn AccessibilityHandle>>, SourceError>;
}

/// Privileged system-wide window enumeration
#[async_trait::async_trait]
pub trait WindowServerSource: Send + Sync {
    async fn list_all_window_ids(
        &self,
        include_invisible: bool,
    ) -> Result<Vec<WindowId>, SourceError>;

    async fn metadata(&self, window_id: WindowId) -> Option<ServerWindow>;

    /// Still capture that works regardless of the window's space
    async fn capture_still(&self, window_id: WindowId) -> Result<Option<Frame>, SourceError>;
}

/// Workspace membership queries
#[async_trait::async_trait]
pub trait SpaceSource: Send + Sync {
    async fn current_workspace_ids(&self) -> Result<Vec<SpaceId>, SourceError>;

    async fn workspaces_containing(&self, window_id: WindowId) -> Result<Vec<SpaceId>, SourceError>;
}

/// Running applications
pub trait OwnerSource: Send + Sync {
    fn running_owners(&self) -> Vec<OwnerInfo>;

    /// `None` once the process has terminated
    fn owner(&self, pid: OwnerId) -> Option<OwnerInfo>;
}

/// Live frames from an opened stream
pub struct LiveFeed {
    pub frames: mpsc::Receiver<Frame>,
    pub handle: Box<dyn FeedHandle>,
}

impl fmt::Debug for LiveFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveFeed").finish_non_exhaustive()
    }
}

/// Owner-side control of an opened stream
#[async_trait::async_trait]
pub trait FeedHandle: Send + Sync {
    /// Tear the stream down. Must be safe to call on a feed whose frame
    /// receiver has already been dropped.
    async fn close(&mut self);
}

/// Opens live capture streams for individual windows
#[async_trait::async_trait]
pub trait StreamProvider: Send + Sync {
    async fn open(
        &self,
        window_id: WindowId,
        quality: StreamQuality,
        frame_rate: u32,
    ) -> Result<LiveFeed, SourceError>;
}

/// Point-in-time read of an accessibility handle
#[derive(Debug, Clone, PartialEq)]
pub struct AxSnapshot {
    pub window_id: Option<WindowId>,
    pub title: Option<String>,
    pub bounds: Option<WindowBounds>,
    pub is_minimized: bool,
    pub is_fullscreen: bool,
}

impl AxSnapshot {
    /// Read every attribute once. Stale handles produce `None`; an
    /// individual attribute that cannot be read falls back to its default.
    pub fn read(handle: &dyn AccessibilityHandle) -> Option<Self> {
        let title = match handle.title() {
            Ok(title) => title,
            Err(SourceError::StaleHandle) => return None,
            Err(_) => None,
        };

        Some(Self {
            window_id: handle.window_id().ok().flatten(),
            title,
            bounds: handle.bounds().ok().flatten(),
            is_minimized: handle.is_minimized().unwrap_or(false),
            is_fullscreen: handle.is_fullscreen().unwrap_or(false),
        })
    }
}

/// Common shape every source is normalized into before it reaches the cache
#[derive(Debug, Clone)]
pub struct WindowCandidate {
    pub window_id: WindowId,
    pub owner: OwnerId,
    pub title: Option<String>,
    pub bounds: Option<WindowBounds>,
    pub ax: Option<AxRef>,
    pub is_minimized: bool,
    pub is_hidden: bool,
    pub is_fullscreen: bool,
    pub spaces: Vec<SpaceId>,
}

impl WindowCandidate {
    /// Visible window backed by the accessibility element it was matched to
    pub fn from_visible(
        window: &VisibleWindow,
        handle: Arc<dyn AccessibilityHandle>,
        snapshot: &AxSnapshot,
    ) -> Self {
        Self {
            window_id: window.id,
            owner: window.owner,
            title: non_empty(snapshot.title.clone()).or_else(|| non_empty(window.title.clone())),
            bounds: Some(window.bounds),
            ax: Some(AxRef::new(handle)),
            is_minimized: snapshot.is_minimized,
            is_hidden: false,
            is_fullscreen: snapshot.is_fullscreen,
            spaces: Vec::new(),
        }
    }

    /// Accessibility element resolved to a system window id
    pub fn from_handle(
        owner: OwnerId,
        window_id: WindowId,
        handle: Arc<dyn AccessibilityHandle>,
        snapshot: &AxSnapshot,
    ) -> Self {
        Self {
            window_id,
            owner,
            title: non_empty(snapshot.title.clone()),
            bounds: snapshot.bounds,
            ax: Some(AxRef::new(handle)),
            is_minimized: snapshot.is_minimized,
            is_hidden: false,
            is_fullscreen: snapshot.is_fullscreen,
            spaces: Vec::new(),
        }
    }

    /// Window known only to the window server
    pub fn from_server(window: &ServerWindow) -> Self {
        Self {
            window_id: window.id,
            owner: window.owner,
            title: non_empty(window.title.clone()),
            bounds: Some(window.bounds),
            ax: None,
            is_minimized: false,
            is_hidden: false,
            is_fullscreen: false,
            spaces: Vec::new(),
        }
    }

    pub fn into_record(self, kind: RecordKind) -> WindowRecord {
        let mut record = WindowRecord::new(self.owner, WindowSlot::Window(self.window_id), kind);
        record.title = self.title;
        record.bounds = self.bounds;
        record.ax = self.ax;
        record.is_minimized = self.is_minimized;
        record.is_hidden = self.is_hidden;
        record.is_fullscreen = self.is_fullscreen;
        record.space_membership = self.spaces.into_iter().collect();
        record
    }
}

fn non_empty(title: Option<String>) -> Option<String> {
    title.filter(|t| !t.trim().is_empty())
}
