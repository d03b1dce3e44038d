//! Core types used throughout the window roster.
//!
//! This module defines the canonical window record, the composite identity
//! used to key it, and the error types shared by the discovery sources and
//! the live-capture pool.

use crate::sources::AccessibilityHandle;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// System-wide window identifier (platform-specific)
pub type WindowId = u32;

/// Process identifier of the application owning a window
pub type OwnerId = i32;

/// Identifier of a workspace ("space")
pub type SpaceId = u64;

/// A captured still or stream frame. Shared, never mutated after capture.
pub type Frame = Arc<DynamicImage>;

/// Window position and size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowBounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Check whether every edge of `other` lies within `tolerance` pixels of ours
    pub fn approx_eq(&self, other: &WindowBounds, tolerance: u32) -> bool {
        let tol = tolerance as i64;
        (self.x as i64 - other.x as i64).abs() <= tol
            && (self.y as i64 - other.y as i64).abs() <= tol
            && (self.width as i64 - other.width as i64).abs() <= tol
            && (self.height as i64 - other.height as i64).abs() <= tol
    }
}

/// Position of a record inside one owner's cache.
///
/// Real windows are keyed by their window id; the windowless placeholder has
/// its own slot so the identifier space is never overloaded with a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowSlot {
    Window(WindowId),
    Windowless,
}

impl WindowSlot {
    pub fn window_id(&self) -> Option<WindowId> {
        match self {
            WindowSlot::Window(id) => Some(*id),
            WindowSlot::Windowless => None,
        }
    }
}

impl fmt::Display for WindowSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSlot::Window(id) => write!(f, "{}", id),
            WindowSlot::Windowless => f.write_str("windowless"),
        }
    }
}

/// Canonical identity of a cached record: owning process plus slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub owner: OwnerId,
    pub slot: WindowSlot,
}

impl WindowKey {
    pub fn window(owner: OwnerId, window_id: WindowId) -> Self {
        Self {
            owner,
            slot: WindowSlot::Window(window_id),
        }
    }

    pub fn windowless(owner: OwnerId) -> Self {
        Self {
            owner,
            slot: WindowSlot::Windowless,
        }
    }
}

/// Which discovery path produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Visible window matched to an accessibility handle and captured directly
    CaptureBacked,
    /// Known through the accessibility tree only (minimized, hidden, ...)
    AccessibilityOnly,
    /// Known only to the window server, most likely on another space
    CrossSpacePlaceholder,
    /// Stand-in for a running application with no windows at all
    WindowlessPlaceholder,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::CaptureBacked => "capture_backed",
            RecordKind::AccessibilityOnly => "accessibility_only",
            RecordKind::CrossSpacePlaceholder => "cross_space_placeholder",
            RecordKind::WindowlessPlaceholder => "windowless_placeholder",
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            RecordKind::CrossSpacePlaceholder | RecordKind::WindowlessPlaceholder
        )
    }
}

/// Accessibility handle carried by a record, plus whether it resolved the
/// last time anyone looked.
#[derive(Debug, Clone)]
pub struct AxRef {
    pub handle: Arc<dyn AccessibilityHandle>,
    pub reachable: bool,
}

impl AxRef {
    pub fn new(handle: Arc<dyn AccessibilityHandle>) -> Self {
        Self {
            handle,
            reachable: true,
        }
    }

    pub fn token(&self) -> u64 {
        self.handle.token()
    }

    /// Same underlying UI element, and both sides still resolve
    pub fn same_live_element(&self, other: &AxRef) -> bool {
        self.token() == other.token() && self.handle.is_valid() && other.handle.is_valid()
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

impl PartialEq for AxRef {
    fn eq(&self, other: &Self) -> bool {
        self.token() == other.token() && self.reachable == other.reachable
    }
}

/// Information about a running application
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerInfo {
    pub pid: OwnerId,
    /// Application name
    pub display_name: String,
    /// Application bundle ID (macOS) or executable name
    pub bundle_id: Option<String>,
    /// Reference the UI layer can resolve into an icon
    pub icon_ref: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    /// Whether the whole application is hidden
    pub is_hidden: bool,
}

impl OwnerInfo {
    pub fn new(pid: OwnerId, display_name: impl Into<String>) -> Self {
        Self {
            pid,
            display_name: display_name.into(),
            bundle_id: None,
            icon_ref: None,
            launched_at: None,
            is_hidden: false,
        }
    }

    /// Identifier used for filtering: bundle id when known, else the name
    pub fn filter_id(&self) -> &str {
        self.bundle_id.as_deref().unwrap_or(&self.display_name)
    }
}

/// Canonical representation of one window in the cache
#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub owner: OwnerId,
    pub slot: WindowSlot,
    pub kind: RecordKind,
    pub title: Option<String>,
    pub bounds: Option<WindowBounds>,
    pub image: Option<Frame>,
    pub image_captured_at: Option<DateTime<Utc>>,
    pub ax: Option<AxRef>,
    pub is_minimized: bool,
    pub is_hidden: bool,
    pub is_fullscreen: bool,
    /// Spaces the window belongs to; empty means unknown
    pub space_membership: BTreeSet<SpaceId>,
    /// Icon reference, only set on windowless placeholders
    pub icon_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl WindowRecord {
    pub fn new(owner: OwnerId, slot: WindowSlot, kind: RecordKind) -> Self {
        let now = Utc::now();
        Self {
            owner,
            slot,
            kind,
            title: None,
            bounds: None,
            image: None,
            image_captured_at: None,
            ax: None,
            is_minimized: false,
            is_hidden: false,
            is_fullscreen: false,
            space_membership: BTreeSet::new(),
            icon_ref: None,
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Placeholder standing in for an application that has no windows
    pub fn windowless(owner: &OwnerInfo) -> Self {
        let mut record = Self::new(
            owner.pid,
            WindowSlot::Windowless,
            RecordKind::WindowlessPlaceholder,
        );
        record.title = Some(owner.display_name.clone());
        record.icon_ref = owner.icon_ref.clone();
        record.is_hidden = owner.is_hidden;
        record
    }

    pub fn key(&self) -> WindowKey {
        WindowKey {
            owner: self.owner,
            slot: self.slot,
        }
    }

    pub fn window_id(&self) -> Option<WindowId> {
        self.slot.window_id()
    }

    pub fn is_windowless(&self) -> bool {
        self.slot == WindowSlot::Windowless
    }

    /// Attach a freshly captured frame
    pub fn with_image(mut self, frame: Option<Frame>) -> Self {
        if let Some(frame) = frame {
            self.image = Some(frame);
            self.image_captured_at = Some(Utc::now());
        }
        self
    }

    /// Merge a freshly discovered version of this window into the cached one.
    ///
    /// Creation and access timestamps always survive. The cached image is kept
    /// when the fresh record has none (capture failed) or when the pixels are
    /// identical, so an unchanged system produces an unchanged record.
    pub fn absorb(&mut self, fresh: WindowRecord) {
        self.kind = fresh.kind;
        self.title = fresh.title;
        self.bounds = fresh.bounds.or(self.bounds);
        self.is_minimized = fresh.is_minimized;
        self.is_hidden = fresh.is_hidden;
        self.is_fullscreen = fresh.is_fullscreen;
        self.icon_ref = fresh.icon_ref;

        self.ax = match fresh.ax {
            Some(ax) => Some(ax),
            None => self.ax.take().map(AxRef::unreachable),
        };

        if !fresh.space_membership.is_empty() {
            self.space_membership = fresh.space_membership;
        }

        if let Some(frame) = fresh.image {
            let unchanged = self
                .image
                .as_ref()
                .is_some_and(|current| same_pixels(current, &frame));
            if !unchanged {
                self.image = Some(frame);
                self.image_captured_at = fresh.image_captured_at.or_else(|| Some(Utc::now()));
            }
        }
    }

    pub fn summary(&self) -> WindowSummary {
        WindowSummary {
            owner: self.owner,
            window_id: self.window_id(),
            kind: self.kind,
            title: self.title.clone(),
            bounds: self.bounds,
            has_image: self.image.is_some(),
            image_captured_at: self.image_captured_at,
            reachable: self.ax.as_ref().map(|ax| ax.reachable),
            is_minimized: self.is_minimized,
            is_hidden: self.is_hidden,
            is_fullscreen: self.is_fullscreen,
            spaces: self.space_membership.iter().copied().collect(),
        }
    }
}

impl PartialEq for WindowRecord {
    fn eq(&self, other: &Self) -> bool {
        let images_equal = match (&self.image, &other.image) {
            (Some(a), Some(b)) => same_pixels(a, b),
            (None, None) => true,
            _ => false,
        };

        images_equal
            && self.owner == other.owner
            && self.slot == other.slot
            && self.kind == other.kind
            && self.title == other.title
            && self.bounds == other.bounds
            && self.image_captured_at == other.image_captured_at
            && self.ax == other.ax
            && self.is_minimized == other.is_minimized
            && self.is_hidden == other.is_hidden
            && self.is_fullscreen == other.is_fullscreen
            && self.space_membership == other.space_membership
            && self.icon_ref == other.icon_ref
            && self.created_at == other.created_at
            && self.last_accessed_at == other.last_accessed_at
    }
}

fn same_pixels(a: &Frame, b: &Frame) -> bool {
    Arc::ptr_eq(a, b) || a.as_ref() == b.as_ref()
}

/// Serializable projection of a record for logs and the daemon's output
#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub owner: OwnerId,
    pub window_id: Option<WindowId>,
    pub kind: RecordKind,
    pub title: Option<String>,
    pub bounds: Option<WindowBounds>,
    pub has_image: bool,
    pub image_captured_at: Option<DateTime<Utc>>,
    pub reachable: Option<bool>,
    pub is_minimized: bool,
    pub is_hidden: bool,
    pub is_fullscreen: bool,
    pub spaces: Vec<SpaceId>,
}

/// Requested fidelity of a live capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    Medium,
    High,
    Native,
}

impl StreamQuality {
    /// Fraction of the native resolution to request
    pub fn scale(&self) -> f32 {
        match self {
            StreamQuality::Low => 0.25,
            StreamQuality::Medium => 0.5,
            StreamQuality::High => 0.75,
            StreamQuality::Native => 1.0,
        }
    }
}

/// How long a session lingers after it is no longer needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Never stop automatically
    Never,
    /// Stop right away
    Immediate,
    /// Stop after the grace period unless reopened first
    After(Duration),
}

impl KeepAlive {
    /// Negative means never, zero means immediately
    pub fn from_secs(seconds: f64) -> Self {
        if seconds < 0.0 || !seconds.is_finite() {
            KeepAlive::Never
        } else if seconds == 0.0 {
            KeepAlive::Immediate
        } else {
            KeepAlive::After(Duration::from_secs_f64(seconds))
        }
    }
}

/// Errors reported by the discovery and stream providers
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Capture permission unavailable")]
    PermissionUnavailable,

    #[error("Accessibility handle no longer resolves")]
    StaleHandle,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the live capture session state machine
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Session for window {window_id} cannot {action} while {state}")]
    InvalidState {
        window_id: WindowId,
        action: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Source(#[from] SourceError),
}
