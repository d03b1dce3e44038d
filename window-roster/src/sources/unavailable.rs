//! Providers for platforms or permission states where a source is missing.
//!
//! Discovery degrades around these instead of failing: a denied capture
//! permission looks exactly like [`NoCapture`].

use super::{
    AccessibilityHandle, AccessibilitySource, LiveFeed, PrimaryCaptureSource, SpaceSource,
    StreamProvider, VisibleWindow,
};
use crate::types::{Frame, OwnerId, SourceError, SpaceId, StreamQuality, WindowId};
use std::sync::Arc;

/// Capture permission denied or no capture backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

#[async_trait::async_trait]
impl PrimaryCaptureSource for NoCapture {
    async fn list_visible_windows(&self) -> Result<Vec<VisibleWindow>, SourceError> {
        Err(SourceError::PermissionUnavailable)
    }

    async fn capture_still(&self, _window_id: WindowId) -> Result<Option<Frame>, SourceError> {
        Err(SourceError::PermissionUnavailable)
    }
}

/// No accessibility backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccessibility;

#[async_trait::async_trait]
impl AccessibilitySource for NoAccessibility {
    async fn list_windows(
        &self,
        _owner: OwnerId,
    ) -> Result<Vec<Arc<dyn AccessibilityHandle>>, SourceError> {
        Err(SourceError::Unavailable("accessibility".to_string()))
    }
}

/// Space membership unknown everywhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpaces;

#[async_trait::async_trait]
impl SpaceSource for NoSpaces {
    async fn current_workspace_ids(&self) -> Result<Vec<SpaceId>, SourceError> {
        Ok(Vec::new())
    }

    async fn workspaces_containing(&self, _window_id: WindowId) -> Result<Vec<SpaceId>, SourceError> {
        Ok(Vec::new())
    }
}

/// No live streaming backend
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStreams;

#[async_trait::async_trait]
impl StreamProvider for NoStreams {
    async fn open(
        &self,
        _window_id: WindowId,
        _quality: StreamQuality,
        _frame_rate: u32,
    ) -> Result<LiveFeed, SourceError> {
        Err(SourceError::Unavailable("live capture".to_string()))
    }
}
