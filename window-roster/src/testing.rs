//! In-memory fakes of every discovery and stream provider, shared by the unit
//! tests of the reconciler, the purifier and the live-capture pool.

use crate::reconciler::DiscoverySources;
use crate::sources::{
    AccessibilityHandle, AccessibilitySource, FeedHandle, LiveFeed, OwnerSource,
    PrimaryCaptureSource, ServerWindow, SpaceSource, StreamProvider, VisibleWindow,
    WindowServerSource, NORMAL_WINDOW_LAYER,
};
use crate::types::{
    Frame, OwnerId, OwnerInfo, SourceError, SpaceId, StreamQuality, WindowBounds, WindowId,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Solid colour frame, so equal shades compare equal pixel for pixel
pub fn solid_frame(shade: u8) -> Frame {
    Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        8,
        6,
        Rgba([shade, shade, shade, 255]),
    )))
}

#[derive(Debug, Clone)]
struct HandleState {
    window_id: Option<WindowId>,
    title: Option<String>,
    bounds: Option<WindowBounds>,
    minimized: bool,
    fullscreen: bool,
    closable: bool,
}

/// Accessibility handle whose attributes tests can change under it
#[derive(Debug)]
pub struct FakeHandle {
    token: u64,
    valid: AtomicBool,
    state: Mutex<HandleState>,
}

impl FakeHandle {
    /// Handle that is not registered with any [`FakeSystem`]
    pub fn detached(window_id: WindowId, title: Option<String>) -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            valid: AtomicBool::new(true),
            state: Mutex::new(HandleState {
                window_id: Some(window_id),
                title,
                bounds: None,
                minimized: false,
                fullscreen: false,
                closable: true,
            }),
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut HandleState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn read<T>(&self, f: impl FnOnce(&HandleState) -> T) -> Result<T, SourceError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(SourceError::StaleHandle);
        }
        Ok(f(&self.state.lock().unwrap()))
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Stop exposing the window id, forcing fuzzy matching
    pub fn hide_window_id(&self) {
        self.with_state(|s| s.window_id = None);
    }

    pub fn set_title(&self, title: Option<&str>) {
        self.with_state(|s| s.title = title.map(str::to_string));
    }

    pub fn set_bounds(&self, bounds: Option<WindowBounds>) {
        self.with_state(|s| s.bounds = bounds);
    }

    pub fn set_minimized(&self, minimized: bool) {
        self.with_state(|s| s.minimized = minimized);
    }

    pub fn set_closable(&self, closable: bool) {
        self.with_state(|s| s.closable = closable);
    }
}

impl AccessibilityHandle for FakeHandle {
    fn token(&self) -> u64 {
        self.token
    }

    fn window_id(&self) -> Result<Option<WindowId>, SourceError> {
        self.read(|s| s.window_id)
    }

    fn title(&self) -> Result<Option<String>, SourceError> {
        self.read(|s| s.title.clone())
    }

    fn is_minimized(&self) -> Result<bool, SourceError> {
        self.read(|s| s.minimized)
    }

    fn is_fullscreen(&self) -> Result<bool, SourceError> {
        self.read(|s| s.fullscreen)
    }

    fn bounds(&self) -> Result<Option<WindowBounds>, SourceError> {
        self.read(|s| s.bounds)
    }

    fn has_close_control(&self) -> Result<bool, SourceError> {
        self.read(|s| s.closable)
    }
}

#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub id: WindowId,
    pub owner: OwnerId,
    pub title: Option<String>,
    pub bounds: WindowBounds,
    pub layer: i32,
    /// Visible to the primary capture source
    pub on_screen: bool,
    /// Listed by the owner's accessibility tree
    pub in_accessibility: bool,
    pub spaces: Vec<SpaceId>,
    pub shade: u8,
    pub handle: Arc<FakeHandle>,
}

#[derive(Debug)]
struct SystemState {
    owners: BTreeMap<OwnerId, OwnerInfo>,
    windows: BTreeMap<WindowId, FakeWindow>,
    capture_permitted: bool,
    accessibility_available: bool,
    window_server_available: bool,
    capture_delay: Duration,
    in_flight: usize,
    max_in_flight: usize,
}

/// A whole fake desktop: applications, windows, spaces and permissions
#[derive(Debug)]
pub struct FakeSystem {
    state: Mutex<SystemState>,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SystemState {
                owners: BTreeMap::new(),
                windows: BTreeMap::new(),
                capture_permitted: true,
                accessibility_available: true,
                window_server_available: true,
                capture_delay: Duration::ZERO,
                in_flight: 0,
                max_in_flight: 0,
            }),
        })
    }

    /// Every source this system provides, ready for a reconciler
    pub fn sources(self: &Arc<Self>) -> DiscoverySources {
        DiscoverySources {
            primary: self.clone(),
            accessibility: self.clone(),
            window_server: self.clone(),
            spaces: self.clone(),
            owners: self.clone(),
        }
    }

    pub fn add_owner(&self, pid: OwnerId, name: &str) -> OwnerInfo {
        let mut info = OwnerInfo::new(pid, name);
        info.bundle_id = Some(format!("com.example.{}", name.to_lowercase()));
        self.add_owner_info(info.clone());
        info
    }

    pub fn add_owner_info(&self, info: OwnerInfo) {
        self.state.lock().unwrap().owners.insert(info.pid, info);
    }

    /// Quit an application, taking its windows with it
    pub fn terminate(&self, pid: OwnerId) {
        let mut state = self.state.lock().unwrap();
        state.owners.remove(&pid);
        state.windows.retain(|_, window| {
            if window.owner == pid {
                window.handle.invalidate();
            }
            window.owner != pid
        });
    }

    /// Open an ordinary visible window on space 1
    pub fn add_window(
        &self,
        owner: OwnerId,
        id: WindowId,
        title: &str,
        bounds: WindowBounds,
    ) -> Arc<FakeHandle> {
        let handle = Arc::new(FakeHandle::detached(id, Some(title.to_string())));
        handle.set_bounds(Some(bounds));
        let window = FakeWindow {
            id,
            owner,
            title: Some(title.to_string()),
            bounds,
            layer: NORMAL_WINDOW_LAYER,
            on_screen: true,
            in_accessibility: true,
            spaces: vec![1],
            shade: (id % 250) as u8,
            handle: handle.clone(),
        };
        self.state.lock().unwrap().windows.insert(id, window);
        handle
    }

    pub fn update_window(&self, id: WindowId, f: impl FnOnce(&mut FakeWindow)) {
        if let Some(window) = self.state.lock().unwrap().windows.get_mut(&id) {
            f(window);
        }
    }

    pub fn minimize(&self, id: WindowId) {
        self.update_window(id, |window| {
            window.on_screen = false;
            window.handle.set_minimized(true);
        });
    }

    pub fn restore(&self, id: WindowId) {
        self.update_window(id, |window| {
            window.on_screen = true;
            window.handle.set_minimized(false);
        });
    }

    /// The user switched away from the window's space
    pub fn move_to_space(&self, id: WindowId, space: SpaceId) {
        self.update_window(id, |window| {
            window.on_screen = false;
            window.in_accessibility = false;
            window.spaces = vec![space];
        });
    }

    pub fn close_window(&self, id: WindowId) {
        if let Some(window) = self.state.lock().unwrap().windows.remove(&id) {
            window.handle.invalidate();
        }
    }

    pub fn set_capture_permitted(&self, permitted: bool) {
        self.state.lock().unwrap().capture_permitted = permitted;
    }

    pub fn set_accessibility_available(&self, available: bool) {
        self.state.lock().unwrap().accessibility_available = available;
    }

    pub fn set_window_server_available(&self, available: bool) {
        self.state.lock().unwrap().window_server_available = available;
    }

    pub fn set_capture_delay(&self, delay: Duration) {
        self.state.lock().unwrap().capture_delay = delay;
    }

    /// Highest number of captures that were ever in flight at once
    pub fn max_concurrent_captures(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    async fn capture(&self, window_id: WindowId) -> Option<Frame> {
        let (shade, delay) = {
            let mut state = self.state.lock().unwrap();
            let shade = state.windows.get(&window_id).map(|w| w.shade)?;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (shade, state.capture_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
        Some(solid_frame(shade))
    }
}

#[async_trait::async_trait]
impl PrimaryCaptureSource for FakeSystem {
    async fn list_visible_windows(&self) -> Result<Vec<VisibleWindow>, SourceError> {
        let state = self.state.lock().unwrap();
        if !state.capture_permitted {
            return Err(SourceError::PermissionUnavailable);
        }
        Ok(state
            .windows
            .values()
            .filter(|w| w.on_screen)
            .map(|w| VisibleWindow {
                id: w.id,
                owner: w.owner,
                title: w.title.clone(),
                bounds: w.bounds,
            })
            .collect())
    }

    async fn capture_still(&self, window_id: WindowId) -> Result<Option<Frame>, SourceError> {
        let permitted = self.state.lock().unwrap().capture_permitted;
        if !permitted {
            return Err(SourceError::PermissionUnavailable);
        }
        Ok(self.capture(window_id).await)
    }
}

#[async_trait::async_trait]
impl AccessibilitySource for FakeSystem {
    async fn list_windows(
        &self,
        owner: OwnerId,
    ) -> Result<Vec<Arc<dyn AccessibilityHandle>>, SourceError> {
        let state = self.state.lock().unwrap();
        if !state.accessibility_available {
            return Err(SourceError::Unavailable("accessibility disabled".to_string()));
        }
        Ok(state
            .windows
            .values()
            .filter(|w| w.owner == owner && w.in_accessibility)
            .map(|w| w.handle.clone() as Arc<dyn AccessibilityHandle>)
            .collect())
    }
}

#[async_trait::async_trait]
impl WindowServerSource for FakeSystem {
    async fn list_all_window_ids(
        &self,
        include_invisible: bool,
    ) -> Result<Vec<WindowId>, SourceError> {
        let state = self.state.lock().unwrap();
        if !state.window_server_available {
            return Err(SourceError::Unavailable("window server unreachable".to_string()));
        }
        Ok(state
            .windows
            .values()
            .filter(|w| include_invisible || w.on_screen)
            .map(|w| w.id)
            .collect())
    }

    async fn metadata(&self, window_id: WindowId) -> Option<ServerWindow> {
        let state = self.state.lock().unwrap();
        state.windows.get(&window_id).map(|w| ServerWindow {
            id: w.id,
            owner: w.owner,
            title: w.title.clone(),
            bounds: w.bounds,
            layer: w.layer,
        })
    }

    async fn capture_still(&self, window_id: WindowId) -> Result<Option<Frame>, SourceError> {
        Ok(self.capture(window_id).await)
    }
}

#[async_trait::async_trait]
impl SpaceSource for FakeSystem {
    async fn current_workspace_ids(&self) -> Result<Vec<SpaceId>, SourceError> {
        Ok(vec![1])
    }

    async fn workspaces_containing(&self, window_id: WindowId) -> Result<Vec<SpaceId>, SourceError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .windows
            .get(&window_id)
            .map(|w| w.spaces.clone())
            .unwrap_or_default())
    }
}

impl OwnerSource for FakeSystem {
    fn running_owners(&self) -> Vec<OwnerInfo> {
        self.state.lock().unwrap().owners.values().cloned().collect()
    }

    fn owner(&self, pid: OwnerId) -> Option<OwnerInfo> {
        self.state.lock().unwrap().owners.get(&pid).cloned()
    }
}

#[derive(Debug, Default)]
struct StreamsState {
    open_delay: Duration,
    fail_opens: bool,
    opened: usize,
    senders: HashMap<WindowId, mpsc::Sender<Frame>>,
}

/// Stream provider whose feeds are driven by the test
#[derive(Debug, Default)]
pub struct FakeStreams {
    state: Mutex<StreamsState>,
    closed: Arc<AtomicUsize>,
}

impl FakeStreams {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().unwrap().open_delay = delay;
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.state.lock().unwrap().fail_opens = fail;
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver a frame on the most recently opened feed of a window
    pub fn push_frame(&self, window_id: WindowId, frame: Frame) -> bool {
        let sender = self.state.lock().unwrap().senders.get(&window_id).cloned();
        sender.is_some_and(|tx| tx.try_send(frame).is_ok())
    }
}

#[derive(Debug)]
struct FakeFeed {
    closed_total: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait::async_trait]
impl FeedHandle for FakeFeed {
    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closed_total.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl StreamProvider for FakeStreams {
    async fn open(
        &self,
        window_id: WindowId,
        _quality: StreamQuality,
        _frame_rate: u32,
    ) -> Result<LiveFeed, SourceError> {
        let (delay, fail) = {
            let state = self.state.lock().unwrap();
            (state.open_delay, state.fail_opens)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(SourceError::CaptureFailed(format!(
                "window {} refused to stream",
                window_id
            )));
        }

        let (tx, rx) = mpsc::channel(8);
        let mut state = self.state.lock().unwrap();
        state.opened += 1;
        state.senders.insert(window_id, tx);
        Ok(LiveFeed {
            frames: rx,
            handle: Box::new(FakeFeed {
                closed_total: self.closed.clone(),
                closed: false,
            }),
        })
    }
}
