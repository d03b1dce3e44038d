//! Window-server backend built on CoreGraphics window lists.
//!
//! Enumerates every window the window server knows about, on all spaces, and
//! captures stills through `CGWindowListCreateImage`, which works regardless
//! of which space the window lives on. Also derives the set of running
//! applications from window ownership; an application that closed its last
//! window keeps counting as running for as long as its process is alive.

use super::{OwnerSource, ServerWindow, WindowServerSource};
use crate::types::{Frame, OwnerId, OwnerInfo, SourceError, WindowBounds, WindowId};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{Pid as SysinfoPid, ProcessesToUpdate, System};
use tracing::{debug, trace};

/// How long one owner listing answers `owner()` lookups
const OWNER_LISTING_TTL: Duration = Duration::from_millis(500);

/// Which windows a list query should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListScope {
    OnScreen,
    All,
    Single(WindowId),
}

/// One raw entry of the window server's list
#[derive(Debug, Clone)]
struct RawWindow {
    id: WindowId,
    owner: OwnerId,
    owner_name: String,
    title: Option<String>,
    bounds: WindowBounds,
    layer: i32,
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use core_foundation::array::CFArray;
    use core_foundation::base::{CFType, TCFType};
    use core_foundation::dictionary::CFDictionary;
    use core_foundation::number::CFNumber;
    use core_foundation::string::CFString;
    use core_graphics::geometry::{CGPoint, CGRect, CGSize};
    use core_graphics::image::CGImage;
    use core_graphics::window::{
        kCGNullWindowID, kCGWindowImageBestResolution, kCGWindowImageBoundsIgnoreFraming,
        kCGWindowListExcludeDesktopElements, kCGWindowListOptionAll,
        kCGWindowListOptionIncludingWindow, kCGWindowListOptionOnScreenOnly,
        CGWindowListCopyWindowInfo, CGWindowListCreateImage,
    };
    use foreign_types_shared::ForeignType;
    use image::RgbaImage;

    /// Query the window list. `None` when the window server refused.
    pub fn list_windows(scope: ListScope) -> Option<Vec<RawWindow>> {
        let (options, relative_to) = match scope {
            ListScope::OnScreen => (
                kCGWindowListOptionOnScreenOnly | kCGWindowListExcludeDesktopElements,
                kCGNullWindowID,
            ),
            ListScope::All => (
                kCGWindowListOptionAll | kCGWindowListExcludeDesktopElements,
                kCGNullWindowID,
            ),
            ListScope::Single(id) => (kCGWindowListOptionIncludingWindow, id),
        };

        let window_list: CFArray<CFDictionary<CFString, CFType>> = unsafe {
            let list_ref = CGWindowListCopyWindowInfo(options, relative_to);
            if list_ref.is_null() {
                return None;
            }
            CFArray::wrap_under_create_rule(list_ref)
        };

        let mut windows = Vec::new();
        for i in 0..window_list.len() {
            if let Some(dict) = window_list.get(i) {
                if let Some(window) = parse_window_dict(&dict) {
                    windows.push(window);
                }
            }
        }

        Some(windows)
    }

    fn parse_window_dict(dict: &CFDictionary<CFString, CFType>) -> Option<RawWindow> {
        let id = get_dict_number(dict, "kCGWindowNumber")? as WindowId;
        let owner = get_dict_number(dict, "kCGWindowOwnerPID")? as OwnerId;
        let layer = get_dict_number(dict, "kCGWindowLayer").unwrap_or(0) as i32;
        let bounds = get_window_bounds(dict)?;

        Some(RawWindow {
            id,
            owner,
            owner_name: get_dict_string(dict, "kCGWindowOwnerName").unwrap_or_default(),
            title: get_dict_string(dict, "kCGWindowName"),
            bounds,
            layer,
        })
    }

    fn get_dict_number(dict: &CFDictionary<CFString, CFType>, key: &str) -> Option<i64> {
        let cf_key = CFString::new(key);
        dict.find(&cf_key).and_then(|value| {
            if value.type_of() == CFNumber::type_id() {
                let num: CFNumber = unsafe {
                    CFNumber::wrap_under_get_rule(value.as_CFTypeRef() as *const _)
                };
                num.to_i64()
            } else {
                None
            }
        })
    }

    fn get_dict_number_f64(dict: &CFDictionary<CFString, CFType>, key: &str) -> Option<f64> {
        let cf_key = CFString::new(key);
        dict.find(&cf_key).and_then(|value| {
            if value.type_of() == CFNumber::type_id() {
                let num: CFNumber = unsafe {
                    CFNumber::wrap_under_get_rule(value.as_CFTypeRef() as *const _)
                };
                num.to_f64()
            } else {
                None
            }
        })
    }

    fn get_dict_string(dict: &CFDictionary<CFString, CFType>, key: &str) -> Option<String> {
        let cf_key = CFString::new(key);
        dict.find(&cf_key).and_then(|value| {
            if value.type_of() == CFString::type_id() {
                let s: CFString = unsafe {
                    CFString::wrap_under_get_rule(value.as_CFTypeRef() as *const _)
                };
                Some(s.to_string())
            } else {
                None
            }
        })
    }

    fn get_window_bounds(dict: &CFDictionary<CFString, CFType>) -> Option<WindowBounds> {
        let cf_key = CFString::new("kCGWindowBounds");
        let bounds_dict = dict.find(&cf_key)?;

        if bounds_dict.type_of() != CFDictionary::<CFString, CFType>::type_id() {
            return None;
        }

        let bounds: CFDictionary<CFString, CFType> = unsafe {
            CFDictionary::wrap_under_get_rule(bounds_dict.as_CFTypeRef() as *const _)
        };

        let x = get_dict_number_f64(&bounds, "X")? as i32;
        let y = get_dict_number_f64(&bounds, "Y")? as i32;
        let width = get_dict_number_f64(&bounds, "Width")? as u32;
        let height = get_dict_number_f64(&bounds, "Height")? as u32;

        Some(WindowBounds::new(x, y, width, height))
    }

    /// Capture a specific window by ID, on any space
    pub fn capture_window(window_id: WindowId, bounds: &WindowBounds) -> Option<RgbaImage> {
        let rect = CGRect::new(
            &CGPoint::new(bounds.x as f64, bounds.y as f64),
            &CGSize::new(bounds.width as f64, bounds.height as f64),
        );

        let options = kCGWindowImageBoundsIgnoreFraming | kCGWindowImageBestResolution;

        let cg_image: CGImage = unsafe {
            let image_ref = CGWindowListCreateImage(
                rect,
                kCGWindowListOptionIncludingWindow,
                window_id,
                options,
            );
            if image_ref.is_null() {
                return None;
            }
            CGImage::from_ptr(image_ref)
        };

        convert_cgimage_to_rgba(&cg_image)
    }

    /// Convert CGImage (BGRA) to image crate's RgbaImage
    fn convert_cgimage_to_rgba(cg_image: &CGImage) -> Option<RgbaImage> {
        let width = cg_image.width();
        let height = cg_image.height();
        let bytes_per_row = cg_image.bytes_per_row();
        let bytes_per_pixel = cg_image.bits_per_pixel() / 8;

        let data = cg_image.data();
        let bytes = data.bytes();

        if bytes.is_empty() || bytes_per_pixel < 4 {
            return None;
        }

        let mut rgba_data = Vec::with_capacity(width * height * 4);

        for y in 0..height {
            let row_start = y * bytes_per_row;
            for x in 0..width {
                let pixel_start = row_start + x * bytes_per_pixel;
                if pixel_start + 3 < bytes.len() {
                    let b = bytes[pixel_start];
                    let g = bytes[pixel_start + 1];
                    let r = bytes[pixel_start + 2];
                    let a = bytes[pixel_start + 3];
                    rgba_data.extend_from_slice(&[r, g, b, a]);
                }
            }
        }

        RgbaImage::from_raw(width as u32, height as u32, rgba_data)
    }
}

#[cfg(not(target_os = "macos"))]
mod macos {
    use super::*;
    use image::RgbaImage;

    pub fn list_windows(_scope: ListScope) -> Option<Vec<RawWindow>> {
        None
    }

    pub fn capture_window(_window_id: WindowId, _bounds: &WindowBounds) -> Option<RgbaImage> {
        None
    }
}

/// Owners seen in recent listings
#[derive(Debug, Default)]
struct OwnerTable {
    owners: BTreeMap<OwnerId, OwnerInfo>,
    refreshed_at: Option<Instant>,
}

impl OwnerTable {
    fn is_fresh(&self, now: Instant) -> bool {
        self.refreshed_at
            .is_some_and(|at| now.duration_since(at) < OWNER_LISTING_TTL)
    }

    /// Rebuild from a window listing. Owners with windows are running;
    /// previously known owners without windows are kept only while
    /// `launched_at` still finds their process.
    fn rebuild(
        &mut self,
        windows: &[RawWindow],
        now: Instant,
        mut launched_at: impl FnMut(OwnerId) -> Option<Option<DateTime<Utc>>>,
    ) {
        let mut owners: BTreeMap<OwnerId, OwnerInfo> = BTreeMap::new();
        for window in windows {
            owners.entry(window.owner).or_insert_with(|| {
                self.owners
                    .get(&window.owner)
                    .cloned()
                    .unwrap_or_else(|| OwnerInfo::new(window.owner, window.owner_name.clone()))
            });
        }

        for (pid, info) in std::mem::take(&mut self.owners) {
            if owners.contains_key(&pid) {
                continue;
            }
            if launched_at(pid).is_some() {
                trace!("Owner {} has no windows left but is still running", pid);
                owners.insert(pid, info);
            }
        }

        for info in owners.values_mut() {
            if info.launched_at.is_none() {
                info.launched_at = launched_at(info.pid).flatten();
            }
        }

        self.owners = owners;
        self.refreshed_at = Some(now);
    }
}

/// Window server backed by CoreGraphics. On other platforms every query
/// reports the source as unavailable.
#[derive(Debug)]
pub struct CoreGraphicsWindowServer {
    owners: Mutex<OwnerTable>,
    system: Mutex<System>,
}

impl Default for CoreGraphicsWindowServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreGraphicsWindowServer {
    pub fn new() -> Self {
        Self {
            owners: Mutex::new(OwnerTable::default()),
            system: Mutex::new(System::new()),
        }
    }

    fn list(&self, scope: ListScope) -> Result<Vec<RawWindow>, SourceError> {
        macos::list_windows(scope)
            .ok_or_else(|| SourceError::Unavailable("window server list".to_string()))
    }

    fn owner_table(&self) -> MutexGuard<'_, OwnerTable> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` when the process is gone, else its start time when known
    fn process_launched_at(&self, pid: OwnerId) -> Option<Option<DateTime<Utc>>> {
        let pid = SysinfoPid::from_u32(u32::try_from(pid).ok()?);
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid)?;
        Some(DateTime::from_timestamp(process.start_time() as i64, 0))
    }

    /// Re-list owners unless the last listing is still fresh
    fn refresh_owners(&self, force: bool) -> Result<MutexGuard<'_, OwnerTable>, SourceError> {
        let now = Instant::now();
        let mut table = self.owner_table();
        if force || !table.is_fresh(now) {
            let windows = self.list(ListScope::All)?;
            table.rebuild(&windows, now, |pid| self.process_launched_at(pid));
        }
        Ok(table)
    }
}

#[async_trait::async_trait]
impl WindowServerSource for CoreGraphicsWindowServer {
    async fn list_all_window_ids(
        &self,
        include_invisible: bool,
    ) -> Result<Vec<WindowId>, SourceError> {
        let scope = if include_invisible {
            ListScope::All
        } else {
            ListScope::OnScreen
        };
        let windows = self.list(scope)?;
        trace!("Window server reported {} windows", windows.len());
        Ok(windows.into_iter().map(|w| w.id).collect())
    }

    async fn metadata(&self, window_id: WindowId) -> Option<ServerWindow> {
        let windows = self.list(ListScope::Single(window_id)).ok()?;
        windows
            .into_iter()
            .find(|w| w.id == window_id)
            .map(|w| ServerWindow {
                id: w.id,
                owner: w.owner,
                title: w.title,
                bounds: w.bounds,
                layer: w.layer,
            })
    }

    async fn capture_still(&self, window_id: WindowId) -> Result<Option<Frame>, SourceError> {
        let Some(window) = self.metadata(window_id).await else {
            return Ok(None);
        };

        let start = std::time::Instant::now();
        let result = macos::capture_window(window_id, &window.bounds);

        match result {
            Some(image) => {
                trace!("Window {} captured in {:?}", window_id, start.elapsed());
                Ok(Some(Arc::new(DynamicImage::ImageRgba8(image))))
            }
            None => {
                debug!("Window {} not capturable through the window server", window_id);
                Err(SourceError::CaptureFailed(format!("window {}", window_id)))
            }
        }
    }
}

impl OwnerSource for CoreGraphicsWindowServer {
    fn running_owners(&self) -> Vec<OwnerInfo> {
        match self.refresh_owners(true) {
            Ok(table) => table.owners.values().cloned().collect(),
            Err(e) => {
                debug!("Cannot enumerate owners: {}", e);
                Vec::new()
            }
        }
    }

    /// Answered from the listing of the current pass when there is one
    fn owner(&self, pid: OwnerId) -> Option<OwnerInfo> {
        match self.refresh_owners(false) {
            Ok(table) => table.owners.get(&pid).cloned(),
            Err(e) => {
                debug!("Cannot look up owner {}: {}", pid, e);
                None
            }
        }
    }
}
