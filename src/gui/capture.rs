//! Screenshot capture and encoding for the wire
//!
//! Captures either the full desktop, a window's bounding rect, or an
//! arbitrary region, returning PNG bytes plus the base64 form handlers put
//! in envelopes.

use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::GuiError;
use crate::gui::backend::{CapturedImage, Rect, ScreenCapture};
use crate::gui::windows::WindowManager;

/// A capture result ready for an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotPayload {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub image_base64: String,
}

impl ScreenshotPayload {
    fn from_image(image: &CapturedImage) -> Self {
        Self {
            width: image.width,
            height: image.height,
            format: "png".to_string(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(&image.png),
        }
    }
}

/// Capture facade over a [`ScreenCapture`] backend
pub struct CaptureService {
    backend: Arc<dyn ScreenCapture>,
    windows: Arc<WindowManager>,
}

impl CaptureService {
    /// Creates the service
    #[must_use]
    pub fn new(backend: Arc<dyn ScreenCapture>, windows: Arc<WindowManager>) -> Self {
        Self { backend, windows }
    }

    /// Captures the desktop, or a window's bounding rect when `hwnd` is given
    ///
    /// # Errors
    ///
    /// Returns `WindowNotFound` for stale handles and `Capture` on backend
    /// failure.
    pub fn screenshot(&self, hwnd: Option<u64>) -> Result<ScreenshotPayload, GuiError> {
        let image = match hwnd {
            None => self.backend.capture_desktop()?,
            Some(hwnd) => {
                let window = self.windows.lookup(hwnd)?;
                self.backend.capture_region(window.rect)?
            }
        };
        Ok(ScreenshotPayload::from_image(&image))
    }

    /// Captures an arbitrary screen region
    ///
    /// # Errors
    ///
    /// Returns `Capture` for degenerate regions or backend failure.
    pub fn capture_region(&self, region: Rect) -> Result<ScreenshotPayload, GuiError> {
        if region.width() <= 0 || region.height() <= 0 {
            return Err(GuiError::Capture {
                reason: format!(
                    "degenerate region {}x{}",
                    region.width(),
                    region.height()
                ),
            });
        }
        let image = self.backend.capture_region(region)?;
        Ok(ScreenshotPayload::from_image(&image))
    }

    /// Raw PNG bytes of a region, for OCR handoff
    ///
    /// # Errors
    ///
    /// Propagates backend failure.
    pub fn region_png(&self, region: Rect) -> Result<Vec<u8>, GuiError> {
        Ok(self.backend.capture_region(region)?.png)
    }

    /// Raw PNG bytes of a window, for OCR-backed validation
    ///
    /// # Errors
    ///
    /// Propagates lookup or backend failure.
    pub fn window_png(&self, hwnd: u64) -> Result<Vec<u8>, GuiError> {
        let window = self.windows.lookup(hwnd)?;
        Ok(self.backend.capture_region(window.rect)?.png)
    }
}
