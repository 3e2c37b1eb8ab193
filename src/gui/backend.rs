//! Platform seams for the GUI-automation core
//!
//! Window discovery, accessibility walks, synthetic input, clipboard, and
//! screen capture go through these traits so the scoring, validation, and
//! state-machine logic stays portable. Production agents install the Win32
//! backends; tests drive a [`SimulatedDesktop`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuiError;

/// Screen-space rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Creates a rect from edges
    #[must_use]
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Width in pixels (zero when degenerate)
    #[must_use]
    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    /// Height in pixels (zero when degenerate)
    #[must_use]
    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    /// Center point
    #[must_use]
    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width() / 2,
            y: self.top + self.height() / 2,
        }
    }

    /// True when `point` lies inside the rect
    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    /// Intersection-over-union with another rect
    #[must_use]
    pub fn iou(&self, other: &Rect) -> f64 {
        let ix = (self.right.min(other.right) - self.left.max(other.left)).max(0) as f64;
        let iy = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0) as f64;
        let intersection = ix * iy;
        let union = (self.width() as f64 * self.height() as f64)
            + (other.width() as f64 * other.height() as f64)
            - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Screen-space point in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    /// Creates a point
    #[must_use]
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    #[must_use]
    pub fn distance(&self, other: Point) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        dx.hypot(dy)
    }
}

/// Window placement as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementState {
    Normal,
    Minimized,
    Maximized,
}

/// One top-level window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub hwnd: u64,
    pub title: String,
    pub class_name: String,
    pub process_id: u32,
    pub process_name: String,
    pub rect: Rect,
    pub visible: bool,
    pub enabled: bool,
    pub placement_state: PlacementState,
}

/// Raw accessibility node as produced by a backend walk
///
/// Children are in sibling order; stable keying and depth markers are applied
/// by the portable tree builder.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawUiaNode {
    pub control_type: String,
    pub name: String,
    pub automation_id: String,
    pub class_name: String,
    pub is_enabled: bool,
    pub is_visible: bool,
    pub is_keyboard_focusable: bool,
    pub rect: Rect,
    pub value: Option<String>,
    pub texts: Vec<String>,
    pub children: Vec<RawUiaNode>,
    /// Set when this subtree could not be read; children are empty
    pub error: Option<String>,
}

/// Named key chords the input synthesizer can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chord {
    Enter,
    ShiftEnter,
    SelectAll,
    Copy,
    Paste,
    Delete,
    Escape,
    Tab,
}

/// Window discovery and activation
pub trait WindowSystem: Send + Sync {
    /// Enumerates top-level windows; hidden ones included on request
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when enumeration fails.
    fn list_windows(&self, include_hidden: bool) -> Result<Vec<WindowRecord>, GuiError>;

    /// Brings a window to the foreground, restoring it if minimized
    ///
    /// # Errors
    ///
    /// Returns `GuiError::WindowNotFound` for a stale handle.
    fn activate(&self, hwnd: u64) -> Result<(), GuiError>;

    /// Current value of the focused element in the given window
    ///
    /// # Errors
    ///
    /// Returns an error when the window or its focused element is gone.
    fn focused_element_value(&self, hwnd: u64) -> Result<String, GuiError>;
}

/// Accessibility-tree extraction
pub trait AccessibilityTree: Send + Sync {
    /// Walks the tree rooted at `hwnd`, bounded by `max_depth`
    ///
    /// # Errors
    ///
    /// Returns `GuiError::TreeUnavailable` when the root cannot be read;
    /// unreadable subtrees below the root become error-marked nodes instead.
    fn walk(&self, hwnd: u64, max_depth: usize) -> Result<RawUiaNode, GuiError>;
}

/// Synthetic keyboard and mouse input
pub trait InputSynthesizer: Send + Sync {
    /// Types text with per-character pacing; newlines become shift+enter
    /// when `newline_as_shift_enter` is set
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when the OS rejects the injection.
    fn type_text(
        &self,
        text: &str,
        pacing: Duration,
        newline_as_shift_enter: bool,
    ) -> Result<(), GuiError>;

    /// Emits a named chord
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when the OS rejects the injection.
    fn key_chord(&self, chord: Chord) -> Result<(), GuiError>;

    /// Clicks the primary button at a screen coordinate
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when the OS rejects the injection.
    fn click(&self, point: Point) -> Result<(), GuiError>;
}

/// OS clipboard round-trips
pub trait ClipboardAccess: Send + Sync {
    /// Reads clipboard text
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Clipboard` when the clipboard is unavailable.
    fn get_text(&self) -> Result<String, GuiError>;

    /// Writes clipboard text
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Clipboard` when the clipboard is unavailable.
    fn set_text(&self, text: &str) -> Result<(), GuiError>;
}

/// Screen capture, producing encoded PNG bytes
pub trait ScreenCapture: Send + Sync {
    /// Captures the whole desktop
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Capture` on failure.
    fn capture_desktop(&self) -> Result<CapturedImage, GuiError>;

    /// Captures a screen region
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Capture` on failure.
    fn capture_region(&self, region: Rect) -> Result<CapturedImage, GuiError>;
}

/// An encoded capture
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub use simulated::SimulatedDesktop;

/// A scripted in-memory desktop implementing every backend trait
///
/// Models exactly enough editing semantics for the send-text state machine:
/// a focused element whose value keystrokes append to, select-all/delete
/// clearing, and select-all/copy mirroring the value into the clipboard.
pub mod simulated {
    use super::{
        CapturedImage, Chord, ClipboardAccess, InputSynthesizer, Point, RawUiaNode, Rect,
        ScreenCapture, WindowRecord, WindowSystem,
    };
    use crate::error::GuiError;
    use crate::gui::backend::AccessibilityTree;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct DesktopState {
        windows: Vec<WindowRecord>,
        trees: HashMap<u64, RawUiaNode>,
        foreground: Option<u64>,
        focused_value: String,
        selection_active: bool,
        clipboard: String,
        clicks: Vec<Point>,
        chords: Vec<Chord>,
        /// When set, typed characters are silently dropped (blocked-keystroke
        /// scenario; the clipboard path still works)
        drop_keystrokes: bool,
        /// When set, paste chords are swallowed too
        drop_paste: bool,
        captures: u32,
    }

    /// Scripted desktop; all trait methods operate on shared interior state
    #[derive(Debug, Default)]
    pub struct SimulatedDesktop {
        state: Mutex<DesktopState>,
    }

    impl SimulatedDesktop {
        /// Creates an empty desktop
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Installs the window list
        pub fn set_windows(&self, windows: Vec<WindowRecord>) {
            self.state.lock().unwrap().windows = windows;
        }

        /// Installs an accessibility tree for a window
        pub fn set_tree(&self, hwnd: u64, tree: RawUiaNode) {
            self.state.lock().unwrap().trees.insert(hwnd, tree);
        }

        /// Pre-loads the focused element's value
        pub fn set_focused_value(&self, value: impl Into<String>) {
            self.state.lock().unwrap().focused_value = value.into();
        }

        /// Makes `type_text` drop keystrokes, forcing the clipboard fallback
        pub fn block_keystrokes(&self, blocked: bool) {
            self.state.lock().unwrap().drop_keystrokes = blocked;
        }

        /// Makes paste chords no-ops, so both write paths fail
        pub fn block_paste(&self, blocked: bool) {
            self.state.lock().unwrap().drop_paste = blocked;
        }

        /// The value currently sitting in the focused element
        #[must_use]
        pub fn focused_value(&self) -> String {
            self.state.lock().unwrap().focused_value.clone()
        }

        /// Every click emitted so far
        #[must_use]
        pub fn clicks(&self) -> Vec<Point> {
            self.state.lock().unwrap().clicks.clone()
        }

        /// Every chord emitted so far
        #[must_use]
        pub fn chords(&self) -> Vec<Chord> {
            self.state.lock().unwrap().chords.clone()
        }

        /// The window last brought to the foreground
        #[must_use]
        pub fn foreground(&self) -> Option<u64> {
            self.state.lock().unwrap().foreground
        }

        /// Number of captures taken
        #[must_use]
        pub fn capture_count(&self) -> u32 {
            self.state.lock().unwrap().captures
        }
    }

    impl WindowSystem for SimulatedDesktop {
        fn list_windows(&self, include_hidden: bool) -> Result<Vec<WindowRecord>, GuiError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .windows
                .iter()
                .filter(|w| include_hidden || w.visible)
                .cloned()
                .collect())
        }

        fn activate(&self, hwnd: u64) -> Result<(), GuiError> {
            let mut state = self.state.lock().unwrap();
            if !state.windows.iter().any(|w| w.hwnd == hwnd) {
                return Err(GuiError::WindowNotFound(hwnd));
            }
            for window in &mut state.windows {
                if window.hwnd == hwnd {
                    window.placement_state = super::PlacementState::Normal;
                }
            }
            state.foreground = Some(hwnd);
            Ok(())
        }

        fn focused_element_value(&self, hwnd: u64) -> Result<String, GuiError> {
            let state = self.state.lock().unwrap();
            if !state.windows.iter().any(|w| w.hwnd == hwnd) {
                return Err(GuiError::WindowNotFound(hwnd));
            }
            Ok(state.focused_value.clone())
        }
    }

    impl AccessibilityTree for SimulatedDesktop {
        fn walk(&self, hwnd: u64, _max_depth: usize) -> Result<RawUiaNode, GuiError> {
            let state = self.state.lock().unwrap();
            state
                .trees
                .get(&hwnd)
                .cloned()
                .ok_or(GuiError::TreeUnavailable {
                    reason: format!("no tree for window {hwnd}"),
                })
        }
    }

    impl InputSynthesizer for SimulatedDesktop {
        fn type_text(
            &self,
            text: &str,
            _pacing: Duration,
            _newline_as_shift_enter: bool,
        ) -> Result<(), GuiError> {
            let mut state = self.state.lock().unwrap();
            if state.drop_keystrokes {
                return Ok(());
            }
            if state.selection_active {
                state.focused_value.clear();
                state.selection_active = false;
            }
            state.focused_value.push_str(text);
            Ok(())
        }

        fn key_chord(&self, chord: Chord) -> Result<(), GuiError> {
            let mut state = self.state.lock().unwrap();
            state.chords.push(chord);
            match chord {
                Chord::SelectAll => state.selection_active = true,
                Chord::Delete => {
                    if state.selection_active {
                        state.focused_value.clear();
                        state.selection_active = false;
                    }
                }
                Chord::Copy => {
                    if state.selection_active {
                        state.clipboard = state.focused_value.clone();
                        state.selection_active = false;
                    }
                }
                Chord::Paste => {
                    if !state.drop_paste {
                        if state.selection_active {
                            state.focused_value.clear();
                            state.selection_active = false;
                        }
                        let pasted = state.clipboard.clone();
                        state.focused_value.push_str(&pasted);
                    }
                }
                Chord::Enter | Chord::ShiftEnter | Chord::Escape | Chord::Tab => {}
            }
            Ok(())
        }

        fn click(&self, point: Point) -> Result<(), GuiError> {
            self.state.lock().unwrap().clicks.push(point);
            Ok(())
        }
    }

    impl ClipboardAccess for SimulatedDesktop {
        fn get_text(&self) -> Result<String, GuiError> {
            Ok(self.state.lock().unwrap().clipboard.clone())
        }

        fn set_text(&self, text: &str) -> Result<(), GuiError> {
            self.state.lock().unwrap().clipboard = text.to_string();
            Ok(())
        }
    }

    impl ScreenCapture for SimulatedDesktop {
        fn capture_desktop(&self) -> Result<CapturedImage, GuiError> {
            let mut state = self.state.lock().unwrap();
            state.captures += 1;
            Ok(CapturedImage {
                png: vec![0x89, b'P', b'N', b'G'],
                width: 1920,
                height: 1080,
            })
        }

        fn capture_region(&self, region: Rect) -> Result<CapturedImage, GuiError> {
            let mut state = self.state.lock().unwrap();
            state.captures += 1;
            Ok(CapturedImage {
                png: vec![0x89, b'P', b'N', b'G'],
                width: region.width().max(0) as u32,
                height: region.height().max(0) as u32,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_geometry() {
        let r = Rect::new(0, 0, 100, 50);
        assert_eq!(r.width(), 100);
        assert_eq!(r.height(), 50);
        assert_eq!(r.center(), Point::new(50, 25));
        assert!(r.contains(Point::new(0, 0)));
        assert!(!r.contains(Point::new(100, 25)));
    }

    #[test]
    fn iou_of_identical_rects_is_one() {
        let r = Rect::new(10, 10, 60, 40);
        assert!((r.iou(&r) - 1.0).abs() < 1e-9);
        let disjoint = Rect::new(100, 100, 120, 120);
        assert_eq!(r.iou(&disjoint), 0.0);
    }

    #[test]
    fn simulated_select_all_copy_reads_back_the_value() {
        let desktop = SimulatedDesktop::new();
        desktop
            .type_text("hello", Duration::ZERO, true)
            .unwrap();
        desktop.key_chord(Chord::SelectAll).unwrap();
        desktop.key_chord(Chord::Copy).unwrap();
        assert_eq!(desktop.get_text().unwrap(), "hello");
    }

    #[test]
    fn simulated_paste_replaces_selection() {
        let desktop = SimulatedDesktop::new();
        desktop.set_focused_value("old text");
        desktop.set_text("new text").unwrap();
        desktop.key_chord(Chord::SelectAll).unwrap();
        desktop.key_chord(Chord::Paste).unwrap();
        assert_eq!(desktop.focused_value(), "new text");
    }

    #[test]
    fn blocked_keystrokes_leave_the_value_untouched() {
        let desktop = SimulatedDesktop::new();
        desktop.block_keystrokes(true);
        desktop.type_text("ignored", Duration::ZERO, true).unwrap();
        assert_eq!(desktop.focused_value(), "");
    }
}
