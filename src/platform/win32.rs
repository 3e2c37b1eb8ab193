//! Win32 / UIA backends
//!
//! Real-desktop implementations of the GUI trait seams: window enumeration
//! through `EnumWindows`, the accessibility walk through the UI Automation
//! COM surface, synthetic input through enigo, clipboard through arboard,
//! and capture through the screens API.

use std::sync::Mutex;
use std::time::Duration;

use arboard::Clipboard;
use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use screenshots::Screen;
use sysinfo::System;
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
};
use windows::Win32::UI::Accessibility::{
    CUIAutomation, IUIAutomation, IUIAutomationElement, IUIAutomationTreeWalker,
    IUIAutomationValuePattern, UIA_ValuePatternId,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClassNameW, GetWindowPlacement, GetWindowRect, GetWindowTextW,
    GetWindowThreadProcessId, IsWindowEnabled, IsWindowVisible, SetForegroundWindow, ShowWindow,
    SHOW_WINDOW_CMD, SW_RESTORE, SW_SHOWMAXIMIZED, SW_SHOWMINIMIZED, WINDOWPLACEMENT,
};

use crate::error::GuiError;
use crate::gui::backend::{
    AccessibilityTree, CapturedImage, Chord, ClipboardAccess, InputSynthesizer, PlacementState,
    Point, RawUiaNode, Rect, ScreenCapture, WindowRecord, WindowSystem,
};

fn os_err(context: &str, e: impl std::fmt::Display) -> GuiError {
    GuiError::Os {
        reason: format!("{context}: {e}"),
    }
}

fn to_rect(rect: RECT) -> Rect {
    Rect::new(rect.left, rect.top, rect.right, rect.bottom)
}

/// Window enumeration and activation over Win32
pub struct Win32WindowSystem {
    automation: UiaHandle,
}

impl Win32WindowSystem {
    /// Creates the backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            automation: UiaHandle::new(),
        }
    }
}

impl Default for Win32WindowSystem {
    fn default() -> Self {
        Self::new()
    }
}

struct EnumState {
    records: Vec<WindowRecord>,
    include_hidden: bool,
}

unsafe extern "system" fn enum_callback(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let state = &mut *(lparam.0 as *mut EnumState);
    let visible = IsWindowVisible(hwnd).as_bool();
    if !visible && !state.include_hidden {
        return BOOL(1);
    }

    let mut title_buf = [0u16; 512];
    let title_len = GetWindowTextW(hwnd, &mut title_buf);
    let title = String::from_utf16_lossy(&title_buf[..title_len.max(0) as usize]);

    let mut class_buf = [0u16; 256];
    let class_len = GetClassNameW(hwnd, &mut class_buf);
    let class_name = String::from_utf16_lossy(&class_buf[..class_len.max(0) as usize]);

    let mut process_id = 0u32;
    GetWindowThreadProcessId(hwnd, Some(&mut process_id));

    let mut rect = RECT::default();
    let _ = GetWindowRect(hwnd, &mut rect);

    let mut placement = WINDOWPLACEMENT {
        length: std::mem::size_of::<WINDOWPLACEMENT>() as u32,
        ..Default::default()
    };
    let _ = GetWindowPlacement(hwnd, &mut placement);
    let placement_state = match SHOW_WINDOW_CMD(placement.showCmd as i32) {
        SW_SHOWMINIMIZED => PlacementState::Minimized,
        SW_SHOWMAXIMIZED => PlacementState::Maximized,
        _ => PlacementState::Normal,
    };

    state.records.push(WindowRecord {
        hwnd: hwnd.0 as u64,
        title,
        class_name,
        process_id,
        process_name: String::new(),
        rect: to_rect(rect),
        visible,
        enabled: IsWindowEnabled(hwnd).as_bool(),
        placement_state,
    });
    BOOL(1)
}

impl WindowSystem for Win32WindowSystem {
    fn list_windows(&self, include_hidden: bool) -> Result<Vec<WindowRecord>, GuiError> {
        let mut state = EnumState {
            records: Vec::new(),
            include_hidden,
        };
        unsafe {
            EnumWindows(
                Some(enum_callback),
                LPARAM(&mut state as *mut EnumState as isize),
            )
            .map_err(|e| os_err("EnumWindows", e))?;
        }

        // Owning process names come from one system refresh, not per window
        let mut system = System::new();
        system.refresh_processes();
        for record in &mut state.records {
            if let Some(process) =
                system.process(sysinfo::Pid::from_u32(record.process_id))
            {
                record.process_name = process.name().to_string();
            }
        }
        Ok(state.records)
    }

    fn activate(&self, hwnd: u64) -> Result<(), GuiError> {
        let handle = HWND(hwnd as isize as *mut core::ffi::c_void);
        unsafe {
            let _ = ShowWindow(handle, SW_RESTORE);
            SetForegroundWindow(handle)
                .ok()
                .map_err(|e| os_err("SetForegroundWindow", e))?;
        }
        Ok(())
    }

    fn focused_element_value(&self, _hwnd: u64) -> Result<String, GuiError> {
        self.automation.with(|automation| {
            let element = unsafe { automation.GetFocusedElement() }
                .map_err(|e| os_err("GetFocusedElement", e))?;
            element_value(&element)
                .ok_or_else(|| GuiError::TreeUnavailable {
                    reason: "focused element exposes no value pattern".to_string(),
                })
        })
    }
}

/// Shared UIA automation entry, initialized on first use
struct UiaHandle {
    automation: Mutex<Option<IUIAutomation>>,
}

// The automation pointer is only used under the mutex
unsafe impl Send for UiaHandle {}
unsafe impl Sync for UiaHandle {}

impl UiaHandle {
    fn new() -> Self {
        Self {
            automation: Mutex::new(None),
        }
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&IUIAutomation) -> Result<T, GuiError>,
    ) -> Result<T, GuiError> {
        let mut guard = self.automation.lock().unwrap();
        if guard.is_none() {
            unsafe {
                // S_FALSE (already initialized) is fine
                let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
            }
            let automation: IUIAutomation =
                unsafe { CoCreateInstance(&CUIAutomation, None, CLSCTX_INPROC_SERVER) }
                    .map_err(|e| os_err("CoCreateInstance(CUIAutomation)", e))?;
            *guard = Some(automation);
        }
        f(guard.as_ref().expect("initialized above"))
    }
}

/// Accessibility-tree walks over UIA
pub struct Win32AccessibilityTree {
    automation: UiaHandle,
}

impl Win32AccessibilityTree {
    /// Creates the backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            automation: UiaHandle::new(),
        }
    }
}

impl Default for Win32AccessibilityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessibilityTree for Win32AccessibilityTree {
    fn walk(&self, hwnd: u64, max_depth: usize) -> Result<RawUiaNode, GuiError> {
        self.automation.with(|automation| {
            let handle = HWND(hwnd as isize as *mut core::ffi::c_void);
            let root = unsafe { automation.ElementFromHandle(handle) }.map_err(|e| {
                GuiError::TreeUnavailable {
                    reason: format!("ElementFromHandle: {e}"),
                }
            })?;
            let walker = unsafe { automation.ControlViewWalker() }.map_err(|e| {
                GuiError::TreeUnavailable {
                    reason: format!("ControlViewWalker: {e}"),
                }
            })?;
            Ok(walk_element(&walker, &root, 0, max_depth))
        })
    }
}

fn walk_element(
    walker: &IUIAutomationTreeWalker,
    element: &IUIAutomationElement,
    depth: usize,
    max_depth: usize,
) -> RawUiaNode {
    let mut node = read_element(element);
    if node.error.is_some() || depth >= max_depth {
        return node;
    }

    let mut child = unsafe { walker.GetFirstChildElement(element) }.ok();
    while let Some(current) = child {
        node.children
            .push(walk_element(walker, &current, depth + 1, max_depth));
        child = unsafe { walker.GetNextSiblingElement(&current) }.ok();
    }
    node
}

fn read_element(element: &IUIAutomationElement) -> RawUiaNode {
    let control_type = match unsafe { element.CurrentControlType() } {
        Ok(id) => control_type_name(id.0),
        Err(e) => {
            return RawUiaNode {
                error: Some(format!("unreadable element: {e}")),
                ..RawUiaNode::default()
            }
        }
    };

    let name = unsafe { element.CurrentName() }
        .map(|s| s.to_string())
        .unwrap_or_default();
    let automation_id = unsafe { element.CurrentAutomationId() }
        .map(|s| s.to_string())
        .unwrap_or_default();
    let class_name = unsafe { element.CurrentClassName() }
        .map(|s| s.to_string())
        .unwrap_or_default();
    let is_enabled = unsafe { element.CurrentIsEnabled() }
        .map(|b| b.as_bool())
        .unwrap_or(false);
    let is_offscreen = unsafe { element.CurrentIsOffscreen() }
        .map(|b| b.as_bool())
        .unwrap_or(false);
    let is_keyboard_focusable = unsafe { element.CurrentIsKeyboardFocusable() }
        .map(|b| b.as_bool())
        .unwrap_or(false);
    let rect = unsafe { element.CurrentBoundingRectangle() }
        .map(to_rect)
        .unwrap_or_default();

    let value = if control_type == "Edit" || control_type == "ComboBox" {
        element_value(element)
    } else {
        None
    };

    RawUiaNode {
        control_type,
        name,
        automation_id,
        class_name,
        is_enabled,
        is_visible: !is_offscreen,
        is_keyboard_focusable,
        rect,
        value,
        texts: Vec::new(),
        children: Vec::new(),
        error: None,
    }
}

fn element_value(element: &IUIAutomationElement) -> Option<String> {
    let pattern = unsafe { element.GetCurrentPattern(UIA_ValuePatternId) }.ok()?;
    let value_pattern: IUIAutomationValuePattern = pattern.cast().ok()?;
    unsafe { value_pattern.CurrentValue() }
        .ok()
        .map(|s| s.to_string())
}

fn control_type_name(id: i32) -> String {
    match id {
        50000 => "Button",
        50003 => "ComboBox",
        50004 => "Edit",
        50005 => "Hyperlink",
        50006 => "Image",
        50008 => "List",
        50007 => "ListItem",
        50011 => "MenuItem",
        50033 => "Pane",
        50020 => "Text",
        50019 => "Tab",
        50021 => "ToolBar",
        50023 => "Tree",
        50024 => "TreeItem",
        50026 => "Group",
        50030 => "Document",
        50032 => "Window",
        _ => return format!("ControlType{id}"),
    }
    .to_string()
}

/// Synthetic input over enigo
pub struct Win32Input {
    enigo: Mutex<Enigo>,
}

impl Win32Input {
    /// Creates the backend
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when the input subsystem is unavailable.
    pub fn new() -> Result<Self, GuiError> {
        let enigo = Enigo::new(&Settings::default()).map_err(|e| os_err("enigo init", e))?;
        Ok(Self {
            enigo: Mutex::new(enigo),
        })
    }
}

impl InputSynthesizer for Win32Input {
    fn type_text(
        &self,
        text: &str,
        pacing: Duration,
        newline_as_shift_enter: bool,
    ) -> Result<(), GuiError> {
        let mut enigo = self.enigo.lock().unwrap();
        for c in text.chars() {
            if c == '\n' && newline_as_shift_enter {
                enigo
                    .key(Key::Shift, Direction::Press)
                    .and_then(|()| enigo.key(Key::Return, Direction::Click))
                    .and_then(|()| enigo.key(Key::Shift, Direction::Release))
                    .map_err(|e| os_err("shift+enter", e))?;
            } else if c == '\r' {
                continue;
            } else {
                enigo
                    .text(&c.to_string())
                    .map_err(|e| os_err("keystroke", e))?;
            }
            if !pacing.is_zero() {
                std::thread::sleep(pacing);
            }
        }
        Ok(())
    }

    fn key_chord(&self, chord: Chord) -> Result<(), GuiError> {
        let mut enigo = self.enigo.lock().unwrap();
        let result = match chord {
            Chord::Enter => enigo.key(Key::Return, Direction::Click),
            Chord::ShiftEnter => enigo
                .key(Key::Shift, Direction::Press)
                .and_then(|()| enigo.key(Key::Return, Direction::Click))
                .and_then(|()| enigo.key(Key::Shift, Direction::Release)),
            Chord::SelectAll => control_combo(&mut enigo, 'a'),
            Chord::Copy => control_combo(&mut enigo, 'c'),
            Chord::Paste => control_combo(&mut enigo, 'v'),
            Chord::Delete => enigo.key(Key::Delete, Direction::Click),
            Chord::Escape => enigo.key(Key::Escape, Direction::Click),
            Chord::Tab => enigo.key(Key::Tab, Direction::Click),
        };
        result.map_err(|e| os_err("key chord", e))
    }

    fn click(&self, point: Point) -> Result<(), GuiError> {
        let mut enigo = self.enigo.lock().unwrap();
        enigo
            .move_mouse(point.x, point.y, Coordinate::Abs)
            .and_then(|()| enigo.button(Button::Left, Direction::Click))
            .map_err(|e| os_err("click", e))
    }
}

fn control_combo(enigo: &mut Enigo, key: char) -> Result<(), enigo::InputError> {
    enigo.key(Key::Control, Direction::Press)?;
    enigo.key(Key::Unicode(key), Direction::Click)?;
    enigo.key(Key::Control, Direction::Release)
}

/// Clipboard access over arboard
#[derive(Debug, Default)]
pub struct Win32Clipboard;

impl ClipboardAccess for Win32Clipboard {
    fn get_text(&self) -> Result<String, GuiError> {
        let mut clipboard = Clipboard::new().map_err(|e| GuiError::Clipboard {
            reason: e.to_string(),
        })?;
        clipboard.get_text().map_err(|e| GuiError::Clipboard {
            reason: e.to_string(),
        })
    }

    fn set_text(&self, text: &str) -> Result<(), GuiError> {
        let mut clipboard = Clipboard::new().map_err(|e| GuiError::Clipboard {
            reason: e.to_string(),
        })?;
        clipboard.set_text(text).map_err(|e| GuiError::Clipboard {
            reason: e.to_string(),
        })
    }
}

/// Screen capture over the screens API
#[derive(Debug, Default)]
pub struct Win32ScreenCapture;

impl Win32ScreenCapture {
    fn primary_screen() -> Result<Screen, GuiError> {
        let screens = Screen::all().map_err(|e| GuiError::Capture {
            reason: e.to_string(),
        })?;
        screens.into_iter().next().ok_or(GuiError::Capture {
            reason: "no screens found".to_string(),
        })
    }
}

impl ScreenCapture for Win32ScreenCapture {
    fn capture_desktop(&self) -> Result<CapturedImage, GuiError> {
        let screen = Self::primary_screen()?;
        let image = screen.capture().map_err(|e| GuiError::Capture {
            reason: e.to_string(),
        })?;
        encode_png(&image)
    }

    fn capture_region(&self, region: Rect) -> Result<CapturedImage, GuiError> {
        let screen = Self::primary_screen()?;
        let image = screen
            .capture_area(
                region.left,
                region.top,
                region.width() as u32,
                region.height() as u32,
            )
            .map_err(|e| GuiError::Capture {
                reason: e.to_string(),
            })?;
        encode_png(&image)
    }
}

fn encode_png(image: &screenshots::image::RgbaImage) -> Result<CapturedImage, GuiError> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, screenshots::image::ImageFormat::Png)
        .map_err(|e| GuiError::Capture {
            reason: e.to_string(),
        })?;
    Ok(CapturedImage {
        width: image.width(),
        height: image.height(),
        png: buffer.into_inner(),
    })
}
