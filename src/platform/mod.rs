//! Platform backends for the GUI-automation trait seams
//!
//! Production agents on Windows install the Win32/UIA implementations; other
//! builds drive the portable core against the simulated desktop or a custom
//! backend set.

#[cfg(windows)]
pub mod win32;

#[cfg(windows)]
pub use win32::{
    Win32AccessibilityTree, Win32Clipboard, Win32Input, Win32ScreenCapture, Win32WindowSystem,
};
