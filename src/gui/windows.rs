//! Window discovery, matching, and activation
//!
//! `get_windows` returns visible, titled top-level windows. The generalized
//! finder enumerates everything, groups by owning process, and matches a
//! named-application predicate, also returning the chromium-widget candidate
//! pool so an operator can tell "not running" from "running but hidden".
//! Recent enumerations feed a TTL cache for hwnd and title lookups.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GuiError;
use crate::gui::backend::{WindowRecord, WindowSystem};

/// How long one enumeration stays usable for lookups
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Electron/Chromium top-level widget classes, in match priority order
const CHROMIUM_WIDGET_CLASSES: &[&str] =
    &["Chrome_WidgetWin_1", "Chrome_WidgetWin_0", "Chrome_WidgetWin_2"];

/// Predicate describing a named application to find
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPredicate {
    /// Stable name used as the application signature for position memory
    pub name: String,
    /// Substrings matched against the process name (case-insensitive)
    pub process_substrings: Vec<String>,
    /// Window classes that strengthen a match, in priority order
    pub class_names: Vec<String>,
}

impl AppPredicate {
    /// Predicate matching the Cursor IDE
    #[must_use]
    pub fn cursor() -> Self {
        Self {
            name: "cursor".to_string(),
            process_substrings: vec!["cursor".to_string()],
            class_names: CHROMIUM_WIDGET_CLASSES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Predicate matching VS Code
    #[must_use]
    pub fn vscode() -> Self {
        Self {
            name: "vscode".to_string(),
            process_substrings: vec!["code".to_string()],
            class_names: CHROMIUM_WIDGET_CLASSES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    fn matches_process(&self, window: &WindowRecord) -> bool {
        let process = window.process_name.to_lowercase();
        self.process_substrings
            .iter()
            .any(|s| process.contains(&s.to_lowercase()))
    }
}

/// Result of the generalized application finder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppWindowReport {
    /// Windows owned by matching processes
    pub matches: Vec<WindowRecord>,
    /// All chromium-widget windows, as a diagnostic pool
    pub chromium_candidates: Vec<WindowRecord>,
    /// Windows per process id, for the matched processes
    pub process_window_counts: BTreeMap<u32, usize>,
}

#[derive(Debug, Default)]
struct WindowCache {
    records: Vec<WindowRecord>,
    by_hwnd: HashMap<u64, usize>,
    refreshed_at: Option<Instant>,
}

impl WindowCache {
    fn fill(&mut self, records: Vec<WindowRecord>) {
        self.by_hwnd = records
            .iter()
            .enumerate()
            .map(|(i, w)| (w.hwnd, i))
            .collect();
        self.records = records;
        self.refreshed_at = Some(Instant::now());
    }

    fn fresh(&self) -> bool {
        self.refreshed_at
            .is_some_and(|at| at.elapsed() < CACHE_TTL)
    }

    fn by_hwnd(&self, hwnd: u64) -> Option<WindowRecord> {
        if !self.fresh() {
            return None;
        }
        self.by_hwnd
            .get(&hwnd)
            .map(|&index| self.records[index].clone())
    }

    fn by_title(&self, pattern: &str) -> Option<WindowRecord> {
        if !self.fresh() {
            return None;
        }
        let pattern = pattern.to_lowercase();
        self.records
            .iter()
            .find(|w| w.title.to_lowercase().contains(&pattern))
            .cloned()
    }
}

/// Window discovery facade over a [`WindowSystem`] backend
pub struct WindowManager {
    backend: Arc<dyn WindowSystem>,
    cache: Mutex<WindowCache>,
}

impl WindowManager {
    /// Creates a manager over the given backend
    #[must_use]
    pub fn new(backend: Arc<dyn WindowSystem>) -> Self {
        Self {
            backend,
            cache: Mutex::new(WindowCache::default()),
        }
    }

    /// Visible, titled top-level windows in enumeration order
    ///
    /// # Errors
    ///
    /// Propagates backend enumeration failure.
    pub fn get_windows(&self) -> Result<Vec<WindowRecord>, GuiError> {
        let all = self.backend.list_windows(false)?;
        let windows: Vec<WindowRecord> = all
            .into_iter()
            .filter(|w| w.visible && !w.title.trim().is_empty())
            .collect();
        self.cache.lock().unwrap().fill(windows.clone());
        Ok(windows)
    }

    /// Finds windows of a named application, with the diagnostic pool
    ///
    /// Enumerates hidden windows too, so a running-but-hidden host is
    /// distinguishable from one that is not running at all.
    ///
    /// # Errors
    ///
    /// Propagates backend enumeration failure.
    pub fn find_app_windows(&self, predicate: &AppPredicate) -> Result<AppWindowReport, GuiError> {
        let all = self.backend.list_windows(true)?;

        let mut by_process: HashMap<u32, Vec<&WindowRecord>> = HashMap::new();
        for window in &all {
            by_process.entry(window.process_id).or_default().push(window);
        }

        let chromium_candidates: Vec<WindowRecord> = all
            .iter()
            .filter(|w| {
                CHROMIUM_WIDGET_CLASSES
                    .iter()
                    .any(|class| w.class_name == *class)
            })
            .cloned()
            .collect();

        let mut matches: Vec<WindowRecord> = Vec::new();
        let mut process_window_counts = BTreeMap::new();
        for (pid, windows) in &by_process {
            if windows.iter().any(|w| predicate.matches_process(w)) {
                process_window_counts.insert(*pid, windows.len());
                matches.extend(windows.iter().map(|w| (*w).clone()));
            }
        }
        // Known widget classes first (in priority order), then by handle
        matches.sort_by_key(|w| {
            let class_rank = predicate
                .class_names
                .iter()
                .position(|class| w.class_name == *class)
                .unwrap_or(usize::MAX);
            (class_rank, w.hwnd)
        });

        debug!(
            app = %predicate.name,
            matches = matches.len(),
            candidates = chromium_candidates.len(),
            "application window search"
        );
        Ok(AppWindowReport {
            matches,
            chromium_candidates,
            process_window_counts,
        })
    }

    /// Brings a window to the foreground, restoring it if minimized
    ///
    /// # Errors
    ///
    /// Propagates backend activation failure.
    pub fn activate(&self, hwnd: u64) -> Result<(), GuiError> {
        self.backend.activate(hwnd)
    }

    /// Current value of the focused element in a window
    ///
    /// # Errors
    ///
    /// Propagates backend failure.
    pub fn focused_value(&self, hwnd: u64) -> Result<String, GuiError> {
        self.backend.focused_element_value(hwnd)
    }

    /// Cached record for a handle, if the last enumeration is still fresh
    #[must_use]
    pub fn cached_by_hwnd(&self, hwnd: u64) -> Option<WindowRecord> {
        self.cache.lock().unwrap().by_hwnd(hwnd)
    }

    /// Cached record matching a title substring
    #[must_use]
    pub fn cached_by_title(&self, pattern: &str) -> Option<WindowRecord> {
        self.cache.lock().unwrap().by_title(pattern)
    }

    /// Record for a handle, refreshing the enumeration on a cache miss
    ///
    /// # Errors
    ///
    /// Returns `WindowNotFound` when the handle matches no live window.
    pub fn lookup(&self, hwnd: u64) -> Result<WindowRecord, GuiError> {
        if let Some(window) = self.cached_by_hwnd(hwnd) {
            return Ok(window);
        }
        self.get_windows()?;
        self.cached_by_hwnd(hwnd)
            .ok_or(GuiError::WindowNotFound(hwnd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gui::backend::{PlacementState, Rect, SimulatedDesktop};

    fn window(hwnd: u64, title: &str, class: &str, pid: u32, process: &str, visible: bool) -> WindowRecord {
        WindowRecord {
            hwnd,
            title: title.to_string(),
            class_name: class.to_string(),
            process_id: pid,
            process_name: process.to_string(),
            rect: Rect::new(0, 0, 1200, 900),
            visible,
            enabled: true,
            placement_state: PlacementState::Normal,
        }
    }

    fn desktop() -> Arc<SimulatedDesktop> {
        let desktop = Arc::new(SimulatedDesktop::new());
        desktop.set_windows(vec![
            window(1, "main.rs - Cursor", "Chrome_WidgetWin_1", 100, "Cursor.exe", true),
            window(2, "", "Chrome_WidgetWin_1", 100, "Cursor.exe", false),
            window(3, "Document - Notepad", "Notepad", 200, "notepad.exe", true),
            window(4, "", "tooltip", 200, "notepad.exe", true),
            window(5, "Slack", "Chrome_WidgetWin_1", 300, "slack.exe", true),
        ]);
        desktop
    }

    #[test]
    fn get_windows_filters_hidden_and_untitled() {
        let manager = WindowManager::new(desktop());
        let windows = manager.get_windows().unwrap();
        let hwnds: Vec<u64> = windows.iter().map(|w| w.hwnd).collect();
        assert_eq!(hwnds, vec![1, 3, 5]);
    }

    #[test]
    fn repeated_enumeration_of_quiescent_desktop_is_equal() {
        let manager = WindowManager::new(desktop());
        let first = manager.get_windows().unwrap();
        let second = manager.get_windows().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn finder_matches_by_process_and_reports_candidate_pool() {
        let manager = WindowManager::new(desktop());
        let report = manager.find_app_windows(&AppPredicate::cursor()).unwrap();

        // Both cursor windows match, hidden one included
        let hwnds: Vec<u64> = report.matches.iter().map(|w| w.hwnd).collect();
        assert_eq!(hwnds, vec![1, 2]);

        // The pool carries every chromium widget, slack included
        let pool: Vec<u64> = report.chromium_candidates.iter().map(|w| w.hwnd).collect();
        assert!(pool.contains(&5));
        assert_eq!(report.process_window_counts.get(&100), Some(&2));
    }

    #[test]
    fn finder_distinguishes_not_running_from_hidden() {
        let manager = WindowManager::new(desktop());
        let report = manager
            .find_app_windows(&AppPredicate {
                name: "ghost".to_string(),
                process_substrings: vec!["ghost".to_string()],
                class_names: vec!["Chrome_WidgetWin_1".to_string()],
            })
            .unwrap();
        assert!(report.matches.is_empty());
        assert!(!report.chromium_candidates.is_empty());
    }

    #[test]
    fn cache_serves_hwnd_and_title_lookups() {
        let manager = WindowManager::new(desktop());
        manager.get_windows().unwrap();
        assert_eq!(manager.cached_by_hwnd(3).unwrap().title, "Document - Notepad");
        assert_eq!(manager.cached_by_title("cursor").unwrap().hwnd, 1);
        assert!(manager.cached_by_hwnd(99).is_none());
    }

    #[test]
    fn lookup_refreshes_on_miss() {
        let manager = WindowManager::new(desktop());
        assert_eq!(manager.lookup(5).unwrap().title, "Slack");
        assert!(matches!(
            manager.lookup(99),
            Err(GuiError::WindowNotFound(99))
        ));
    }

    #[test]
    fn activation_restores_minimized_windows() {
        let desktop = desktop();
        let manager = WindowManager::new(desktop.clone());
        manager.activate(1).unwrap();
        assert_eq!(desktop.foreground(), Some(1));
    }
}
