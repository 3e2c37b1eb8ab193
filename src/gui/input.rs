//! Synthetic text input with post-write validation
//!
//! The send-text state machine:
//!
//! ```text
//! ACQUIRE → CLEAR → WRITE → VALIDATE → (SUCCESS | ALT_WRITE → VALIDATE → (SUCCESS | FAIL))
//! ```
//!
//! The primary write types characters with pacing, emitting shift+enter for
//! newlines so chat-style inputs do not submit early. The alternate write
//! pastes through the clipboard; it is also chosen outright for text outside
//! the ASCII-printable range. Validation reads the field back with
//! select-all-copy and compares whitespace-insensitively, optionally backed
//! by an OCR check over a window screenshot. Submission is a separate
//! primitive so operators can leave text for human review.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain_types::{FocusSettleMs, KeystrokeDelayMs};
use crate::error::GuiError;
use crate::gui::backend::{
    AccessibilityTree, Chord, ClipboardAccess, InputSynthesizer, Point, Rect,
};
use crate::gui::capture::CaptureService;
use crate::gui::ocr::OcrService;
use crate::gui::position_memory::PositionMemory;
use crate::gui::scoring::{rank_candidates, ScoringContext};
use crate::gui::uia::{build_tree, collect_candidates, resolve_path};
use crate::gui::windows::WindowManager;
use crate::time_provider::SharedTimeProvider;

/// Interaction kind under which text-input positions are remembered
pub const TEXT_INPUT_KIND: &str = "text_input";

/// Depth used when a walk is needed only to resolve a target
const TARGET_WALK_DEPTH: usize = 15;

/// How the text should find its element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextTarget {
    /// A window plus a `/`-separated path through its accessibility tree
    ElementPath { hwnd: u64, path: String },
    /// A raw screen coordinate
    Coordinate { x: i32, y: i32 },
    /// Whatever currently holds keyboard focus in the window
    FocusedElement { hwnd: u64 },
    /// Resolve by intent: score candidates inside the window
    Intent { hwnd: u64 },
}

/// Which write path applied the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMethod {
    Keystroke,
    Clipboard,
}

impl WriteMethod {
    /// Wire name for envelope metadata
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Keystroke => "keystroke",
            WriteMethod::Clipboard => "clipboard",
        }
    }
}

/// Outcome of one send-text run, success or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTextOutcome {
    pub success: bool,
    /// The path that applied the text, when successful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<WriteMethod>,
    /// Validation verdict of the keystroke attempt, if made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystroke_validated: Option<bool>,
    /// Validation verdict of the clipboard attempt, if made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard_validated: Option<bool>,
    /// The resolved click point, when the target had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_point: Option<Point>,
    /// Tree path of the resolved element, when intent scoring picked one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<String>,
}

/// Tuning for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SendTextConfig {
    pub keystroke_delay: KeystrokeDelayMs,
    pub focus_settle: FocusSettleMs,
}

/// Optional OCR-backed secondary validation
pub struct OcrValidation {
    pub capture: Arc<CaptureService>,
    pub service: Arc<OcrService>,
    /// Restrict the match to this screen region, when set
    pub region: Option<Rect>,
}

/// The send-text engine; runs in the `gui_exclusive` concurrency class
pub struct SendTextEngine {
    windows: Arc<WindowManager>,
    tree: Arc<dyn AccessibilityTree>,
    input: Arc<dyn InputSynthesizer>,
    clipboard: Arc<dyn ClipboardAccess>,
    memory: Arc<PositionMemory>,
    time: SharedTimeProvider,
    config: SendTextConfig,
    ocr: Option<OcrValidation>,
}

impl SendTextEngine {
    /// Creates the engine
    #[must_use]
    pub fn new(
        windows: Arc<WindowManager>,
        tree: Arc<dyn AccessibilityTree>,
        input: Arc<dyn InputSynthesizer>,
        clipboard: Arc<dyn ClipboardAccess>,
        memory: Arc<PositionMemory>,
        time: SharedTimeProvider,
        config: SendTextConfig,
    ) -> Self {
        Self {
            windows,
            tree,
            input,
            clipboard,
            memory,
            time,
            config,
            ocr: None,
        }
    }

    /// Enables OCR-backed secondary validation
    #[must_use]
    pub fn with_ocr_validation(mut self, ocr: OcrValidation) -> Self {
        self.ocr = Some(ocr);
        self
    }

    /// Runs the full state machine
    ///
    /// # Errors
    ///
    /// Returns an error when the target cannot be resolved at all; a resolved
    /// target whose writes never validate yields `Ok` with `success = false`
    /// and both validation verdicts filled in.
    pub async fn send_text(
        &self,
        target: &TextTarget,
        text: &str,
    ) -> Result<SendTextOutcome, GuiError> {
        let resolved = self.resolve(target)?;
        debug!(?target, point = ?resolved.point, "send_text target resolved");

        // ACQUIRE: foreground, click, settle
        if let Some(hwnd) = resolved.hwnd {
            self.windows.activate(hwnd)?;
        }
        if let Some(point) = resolved.point {
            self.input.click(point)?;
        }
        self.time.sleep(self.config.focus_settle.as_duration()).await;

        let mut outcome = SendTextOutcome {
            success: false,
            method: None,
            keystroke_validated: None,
            clipboard_validated: None,
            target_point: resolved.point,
            resolved_path: resolved.path.clone(),
        };

        // WRITE (primary): keystrokes, unless the text needs the clipboard
        if is_keystroke_safe(text) {
            self.clear()?;
            self.input.type_text(
                text,
                self.config.keystroke_delay.as_duration(),
                true,
            )?;
            let validated = self.validate(resolved.hwnd, text)?;
            outcome.keystroke_validated = Some(validated);
            if validated {
                info!(method = "keystroke", "send_text validated");
                self.record(&resolved, true);
                outcome.success = true;
                outcome.method = Some(WriteMethod::Keystroke);
                return Ok(outcome);
            }
            warn!("keystroke write failed validation, trying clipboard");
        }

        // ALT_WRITE: clipboard paste
        self.clipboard.set_text(text)?;
        self.clear()?;
        self.input.key_chord(Chord::Paste)?;
        let validated = self.validate(resolved.hwnd, text)?;
        outcome.clipboard_validated = Some(validated);
        if validated {
            info!(method = "clipboard", "send_text validated");
            self.record(&resolved, true);
            outcome.success = true;
            outcome.method = Some(WriteMethod::Clipboard);
            return Ok(outcome);
        }

        warn!("send_text failed both write paths");
        self.record(&resolved, false);
        Ok(outcome)
    }

    /// Sends the plain enter key; compose with `send_text` for chat dispatch
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Os` when injection fails.
    pub fn submit(&self) -> Result<(), GuiError> {
        self.input.key_chord(Chord::Enter)
    }

    /// Reads the focused element's value in a window
    ///
    /// # Errors
    ///
    /// Propagates backend failure.
    pub fn read_focused_value(&self, hwnd: u64) -> Result<String, GuiError> {
        self.windows.lookup(hwnd)?;
        self.windows.focused_value(hwnd)
    }

    fn clear(&self) -> Result<(), GuiError> {
        self.input.key_chord(Chord::SelectAll)?;
        self.input.key_chord(Chord::Delete)
    }

    fn validate(&self, hwnd: Option<u64>, expected: &str) -> Result<bool, GuiError> {
        self.input.key_chord(Chord::SelectAll)?;
        self.input.key_chord(Chord::Copy)?;
        let actual = self.clipboard.get_text()?;
        if texts_match(&actual, expected) {
            return Ok(true);
        }
        debug!(
            expected_len = expected.len(),
            actual_len = actual.len(),
            "clipboard validation mismatch"
        );

        // Secondary validator: OCR over a window screenshot
        if let (Some(ocr), Some(hwnd)) = (&self.ocr, hwnd) {
            let png = ocr.capture.window_png(hwnd)?;
            match ocr.service.contains_text(&png, expected, ocr.region) {
                Ok(found) => return Ok(found),
                Err(e) => warn!(error = %e, "OCR validation unavailable"),
            }
        }
        Ok(false)
    }

    fn record(&self, resolved: &ResolvedTarget, success: bool) {
        let Some(point) = resolved.point else { return };
        if success {
            self.memory
                .record_success(&resolved.signature, TEXT_INPUT_KIND, point);
        } else {
            self.memory
                .record_failure(&resolved.signature, TEXT_INPUT_KIND, point);
        }
    }

    fn resolve(&self, target: &TextTarget) -> Result<ResolvedTarget, GuiError> {
        match target {
            TextTarget::ElementPath { hwnd, path } => {
                let window = self.windows.lookup(*hwnd)?;
                let raw = self.tree.walk(*hwnd, TARGET_WALK_DEPTH)?;
                let tree = build_tree(&raw, TARGET_WALK_DEPTH);
                let node = resolve_path(&tree, path).ok_or_else(|| GuiError::TreeUnavailable {
                    reason: format!("no element at path {path}"),
                })?;
                Ok(ResolvedTarget {
                    hwnd: Some(*hwnd),
                    point: Some(node.rectangle.center()),
                    path: Some(path.clone()),
                    signature: app_signature(&window.process_name),
                })
            }
            TextTarget::Coordinate { x, y } => Ok(ResolvedTarget {
                hwnd: None,
                point: Some(Point::new(*x, *y)),
                path: None,
                signature: "screen".to_string(),
            }),
            TextTarget::FocusedElement { hwnd } => {
                let window = self.windows.lookup(*hwnd)?;
                Ok(ResolvedTarget {
                    hwnd: Some(*hwnd),
                    point: None,
                    path: None,
                    signature: app_signature(&window.process_name),
                })
            }
            TextTarget::Intent { hwnd } => {
                let window = self.windows.lookup(*hwnd)?;
                let signature = app_signature(&window.process_name);
                let raw = self.tree.walk(*hwnd, TARGET_WALK_DEPTH)?;
                let tree = build_tree(&raw, TARGET_WALK_DEPTH);
                let candidates = collect_candidates(&tree);
                let ranked = rank_candidates(
                    &candidates,
                    &ScoringContext {
                        window_rect: window.rect,
                        memory: &self.memory,
                        signature: &signature,
                        interaction_kind: TEXT_INPUT_KIND,
                    },
                );
                let best = ranked.first().ok_or(GuiError::NoInputCandidate {
                    best_score: 0.0,
                })?;
                Ok(ResolvedTarget {
                    hwnd: Some(*hwnd),
                    point: Some(best.point),
                    path: best.path.clone(),
                    signature,
                })
            }
        }
    }
}

#[derive(Debug)]
struct ResolvedTarget {
    hwnd: Option<u64>,
    point: Option<Point>,
    path: Option<String>,
    signature: String,
}

/// Application signature used to key position memory
#[must_use]
pub fn app_signature(process_name: &str) -> String {
    process_name
        .to_lowercase()
        .trim_end_matches(".exe")
        .to_string()
}

/// True when the text can travel as paced keystrokes
///
/// Anything outside the ASCII-printable range (newlines and tabs excepted)
/// goes through the clipboard instead.
#[must_use]
pub fn is_keystroke_safe(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(c, ' '..='~') || c == '\n' || c == '\t' || c == '\r')
}

/// Whitespace-insensitive text comparison used by validation
#[must_use]
pub fn texts_match(actual: &str, expected: &str) -> bool {
    let strip = |s: &str| {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
    };
    strip(actual) == strip(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{PositionMemoryCap, StaleFailureLimit};
    use crate::gui::backend::{PlacementState, RawUiaNode, SimulatedDesktop, WindowRecord};
    use crate::time_provider::MockTimeProvider;

    fn chat_window() -> WindowRecord {
        WindowRecord {
            hwnd: 7,
            title: "main.rs - Cursor".to_string(),
            class_name: "Chrome_WidgetWin_1".to_string(),
            process_id: 100,
            process_name: "Cursor.exe".to_string(),
            rect: Rect::new(0, 0, 1200, 900),
            visible: true,
            enabled: true,
            placement_state: PlacementState::Minimized,
        }
    }

    fn chat_tree() -> RawUiaNode {
        let mut root = RawUiaNode {
            control_type: "Window".to_string(),
            name: "Cursor".to_string(),
            rect: Rect::new(0, 0, 1200, 900),
            is_enabled: true,
            is_visible: true,
            ..RawUiaNode::default()
        };
        root.children.push(RawUiaNode {
            control_type: "Edit".to_string(),
            name: "Chat Input".to_string(),
            automation_id: "chat-box".to_string(),
            rect: Rect::new(350, 820, 850, 860),
            is_enabled: true,
            is_visible: true,
            is_keyboard_focusable: true,
            ..RawUiaNode::default()
        });
        root
    }

    struct Fixture {
        desktop: Arc<SimulatedDesktop>,
        memory: Arc<PositionMemory>,
        engine: SendTextEngine,
    }

    fn fixture() -> Fixture {
        let desktop = Arc::new(SimulatedDesktop::new());
        desktop.set_windows(vec![chat_window()]);
        desktop.set_tree(7, chat_tree());
        let windows = Arc::new(WindowManager::new(desktop.clone()));
        let memory = Arc::new(PositionMemory::new(
            PositionMemoryCap::default(),
            StaleFailureLimit::default(),
        ));
        let engine = SendTextEngine::new(
            windows,
            desktop.clone(),
            desktop.clone(),
            desktop.clone(),
            Arc::clone(&memory),
            Arc::new(MockTimeProvider::new()),
            SendTextConfig::default(),
        );
        Fixture {
            desktop,
            memory,
            engine,
        }
    }

    #[tokio::test]
    async fn happy_path_types_validates_and_remembers() {
        let fx = fixture();
        let outcome = fx
            .engine
            .send_text(&TextTarget::Intent { hwnd: 7 }, "hello\nworld")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.method, Some(WriteMethod::Keystroke));
        assert_eq!(outcome.keystroke_validated, Some(true));
        assert_eq!(outcome.clipboard_validated, None);
        assert_eq!(outcome.resolved_path.as_deref(), Some("Edit_chat-box_0"));
        assert_eq!(fx.desktop.focused_value(), "hello\nworld");

        // ACQUIRE brought the window up and clicked the element center
        assert_eq!(fx.desktop.foreground(), Some(7));
        assert_eq!(fx.desktop.clicks(), vec![Point::new(600, 840)]);

        // Position memory grew by one entry for the application signature
        assert_eq!(
            fx.memory.remembered_points("cursor", TEXT_INPUT_KIND),
            vec![Point::new(600, 840)]
        );
    }

    #[tokio::test]
    async fn blocked_keystrokes_fall_back_to_clipboard() {
        let fx = fixture();
        fx.desktop.block_keystrokes(true);
        let outcome = fx
            .engine
            .send_text(&TextTarget::Intent { hwnd: 7 }, "hello world")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.method, Some(WriteMethod::Clipboard));
        assert_eq!(outcome.keystroke_validated, Some(false));
        assert_eq!(outcome.clipboard_validated, Some(true));
        assert_eq!(fx.desktop.focused_value(), "hello world");
    }

    #[tokio::test]
    async fn non_ascii_goes_straight_to_clipboard() {
        let fx = fixture();
        let text = "阅读 workflow 了解工作流";
        let outcome = fx
            .engine
            .send_text(&TextTarget::Intent { hwnd: 7 }, text)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.method, Some(WriteMethod::Clipboard));
        assert_eq!(outcome.keystroke_validated, None);
        assert_eq!(fx.desktop.focused_value(), text);
    }

    #[tokio::test]
    async fn coordinate_target_clicks_without_a_window() {
        let fx = fixture();
        let outcome = fx
            .engine
            .send_text(&TextTarget::Coordinate { x: 500, y: 850 }, "hi")
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(fx.desktop.clicks(), vec![Point::new(500, 850)]);
        assert_eq!(
            fx.memory.remembered_points("screen", TEXT_INPUT_KIND),
            vec![Point::new(500, 850)]
        );
    }

    #[tokio::test]
    async fn element_path_target_resolves_through_the_tree() {
        let fx = fixture();
        let outcome = fx
            .engine
            .send_text(
                &TextTarget::ElementPath {
                    hwnd: 7,
                    path: "Edit_chat-box_0".to_string(),
                },
                "typed",
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.target_point, Some(Point::new(600, 840)));
    }

    #[tokio::test]
    async fn unknown_path_is_an_error() {
        let fx = fixture();
        let err = fx
            .engine
            .send_text(
                &TextTarget::ElementPath {
                    hwnd: 7,
                    path: "Pane_9/Edit_nope_0".to_string(),
                },
                "text",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GuiError::TreeUnavailable { .. }));
    }

    #[tokio::test]
    async fn total_failure_reports_both_attempts_and_marks_the_point_stale() {
        let fx = fixture();
        fx.desktop.block_keystrokes(true);
        fx.desktop.block_paste(true);
        let outcome = fx
            .engine
            .send_text(&TextTarget::Intent { hwnd: 7 }, "never lands")
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.method, None);
        assert_eq!(outcome.keystroke_validated, Some(false));
        assert_eq!(outcome.clipboard_validated, Some(false));
        assert_eq!(fx.desktop.focused_value(), "");
    }

    #[tokio::test]
    async fn submit_is_a_plain_enter() {
        let fx = fixture();
        fx.engine.submit().unwrap();
        assert_eq!(fx.desktop.chords(), vec![Chord::Enter]);
    }

    #[test]
    fn keystroke_safety_classification() {
        assert!(is_keystroke_safe("hello world\n\tsecond"));
        assert!(!is_keystroke_safe("héllo"));
        assert!(!is_keystroke_safe("阅读"));
    }

    #[test]
    fn validation_ignores_whitespace_differences() {
        assert!(texts_match("hello\r\nworld", "hello\nworld"));
        assert!(texts_match("  hello world ", "helloworld"));
        assert!(!texts_match("hello", "hello!"));
    }

    #[test]
    fn signatures_strip_extension_and_case() {
        assert_eq!(app_signature("Cursor.exe"), "cursor");
        assert_eq!(app_signature("Code.EXE"), "code");
    }
}
