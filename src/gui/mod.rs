//! The GUI-automation core
//!
//! Maps abstract operator intents onto fragile, host-dependent UI surfaces:
//! window discovery, accessibility-tree extraction with stable addressing,
//! synthetic input with post-write validation, adaptive position memory,
//! screenshot capture, and OCR handoff. All OS access goes through the
//! [`backend`] trait seams; everything above them is portable and tested
//! against a scripted desktop.

pub mod backend;
pub mod capture;
pub mod input;
pub mod launch;
pub mod ocr;
pub mod position_memory;
pub mod scoring;
pub mod uia;
pub mod windows;

pub use backend::{
    CapturedImage, Chord, PlacementState, Point, RawUiaNode, Rect, SimulatedDesktop,
    WindowRecord,
};
pub use capture::{CaptureService, ScreenshotPayload};
pub use input::{
    SendTextConfig, SendTextEngine, SendTextOutcome, TextTarget, WriteMethod, TEXT_INPUT_KIND,
};
pub use launch::{execute_program, LaunchRequest, LaunchResult};
pub use ocr::{EngineSelection, OcrEngine, OcrService, OcrSpan};
pub use position_memory::PositionMemory;
pub use scoring::{rank_candidates, ScoredCandidate, ScoringContext, SCORE_THRESHOLD};
pub use uia::{build_tree, collect_candidates, resolve_path, ElementCandidate, UiaNode};
pub use windows::{AppPredicate, AppWindowReport, WindowManager};
