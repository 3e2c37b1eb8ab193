//! OCR handoff façade
//!
//! Vision model internals are external collaborators: an engine is a black
//! box taking PNG bytes and returning text spans with bounding boxes and
//! confidences. When several engines are configured, results are either
//! merged (de-duplicated by bbox overlap and text similarity) or taken from
//! a preferred engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GuiError;
use crate::gui::backend::Rect;

/// Bbox overlap above which two spans are considered the same region
const DEDUP_IOU: f64 = 0.5;

/// One recognized text span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrSpan {
    pub bbox: Rect,
    pub text: String,
    pub confidence: f64,
    pub engine: String,
}

/// A black-box text detector
pub trait OcrEngine: Send + Sync {
    /// Engine name used for attribution and preference selection
    fn name(&self) -> &str;

    /// Detects text spans in an encoded PNG image
    ///
    /// # Errors
    ///
    /// Returns `GuiError::Ocr` when the engine fails.
    fn detect_text(&self, png: &[u8]) -> Result<Vec<OcrSpan>, GuiError>;
}

/// How multi-engine results are combined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineSelection {
    /// Merge all engines, de-duplicating overlapping agreement
    Merge,
    /// Use only the named engine, falling back to merge if it is absent
    Prefer(String),
}

/// Façade over one or more OCR engines
pub struct OcrService {
    engines: Vec<Arc<dyn OcrEngine>>,
    selection: EngineSelection,
}

impl OcrService {
    /// Creates a service over the given engines
    #[must_use]
    pub fn new(engines: Vec<Arc<dyn OcrEngine>>, selection: EngineSelection) -> Self {
        Self { engines, selection }
    }

    /// True when at least one engine is configured
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.engines.is_empty()
    }

    /// Runs detection according to the configured selection policy
    ///
    /// # Errors
    ///
    /// Returns an error only when every engine fails; partial failures are
    /// logged and the surviving results returned.
    pub fn detect_text(&self, png: &[u8]) -> Result<Vec<OcrSpan>, GuiError> {
        if self.engines.is_empty() {
            return Err(GuiError::Ocr {
                engine: "none".to_string(),
                reason: "no OCR engine configured".to_string(),
            });
        }

        if let EngineSelection::Prefer(name) = &self.selection {
            if let Some(engine) = self.engines.iter().find(|e| e.name() == name) {
                return engine.detect_text(png);
            }
            warn!(engine = %name, "preferred OCR engine absent, merging all");
        }

        let mut merged: Vec<OcrSpan> = Vec::new();
        let mut last_error = None;
        for engine in &self.engines {
            match engine.detect_text(png) {
                Ok(spans) => {
                    debug!(engine = engine.name(), spans = spans.len(), "OCR pass");
                    for span in spans {
                        merge_span(&mut merged, span);
                    }
                }
                Err(e) => {
                    warn!(engine = engine.name(), error = %e, "OCR engine failed");
                    last_error = Some(e);
                }
            }
        }
        if merged.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(merged)
    }

    /// True when `expected` appears among the detected spans, optionally
    /// restricted to a bounding region
    ///
    /// # Errors
    ///
    /// Propagates detection failure.
    pub fn contains_text(
        &self,
        png: &[u8],
        expected: &str,
        region: Option<Rect>,
    ) -> Result<bool, GuiError> {
        let needle = normalize(expected);
        if needle.is_empty() {
            return Ok(true);
        }
        let spans = self.detect_text(png)?;
        let haystack: String = spans
            .iter()
            .filter(|span| {
                region.map_or(true, |r| {
                    r.iou(&span.bbox) > 0.0 || r.contains(span.bbox.center())
                })
            })
            .map(|span| normalize(&span.text))
            .collect::<Vec<_>>()
            .join("");
        Ok(haystack.contains(&needle))
    }
}

/// Keeps the higher-confidence span when two overlap with similar text
fn merge_span(merged: &mut Vec<OcrSpan>, span: OcrSpan) {
    for existing in merged.iter_mut() {
        if existing.bbox.iou(&span.bbox) >= DEDUP_IOU
            && normalize(&existing.text) == normalize(&span.text)
        {
            if span.confidence > existing.confidence {
                *existing = span;
            }
            return;
        }
    }
    merged.push(span);
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine {
        name: String,
        spans: Vec<OcrSpan>,
        fail: bool,
    }

    impl OcrEngine for FixedEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn detect_text(&self, _png: &[u8]) -> Result<Vec<OcrSpan>, GuiError> {
            if self.fail {
                return Err(GuiError::Ocr {
                    engine: self.name.clone(),
                    reason: "offline".to_string(),
                });
            }
            Ok(self.spans.clone())
        }
    }

    fn span(engine: &str, text: &str, bbox: Rect, confidence: f64) -> OcrSpan {
        OcrSpan {
            bbox,
            text: text.to_string(),
            confidence,
            engine: engine.to_string(),
        }
    }

    fn engine(name: &str, spans: Vec<OcrSpan>) -> Arc<dyn OcrEngine> {
        Arc::new(FixedEngine {
            name: name.to_string(),
            spans,
            fail: false,
        })
    }

    #[test]
    fn merge_deduplicates_overlapping_agreement() {
        let bbox = Rect::new(10, 10, 110, 40);
        let service = OcrService::new(
            vec![
                engine("alpha", vec![span("alpha", "hello world", bbox, 0.8)]),
                engine("beta", vec![span("beta", "Hello  World", bbox, 0.95)]),
            ],
            EngineSelection::Merge,
        );
        let spans = service.detect_text(b"png").unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].engine, "beta");
    }

    #[test]
    fn merge_keeps_disjoint_spans() {
        let service = OcrService::new(
            vec![
                engine("alpha", vec![span("alpha", "top", Rect::new(0, 0, 50, 20), 0.9)]),
                engine("beta", vec![span("beta", "bottom", Rect::new(0, 100, 50, 120), 0.9)]),
            ],
            EngineSelection::Merge,
        );
        assert_eq!(service.detect_text(b"png").unwrap().len(), 2);
    }

    #[test]
    fn prefer_uses_only_the_named_engine() {
        let service = OcrService::new(
            vec![
                engine("alpha", vec![span("alpha", "a", Rect::new(0, 0, 10, 10), 0.9)]),
                engine("beta", vec![span("beta", "b", Rect::new(20, 0, 30, 10), 0.9)]),
            ],
            EngineSelection::Prefer("beta".to_string()),
        );
        let spans = service.detect_text(b"png").unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].engine, "beta");
    }

    #[test]
    fn failing_engine_does_not_sink_the_merge() {
        let service = OcrService::new(
            vec![
                Arc::new(FixedEngine {
                    name: "broken".to_string(),
                    spans: Vec::new(),
                    fail: true,
                }),
                engine("beta", vec![span("beta", "ok", Rect::new(0, 0, 10, 10), 0.9)]),
            ],
            EngineSelection::Merge,
        );
        let spans = service.detect_text(b"png").unwrap();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn contains_text_is_whitespace_insensitive_and_region_scoped() {
        let bbox = Rect::new(100, 800, 400, 840);
        let service = OcrService::new(
            vec![engine("alpha", vec![span("alpha", "hello world", bbox, 0.9)])],
            EngineSelection::Merge,
        );
        assert!(service.contains_text(b"png", "helloworld", None).unwrap());
        assert!(service
            .contains_text(b"png", "hello world", Some(Rect::new(0, 700, 500, 900)))
            .unwrap());
        assert!(!service
            .contains_text(b"png", "hello world", Some(Rect::new(0, 0, 50, 50)))
            .unwrap());
    }

    #[test]
    fn no_engines_is_an_error() {
        let service = OcrService::new(Vec::new(), EngineSelection::Merge);
        assert!(service.detect_text(b"png").is_err());
        assert!(!service.is_available());
    }
}
