//! Element scoring for intent-addressed targets
//!
//! When an operator asks for "the chat input" rather than a concrete element
//! path, candidates from the accessibility walk (plus geometric fallback
//! strips over the client area) are ranked by a weighted feature sum.
//! Candidates below the threshold are rejected; ties break toward the lowest
//! y-coordinate, and remembered successes bias the ranking.

use serde::{Deserialize, Serialize};

use crate::gui::backend::{Point, Rect};
use crate::gui::position_memory::PositionMemory;
use crate::gui::uia::ElementCandidate;

/// Minimum score a candidate must reach
pub const SCORE_THRESHOLD: f64 = 0.5;

/// Maximum bonus contributed by position-memory hits
const MEMORY_BONUS_CAP: f64 = 0.50;

/// Bonus per remembered success near the candidate point
const MEMORY_BONUS_PER_HIT: f64 = 0.25;

/// Name and automation-id fragments that suggest a chat-style input
const INPUT_KEYWORDS: &[&str] = &[
    "chat", "message", "type", "input", "composer", "prompt", "ask", "send",
];

/// Where a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// An element surfaced by the accessibility walk
    Uia,
    /// A rectangle proposed by geometric heuristics over the client area
    Geometric,
}

/// A ranked candidate target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub point: Point,
    pub rect: Rect,
    pub score: f64,
    pub source: CandidateSource,
    /// Tree path for UIA candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Scoring inputs shared across one ranking pass
pub struct ScoringContext<'a> {
    pub window_rect: Rect,
    pub memory: &'a PositionMemory,
    pub signature: &'a str,
    pub interaction_kind: &'a str,
}

/// Ranks accessibility candidates plus geometric fallbacks
///
/// Returns accepted candidates sorted best-first; an empty vector means no
/// candidate cleared the threshold.
#[must_use]
pub fn rank_candidates(
    candidates: &[ElementCandidate],
    ctx: &ScoringContext<'_>,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = Vec::new();

    for candidate in candidates {
        if !is_text_target(candidate) {
            continue;
        }
        let point = candidate.rect.center();
        let score = score_features(
            candidate.rect,
            ctx.window_rect,
            candidate.control_type == "Edit" && candidate.is_enabled,
            &format!("{} {}", candidate.name, candidate.automation_id),
            memory_hits(ctx, point),
        );
        scored.push(ScoredCandidate {
            point,
            rect: candidate.rect,
            score,
            source: CandidateSource::Uia,
            path: Some(candidate.path.clone()),
        });
    }

    for rect in geometric_candidates(ctx.window_rect) {
        let point = rect.center();
        let score = score_features(rect, ctx.window_rect, false, "", memory_hits(ctx, point));
        scored.push(ScoredCandidate {
            point,
            rect,
            score,
            source: CandidateSource::Geometric,
            path: None,
        });
    }

    scored.retain(|c| c.score >= SCORE_THRESHOLD);
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.point.y.cmp(&b.point.y))
    });
    scored
}

/// An element is a plausible text target if it is an enabled Edit control or
/// any keyboard-focusable region
fn is_text_target(candidate: &ElementCandidate) -> bool {
    (candidate.control_type == "Edit" && candidate.is_enabled)
        || candidate.is_keyboard_focusable
}

fn memory_hits(ctx: &ScoringContext<'_>, point: Point) -> usize {
    ctx.memory
        .hits_near(ctx.signature, ctx.interaction_kind, point)
}

/// The weighted feature sum
#[must_use]
pub fn score_features(
    rect: Rect,
    window_rect: Rect,
    is_enabled_edit: bool,
    name_and_id: &str,
    memory_hit_count: usize,
) -> f64 {
    let mut score = 0.0;

    let width = rect.width();
    if (300..=800).contains(&width) {
        score += 0.40;
    }
    let height = rect.height();
    if (25..=60).contains(&height) {
        score += 0.30;
    }

    let bottom_third_start = window_rect.top + window_rect.height() * 2 / 3;
    if rect.center().y >= bottom_third_start {
        score += 0.30;
    }

    if is_enabled_edit {
        score += 0.20;
    }

    let haystack = name_and_id.to_lowercase();
    if INPUT_KEYWORDS.iter().any(|k| haystack.contains(k)) {
        score += 0.30;
    }

    let memory_bonus =
        (memory_hit_count as f64 * MEMORY_BONUS_PER_HIT).min(MEMORY_BONUS_CAP);
    score + memory_bonus
}

/// Fallback rectangles over the window client area
///
/// Strips across the bottom 15 % of the window at 40 / 60 / 80 % width,
/// centered horizontally — the usual home of chat-style composers.
#[must_use]
pub fn geometric_candidates(window_rect: Rect) -> Vec<Rect> {
    let height = window_rect.height();
    let width = window_rect.width();
    if height < 100 || width < 200 {
        return Vec::new();
    }
    let strip_top = window_rect.bottom - height * 15 / 100;
    let strip_height = (height * 15 / 100).min(60).max(30);
    let center_x = window_rect.left + width / 2;

    [40, 60, 80]
        .into_iter()
        .map(|percent| {
            let candidate_width = width * percent / 100;
            Rect::new(
                center_x - candidate_width / 2,
                strip_top,
                center_x + candidate_width / 2,
                strip_top + strip_height,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{PositionMemoryCap, StaleFailureLimit};

    fn window() -> Rect {
        Rect::new(0, 0, 1200, 900)
    }

    fn memory() -> PositionMemory {
        PositionMemory::new(PositionMemoryCap::default(), StaleFailureLimit::default())
    }

    fn edit(path: &str, name: &str, rect: Rect) -> ElementCandidate {
        ElementCandidate {
            path: path.to_string(),
            control_type: "Edit".to_string(),
            name: name.to_string(),
            automation_id: String::new(),
            rect,
            is_enabled: true,
            is_keyboard_focusable: true,
            value: None,
        }
    }

    #[test]
    fn ideal_chat_input_scores_well_above_threshold() {
        // 500x40 edit named "chat", bottom third
        let score = score_features(
            Rect::new(350, 820, 850, 860),
            window(),
            true,
            "Chat Input",
            0,
        );
        assert!((score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn tiny_top_corner_element_is_rejected() {
        let memory = memory();
        let ctx = ScoringContext {
            window_rect: window(),
            memory: &memory,
            signature: "cursor",
            interaction_kind: "chat_input",
        };
        let candidates = vec![edit("a", "search", Rect::new(0, 0, 80, 20))];
        let ranked = rank_candidates(&candidates, &ctx);
        assert!(ranked
            .iter()
            .all(|c| c.source != CandidateSource::Uia || c.score >= SCORE_THRESHOLD));
        assert!(!ranked.iter().any(|c| c.path.as_deref() == Some("a")));
    }

    #[test]
    fn named_edit_outranks_geometric_fallback() {
        let memory = memory();
        let ctx = ScoringContext {
            window_rect: window(),
            memory: &memory,
            signature: "cursor",
            interaction_kind: "chat_input",
        };
        let candidates = vec![edit(
            "Pane_0/Edit_chat_0",
            "Message composer",
            Rect::new(350, 820, 850, 860),
        )];
        let ranked = rank_candidates(&candidates, &ctx);
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].source, CandidateSource::Uia);
        assert_eq!(ranked[0].path.as_deref(), Some("Pane_0/Edit_chat_0"));
    }

    #[test]
    fn memory_hits_bias_the_ranking() {
        let memory = memory();
        let left = edit("left", "input", Rect::new(100, 820, 500, 860));
        let right = edit("right", "input", Rect::new(700, 820, 1100, 860));
        let ctx = ScoringContext {
            window_rect: window(),
            memory: &memory,
            signature: "cursor",
            interaction_kind: "chat_input",
        };

        let baseline = rank_candidates(&[left.clone(), right.clone()], &ctx);
        // Same score; tie breaks by y then order is stable by sort
        assert_eq!(baseline[0].score, baseline[1].score);

        memory.record_success("cursor", "chat_input", right.rect.center());
        let biased = rank_candidates(&[left, right.clone()], &ctx);
        assert_eq!(biased[0].path.as_deref(), Some("right"));
        assert!(biased[0].score > biased[1].score);
    }

    #[test]
    fn memory_bonus_is_capped() {
        let score_two = score_features(Rect::new(0, 0, 10, 10), window(), false, "", 2);
        let score_five = score_features(Rect::new(0, 0, 10, 10), window(), false, "", 5);
        assert_eq!(score_two, score_five);
        assert!((score_two - MEMORY_BONUS_CAP).abs() < 1e-9);
    }

    #[test]
    fn geometric_candidates_sit_in_the_bottom_strip() {
        let rects = geometric_candidates(window());
        assert_eq!(rects.len(), 3);
        for rect in &rects {
            assert!(rect.top >= 900 - 135);
            assert!(rect.width() >= 1200 * 40 / 100);
            assert!(rect.width() <= 1200 * 80 / 100);
        }
    }

    #[test]
    fn degenerate_windows_yield_no_geometric_candidates() {
        assert!(geometric_candidates(Rect::new(0, 0, 50, 50)).is_empty());
    }

    #[test]
    fn ties_break_toward_the_lowest_y() {
        let memory = memory();
        let ctx = ScoringContext {
            window_rect: window(),
            memory: &memory,
            signature: "app",
            interaction_kind: "chat_input",
        };
        let upper = edit("upper", "input", Rect::new(100, 700, 500, 740));
        let lower = edit("lower", "input", Rect::new(100, 820, 500, 860));
        let ranked = rank_candidates(&[lower, upper], &ctx);
        let uia: Vec<_> = ranked
            .iter()
            .filter(|c| c.source == CandidateSource::Uia)
            .collect();
        assert_eq!(uia[0].path.as_deref(), Some("upper"));
    }
}
