//! Fuzzy matching between windows reported by different sources.
//!
//! Sources rarely agree on identifiers, so a window seen by one source is tied
//! to another source's view by title word overlap plus geometry. Both
//! thresholds are tunable policy from [`MatchingConfig`].

use crate::config::MatchingConfig;
use crate::types::WindowBounds;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"\w+").unwrap();
}

/// Split a title into lowercase words
fn words(title: &str) -> HashSet<String> {
    WORD.find_iter(title)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Fraction of the reference title's words that also occur in the candidate.
/// An empty reference matches anything.
pub fn word_overlap(reference: &str, candidate: &str) -> f64 {
    let reference = words(reference);
    if reference.is_empty() {
        return 1.0;
    }
    let candidate = words(candidate);
    let shared = reference.intersection(&candidate).count();
    shared as f64 / reference.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub title_overlap_threshold: f64,
    pub geometry_tolerance_px: u32,
}

impl MatchPolicy {
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            title_overlap_threshold: config.title_overlap_threshold,
            geometry_tolerance_px: config.geometry_tolerance_px,
        }
    }

    pub fn titles_match(&self, reference: Option<&str>, candidate: Option<&str>) -> bool {
        let reference = reference.unwrap_or("");
        word_overlap(reference, candidate.unwrap_or("")) >= self.title_overlap_threshold
    }

    pub fn bounds_match(&self, a: &WindowBounds, b: &WindowBounds) -> bool {
        a.approx_eq(b, self.geometry_tolerance_px)
    }

    /// Title and geometry must both agree. Geometry that one side does not
    /// know never agrees.
    pub fn matches(
        &self,
        reference_title: Option<&str>,
        reference_bounds: Option<&WindowBounds>,
        candidate_title: Option<&str>,
        candidate_bounds: Option<&WindowBounds>,
    ) -> bool {
        let geometry = match (reference_bounds, candidate_bounds) {
            (Some(a), Some(b)) => self.bounds_match(a, b),
            _ => false,
        };
        geometry && self.titles_match(reference_title, candidate_title)
    }

    /// Title-led match used when geometry may be missing: geometry only
    /// vetoes when both sides report it.
    pub fn loosely_matches(
        &self,
        reference_title: Option<&str>,
        reference_bounds: Option<&WindowBounds>,
        candidate_title: Option<&str>,
        candidate_bounds: Option<&WindowBounds>,
    ) -> bool {
        let geometry = match (reference_bounds, candidate_bounds) {
            (Some(a), Some(b)) => self.bounds_match(a, b),
            _ => true,
        };
        geometry && self.titles_match(reference_title, candidate_title)
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default())
    }
}
