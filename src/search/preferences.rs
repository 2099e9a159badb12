//! Caller preferences driving the ranked search

use crate::sharding::Region;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Inclusive numeric range; an open bound is unconstrained
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NumericRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Immutable per-call search preferences
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryPreferences {
    /// Preferred group identifiers, strongest ranking signal
    pub preferred_groups: Vec<i64>,
    pub categories: Vec<String>,
    pub numeric_range: Option<NumericRange>,
    /// Boolean fields that must be true
    pub required_flags: Vec<String>,
    /// Regions the search is routed to; empty means all
    pub regions: BTreeSet<Region>,
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "any", "for", "in", "job", "jobs", "local", "near", "of", "or", "the", "with",
];

impl QueryPreferences {
    pub fn is_empty(&self) -> bool {
        self.preferred_groups.is_empty()
            && self.categories.is_empty()
            && self.numeric_range.map_or(true, |r| r.is_unbounded())
            && self.required_flags.is_empty()
            && self.regions.is_empty()
    }

    /// Parse free text into preferences
    ///
    /// Integers (optionally `#`-prefixed) become preferred groups, `lo-hi`
    /// becomes the numeric range, `+flag` a required flag, region names
    /// target regions; remaining non-stop words are category preferences.
    pub fn from_text(text: &str) -> Self {
        let mut prefs = Self::default();

        for token in text
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
        {
            if let Some(flag) = token.strip_prefix('+') {
                if !flag.is_empty() && !prefs.required_flags.iter().any(|f| f == flag) {
                    prefs.required_flags.push(flag.to_string());
                }
                continue;
            }

            if let Ok(group) = token.trim_start_matches('#').parse::<i64>() {
                if !prefs.preferred_groups.contains(&group) {
                    prefs.preferred_groups.push(group);
                }
                continue;
            }

            if let Some(range) = parse_range(token) {
                prefs.numeric_range = Some(range);
                continue;
            }

            if let Ok(region) = token.parse::<Region>() {
                if region != Region::Unknown {
                    prefs.regions.insert(region);
                    continue;
                }
            }

            let word = token.trim_matches(|c: char| !c.is_alphanumeric());
            if word.is_empty() || STOP_WORDS.contains(&word.to_ascii_lowercase().as_str()) {
                continue;
            }
            if !prefs
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(word))
            {
                prefs.categories.push(word.to_string());
            }
        }

        prefs
    }
}

fn parse_range(token: &str) -> Option<NumericRange> {
    let (lo, hi) = token.split_once('-')?;
    let min = if lo.is_empty() { None } else { Some(lo.parse::<f64>().ok()?) };
    let max = if hi.is_empty() { None } else { Some(hi.parse::<f64>().ok()?) };
    if min.is_none() && max.is_none() {
        return None;
    }
    Some(NumericRange::new(min, max))
}
