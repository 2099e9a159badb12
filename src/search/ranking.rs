//! Relevance scoring and deterministic result ordering

use crate::config::{RelevanceWeights, SchemaConfig};
use crate::search::QueryPreferences;
use crate::storage::Document;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub document: Document,
    /// `None` for unranked fallback items
    pub score: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RankedResult {
    pub fn id(&self) -> &str {
        &self.document.id
    }
}

/// Score desc, recency desc, id desc; missing scores and timestamps sort last
pub fn rank_order(a: &RankedResult, b: &RankedResult) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.document.id.cmp(&a.document.id))
}

/// Integer relevance scoring
pub trait Ranker: Send + Sync {
    fn score(&self, doc: &Document, prefs: &QueryPreferences, now: DateTime<Utc>) -> i64;
}

/// Weighted sum of preference matches plus a two-step recency bonus
#[derive(Debug, Clone)]
pub struct WeightedRanker {
    weights: RelevanceWeights,
    schema: SchemaConfig,
}

impl WeightedRanker {
    pub fn new(weights: RelevanceWeights, schema: SchemaConfig) -> Self {
        Self { weights, schema }
    }

    fn recency_bonus(&self, doc: &Document, now: DateTime<Utc>) -> i64 {
        let Some(timestamp) = doc.timestamp(&self.schema.timestamp_field) else {
            return 0;
        };
        // Clock skew can put timestamps slightly in the future
        let age = (now - timestamp).to_std().unwrap_or_default();
        if age <= self.weights.short_recency_window {
            self.weights.short_recency_bonus
        } else if age <= self.weights.medium_recency_window {
            self.weights.medium_recency_bonus
        } else {
            0
        }
    }
}

impl Ranker for WeightedRanker {
    fn score(&self, doc: &Document, prefs: &QueryPreferences, now: DateTime<Utc>) -> i64 {
        let schema = &self.schema;
        let mut score = 0;

        if doc
            .i64_field(&schema.group_field)
            .is_some_and(|group| prefs.preferred_groups.contains(&group))
        {
            score += self.weights.group;
        }

        if doc
            .str_field(&schema.category_field)
            .is_some_and(|category| matches_category(category, &prefs.categories))
        {
            score += self.weights.category;
        }

        if let (Some(range), Some(value)) = (prefs.numeric_range, doc.f64_field(&schema.numeric_field)) {
            if !range.is_unbounded() && range.contains(value) {
                score += self.weights.numeric_range;
            }
        }

        if !prefs.required_flags.is_empty() && has_flags(doc, &prefs.required_flags) {
            score += self.weights.requirement;
        }

        score + self.recency_bonus(doc, now)
    }
}

pub(crate) fn matches_category(category: &str, wanted: &[String]) -> bool {
    wanted.iter().any(|w| w.eq_ignore_ascii_case(category))
}

pub(crate) fn has_flags(doc: &Document, flags: &[String]) -> bool {
    flags.iter().all(|flag| doc.bool_field(flag) == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::NumericRange;
    use chrono::Duration;
    use serde_json::json;

    fn ranker() -> WeightedRanker {
        WeightedRanker::new(RelevanceWeights::default(), SchemaConfig::default())
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(hours_ago: i64) -> i64 {
        (now() - Duration::hours(hours_ago)).timestamp_millis()
    }

    #[test]
    fn test_weighted_score() {
        let prefs = QueryPreferences {
            preferred_groups: vec![7],
            categories: vec!["Commercial".into()],
            numeric_range: Some(NumericRange::new(Some(30.0), Some(40.0))),
            required_flags: vec!["perDiem".into()],
            ..Default::default()
        };
        let doc = Document::new(
            "a",
            json!({
                "local": "7",
                "constructionType": "commercial",
                "hours": 40,
                "perDiem": true,
                "timestamp": at(2),
            }),
        );
        assert_eq!(ranker().score(&doc, &prefs, now()), 100 + 50 + 30 + 20 + 10);
    }

    #[test]
    fn test_recency_steps() {
        let prefs = QueryPreferences::default();
        let score = |hours| {
            let doc = Document::new("d", json!({"timestamp": at(hours)}));
            ranker().score(&doc, &prefs, now())
        };
        assert_eq!(score(23), 10);
        assert_eq!(score(48), 5);
        assert_eq!(score(24 * 8), 0);
        assert_eq!(score(-1), 10);
    }

    #[test]
    fn test_rank_order_is_total_and_deterministic() {
        let item = |id: &str, score: Option<i64>, ts: i64| RankedResult {
            document: Document::new(id, json!({})),
            score,
            timestamp: DateTime::from_timestamp(ts, 0),
        };
        let mut items = vec![
            item("a", Some(10), 5),
            item("b", Some(10), 5),
            item("c", Some(20), 1),
            item("d", None, 100),
            item("e", Some(10), 9),
        ];
        items.sort_by(rank_order);
        let ids: Vec<_> = items.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["c", "e", "b", "a", "d"]);
    }
}
