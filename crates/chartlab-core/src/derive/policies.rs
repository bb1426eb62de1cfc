//! Aggregation over per-note flag features.

use std::collections::BTreeMap;

use super::{AggregationPolicy, DerivedLabel};
use crate::models::NoteFeature;

/// Group features by name, keeping input order. Names without `prefix` are ignored.
fn by_label<'f>(prefix: &str, features: &'f [NoteFeature]) -> BTreeMap<String, Vec<&'f NoteFeature>> {
    let mut grouped: BTreeMap<String, Vec<&NoteFeature>> = BTreeMap::new();
    for feature in features {
        if let Some(label) = feature.feature_name.strip_prefix(prefix) {
            if !label.is_empty() {
                grouped.entry(label.to_string()).or_default().push(feature);
            }
        }
    }
    grouped
}

/// 1.0 if any note flags the feature, else 0.0.
///
/// A label whose features all record failures is left out rather than read as absent.
#[derive(Debug, Clone)]
pub struct PresencePolicy {
    prefix: String,
}

impl PresencePolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl AggregationPolicy for PresencePolicy {
    fn name(&self) -> &str {
        "presence"
    }

    fn aggregate(&self, features: &[NoteFeature]) -> Vec<DerivedLabel> {
        by_label(&self.prefix, features)
            .into_iter()
            .filter_map(|(label_name, group)| {
                let evidence = group
                    .iter()
                    .find(|f| f.is_truthy())
                    .or_else(|| group.iter().find(|f| !f.is_failure()))?;
                Some(DerivedLabel {
                    label_name,
                    label_value: if evidence.is_truthy() { 1.0 } else { 0.0 },
                    note_feature_id: Some(evidence.id),
                    line_number: None,
                })
            })
            .collect()
    }
}

/// Number of notes flagging the feature.
#[derive(Debug, Clone)]
pub struct MentionCountPolicy {
    prefix: String,
}

impl MentionCountPolicy {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl AggregationPolicy for MentionCountPolicy {
    fn name(&self) -> &str {
        "mention_count"
    }

    fn aggregate(&self, features: &[NoteFeature]) -> Vec<DerivedLabel> {
        by_label(&self.prefix, features)
            .into_iter()
            .filter(|(_, group)| group.iter().any(|f| !f.is_failure()))
            .map(|(label_name, group)| {
                let mentions: Vec<_> = group.iter().filter(|f| f.is_truthy()).collect();
                DerivedLabel {
                    label_name,
                    label_value: mentions.len() as f64,
                    note_feature_id: mentions.first().map(|f| f.id),
                    line_number: None,
                }
            })
            .collect()
    }
}
