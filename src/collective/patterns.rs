//! Collaboration pattern mining over contributions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::contribution::Contribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Two agents repeatedly contribute to the same topics.
    Collaboration,
    /// A collaborating pair whose joint contributions are high quality.
    HighPerformancePair,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationPattern {
    pub kind: PatternKind,
    /// Lexically ordered pair.
    pub agents: (String, String),
    /// Number of topics both agents contributed to.
    pub occurrences: usize,
    pub shared_topics: Vec<String>,
    /// Mean quality of both agents' contributions on the shared topics.
    pub mean_quality: f64,
}

/// Emit a `Collaboration` pattern for every agent pair sharing at least
/// `min_occurrences` topics, plus a `HighPerformancePair` when their mean
/// quality on those topics exceeds `quality_threshold`.
pub fn detect_patterns(
    by_topic: &BTreeMap<String, Vec<Contribution>>,
    min_occurrences: usize,
    quality_threshold: f64,
) -> Vec<CollaborationPattern> {
    let mut shared: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for (topic, contributions) in by_topic {
        let agents: BTreeSet<&str> = contributions.iter().map(|c| c.agent_id.as_str()).collect();
        let agents: Vec<&str> = agents.into_iter().collect();
        for (i, a) in agents.iter().enumerate() {
            for b in &agents[i + 1..] {
                shared
                    .entry((a.to_string(), b.to_string()))
                    .or_default()
                    .push(topic.clone());
            }
        }
    }

    let mut patterns = Vec::new();
    for ((a, b), topics) in shared {
        let occurrences = topics.len();
        if occurrences == 0 || occurrences < min_occurrences {
            continue;
        }

        let qualities: Vec<f64> = topics
            .iter()
            .filter_map(|t| by_topic.get(t))
            .flatten()
            .filter(|c| c.agent_id == a || c.agent_id == b)
            .map(|c| c.quality)
            .collect();
        let mean_quality = if qualities.is_empty() {
            0.0
        } else {
            qualities.iter().sum::<f64>() / qualities.len() as f64
        };

        patterns.push(CollaborationPattern {
            kind: PatternKind::Collaboration,
            agents: (a.clone(), b.clone()),
            occurrences,
            shared_topics: topics.clone(),
            mean_quality,
        });
        if mean_quality > quality_threshold {
            patterns.push(CollaborationPattern {
                kind: PatternKind::HighPerformancePair,
                agents: (a, b),
                occurrences,
                shared_topics: topics,
                mean_quality,
            });
        }
    }
    patterns
}
