//! Contributions and per-agent contribution profiles.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One agent's input on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub agent_id: String,
    pub topic: String,
    pub data: Value,
    /// In `[0, 1]`.
    pub quality: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Contribution {
    pub fn new(
        agent_id: impl Into<String>,
        topic: impl Into<String>,
        data: Value,
        quality: f64,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            topic: topic.into(),
            data,
            quality,
            confidence,
            timestamp: Utc::now(),
        }
    }

    /// `quality * confidence`.
    pub fn weight(&self) -> f64 {
        self.quality * self.confidence
    }

    pub fn numeric(&self) -> Option<f64> {
        self.data.as_f64()
    }

    /// Textual form used to group equal values: the inner text of a JSON
    /// string, the compact JSON rendering of anything else.
    pub fn text_key(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Running statistics for one contributing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContribution {
    pub agent_id: String,
    pub contribution_count: u64,
    /// Cumulative mean of every contribution's quality.
    pub quality_average: f64,
    pub topics: BTreeSet<String>,
    pub last_contribution: DateTime<Utc>,
}

impl AgentContribution {
    pub(crate) fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            contribution_count: 0,
            quality_average: 0.0,
            topics: BTreeSet::new(),
            last_contribution: Utc::now(),
        }
    }

    pub(crate) fn record(&mut self, topic: &str, quality: f64) {
        self.contribution_count += 1;
        self.quality_average += (quality - self.quality_average) / self.contribution_count as f64;
        self.topics.insert(topic.to_string());
        self.last_contribution = Utc::now();
    }

    /// `quality_average * ln(1 + contribution_count)`.
    pub fn reputation(&self) -> f64 {
        reputation(self.quality_average, self.contribution_count)
    }
}

pub(crate) fn reputation(quality_average: f64, contribution_count: u64) -> f64 {
    quality_average * (1.0 + contribution_count as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_running_quality_mean() {
        let mut profile = AgentContribution::new("a");
        for q in [0.9, 0.6, 0.3] {
            profile.record("t", q);
        }
        assert_eq!(profile.contribution_count, 3);
        assert!((profile.quality_average - 0.6).abs() < 1e-12);
        assert_eq!(profile.topics.len(), 1);
    }

    #[test]
    fn test_reputation_monotonic() {
        for count in 1..20u64 {
            let mut previous = reputation(0.0, count);
            for step in 1..=10 {
                let current = reputation(step as f64 / 10.0, count);
                assert!(current >= previous);
                previous = current;
            }
        }
        for quality in [0.1, 0.5, 1.0] {
            for count in 0..50u64 {
                assert!(reputation(quality, count + 1) > reputation(quality, count));
            }
        }
    }

    #[test]
    fn test_text_key() {
        let c = Contribution::new("a", "t", json!("yes"), 1.0, 1.0);
        assert_eq!(c.text_key(), "yes");
        let c = Contribution::new("a", "t", json!({"k": 1}), 1.0, 1.0);
        assert_eq!(c.text_key(), r#"{"k":1}"#);
        assert_eq!(Contribution::new("a", "t", json!(3), 0.5, 0.5).weight(), 0.25);
    }
}
