//! Aggregation methods that turn a topic's contributions into one result.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::contribution::Contribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Arithmetic mean of numeric data.
    Average,
    /// Mean weighted by quality × confidence; for non-numeric data, the
    /// contribution with the highest weight.
    WeightedAverage,
    /// The value shared by the largest group of contributions.
    MajorityVote,
    /// The contribution with the highest quality.
    BestQuality,
    /// Succeeds only when contributions agree.
    Consensus,
    /// Weighted average, falling back to majority vote, with a confidence boost.
    Ensemble,
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Average => "average",
            Self::WeightedAverage => "weighted_average",
            Self::MajorityVote => "majority_vote",
            Self::BestQuality => "best_quality",
            Self::Consensus => "consensus",
            Self::Ensemble => "ensemble",
        };
        f.write_str(s)
    }
}

/// The aggregated result for a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedKnowledge {
    pub topic: String,
    pub method: AggregationMethod,
    pub value: Value,
    pub confidence: f64,
    pub quality: f64,
    /// Agents whose contributions shaped the result.
    pub contributors: Vec<String>,
    pub contribution_count: usize,
    pub aggregated_at: DateTime<Utc>,
}

/// Tunables for the agreement-based methods.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationParams {
    /// Numeric consensus holds when the sample standard deviation is below
    /// this fraction of the mean's magnitude.
    pub consensus_tolerance: f64,
    /// Relative confidence boost applied by `Ensemble`.
    pub ensemble_boost: f64,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            consensus_tolerance: 0.1,
            ensemble_boost: 0.1,
        }
    }
}

/// Partial result before it is stamped with topic and method.
struct Reduced {
    value: Value,
    confidence: f64,
    quality: f64,
    contributors: Vec<String>,
}

/// Aggregate `contributions` with `method`. `None` means no result.
pub fn aggregate(
    topic: &str,
    contributions: &[Contribution],
    method: AggregationMethod,
    params: &AggregationParams,
) -> Option<AggregatedKnowledge> {
    if contributions.is_empty() {
        return None;
    }
    let reduced = match method {
        AggregationMethod::Average => average(contributions),
        AggregationMethod::WeightedAverage => weighted_average(contributions),
        AggregationMethod::MajorityVote => majority_vote(contributions),
        AggregationMethod::BestQuality => best_quality(contributions),
        AggregationMethod::Consensus => consensus(contributions, params.consensus_tolerance),
        AggregationMethod::Ensemble => ensemble(contributions, params.ensemble_boost),
    }?;

    Some(AggregatedKnowledge {
        topic: topic.to_string(),
        method,
        value: reduced.value,
        confidence: reduced.confidence,
        quality: reduced.quality,
        contributors: dedup(reduced.contributors),
        contribution_count: contributions.len(),
        aggregated_at: Utc::now(),
    })
}

/// Every value as `f64`, or `None` if any is non-numeric.
fn numeric_values(contributions: &[Contribution]) -> Option<Vec<f64>> {
    contributions.iter().map(Contribution::numeric).collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn agents(contributions: &[&Contribution]) -> Vec<String> {
    contributions.iter().map(|c| c.agent_id.clone()).collect()
}

fn dedup(agents: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    agents.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

fn single(c: &Contribution) -> Reduced {
    Reduced {
        value: c.data.clone(),
        confidence: c.confidence,
        quality: c.quality,
        contributors: vec![c.agent_id.clone()],
    }
}

/// The first contribution maximizing `key`.
fn first_max_by(contributions: &[Contribution], key: impl Fn(&Contribution) -> f64) -> Option<&Contribution> {
    contributions.iter().fold(None, |best: Option<&Contribution>, c| match best {
        Some(b) if key(b) >= key(c) => Some(b),
        _ => Some(c),
    })
}

fn average(contributions: &[Contribution]) -> Option<Reduced> {
    let values = numeric_values(contributions)?;
    let all: Vec<&Contribution> = contributions.iter().collect();
    Some(Reduced {
        value: Value::from(mean(values.into_iter())),
        confidence: mean(contributions.iter().map(|c| c.confidence)),
        quality: mean(contributions.iter().map(|c| c.quality)),
        contributors: agents(&all),
    })
}

fn weighted_average(contributions: &[Contribution]) -> Option<Reduced> {
    match numeric_values(contributions) {
        Some(values) => {
            let total: f64 = contributions.iter().map(Contribution::weight).sum();
            if total <= 0.0 {
                return None;
            }
            let weighted: f64 = contributions
                .iter()
                .zip(&values)
                .map(|(c, v)| c.weight() * v)
                .sum();
            let all: Vec<&Contribution> = contributions.iter().collect();
            Some(Reduced {
                value: Value::from(weighted / total),
                confidence: mean(contributions.iter().map(|c| c.confidence)),
                quality: mean(contributions.iter().map(|c| c.quality)),
                contributors: agents(&all),
            })
        }
        None => first_max_by(contributions, Contribution::weight).map(single),
    }
}

fn majority_vote(contributions: &[Contribution]) -> Option<Reduced> {
    // Groups in first-appearance order so ties go to the earliest value.
    let mut groups: Vec<(String, Vec<&Contribution>)> = Vec::new();
    for c in contributions {
        let key = c.text_key();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(c),
            None => groups.push((key, vec![c])),
        }
    }

    let (_, winners) = groups
        .into_iter()
        .fold(None, |best: Option<(String, Vec<&Contribution>)>, group| match best {
            Some(b) if b.1.len() >= group.1.len() => Some(b),
            _ => Some(group),
        })?;
    let first = winners.first()?;
    Some(Reduced {
        value: first.data.clone(),
        confidence: mean(winners.iter().map(|c| c.confidence)),
        quality: mean(winners.iter().map(|c| c.quality)),
        contributors: agents(&winners),
    })
}

fn best_quality(contributions: &[Contribution]) -> Option<Reduced> {
    first_max_by(contributions, |c| c.quality).map(single)
}

fn consensus(contributions: &[Contribution], tolerance: f64) -> Option<Reduced> {
    let all: Vec<&Contribution> = contributions.iter().collect();
    let quality = mean(contributions.iter().map(|c| c.quality));

    if let Some(values) = numeric_values(contributions) {
        let m = mean(values.iter().copied());
        let std_dev = sample_std_dev(&values, m);
        if std_dev == 0.0 || std_dev < tolerance * m.abs() {
            return Some(Reduced {
                value: Value::from(m),
                confidence: 1.0,
                quality,
                contributors: agents(&all),
            });
        }
        return None;
    }

    let first = contributions.first()?;
    let key = first.text_key();
    if contributions.iter().all(|c| c.text_key() == key) {
        Some(Reduced {
            value: first.data.clone(),
            confidence: 1.0,
            quality,
            contributors: agents(&all),
        })
    } else {
        None
    }
}

fn ensemble(contributions: &[Contribution], boost: f64) -> Option<Reduced> {
    let mut reduced = weighted_average(contributions).or_else(|| majority_vote(contributions))?;
    reduced.confidence = (reduced.confidence * (1.0 + boost)).min(1.0);
    Some(reduced)
}

fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
