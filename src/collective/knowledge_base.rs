//! The collective intelligence service: contributions in, knowledge out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use super::aggregation::{aggregate, AggregatedKnowledge, AggregationMethod, AggregationParams};
use super::contribution::{AgentContribution, Contribution};
use super::patterns::{detect_patterns, CollaborationPattern};
use crate::config::CoordinatorConfig;
use crate::errors::{check_unit_score, Result};
use crate::events::{EventKind, EventLog};

/// Collects contributions per topic, aggregates them and tracks agent
/// reputation.
///
/// Lock order is topics, then agents, then knowledge; no method holds two
/// of them at once.
pub struct CollectiveIntelligence {
    topics: RwLock<BTreeMap<String, Vec<Contribution>>>,
    agents: RwLock<HashMap<String, AgentContribution>>,
    knowledge: RwLock<HashMap<String, AggregatedKnowledge>>,
    params: AggregationParams,
    default_min_contributions: usize,
    high_performance_threshold: f64,
    log: Option<Arc<EventLog>>,
}

impl std::fmt::Debug for CollectiveIntelligence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveIntelligence")
            .field("topics", &self.topics.read().len())
            .field("agents", &self.agents.read().len())
            .field("params", &self.params)
            .finish()
    }
}

impl Default for CollectiveIntelligence {
    fn default() -> Self {
        Self::new(&CoordinatorConfig::default())
    }
}

impl CollectiveIntelligence {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            topics: RwLock::new(BTreeMap::new()),
            agents: RwLock::new(HashMap::new()),
            knowledge: RwLock::new(HashMap::new()),
            params: AggregationParams {
                consensus_tolerance: config.consensus_tolerance,
                ensemble_boost: config.ensemble_confidence_boost,
            },
            default_min_contributions: config.default_min_contributions,
            high_performance_threshold: config.high_performance_threshold,
            log: None,
        }
    }

    /// Publish contributions and aggregations to `log`.
    pub fn with_event_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Record a contribution and fold its quality into the agent's running
    /// average. Returns the contribution id.
    pub fn contribute(
        &self,
        agent_id: &str,
        topic: &str,
        data: Value,
        quality: f64,
        confidence: f64,
    ) -> Result<String> {
        check_unit_score("quality", quality)?;
        check_unit_score("confidence", confidence)?;

        let contribution = Contribution::new(agent_id, topic, data, quality, confidence);
        let id = contribution.id.clone();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(contribution);
        self.agents
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentContribution::new(agent_id))
            .record(topic, quality);

        log::debug!("[Collective] {} contributed to {} (q={:.2})", agent_id, topic, quality);
        self.publish(
            EventKind::ContributionAdded,
            json!({
                "contribution_id": id,
                "topic": topic,
                "quality": quality,
                "confidence": confidence,
            }),
            Some(agent_id),
        );
        Ok(id)
    }

    /// Aggregate a topic. Returns `None` when fewer than `min_contributions`
    /// exist or the method yields no result; a result is cached as the
    /// topic's current knowledge.
    pub fn aggregate(
        &self,
        topic: &str,
        method: AggregationMethod,
        min_contributions: usize,
    ) -> Option<AggregatedKnowledge> {
        let contributions = self.contributions(topic);
        if contributions.len() < min_contributions.max(1) {
            log::debug!(
                "[Collective] {} has {} contributions, {} required",
                topic,
                contributions.len(),
                min_contributions
            );
            return None;
        }

        let result = aggregate(topic, &contributions, method, &self.params)?;
        self.knowledge
            .write()
            .insert(topic.to_string(), result.clone());
        self.publish(
            EventKind::KnowledgeAggregated,
            json!({
                "topic": topic,
                "method": method,
                "value": result.value,
                "confidence": result.confidence,
                "contributors": result.contributors,
            }),
            None,
        );
        Some(result)
    }

    /// `aggregate` with the configured minimum contribution count.
    pub fn aggregate_default(&self, topic: &str, method: AggregationMethod) -> Option<AggregatedKnowledge> {
        self.aggregate(topic, method, self.default_min_contributions)
    }

    pub fn detect_patterns(&self, min_occurrences: usize) -> Vec<CollaborationPattern> {
        detect_patterns(&self.topics.read(), min_occurrences, self.high_performance_threshold)
    }

    /// `quality_average * ln(1 + contribution_count)`; 0 for unknown agents.
    pub fn reputation(&self, agent_id: &str) -> f64 {
        self.agents
            .read()
            .get(agent_id)
            .map_or(0.0, AgentContribution::reputation)
    }

    /// Up to `n` agents by descending reputation, ties by id.
    pub fn top_agents(&self, n: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .agents
            .read()
            .values()
            .map(|a| (a.agent_id.clone(), a.reputation()))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn agent_profile(&self, agent_id: &str) -> Option<AgentContribution> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Latest aggregated knowledge for a topic.
    pub fn knowledge(&self, topic: &str) -> Option<AggregatedKnowledge> {
        self.knowledge.read().get(topic).cloned()
    }

    pub fn contributions(&self, topic: &str) -> Vec<Contribution> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.read().keys().cloned().collect()
    }

    fn publish(&self, kind: EventKind, data: Value, agent_id: Option<&str>) {
        if let Some(log) = &self.log {
            log.publish(kind, data, agent_id);
        }
    }
}
