//! Agent records and the registry the dispatcher selects from.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{check_unit_score, CoordinationError, Result};
use crate::events::{EventKind, EventLog};

/// A registered agent and its scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    /// Informational priority declared at registration (1 is highest).
    pub priority: u8,
    /// Moving average of task outcomes in `[0, 1]`.
    pub performance_score: f64,
    /// Tasks currently assigned and not yet finished.
    pub workload: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Cleared by `AgentRegistry::expire_stale`; dead agents are never selected.
    pub alive: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            priority: crate::messaging::DEFAULT_PRIORITY,
            performance_score: 1.0,
            workload: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            alive: true,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(1);
        self
    }

    /// Builder: set the initial performance score.
    pub fn with_performance(mut self, score: f64) -> Self {
        self.performance_score = score;
        self
    }

    /// Whether the agent declares every capability in `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Fold a task outcome into the performance average.
    ///
    /// `smoothing` is the weight of the new observation: success moves the
    /// score toward 1.0 and failure toward 0.0.
    pub fn record_outcome(&mut self, success: bool, smoothing: f64) {
        let target = if success { 1.0 } else { 0.0 };
        self.performance_score = self.performance_score * (1.0 - smoothing) + target * smoothing;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    /// Dispatch order: highest performance, then lowest workload, then id.
    fn dispatch_order(a: &AgentRecord, b: &AgentRecord) -> Ordering {
        b.performance_score
            .total_cmp(&a.performance_score)
            .then_with(|| a.workload.cmp(&b.workload))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Thread-safe table of agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    smoothing: f64,
    log: Arc<EventLog>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.read().len())
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

impl AgentRegistry {
    pub fn new(log: Arc<EventLog>, smoothing: f64) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            smoothing,
            log,
        }
    }

    pub fn register(&self, record: AgentRecord) -> Result<()> {
        check_unit_score("performance_score", record.performance_score)?;
        let id = record.id.clone();
        let capabilities = record.capabilities.clone();
        {
            let mut agents = self.agents.write();
            if agents.contains_key(&id) {
                return Err(CoordinationError::DuplicateAgent { agent_id: id });
            }
            agents.insert(id.clone(), record);
        }
        log::info!("[AgentRegistry] Registered agent {} with {:?}", id, capabilities);
        self.log.publish(
            EventKind::AgentRegistered,
            json!({ "agent_id": id, "capabilities": capabilities }),
            Some(&id),
        );
        Ok(())
    }

    pub fn deregister(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.write().remove(agent_id)
    }

    /// Refresh liveness. Revives an agent previously marked dead.
    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinationError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        agent.last_heartbeat = Utc::now();
        agent.alive = true;
        Ok(())
    }

    /// Mark every live agent silent for longer than `timeout` as dead.
    /// Returns the ids that expired in this sweep.
    pub fn expire_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut agents = self.agents.write();
            agents
                .values_mut()
                .filter(|a| a.alive)
                .filter(|a| (now - a.last_heartbeat).to_std().unwrap_or_default() > timeout)
                .map(|a| {
                    a.alive = false;
                    a.id.clone()
                })
                .collect()
        };

        for id in &expired {
            log::warn!("[AgentRegistry] Agent {} missed its heartbeat; marked dead", id);
            self.log
                .publish(EventKind::AgentExpired, json!({ "agent_id": id }), Some(id));
        }
        expired
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    /// All agents, sorted by id.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Live agents able to run a task needing `required`, best first.
    pub fn candidates(&self, required: &[String]) -> Vec<AgentRecord> {
        let mut candidates: Vec<AgentRecord> = self
            .agents
            .read()
            .values()
            .filter(|a| a.alive && a.has_capabilities(required))
            .cloned()
            .collect();
        candidates.sort_by(AgentRecord::dispatch_order);
        candidates
    }

    /// Select the best candidate and increment its workload atomically.
    pub(crate) fn claim_best(&self, required: &[String]) -> Option<String> {
        let mut agents = self.agents.write();
        let best = agents
            .values()
            .filter(|a| a.alive && a.has_capabilities(required))
            .min_by(|a, b| AgentRecord::dispatch_order(a, b))
            .map(|a| a.id.clone())?;
        if let Some(agent) = agents.get_mut(&best) {
            agent.workload += 1;
        }
        Some(best)
    }

    /// Finish a task on `agent_id`: decrement workload and, when `success`
    /// is known, update the performance average.
    pub(crate) fn finish_task(&self, agent_id: &str, success: Option<bool>) {
        let mut agents = self.agents.write();
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.workload = agent.workload.saturating_sub(1);
            if let Some(success) = success {
                agent.record_outcome(success, self.smoothing);
                log::debug!(
                    "[AgentRegistry] {} performance now {:.3}",
                    agent_id,
                    agent.performance_score
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}
