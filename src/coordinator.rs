//! Top-level coordinator wiring every coordination service together.
//!
//! The `Coordinator` owns one instance of each service behind an `Arc` and
//! injects the shared [`EventLog`] into all of them:
//!
//! 1. **Blackboard**: shared state and the resource registry
//! 2. **Messaging**: the priority router and its delivery thread
//! 3. **Dispatch**: agent registry, task dispatcher and workflow engine
//! 4. **Negotiation**: bilateral negotiations, auctions and votes
//! 5. **Collective**: contributions, aggregation and reputation
//!
//! Workers report task results with a `COMPLETE` message addressed to
//! [`COORDINATOR_ID`]; the coordinator applies them to the workflow engine.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::blackboard::{ResourceRegistry, SharedState};
use crate::collective::CollectiveIntelligence;
use crate::config::CoordinatorConfig;
use crate::dispatch::{AgentRecord, TaskDispatcher, WorkflowEngine};
use crate::errors::{ConfigError, Result};
use crate::events::EventLog;
use crate::messaging::{
    DeliveryLoop, Message, MessageHandler, MessageKind, MessagePayload, MessageRouter, TaskOutcome,
};
use crate::negotiation::{
    AuctionHouse, AuctionOutcome, NegotiationManager, NegotiationOutcome, VoteOutcome, VotingBooth,
};

/// Recipient id for task results reported by workers.
pub const COORDINATOR_ID: &str = "coordinator";

/// What one maintenance sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_agents: Vec<String>,
    /// `(agent, resource)` holds released because the agent expired.
    pub released_resources: Vec<(String, String)>,
    pub negotiations: Vec<NegotiationOutcome>,
    pub auctions: Vec<AuctionOutcome>,
    pub votes: Vec<VoteOutcome>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_agents.is_empty()
            && self.released_resources.is_empty()
            && self.negotiations.is_empty()
            && self.auctions.is_empty()
            && self.votes.is_empty()
    }
}

/// Facade over the coordination substrate.
pub struct Coordinator {
    config: CoordinatorConfig,
    log: Arc<EventLog>,
    state: Arc<SharedState>,
    resources: Arc<ResourceRegistry>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<TaskDispatcher>,
    workflows: Arc<WorkflowEngine>,
    negotiations: Arc<NegotiationManager>,
    auctions: Arc<AuctionHouse>,
    votes: Arc<VotingBooth>,
    collective: Arc<CollectiveIntelligence>,
    delivery: Mutex<Option<DeliveryLoop>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("events", &self.log.len())
            .field("resources", &self.resources.len())
            .field("agents", &self.dispatcher.agents().len())
            .field("pending_messages", &self.router.pending())
            .finish()
    }
}

impl Coordinator {
    /// Build every service from a validated configuration.
    pub fn new(config: CoordinatorConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let log = Arc::new(EventLog::new());
        let router = Arc::new(MessageRouter::new(log.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            router.clone(),
            log.clone(),
            config.performance_smoothing,
        ));
        let workflows = WorkflowEngine::new(dispatcher.clone());

        // Weak: the engine already owns the router through the dispatcher.
        let engine = Arc::downgrade(&workflows);
        router.register_handler(COORDINATOR_ID, move |message: &Message| {
            apply_task_report(&engine, message);
        });

        let coordinator = Self {
            state: Arc::new(SharedState::new(log.clone())),
            resources: Arc::new(ResourceRegistry::new(log.clone())),
            negotiations: Arc::new(NegotiationManager::new(log.clone(), config.negotiation_max_rounds)),
            auctions: Arc::new(AuctionHouse::new(log.clone())),
            votes: Arc::new(VotingBooth::new(log.clone(), config.vote_close_when_complete)),
            collective: Arc::new(CollectiveIntelligence::new(&config).with_event_log(log.clone())),
            router,
            dispatcher,
            workflows,
            log,
            config,
            delivery: Mutex::new(None),
        };
        log::info!("[Coordinator] Initialized");
        Ok(coordinator)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }

    pub fn negotiations(&self) -> &Arc<NegotiationManager> {
        &self.negotiations
    }

    pub fn auctions(&self) -> &Arc<AuctionHouse> {
        &self.auctions
    }

    pub fn votes(&self) -> &Arc<VotingBooth> {
        &self.votes
    }

    pub fn collective(&self) -> &Arc<CollectiveIntelligence> {
        &self.collective
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Register an agent whose inbound messages go to `handler`.
    pub fn register_agent(&self, record: AgentRecord, handler: impl MessageHandler + 'static) -> Result<()> {
        let id = record.id.clone();
        self.dispatcher.register_agent(record)?;
        self.router.register_handler(id, handler);
        Ok(())
    }

    /// Register an agent served by a worker thread reading from the
    /// returned inbox.
    pub fn register_worker(&self, record: AgentRecord) -> Result<UnboundedReceiver<Message>> {
        let id = record.id.clone();
        self.dispatcher.register_agent(record)?;
        Ok(self.router.register_inbox(id))
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.dispatcher.agents().heartbeat(agent_id)
    }

    /// Send `agent_id`'s result for `task_id` to the coordinator.
    pub fn report_result(&self, agent_id: &str, task_id: &str, outcome: TaskOutcome) -> String {
        let message = Message::new(
            agent_id,
            COORDINATOR_ID,
            MessageKind::Complete,
            MessagePayload::TaskResult {
                task_id: task_id.to_string(),
                outcome,
            },
        )
        .in_conversation(task_id);
        self.router.send(message)
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    /// `ResourceRegistry::request` with the configured default timeout.
    pub fn request_resource(&self, resource_id: &str, agent_id: &str) -> Result<bool> {
        self.resources
            .request(resource_id, agent_id, self.config.default_request_timeout())
    }

    // -----------------------------------------------------------------------
    // Delivery and maintenance
    // -----------------------------------------------------------------------

    /// Start the background delivery thread if it is not already running.
    pub fn start_delivery(&self) -> io::Result<()> {
        let mut delivery = self.delivery.lock();
        if delivery.is_none() {
            *delivery = Some(
                self.router
                    .spawn_delivery_loop(self.config.delivery_batch_size, self.config.delivery_interval())?,
            );
        }
        Ok(())
    }

    pub fn stop_delivery(&self) {
        if let Some(mut delivery) = self.delivery.lock().take() {
            delivery.stop();
        }
    }

    /// Deliver every queued message on the calling thread.
    pub fn deliver_pending(&self) -> usize {
        self.router.deliver_all()
    }

    /// Expire silent agents (releasing what they held) and close every
    /// session past its deadline.
    pub fn sweep(&self) -> SweepReport {
        let expired_agents = self
            .dispatcher
            .agents()
            .expire_stale(self.config.heartbeat_timeout());
        let released_resources = expired_agents
            .iter()
            .flat_map(|agent| {
                self.resources
                    .release_all(agent)
                    .into_iter()
                    .map(move |resource| (agent.clone(), resource))
            })
            .collect();

        let report = SweepReport {
            expired_agents,
            released_resources,
            negotiations: self.negotiations.sweep_expired(),
            auctions: self.auctions.sweep_expired(),
            votes: self.votes.sweep_expired(),
        };
        if !report.is_empty() {
            log::info!(
                "[Coordinator] Sweep: {} agents expired, {} holds released, {} sessions closed",
                report.expired_agents.len(),
                report.released_resources.len(),
                report.negotiations.len() + report.auctions.len() + report.votes.len()
            );
        }
        report
    }

    /// How long `sweep` considers an agent alive without a heartbeat.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.config.heartbeat_timeout()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop_delivery();
    }
}

/// Apply a worker's `COMPLETE` report to the workflow engine.
fn apply_task_report(engine: &Weak<WorkflowEngine>, message: &Message) {
    let Some(engine) = engine.upgrade() else {
        return;
    };
    let MessagePayload::TaskResult { task_id, outcome } = &message.payload else {
        log::debug!(
            "[Coordinator] Ignoring {} message {} from {}",
            message.kind,
            message.id,
            message.sender
        );
        return;
    };

    let assigned = engine
        .dispatcher()
        .task(task_id)
        .and_then(|t| t.assigned_agent);
    if assigned.as_deref() != Some(message.sender.as_str()) {
        log::warn!(
            "[Coordinator] {} reported on task {} assigned to {:?}; ignored",
            message.sender,
            task_id,
            assigned
        );
        return;
    }

    let applied = match outcome {
        TaskOutcome::Success { result } => engine.complete_task(task_id, result.clone()),
        TaskOutcome::Failure { error } => engine.fail_task(task_id, error.clone()),
    };
    if let Err(err) = applied {
        log::warn!("[Coordinator] Could not apply report for {}: {}", task_id, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::{ResourceKind, ResourceSpec};
    use crate::dispatch::{Task, TaskStatus};
    use serde_json::json;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoordinatorConfig {
            delivery_batch_size: 0,
            ..CoordinatorConfig::default()
        };
        assert!(Coordinator::new(config).is_err());
    }

    #[test]
    fn test_reported_result_completes_task() {
        let c = coordinator();
        let mut inbox = c.register_worker(AgentRecord::new("worker", ["x"])).unwrap();
        c.dispatcher().submit(Task::new("t1", "work").with_capabilities(["x"])).unwrap();
        c.deliver_pending();
        assert!(inbox.try_recv().is_ok());

        c.report_result("worker", "t1", TaskOutcome::Success { result: json!(7) });
        c.deliver_pending();
        let task = c.dispatcher().task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!(7)));
    }

    #[test]
    fn test_report_from_wrong_agent_ignored() {
        let c = coordinator();
        let _inbox = c.register_worker(AgentRecord::new("worker", ["x"])).unwrap();
        c.dispatcher().submit(Task::new("t1", "")).unwrap();
        c.report_result("impostor", "t1", TaskOutcome::Failure { error: "no".into() });
        c.deliver_pending();
        assert_eq!(c.dispatcher().status("t1"), Some(TaskStatus::Assigned));
    }

    #[test]
    fn test_dispatcher_failure_cancels_workflow_dependents() {
        let c = coordinator();
        let _inbox = c.register_worker(AgentRecord::new("worker", ["x"])).unwrap();
        let tasks = vec![
            Task::new("T1", "").with_capabilities(["x"]),
            Task::new("T2", "").with_capabilities(["x"]).with_dependencies(["T1"]),
        ];
        c.workflows().create_workflow("wf", tasks).unwrap();
        c.dispatcher().fail_task("T1", "boom").unwrap();
        assert_eq!(c.dispatcher().status("T2"), Some(TaskStatus::Cancelled));

        let renamed = vec![
            Task::new("U1", "").with_capabilities(["x"]),
            Task::new("U2", "").with_capabilities(["x"]).with_dependencies(["U1"]),
        ];
        c.workflows().create_workflow("wf2", renamed).unwrap();
        c.dispatcher().complete_task("U1", json!(1)).unwrap();
        assert_eq!(c.dispatcher().status("U2"), Some(TaskStatus::Assigned));
    }

    #[test]
    fn test_sweep_releases_expired_agent_holds() {
        let config = CoordinatorConfig {
            heartbeat_timeout_ms: 5,
            ..CoordinatorConfig::default()
        };
        let c = Coordinator::new(config).unwrap();
        let _inbox = c.register_worker(AgentRecord::new("flaky", ["x"])).unwrap();
        let id = c
            .resources()
            .create_resource(ResourceSpec::exclusive("db", ResourceKind::Data, "ops"))
            .unwrap();
        assert!(c.request_resource(&id, "flaky").unwrap());

        std::thread::sleep(Duration::from_millis(20));
        let report = c.sweep();
        assert_eq!(report.expired_agents, vec!["flaky".to_string()]);
        assert_eq!(report.released_resources, vec![("flaky".to_string(), id.clone())]);
        assert!(c.resources().holders(&id).unwrap().is_empty());
    }

    #[test]
    fn test_delivery_thread_start_stop() {
        let c = coordinator();
        c.start_delivery().unwrap();
        c.start_delivery().unwrap();
        c.stop_delivery();
        c.stop_delivery();
    }
}
