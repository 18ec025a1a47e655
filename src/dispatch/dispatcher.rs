//! Capability-based task distribution.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::{json, Value};

use super::agent::{AgentRecord, AgentRegistry};
use super::task::{Task, TaskStatus};
use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};
use crate::messaging::{Message, MessageKind, MessagePayload, MessageRouter};

/// Sender id used on REQUEST messages the dispatcher emits.
pub const DISPATCHER_ID: &str = "dispatcher";

/// Told about every task that reaches `Completed` or `Failed`, after the
/// dispatcher has released its locks.
pub(crate) trait TaskObserver: Send + Sync {
    fn task_finished(&self, task: &Task);
}

/// Matches tasks to agents and tracks task state.
///
/// Lock order is tasks then agents; no path takes them the other way round.
pub struct TaskDispatcher {
    agents: AgentRegistry,
    tasks: RwLock<HashMap<String, Task>>,
    router: Arc<MessageRouter>,
    log: Arc<EventLog>,
    observer: RwLock<Option<Weak<dyn TaskObserver>>>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("agents", &self.agents.len())
            .field("tasks", &self.tasks.read().len())
            .finish()
    }
}

impl TaskDispatcher {
    pub fn new(router: Arc<MessageRouter>, log: Arc<EventLog>, performance_smoothing: f64) -> Self {
        Self {
            agents: AgentRegistry::new(log.clone(), performance_smoothing),
            tasks: RwLock::new(HashMap::new()),
            router,
            log,
            observer: RwLock::new(None),
        }
    }

    /// Route completions and failures to `observer`, replacing any previous one.
    pub(crate) fn set_observer(&self, observer: Weak<dyn TaskObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub(crate) fn events(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn register_agent(&self, record: AgentRecord) -> Result<()> {
        self.agents.register(record)
    }

    /// Store a task without distributing it.
    pub fn register_task(&self, task: Task) -> Result<()> {
        self.register_tasks(vec![task])
    }

    /// Store all of `tasks` or none of them.
    pub(crate) fn register_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        let mut table = self.tasks.write();
        if let Some(taken) = tasks.iter().find(|t| table.contains_key(&t.id)) {
            return Err(CoordinationError::DuplicateTask {
                task_id: taken.id.clone(),
            });
        }
        for task in tasks {
            table.insert(task.id.clone(), task);
        }
        Ok(())
    }

    /// Register `task` and distribute it. Returns the chosen agent id.
    pub fn submit(&self, task: Task) -> Result<String> {
        let task_id = task.id.clone();
        self.register_task(task)?;
        self.distribute(&task_id)
    }

    /// Assign a pending task to the best capable agent and send it a
    /// REQUEST message. Returns the chosen agent id.
    ///
    /// When no live agent has every required capability the task becomes
    /// `Failed` (terminal) and `NoCapableAgent` is returned.
    pub fn distribute(&self, task_id: &str) -> Result<String> {
        let assigned = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get(task_id)
                .ok_or_else(|| CoordinationError::UnknownTask {
                    task_id: task_id.to_string(),
                })?;

            if task.status != TaskStatus::Pending {
                return Err(CoordinationError::InvalidTransition {
                    entity: "task",
                    id: task_id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Assigned.to_string(),
                });
            }

            let pending: Vec<String> = task
                .dependencies
                .iter()
                .filter(|dep| tasks.get(*dep).map(|d| d.status) != Some(TaskStatus::Completed))
                .cloned()
                .collect();
            if !pending.is_empty() {
                return Err(CoordinationError::DependenciesUnmet {
                    task_id: task_id.to_string(),
                    pending,
                });
            }

            let required = task.required_capabilities.clone();
            let chosen = self.agents.claim_best(&required);
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| CoordinationError::UnknownTask {
                    task_id: task_id.to_string(),
                })?;
            match chosen {
                Some(agent_id) => {
                    task.transition(TaskStatus::Assigned)?;
                    task.assigned_agent = Some(agent_id);
                    Ok(task.clone())
                }
                None => {
                    task.transition(TaskStatus::Failed)?;
                    task.error = Some(format!("no capable agent (requires {:?})", required));
                    Err(CoordinationError::NoCapableAgent {
                        task_id: task_id.to_string(),
                        required,
                    })
                }
            }
        };

        let task = match assigned {
            Ok(task) => task,
            Err(err) => {
                if let CoordinationError::NoCapableAgent { .. } = &err {
                    log::warn!("[TaskDispatcher] {}", err);
                    self.log.publish(
                        EventKind::TaskFailed,
                        json!({ "task_id": task_id, "error": err.to_string() }),
                        None,
                    );
                    if let Some(task) = self.task(task_id) {
                        self.notify_finished(&task);
                    }
                }
                return Err(err);
            }
        };

        let agent_id = task.assigned_agent.clone().unwrap_or_default();
        let request = Message::new(
            DISPATCHER_ID,
            agent_id.clone(),
            MessageKind::Request,
            MessagePayload::TaskRequest {
                task_id: task.id.clone(),
                required_capabilities: task.required_capabilities.clone(),
                input: task.input.clone(),
            },
        )
        .with_priority(task.priority)
        .in_conversation(task.id.clone());
        self.router.send(request);

        log::info!("[TaskDispatcher] Task {} assigned to {}", task.id, agent_id);
        self.log.publish(
            EventKind::TaskAssigned,
            json!({ "task_id": task.id, "agent_id": agent_id }),
            Some(&agent_id),
        );
        Ok(agent_id)
    }

    /// The assigned agent reports it started work.
    pub fn start_task(&self, task_id: &str) -> Result<Task> {
        let task = self.update(task_id, |task| task.transition(TaskStatus::InProgress))?;
        self.log.publish(
            EventKind::TaskStarted,
            json!({ "task_id": task_id }),
            task.assigned_agent.as_deref(),
        );
        Ok(task)
    }

    /// Record a successful result and credit the assigned agent.
    pub fn complete_task(&self, task_id: &str, result: Value) -> Result<Task> {
        let task = self.update(task_id, |task| {
            task.transition(TaskStatus::Completed)?;
            task.result = Some(result);
            Ok(())
        })?;
        if let Some(agent) = &task.assigned_agent {
            self.agents.finish_task(agent, Some(true));
        }
        log::info!("[TaskDispatcher] Task {} completed", task_id);
        self.log.publish(
            EventKind::TaskCompleted,
            json!({ "task_id": task_id, "result": task.result }),
            task.assigned_agent.as_deref(),
        );
        self.notify_finished(&task);
        Ok(task)
    }

    /// Record a failure and debit the assigned agent.
    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) -> Result<Task> {
        let error = error.into();
        let task = self.update(task_id, |task| {
            task.transition(TaskStatus::Failed)?;
            task.error = Some(error.clone());
            Ok(())
        })?;
        if let Some(agent) = &task.assigned_agent {
            self.agents.finish_task(agent, Some(false));
        }
        log::warn!("[TaskDispatcher] Task {} failed: {}", task_id, error);
        self.log.publish(
            EventKind::TaskFailed,
            json!({ "task_id": task_id, "error": error }),
            task.assigned_agent.as_deref(),
        );
        self.notify_finished(&task);
        Ok(task)
    }

    /// Cancel a non-terminal task. Returns `false` if it was already terminal.
    pub(crate) fn cancel(&self, task_id: &str, reason: &str) -> Result<bool> {
        let cancelled = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| CoordinationError::UnknownTask {
                    task_id: task_id.to_string(),
                })?;
            if task.status.is_terminal() {
                return Ok(false);
            }
            let was_assigned = task.assigned_agent.clone();
            task.transition(TaskStatus::Cancelled)?;
            task.error = Some(reason.to_string());
            was_assigned
        };
        if let Some(agent) = &cancelled {
            self.agents.finish_task(agent, None);
        }
        log::info!("[TaskDispatcher] Task {} cancelled: {}", task_id, reason);
        self.log.publish(
            EventKind::TaskCancelled,
            json!({ "task_id": task_id, "reason": reason }),
            None,
        );
        Ok(true)
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.read().get(task_id).map(|t| t.status)
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.tasks.read().contains_key(task_id)
    }

    /// Tasks in `status`, sorted by id.
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    fn notify_finished(&self, task: &Task) {
        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.task_finished(task);
        }
    }

    fn update(&self, task_id: &str, apply: impl FnOnce(&mut Task) -> Result<()>) -> Result<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinationError::UnknownTask {
                task_id: task_id.to_string(),
            })?;
        apply(task)?;
        Ok(task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (TaskDispatcher, Arc<MessageRouter>, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let router = Arc::new(MessageRouter::new(log.clone()));
        (TaskDispatcher::new(router.clone(), log.clone(), 0.1), router, log)
    }

    #[test]
    fn test_distribute_assigns_and_sends_request() {
        let (d, router, _) = dispatcher();
        d.register_agent(AgentRecord::new("analyst", ["analysis"])).unwrap();
        let mut inbox = router.register_inbox("analyst");

        let agent = d
            .submit(Task::new("t1", "analyze").with_capabilities(["analysis"]).with_input(json!({"n": 3})))
            .unwrap();
        assert_eq!(agent, "analyst");

        let task = d.task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent.as_deref(), Some("analyst"));
        assert_eq!(d.agents().agent("analyst").unwrap().workload, 1);

        router.deliver_all();
        let msg = inbox.try_recv().unwrap();
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.sender, DISPATCHER_ID);
        match msg.payload {
            MessagePayload::TaskRequest { task_id, input, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(input["n"], 3);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_no_capable_agent_fails_task() {
        let (d, _, log) = dispatcher();
        d.register_agent(AgentRecord::new("writer", ["writing"])).unwrap();

        let err = d
            .submit(Task::new("t1", "x").with_capabilities(["analysis"]))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NoCapableAgent { .. }));
        let task = d.task("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("no capable agent"));
        assert_eq!(log.recent(5, Some(&EventKind::TaskFailed)).len(), 1);

        // Terminal: distributing again is not a retry.
        assert!(matches!(
            d.distribute("t1"),
            Err(CoordinationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_selection_prefers_performance_then_workload() {
        let (d, _, _) = dispatcher();
        d.register_agent(AgentRecord::new("slow", ["x"]).with_performance(0.4)).unwrap();
        d.register_agent(AgentRecord::new("b", ["x"]).with_performance(0.9)).unwrap();
        d.register_agent(AgentRecord::new("a", ["x"]).with_performance(0.9)).unwrap();

        assert_eq!(d.submit(Task::new("t1", "").with_capabilities(["x"])).unwrap(), "a");
        assert_eq!(d.submit(Task::new("t2", "").with_capabilities(["x"])).unwrap(), "b");
        assert_eq!(d.submit(Task::new("t3", "").with_capabilities(["x"])).unwrap(), "a");
    }

    #[test]
    fn test_lifecycle_updates_agent() {
        let (d, _, _) = dispatcher();
        d.register_agent(AgentRecord::new("a", ["x"]).with_performance(0.5)).unwrap();
        d.submit(Task::new("t1", "").with_capabilities(["x"])).unwrap();
        d.start_task("t1").unwrap();
        let task = d.complete_task("t1", json!("done")).unwrap();
        assert_eq!(task.result, Some(json!("done")));

        let agent = d.agents().agent("a").unwrap();
        assert_eq!(agent.workload, 0);
        assert_eq!(agent.tasks_completed, 1);
        assert!(agent.performance_score > 0.5);

        assert!(matches!(
            d.complete_task("t1", json!(null)),
            Err(CoordinationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_fail_task_lowers_performance() {
        let (d, _, _) = dispatcher();
        d.register_agent(AgentRecord::new("a", ["x"])).unwrap();
        d.submit(Task::new("t1", "").with_capabilities(["x"])).unwrap();
        d.fail_task("t1", "boom").unwrap();
        let agent = d.agents().agent("a").unwrap();
        assert!(agent.performance_score < 1.0);
        assert_eq!(d.tasks_with_status(TaskStatus::Failed).len(), 1);
    }

    #[test]
    fn test_unmet_dependencies_refused() {
        let (d, _, _) = dispatcher();
        d.register_agent(AgentRecord::new("a", ["x"])).unwrap();
        d.register_task(Task::new("t1", "")).unwrap();
        d.register_task(Task::new("t2", "").with_dependencies(["t1"])).unwrap();
        let err = d.distribute("t2").unwrap_err();
        assert_eq!(
            err,
            CoordinationError::DependenciesUnmet {
                task_id: "t2".into(),
                pending: vec!["t1".into()],
            }
        );
        assert_eq!(d.status("t2"), Some(TaskStatus::Pending));
    }

    #[test]
    fn test_cancel_never_overwrites_terminal() {
        let (d, _, _) = dispatcher();
        d.register_agent(AgentRecord::new("a", ["x"])).unwrap();
        d.submit(Task::new("t1", "")).unwrap();
        d.complete_task("t1", json!(1)).unwrap();
        assert!(!d.cancel("t1", "late").unwrap());
        assert_eq!(d.status("t1"), Some(TaskStatus::Completed));

        d.register_task(Task::new("t2", "")).unwrap();
        assert!(d.cancel("t2", "dependency failed").unwrap());
        assert_eq!(d.status("t2"), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn test_duplicate_task() {
        let (d, _, _) = dispatcher();
        d.register_task(Task::new("t1", "")).unwrap();
        assert!(matches!(
            d.register_task(Task::new("t1", "")),
            Err(CoordinationError::DuplicateTask { .. })
        ));
    }
}
