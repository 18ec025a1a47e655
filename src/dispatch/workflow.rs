//! Dependency-ordered workflows on top of the dispatcher.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::dispatcher::{TaskDispatcher, TaskObserver};
use super::task::{Task, TaskStatus};
use crate::errors::{CoordinationError, Result};
use crate::events::EventKind;

/// A stored workflow: its tasks in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Overall state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
}

/// Task counts by status plus the overall status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub total: usize,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub status: WorkflowStatus,
}

impl WorkflowProgress {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// Releases tasks as their dependencies complete and cascades
/// cancellation when a dependency fails.
///
/// The engine observes its dispatcher, so tasks finished through
/// `TaskDispatcher::complete_task` or `fail_task` drive the workflow the
/// same way as the engine's own methods.
pub struct WorkflowEngine {
    dispatcher: Arc<TaskDispatcher>,
    workflows: RwLock<HashMap<String, Workflow>>,
    /// task id -> tasks that list it as a dependency.
    dependents: RwLock<HashMap<String, Vec<String>>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflows.read().len())
            .finish()
    }
}

impl WorkflowEngine {
    /// Build an engine and attach it to `dispatcher` as its task observer.
    /// A dispatcher drives one engine; a later engine replaces an earlier one.
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Arc<Self> {
        Arc::new_cyclic(|engine: &Weak<Self>| {
            let observer: Weak<dyn TaskObserver> = engine.clone();
            dispatcher.set_observer(observer);
            Self {
                dispatcher,
                workflows: RwLock::new(HashMap::new()),
                dependents: RwLock::new(HashMap::new()),
            }
        })
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Store `tasks` as one workflow and distribute every task without
    /// dependencies. Returns the workflow id.
    ///
    /// Dependencies must name tasks in the same workflow and must not form
    /// a cycle. A root task with no capable agent fails and cancels its
    /// dependents; that is reported through task status, not as an error.
    pub fn create_workflow(&self, name: impl Into<String>, tasks: Vec<Task>) -> Result<String> {
        validate(&tasks)?;

        let workflow_id = Uuid::new_v4().to_string();
        let workflow = Workflow {
            id: workflow_id.clone(),
            name: name.into(),
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            created_at: Utc::now(),
        };

        let roots: Vec<String> = tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.clone())
            .collect();
        let edges: Vec<(String, String)> = tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|dep| (dep.clone(), t.id.clone())))
            .collect();

        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                task.workflow_id = Some(workflow_id.clone());
                task
            })
            .collect();
        self.dispatcher.register_tasks(tasks)?;

        {
            let mut dependents = self.dependents.write();
            for (dep, dependent) in edges {
                dependents.entry(dep).or_default().push(dependent);
            }
        }

        log::info!(
            "[WorkflowEngine] Created workflow {} ({}) with {} tasks",
            workflow.name,
            workflow_id,
            workflow.task_ids.len()
        );
        self.dispatcher.events().publish(
            EventKind::WorkflowCreated,
            json!({
                "workflow_id": workflow_id,
                "name": workflow.name,
                "tasks": workflow.task_ids,
            }),
            None,
        );
        self.workflows.write().insert(workflow_id.clone(), workflow);

        for root in roots {
            self.release(&root);
        }
        Ok(workflow_id)
    }

    /// Complete a task and distribute dependents whose dependencies are
    /// now all complete. Works for tasks outside any workflow too.
    pub fn complete_task(&self, task_id: &str, result: Value) -> Result<Task> {
        self.dispatcher.complete_task(task_id, result)
    }

    /// Fail a task and cancel everything that depends on it.
    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) -> Result<Task> {
        self.dispatcher.fail_task(task_id, error)
    }

    pub fn progress(&self, workflow_id: &str) -> Result<WorkflowProgress> {
        let task_ids = self
            .workflows
            .read()
            .get(workflow_id)
            .map(|w| w.task_ids.clone())
            .ok_or_else(|| CoordinationError::UnknownWorkflow {
                workflow_id: workflow_id.to_string(),
            })?;

        let mut counts: BTreeMap<TaskStatus, usize> = BTreeMap::new();
        for id in &task_ids {
            if let Some(status) = self.dispatcher.status(id) {
                *counts.entry(status).or_insert(0) += 1;
            }
        }

        let total = task_ids.len();
        let completed = counts.get(&TaskStatus::Completed).copied().unwrap_or(0);
        let status = if total > 0 && completed == total {
            WorkflowStatus::Completed
        } else if counts.get(&TaskStatus::Failed).copied().unwrap_or(0) > 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::InProgress
        };

        Ok(WorkflowProgress {
            workflow_id: workflow_id.to_string(),
            total,
            counts,
            status,
        })
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.workflows.read().get(workflow_id).cloned()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn dependents_of(&self, task_id: &str) -> Vec<String> {
        self.dependents
            .read()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Distribute dependents of `task_id` whose dependencies are all complete.
    fn release_ready_dependents(&self, task_id: &str) {
        for dependent in self.dependents_of(task_id) {
            let ready = self.dispatcher.task(&dependent).map_or(false, |t| {
                t.status == TaskStatus::Pending
                    && t.dependencies
                        .iter()
                        .all(|d| self.dispatcher.status(d) == Some(TaskStatus::Completed))
            });
            if ready {
                self.release(&dependent);
            }
        }
    }

    /// Distribute a ready task. A task with no capable agent fails, and the
    /// dispatcher reports that back through `task_finished`.
    fn release(&self, task_id: &str) {
        match self.dispatcher.distribute(task_id) {
            Ok(_) => {}
            Err(CoordinationError::NoCapableAgent { .. }) => {
                log::debug!("[WorkflowEngine] Task {} has no capable agent", task_id);
            }
            // Two dependencies completing together may both try to release.
            Err(CoordinationError::InvalidTransition { .. }) => {
                log::debug!("[WorkflowEngine] Task {} already released", task_id);
            }
            Err(err) => log::error!("[WorkflowEngine] Could not release {}: {}", task_id, err),
        }
    }

    /// Cancel every task that transitively depends on `root`.
    fn cascade_cancel(&self, root: &str) {
        let reason = format!("dependency {} did not complete", root);
        let mut queue: VecDeque<String> = self.dependents_of(root).into();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Err(err) = self.dispatcher.cancel(&id, &reason) {
                log::error!("[WorkflowEngine] Could not cancel {}: {}", id, err);
            }
            queue.extend(self.dependents_of(&id));
        }
    }
}

impl TaskObserver for WorkflowEngine {
    fn task_finished(&self, task: &Task) {
        match task.status {
            TaskStatus::Completed => self.release_ready_dependents(&task.id),
            TaskStatus::Failed => self.cascade_cancel(&task.id),
            _ => {}
        }
    }
}

/// Reject duplicate ids, dependencies outside the set, and cycles.
fn validate(tasks: &[Task]) -> Result<()> {
    let mut ids: HashSet<&str> = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(CoordinationError::DuplicateTask {
                task_id: task.id.clone(),
            });
        }
    }
    for task in tasks {
        if let Some(dep) = task.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(CoordinationError::UnknownDependency {
                task_id: task.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    // Kahn's algorithm: whatever keeps a non-zero in-degree is on a cycle.
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    while let Some(id) = queue.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    let mut remaining: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    if remaining.is_empty() {
        Ok(())
    } else {
        remaining.sort();
        Err(CoordinationError::CyclicDependency { tasks: remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AgentRecord;
    use crate::events::EventLog;
    use crate::messaging::MessageRouter;

    fn engine() -> Arc<WorkflowEngine> {
        let log = Arc::new(EventLog::new());
        let router = Arc::new(MessageRouter::new(log.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(router, log, 0.1));
        dispatcher
            .register_agent(AgentRecord::new("collector", ["collect"]))
            .unwrap();
        dispatcher
            .register_agent(AgentRecord::new("analyst", ["analyze"]))
            .unwrap();
        WorkflowEngine::new(dispatcher)
    }

    fn pipeline() -> Vec<Task> {
        vec![
            Task::new("collect", "gather data").with_capabilities(["collect"]),
            Task::new("analyze", "analyze data")
                .with_capabilities(["analyze"])
                .with_dependencies(["collect"]),
            Task::new("report", "write report")
                .with_capabilities(["analyze"])
                .with_dependencies(["analyze"]),
        ]
    }

    #[test]
    fn test_roots_distributed_dependents_pending() {
        let engine = engine();
        let wf = engine.create_workflow("report", pipeline()).unwrap();
        let d = engine.dispatcher();
        assert_eq!(d.status("collect"), Some(TaskStatus::Assigned));
        assert_eq!(d.status("analyze"), Some(TaskStatus::Pending));
        assert_eq!(d.task("analyze").unwrap().workflow_id.as_deref(), Some(wf.as_str()));

        let progress = engine.progress(&wf).unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.count(TaskStatus::Assigned), 1);
        assert_eq!(progress.count(TaskStatus::Pending), 2);
        assert_eq!(progress.status, WorkflowStatus::InProgress);
    }

    #[test]
    fn test_completion_releases_dependents() {
        let engine = engine();
        let wf = engine.create_workflow("report", pipeline()).unwrap();
        engine.complete_task("collect", json!([1, 2, 3])).unwrap();
        assert_eq!(engine.dispatcher().status("analyze"), Some(TaskStatus::Assigned));
        engine.complete_task("analyze", json!(2.0)).unwrap();
        engine.complete_task("report", json!("ok")).unwrap();
        assert_eq!(engine.progress(&wf).unwrap().status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_failure_cascades_cancellation() {
        let engine = engine();
        let wf = engine.create_workflow("report", pipeline()).unwrap();
        engine.fail_task("collect", "source offline").unwrap();

        let d = engine.dispatcher();
        for id in ["analyze", "report"] {
            let task = d.task(id).unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert!(task.assigned_agent.is_none());
        }
        let progress = engine.progress(&wf).unwrap();
        assert_eq!(progress.status, WorkflowStatus::Failed);
        assert_eq!(progress.count(TaskStatus::Cancelled), 2);
    }

    #[test]
    fn test_dispatcher_transitions_drive_workflow() {
        let engine = engine();
        engine.create_workflow("report", pipeline()).unwrap();
        let d = engine.dispatcher();

        d.complete_task("collect", json!([1])).unwrap();
        assert_eq!(d.status("analyze"), Some(TaskStatus::Assigned));

        d.fail_task("analyze", "model crashed").unwrap();
        let report = d.task("report").unwrap();
        assert_eq!(report.status, TaskStatus::Cancelled);
        assert!(report.assigned_agent.is_none());
    }

    #[test]
    fn test_duplicate_task_registers_nothing() {
        let engine = engine();
        engine
            .dispatcher()
            .register_task(Task::new("analyze", "standalone"))
            .unwrap();

        let err = engine.create_workflow("report", pipeline()).unwrap_err();
        assert_eq!(
            err,
            CoordinationError::DuplicateTask {
                task_id: "analyze".into()
            }
        );
        assert!(engine.dispatcher().task("collect").is_none());
        assert!(engine.dependents_of("collect").is_empty());
        assert!(engine.workflow_ids().is_empty());
    }

    #[test]
    fn test_uncapable_root_cancels_dependents() {
        let engine = engine();
        let tasks = vec![
            Task::new("t1", "").with_capabilities(["translate"]),
            Task::new("t2", "").with_dependencies(["t1"]),
        ];
        let wf = engine.create_workflow("wf", tasks).unwrap();
        assert_eq!(engine.dispatcher().status("t1"), Some(TaskStatus::Failed));
        assert_eq!(engine.dispatcher().status("t2"), Some(TaskStatus::Cancelled));
        assert_eq!(engine.progress(&wf).unwrap().status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_diamond_waits_for_all_dependencies() {
        let engine = engine();
        let tasks = vec![
            Task::new("a", "").with_capabilities(["collect"]),
            Task::new("b", "").with_capabilities(["collect"]),
            Task::new("c", "").with_dependencies(["a", "b"]),
        ];
        engine.create_workflow("diamond", tasks).unwrap();
        engine.complete_task("a", json!(1)).unwrap();
        assert_eq!(engine.dispatcher().status("c"), Some(TaskStatus::Pending));
        engine.complete_task("b", json!(2)).unwrap();
        assert_eq!(engine.dispatcher().status("c"), Some(TaskStatus::Assigned));
    }

    #[test]
    fn test_validation() {
        let engine = engine();
        let err = engine
            .create_workflow("bad", vec![Task::new("a", "").with_dependencies(["zzz"])])
            .unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownDependency { .. }));

        let err = engine
            .create_workflow(
                "cycle",
                vec![
                    Task::new("root", ""),
                    Task::new("a", "").with_dependencies(["b"]),
                    Task::new("b", "").with_dependencies(["a"]),
                ],
            )
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::CyclicDependency {
                tasks: vec!["a".into(), "b".into()]
            }
        );
        // Nothing from a rejected workflow is registered.
        assert!(engine.dispatcher().task("root").is_none());
        assert!(engine.progress("missing").is_err());
    }
}
