//! Resource registry with capacity-bounded, first-come-first-served grants.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};
use uuid::Uuid;

use super::resource::{Resource, ResourceSpec};
use crate::errors::{CoordinationError, Result};
use crate::events::{EventKind, EventLog};

/// Per-resource lock state. Request and release on one resource are
/// serialized by `ResourceSlot::state`; different resources never contend.
struct ResourceState {
    resource: Resource,
    /// Tickets of blocked requesters in arrival order.
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

impl ResourceState {
    fn grant(&mut self, agent_id: &str) {
        debug_assert!(self.resource.has_capacity());
        self.resource.holders.push(agent_id.to_string());
    }
}

struct ResourceSlot {
    state: Mutex<ResourceState>,
    released: Condvar,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, Arc<ResourceSlot>>,
    by_name: HashMap<String, String>,
}

/// Owns every shared resource and the set of agents holding each one.
///
/// The registry is the single source of truth for who holds what. It cannot
/// detect a holder that never releases; releasing on every exit path is the
/// caller's responsibility.
pub struct ResourceRegistry {
    tables: RwLock<Tables>,
    log: Arc<EventLog>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("resources", &self.tables.read().by_id.len())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            log,
        }
    }

    /// Register a resource. Names are unique within the registry.
    pub fn create_resource(&self, spec: ResourceSpec) -> Result<String> {
        if spec.effective_capacity() == 0 {
            return Err(CoordinationError::InvalidCapacity {
                name: spec.name,
                capacity: spec.capacity,
            });
        }

        let resource = {
            let mut tables = self.tables.write();
            if tables.by_name.contains_key(&spec.name) {
                return Err(CoordinationError::DuplicateResource { name: spec.name });
            }
            let id = Uuid::new_v4().to_string();
            let resource = Resource::from_spec(id.clone(), spec);
            tables.by_name.insert(resource.name.clone(), id.clone());
            tables.by_id.insert(
                id,
                Arc::new(ResourceSlot {
                    state: Mutex::new(ResourceState {
                        resource: resource.clone(),
                        waiters: VecDeque::new(),
                        next_ticket: 0,
                    }),
                    released: Condvar::new(),
                }),
            );
            resource
        };

        log::debug!(
            "[ResourceRegistry] Created resource '{}' ({:?}, capacity {})",
            resource.name,
            resource.mode,
            resource.capacity
        );
        self.log.publish(
            EventKind::ResourceCreated,
            json!({
                "resource_id": resource.id,
                "name": resource.name,
                "mode": resource.mode,
                "capacity": resource.capacity,
            }),
            Some(&resource.owner),
        );
        Ok(resource.id)
    }

    /// Ask for a place among the holders of `resource_id`, waiting up to
    /// `timeout` behind earlier requesters.
    ///
    /// Returns `Ok(false)` on timeout; that is a normal outcome. A request
    /// from an agent that already holds the resource is granted without
    /// taking a second place.
    pub fn request(&self, resource_id: &str, agent_id: &str, timeout: Duration) -> Result<bool> {
        let slot = self.slot(resource_id)?;
        // `None`: the timeout is too long to represent, so wait without one.
        let deadline = Instant::now().checked_add(timeout);

        let mut state = slot.state.lock();
        if state.resource.is_held_by(agent_id) {
            return Ok(true);
        }

        let granted = if state.waiters.is_empty() && state.resource.has_capacity() {
            state.grant(agent_id);
            true
        } else {
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(ticket);

            loop {
                if state.waiters.front() == Some(&ticket) && state.resource.has_capacity() {
                    state.waiters.pop_front();
                    state.grant(agent_id);
                    // The next waiter in line may also fit (shared resources).
                    slot.released.notify_all();
                    break true;
                }
                let timed_out = match deadline {
                    Some(deadline) => slot.released.wait_until(&mut state, deadline).timed_out(),
                    None => {
                        slot.released.wait(&mut state);
                        false
                    }
                };
                if timed_out {
                    if state.waiters.front() == Some(&ticket) && state.resource.has_capacity() {
                        state.waiters.pop_front();
                        state.grant(agent_id);
                        slot.released.notify_all();
                        break true;
                    }
                    state.waiters.retain(|t| *t != ticket);
                    // Our departure may put a waiter at the head.
                    slot.released.notify_all();
                    break false;
                }
            }
        };
        let holders = state.resource.holders.len();
        drop(state);

        if granted {
            log::debug!("[ResourceRegistry] Granted resource {} to {} ({} holders)", resource_id, agent_id, holders);
            self.log.publish(
                EventKind::ResourceLocked,
                json!({ "resource_id": resource_id, "holders": holders }),
                Some(agent_id),
            );
        } else {
            log::debug!("[ResourceRegistry] Request for resource {} by {} timed out", resource_id, agent_id);
            self.log.publish(
                EventKind::ResourceRequestTimedOut,
                json!({ "resource_id": resource_id, "timeout_ms": timeout.as_millis() as u64 }),
                Some(agent_id),
            );
        }
        Ok(granted)
    }

    /// Grant immediately or not at all.
    pub fn try_request(&self, resource_id: &str, agent_id: &str) -> Result<bool> {
        self.request(resource_id, agent_id, Duration::ZERO)
    }

    /// Drop `agent_id` from the holders. Returns `Ok(false)` if it did not hold
    /// the resource. Freed places go to waiters in arrival order.
    pub fn release(&self, resource_id: &str, agent_id: &str) -> Result<bool> {
        let slot = self.slot(resource_id)?;
        let remaining = {
            let mut state = slot.state.lock();
            let before = state.resource.holders.len();
            state.resource.holders.retain(|h| h != agent_id);
            if state.resource.holders.len() == before {
                return Ok(false);
            }
            if !state.waiters.is_empty() {
                slot.released.notify_all();
            }
            state.resource.holders.len()
        };

        log::debug!("[ResourceRegistry] Released resource {} by {}", resource_id, agent_id);
        self.log.publish(
            EventKind::ResourceReleased,
            json!({ "resource_id": resource_id, "holders": remaining }),
            Some(agent_id),
        );
        Ok(true)
    }

    /// Release every resource `agent_id` holds. Returns the released ids.
    pub fn release_all(&self, agent_id: &str) -> Vec<String> {
        let ids: Vec<String> = self.tables.read().by_id.keys().cloned().collect();
        ids.into_iter()
            .filter(|id| matches!(self.release(id, agent_id), Ok(true)))
            .collect()
    }

    /// Replace the payload of a resource. Only current holders may write.
    pub fn write_payload(&self, resource_id: &str, agent_id: &str, payload: Value) -> Result<bool> {
        let slot = self.slot(resource_id)?;
        let mut state = slot.state.lock();
        if !state.resource.is_held_by(agent_id) {
            return Ok(false);
        }
        state.resource.payload = payload;
        Ok(true)
    }

    /// Snapshot of a resource.
    pub fn resource(&self, resource_id: &str) -> Result<Resource> {
        Ok(self.slot(resource_id)?.state.lock().resource.clone())
    }

    pub fn holders(&self, resource_id: &str) -> Result<Vec<String>> {
        Ok(self.slot(resource_id)?.state.lock().resource.holders.clone())
    }

    /// Number of requesters currently blocked on a resource.
    pub fn waiting(&self, resource_id: &str) -> Result<usize> {
        Ok(self.slot(resource_id)?.state.lock().waiters.len())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Resource> {
        let id = self.tables.read().by_name.get(name).cloned()?;
        self.resource(&id).ok()
    }

    /// Snapshots of all resources.
    pub fn list(&self) -> Vec<Resource> {
        let slots: Vec<Arc<ResourceSlot>> = self.tables.read().by_id.values().cloned().collect();
        slots.iter().map(|s| s.state.lock().resource.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, resource_id: &str) -> Result<Arc<ResourceSlot>> {
        self.tables
            .read()
            .by_id
            .get(resource_id)
            .cloned()
            .ok_or_else(|| CoordinationError::UnknownResource {
                resource_id: resource_id.to_string(),
            })
    }
}
