//! Instance lifecycle tracking.
//!
//! The tracker owns the instance row set and is the single source of truth
//! for "is this instance running, and when did it last do work". All status
//! transitions go through [`InstanceTracker::update`], which operates on one
//! row at a time under that row's own map guard.
//!
//! Writes against unknown ids are no-ops by contract, not errors: the reaper
//! and the proxy both race against explicit deletes, and a miss there must
//! never abort a batch.

use dashmap::DashMap;
use inferd_common::{now_secs, Instance, InstanceStatus, Model};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Everything the caller knows after provisioning succeeds.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub user_id: String,
    pub engine_id: String,
    pub model_id: String,
    pub container_name: String,
    pub port: u16,
    pub allocated_memory_mb: u64,
    pub allocated_cpu_cores: f64,
    pub auto_stop_minutes: Option<u64>,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub status: Option<InstanceStatus>,
    /// Explicit activity timestamp. A status-only update stamps
    /// `last_activity` to now unless this is supplied, which the reaper uses
    /// to anchor idle math to its pass rather than wall-clock skew.
    pub last_activity: Option<i64>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            last_activity: None,
        }
    }

    pub fn status_at(status: InstanceStatus, last_activity: i64) -> Self {
        Self {
            status: Some(status),
            last_activity: Some(last_activity),
        }
    }

    pub fn activity(last_activity: i64) -> Self {
        Self {
            status: None,
            last_activity: Some(last_activity),
        }
    }
}

/// An instance joined with its model's display name.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: Instance,
    pub model_name: String,
}

pub struct InstanceTracker {
    instances: DashMap<String, Instance>,
    /// Read-only model catalog, keyed by model id.
    models: HashMap<String, Model>,
}

impl InstanceTracker {
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            instances: DashMap::new(),
            models: models.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn model(&self, model_id: &str) -> Option<&Model> {
        self.models.get(model_id)
    }

    /// Record a freshly provisioned instance. The port must not be held by
    /// another running instance.
    pub fn create(&self, new: NewInstance) -> Result<Instance> {
        let conflict = self.instances.iter().any(|entry| {
            entry.status == InstanceStatus::Running && entry.port == new.port
        });
        if conflict {
            return Err(Error::PortInUse(new.port));
        }

        let now = now_secs();
        let instance = Instance {
            id: new.id.clone(),
            user_id: new.user_id,
            engine_id: new.engine_id,
            model_id: new.model_id,
            container_name: new.container_name,
            port: new.port,
            allocated_memory_mb: new.allocated_memory_mb,
            allocated_cpu_cores: new.allocated_cpu_cores,
            auto_stop_minutes: new.auto_stop_minutes,
            created_at: now,
            last_activity: now,
            status: InstanceStatus::Running,
        };
        self.instances.insert(new.id, instance.clone());
        debug!(id = %instance.id, port = instance.port, "instance recorded");
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.instances.get(id).map(|entry| entry.clone())
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<InstanceView> {
        let mut views: Vec<InstanceView> = self
            .instances
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| {
                let instance = entry.clone();
                let model_name = self
                    .models
                    .get(&instance.model_id)
                    .map(|m| m.display_name.clone())
                    .unwrap_or_else(|| instance.model_id.clone());
                InstanceView {
                    instance,
                    model_name,
                }
            })
            .collect();
        views.sort_by_key(|v| std::cmp::Reverse(v.instance.created_at));
        views
    }

    /// Apply a partial update. Returns the updated row, or `None` if the id
    /// is unknown or the transition is illegal — both are non-errors.
    pub fn update(&self, id: &str, update: InstanceUpdate) -> Option<Instance> {
        let mut entry = match self.instances.get_mut(id) {
            Some(entry) => entry,
            None => {
                debug!(%id, "update for unknown instance, ignoring");
                return None;
            }
        };

        if let Some(status) = update.status {
            if !entry.status.can_transition_to(status) {
                warn!(
                    %id,
                    from = %entry.status,
                    to = %status,
                    "refusing illegal status transition"
                );
                return None;
            }
            entry.status = status;
            // A status change is itself activity unless the caller anchored
            // the timestamp explicitly.
            entry.last_activity = update.last_activity.unwrap_or_else(now_secs);
        } else if let Some(last_activity) = update.last_activity {
            entry.last_activity = last_activity;
        }

        Some(entry.clone())
    }

    /// No-op on unknown id.
    pub fn delete(&self, id: &str) {
        if self.instances.remove(id).is_none() {
            debug!(%id, "delete for unknown instance, ignoring");
        }
    }

    /// The running instance publishing `port`, if any.
    pub fn get_by_port(&self, port: u16) -> Option<Instance> {
        self.instances
            .iter()
            .find(|entry| entry.status == InstanceStatus::Running && entry.port == port)
            .map(|entry| entry.clone())
    }

    /// Best-effort activity refresh for whichever running instance owns
    /// `port`. Silently no-ops when none does.
    pub fn touch_by_port(&self, port: u16) {
        let id = self.instances.iter().find_map(|entry| {
            (entry.status == InstanceStatus::Running && entry.port == port)
                .then(|| entry.id.clone())
        });
        match id {
            Some(id) => {
                self.update(&id, InstanceUpdate::activity(now_secs()));
            }
            None => debug!(%port, "touch for port with no running instance"),
        }
    }

    /// The reaper's scan set: running instances that have an idle budget.
    pub fn running_with_budget(&self) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|entry| {
                entry.status == InstanceStatus::Running && entry.auto_stop_minutes.is_some()
            })
            .map(|entry| entry.clone())
            .collect()
    }
}
