// Shared data model and error taxonomy for the inferd workspace.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod catalog;

pub use catalog::{builtin_engines, builtin_models, engine_by_id, model_by_id};

#[derive(Error, Debug)]
pub enum InferdError {
    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Provision Error: {0}")]
    Provision(String),

    #[error("Tracker Error: {0}")]
    Tracker(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InferdError>;

/// Unix timestamp in whole seconds. All instance timestamps use this
/// resolution.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Terminated,
}

impl InstanceStatus {
    /// Legal status transitions. Terminated is final; everything else may
    /// move forward. A self-transition is allowed so idempotent updates are
    /// not refused.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (InstanceStatus::Terminated, _) => false,
            (InstanceStatus::Running, InstanceStatus::Stopped) => true,
            (InstanceStatus::Running, InstanceStatus::Terminated) => true,
            (InstanceStatus::Stopped, InstanceStatus::Terminated) => true,
            // Restarting a stopped instance goes through provisioning, not a
            // status flip.
            (InstanceStatus::Stopped, InstanceStatus::Running) => false,
            // Already covered by the `a == b` guard above; spelled out so the
            // match is exhaustive.
            (InstanceStatus::Running, InstanceStatus::Running)
            | (InstanceStatus::Stopped, InstanceStatus::Stopped) => true,
        }
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// One ephemeral containerized workload owned by a user.
///
/// `id` equals the underlying container identifier. `port` is the externally
/// reachable host port and is unique among running instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub user_id: String,
    pub engine_id: String,
    pub model_id: String,
    pub container_name: String,
    pub port: u16,
    pub allocated_memory_mb: u64,
    pub allocated_cpu_cores: f64,
    /// None disables auto-stop entirely.
    pub auto_stop_minutes: Option<u64>,
    pub created_at: i64,
    pub last_activity: i64,
    pub status: InstanceStatus,
}

impl Instance {
    /// Whole minutes of inactivity, floored. An instance becomes
    /// reaper-eligible exactly at the auto-stop boundary.
    pub fn idle_minutes(&self, now: i64) -> i64 {
        (now - self.last_activity).max(0) / 60
    }
}

/// Provisioning recipe for a class of workload. Reference data, never
/// mutated by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Port the workload listens on inside the container.
    pub internal_port: u16,
    /// Path probed to decide the container is ready to serve traffic.
    pub health_path: String,
    /// Named volume holding the engine's model cache, mounted read-only.
    pub model_volume: Option<ModelVolume>,
    pub default_memory_mb: u64,
    pub default_cpu_cores: f64,
    pub default_auto_stop_minutes: Option<u64>,
}

/// A named volume and the path it is mounted at inside the workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVolume {
    pub name: String,
    pub container_path: String,
}

/// Catalog row describing a deployable artifact. Consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub engine_id: String,
    /// Identifier the engine itself understands (e.g. "qwen2:0.5b").
    pub name: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&InstanceStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let back: InstanceStatus = serde_json::from_str("\"terminated\"").unwrap();
        assert_eq!(back, InstanceStatus::Terminated);
    }

    #[test]
    fn test_terminated_is_final() {
        assert!(!InstanceStatus::Terminated.can_transition_to(InstanceStatus::Running));
        assert!(!InstanceStatus::Terminated.can_transition_to(InstanceStatus::Stopped));
        assert!(InstanceStatus::Terminated.can_transition_to(InstanceStatus::Terminated));
    }

    #[test]
    fn test_running_transitions() {
        assert!(InstanceStatus::Running.can_transition_to(InstanceStatus::Stopped));
        assert!(InstanceStatus::Running.can_transition_to(InstanceStatus::Terminated));
        assert!(!InstanceStatus::Stopped.can_transition_to(InstanceStatus::Running));
    }

    #[test]
    fn test_idle_minutes_floors() {
        let inst = Instance {
            id: "c1".into(),
            user_id: "u1".into(),
            engine_id: "ollama".into(),
            model_id: "m1".into(),
            container_name: "inferd-ollama-1".into(),
            port: 32768,
            allocated_memory_mb: 2048,
            allocated_cpu_cores: 2.0,
            auto_stop_minutes: Some(30),
            created_at: 1_000,
            last_activity: 1_000,
            status: InstanceStatus::Running,
        };
        // 29m59s idle rounds down to 29 minutes.
        assert_eq!(inst.idle_minutes(1_000 + 29 * 60 + 59), 29);
        assert_eq!(inst.idle_minutes(1_000 + 30 * 60), 30);
        // Clock skew never yields negative idle time.
        assert_eq!(inst.idle_minutes(500), 0);
    }
}
