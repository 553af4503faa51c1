use bollard::errors::Error as BollardError;
use inferd_common::InferdError;
use thiserror::Error;

// Re-export dependencies potentially needed by consumers (like the
// orchestrator and gateway server).
pub use bollard;
pub use inferd_common as common;

pub mod gateway;
pub mod provisioner;
pub mod resolver;
pub mod test_utils;

pub use gateway::{ContainerRuntime, DockerRuntime, NetworkContainer, WorkloadSpec};
pub use provisioner::{
    EngineProvisioner, ProvisionError, ProvisionStage, Provisioned, ProvisionerConfig,
};
pub use resolver::{ResolverConfig, UpstreamResolver};

/// Failures talking to the container runtime, other than
/// "already in desired state" (which the gateway maps to success).
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Image pull failed for {image}: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("Container creation failed: {0}")]
    CreationFailed(#[source] BollardError),
    #[error("Container start failed: {0}")]
    StartFailed(#[source] BollardError),
    #[error("Container stop failed: {0}")]
    StopFailed(#[source] BollardError),
    #[error("Container removal failed: {0}")]
    RemovalFailed(#[source] BollardError),
    #[error("Container inspect failed: {0}")]
    InspectFailed(#[source] BollardError),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] BollardError),
    #[error("Internal runtime error: {0}")]
    Internal(String),
}

impl From<RuntimeError> for InferdError {
    fn from(err: RuntimeError) -> Self {
        InferdError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
