use inferd_runtime::RuntimeError;
use thiserror::Error;

pub use inferd_common as common;

pub mod reaper;
pub mod tracker;

pub use reaper::IdleReaper;
pub use tracker::{InstanceTracker, InstanceUpdate, InstanceView, NewInstance};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Runtime Error")]
    Runtime {
        #[from]
        source: RuntimeError,
    },
    #[error("Port {0} is already in use by a running instance")]
    PortInUse(u16),
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
