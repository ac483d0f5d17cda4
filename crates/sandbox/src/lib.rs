//! Container provisioning and lifecycle over the Docker Engine API.

pub mod driver;
pub mod manager;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

/// Engine capability trait, its Docker implementation, and exec plumbing types.
pub use driver::{
    BindMount, ContainerDriver, ContainerSpec, DockerDriver, ExecSpec, ExecStatus, ExecStream,
};
/// Per-challenge container lifecycle manager.
pub use manager::{ContainerManager, PtySession, SandboxConfig};
