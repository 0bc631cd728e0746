use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::types::{ContainerDescriptor, ContainerEvent};

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a single container.  `Ok(None)` means it no longer exists.
    async fn inspect(&self, id: &str) -> Result<Option<ContainerDescriptor>, RuntimeError>;

    /// Inspect every running container.
    async fn running_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    /// Stream start/stop/die events into `event_tx` until `cancel` fires.
    async fn monitor(
        &self,
        event_tx: mpsc::Sender<ContainerEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError>;
}
