use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::extract::descriptor_from_inspect;
use crate::types::{ContainerDescriptor, ContainerEvent, EventKind};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::errors::Error as BollardError;
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Seconds before a Docker API call gives up.
const DOCKER_TIMEOUT: u64 = 120;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to Docker and verify the daemon answers.
    ///
    /// `socket` may be `unix:///path`, `tcp://host:port`, `http://host:port`
    /// or a bare socket path; `None` uses the local defaults.
    pub async fn connect(socket: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket {
            Some(socket) => Self::connect_to(socket)?,
            None => Docker::connect_with_local_defaults()?,
        };
        docker.ping().await?;
        info!(
            "Connected to Docker ({})",
            socket.unwrap_or("local defaults")
        );
        Ok(Self { docker })
    }

    fn connect_to(socket: &str) -> Result<Docker, RuntimeError> {
        let docker = if let Some(path) = socket.strip_prefix("unix://") {
            Docker::connect_with_socket(path, DOCKER_TIMEOUT, API_DEFAULT_VERSION)?
        } else if socket.starts_with("tcp://") || socket.starts_with("http://") {
            Docker::connect_with_http(socket, DOCKER_TIMEOUT, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_socket(socket, DOCKER_TIMEOUT, API_DEFAULT_VERSION)?
        };
        Ok(docker)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<Option<ContainerDescriptor>, RuntimeError> {
        match self.docker.inspect_container(id, None).await {
            Ok(detail) => Ok(descriptor_from_inspect(&detail)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!("Container not found: {}", id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn running_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        info!("Found {} running containers", containers.len());

        let mut descriptors = Vec::with_capacity(containers.len());
        for summary in containers {
            let id = match summary.id {
                Some(id) => id,
                None => continue,
            };
            match self.inspect(&id).await {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => {}
                Err(e) => error!("Failed to inspect container {}: {}", id, e),
            }
        }
        Ok(descriptors)
    }

    async fn monitor(
        &self,
        event_tx: mpsc::Sender<ContainerEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        loop {
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "stop", "die"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));
            info!("Listening for Docker events...");

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Docker event monitor stopped");
                        return Ok(());
                    }
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(message)) => {
                        if let Some(event) = container_event(&message) {
                            debug!("Container event: {} for {}", event.kind, event.container_id);
                            if event_tx.send(event).await.is_err() {
                                return Err(RuntimeError::ChannelClosed);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in Docker event stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            warn!("Docker event stream ended. Reconnecting in {:?}...", RECONNECT_DELAY);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

fn container_event(message: &EventMessage) -> Option<ContainerEvent> {
    let kind = EventKind::from_action(message.action.as_deref()?)?;
    let container_id = message.actor.as_ref()?.id.clone()?;
    if container_id.is_empty() {
        return None;
    }
    Some(ContainerEvent { kind, container_id })
}
