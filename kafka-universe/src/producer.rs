use std::sync::{Arc, OnceLock};

use tracing::{error, info};

use crate::cluster::Cluster;
use crate::definition::{field, ProducerDefinition};
use crate::error::{ActorKind, UniverseError};
use crate::kafka::{NoopProducer, ProducerRecord, SyncProducer};

/// Named send endpoint bound to one topic.
///
/// The broker connection is opened by `initialize()`, at most once. A disabled
/// producer, or any producer of a disabled cluster, gets a no-op connection and
/// silently drops what it is asked to send.
pub struct Producer {
    id: String,
    enabled: bool,
    topic: String,
    cluster: Arc<Cluster>,
    handle: OnceLock<Arc<dyn SyncProducer>>,
}

impl Producer {
    pub fn new(cluster: Arc<Cluster>, definition: &ProducerDefinition) -> Self {
        let enabled = cluster.is_enabled() && definition.enabled.unwrap_or(true);
        Self {
            id: field(&definition.id).to_string(),
            enabled,
            topic: field(&definition.topic).to_string(),
            cluster,
            handle: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn initialize(&self) -> Result<(), UniverseError> {
        if self.is_initialized() {
            return Err(self.already_initialized());
        }

        let handle: Arc<dyn SyncProducer> = if self.enabled {
            self.cluster.connect_producer().map_err(|source| {
                error!(producer = %self.id, error = ?source, "Failed to initialize Kafka producer");
                UniverseError::Connection {
                    target: format!("producer {}", self.id),
                    source,
                }
            })?
        } else {
            Arc::new(NoopProducer)
        };

        self.handle
            .set(handle)
            .map_err(|_| self.already_initialized())?;
        info!(producer = %self.id, topic = %self.topic, enabled = self.enabled, "Initialized producer");
        Ok(())
    }

    pub async fn send_message_bytes(&self, content: Vec<u8>) -> Result<(), UniverseError> {
        self.send(None, content).await
    }

    pub async fn send_partitioned_message_bytes(
        &self,
        partition_key: &str,
        content: Vec<u8>,
    ) -> Result<(), UniverseError> {
        self.send(Some(partition_key.to_string()), content).await
    }

    async fn send(&self, key: Option<String>, payload: Vec<u8>) -> Result<(), UniverseError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(handle) = self.handle.get() else {
            return Err(UniverseError::NotInitialized {
                kind: ActorKind::Producer,
                id: self.id.clone(),
            });
        };

        let record = ProducerRecord {
            topic: self.topic.clone(),
            key,
            payload,
        };
        handle
            .send(record)
            .await
            .map_err(|source| UniverseError::Send {
                topic: self.topic.clone(),
                source,
            })
    }

    /// Flushes and releases the connection. Does nothing if the producer was
    /// never initialized or is disabled.
    pub fn close(&self) -> Result<(), UniverseError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(handle) = self.handle.get() else {
            return Ok(());
        };
        handle.close().map_err(|source| UniverseError::Close {
            target: format!("producer {}", self.id),
            source,
        })
    }

    fn already_initialized(&self) -> UniverseError {
        UniverseError::AlreadyInitialized {
            kind: ActorKind::Producer,
            id: self.id.clone(),
        }
    }
}
