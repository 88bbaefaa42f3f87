use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::Cluster;
use crate::consumer::Consumer;
use crate::definition::{field, ClusterDefinition, ConfigurationProvider};
use crate::error::{ActorKind, FatalConsumerError, UniverseError, ValidationError};
use crate::kafka::{BrokerConnector, RdKafkaConnector};
use crate::message::FailureRoute;
use crate::producer::Producer;

/// Builds a [`Universe`] from cluster definitions.
pub struct UniverseBuilder {
    secret_env_prefix: String,
    connector: Arc<dyn BrokerConnector>,
}

impl Default for UniverseBuilder {
    fn default() -> Self {
        Self {
            secret_env_prefix: String::new(),
            connector: Arc::new(RdKafkaConnector),
        }
    }
}

impl UniverseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix of the `<PREFIX><CLUSTER_ID>_CLIENT_SECRET` environment variables
    /// overriding configured client secrets.
    pub fn secret_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.secret_env_prefix = prefix.into();
        self
    }

    pub fn connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn from_provider(
        self,
        provider: &impl ConfigurationProvider,
    ) -> Result<Universe, UniverseError> {
        let definitions = provider.unmarshal().map_err(|e| {
            error!(error = ?e, "Failed to unmarshal Kafka configuration");
            e
        })?;
        self.build(definitions)
    }

    /// Validates every definition, then creates clusters in order, each with
    /// its producers then its consumers. Nothing is connected yet.
    pub fn build(self, definitions: Vec<ClusterDefinition>) -> Result<Universe, UniverseError> {
        if definitions.is_empty() {
            error!("Kafka universe is empty");
            return Err(UniverseError::EmptyUniverse);
        }
        for (idx, definition) in definitions.iter().enumerate() {
            definition.validate().map_err(|e| {
                error!(error = ?e, idx, "Loaded Kafka configuration is invalid");
                e
            })?;
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let mut universe = Universe {
            clusters: Vec::with_capacity(definitions.len()),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            fatal_errors: Some(fatal_rx),
        };

        for definition in &definitions {
            let cluster = Arc::new(Cluster::new(
                definition,
                &self.secret_env_prefix,
                self.connector.clone(),
            ));

            for producer_definition in &definition.producers {
                let producer = Producer::new(cluster.clone(), producer_definition);
                if universe.producers.contains_key(producer.id()) {
                    return Err(duplicate(ActorKind::Producer, producer.id()));
                }
                universe
                    .producers
                    .insert(producer.id().to_string(), Arc::new(producer));
            }

            for consumer_definition in &definition.consumers {
                let id = field(&consumer_definition.id);
                if universe.consumers.contains_key(id) {
                    return Err(duplicate(ActorKind::Consumer, id));
                }

                let failure_route = match consumer_definition.failure_producer.as_deref() {
                    None => FailureRoute::none(),
                    Some(name) => match universe.producers.get(name) {
                        Some(producer) => FailureRoute::to(name, Some(producer.clone())),
                        None => {
                            return Err(UniverseError::UnknownFailureProducer {
                                consumer: id.to_string(),
                                producer: name.to_string(),
                            })
                        }
                    },
                };

                let consumer = Consumer::new(
                    cluster.clone(),
                    consumer_definition,
                    failure_route,
                    fatal_tx.clone(),
                );
                universe.consumers.insert(id.to_string(), consumer);
            }

            info!(
                cluster = %cluster.id(),
                enabled = cluster.is_enabled(),
                producers = definition.producers.len(),
                consumers = definition.consumers.len(),
                "Created Kafka cluster"
            );
            universe.clusters.push(cluster);
        }

        Ok(universe)
    }
}

fn duplicate(kind: ActorKind, id: &str) -> UniverseError {
    error!(%kind, id, "Duplicate Kafka actor id");
    ValidationError::DuplicateId {
        kind,
        id: id.to_string(),
    }
    .into()
}

/// Every cluster, producer and consumer declared by a configuration.
pub struct Universe {
    clusters: Vec<Arc<Cluster>>,
    producers: HashMap<String, Arc<Producer>>,
    consumers: HashMap<String, Consumer>,
    fatal_errors: Option<mpsc::UnboundedReceiver<FatalConsumerError>>,
}

impl Universe {
    pub fn builder() -> UniverseBuilder {
        UniverseBuilder::new()
    }

    pub fn clusters(&self) -> &[Arc<Cluster>] {
        &self.clusters
    }

    pub fn producer(&self, id: &str) -> Option<&Arc<Producer>> {
        self.producers.get(id)
    }

    pub fn consumer(&self, id: &str) -> Option<&Consumer> {
        self.consumers.get(id)
    }

    /// Mutable access, to plug handlers and mappers in before starting.
    pub fn consumer_mut(&mut self, id: &str) -> Option<&mut Consumer> {
        self.consumers.get_mut(id)
    }

    pub fn producer_ids(&self) -> Vec<&str> {
        let mut ids = self.producers.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn consumer_ids(&self) -> Vec<&str> {
        let mut ids = self.consumers.keys().map(String::as_str).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Initializes the given producers in order, stopping at the first failure.
    pub fn initialize_producers(&self, ids: &[&str]) -> Result<(), UniverseError> {
        for id in ids {
            let producer = self
                .producers
                .get(*id)
                .ok_or_else(|| UniverseError::UnknownProducer(id.to_string()))?;
            producer.initialize()?;
        }
        Ok(())
    }

    /// Initializes the given consumers in order, stopping at the first failure.
    pub fn initialize_consumers(&mut self, ids: &[&str]) -> Result<(), UniverseError> {
        for id in ids {
            let consumer = self
                .consumers
                .get_mut(*id)
                .ok_or_else(|| UniverseError::UnknownConsumer(id.to_string()))?;
            consumer.initialize()?;
        }
        Ok(())
    }

    /// Starts the given consumers. Disabled or uninitialized consumers do not
    /// start and get no handle.
    pub fn start_consumers(&self, ids: &[&str]) -> Result<Vec<JoinHandle<()>>, UniverseError> {
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let consumer = self
                .consumers
                .get(*id)
                .ok_or_else(|| UniverseError::UnknownConsumer(id.to_string()))?;
            handles.extend(consumer.go());
        }
        Ok(handles)
    }

    /// Receiver of the errors that stopped consumers. Can only be taken once.
    pub fn fatal_errors(&mut self) -> Option<mpsc::UnboundedReceiver<FatalConsumerError>> {
        self.fatal_errors.take()
    }

    /// Closes consumers, then producers, then clusters. Everything is closed
    /// even when something fails; the last failure is returned.
    pub fn close(&self) -> Result<(), UniverseError> {
        let consumers = self.consumers.values().map(Consumer::close);
        let producers = self.producers.values().map(|producer| producer.close());
        let clusters = self.clusters.iter().map(|cluster| cluster.close());

        let mut last_error = None;
        for result in consumers.chain(producers).chain(clusters) {
            if let Err(e) = result {
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => {
                info!("Closed Kafka universe");
                Ok(())
            }
        }
    }
}
