//! rdkafka consumer group.
//!
//! librdkafka has no notion of partition claims, so a generation is rebuilt on
//! top of one `StreamConsumer`: a [`ClaimRouter`] hands records to one task per
//! partition, and the generation ends when the consumer context reports
//! revoked partitions.
//!
//! Consumers sharing the group name share this connection. Each registers its
//! handler for its topic, and one of them at a time drives the receive loop
//! for the union of the topics. A partition is paused at the broker while its
//! claim is backlogged, and after its claim failed, so the loop keeps polling
//! and the other partitions keep flowing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::TopicPartitionList;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::claim_router::{ClaimRouter, ClaimRoutes};
use crate::kafka::config::{ClientConfigBuilder, ClusterSettings};
use crate::kafka::context::UniverseContext;
use crate::kafka::types::{ConsumerRecord, GroupOverrides, Partition};
use crate::kafka::{ClaimHandler, ConsumerGroup, GroupSession};

const CLAIM_BUFFER: usize = 256;
const BACKLOG_RETRY: Duration = Duration::from_millis(50);

pub struct KafkaConsumerGroup {
    name: String,
    consumer: Arc<StreamConsumer<UniverseContext>>,
    generation: Arc<Notify>,
    errors_tx: mpsc::UnboundedSender<BrokerError>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<BrokerError>>,
    routes: Arc<ClaimRoutes>,
    subscription: Mutex<Vec<String>>,
    driver: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl KafkaConsumerGroup {
    pub fn connect(
        settings: &ClusterSettings,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Self, BrokerError> {
        let client_config =
            ClientConfigBuilder::for_consumer_group(settings, group_name, overrides)?.build();
        debug!("rdkafka consumer configuration: {:?}", client_config);

        let generation = Arc::new(Notify::new());
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let context = UniverseContext::for_consumer_group(
            &settings.cluster_id,
            settings.client_id.as_deref(),
            settings.client_log_enabled,
            settings.token_provider.clone(),
            generation.clone(),
            errors_tx.clone(),
        );

        let consumer: StreamConsumer<UniverseContext> = client_config.create_with_context(context)?;
        info!(cluster = %settings.cluster_id, group = group_name, "Created consumer group");

        Ok(Self {
            name: group_name.to_string(),
            consumer: Arc::new(consumer),
            generation,
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
            routes: Arc::new(ClaimRoutes::default()),
            subscription: Mutex::new(Vec::new()),
            driver: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Subscribing again to the same topics would trigger a rebalance, so
    /// the subscription only changes when the routed topics do.
    fn subscribe(&self) -> Result<(), BrokerError> {
        let topics = self.routes.topics();
        let mut subscription = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        if *subscription != topics {
            let topic_refs = topics.iter().map(String::as_str).collect::<Vec<_>>();
            self.consumer.subscribe(&topic_refs)?;
            info!(group = %self.name, topics = ?topics, "Subscribed consumer group");
            *subscription = topics;
        }
        Ok(())
    }

    fn set_paused(&self, partitions: &[Partition], paused: bool) {
        if partitions.is_empty() {
            return;
        }
        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition(partition.topic(), partition.partition_number());
        }
        let result = if paused {
            self.consumer.pause(&list)
        } else {
            self.consumer.resume(&list)
        };
        if let Err(e) = result {
            warn!(group = %self.name, paused, "Failed to change partition state: {}", e);
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.routes.register(&self.name, topics, &handler)?;

        // one member drives the generation for every member of the group
        let _driver = self.driver.lock().await;
        self.ensure_open()?;
        self.subscribe()?;

        let session: Arc<dyn GroupSession> = Arc::new(KafkaGroupSession {
            consumer: self.consumer.clone(),
        });
        let mut router = ClaimRouter::new(&self.name, CLAIM_BUFFER, self.routes.clone(), session);
        let mut backlog_retry = tokio::time::interval(BACKLOG_RETRY);

        loop {
            tokio::select! {
                _ = self.generation.notified() => {
                    info!(group = %self.name, "Rebalance observed, ending generation");
                    break;
                }

                stopped = router.next_finished(), if router.has_claims() => {
                    if let Some(partition) = stopped {
                        self.set_paused(&[partition], true);
                    }
                }

                _ = backlog_retry.tick(), if router.has_backlog() => {
                    let drained = router.drain_backlog();
                    self.set_paused(&drained, false);
                }

                received = self.consumer.recv() => {
                    match received {
                        Ok(message) => {
                            let record = ConsumerRecord::from_borrowed_message(&message);
                            if let Some(full) = router.route(record) {
                                self.set_paused(&[full], true);
                            }
                        }
                        Err(KafkaError::PartitionEOF(_)) => continue,
                        Err(e) => {
                            error!(group = %self.name, "Kafka consumer error: {}", e);
                            if self.errors_tx.send(BrokerError::Kafka(e)).is_err() {
                                debug!(group = %self.name, "Consumer group error channel closed");
                            }
                            break;
                        }
                    }
                }
            }
        }

        let paused = router.finish().await;
        self.set_paused(&paused, false);

        Ok(())
    }

    fn next_error(&self) -> Option<BrokerError> {
        let mut errors = self.errors_rx.lock().unwrap_or_else(|e| e.into_inner());
        errors.try_recv().ok()
    }

    fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(group = %self.name, "Closing consumer group");
        self.consumer.unsubscribe();
        Ok(())
    }
}

struct KafkaGroupSession {
    consumer: Arc<StreamConsumer<UniverseContext>>,
}

impl GroupSession for KafkaGroupSession {
    fn mark_message(&self, record: &ConsumerRecord, note: &str) {
        // the stored offset is the next one to read
        if let Err(e) =
            self.consumer
                .store_offset(record.topic(), record.partition(), record.offset() + 1)
        {
            warn!(
                "Failed to store offset {} for {}:{}: {}",
                record.offset(),
                record.topic(),
                record.partition(),
                e
            );
        } else if !note.is_empty() {
            debug!(
                offset = record.offset(),
                partition = record.partition(),
                topic = record.topic(),
                note,
                "Marked message"
            );
        }
    }
}
