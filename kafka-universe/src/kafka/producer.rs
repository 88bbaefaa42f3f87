use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use crate::error::BrokerError;
use crate::kafka::config::{ClientConfigBuilder, ClusterSettings};
use crate::kafka::context::UniverseContext;
use crate::kafka::{ProducerRecord, SyncProducer};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// rdkafka producer awaiting the delivery report of every message.
pub struct KafkaSyncProducer {
    inner: FutureProducer<UniverseContext>,
}

impl KafkaSyncProducer {
    pub fn connect(settings: &ClusterSettings) -> Result<Self, BrokerError> {
        let client_config = ClientConfigBuilder::for_producer(settings)?.build();
        debug!("rdkafka producer configuration: {:?}", client_config);

        let context = UniverseContext::for_producer(
            &settings.cluster_id,
            settings.client_id.as_deref(),
            settings.client_log_enabled,
            settings.token_provider.clone(),
        );
        let inner: FutureProducer<UniverseContext> = client_config.create_with_context(context)?;

        // "Ping" the Kafka brokers by requesting metadata
        match inner
            .client()
            .fetch_metadata(None, Timeout::After(Duration::from_secs(15)))
        {
            Ok(metadata) => {
                info!(
                    cluster = %settings.cluster_id,
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!(cluster = %settings.cluster_id, "Failed to fetch metadata from Kafka brokers: {:?}", e);
                return Err(e.into());
            }
        }

        Ok(Self { inner })
    }
}

#[async_trait]
impl SyncProducer for KafkaSyncProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic).payload(&record.payload);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self.inner.send(future_record, DELIVERY_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.inner.flush(FLUSH_TIMEOUT)?;
        Ok(())
    }
}
