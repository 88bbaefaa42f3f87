use std::sync::Arc;

use crate::error::BrokerError;
use crate::kafka::config::ClusterSettings;
use crate::kafka::consumer_group::KafkaConsumerGroup;
use crate::kafka::producer::KafkaSyncProducer;
use crate::kafka::types::GroupOverrides;
use crate::kafka::{BrokerConnector, ConsumerGroup, SyncProducer};

/// Connector opening real librdkafka clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct RdKafkaConnector;

impl BrokerConnector for RdKafkaConnector {
    fn connect_consumer_group(
        &self,
        settings: &ClusterSettings,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Arc<dyn ConsumerGroup>, BrokerError> {
        let group = KafkaConsumerGroup::connect(settings, group_name, overrides)?;
        Ok(Arc::new(group))
    }

    fn connect_producer(
        &self,
        settings: &ClusterSettings,
    ) -> Result<Arc<dyn SyncProducer>, BrokerError> {
        let producer = KafkaSyncProducer::connect(settings)?;
        Ok(Arc::new(producer))
    }
}
