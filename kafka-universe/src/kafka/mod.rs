// Kafka module - broker collaborator seam and its rdkafka implementation
pub mod claim_router;
pub mod config;
pub mod connector;
pub mod consumer_group;
pub mod context;
pub mod noop;
pub mod producer;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use claim_router::{ClaimRouter, ClaimRoutes};
pub use config::{ClientConfigBuilder, ClusterSettings};
pub use connector::RdKafkaConnector;
pub use noop::{NoopConsumerGroup, NoopProducer};
pub use types::{
    ConsumerRecord, GroupOverrides, InitialOffset, Partition, PartitionClaim, ProducerRecord,
};

/// Opens broker connections. Clusters and producers never talk to the
/// client library directly, they always go through a connector.
pub trait BrokerConnector: Send + Sync {
    fn connect_consumer_group(
        &self,
        settings: &ClusterSettings,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Arc<dyn ConsumerGroup>, BrokerError>;

    fn connect_producer(&self, settings: &ClusterSettings)
        -> Result<Arc<dyn SyncProducer>, BrokerError>;
}

/// A live consumer-group membership.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Joins the group for `topics` and dispatches every partition claim of
    /// one rebalance generation to `handler`. Returns once the generation ends.
    ///
    /// Members sharing a group call this concurrently, each for its own
    /// topics. A topic already consumed through another handler is refused
    /// with [`BrokerError::TopicTaken`].
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), BrokerError>;

    /// Pops the next asynchronous broker error, if any. Never blocks.
    fn next_error(&self) -> Option<BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}

/// Per-partition processing plugged into a consumer group.
///
/// Called concurrently for the different partitions of a generation.
#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> anyhow::Result<()>;
}

/// Offset bookkeeping of the current generation.
pub trait GroupSession: Send + Sync {
    /// Marks `record` as processed. Marked offsets reach the broker on the
    /// group's next commit.
    fn mark_message(&self, record: &ConsumerRecord, note: &str);
}

/// Send endpoint that waits for the broker acknowledgement of every message.
#[async_trait]
pub trait SyncProducer: Send + Sync {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}
