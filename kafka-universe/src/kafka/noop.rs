use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::kafka::{ClaimHandler, ConsumerGroup, ProducerRecord, SyncProducer};

/// Consumer group bound to disabled consumers: consumes nothing, never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConsumerGroup;

#[async_trait]
impl ConsumerGroup for NoopConsumerGroup {
    async fn consume(
        &self,
        _topics: &[String],
        _handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    fn next_error(&self) -> Option<BrokerError> {
        None
    }

    fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Producer bound to disabled producers: every send succeeds without effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProducer;

#[async_trait]
impl SyncProducer for NoopProducer {
    async fn send(&self, _record: ProducerRecord) -> Result<(), BrokerError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
