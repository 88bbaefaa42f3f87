use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::consumer::Content;
use crate::error::UniverseError;
use crate::kafka::{ConsumerRecord, GroupSession};
use crate::producer::Producer;

/// Where a consumer redirects the records it could not map.
#[derive(Clone, Default)]
pub struct FailureRoute {
    producer_name: Option<String>,
    producer: Option<Arc<Producer>>,
}

impl FailureRoute {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn to(producer_name: impl Into<String>, producer: Option<Arc<Producer>>) -> Self {
        Self {
            producer_name: Some(producer_name.into()),
            producer,
        }
    }

    pub fn producer_name(&self) -> Option<&str> {
        self.producer_name.as_deref()
    }

    pub fn producer(&self) -> Option<&Arc<Producer>> {
        self.producer.as_ref()
    }
}

/// One delivered record as seen by a message handler.
///
/// Gives access to the mapped content and lets the handler commit the record,
/// redirect it to the failure topic or stop the consumption of its partition.
pub struct ConsumedMessage {
    record: ConsumerRecord,
    content: Option<Content>,
    session: Arc<dyn GroupSession>,
    failure_route: FailureRoute,
    abort: AtomicBool,
}

impl ConsumedMessage {
    pub fn new(
        record: ConsumerRecord,
        content: Option<Content>,
        session: Arc<dyn GroupSession>,
        failure_route: FailureRoute,
    ) -> Self {
        Self {
            record,
            content,
            session,
            failure_route,
            abort: AtomicBool::new(false),
        }
    }

    /// Content after every mapper ran. `None` when mapping failed.
    pub fn content(&self) -> Option<&Content> {
        self.content.as_ref()
    }

    pub fn content_as<T: 'static>(&self) -> Option<&T> {
        self.content.as_deref()?.downcast_ref::<T>()
    }

    pub fn raw_payload(&self) -> &[u8] {
        self.record.payload()
    }

    pub fn offset(&self) -> i64 {
        self.record.offset()
    }

    pub fn partition(&self) -> i32 {
        self.record.partition()
    }

    pub fn topic(&self) -> &str {
        self.record.topic()
    }

    pub fn record(&self) -> &ConsumerRecord {
        &self.record
    }

    pub fn commit(&self) {
        self.commit_with_message("");
    }

    pub fn commit_with_message(&self, note: &str) {
        self.session.mark_message(&self.record, note);
    }

    /// Sends the raw record, not the mapped content, to the consumer's failure
    /// producer. Succeeds without effect when no failure producer is configured
    /// or when it is disabled.
    pub async fn send_to_failure_topic(&self) -> Result<(), UniverseError> {
        let Some(name) = self.failure_route.producer_name() else {
            return Ok(());
        };
        match self.failure_route.producer() {
            Some(producer) if !producer.is_enabled() => Ok(()),
            Some(producer) if producer.is_initialized() => {
                producer
                    .send_message_bytes(self.record.payload().to_vec())
                    .await
            }
            _ => Err(UniverseError::UninitializedFailureProducer(name.to_string())),
        }
    }

    /// Stops the consumption of this record's partition, provided the handler
    /// also returns an error.
    pub fn abort_consuming(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}
