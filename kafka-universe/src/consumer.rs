//! Consumers and their consumption loop.
//!
//! Every record of a partition claim goes through the same steps, in delivery
//! order: a fresh [`MessageContext`], the optional consumption delay, the mapper
//! pipeline, then either the message handler or, when mapping failed, the
//! failure topic. With auto-commit on, the record is marked processed whatever
//! the outcome, unless the handler aborted the claim.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::definition::{field, ConsumerDefinition};
use crate::error::{ActorKind, BrokerError, FatalConsumerError, UniverseError};
use crate::kafka::{
    ClaimHandler, ConsumerGroup, ConsumerRecord, GroupOverrides, GroupSession, InitialOffset,
    NoopConsumerGroup, PartitionClaim,
};
use crate::message::{ConsumedMessage, FailureRoute};
use crate::metrics_consts::{
    CLAIMS_ABORTED, FAILURE_TOPIC_DROPS, FAILURE_TOPIC_SENDS, FATAL_CONSUMER_ERRORS,
    MAPPER_FAILURES, RECORDS_PROCESSED,
};

/// Placeholder replaced by a random UUID in consumer group names.
pub const GROUP_NAME_UUID_PLACEHOLDER: &str = "<UUID>";

const DEFAULT_LOG_EVENT_RATE: i64 = 1000;

/// Content flowing through the mapper pipeline. Starts as the raw payload, a
/// `Vec<u8>`; each mapper decides what it turns it into.
pub type Content = Box<dyn Any + Send + Sync>;

/// Per-record context, built before the record is mapped and handed over to
/// every mapper and to the handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub correlation_id: Option<String>,
    pub attributes: HashMap<String, String>,
    /// Span the handler runs in.
    pub span: Span,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            correlation_id: None,
            attributes: HashMap::new(),
            span: Span::none(),
        }
    }
}

impl MessageContext {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Application code receiving the mapped records of a consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, context: &MessageContext, message: &ConsumedMessage)
        -> anyhow::Result<()>;
}

/// One step of the mapper pipeline.
pub trait ContentMapper: Send + Sync {
    fn map(&self, context: &MessageContext, offset: i64, content: Content)
        -> anyhow::Result<Content>;
}

impl<F> ContentMapper for F
where
    F: Fn(&MessageContext, i64, Content) -> anyhow::Result<Content> + Send + Sync,
{
    fn map(&self, context: &MessageContext, offset: i64, content: Content) -> anyhow::Result<Content> {
        self(context, offset, content)
    }
}

/// Builds the context of each record.
pub trait ContextInitializer: Send + Sync {
    fn initialize(&self, context: MessageContext) -> MessageContext;
}

impl<F> ContextInitializer for F
where
    F: Fn(MessageContext) -> MessageContext + Send + Sync,
{
    fn initialize(&self, context: MessageContext) -> MessageContext {
        self(context)
    }
}

struct NotImplementedHandler;

#[async_trait]
impl MessageHandler for NotImplementedHandler {
    async fn handle(&self, _: &MessageContext, _: &ConsumedMessage) -> anyhow::Result<()> {
        Err(anyhow!("handler not implemented"))
    }
}

struct IdentityContext;

impl ContextInitializer for IdentityContext {
    fn initialize(&self, context: MessageContext) -> MessageContext {
        context
    }
}

/// Named consumption actor bound to one topic and one consumer group.
pub struct Consumer {
    id: String,
    enabled: bool,
    topic: String,
    group_name: String,
    initial_offset: InitialOffset,
    consumption_delay: Option<Duration>,
    cluster: Arc<Cluster>,
    failure_route: FailureRoute,
    mappers: Vec<Arc<dyn ContentMapper>>,
    handler: Arc<dyn MessageHandler>,
    context_initializer: Arc<dyn ContextInitializer>,
    auto_commit: bool,
    log_event_rate: i64,
    group: Option<Arc<dyn ConsumerGroup>>,
    fatal_errors: mpsc::UnboundedSender<FatalConsumerError>,
}

impl Consumer {
    pub fn new(
        cluster: Arc<Cluster>,
        definition: &ConsumerDefinition,
        failure_route: FailureRoute,
        fatal_errors: mpsc::UnboundedSender<FatalConsumerError>,
    ) -> Self {
        let enabled = cluster.is_enabled() && definition.enabled.unwrap_or(true);
        let group_name = field(&definition.consumer_group_name).replacen(
            GROUP_NAME_UUID_PLACEHOLDER,
            &Uuid::new_v4().to_string(),
            1,
        );

        Self {
            id: field(&definition.id).to_string(),
            enabled,
            topic: field(&definition.topic).to_string(),
            group_name,
            initial_offset: definition.initial_offset(),
            consumption_delay: definition.consumption_delay(),
            cluster,
            failure_route,
            mappers: Vec::new(),
            handler: Arc::new(NotImplementedHandler),
            context_initializer: Arc::new(IdentityContext),
            auto_commit: true,
            log_event_rate: DEFAULT_LOG_EVENT_RATE,
            group: None,
            fatal_errors,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_initialized(&self) -> bool {
        self.group.is_some()
    }

    pub fn failure_route(&self) -> &FailureRoute {
        &self.failure_route
    }

    pub fn set_handler(&mut self, handler: impl MessageHandler + 'static) -> &mut Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn add_content_mapper(&mut self, mapper: impl ContentMapper + 'static) -> &mut Self {
        self.mappers.push(Arc::new(mapper));
        self
    }

    pub fn set_context_initializer(
        &mut self,
        initializer: impl ContextInitializer + 'static,
    ) -> &mut Self {
        self.context_initializer = Arc::new(initializer);
        self
    }

    pub fn set_auto_commit(&mut self, enabled: bool) -> &mut Self {
        self.auto_commit = enabled;
        self
    }

    /// Rates lower than 1 are ignored.
    pub fn set_log_event_rate(&mut self, rate: i64) -> &mut Self {
        if rate > 0 {
            self.log_event_rate = rate;
        }
        self
    }

    pub fn initialize(&mut self) -> Result<(), UniverseError> {
        if self.group.is_some() {
            return Err(UniverseError::AlreadyInitialized {
                kind: ActorKind::Consumer,
                id: self.id.clone(),
            });
        }

        let group: Arc<dyn ConsumerGroup> = if self.enabled {
            let overrides = GroupOverrides {
                initial_offset: self.initial_offset,
            };
            self.cluster
                .get_or_create_consumer_group(&self.group_name, &overrides)?
        } else {
            Arc::new(NoopConsumerGroup)
        };

        self.group = Some(group);
        info!(
            consumer = %self.id,
            group = %self.group_name,
            enabled = self.enabled,
            "Initialized consumer"
        );
        Ok(())
    }

    /// Starts the supervising loop on its own task. Returns `None` when the
    /// consumer is disabled or not initialized.
    pub fn go(&self) -> Option<JoinHandle<()>> {
        if !self.enabled {
            return None;
        }
        let group = self.group.clone()?;

        let supervisor = Supervisor {
            consumer_id: self.id.clone(),
            topic: self.topic.clone(),
            failure_topic: self
                .failure_route
                .producer_name()
                .unwrap_or("none")
                .to_string(),
            group,
            worker: Arc::new(self.worker()),
            fatal_errors: self.fatal_errors.clone(),
        };
        Some(tokio::spawn(supervisor.run()))
    }

    pub fn close(&self) -> Result<(), UniverseError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(group) = &self.group else {
            return Ok(());
        };
        group.close().map_err(|source| {
            warn!(consumer = %self.id, group = %self.group_name, error = ?source, "Failed to close consumer group");
            UniverseError::Close {
                target: format!("consumer {}", self.id),
                source,
            }
        })
    }

    fn worker(&self) -> ConsumerWorker {
        ConsumerWorker {
            consumer_id: self.id.clone(),
            topic: self.topic.clone(),
            group_name: self.group_name.clone(),
            failure_route: self.failure_route.clone(),
            consumption_delay: self.consumption_delay,
            mappers: self.mappers.clone(),
            handler: self.handler.clone(),
            context_initializer: self.context_initializer.clone(),
            auto_commit: self.auto_commit,
            log_event_rate: self.log_event_rate,
        }
    }
}

struct Supervisor {
    consumer_id: String,
    topic: String,
    failure_topic: String,
    group: Arc<dyn ConsumerGroup>,
    worker: Arc<ConsumerWorker>,
    fatal_errors: mpsc::UnboundedSender<FatalConsumerError>,
}

impl Supervisor {
    /// Consumes one generation after the other until the group reports an
    /// error. That error is fatal for the consumer.
    async fn run(self) {
        info!(
            consumer = %self.consumer_id,
            topic = %self.topic,
            failure_topic = %self.failure_topic,
            "Started consuming topic"
        );
        let topics = [self.topic.clone()];

        loop {
            let result = self.group.consume(&topics, self.worker.clone()).await;
            if let Err(BrokerError::Closed(group)) = &result {
                info!(consumer = %self.consumer_id, group = %group, "Consumer group closed, stop consuming");
                return;
            }

            if let Some(source) = result.err().or_else(|| self.group.next_error()) {
                self.fail(source);
                return;
            }
        }
    }

    fn fail(&self, source: BrokerError) {
        error!(
            consumer = %self.consumer_id,
            topic = %self.topic,
            error = ?source,
            "Failure during message processing, consumer stopped"
        );
        metrics::counter!(FATAL_CONSUMER_ERRORS, "consumer" => self.consumer_id.clone())
            .increment(1);

        let fatal = FatalConsumerError {
            consumer: self.consumer_id.clone(),
            topic: self.topic.clone(),
            source,
        };
        if self.fatal_errors.send(fatal).is_err() {
            error!(consumer = %self.consumer_id, "Nobody listens to fatal consumer errors");
        }
    }
}

/// Claim handler running the per-record steps of one consumer.
struct ConsumerWorker {
    consumer_id: String,
    topic: String,
    group_name: String,
    failure_route: FailureRoute,
    consumption_delay: Option<Duration>,
    mappers: Vec<Arc<dyn ContentMapper>>,
    handler: Arc<dyn MessageHandler>,
    context_initializer: Arc<dyn ContextInitializer>,
    auto_commit: bool,
    log_event_rate: i64,
}

impl ConsumerWorker {
    async fn process(
        &self,
        session: &Arc<dyn GroupSession>,
        record: ConsumerRecord,
    ) -> anyhow::Result<()> {
        let context = self.context_initializer.initialize(MessageContext::default());
        self.wait_consumption_delay(&record).await;

        let mapped = self.apply_mappers(&context, &record);
        let mapping_failed = mapped.is_err();
        let message = ConsumedMessage::new(
            record,
            mapped.ok(),
            session.clone(),
            self.failure_route.clone(),
        );

        if mapping_failed {
            self.redirect_to_failure_topic(&message).await;
            self.count(&message, "mapper_error");
        } else {
            let result = self
                .handler
                .handle(&context, &message)
                .instrument(context.span.clone())
                .await;
            match result {
                Ok(()) => self.count(&message, "handled"),
                Err(e) => {
                    error!(
                        consumer = %self.consumer_id,
                        topic = %message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Failed to handle event: {e:#}"
                    );
                    self.count(&message, "handler_error");
                    if message.abort_requested() {
                        metrics::counter!(CLAIMS_ABORTED, "consumer" => self.consumer_id.clone())
                            .increment(1);
                        return Err(e);
                    }
                }
            }

            let offset = message.offset();
            if offset % self.log_event_rate == 0 {
                info!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    "Messages from {} to {} offset are processed",
                    offset - self.log_event_rate,
                    offset
                );
            }
        }

        if self.auto_commit {
            message.commit();
        }
        Ok(())
    }

    async fn wait_consumption_delay(&self, record: &ConsumerRecord) {
        let (Some(delay), Some(timestamp)) = (self.consumption_delay, record.timestamp()) else {
            return;
        };
        let since_production = (Utc::now() - timestamp).to_std().unwrap_or_default();
        if since_production >= delay {
            return;
        }

        let pause = delay - since_production;
        info!(
            pause = ?pause,
            consumption_delay = ?delay,
            group = %self.group_name,
            "Pause consumption because of consumption delay"
        );
        tokio::time::sleep(pause).await;
    }

    fn apply_mappers(
        &self,
        context: &MessageContext,
        record: &ConsumerRecord,
    ) -> anyhow::Result<Content> {
        let mut content: Content = Box::new(record.payload().to_vec());
        for (idx, mapper) in self.mappers.iter().enumerate() {
            content = mapper.map(context, record.offset(), content).map_err(|e| {
                error!(
                    topic = %self.topic,
                    offset = record.offset(),
                    partition = record.partition(),
                    content_length = record.payload().len(),
                    "Mapper #{} failed to map content: {e:#}",
                    idx + 1
                );
                metrics::counter!(MAPPER_FAILURES, "consumer" => self.consumer_id.clone())
                    .increment(1);
                e
            })?;
        }
        Ok(content)
    }

    async fn redirect_to_failure_topic(&self, message: &ConsumedMessage) {
        let Some(failure_producer) = self.failure_route.producer_name() else {
            return;
        };
        match message.send_to_failure_topic().await {
            Ok(()) => {
                metrics::counter!(FAILURE_TOPIC_SENDS, "consumer" => self.consumer_id.clone())
                    .increment(1);
            }
            Err(e) => {
                // the record reaches neither the handler nor the failure topic
                error!(
                    consumer = %self.consumer_id,
                    failure_producer,
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    error = ?e,
                    "Unmappable record could not be sent to the failure topic"
                );
                metrics::counter!(FAILURE_TOPIC_DROPS, "consumer" => self.consumer_id.clone())
                    .increment(1);
            }
        }
    }

    fn count(&self, message: &ConsumedMessage, outcome: &'static str) {
        metrics::counter!(
            RECORDS_PROCESSED,
            "consumer" => self.consumer_id.clone(),
            "topic" => message.topic().to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

#[async_trait]
impl ClaimHandler for ConsumerWorker {
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: PartitionClaim,
    ) -> anyhow::Result<()> {
        while let Some(record) = claim.next().await {
            self.process(&session, record).await?;
        }
        Ok(())
    }
}
