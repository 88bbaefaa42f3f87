#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use kafka_universe::test_utils::MockConnector;
use kafka_universe::{
    ClusterDefinition, ConsumedMessage, ConsumerDefinition, MessageContext, MessageHandler,
    ProducerDefinition, SecurityDefinition, Universe, UniverseError,
};

pub const WAIT: Duration = Duration::from_secs(30);

pub fn producer(id: &str, topic: &str) -> ProducerDefinition {
    ProducerDefinition {
        id: Some(id.to_string()),
        enabled: None,
        topic: Some(topic.to_string()),
    }
}

pub fn consumer(id: &str, topic: &str, group: &str, failure: Option<&str>) -> ConsumerDefinition {
    ConsumerDefinition {
        id: Some(id.to_string()),
        topic: Some(topic.to_string()),
        consumer_group_name: Some(group.to_string()),
        failure_producer: failure.map(str::to_string),
        ..Default::default()
    }
}

pub fn cluster(
    id: &str,
    producers: Vec<ProducerDefinition>,
    consumers: Vec<ConsumerDefinition>,
) -> ClusterDefinition {
    ClusterDefinition {
        id: Some(id.to_string()),
        version: Some("2.8.0".to_string()),
        tls_enabled: Some(false),
        brokers: vec!["localhost:9092".to_string()],
        security: Some(SecurityDefinition {
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            token_url: Some("http://localhost/token".to_string()),
        }),
        producers,
        consumers,
        ..Default::default()
    }
}

pub fn build(
    connector: &Arc<MockConnector>,
    clusters: Vec<ClusterDefinition>,
) -> Result<Universe, UniverseError> {
    Universe::builder()
        .connector(connector.clone())
        .build(clusters)
}

/// What a handler saw of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub partition: i32,
    pub offset: i64,
    pub content: String,
}

/// Handler recording every message, failing or aborting on chosen offsets.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<Received>>>,
    fail_on: Arc<HashSet<i64>>,
    abort_on: Arc<HashSet<i64>>,
}

impl RecordingHandler {
    pub fn failing_on(offsets: &[i64]) -> Self {
        Self {
            fail_on: Arc::new(offsets.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn aborting_on(offsets: &[i64]) -> Self {
        Self {
            abort_on: Arc::new(offsets.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_offsets(&self) -> Vec<i64> {
        self.received().iter().map(|r| r.offset).collect()
    }
}

fn describe(message: &ConsumedMessage) -> String {
    if let Some(text) = message.content_as::<String>() {
        return text.clone();
    }
    match message.content_as::<Vec<u8>>() {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "<opaque>".to_string(),
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, _context: &MessageContext, message: &ConsumedMessage) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(Received {
            partition: message.partition(),
            offset: message.offset(),
            content: describe(message),
        });

        let offset = message.offset();
        if self.abort_on.contains(&offset) {
            message.abort_consuming();
            bail!("abort requested at {offset}");
        }
        if self.fail_on.contains(&offset) {
            bail!("failed to handle {offset}");
        }
        Ok(())
    }
}
