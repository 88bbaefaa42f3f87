use std::str::FromStr;

use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

/// Where a consumer group starts reading when it has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

impl InitialOffset {
    /// Value for librdkafka's `auto.offset.reset`
    pub fn reset_policy(&self) -> &'static str {
        match self {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownInitialOffset(pub String);

impl FromStr for InitialOffset {
    type Err = UnknownInitialOffset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(InitialOffset::Oldest),
            "newest" => Ok(InitialOffset::Newest),
            other => Err(UnknownInitialOffset(other.to_string())),
        }
    }
}

/// Per-group settings merged over the cluster's base configuration when a
/// consumer group connection is first opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupOverrides {
    pub initial_offset: InitialOffset,
}

/// One record delivered to a consumer, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    topic: String,
    partition: i32,
    offset: i64,
    timestamp: Option<DateTime<Utc>>,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl ConsumerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            timestamp: None,
            key: None,
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn as_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// A message handed to a sync producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// The stream of records of one partition for the duration of one rebalance
/// generation, in delivery order.
pub struct PartitionClaim {
    partition: Partition,
    messages: mpsc::Receiver<ConsumerRecord>,
}

impl PartitionClaim {
    pub fn new(partition: Partition, messages: mpsc::Receiver<ConsumerRecord>) -> Self {
        Self {
            partition,
            messages,
        }
    }

    /// Builds a claim that yields the given records then ends.
    pub fn from_records(partition: Partition, records: Vec<ConsumerRecord>) -> Self {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            // capacity covers every record
            if tx.try_send(record).is_err() {
                break;
            }
        }
        Self::new(partition, rx)
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Next record of the claim, `None` once the claim is over.
    pub async fn next(&mut self) -> Option<ConsumerRecord> {
        self.messages.recv().await
    }
}
