use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Which kind of actor an error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKind {
    Producer,
    Consumer,
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKind::Producer => write!(f, "producer"),
            ActorKind::Consumer => write!(f, "consumer"),
        }
    }
}

/// A declarative definition failed one of the validation rules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cluster id should be set and not empty")]
    MissingClusterId,
    #[error("cluster {cluster}: {field} should be set and not empty")]
    MissingClusterField {
        cluster: String,
        field: &'static str,
    },
    #[error("cluster {cluster}: brokers should contain at least one broker")]
    NoBrokers { cluster: String },
    #[error("cluster {cluster}: broker value should not be empty")]
    EmptyBroker { cluster: String },
    #[error("cluster {cluster}: security configuration is missing")]
    MissingSecurity { cluster: String },
    #[error("cluster {cluster}: security {field} is mandatory and should not be empty")]
    MissingSecurityField {
        cluster: String,
        field: &'static str,
    },
    #[error("cluster {cluster}: configure at least one producer or consumer")]
    NoActors { cluster: String },
    #[error("{kind} id is mandatory and should not be empty")]
    MissingActorId { kind: ActorKind },
    #[error("{kind} {id}: {field} is mandatory and should not be empty")]
    MissingActorField {
        kind: ActorKind,
        id: String,
        field: &'static str,
    },
    #[error("consumer {consumer}: failure-producer is optional but should not be empty")]
    EmptyFailureProducer { consumer: String },
    #[error("consumer {consumer}: initial-offset '{value}' should be either 'oldest' or 'newest'")]
    InvalidInitialOffset { consumer: String, value: String },
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: ActorKind, id: String },
}

/// The configuration provider could not produce cluster definitions.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the broker collaborator.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("can't parse kafka version {0}")]
    InvalidVersion(String),
    #[error("consumer group {0} is closed")]
    Closed(String),
    #[error("topic {topic} of consumer group {group} is already consumed by another handler")]
    TopicTaken { group: String, topic: String },
    #[error("broker transport failure: {0}")]
    Transport(String),
}

/// Failures of the OAuth2 token provider.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("token request worker panicked")]
    Worker,
}

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("kafka universe is empty")]
    EmptyUniverse,
    #[error("invalid kafka configuration: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("invalid failure producer {producer} for consumer {consumer}")]
    UnknownFailureProducer { consumer: String, producer: String },
    #[error("unknown producer {0}")]
    UnknownProducer(String),
    #[error("unknown consumer {0}")]
    UnknownConsumer(String),
    #[error("{kind} {id} already initialized")]
    AlreadyInitialized { kind: ActorKind, id: String },
    #[error("{kind} {id} is not initialized")]
    NotInitialized { kind: ActorKind, id: String },
    #[error("failed to connect {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to send message to uninitialized producer {0}")]
    UninitializedFailureProducer(String),
    #[error("failed to send message to topic {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to close {target}: {source}")]
    Close {
        target: String,
        #[source]
        source: BrokerError,
    },
}

/// Reported by a consumer's supervising loop when the broker session failed.
/// The consumer stops; the hosting application decides what happens next.
#[derive(Debug, Error)]
#[error("consumer {consumer} on topic {topic} stopped after a broker failure: {source}")]
pub struct FatalConsumerError {
    pub consumer: String,
    pub topic: String,
    #[source]
    pub source: BrokerError,
}
