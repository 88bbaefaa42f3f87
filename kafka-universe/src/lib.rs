//! Declarative Kafka clusters, producers and consumers.
//!
//! A [`Universe`] is built from cluster definitions. Each cluster owns named
//! producers and consumers; consumers run a mapper pipeline over every record
//! before handing it to an application [`MessageHandler`], and can redirect
//! unmappable records to a failure producer.

pub mod cluster;
pub mod config;
pub mod consumer;
pub mod definition;
pub mod error;
pub mod kafka;
pub mod mappers;
pub mod message;
pub mod metrics_consts;
pub mod producer;
pub mod test_utils;
pub mod token;
pub mod universe;

pub use cluster::Cluster;
pub use consumer::{Consumer, Content, ContentMapper, ContextInitializer, MessageContext, MessageHandler};
pub use definition::{
    ClusterDefinition, ConfigurationProvider, ConsumerDefinition, JsonConfiguration,
    ProducerDefinition, SecurityDefinition,
};
pub use error::{FatalConsumerError, UniverseError};
pub use message::ConsumedMessage;
pub use producer::Producer;
pub use universe::{Universe, UniverseBuilder};
