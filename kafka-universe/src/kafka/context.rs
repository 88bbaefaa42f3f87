use std::sync::Arc;

use rdkafka::client::OAuthToken;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::token::TokenProvider;

/// Client context shared by the producers and consumer groups of a universe.
///
/// Consumer groups additionally get a generation signal, notified when
/// partitions get revoked, and an error sink feeding the group's error channel.
pub struct UniverseContext {
    cluster_id: String,
    principal: String,
    client_log_enabled: bool,
    token_provider: Option<Arc<dyn TokenProvider>>,
    generation: Option<Arc<Notify>>,
    errors: Option<mpsc::UnboundedSender<BrokerError>>,
}

impl UniverseContext {
    pub fn for_producer(
        cluster_id: &str,
        principal: Option<&str>,
        client_log_enabled: bool,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            principal: principal.unwrap_or(cluster_id).to_string(),
            client_log_enabled,
            token_provider,
            generation: None,
            errors: None,
        }
    }

    pub fn for_consumer_group(
        cluster_id: &str,
        principal: Option<&str>,
        client_log_enabled: bool,
        token_provider: Option<Arc<dyn TokenProvider>>,
        generation: Arc<Notify>,
        errors: mpsc::UnboundedSender<BrokerError>,
    ) -> Self {
        Self {
            generation: Some(generation),
            errors: Some(errors),
            ..Self::for_producer(cluster_id, principal, client_log_enabled, token_provider)
        }
    }

    fn end_generation(&self) {
        if let Some(generation) = &self.generation {
            generation.notify_one();
        }
    }
}

impl ClientContext for UniverseContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        if !self.client_log_enabled {
            return;
        }
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(tag = "client", cluster = %self.cluster_id, facility = fac, "{log_message}")
            }
            RDKafkaLogLevel::Warning => {
                warn!(tag = "client", cluster = %self.cluster_id, facility = fac, "{log_message}")
            }
            _ => info!(tag = "client", cluster = %self.cluster_id, facility = fac, "{log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(cluster = %self.cluster_id, error = ?error, reason, "Kafka client error");
        if let Some(errors) = &self.errors {
            if errors.send(BrokerError::Kafka(error)).is_err() {
                debug!(cluster = %self.cluster_id, "Consumer group error channel closed");
            }
        }
    }

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> Result<OAuthToken, Box<dyn std::error::Error>> {
        let Some(provider) = &self.token_provider else {
            return Err("no OAuth2 token provider configured".into());
        };
        let token = provider.token().map_err(|e| {
            warn!(cluster = %self.cluster_id, error = ?e, "Failed to obtain OAuth2 token");
            e
        })?;
        Ok(OAuthToken {
            token: token.value,
            principal_name: self.principal.clone(),
            lifetime_ms: token.expires_at.timestamp_millis(),
        })
    }
}

impl ConsumerContext for UniverseContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(cluster = %self.cluster_id, "Revoking {} partitions", partitions.count());
            // claims of the current generation must stop before the new assignment
            self.end_generation();
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(cluster = %self.cluster_id, "Assigned {} partitions", partitions.count());
            }
            Rebalance::Revoke(partitions) => {
                info!(cluster = %self.cluster_id, "Revoked {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!(cluster = %self.cluster_id, "Rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(
                cluster = %self.cluster_id,
                "Committed offsets for {} partitions",
                offsets.count()
            ),
            Err(e) => warn!(cluster = %self.cluster_id, "Failed to commit offsets: {}", e),
        }
    }
}
