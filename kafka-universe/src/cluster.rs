use std::env;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::definition::{field, ClusterDefinition};
use crate::error::{BrokerError, UniverseError};
use crate::kafka::{
    BrokerConnector, ClusterSettings, ConsumerGroup, GroupOverrides, NoopConsumerGroup,
    SyncProducer,
};
use crate::token::ClientCredentialsTokenProvider;

const CLIENT_SECRET_SUFFIX: &str = "_CLIENT_SECRET";

/// Name of the environment variable overriding a cluster's client secret.
pub fn client_secret_variable(prefix: &str, cluster_id: &str) -> String {
    format!(
        "{prefix}{}{CLIENT_SECRET_SUFFIX}",
        cluster_id.to_uppercase().replace('-', "_")
    )
}

fn client_secret_override(prefix: &str, cluster_id: &str) -> Option<String> {
    env::var(client_secret_variable(prefix, cluster_id))
        .ok()
        .filter(|secret| !secret.is_empty())
}

/// A set of brokers with their connection parameters and the consumer groups
/// opened against them, one per group name.
pub struct Cluster {
    enabled: bool,
    settings: ClusterSettings,
    connector: Arc<dyn BrokerConnector>,
    groups: DashMap<String, Arc<dyn ConsumerGroup>>,
}

impl Cluster {
    /// Builds a cluster from a validated definition.
    pub fn new(
        definition: &ClusterDefinition,
        secret_env_prefix: &str,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let cluster_id = field(&definition.id).to_string();
        let security = definition.security.clone().unwrap_or_default();

        let client_id = field(&security.client_id).to_string();
        let client_secret = match client_secret_override(secret_env_prefix, &cluster_id) {
            Some(secret) => {
                info!(cluster = %cluster_id, "Using client secret from environment");
                secret
            }
            None => field(&security.client_secret).to_string(),
        };
        let token_provider = ClientCredentialsTokenProvider::new(
            client_id.clone(),
            client_secret,
            field(&security.token_url).to_string(),
        );

        let settings = ClusterSettings {
            cluster_id,
            brokers: definition.brokers.clone(),
            version: field(&definition.version).to_string(),
            tls_enabled: definition.tls_enabled.unwrap_or(false),
            keep_alive: definition.keep_alive(),
            max_open_requests: definition.max_open_requests,
            client_log_enabled: definition.client_log_enabled.unwrap_or(false),
            client_id: Some(client_id),
            token_provider: Some(Arc::new(token_provider)),
        };

        Self::with_settings(settings, definition.is_enabled(), connector)
    }

    pub fn with_settings(
        settings: ClusterSettings,
        enabled: bool,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        Self {
            enabled,
            settings,
            connector,
            groups: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.settings.cluster_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Returns the consumer group registered under `group_name`, connecting it
    /// first if needed. The overrides only apply to the first connection of a
    /// group name; later callers get the existing group as is.
    pub fn get_or_create_consumer_group(
        &self,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Arc<dyn ConsumerGroup>, UniverseError> {
        if !self.enabled {
            return Ok(Arc::new(NoopConsumerGroup));
        }

        match self.groups.entry(group_name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let group = self
                    .connector
                    .connect_consumer_group(&self.settings, group_name, overrides)
                    .map_err(|source| {
                        warn!(
                            cluster = %self.settings.cluster_id,
                            group = group_name,
                            error = ?source,
                            "Failed to create consumer group"
                        );
                        UniverseError::Connection {
                            target: format!("consumer group {group_name}"),
                            source,
                        }
                    })?;
                entry.insert(group.clone());
                Ok(group)
            }
        }
    }

    pub fn connect_producer(&self) -> Result<Arc<dyn SyncProducer>, BrokerError> {
        self.connector.connect_producer(&self.settings)
    }

    /// Closes every registered consumer group. All groups are closed even when
    /// some fail; the last failure is returned.
    pub fn close(&self) -> Result<(), UniverseError> {
        let mut last_error = None;
        for entry in self.groups.iter() {
            if let Err(source) = entry.value().close() {
                warn!(
                    cluster = %self.settings.cluster_id,
                    group = %entry.key(),
                    error = ?source,
                    "Failed to close consumer group"
                );
                last_error = Some(UniverseError::Close {
                    target: format!("consumer group {}", entry.key()),
                    source,
                });
            }
        }
        self.groups.clear();

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
