use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::ClientConfig;

use crate::error::BrokerError;
use crate::kafka::types::GroupOverrides;
use crate::token::TokenProvider;

/// Connection parameters shared by every connection opened for one cluster.
#[derive(Clone)]
pub struct ClusterSettings {
    pub cluster_id: String,
    pub brokers: Vec<String>,
    pub version: String,
    pub tls_enabled: bool,
    /// TCP keep-alive. librdkafka only exposes an on/off switch, so any
    /// non-zero period enables it with the OS keep-alive interval; zero disables it.
    pub keep_alive: Option<Duration>,
    pub max_open_requests: Option<u32>,
    pub client_log_enabled: bool,
    pub client_id: Option<String>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
}

impl fmt::Debug for ClusterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSettings")
            .field("cluster_id", &self.cluster_id)
            .field("brokers", &self.brokers)
            .field("version", &self.version)
            .field("tls_enabled", &self.tls_enabled)
            .field("keep_alive", &self.keep_alive)
            .field("max_open_requests", &self.max_open_requests)
            .field("client_log_enabled", &self.client_log_enabled)
            .field("client_id", &self.client_id)
            .field("oauth", &self.token_provider.is_some())
            .finish()
    }
}

impl ClusterSettings {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

/// Checks a broker version such as `2.8.0` or `0.10.2.1` and returns it in the
/// form librdkafka expects for `broker.version.fallback`.
pub fn parse_broker_version(version: &str) -> Result<String, BrokerError> {
    let parts = version.trim().split('.').collect::<Vec<_>>();
    let well_formed = (2..=4).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if !well_formed {
        return Err(BrokerError::InvalidVersion(version.to_string()));
    }
    Ok(parts.join("."))
}

/// rdkafka client configuration builder for universe connections.
///
/// Two entry points provide the defaults for each connection type:
/// - `for_consumer_group`: group consumer whose offsets are stored explicitly
///   by the claim loop and committed in the background by librdkafka.
/// - `for_producer`: producer that waits for every delivery.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn for_consumer_group(
        settings: &ClusterSettings,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Self, BrokerError> {
        let builder = Self::base(settings)?;
        let mut config = builder.config;

        config
            .set("group.id", group_name)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("auto.offset.reset", overrides.initial_offset.reset_policy());

        Ok(Self { config })
    }

    pub fn for_producer(settings: &ClusterSettings) -> Result<Self, BrokerError> {
        let builder = Self::base(settings)?;
        let mut config = builder.config;

        config
            .set("message.timeout.ms", "20000")
            .set("acks", "all")
            .set("linger.ms", "0");

        Ok(Self { config })
    }

    fn base(settings: &ClusterSettings) -> Result<Self, BrokerError> {
        let version = parse_broker_version(&settings.version)?;
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", settings.bootstrap_servers())
            .set("broker.version.fallback", version)
            .set("socket.timeout.ms", "10000");

        if let Some(client_id) = &settings.client_id {
            config.set("client.id", client_id);
        }

        let builder = Self { config }
            .with_security(settings.tls_enabled, settings.token_provider.is_some())
            .with_keep_alive(settings.keep_alive);

        Ok(match settings.max_open_requests {
            Some(requests) => builder.with_max_open_requests(requests),
            None => builder,
        })
    }

    /// TLS and SASL/OAUTHBEARER
    pub fn with_security(mut self, tls_enabled: bool, oauth_enabled: bool) -> Self {
        let protocol = match (oauth_enabled, tls_enabled) {
            (true, true) => "SASL_SSL",
            (true, false) => "SASL_PLAINTEXT",
            (false, true) => "SSL",
            (false, false) => "PLAINTEXT",
        };
        self.config.set("security.protocol", protocol);
        if oauth_enabled {
            self.config.set("sasl.mechanism", "OAUTHBEARER");
        }
        self
    }

    pub fn with_keep_alive(mut self, period: Option<Duration>) -> Self {
        match period {
            Some(period) if !period.is_zero() => {
                self.config.set("socket.keepalive.enable", "true");
            }
            Some(_) => {
                self.config.set("socket.keepalive.enable", "false");
            }
            None => {}
        }
        self
    }

    pub fn with_max_open_requests(mut self, requests: u32) -> Self {
        self.config.set(
            "max.in.flight.requests.per.connection",
            requests.to_string(),
        );
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
