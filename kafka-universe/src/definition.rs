//! Declarative cluster, producer and consumer definitions.
//!
//! Every field is optional at the decoding level so a missing key can be told
//! apart from an empty one; `validate()` enforces what is actually mandatory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ActorKind, ConfigurationError, ValidationError};
use crate::kafka::InitialOffset;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterDefinition {
    pub id: Option<String>,
    pub enabled: Option<bool>,
    pub version: Option<String>,
    pub tls_enabled: Option<bool>,
    pub keep_alive_ms: Option<u64>,
    pub max_open_requests: Option<u32>,
    pub client_log_enabled: Option<bool>,
    #[serde(default)]
    pub brokers: Vec<String>,
    pub security: Option<SecurityDefinition>,
    #[serde(default)]
    pub producers: Vec<ProducerDefinition>,
    #[serde(default)]
    pub consumers: Vec<ConsumerDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SecurityDefinition {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProducerDefinition {
    pub id: Option<String>,
    pub enabled: Option<bool>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerDefinition {
    pub id: Option<String>,
    pub enabled: Option<bool>,
    pub topic: Option<String>,
    pub consumer_group_name: Option<String>,
    pub failure_producer: Option<String>,
    pub consumption_delay_ms: Option<u64>,
    pub initial_offset: Option<String>,
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, str::is_empty)
}

/// Value of a field that `validate()` already checked.
pub(crate) fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

impl ClusterDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_blank(&self.id) {
            return Err(ValidationError::MissingClusterId);
        }
        let cluster = field(&self.id).to_string();

        if is_blank(&self.version) {
            return Err(ValidationError::MissingClusterField {
                cluster,
                field: "version",
            });
        }
        if self.brokers.is_empty() {
            return Err(ValidationError::NoBrokers { cluster });
        }
        if self.brokers.iter().any(String::is_empty) {
            return Err(ValidationError::EmptyBroker { cluster });
        }
        match &self.security {
            None => return Err(ValidationError::MissingSecurity { cluster }),
            Some(security) => security.validate(&cluster)?,
        }
        if self.producers.is_empty() && self.consumers.is_empty() {
            return Err(ValidationError::NoActors { cluster });
        }
        for producer in &self.producers {
            producer.validate()?;
        }
        for consumer in &self.consumers {
            consumer.validate()?;
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms.map(Duration::from_millis)
    }
}

impl SecurityDefinition {
    pub fn validate(&self, cluster: &str) -> Result<(), ValidationError> {
        let checks = [
            ("client-id", &self.client_id),
            ("client-secret", &self.client_secret),
            ("token-url", &self.token_url),
        ];
        for (name, value) in checks {
            if is_blank(value) {
                return Err(ValidationError::MissingSecurityField {
                    cluster: cluster.to_string(),
                    field: name,
                });
            }
        }
        Ok(())
    }
}

impl ProducerDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_blank(&self.id) {
            return Err(ValidationError::MissingActorId {
                kind: ActorKind::Producer,
            });
        }
        if is_blank(&self.topic) {
            return Err(ValidationError::MissingActorField {
                kind: ActorKind::Producer,
                id: field(&self.id).to_string(),
                field: "topic",
            });
        }
        Ok(())
    }
}

impl ConsumerDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_blank(&self.id) {
            return Err(ValidationError::MissingActorId {
                kind: ActorKind::Consumer,
            });
        }
        let id = field(&self.id).to_string();

        for (name, value) in [
            ("topic", &self.topic),
            ("consumer-group-name", &self.consumer_group_name),
        ] {
            if is_blank(value) {
                return Err(ValidationError::MissingActorField {
                    kind: ActorKind::Consumer,
                    id,
                    field: name,
                });
            }
        }
        if matches!(self.failure_producer.as_deref(), Some("")) {
            return Err(ValidationError::EmptyFailureProducer { consumer: id });
        }
        if let Some(value) = &self.initial_offset {
            if value.parse::<InitialOffset>().is_err() {
                return Err(ValidationError::InvalidInitialOffset {
                    consumer: id,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Initial offset policy; `oldest` unless configured otherwise.
    pub fn initial_offset(&self) -> InitialOffset {
        self.initial_offset
            .as_deref()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    pub fn consumption_delay(&self) -> Option<Duration> {
        self.consumption_delay_ms.map(Duration::from_millis)
    }
}

/// Source of the cluster definitions a universe is built from.
pub trait ConfigurationProvider {
    fn unmarshal(&self) -> Result<Vec<ClusterDefinition>, ConfigurationError>;
}

impl<F> ConfigurationProvider for F
where
    F: Fn() -> Result<Vec<ClusterDefinition>, ConfigurationError>,
{
    fn unmarshal(&self) -> Result<Vec<ClusterDefinition>, ConfigurationError> {
        self()
    }
}

/// JSON array of cluster definitions, inline or in a file.
#[derive(Debug, Clone)]
pub enum JsonConfiguration {
    Inline(String),
    File(PathBuf),
}

impl JsonConfiguration {
    pub fn inline(json: impl Into<String>) -> Self {
        JsonConfiguration::Inline(json.into())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        JsonConfiguration::File(path.as_ref().to_path_buf())
    }
}

impl ConfigurationProvider for JsonConfiguration {
    fn unmarshal(&self) -> Result<Vec<ClusterDefinition>, ConfigurationError> {
        let clusters = match self {
            JsonConfiguration::Inline(json) => serde_json::from_str(json)?,
            JsonConfiguration::File(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
                        path: path.display().to_string(),
                        source,
                    })?;
                serde_json::from_str(&content)?
            }
        };
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use test_case::test_case;

    fn some(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    fn valid_consumer() -> ConsumerDefinition {
        ConsumerDefinition {
            id: some("consumer"),
            topic: some("topic"),
            consumer_group_name: some("group"),
            ..Default::default()
        }
    }

    fn valid_cluster() -> ClusterDefinition {
        ClusterDefinition {
            id: some("cluster"),
            version: some("2.8.0"),
            tls_enabled: Some(true),
            brokers: vec!["localhost:9092".to_string()],
            security: Some(SecurityDefinition {
                client_id: some("client"),
                client_secret: some("secret"),
                token_url: some("http://localhost/token"),
            }),
            producers: vec![ProducerDefinition {
                id: some("producer"),
                topic: some("topic"),
                ..Default::default()
            }],
            consumers: vec![valid_consumer()],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_cluster() {
        assert_eq!(valid_cluster().validate(), Ok(()));
    }

    #[test]
    fn test_cluster_validation_failures() {
        let mut cluster = valid_cluster();
        cluster.id = some("");
        assert_eq!(cluster.validate(), Err(ValidationError::MissingClusterId));

        let mut cluster = valid_cluster();
        cluster.version = None;
        assert!(matches!(
            cluster.validate(),
            Err(ValidationError::MissingClusterField { field: "version", .. })
        ));

        let mut cluster = valid_cluster();
        cluster.brokers.clear();
        assert!(matches!(
            cluster.validate(),
            Err(ValidationError::NoBrokers { .. })
        ));

        let mut cluster = valid_cluster();
        cluster.brokers.push(String::new());
        assert!(matches!(
            cluster.validate(),
            Err(ValidationError::EmptyBroker { .. })
        ));

        let mut cluster = valid_cluster();
        cluster.security = None;
        assert!(matches!(
            cluster.validate(),
            Err(ValidationError::MissingSecurity { .. })
        ));

        let mut cluster = valid_cluster();
        cluster.producers.clear();
        cluster.consumers.clear();
        assert!(matches!(
            cluster.validate(),
            Err(ValidationError::NoActors { .. })
        ));
    }

    #[test_case(None, some("secret"), some("url"), "client-id")]
    #[test_case(some("client"), some(""), some("url"), "client-secret")]
    #[test_case(some("client"), some("secret"), None, "token-url")]
    fn test_security_validation(
        client_id: Option<String>,
        client_secret: Option<String>,
        token_url: Option<String>,
        missing: &'static str,
    ) {
        let security = SecurityDefinition {
            client_id,
            client_secret,
            token_url,
        };
        assert_eq!(
            security.validate("cluster"),
            Err(ValidationError::MissingSecurityField {
                cluster: "cluster".to_string(),
                field: missing,
            })
        );
    }

    #[test]
    fn test_producer_validation() {
        let producer = ProducerDefinition::default();
        assert!(matches!(
            producer.validate(),
            Err(ValidationError::MissingActorId {
                kind: ActorKind::Producer
            })
        ));

        let producer = ProducerDefinition {
            id: some("producer"),
            ..Default::default()
        };
        assert!(matches!(
            producer.validate(),
            Err(ValidationError::MissingActorField { field: "topic", .. })
        ));
    }

    #[test_case(None, true; "absent")]
    #[test_case(some("oldest"), true; "oldest")]
    #[test_case(some("newest"), true; "newest")]
    #[test_case(some("latest"), false; "librdkafka name")]
    #[test_case(some(""), false; "empty")]
    fn test_consumer_initial_offset(value: Option<String>, valid: bool) {
        let consumer = ConsumerDefinition {
            initial_offset: value,
            ..valid_consumer()
        };
        assert_eq!(consumer.validate().is_ok(), valid);
    }

    #[test]
    fn test_consumer_validation() {
        let consumer = ConsumerDefinition {
            consumer_group_name: None,
            ..valid_consumer()
        };
        assert!(matches!(
            consumer.validate(),
            Err(ValidationError::MissingActorField {
                field: "consumer-group-name",
                ..
            })
        ));

        let consumer = ConsumerDefinition {
            failure_producer: some(""),
            ..valid_consumer()
        };
        assert_eq!(
            consumer.validate(),
            Err(ValidationError::EmptyFailureProducer {
                consumer: "consumer".to_string()
            })
        );
    }

    #[test]
    fn test_consumer_defaults() {
        let consumer = valid_consumer();
        assert_eq!(consumer.initial_offset(), InitialOffset::Oldest);
        assert_eq!(consumer.consumption_delay(), None);

        let consumer = ConsumerDefinition {
            initial_offset: some("newest"),
            consumption_delay_ms: Some(1500),
            ..valid_consumer()
        };
        assert_eq!(consumer.initial_offset(), InitialOffset::Newest);
        assert_eq!(
            consumer.consumption_delay(),
            Some(Duration::from_millis(1500))
        );
    }

    const CONFIG: &str = r#"[
        {
            "id": "cluster-1",
            "version": "2.8.0",
            "tls-enabled": false,
            "keep-alive-ms": 30000,
            "brokers": ["localhost:9092"],
            "security": {
                "client-id": "client",
                "client-secret": "secret",
                "token-url": "http://localhost/token"
            },
            "producers": [{ "id": "failure", "topic": "topic-failure" }],
            "consumers": [{
                "id": "consumer",
                "enabled": false,
                "topic": "topic",
                "consumer-group-name": "group-<UUID>",
                "failure-producer": "failure",
                "initial-offset": "newest"
            }]
        }
    ]"#;

    #[test]
    fn test_json_configuration_inline() {
        let clusters = JsonConfiguration::inline(CONFIG).unmarshal().unwrap();
        assert_eq!(clusters.len(), 1);

        let cluster = &clusters[0];
        assert_eq!(cluster.id.as_deref(), Some("cluster-1"));
        assert!(cluster.is_enabled());
        assert_eq!(cluster.keep_alive(), Some(Duration::from_secs(30)));
        assert_eq!(cluster.consumers[0].enabled, Some(false));
        assert_eq!(
            cluster.consumers[0].failure_producer.as_deref(),
            Some("failure")
        );
        assert!(cluster.validate().is_ok());
    }

    #[test]
    fn test_json_configuration_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let clusters = JsonConfiguration::from_path(file.path())
            .unmarshal()
            .unwrap();
        assert_eq!(clusters[0].producers[0].topic.as_deref(), Some("topic-failure"));

        let missing = JsonConfiguration::from_path("/does/not/exist.json").unmarshal();
        assert!(matches!(missing, Err(ConfigurationError::Io { .. })));
    }

    #[test]
    fn test_closure_configuration() {
        let provider = || -> Result<Vec<ClusterDefinition>, ConfigurationError> {
            Ok(vec![valid_cluster()])
        };
        assert_eq!(provider.unmarshal().unwrap(), vec![valid_cluster()]);
    }
}
