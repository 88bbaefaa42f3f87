use std::process::ExitCode;

use anyhow::{Context, Result};
use async_trait::async_trait;
use envconfig::Envconfig;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_universe::{
    config::Config, mappers::Base64Decode, ConsumedMessage, JsonConfiguration, MessageContext,
    MessageHandler, Universe,
};

fn setup_tracing(json: bool) {
    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

/// Logs what it receives; useful to inspect a topic.
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, _context: &MessageContext, message: &ConsumedMessage) -> Result<()> {
        let length = message
            .content_as::<Vec<u8>>()
            .map_or(message.raw_payload().len(), Vec::len);
        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            length,
            "Received message"
        );
        Ok(())
    }
}

fn select<'a>(requested: Vec<&'a str>, all: Vec<&'a str>) -> Vec<&'a str> {
    if requested.is_empty() {
        all
    } else {
        requested
    }
}

async fn run(config: &Config) -> Result<bool> {
    let mut universe = Universe::builder()
        .secret_env_prefix(&config.secret_env_prefix)
        .from_provider(&JsonConfiguration::from_path(&config.universe_config_path))
        .with_context(|| format!("Failed to build Kafka universe from {}", config.universe_config_path))?;

    let producer_ids = select(config.producer_ids(), universe.producer_ids())
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let consumer_ids = select(config.consumer_ids(), universe.consumer_ids())
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let producer_ids = producer_ids.iter().map(String::as_str).collect::<Vec<_>>();
    let consumer_ids = consumer_ids.iter().map(String::as_str).collect::<Vec<_>>();

    for id in &consumer_ids {
        if let Some(consumer) = universe.consumer_mut(id) {
            consumer.set_handler(LoggingHandler);
            if config.decode_base64 {
                consumer.add_content_mapper(Base64Decode);
            }
        }
    }

    universe
        .initialize_producers(&producer_ids)
        .context("Failed to initialize producers")?;
    universe
        .initialize_consumers(&consumer_ids)
        .context("Failed to initialize consumers")?;
    let mut fatal_errors = universe
        .fatal_errors()
        .context("Fatal error channel already taken")?;
    let handles = universe.start_consumers(&consumer_ids)?;
    info!(consumers = handles.len(), "Kafka universe started");

    let failed = tokio::select! {
        fatal = fatal_errors.recv() => {
            if let Some(fatal) = fatal {
                error!(error = ?fatal, "Consumer stopped, shutting down");
            }
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
    };

    for handle in handles {
        handle.abort();
    }
    if let Err(e) = universe.close() {
        warn!(error = ?e, "Failed to close Kafka universe cleanly");
    }
    Ok(failed)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    setup_tracing(config.log_json);
    info!("Configuration loaded: {:?}", config);

    let failed = run(&config).await?;
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
