/// Records that went through a consumer's claim loop, labelled by `consumer` and `outcome`
/// (`handled`, `handler_error`, `mapper_error`)
pub const RECORDS_PROCESSED: &str = "kafka_universe_records_processed_total";

/// Mapper pipeline failures, labelled by `consumer`
pub const MAPPER_FAILURES: &str = "kafka_universe_mapper_failures_total";

/// Records redirected to a failure topic after a mapper failure
pub const FAILURE_TOPIC_SENDS: &str = "kafka_universe_failure_topic_sends_total";

/// Records that failed mapping and could not reach the failure topic either.
/// They are still committed when auto-commit is on, so this is data loss.
pub const FAILURE_TOPIC_DROPS: &str = "kafka_universe_failure_topic_drops_total";

/// Partition claims terminated by a handler requesting an abort
pub const CLAIMS_ABORTED: &str = "kafka_universe_claims_aborted_total";

/// Partitions paused because their claim buffer was full, labelled by `topic` and `partition`
pub const CLAIM_BACKPRESSURE: &str = "kafka_universe_claim_backpressure_total";

/// Consumers stopped by a broker error reported after a generation
pub const FATAL_CONSUMER_ERRORS: &str = "kafka_universe_fatal_consumer_errors_total";
