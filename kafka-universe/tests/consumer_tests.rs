mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use chrono::Utc;
use common::{build, cluster, consumer, producer, Received, RecordingHandler, WAIT};
use kafka_universe::error::BrokerError;
use kafka_universe::kafka::ConsumerRecord;
use kafka_universe::mappers::Base64Decode;
use kafka_universe::test_utils::{MockConnector, MockConsumerGroup};
use kafka_universe::{Content, MessageContext, Universe};
use tokio::time::{timeout, Instant};

const TOPIC: &str = "events";
const GROUP: &str = "events-group";

fn record(partition: i32, offset: i64, payload: &str) -> ConsumerRecord {
    ConsumerRecord::new(TOPIC, partition, offset, payload.as_bytes().to_vec())
}

/// Universe with one `events` consumer, redirecting to the `failures` producer.
fn universe_with_failure_topic(connector: &Arc<MockConnector>) -> (Universe, Arc<MockConsumerGroup>) {
    let universe = build(
        connector,
        vec![cluster(
            "main",
            vec![producer("failures", "events-failure")],
            vec![consumer("events", TOPIC, GROUP, Some("failures"))],
        )],
    )
    .unwrap();
    let group = connector.prepare_group(GROUP);
    (universe, group)
}

async fn run_one_generation(universe: &mut Universe, group: &MockConsumerGroup) {
    universe.initialize_producers(&["failures"]).unwrap();
    universe.initialize_consumers(&["events"]).unwrap();
    let handles = universe.start_consumers(&["events"]).unwrap();
    assert_eq!(handles.len(), 1);
    timeout(WAIT, group.wait_for_generations(1)).await.unwrap();
}

fn downcast<T: 'static>(content: Content) -> anyhow::Result<T> {
    content
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| anyhow!("unexpected content type"))
}

#[tokio::test]
async fn test_mapper_failure_goes_to_failure_topic_only() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![record(0, 0, "good"), record(0, 1, "bad"), record(0, 2, "fine")]);

    let third_stage_calls = Arc::new(AtomicUsize::new(0));
    let calls = third_stage_calls.clone();
    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone())
        .add_content_mapper(
            |_: &MessageContext, _: i64, content: Content| -> anyhow::Result<Content> {
                let bytes = downcast::<Vec<u8>>(content)?;
                Ok(Box::new(String::from_utf8(bytes)?))
            },
        )
        .add_content_mapper(
            |_: &MessageContext, offset: i64, content: Content| -> anyhow::Result<Content> {
                let text = downcast::<String>(content)?;
                if text == "bad" {
                    bail!("cannot map record {offset}");
                }
                Ok(Box::new(text.to_uppercase()))
            },
        )
        .add_content_mapper(
            move |_: &MessageContext, _: i64, content: Content| -> anyhow::Result<Content> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(content)
            },
        );

    run_one_generation(&mut universe, &group).await;

    assert_eq!(handler.received_offsets(), vec![0, 2]);
    assert_eq!(handler.received()[1].content, "FINE");
    assert_eq!(third_stage_calls.load(Ordering::SeqCst), 2);

    let sent = connector.sent_records();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "events-failure");
    assert_eq!(sent[0].payload, b"bad".to_vec());
    assert_eq!(sent[0].key, None);

    // auto-commit marks every record, mapped or not
    assert_eq!(group.session().marked_offsets(), vec![0, 1, 2]);
    assert_eq!(group.claim_results(), vec![Ok(())]);
}

#[tokio::test]
async fn test_handler_error_without_abort_keeps_consuming() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![record(0, 10, "a"), record(0, 11, "b")]);

    let handler = RecordingHandler::failing_on(&[10]);
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone());

    run_one_generation(&mut universe, &group).await;

    assert_eq!(handler.received_offsets(), vec![10, 11]);
    assert_eq!(group.session().marked_offsets(), vec![10, 11]);
    assert_eq!(group.claim_results(), vec![Ok(())]);
    // handler failures are not redirected
    assert!(connector.sent_records().is_empty());
}

#[tokio::test]
async fn test_abort_ends_the_claim_with_the_handler_error() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![
        record(0, 0, "a"),
        record(0, 1, "b"),
        record(0, 2, "c"),
        record(1, 0, "other partition"),
    ]);

    let handler = RecordingHandler::aborting_on(&[1]);
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone());

    run_one_generation(&mut universe, &group).await;

    assert_eq!(
        handler.received(),
        vec![
            Received {
                partition: 0,
                offset: 0,
                content: "a".to_string()
            },
            Received {
                partition: 0,
                offset: 1,
                content: "b".to_string()
            },
            Received {
                partition: 1,
                offset: 0,
                content: "other partition".to_string()
            },
        ]
    );
    assert_eq!(
        group.claim_results(),
        vec![Err("abort requested at 1".to_string()), Ok(())]
    );
    // the aborted record is not committed
    assert_eq!(group.session().marked(), vec![(0, String::new()), (0, String::new())]);
}

#[tokio::test]
async fn test_auto_commit_disabled_leaves_commits_to_the_handler() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![record(0, 0, "a"), record(0, 1, "b")]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone())
        .set_auto_commit(false);

    run_one_generation(&mut universe, &group).await;

    assert_eq!(handler.received_offsets(), vec![0, 1]);
    assert!(group.session().marked().is_empty());
}

#[tokio::test]
async fn test_base64_mapper_end_to_end() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![
        record(0, 0, "VGVzdCBvZiB0aGUgZnVuY3Rpb24="),
        record(0, 1, "ey"),
    ]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone())
        .add_content_mapper(Base64Decode);

    run_one_generation(&mut universe, &group).await;

    assert_eq!(
        handler.received(),
        vec![Received {
            partition: 0,
            offset: 0,
            content: "Test of the function".to_string()
        }]
    );
    let sent = connector.sent_records();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, b"ey".to_vec());
}

#[tokio::test]
async fn test_failed_failure_topic_send_is_not_fatal() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![record(0, 0, "ey"), record(0, 1, "aGk=")]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone())
        .add_content_mapper(Base64Decode);
    connector.fail_sends(true);

    run_one_generation(&mut universe, &group).await;

    assert!(connector.sent_records().is_empty());
    assert_eq!(handler.received_offsets(), vec![1]);
    assert_eq!(group.session().marked_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn test_uninitialized_failure_producer_does_not_stop_consumption() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_generation(vec![record(0, 0, "ey"), record(0, 1, "aGk=")]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone())
        .add_content_mapper(Base64Decode);

    // the failure producer is never initialized
    universe.initialize_consumers(&["events"]).unwrap();
    universe.start_consumers(&["events"]).unwrap();
    timeout(WAIT, group.wait_for_generations(1)).await.unwrap();

    assert_eq!(connector.producer_connections(), 0);
    assert_eq!(handler.received()[0].content, "hi");
    assert_eq!(group.session().marked_offsets(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_consumption_delay_holds_recent_records() {
    let connector = Arc::new(MockConnector::default());
    let mut definition = consumer("events", TOPIC, GROUP, None);
    definition.consumption_delay_ms = Some(5_000);
    let mut universe = build(&connector, vec![cluster("main", vec![], vec![definition])]).unwrap();
    let group = connector.prepare_group(GROUP);

    group.push_generation(vec![record(0, 0, "old").with_timestamp(Utc::now() - chrono::Duration::seconds(60))]);
    group.push_generation(vec![record(0, 1, "recent").with_timestamp(Utc::now())]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone());
    universe.initialize_consumers(&["events"]).unwrap();

    let start = Instant::now();
    universe.start_consumers(&["events"]).unwrap();
    timeout(WAIT, group.wait_for_generations(1)).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    timeout(WAIT, group.wait_for_generations(2)).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(4_900));
    assert_eq!(handler.received_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn test_broker_error_is_reported_as_fatal() {
    let connector = Arc::new(MockConnector::default());
    let (mut universe, group) = universe_with_failure_topic(&connector);
    group.push_failing_generation(
        vec![record(0, 0, "a")],
        BrokerError::Transport("broker went away".to_string()),
    );
    group.push_generation(vec![record(0, 1, "never consumed")]);

    let handler = RecordingHandler::default();
    universe
        .consumer_mut("events")
        .unwrap()
        .set_handler(handler.clone());
    let mut fatal_errors = universe.fatal_errors().unwrap();
    assert!(universe.fatal_errors().is_none());

    universe.initialize_consumers(&["events"]).unwrap();
    let handles = universe.start_consumers(&["events"]).unwrap();

    let fatal = timeout(WAIT, fatal_errors.recv()).await.unwrap().unwrap();
    assert_eq!(fatal.consumer, "events");
    assert_eq!(fatal.topic, TOPIC);
    assert!(matches!(fatal.source, BrokerError::Transport(ref reason) if reason == "broker went away"));

    for handle in handles {
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
    assert_eq!(handler.received_offsets(), vec![0]);
}

#[tokio::test]
async fn test_consumers_sharing_a_group_name_share_the_connection() {
    let connector = Arc::new(MockConnector::default());
    let mut universe = build(
        &connector,
        vec![cluster(
            "main",
            vec![],
            vec![
                consumer("first", TOPIC, GROUP, None),
                consumer("second", "other-topic", GROUP, None),
                consumer("third", TOPIC, "another-group", None),
            ],
        )],
    )
    .unwrap();

    let handlers = [
        ("first", RecordingHandler::default()),
        ("second", RecordingHandler::default()),
        ("third", RecordingHandler::default()),
    ];
    for (id, handler) in &handlers {
        universe.consumer_mut(id).unwrap().set_handler(handler.clone());
    }
    universe
        .initialize_consumers(&["first", "second", "third"])
        .unwrap();
    assert_eq!(connector.consumer_group_connections(), 2);

    let shared = connector.group(GROUP).unwrap();
    shared.push_generation(vec![
        record(0, 0, "events-0"),
        ConsumerRecord::new("other-topic", 0, 7, b"other-7".to_vec()),
        record(1, 1, "events-1"),
    ]);
    let handles = universe.start_consumers(&["first", "second"]).unwrap();
    assert_eq!(handles.len(), 2);
    timeout(WAIT, shared.wait_for_generations(1)).await.unwrap();

    assert_eq!(
        shared.routed_topics(),
        vec![TOPIC.to_string(), "other-topic".to_string()]
    );
    // each consumer only sees the records of its own topic
    let [(_, first), (_, second), (_, third)] = &handlers;
    assert_eq!(
        first.received(),
        vec![
            Received {
                partition: 0,
                offset: 0,
                content: "events-0".to_string(),
            },
            Received {
                partition: 1,
                offset: 1,
                content: "events-1".to_string(),
            },
        ]
    );
    assert_eq!(second.received_offsets(), vec![7]);
    assert!(third.received().is_empty());
    assert_eq!(shared.session().marked_offsets(), vec![0, 7, 1]);
}

#[tokio::test]
async fn test_two_consumers_of_one_topic_in_one_group_is_fatal() {
    let connector = Arc::new(MockConnector::default());
    let mut universe = build(
        &connector,
        vec![cluster(
            "main",
            vec![],
            vec![
                consumer("first", TOPIC, GROUP, None),
                consumer("second", TOPIC, GROUP, None),
            ],
        )],
    )
    .unwrap();
    let mut fatal_errors = universe.fatal_errors().unwrap();

    universe.initialize_consumers(&["first", "second"]).unwrap();
    universe.start_consumers(&["first", "second"]).unwrap();

    let fatal = timeout(WAIT, fatal_errors.recv()).await.unwrap().unwrap();
    assert!(["first", "second"].contains(&fatal.consumer.as_str()));
    assert!(matches!(
        fatal.source,
        BrokerError::TopicTaken { ref group, ref topic } if group == GROUP && topic == TOPIC
    ));
    assert_eq!(connector.group(GROUP).unwrap().routed_topics(), vec![TOPIC.to_string()]);
}
