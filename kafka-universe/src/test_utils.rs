//! In-memory broker doubles shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::BrokerError;
use crate::kafka::{
    BrokerConnector, ClaimHandler, ClaimRoutes, ClusterSettings, ConsumerGroup, ConsumerRecord,
    GroupOverrides, GroupSession, Partition, PartitionClaim, ProducerRecord, SyncProducer,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings of a plaintext cluster without authentication.
pub fn test_settings(cluster_id: &str) -> ClusterSettings {
    ClusterSettings {
        cluster_id: cluster_id.to_string(),
        brokers: vec!["localhost:9092".to_string()],
        version: "2.8.0".to_string(),
        tls_enabled: false,
        keep_alive: None,
        max_open_requests: None,
        client_log_enabled: false,
        client_id: None,
        token_provider: None,
    }
}

/// Session recording every marked offset with its note.
#[derive(Default)]
pub struct RecordingSession {
    marked: Mutex<Vec<(i64, String)>>,
}

impl RecordingSession {
    pub fn marked(&self) -> Vec<(i64, String)> {
        lock(&self.marked).clone()
    }

    pub fn marked_offsets(&self) -> Vec<i64> {
        lock(&self.marked).iter().map(|(offset, _)| *offset).collect()
    }
}

impl GroupSession for RecordingSession {
    fn mark_message(&self, record: &ConsumerRecord, note: &str) {
        lock(&self.marked).push((record.offset(), note.to_string()));
    }
}

struct Generation {
    records: Vec<ConsumerRecord>,
    error: Option<BrokerError>,
}

/// Consumer group replaying scripted generations.
///
/// Members register their handler for their topics like on a real group, and
/// one member at a time plays the next scripted generation: its records are
/// split into one claim per partition, each handed to the handler of its
/// topic, and its error, if any, is queued on the error channel once the
/// claims are over. A generation only plays once every topic it carries has a
/// handler. Until then `consume` waits, like a group waiting for its next
/// rebalance, and returns `Closed` if the group gets closed meanwhile.
pub struct MockConsumerGroup {
    name: String,
    overrides: Mutex<GroupOverrides>,
    routes: ClaimRoutes,
    driver: tokio::sync::Mutex<()>,
    changes: watch::Sender<u64>,
    generations: Mutex<VecDeque<Generation>>,
    errors: Mutex<VecDeque<BrokerError>>,
    session: Arc<RecordingSession>,
    claim_results: Mutex<Vec<Result<(), String>>>,
    completed: watch::Sender<usize>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_close: AtomicBool,
}

impl MockConsumerGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            overrides: Mutex::new(GroupOverrides::default()),
            routes: ClaimRoutes::default(),
            driver: tokio::sync::Mutex::new(()),
            changes: watch::channel(0).0,
            generations: Mutex::new(VecDeque::new()),
            errors: Mutex::new(VecDeque::new()),
            session: Arc::new(RecordingSession::default()),
            claim_results: Mutex::new(Vec::new()),
            completed: watch::channel(0).0,
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        }
    }

    pub fn push_generation(&self, records: Vec<ConsumerRecord>) {
        lock(&self.generations).push_back(Generation {
            records,
            error: None,
        });
        self.changed();
    }

    pub fn push_failing_generation(&self, records: Vec<ConsumerRecord>, error: BrokerError) {
        lock(&self.generations).push_back(Generation {
            records,
            error: Some(error),
        });
        self.changed();
    }

    /// Topics members registered a handler for, sorted.
    pub fn routed_topics(&self) -> Vec<String> {
        self.routes.topics()
    }

    pub fn overrides(&self) -> GroupOverrides {
        *lock(&self.overrides)
    }

    pub fn session(&self) -> Arc<RecordingSession> {
        self.session.clone()
    }

    /// Outcome of every claim played so far, errors rendered with their chain.
    pub fn claim_results(&self) -> Vec<Result<(), String>> {
        lock(&self.claim_results).clone()
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Waits until `count` generations have been fully played.
    pub async fn wait_for_generations(&self, count: usize) {
        let mut completed = self.completed.subscribe();
        // the sender lives as long as self
        let reached = completed.wait_for(|done| *done >= count).await.is_ok();
        assert!(reached, "generation counter of {} dropped", self.name);
    }

    fn changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Pops the next generation when all of its topics are routed.
    fn next_playable(&self) -> Option<Generation> {
        let mut generations = lock(&self.generations);
        let playable = generations.front()?.records.iter().all(|record| {
            self.routes.handler(record.topic()).is_some()
        });
        if playable {
            generations.pop_front()
        } else {
            None
        }
    }

    fn claims(records: Vec<ConsumerRecord>) -> Vec<PartitionClaim> {
        let mut partitions: Vec<(Partition, Vec<ConsumerRecord>)> = Vec::new();
        for record in records {
            let partition = record.as_partition();
            match partitions.iter_mut().find(|(p, _)| *p == partition) {
                Some((_, records)) => records.push(record),
                None => partitions.push((partition, vec![record])),
            }
        }
        partitions
            .into_iter()
            .map(|(partition, records)| PartitionClaim::from_records(partition, records))
            .collect()
    }
}

#[async_trait]
impl ConsumerGroup for MockConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
    ) -> Result<(), BrokerError> {
        let mut changes = self.changes.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(self.name.clone()));
        }
        if self.routes.register(&self.name, topics, &handler)? {
            self.changed();
        }

        let _driver = self.driver.lock().await;
        let generation = loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed(self.name.clone()));
            }
            if let Some(generation) = self.next_playable() {
                break generation;
            }
            // the sender lives as long as self
            if changes.changed().await.is_err() {
                return Err(BrokerError::Closed(self.name.clone()));
            }
        };

        for claim in Self::claims(generation.records) {
            let Some(handler) = self.routes.handler(claim.topic()) else {
                continue;
            };
            let result = handler.consume_claim(self.session.clone(), claim).await;
            lock(&self.claim_results).push(result.map_err(|e| format!("{e:#}")));
        }
        if let Some(error) = generation.error {
            lock(&self.errors).push_back(error);
        }
        self.completed.send_modify(|done| *done += 1);
        Ok(())
    }

    fn next_error(&self) -> Option<BrokerError> {
        lock(&self.errors).pop_front()
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.changed();
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(format!("failed to close {}", self.name)));
        }
        Ok(())
    }
}

/// Producer appending what it sends to its connector's log.
pub struct MockProducer {
    sent: Arc<Mutex<Vec<ProducerRecord>>>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl SyncProducer for MockProducer {
    async fn send(&self, record: ProducerRecord) -> Result<(), BrokerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(format!(
                "failed to deliver to {}",
                record.topic
            )));
        }
        lock(&self.sent).push(record);
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Connector handing out mock groups and producers, counting connections.
#[derive(Default)]
pub struct MockConnector {
    fail_connections: AtomicBool,
    fail_sends: Arc<AtomicBool>,
    group_connections: AtomicUsize,
    producer_connections: AtomicUsize,
    groups: Mutex<HashMap<String, Arc<MockConsumerGroup>>>,
    sent: Arc<Mutex<Vec<ProducerRecord>>>,
}

impl MockConnector {
    pub fn fail_connections(&self, fail: bool) {
        self.fail_connections.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn consumer_group_connections(&self) -> usize {
        self.group_connections.load(Ordering::SeqCst)
    }

    pub fn producer_connections(&self) -> usize {
        self.producer_connections.load(Ordering::SeqCst)
    }

    /// Group returned when `name` gets connected, created ahead so tests can
    /// script it.
    pub fn prepare_group(&self, name: &str) -> Arc<MockConsumerGroup> {
        lock(&self.groups)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MockConsumerGroup::new(name)))
            .clone()
    }

    pub fn group(&self, name: &str) -> Option<Arc<MockConsumerGroup>> {
        lock(&self.groups).get(name).cloned()
    }

    /// Everything sent by every producer of this connector, in order.
    pub fn sent_records(&self) -> Vec<ProducerRecord> {
        lock(&self.sent).clone()
    }

    fn refuse(&self) -> Result<(), BrokerError> {
        if self.fail_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

impl BrokerConnector for MockConnector {
    fn connect_consumer_group(
        &self,
        _settings: &ClusterSettings,
        group_name: &str,
        overrides: &GroupOverrides,
    ) -> Result<Arc<dyn ConsumerGroup>, BrokerError> {
        self.refuse()?;
        self.group_connections.fetch_add(1, Ordering::SeqCst);
        let group = self.prepare_group(group_name);
        *lock(&group.overrides) = *overrides;
        Ok(group)
    }

    fn connect_producer(
        &self,
        _settings: &ClusterSettings,
    ) -> Result<Arc<dyn SyncProducer>, BrokerError> {
        self.refuse()?;
        self.producer_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockProducer {
            sent: self.sent.clone(),
            fail_sends: self.fail_sends.clone(),
        }))
    }
}
