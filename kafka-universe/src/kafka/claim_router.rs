//! Claim Router - Routes records to per-partition claim tasks
//!
//! Every member consuming through one consumer group registers its claim
//! handler for its topics in [`ClaimRoutes`]. During a generation a
//! [`ClaimRouter`] hands each record to the claim task of its partition,
//! spawned on first use with the handler of the record's topic.
//!
//! Routing never waits on a claim. When a claim's buffer is full the record is
//! kept in a per-partition backlog and the partition is reported so the caller
//! can pause it at the broker; once the backlog drains the partition is
//! reported for resuming.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::types::{ConsumerRecord, Partition, PartitionClaim};
use crate::kafka::{ClaimHandler, GroupSession};
use crate::metrics_consts::CLAIM_BACKPRESSURE;

/// Claim handlers of the members of one consumer group, by topic.
#[derive(Default)]
pub struct ClaimRoutes {
    handlers: Mutex<HashMap<String, Arc<dyn ClaimHandler>>>,
}

impl ClaimRoutes {
    /// Routes `topics` to `handler`. Registering the same handler again is a
    /// no-op; a topic already routed to another handler is refused.
    ///
    /// Returns whether the set of routed topics changed.
    pub fn register(
        &self,
        group: &str,
        topics: &[String],
        handler: &Arc<dyn ClaimHandler>,
    ) -> Result<bool, BrokerError> {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());

        for topic in topics {
            if let Some(existing) = handlers.get(topic) {
                if !Arc::ptr_eq(existing, handler) {
                    return Err(BrokerError::TopicTaken {
                        group: group.to_string(),
                        topic: topic.clone(),
                    });
                }
            }
        }

        let mut changed = false;
        for topic in topics {
            if !handlers.contains_key(topic) {
                handlers.insert(topic.clone(), handler.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn handler(&self, topic: &str) -> Option<Arc<dyn ClaimHandler>> {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(topic).cloned()
    }

    /// Every routed topic, sorted.
    pub fn topics(&self) -> Vec<String> {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let mut topics = handlers.keys().cloned().collect::<Vec<_>>();
        topics.sort_unstable();
        topics
    }
}

/// Claim tasks of one generation.
pub struct ClaimRouter {
    group: String,
    capacity: usize,
    routes: Arc<ClaimRoutes>,
    session: Arc<dyn GroupSession>,
    claims: HashMap<Partition, mpsc::Sender<ConsumerRecord>>,
    backlog: HashMap<Partition, VecDeque<ConsumerRecord>>,
    // partitions whose claim failed, skipped until the generation ends
    stopped: HashSet<Partition>,
    paused: HashSet<Partition>,
    tasks: JoinSet<(Partition, anyhow::Result<()>)>,
}

impl ClaimRouter {
    pub fn new(
        group: &str,
        capacity: usize,
        routes: Arc<ClaimRoutes>,
        session: Arc<dyn GroupSession>,
    ) -> Self {
        Self {
            group: group.to_string(),
            capacity: capacity.max(1),
            routes,
            session,
            claims: HashMap::new(),
            backlog: HashMap::new(),
            stopped: HashSet::new(),
            paused: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn has_claims(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Hands `record` to the claim of its partition without waiting.
    ///
    /// Returns the partition when it has to be paused: its claim buffer just
    /// filled up and the record went to the backlog.
    pub fn route(&mut self, record: ConsumerRecord) -> Option<Partition> {
        let partition = record.as_partition();
        if self.stopped.contains(&partition) {
            return None;
        }
        if let Some(pending) = self.backlog.get_mut(&partition) {
            pending.push_back(record);
            return None;
        }

        if !self.claims.contains_key(&partition) {
            let Some(handler) = self.routes.handler(partition.topic()) else {
                warn!(group = %self.group, topic = partition.topic(), "No handler for topic, record skipped");
                return None;
            };
            self.spawn_claim(partition.clone(), handler);
        }
        let sender = self.claims.get(&partition)?;

        match sender.try_send(record) {
            Ok(()) => None,
            Err(TrySendError::Full(record)) => {
                debug!(
                    group = %self.group,
                    "Claim buffer full for {}:{}, pausing partition",
                    partition.topic(),
                    partition.partition_number()
                );
                metrics::counter!(
                    CLAIM_BACKPRESSURE,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
                self.backlog
                    .insert(partition.clone(), VecDeque::from([record]));
                self.paused.insert(partition.clone());
                Some(partition)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    group = %self.group,
                    "Claim for {}:{} already ended",
                    partition.topic(),
                    partition.partition_number()
                );
                None
            }
        }
    }

    /// Moves backlogged records into claims that made room. Returns the
    /// partitions whose backlog is empty again and can be resumed.
    pub fn drain_backlog(&mut self) -> Vec<Partition> {
        let mut drained = Vec::new();

        for (partition, pending) in self.backlog.iter_mut() {
            let Some(sender) = self.claims.get(partition) else {
                pending.clear();
                drained.push(partition.clone());
                continue;
            };
            while let Some(record) = pending.pop_front() {
                match sender.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(record)) => {
                        pending.push_front(record);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        pending.clear();
                        break;
                    }
                }
            }
            if pending.is_empty() {
                drained.push(partition.clone());
            }
        }

        for partition in &drained {
            self.backlog.remove(partition);
            self.paused.remove(partition);
        }
        drained
    }

    /// Waits for the next claim to end. Returns its partition when the claim
    /// failed and the partition has to be paused until the generation is over.
    ///
    /// Only call when [`ClaimRouter::has_claims`] is true.
    pub async fn next_finished(&mut self) -> Option<Partition> {
        match self.tasks.join_next().await? {
            Ok((partition, Ok(()))) => {
                self.claims.remove(&partition);
                None
            }
            Ok((partition, Err(e))) => {
                warn!(
                    group = %self.group,
                    "Claim for {}:{} stopped: {e:#}",
                    partition.topic(),
                    partition.partition_number()
                );
                self.claims.remove(&partition);
                self.backlog.remove(&partition);
                self.stopped.insert(partition.clone());
                self.paused.insert(partition.clone());
                Some(partition)
            }
            Err(e) => {
                error!(group = %self.group, "Claim task failed: {}", e);
                None
            }
        }
    }

    /// Ends every claim once its buffered records are processed. Backlogged
    /// records are dropped uncommitted. Returns the partitions left paused.
    pub async fn finish(mut self) -> Vec<Partition> {
        // closing the senders ends every claim stream
        self.claims.clear();
        self.backlog.clear();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((partition, Err(e))) => warn!(
                    group = %self.group,
                    "Claim for {}:{} stopped: {e:#}",
                    partition.topic(),
                    partition.partition_number()
                ),
                Ok((_, Ok(()))) => {}
                Err(e) => error!(group = %self.group, "Claim task failed: {}", e),
            }
        }
        self.paused.into_iter().collect()
    }

    fn spawn_claim(&mut self, partition: Partition, handler: Arc<dyn ClaimHandler>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let claim = PartitionClaim::new(partition.clone(), rx);
        let session = self.session.clone();

        info!(
            group = %self.group,
            "Starting claim for {}:{}",
            partition.topic(),
            partition.partition_number()
        );
        let task_partition = partition.clone();
        self.tasks.spawn(async move {
            let result = handler.consume_claim(session, claim).await;
            (task_partition, result)
        });
        self.claims.insert(partition, tx);
    }
}
