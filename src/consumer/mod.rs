//! Resume event consumer - the message-driven reentry point of the engine
//!
//! Messages are partitioned by key: everything about one node execution lands on
//! the same partition and is handled strictly in arrival order by that partition's
//! single worker. Different partitions run fully in parallel. Producers never block;
//! backpressure comes from the bounded number of workers.

pub mod messages;

use crate::execution::OrchestrationEngine;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use messages::{EngineMessage, MessageKind};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Consumer partition {0} is closed")]
    Closed(usize),
}

/// Cheap, cloneable handle for publishing engine messages
#[derive(Debug, Clone)]
pub struct Publisher {
    senders: Vec<UnboundedSender<EngineMessage>>,
}

impl Publisher {
    /// Partition a message is routed to
    pub fn partition_for(&self, message: &EngineMessage) -> usize {
        (message.partition_key().as_u128() % self.senders.len() as u128) as usize
    }

    pub fn publish(&self, message: EngineMessage) -> Result<(), ConsumerError> {
        let partition = self.partition_for(&message);
        debug!("Publishing {:?} message to partition {}", message.kind(), partition);
        self.senders[partition]
            .send(message)
            .map_err(|_| ConsumerError::Closed(partition))
    }

    pub fn partitions(&self) -> usize {
        self.senders.len()
    }
}

/// Partitioned consumer, not yet attached to an engine
pub struct ResumeEventConsumer {
    receivers: Vec<UnboundedReceiver<EngineMessage>>,
}

/// Create a publisher and the consumer draining it
pub fn channel(partitions: usize) -> (Publisher, ResumeEventConsumer) {
    let partitions = partitions.max(1);
    let (senders, receivers) = (0..partitions).map(|_| mpsc::unbounded_channel()).unzip();
    (Publisher { senders }, ResumeEventConsumer { receivers })
}

impl ResumeEventConsumer {
    #[cfg(test)]
    pub(crate) fn receiver(&mut self, partition: usize) -> &mut UnboundedReceiver<EngineMessage> {
        &mut self.receivers[partition]
    }

    /// Spawn one worker per partition
    pub fn start(self, engine: OrchestrationEngine) -> ConsumerHandle {
        info!("Starting resume event consumer with {} partitions", self.receivers.len());

        let workers = self
            .receivers
            .into_iter()
            .enumerate()
            .map(|(partition, mut rx)| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        let kind = message.kind();
                        let engine = engine.clone();
                        // A panicking step must not take the partition down with it
                        let handled = tokio::spawn(async move { engine.handle_message(message).await }).await;
                        if let Err(e) = handled {
                            error!("Partition {} worker panicked while handling {:?}: {}", partition, kind, e);
                        }
                    }
                    debug!("Partition {} drained", partition);
                })
            })
            .collect();

        ConsumerHandle { workers }
    }
}

/// Handle to the running partition workers
pub struct ConsumerHandle {
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Stop all workers immediately
    pub fn shutdown(self) {
        for worker in self.workers {
            worker.abort();
        }
    }
}
