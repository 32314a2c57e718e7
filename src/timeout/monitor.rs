//! Background scan for expired node executions

use crate::execution::OrchestrationEngine;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Periodically asks the engine to expire overdue nodes
pub struct TimeoutMonitor {
    engine: OrchestrationEngine,
    tick: Duration,
}

impl TimeoutMonitor {
    pub fn new(engine: OrchestrationEngine, tick: Duration) -> Self {
        Self { engine, tick }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.engine.check_timeouts().await {
                    Ok(0) => {}
                    Ok(expired) => debug!("Timeout scan expired {} node executions", expired),
                    Err(e) => warn!("Timeout scan failed: {}", e),
                }
            }
        })
    }
}
