//! Ambient monitor - periodic background dispatch
//!
//! Runs one canned task on a fixed interval. Results are written to memory
//! (kind `DailyOp`) rather than returned; ticks are serialized with
//! themselves but interleave freely with foreground requests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::{Dispatcher, NoClarifier, TaskContext, TaskStatus};
use crate::memory::{MemoryItem, MemoryKind};

pub struct AmbientMonitor {
    dispatcher: Arc<Dispatcher>,
    task: String,
    interval: Duration,
}

/// Running monitor; dropping it does NOT stop the loop, call [`stop`].
///
/// [`stop`]: AmbientHandle::stop
pub struct AmbientHandle {
    token: CancellationToken,
    join: JoinHandle<u64>,
}

impl AmbientHandle {
    /// Cancel the loop and wait for it; returns the number of completed ticks.
    pub async fn stop(self) -> u64 {
        self.token.cancel();
        self.join.await.unwrap_or(0)
    }
}

impl AmbientMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, task: impl Into<String>, interval: Duration) -> Self {
        Self {
            dispatcher,
            task: task.into(),
            interval,
        }
    }

    /// Start the background loop. The first tick fires after one full
    /// interval, not immediately.
    pub fn spawn(self) -> AmbientHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();

        let join = tokio::spawn(async move {
            let mut ticks = 0u64;
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // immediate first tick consumed

            info!(task = %self.task, interval_ms = self.interval.as_millis() as u64, "ambient monitor started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = loop_token.cancelled() => break,
                }

                let request = TaskContext::new(self.task.clone(), crate::dispatch::Source::Ambient);
                let result = self
                    .dispatcher
                    .dispatch_with(request, &NoClarifier, loop_token.child_token())
                    .await;

                debug!(status = ?result.status, "ambient tick complete");
                self.dispatcher.memory().add(
                    MemoryItem::new(
                        MemoryKind::DailyOp,
                        format!("[ambient] {}: {}", self.task, result.summary),
                    )
                    .with_tags(["ambient"])
                    .with_metadata(
                        "ok",
                        json!(result.status == TaskStatus::Ok),
                    ),
                );
                ticks += 1;
            }

            ticks
        });

        AmbientHandle { token, join }
    }
}
