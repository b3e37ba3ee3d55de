//! Worker lease loop.
//!
//! Leases batches of jobs, runs each through a `JobProcessor` under a
//! bounded concurrency semaphore, and backs off when the queue is idle.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use floe_store::{CredentialResolver, EventLog, WorkQueue};
use floe_tools::ToolRegistry;

use crate::config::WorkerConfig;
use crate::executor::JobProcessor;

/// Worker runtime: lease, dispatch, repeat.
pub struct WorkerRuntime {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<JobProcessor>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    /// Create a runtime over the store contracts and an executor registry.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventLog>,
        credentials: Arc<dyn CredentialResolver>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let processor = Arc::new(JobProcessor::new(
            config.clone(),
            queue.clone(),
            events,
            credentials,
            registry,
        ));

        Self {
            config,
            queue,
            processor,
            semaphore,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown. In-flight jobs finish; new leases stop.
    pub async fn run(&self) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            pool = %self.config.pool_name,
            max_concurrent = self.config.max_concurrent,
            "Worker loop started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Lease at most as many jobs as there are free slots.
            let free = self.semaphore.available_permits();
            if free == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }
            let batch = (free as i64).min(self.config.batch_size);

            let jobs = match self
                .queue
                .lease(&self.config.worker_id, batch, self.config.visibility)
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    tracing::warn!(error = %err, "Lease poll failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            for job in jobs {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let processor = self.processor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let queue_id = job.queue_id;
                    let outcome = processor.process(job).await;
                    tracing::debug!(queue_id, ?outcome, "Job finished");
                });
            }
        }

        // Drain: wait for in-flight jobs by taking every permit.
        let _ = self
            .semaphore
            .acquire_many(self.config.max_concurrent as u32)
            .await;
        tracing::info!(worker_id = %self.config.worker_id, "Worker loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use floe_core::event::EventType;
    use floe_core::job::{JobDraft, TaskSpec, ToolCall};
    use floe_core::playbook::types::ToolKind;
    use floe_store::{BrokerState, MemoryStore};
    use floe_tools::create_default_registry;

    #[tokio::test]
    async fn test_runtime_processes_queued_jobs() {
        let store = Arc::new(MemoryStore::new());
        store.register_execution(1, None, None).await.unwrap();

        for node in ["a", "b", "c"] {
            let task = TaskSpec::new(ToolCall {
                kind: ToolKind::Noop,
                args: serde_json::json!({"node": node}),
            });
            store.enqueue(JobDraft::new(1, node, &task)).await.unwrap();
        }

        let mut config = WorkerConfig::default();
        config.poll_interval = Duration::from_millis(10);
        let runtime = WorkerRuntime::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(create_default_registry()),
        );

        let shutdown = runtime.shutdown_token();
        let handle = tokio::spawn(async move { runtime.run().await });

        // Wait for all three jobs to produce completion events.
        for _ in 0..100 {
            let done = store
                .events_for(1)
                .iter()
                .filter(|e| e.event_type == EventType::ActionCompleted)
                .count();
            if done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

        let done = store
            .events_for(1)
            .iter()
            .filter(|e| e.event_type == EventType::ActionCompleted)
            .count();
        assert_eq!(done, 3);
    }
}
