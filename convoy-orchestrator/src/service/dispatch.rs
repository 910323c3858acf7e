//! Dispatch Service
//!
//! Consumes workflow promotion events and starts the oldest queued
//! execution of a workflow once nothing else of that workflow is active.
//! A per-workflow distributed lock keeps concurrent dispatchers from
//! admitting two executions of the same workflow.

use chrono::Utc;
use convoy_core::domain::execution::{ExecutionStatus, STARTABLE_STATUSES};
use convoy_core::dto::queue::ExecutionEvent;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::RepositoryResult;
use crate::executor::StateMachineExecutor;
use crate::lock::{DistributedLock, acquire_lock};
use crate::queue::{ExecutionQueue, QueueMessage};
use crate::repository::WorkflowExecutionRepository;

/// Result of handling one promotion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another dispatcher holds the workflow lock
    LockContended,
    /// An execution of the workflow is already active
    AlreadyActive,
    /// No execution of the workflow is queued
    NothingQueued,
    /// The execution was started and marked running
    Started(Uuid),
    /// The executor refused the execution; it was marked failed
    StartFailed(Uuid),
    /// The execution left the startable statuses while it was being started
    Superseded(Uuid),
    /// A transient error stopped the dispatch
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub lock_wait: Duration,
    pub lock_hold: Duration,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lock_wait: config.dispatch_lock_wait,
            lock_hold: config.dispatch_lock_hold,
            poll_interval: config.queue_poll_interval,
            visibility_timeout: config.queue_visibility_timeout,
        }
    }
}

#[derive(Clone)]
pub struct ExecutionQueueDispatcher {
    executions: Arc<dyn WorkflowExecutionRepository>,
    executor: Arc<dyn StateMachineExecutor>,
    lock: Arc<dyn DistributedLock>,
    queue: Arc<dyn ExecutionQueue>,
    settings: DispatchSettings,
}

impl ExecutionQueueDispatcher {
    pub fn new(
        executions: Arc<dyn WorkflowExecutionRepository>,
        executor: Arc<dyn StateMachineExecutor>,
        lock: Arc<dyn DistributedLock>,
        queue: Arc<dyn ExecutionQueue>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            executions,
            executor,
            lock,
            queue,
            settings,
        }
    }

    /// Handles one promotion event
    ///
    /// The workflow lock is released on every path. When the promoted
    /// execution did not end up running, the event is published again.
    pub async fn handle(&self, event: &ExecutionEvent) -> DispatchOutcome {
        let guard = match acquire_lock(
            self.lock.clone(),
            &event.workflow_id,
            self.settings.lock_wait,
            self.settings.lock_hold,
        )
        .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!(
                    "Workflow {} in app {} is being dispatched elsewhere",
                    event.workflow_id,
                    event.app_id
                );
                return DispatchOutcome::LockContended;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to lock workflow {} in app {}: {}",
                    event.workflow_id,
                    event.app_id,
                    e
                );
                return DispatchOutcome::Failed;
            }
        };

        let outcome = match self.promote(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    "Failed to dispatch workflow {} in app {}: {}",
                    event.workflow_id,
                    event.app_id,
                    e
                );
                DispatchOutcome::Failed
            }
        };

        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to release lock of workflow {}: {}", event.workflow_id, e);
        }

        // The workflow is free again; let the next queued execution through
        if matches!(
            outcome,
            DispatchOutcome::StartFailed(_) | DispatchOutcome::Superseded(_)
        ) {
            if let Err(e) = self.queue.publish(event).await {
                tracing::error!(
                    "Failed to republish workflow {} in app {}: {}",
                    event.workflow_id,
                    event.app_id,
                    e
                );
            }
        }

        outcome
    }

    async fn promote(&self, event: &ExecutionEvent) -> RepositoryResult<DispatchOutcome> {
        if let Some(active) = self
            .executions
            .find_active(&event.app_id, &event.workflow_id)
            .await?
        {
            tracing::debug!(
                "Workflow {} already has active execution {} ({})",
                event.workflow_id,
                active.id,
                active.status
            );
            return Ok(DispatchOutcome::AlreadyActive);
        }

        let Some(queued) = self
            .executions
            .find_oldest_queued(&event.app_id, &event.workflow_id)
            .await?
        else {
            return Ok(DispatchOutcome::NothingQueued);
        };

        let started = match self
            .executor
            .start_queued_execution(&event.app_id, queued.id)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(
                    "Executor failed to start execution {} of workflow {}: {}",
                    queued.id,
                    event.workflow_id,
                    e
                );
                false
            }
        };

        let status = if started {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Failed
        };

        let updated = self
            .executions
            .update_status_if(
                &event.app_id,
                queued.id,
                &STARTABLE_STATUSES,
                status,
                Utc::now(),
            )
            .await?;

        if !updated {
            tracing::warn!(
                "Execution {} of workflow {} moved on before it could be marked {}",
                queued.id,
                event.workflow_id,
                status
            );
            return Ok(DispatchOutcome::Superseded(queued.id));
        }

        if started {
            tracing::info!(
                "Execution {} of workflow {} started",
                queued.id,
                event.workflow_id
            );
            Ok(DispatchOutcome::Started(queued.id))
        } else {
            tracing::warn!(
                "Execution {} of workflow {} failed to start",
                queued.id,
                event.workflow_id
            );
            Ok(DispatchOutcome::StartFailed(queued.id))
        }
    }

    /// Republishes a promotion event for every workflow with queued executions
    pub async fn rescan(&self) -> RepositoryResult<usize> {
        let workflows = self.executions.find_workflows_with_queued().await?;
        for (app_id, workflow_id) in &workflows {
            self.queue
                .publish(&ExecutionEvent::new(app_id.clone(), workflow_id.clone()))
                .await?;
        }

        if !workflows.is_empty() {
            tracing::debug!("Rescan republished {} workflows", workflows.len());
        }
        Ok(workflows.len())
    }

    /// Consumes the queue forever, handling each message on its own task
    pub async fn run(self) {
        tracing::info!("Execution queue dispatcher started");

        loop {
            match self.queue.poll(self.settings.visibility_timeout).await {
                Ok(Some(message)) => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move { dispatcher.handle_message(message).await });
                }
                Ok(None) => tokio::time::sleep(self.settings.poll_interval).await,
                Err(e) => {
                    tracing::error!("Failed to poll execution queue: {}", e);
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: QueueMessage) {
        let outcome = self.handle(&message.event).await;
        tracing::debug!(
            "Message {} for workflow {} (attempt {}): {:?}",
            message.id,
            message.event.workflow_id,
            message.attempts,
            outcome
        );

        // Unacknowledged messages come back after the visibility timeout
        if outcome == DispatchOutcome::Failed {
            return;
        }

        if let Err(e) = self.queue.ack(message.id).await {
            tracing::error!("Failed to acknowledge message {}: {}", message.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StaticExecutor;
    use crate::lock::InMemoryLock;
    use crate::queue::InMemoryExecutionQueue;
    use crate::repository::InMemoryStore;
    use async_trait::async_trait;
    use convoy_core::domain::execution::{WorkflowExecution, WorkflowType};
    use convoy_core::domain::pipeline::StateMachine;

    fn execution(workflow_id: &str, status: ExecutionStatus, age_secs: i64) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::new_v4(),
            app_id: "app".to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: WorkflowType::Orchestration,
            name: format!("{workflow_id}-run"),
            status,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
            started_at: None,
            ended_at: None,
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            lock_wait: Duration::ZERO,
            lock_hold: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
            visibility_timeout: Duration::from_secs(60),
        }
    }

    struct Harness {
        store: InMemoryStore,
        lock: InMemoryLock,
        queue: InMemoryExecutionQueue,
        executor: Arc<StaticExecutor>,
        dispatcher: ExecutionQueueDispatcher,
    }

    fn harness() -> Harness {
        let store = InMemoryStore::new();
        let lock = InMemoryLock::new();
        let queue = InMemoryExecutionQueue::new();
        let executor = Arc::new(StaticExecutor::new());
        let dispatcher = ExecutionQueueDispatcher::new(
            Arc::new(store.clone()),
            executor.clone(),
            Arc::new(lock.clone()),
            Arc::new(queue.clone()),
            settings(),
        );
        Harness {
            store,
            lock,
            queue,
            executor,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_starts_oldest_queued_execution() {
        let h = harness();
        let older = execution("wf1", ExecutionStatus::Queued, 60);
        let newer = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(newer.clone());
        h.store.put_workflow_execution(older.clone());

        let outcome = h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;

        assert_eq!(outcome, DispatchOutcome::Started(older.id));
        let started = h.store.workflow_execution(older.id).unwrap();
        assert_eq!(started.status, ExecutionStatus::Running);
        assert!(started.started_at.is_some());
        assert_eq!(
            h.store.workflow_execution(newer.id).unwrap().status,
            ExecutionStatus::Queued
        );
        assert!(!h.lock.is_held("wf1"));
    }

    #[tokio::test]
    async fn test_active_execution_blocks_promotion() {
        let h = harness();
        h.store
            .put_workflow_execution(execution("wf1", ExecutionStatus::Paused, 120));
        let queued = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(queued.clone());

        let outcome = h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;

        assert_eq!(outcome, DispatchOutcome::AlreadyActive);
        assert_eq!(
            h.store.workflow_execution(queued.id).unwrap().status,
            ExecutionStatus::Queued
        );
        assert!(h.executor.started().is_empty());
        assert!(!h.lock.is_held("wf1"));
    }

    #[tokio::test]
    async fn test_nothing_queued() {
        let h = harness();
        h.store
            .put_workflow_execution(execution("wf1", ExecutionStatus::Success, 60));

        let outcome = h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;
        assert_eq!(outcome, DispatchOutcome::NothingQueued);
    }

    #[tokio::test]
    async fn test_refused_start_marks_failed() {
        let h = harness();
        let queued = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(queued.clone());
        h.executor.fail_start_of(queued.id);

        let outcome = h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;

        assert_eq!(outcome, DispatchOutcome::StartFailed(queued.id));
        let failed = h.store.workflow_execution(queued.id).unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_refused_start_republishes_for_next_queued() {
        let h = harness();
        let refused = execution("wf1", ExecutionStatus::Queued, 30);
        let next = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(refused.clone());
        h.store.put_workflow_execution(next.clone());
        h.executor.fail_start_of(refused.id);

        let event = ExecutionEvent::new("app", "wf1");
        let outcome = h.dispatcher.handle(&event).await;
        assert_eq!(outcome, DispatchOutcome::StartFailed(refused.id));
        assert_eq!(h.queue.pending_events(), vec![event.clone()]);

        let outcome = h.dispatcher.handle(&event).await;
        assert_eq!(outcome, DispatchOutcome::Started(next.id));
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_started_execution_is_not_republished() {
        let h = harness();
        h.store
            .put_workflow_execution(execution("wf1", ExecutionStatus::Queued, 10));

        h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_contended_lock_drops_event() {
        let h = harness();
        let queued = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(queued.clone());
        h.lock
            .try_acquire("wf1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = h.dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;

        assert_eq!(outcome, DispatchOutcome::LockContended);
        assert_eq!(
            h.store.workflow_execution(queued.id).unwrap().status,
            ExecutionStatus::Queued
        );
    }

    /// Executor that lets a user abort the execution while it is starting
    struct AbortingExecutor {
        store: InMemoryStore,
    }

    #[async_trait]
    impl StateMachineExecutor for AbortingExecutor {
        async fn start_queued_execution(
            &self,
            _app_id: &str,
            execution_id: Uuid,
        ) -> RepositoryResult<bool> {
            let mut execution = self.store.workflow_execution(execution_id).unwrap();
            execution.status = ExecutionStatus::Aborted;
            self.store.put_workflow_execution(execution);
            Ok(true)
        }

        async fn read_latest_state_machine(
            &self,
            _app_id: &str,
            _origin_id: &str,
        ) -> RepositoryResult<Option<StateMachine>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_status_write_does_not_clobber_advanced_execution() {
        let store = InMemoryStore::new();
        let dispatcher = ExecutionQueueDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(AbortingExecutor {
                store: store.clone(),
            }),
            Arc::new(InMemoryLock::new()),
            Arc::new(InMemoryExecutionQueue::new()),
            settings(),
        );
        let queued = execution("wf1", ExecutionStatus::Queued, 10);
        store.put_workflow_execution(queued.clone());

        let outcome = dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await;

        assert_eq!(outcome, DispatchOutcome::Superseded(queued.id));
        assert_eq!(
            store.workflow_execution(queued.id).unwrap().status,
            ExecutionStatus::Aborted
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_start_at_most_one() {
        let h = harness();
        let first = execution("wf1", ExecutionStatus::Queued, 30);
        let second = execution("wf1", ExecutionStatus::Queued, 20);
        h.store.put_workflow_execution(first.clone());
        h.store.put_workflow_execution(second.clone());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = h.dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.handle(&ExecutionEvent::new("app", "wf1")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let running = [first.id, second.id]
            .iter()
            .filter(|id| h.store.workflow_execution(**id).unwrap().status == ExecutionStatus::Running)
            .count();
        assert_eq!(running, 1);
        assert_eq!(h.executor.started().len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_republishes_queued_workflows() {
        let h = harness();
        h.store
            .put_workflow_execution(execution("wf1", ExecutionStatus::Queued, 10));
        h.store
            .put_workflow_execution(execution("wf1", ExecutionStatus::Queued, 5));
        h.store
            .put_workflow_execution(execution("wf2", ExecutionStatus::Running, 5));

        assert_eq!(h.dispatcher.rescan().await.unwrap(), 1);
        assert_eq!(
            h.queue.pending_events(),
            vec![ExecutionEvent::new("app", "wf1")]
        );
    }

    #[tokio::test]
    async fn test_run_consumes_and_acks_messages() {
        let h = harness();
        let queued = execution("wf1", ExecutionStatus::Queued, 10);
        h.store.put_workflow_execution(queued.clone());
        h.queue
            .publish(&ExecutionEvent::new("app", "wf1"))
            .await
            .unwrap();

        let consumer = tokio::spawn(h.dispatcher.clone().run());

        let mut done = false;
        for _ in 0..200 {
            if h.queue.is_empty() {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        consumer.abort();

        assert!(done);
        assert_eq!(
            h.store.workflow_execution(queued.id).unwrap().status,
            ExecutionStatus::Running
        );
    }
}
