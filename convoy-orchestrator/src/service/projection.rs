//! Projection Service
//!
//! Maintains the denormalized view of a pipeline execution: one stage entry
//! per state of the pipeline graph, the derived pipeline status, and the
//! per-state ETA table learned from past successful runs.

use convoy_core::domain::execution::{
    ExecutionStatus, StateExecutionData, StateExecutionInstance, StateType, WorkflowExecution,
};
use convoy_core::domain::pipeline::{PipelineExecution, PipelineStageExecution, StateDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ProjectionError;
use crate::executor::StateMachineExecutor;
use crate::repository::{PipelineRepository, StateExecutionRepository, WorkflowExecutionRepository};

#[derive(Clone)]
pub struct PipelineStateProjector {
    pipelines: Arc<dyn PipelineRepository>,
    executions: Arc<dyn WorkflowExecutionRepository>,
    states: Arc<dyn StateExecutionRepository>,
    executor: Arc<dyn StateMachineExecutor>,
    eta_sample_size: usize,
}

impl PipelineStateProjector {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        executions: Arc<dyn WorkflowExecutionRepository>,
        states: Arc<dyn StateExecutionRepository>,
        executor: Arc<dyn StateMachineExecutor>,
        eta_sample_size: usize,
    ) -> Self {
        Self {
            pipelines,
            executions,
            states,
            executor,
            eta_sample_size,
        }
    }

    /// Creates the projection of a freshly triggered pipeline run
    ///
    /// The pipeline's current ETA table is copied into the projection.
    pub async fn create_projection(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<PipelineExecution, ProjectionError> {
        let pipeline = self
            .pipelines
            .find_pipeline(&execution.app_id, &execution.workflow_id)
            .await?
            .ok_or_else(|| ProjectionError::PipelineNotFound {
                app_id: execution.app_id.clone(),
                pipeline_id: execution.workflow_id.clone(),
            })?;

        let mut projection = PipelineExecution {
            workflow_execution_id: execution.id,
            app_id: execution.app_id.clone(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name,
            status: execution.status,
            started_at: execution.started_at,
            ended_at: execution.ended_at,
            stage_executions: Vec::new(),
            state_eta_map: pipeline.state_eta_map,
            version: 0,
        };
        self.pipelines.insert_execution(&projection).await?;

        self.refresh(&mut projection).await?;
        Ok(projection)
    }

    /// Rebuilds the stage list and status of a projection and persists it
    ///
    /// Projections in a final status are left untouched. A save that loses
    /// against a concurrent writer is logged and dropped.
    pub async fn refresh(&self, pipeline_execution: &mut PipelineExecution) -> Result<(), ProjectionError> {
        if pipeline_execution.status.is_final() {
            return Ok(());
        }

        let app_id = pipeline_execution.app_id.clone();
        let state_machine = self
            .executor
            .read_latest_state_machine(&app_id, &pipeline_execution.pipeline_id)
            .await?
            .ok_or_else(|| ProjectionError::MissingStateMachine {
                app_id: app_id.clone(),
                pipeline_id: pipeline_execution.pipeline_id.clone(),
            })?;

        // Later instances of a state replace earlier ones
        let instances: HashMap<String, StateExecutionInstance> = self
            .states
            .list_by_execution(&app_id, pipeline_execution.workflow_execution_id)
            .await?
            .into_iter()
            .map(|i| (i.state_name.clone(), i))
            .collect();

        let mut stages = Vec::new();
        let mut all_final = true;
        for state in state_machine.linear_chain()? {
            match instances.get(&state.name) {
                None => stages.push(PipelineStageExecution::queued(
                    state,
                    pipeline_execution.state_eta_map.get(&state.name).copied(),
                )),
                Some(instance) => {
                    all_final &= instance.status.is_final();
                    stages.push(self.stage_from_instance(state, instance).await?);
                }
            }
        }

        let execution = self
            .executions
            .find_by_id(&app_id, pipeline_execution.workflow_execution_id)
            .await?;

        if all_final {
            if let Some(execution) = &execution {
                pipeline_execution.status = execution.status;
                pipeline_execution.ended_at = execution.ended_at;
            }
        } else {
            pipeline_execution.status = derive_status(&stages);
        }
        if let Some(execution) = &execution {
            pipeline_execution.started_at = execution.started_at;
        }
        pipeline_execution.stage_executions = stages;

        match self.pipelines.save_execution(pipeline_execution).await {
            Ok(version) => pipeline_execution.version = version,
            Err(e) if e.is_concurrent_modification() => {
                tracing::warn!(
                    "Pipeline execution {} in app {} changed concurrently, skipping save",
                    pipeline_execution.workflow_execution_id,
                    app_id
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if pipeline_execution.status.is_final() {
            let projector = self.clone();
            let finished = pipeline_execution.clone();
            tokio::spawn(async move {
                if let Err(e) = projector.update_estimates(&finished).await {
                    tracing::error!(
                        "Failed to update estimates of pipeline {} in app {}: {}",
                        finished.pipeline_id,
                        finished.app_id,
                        e
                    );
                }
            });
        }

        Ok(())
    }

    async fn stage_from_instance(
        &self,
        state: &StateDefinition,
        instance: &StateExecutionInstance,
    ) -> Result<PipelineStageExecution, ProjectionError> {
        let mut stage = PipelineStageExecution {
            state_name: state.name.clone(),
            state_type: instance.state_type,
            status: instance.status,
            started_at: instance.started_at,
            ended_at: instance.ended_at,
            estimated_millis: None,
            state_execution_data: instance.state_execution_map.get(&state.name).cloned(),
            workflow_executions: Vec::new(),
            message: None,
        };

        match instance.state_type {
            StateType::Approval => {}
            StateType::EnvState => {
                if let Some(StateExecutionData::EnvState {
                    workflow_execution_id,
                    error_msg,
                    ..
                }) = &stage.state_execution_data
                {
                    if let Some(id) = workflow_execution_id {
                        if let Some(nested) =
                            self.executions.find_by_id(&instance.app_id, *id).await?
                        {
                            stage.workflow_executions.push(nested);
                        }
                    }
                    stage.message = error_msg.clone();
                }
            }
            other => {
                return Err(ProjectionError::UnknownStateType {
                    state_name: state.name.clone(),
                    state_type: other.as_str().to_string(),
                });
            }
        }

        Ok(stage)
    }

    /// Loads a projection by id and refreshes it
    pub async fn refresh_by_id(
        &self,
        app_id: &str,
        workflow_execution_id: Uuid,
    ) -> Result<PipelineExecution, ProjectionError> {
        let mut pipeline_execution = self
            .pipelines
            .find_execution(app_id, workflow_execution_id)
            .await?
            .ok_or(ProjectionError::ExecutionNotFound(workflow_execution_id))?;

        self.refresh(&mut pipeline_execution).await?;
        Ok(pipeline_execution)
    }

    /// Refreshes a projection in the background
    pub fn refresh_async(&self, app_id: &str, workflow_execution_id: Uuid) -> JoinHandle<()> {
        let projector = self.clone();
        let app_id = app_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = projector.refresh_by_id(&app_id, workflow_execution_id).await {
                tracing::error!(
                    "Failed to refresh pipeline execution {} in app {}: {}",
                    workflow_execution_id,
                    app_id,
                    e
                );
            }
        })
    }

    /// Refreshes up to `limit` projections that are not yet final
    ///
    /// Failures are logged per projection. Returns how many were refreshed.
    pub async fn refresh_unfinished(&self, limit: usize) -> Result<usize, ProjectionError> {
        let unfinished = self.pipelines.find_unfinished(limit).await?;

        let mut refreshed = 0;
        for mut pipeline_execution in unfinished {
            match self.refresh(&mut pipeline_execution).await {
                Ok(()) => refreshed += 1,
                Err(e) => tracing::error!(
                    "Failed to refresh pipeline execution {} in app {}: {}",
                    pipeline_execution.workflow_execution_id,
                    pipeline_execution.app_id,
                    e
                ),
            }
        }

        if refreshed > 0 {
            tracing::debug!("Refreshed {} unfinished pipeline executions", refreshed);
        }
        Ok(refreshed)
    }

    /// Recomputes the pipeline's ETA table from its latest successful runs
    ///
    /// Only runs for projections in a final status. Stages without both
    /// timestamps contribute no sample. Returns the table written, if any.
    pub async fn update_estimates(
        &self,
        pipeline_execution: &PipelineExecution,
    ) -> Result<Option<HashMap<String, i64>>, ProjectionError> {
        if !pipeline_execution.status.is_final() {
            return Ok(None);
        }

        let recent = self
            .pipelines
            .find_recent_successful(
                &pipeline_execution.app_id,
                &pipeline_execution.pipeline_id,
                self.eta_sample_size,
            )
            .await?;
        if recent.is_empty() {
            return Ok(None);
        }

        let mut samples: HashMap<&str, (i64, i64)> = HashMap::new();
        for stage in recent.iter().flat_map(|e| e.stage_executions.iter()) {
            if let Some(duration) = stage.duration_millis() {
                let entry = samples.entry(stage.state_name.as_str()).or_default();
                entry.0 += duration;
                entry.1 += 1;
            }
        }

        let state_eta_map: HashMap<String, i64> = samples
            .into_iter()
            .map(|(name, (total, count))| (name.to_string(), total / count))
            .collect();

        self.pipelines
            .update_state_eta_map(
                &pipeline_execution.app_id,
                &pipeline_execution.pipeline_id,
                &state_eta_map,
            )
            .await?;

        tracing::debug!(
            "Pipeline {} ETA table updated from {} runs",
            pipeline_execution.pipeline_id,
            recent.len()
        );
        Ok(Some(state_eta_map))
    }
}

/// Status of a pipeline whose states are not all final
///
/// Stage statuses are consulted before those of nested workflow executions.
fn derive_status(stages: &[PipelineStageExecution]) -> ExecutionStatus {
    let nested: Vec<ExecutionStatus> = stages
        .iter()
        .flat_map(|s| s.workflow_executions.iter().map(|w| w.status))
        .collect();
    let own: Vec<ExecutionStatus> = stages.iter().map(|s| s.status).collect();

    [own, nested]
        .iter()
        .find_map(|statuses| blocking_status(statuses))
        .unwrap_or(ExecutionStatus::Running)
}

fn blocking_status(statuses: &[ExecutionStatus]) -> Option<ExecutionStatus> {
    if statuses
        .iter()
        .any(|s| matches!(s, ExecutionStatus::Paused | ExecutionStatus::Pausing))
    {
        Some(ExecutionStatus::Paused)
    } else if statuses.contains(&ExecutionStatus::Waiting) {
        Some(ExecutionStatus::Waiting)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RepositoryError, RepositoryResult};
    use crate::executor::StaticExecutor;
    use crate::repository::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use convoy_core::domain::execution::WorkflowType;
    use convoy_core::domain::pipeline::{Pipeline, StateMachine, Transition, TransitionType};

    const APP: &str = "app";
    const PIPELINE: &str = "release";

    struct Harness {
        store: InMemoryStore,
        executor: Arc<StaticExecutor>,
        projector: PipelineStateProjector,
    }

    fn harness(states: &[(&str, StateType)]) -> Harness {
        let store = InMemoryStore::new();
        let executor = Arc::new(StaticExecutor::new());

        executor.put_state_machine(StateMachine {
            id: Uuid::new_v4(),
            app_id: APP.to_string(),
            origin_id: PIPELINE.to_string(),
            initial_state_name: states[0].0.to_string(),
            states: states
                .iter()
                .map(|(name, state_type)| StateDefinition {
                    name: name.to_string(),
                    state_type: *state_type,
                })
                .collect(),
            transitions: states
                .windows(2)
                .map(|pair| Transition {
                    from: pair[0].0.to_string(),
                    to: pair[1].0.to_string(),
                    transition_type: TransitionType::Success,
                })
                .collect(),
            created_at: Utc::now(),
        });

        store.put_pipeline(Pipeline {
            id: PIPELINE.to_string(),
            app_id: APP.to_string(),
            name: "Release".to_string(),
            state_eta_map: HashMap::from([
                ("Approve".to_string(), 60_000),
                ("Prod".to_string(), 300_000),
            ]),
        });

        let projector = PipelineStateProjector::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            executor.clone(),
            5,
        );
        Harness {
            store,
            executor,
            projector,
        }
    }

    fn workflow_execution(workflow_id: &str, status: ExecutionStatus) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::new_v4(),
            app_id: APP.to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: WorkflowType::Pipeline,
            name: workflow_id.to_string(),
            status,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    fn instance(
        execution_id: Uuid,
        state_name: &str,
        state_type: StateType,
        status: ExecutionStatus,
        data: Option<StateExecutionData>,
    ) -> StateExecutionInstance {
        StateExecutionInstance {
            id: Uuid::new_v4(),
            app_id: APP.to_string(),
            execution_id,
            state_name: state_name.to_string(),
            state_type,
            status,
            started_at: Some(Utc::now()),
            ended_at: status.is_final().then(Utc::now),
            state_execution_map: data
                .map(|d| HashMap::from([(state_name.to_string(), d)]))
                .unwrap_or_default(),
            created_at: Utc::now(),
        }
    }

    fn approval_and_prod() -> Harness {
        harness(&[("Approve", StateType::Approval), ("Prod", StateType::EnvState)])
    }

    #[tokio::test]
    async fn test_no_instances_yields_queued_stages_with_eta() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());

        let projection = h.projector.create_projection(&run).await.unwrap();

        let stages = &projection.stage_executions;
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|s| s.status == ExecutionStatus::Queued));
        assert_eq!(stages[0].estimated_millis, Some(60_000));
        assert_eq!(stages[1].estimated_millis, Some(300_000));
        assert_eq!(projection.version, 1);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Waiting,
            Some(StateExecutionData::Approval {
                approval_id: "ap1".to_string(),
                approved_by: None,
                comments: None,
            }),
        ));

        let first = h.projector.create_projection(&run).await.unwrap();
        let second = h.projector.refresh_by_id(APP, run.id).await.unwrap();

        assert_eq!(first.stage_executions, second.stage_executions);
        assert_eq!(first.status, second.status);
        assert_eq!(second.status, ExecutionStatus::Waiting);
        assert!(matches!(
            second.stage_executions[0].state_execution_data,
            Some(StateExecutionData::Approval { .. })
        ));
    }

    #[tokio::test]
    async fn test_env_stage_embeds_nested_execution() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        let nested = workflow_execution("deploy-prod", ExecutionStatus::Paused);
        h.store.put_workflow_execution(run.clone());
        h.store.put_workflow_execution(nested.clone());
        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Success,
            None,
        ));
        h.store.put_state_instance(instance(
            run.id,
            "Prod",
            StateType::EnvState,
            ExecutionStatus::Running,
            Some(StateExecutionData::EnvState {
                workflow_id: "deploy-prod".to_string(),
                env_id: "prod".to_string(),
                workflow_execution_id: Some(nested.id),
                error_msg: Some("waiting on rollout".to_string()),
            }),
        ));

        let projection = h.projector.create_projection(&run).await.unwrap();

        let prod = &projection.stage_executions[1];
        assert_eq!(prod.status, ExecutionStatus::Running);
        assert_eq!(prod.workflow_executions, vec![nested]);
        assert_eq!(prod.message.as_deref(), Some("waiting on rollout"));
        assert_eq!(projection.status, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_paused_env_instance_pauses_pipeline_despite_running_nested() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        let nested = workflow_execution("deploy-prod", ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        h.store.put_workflow_execution(nested.clone());
        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Success,
            None,
        ));
        h.store.put_state_instance(instance(
            run.id,
            "Prod",
            StateType::EnvState,
            ExecutionStatus::Paused,
            Some(StateExecutionData::EnvState {
                workflow_id: "deploy-prod".to_string(),
                env_id: "prod".to_string(),
                workflow_execution_id: Some(nested.id),
                error_msg: None,
            }),
        ));

        let projection = h.projector.create_projection(&run).await.unwrap();

        let prod = &projection.stage_executions[1];
        assert_eq!(prod.status, ExecutionStatus::Paused);
        assert_eq!(prod.workflow_executions[0].status, ExecutionStatus::Running);
        assert_eq!(projection.status, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_status_frozen_until_last_instance_finishes() {
        let h = approval_and_prod();
        let mut run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Success,
            None,
        ));
        let prod = instance(
            run.id,
            "Prod",
            StateType::EnvState,
            ExecutionStatus::Running,
            None,
        );
        h.store.put_state_instance(prod.clone());
        h.projector.create_projection(&run).await.unwrap();

        // The workflow already reports failure, but Prod is still running
        run.status = ExecutionStatus::Failed;
        run.ended_at = Some(Utc::now());
        h.store.put_workflow_execution(run.clone());

        let projection = h.projector.refresh_by_id(APP, run.id).await.unwrap();
        assert_eq!(projection.status, ExecutionStatus::Running);

        let mut finished = prod;
        finished.status = ExecutionStatus::Failed;
        finished.ended_at = Some(Utc::now());
        h.store.put_state_instance(finished);

        let projection = h.projector.refresh_by_id(APP, run.id).await.unwrap();
        assert_eq!(projection.status, ExecutionStatus::Failed);
        assert_eq!(projection.ended_at, run.ended_at);
    }

    #[tokio::test]
    async fn test_final_projection_is_not_touched() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        let mut projection = PipelineExecution {
            workflow_execution_id: run.id,
            app_id: APP.to_string(),
            pipeline_id: PIPELINE.to_string(),
            pipeline_name: "Release".to_string(),
            status: ExecutionStatus::Aborted,
            started_at: None,
            ended_at: None,
            stage_executions: vec![],
            state_eta_map: HashMap::new(),
            version: 7,
        };

        h.projector.refresh(&mut projection).await.unwrap();
        assert!(projection.stage_executions.is_empty());
        assert_eq!(projection.version, 7);
    }

    #[tokio::test]
    async fn test_unsupported_instance_type_is_fatal() {
        let h = harness(&[("Gate", StateType::Approval), ("Script", StateType::ShellScript)]);
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        h.store.put_state_instance(instance(
            run.id,
            "Script",
            StateType::ShellScript,
            ExecutionStatus::Running,
            None,
        ));

        let err = h.projector.create_projection(&run).await.unwrap_err();
        assert!(matches!(err, ProjectionError::UnknownStateType { .. }));
    }

    #[tokio::test]
    async fn test_missing_state_machine_is_an_error() {
        let h = approval_and_prod();
        h.store.put_pipeline(Pipeline {
            id: "orphan".to_string(),
            app_id: APP.to_string(),
            name: "Orphan".to_string(),
            state_eta_map: HashMap::new(),
        });
        let run = workflow_execution("orphan", ExecutionStatus::Running);

        let err = h.projector.create_projection(&run).await.unwrap_err();
        assert!(matches!(err, ProjectionError::MissingStateMachine { .. }));
    }

    #[tokio::test]
    async fn test_update_estimates_averages_successful_runs() {
        let h = approval_and_prod();
        let start = Utc::now() - chrono::Duration::hours(1);

        let stage = |name: &str, millis: Option<i64>| PipelineStageExecution {
            state_name: name.to_string(),
            state_type: StateType::EnvState,
            status: ExecutionStatus::Success,
            started_at: Some(start),
            ended_at: millis.map(|m| start + chrono::Duration::milliseconds(m)),
            estimated_millis: None,
            state_execution_data: None,
            workflow_executions: vec![],
            message: None,
        };

        for (i, (approve, prod)) in [(1_000, Some(10_000)), (3_000, None)].into_iter().enumerate() {
            let execution = PipelineExecution {
                workflow_execution_id: Uuid::new_v4(),
                app_id: APP.to_string(),
                pipeline_id: PIPELINE.to_string(),
                pipeline_name: "Release".to_string(),
                status: ExecutionStatus::Success,
                started_at: Some(start),
                ended_at: Some(start + chrono::Duration::minutes(i as i64 + 1)),
                stage_executions: vec![stage("Approve", Some(approve)), stage("Prod", prod)],
                state_eta_map: HashMap::new(),
                version: 0,
            };
            h.store.insert_execution(&execution).await.unwrap();
        }

        let mut failed = h
            .store
            .find_recent_successful(APP, PIPELINE, 1)
            .await
            .unwrap()
            .remove(0);
        failed.status = ExecutionStatus::Failed;

        let eta = h
            .projector
            .update_estimates(&failed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eta.get("Approve"), Some(&2_000));
        assert_eq!(eta.get("Prod"), Some(&10_000));

        let pipeline = h.store.find_pipeline(APP, PIPELINE).await.unwrap().unwrap();
        assert_eq!(pipeline.state_eta_map, eta);
    }

    #[tokio::test]
    async fn test_update_estimates_skips_running_projection() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        let projection = h.projector.create_projection(&run).await.unwrap();

        assert!(h.projector.update_estimates(&projection).await.unwrap().is_none());
    }

    /// Pipeline store whose saves always lose to another writer
    struct ContendedPipelines {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl PipelineRepository for ContendedPipelines {
        async fn find_pipeline(
            &self,
            app_id: &str,
            pipeline_id: &str,
        ) -> RepositoryResult<Option<Pipeline>> {
            self.inner.find_pipeline(app_id, pipeline_id).await
        }

        async fn find_execution(
            &self,
            app_id: &str,
            workflow_execution_id: Uuid,
        ) -> RepositoryResult<Option<PipelineExecution>> {
            self.inner.find_execution(app_id, workflow_execution_id).await
        }

        async fn insert_execution(&self, execution: &PipelineExecution) -> RepositoryResult<()> {
            self.inner.insert_execution(execution).await
        }

        async fn save_execution(&self, execution: &PipelineExecution) -> RepositoryResult<i64> {
            Err(RepositoryError::ConcurrentModification {
                entity: "pipeline execution",
                id: execution.workflow_execution_id.to_string(),
            })
        }

        async fn find_recent_successful(
            &self,
            app_id: &str,
            pipeline_id: &str,
            limit: usize,
        ) -> RepositoryResult<Vec<PipelineExecution>> {
            self.inner
                .find_recent_successful(app_id, pipeline_id, limit)
                .await
        }

        async fn update_state_eta_map(
            &self,
            app_id: &str,
            pipeline_id: &str,
            state_eta_map: &HashMap<String, i64>,
        ) -> RepositoryResult<bool> {
            self.inner
                .update_state_eta_map(app_id, pipeline_id, state_eta_map)
                .await
        }

        async fn find_unfinished(&self, limit: usize) -> RepositoryResult<Vec<PipelineExecution>> {
            self.inner.find_unfinished(limit).await
        }
    }

    #[tokio::test]
    async fn test_lost_save_is_dropped() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        let mut projection = h.projector.create_projection(&run).await.unwrap();
        assert_eq!(projection.version, 1);

        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Waiting,
            None,
        ));
        let contended = PipelineStateProjector::new(
            Arc::new(ContendedPipelines {
                inner: h.store.clone(),
            }),
            Arc::new(h.store.clone()),
            Arc::new(h.store.clone()),
            h.executor.clone(),
            5,
        );

        contended.refresh(&mut projection).await.unwrap();

        assert_eq!(projection.version, 1);
        let stored = h.store.find_execution(APP, run.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_refresh_unfinished_skips_final_projections() {
        let h = approval_and_prod();
        let run = workflow_execution(PIPELINE, ExecutionStatus::Running);
        h.store.put_workflow_execution(run.clone());
        h.projector.create_projection(&run).await.unwrap();

        let done = PipelineExecution {
            workflow_execution_id: Uuid::new_v4(),
            app_id: APP.to_string(),
            pipeline_id: PIPELINE.to_string(),
            pipeline_name: "Release".to_string(),
            status: ExecutionStatus::Success,
            started_at: Some(Utc::now()),
            ended_at: Some(Utc::now()),
            stage_executions: vec![],
            state_eta_map: HashMap::new(),
            version: 0,
        };
        h.store.insert_execution(&done).await.unwrap();

        h.store.put_state_instance(instance(
            run.id,
            "Approve",
            StateType::Approval,
            ExecutionStatus::Waiting,
            None,
        ));

        assert_eq!(h.projector.refresh_unfinished(10).await.unwrap(), 1);

        let refreshed = h.store.find_execution(APP, run.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, ExecutionStatus::Waiting);
        assert_eq!(refreshed.version, 2);
        let untouched = h
            .store
            .find_execution(APP, done.workflow_execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.version, 0);
    }

    #[test]
    fn test_derive_status_consults_stages_before_nested_runs() {
        let state = StateDefinition {
            name: "Prod".to_string(),
            state_type: StateType::EnvState,
        };
        let mut waiting = PipelineStageExecution::queued(&state, None);
        waiting.status = ExecutionStatus::Waiting;
        let mut paused_run = workflow_execution("deploy-prod", ExecutionStatus::Paused);
        waiting.workflow_executions.push(paused_run.clone());

        assert_eq!(derive_status(&[waiting.clone()]), ExecutionStatus::Waiting);

        let mut running = waiting;
        running.status = ExecutionStatus::Running;
        assert_eq!(derive_status(&[running.clone()]), ExecutionStatus::Paused);

        paused_run.status = ExecutionStatus::Waiting;
        running.workflow_executions = vec![paused_run];
        assert_eq!(derive_status(&[running]), ExecutionStatus::Waiting);
    }

    #[test]
    fn test_derive_status_prefers_paused_over_waiting() {
        let state = StateDefinition {
            name: "A".to_string(),
            state_type: StateType::Approval,
        };
        let mut waiting = PipelineStageExecution::queued(&state, None);
        waiting.status = ExecutionStatus::Waiting;
        let mut pausing = PipelineStageExecution::queued(&state, None);
        pausing.status = ExecutionStatus::Pausing;

        assert_eq!(derive_status(&[waiting.clone()]), ExecutionStatus::Waiting);
        assert_eq!(derive_status(&[waiting, pausing]), ExecutionStatus::Paused);
        assert_eq!(
            derive_status(&[PipelineStageExecution::queued(&state, None)]),
            ExecutionStatus::Running
        );
    }
}
