use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use flowpilot_core::{
    events::Event,
    types::{
        ExecutionId, ExecutionSnapshot, Payload, Step, StepExecution, StepExecutionId,
        TriggerSource, Workflow, WorkflowExecution, WorkflowId,
    },
    workflow::{RetryDecision, StepFailure},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// List all workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state
        .orchestrator
        .list_workflows()?
        .into_iter()
        .map(WorkflowResponse::from)
        .collect();
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowResponse>,
}

/// Workflow with its derived success rate
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowResponse {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub success_rate: f64,
}

impl From<Workflow> for WorkflowResponse {
    fn from(workflow: Workflow) -> Self {
        let success_rate = workflow.success_rate();
        Self {
            workflow,
            success_rate,
        }
    }
}

/// Define a workflow; graph errors are rejected before anything is stored
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowResponse>)> {
    let mut workflow = Workflow::new(req.name, req.steps);
    if let Some(description) = req.description {
        workflow.description = description;
    }
    if let Some(is_active) = req.is_active {
        workflow.is_active = is_active;
    }

    let workflow = state.orchestrator.define_workflow(workflow)?;
    Ok((StatusCode::CREATED, Json(workflow.into())))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub is_active: Option<bool>,
}

/// Get the latest version of a workflow
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<WorkflowResponse>> {
    let workflow = state.orchestrator.get_workflow(WorkflowId(workflow_id))?;
    Ok(Json(workflow.into()))
}

/// Trigger a run of a workflow
pub async fn trigger_execution(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerResponse>> {
    let execution_id = state
        .orchestrator
        .start(
            WorkflowId(workflow_id),
            req.input_data,
            req.trigger_source.unwrap_or_default(),
        )
        .await?;

    Ok(Json(TriggerResponse { execution_id }))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub input_data: Payload,
    pub trigger_source: Option<TriggerSource>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub execution_id: ExecutionId,
}

/// List the runs of one workflow, newest first
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let workflow = state.orchestrator.get_workflow(WorkflowId(workflow_id))?;
    let executions = state.orchestrator.list_executions(Some(workflow.id))?;
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<WorkflowExecution>,
}

/// Execution snapshot with nested step statuses
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<ExecutionSnapshot>> {
    let snapshot = state.orchestrator.query_status(ExecutionId(execution_id))?;
    Ok(Json(snapshot))
}

/// Get events for an execution
pub async fn get_execution_events(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<GetExecutionEventsResponse>> {
    let events = state
        .orchestrator
        .execution_events(ExecutionId(execution_id))
        .await?;
    Ok(Json(GetExecutionEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetExecutionEventsResponse {
    pub events: Vec<Event>,
}

pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state
        .orchestrator
        .cancel(ExecutionId(execution_id), Some("cancelled via API".to_string()))
        .await?;
    Ok(Json(execution))
}

pub async fn pause_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.orchestrator.pause(ExecutionId(execution_id)).await?;
    Ok(Json(execution))
}

pub async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.orchestrator.resume(ExecutionId(execution_id)).await?;
    Ok(Json(execution))
}

/// Worker callback: a step execution finished successfully
pub async fn complete_step(
    State(state): State<Arc<AppState>>,
    Path(step_execution_id): Path<Uuid>,
    Json(req): Json<CompleteStepRequest>,
) -> ApiResult<Json<StepExecution>> {
    let step = state
        .orchestrator
        .on_step_completed(StepExecutionId(step_execution_id), req.result)
        .await?;
    Ok(Json(step))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteStepRequest {
    #[serde(default)]
    pub result: Payload,
}

/// Worker callback: a step execution raised an error
pub async fn fail_step(
    State(state): State<Arc<AppState>>,
    Path(step_execution_id): Path<Uuid>,
    Json(req): Json<FailStepRequest>,
) -> ApiResult<Json<FailStepResponse>> {
    let mut failure = StepFailure::new(req.error);
    if let Some(traceback) = req.traceback {
        failure = failure.with_traceback(traceback);
    }

    let decision = state
        .orchestrator
        .on_step_failed(StepExecutionId(step_execution_id), failure)
        .await?;

    let response = match decision {
        RetryDecision::Retry { next_retry_at, .. } => FailStepResponse {
            decision: "retry".to_string(),
            next_retry_at: Some(next_retry_at),
        },
        RetryDecision::Terminate(_) => FailStepResponse {
            decision: "terminate".to_string(),
            next_retry_at: None,
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailStepRequest {
    pub error: String,
    pub traceback: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailStepResponse {
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}
