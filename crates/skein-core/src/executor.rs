//! The pluggable backend contract.
//!
//! An `Executor` turns a resolved spec plus per-execution parameters into a
//! concrete backend call. Backend dispatch is a closed set: `ExecutorSpec`
//! has one variant per known backend and the infrastructure layer matches it
//! exhaustively -- there is no string-keyed runtime registry. The executor
//! value is built once at startup and passed by reference to whatever
//! dispatches work.

use std::future::Future;

use serde_json::{Map, Value};
use skein_types::execution::Execution;
use skein_types::spec::ExecutorSpec;
use uuid::Uuid;

use crate::expression::Bindings;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Static shape problems in a spec, rejected before it is accepted into
/// node configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("http executor requires a url")]
    MissingUrl,

    #[error("status code {0} is outside the valid HTTP range")]
    InvalidStatusCode(u16),

    #[error("response policy requires at least one status code")]
    EmptyStatusCodes,

    #[error("branch is required")]
    MissingBranch,

    #[error("task is required")]
    MissingTask,

    #[error("pipeline file is required")]
    MissingPipelineFile,
}

/// Errors raised while talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Network failure or a non-success backend response. Marks the
    /// execution FAILED/ERROR with the message preserved.
    #[error("{0}")]
    Backend(String),

    /// A locally recoverable condition (e.g. the backend has not registered
    /// the run yet). Retried by the reconciliation pass, never surfaced as
    /// a failure.
    #[error("transient backend condition: {0}")]
    Transient(String),

    /// The operation does not apply to this backend (e.g. `check` on a
    /// synchronous executor).
    #[error("operation not supported for {0} executor")]
    Unsupported(&'static str),

    /// The webhook payload could not be correlated to a run.
    #[error("malformed webhook payload: {0}")]
    MalformedWebhook(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Static shape check shared by every backend implementation.
pub fn validate_spec(spec: &ExecutorSpec) -> Result<(), ValidationError> {
    match spec {
        ExecutorSpec::NoOp {} => Ok(()),
        ExecutorSpec::Http {
            url,
            response_policy,
            ..
        } => {
            if url.trim().is_empty() {
                return Err(ValidationError::MissingUrl);
            }
            if response_policy.status_codes.is_empty() {
                return Err(ValidationError::EmptyStatusCodes);
            }
            for &code in &response_policy.status_codes {
                if !(100..=599).contains(&code) {
                    return Err(ValidationError::InvalidStatusCode(code));
                }
            }
            Ok(())
        }
        ExecutorSpec::CiTask { branch, task, .. } => {
            if branch.trim().is_empty() {
                return Err(ValidationError::MissingBranch);
            }
            if task.trim().is_empty() {
                return Err(ValidationError::MissingTask);
            }
            Ok(())
        }
        ExecutorSpec::CiWorkflow {
            branch,
            pipeline_file,
            ..
        } => {
            if branch.trim().is_empty() {
                return Err(ValidationError::MissingBranch);
            }
            if pipeline_file.trim().is_empty() {
                return Err(ValidationError::MissingPipelineFile);
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters and response
// ---------------------------------------------------------------------------

/// Correlation parameters merged into every outgoing backend call so the
/// remote system can later call back with proof of which execution it is
/// completing.
#[derive(Debug, Clone)]
pub struct ExecutionParameters {
    pub execution_id: Uuid,
    pub node_id: Uuid,
    /// Bearer token scoped to this execution.
    pub token: String,
}

/// What a backend reported about a unit of work.
///
/// Synchronous backends return `finished = true` immediately; backends
/// proxying long-running remote jobs return `finished = false` until a later
/// `check` or webhook.
#[derive(Debug, Clone, Default)]
pub struct ExecutorResponse {
    /// Is the remote unit of work done.
    pub finished: bool,
    /// Meaningful only once finished.
    pub successful: bool,
    /// Structured key/values merged into the execution's output event.
    pub outputs: Map<String, Value>,
    /// Backend correlation id for later `check` calls.
    pub backend_id: Option<String>,
}

impl ExecutorResponse {
    /// A completed synchronous response.
    pub fn completed(successful: bool, outputs: Map<String, Value>) -> Self {
        Self {
            finished: true,
            successful,
            outputs,
            backend_id: None,
        }
    }

    /// A still-running async response carrying the backend's id.
    pub fn in_progress(backend_id: impl Into<String>) -> Self {
        Self {
            finished: false,
            successful: false,
            outputs: Map::new(),
            backend_id: Some(backend_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// The backend contract.
///
/// One implementation covers the whole closed backend set, dispatching on
/// the spec variant. `check` and `handle_webhook` convert both completion
/// paths into the same `ExecutorResponse` shape, so the state machine is
/// indifferent to which path reported completion.
pub trait Executor: Send + Sync {
    /// Static shape check before a spec is accepted into node configuration.
    fn validate(&self, spec: &ExecutorSpec) -> Result<(), ValidationError>;

    /// Run the spec against its backend.
    fn execute(
        &self,
        spec: &ExecutorSpec,
        params: &ExecutionParameters,
    ) -> impl Future<Output = Result<ExecutorResponse, ExecutorError>> + Send;

    /// Poll the current status of a previously started call.
    fn check(
        &self,
        spec: &ExecutorSpec,
        backend_id: &str,
    ) -> impl Future<Output = Result<ExecutorResponse, ExecutorError>> + Send;

    /// Convert an inbound callback into the same response shape as `check`.
    fn handle_webhook(
        &self,
        spec: &ExecutorSpec,
        payload: &Value,
    ) -> impl Future<Output = Result<ExecutorResponse, ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// Binding and signing ports
// ---------------------------------------------------------------------------

/// Errors from the binding provider.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("binding source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the already-resolved inputs/secrets maps for an execution.
///
/// How values were fetched or decrypted is entirely the provider's concern.
pub trait BindingProvider: Send + Sync {
    fn bindings_for(
        &self,
        execution: &Execution,
    ) -> impl Future<Output = Result<Bindings, BindingError>> + Send;
}

/// Mints the execution-scoped bearer token. The signing scheme lives behind
/// this port.
pub trait TokenSigner: Send + Sync {
    fn token_for(&self, execution_id: &Uuid) -> String;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
