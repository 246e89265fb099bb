//! The remote-CI executor.
//!
//! One executor serves both CI spec variants (single task and full
//! pipeline file): it creates a remote run with the standard correlation
//! parameters injected alongside the user's, then completes asynchronously
//! through polling (`check`) or an inbound webhook. Both paths produce the
//! same response shape: the run is finished when the reported state is
//! "done", successful when the result is "passed".

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value, json};
use skein_core::executor::{ExecutionParameters, ExecutorError, ExecutorResponse};
use skein_types::spec::ExecutorSpec;

/// Remote pipeline state that marks a run finished.
const STATE_DONE: &str = "done";
/// Remote result that marks a finished run successful.
const RESULT_PASSED: &str = "passed";

/// Connection settings for the remote CI server.
#[derive(Debug, Clone)]
pub struct CiConfig {
    /// Base URL, e.g. `https://ci.example.com`.
    pub base_url: String,
    /// API token for the CI server itself (not the execution token).
    pub api_token: String,
}

pub struct CiExecutor {
    client: reqwest::Client,
    config: CiConfig,
}

impl CiExecutor {
    pub fn new(config: CiConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Create the remote run. Returns an unfinished response carrying the
    /// backend-assigned run id for later `check` calls.
    pub async fn execute(
        &self,
        spec: &ExecutorSpec,
        params: &ExecutionParameters,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let body = create_run_body(spec, params)?;
        let url = format!("{}/api/v1/pipelines", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutorError::Backend(format!("ci request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Backend(format!(
                "ci run creation failed with status {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::Backend(format!("invalid ci response: {e}")))?;
        let run_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Backend("ci response carried no run id".to_string()))?;

        tracing::info!(
            execution_id = %params.execution_id,
            run_id,
            "ci run created"
        );
        Ok(ExecutorResponse::in_progress(run_id))
    }

    /// Poll a run by its backend id.
    ///
    /// A 404 right after creation is transient (the run is not registered
    /// yet); the reconciler retries it next pass.
    pub async fn check(&self, backend_id: &str) -> Result<ExecutorResponse, ExecutorError> {
        let url = format!("{}/api/v1/pipelines/{backend_id}", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| ExecutorError::Backend(format!("ci check failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExecutorError::Transient("pipeline not found yet".to_string()));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Backend(format!(
                "ci check failed with status {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::Backend(format!("invalid ci response: {e}")))?;
        Ok(pipeline_response(&body, backend_id))
    }

    /// Convert an inbound callback into the same shape `check` produces.
    pub fn handle_webhook(&self, payload: &Value) -> Result<ExecutorResponse, ExecutorError> {
        let pipeline = payload.get("pipeline").unwrap_or(payload);
        let backend_id = pipeline
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::MalformedWebhook("missing pipeline id".to_string()))?;
        if pipeline.get("state").and_then(Value::as_str).is_none() {
            return Err(ExecutorError::MalformedWebhook(
                "missing pipeline state".to_string(),
            ));
        }
        Ok(pipeline_response(pipeline, backend_id))
    }
}

/// The run-creation body: branch, target, and parameters with the standard
/// correlation entries injected alongside the user's.
fn create_run_body(
    spec: &ExecutorSpec,
    params: &ExecutionParameters,
) -> Result<Map<String, Value>, ExecutorError> {
    let (branch, target_key, target, user_parameters) = match spec {
        ExecutorSpec::CiTask {
            branch,
            task,
            parameters,
        } => (branch, "task", task, parameters),
        ExecutorSpec::CiWorkflow {
            branch,
            pipeline_file,
            parameters,
        } => (branch, "pipeline_file", pipeline_file, parameters),
        other => {
            return Err(ExecutorError::Unsupported(match other {
                ExecutorSpec::NoOp {} => "no_op",
                _ => "http",
            }));
        }
    };

    let mut parameters: HashMap<String, String> = user_parameters.clone();
    parameters.insert("node_id".to_string(), params.node_id.to_string());
    parameters.insert("execution_id".to_string(), params.execution_id.to_string());
    parameters.insert("execution_token".to_string(), params.token.clone());

    let mut body = Map::new();
    body.insert("branch".to_string(), json!(branch));
    body.insert(target_key.to_string(), json!(target));
    body.insert("parameters".to_string(), json!(parameters));
    Ok(body)
}

/// Map a reported pipeline document onto the response contract.
fn pipeline_response(pipeline: &Value, backend_id: &str) -> ExecutorResponse {
    let state = pipeline.get("state").and_then(Value::as_str).unwrap_or("");
    if state != STATE_DONE {
        return ExecutorResponse {
            finished: false,
            successful: false,
            outputs: Map::new(),
            backend_id: Some(backend_id.to_string()),
        };
    }

    let successful = pipeline
        .get("result")
        .and_then(Value::as_str)
        .is_some_and(|result| result == RESULT_PASSED);
    let outputs = pipeline
        .get("outputs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    ExecutorResponse {
        finished: true,
        successful,
        outputs,
        backend_id: Some(backend_id.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn params() -> ExecutionParameters {
        ExecutionParameters {
            execution_id: Uuid::now_v7(),
            node_id: Uuid::now_v7(),
            token: "exec-token".to_string(),
        }
    }

    fn executor() -> CiExecutor {
        CiExecutor::new(CiConfig {
            base_url: "https://ci.example.com".to_string(),
            api_token: "api-token".to_string(),
        })
    }

    #[test]
    fn run_body_injects_correlation_parameters() {
        let params = params();
        let spec = ExecutorSpec::CiWorkflow {
            branch: "main".to_string(),
            pipeline_file: ".ci/deploy.yml".to_string(),
            parameters: HashMap::from([("TARGET".to_string(), "staging".to_string())]),
        };

        let body = create_run_body(&spec, &params).unwrap();
        assert_eq!(body["branch"], json!("main"));
        assert_eq!(body["pipeline_file"], json!(".ci/deploy.yml"));

        let parameters = body["parameters"].as_object().unwrap();
        assert_eq!(parameters["TARGET"], json!("staging"));
        assert_eq!(
            parameters["execution_id"],
            json!(params.execution_id.to_string())
        );
        assert_eq!(parameters["node_id"], json!(params.node_id.to_string()));
        assert_eq!(parameters["execution_token"], json!("exec-token"));
    }

    #[test]
    fn task_body_uses_task_key() {
        let spec = ExecutorSpec::CiTask {
            branch: "main".to_string(),
            task: "unit-tests".to_string(),
            parameters: HashMap::new(),
        };
        let body = create_run_body(&spec, &params()).unwrap();
        assert_eq!(body["task"], json!("unit-tests"));
        assert!(!body.contains_key("pipeline_file"));
    }

    #[test]
    fn running_pipeline_is_unfinished() {
        let response = pipeline_response(&json!({"state": "running"}), "run-1");
        assert!(!response.finished);
        assert_eq!(response.backend_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn done_passed_pipeline_is_successful() {
        let response = pipeline_response(
            &json!({"state": "done", "result": "passed", "outputs": {"coverage": "97%"}}),
            "run-1",
        );
        assert!(response.finished);
        assert!(response.successful);
        assert_eq!(response.outputs.get("coverage"), Some(&json!("97%")));
    }

    #[test]
    fn done_failed_pipeline_is_unsuccessful() {
        let response = pipeline_response(&json!({"state": "done", "result": "failed"}), "run-1");
        assert!(response.finished);
        assert!(!response.successful);
    }

    #[test]
    fn webhook_accepts_nested_and_flat_payloads() {
        let executor = executor();

        let nested = json!({"pipeline": {"id": "run-7", "state": "done", "result": "passed"}});
        let response = executor.handle_webhook(&nested).unwrap();
        assert!(response.finished && response.successful);
        assert_eq!(response.backend_id.as_deref(), Some("run-7"));

        let flat = json!({"id": "run-8", "state": "running"});
        let response = executor.handle_webhook(&flat).unwrap();
        assert!(!response.finished);
    }

    #[test]
    fn webhook_without_id_or_state_is_malformed() {
        let executor = executor();
        assert!(matches!(
            executor.handle_webhook(&json!({"state": "done"})),
            Err(ExecutorError::MalformedWebhook(_))
        ));
        assert!(matches!(
            executor.handle_webhook(&json!({"id": "run-9"})),
            Err(ExecutorError::MalformedWebhook(_))
        ));
    }
}
