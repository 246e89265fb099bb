//! The no-op executor: completes immediately with success.

use serde_json::Map;
use skein_core::executor::{ExecutionParameters, ExecutorError, ExecutorResponse};

pub struct NoOpExecutor;

impl NoOpExecutor {
    pub fn execute(
        &self,
        params: &ExecutionParameters,
    ) -> Result<ExecutorResponse, ExecutorError> {
        tracing::debug!(execution_id = %params.execution_id, "no-op execution");
        Ok(ExecutorResponse::completed(true, Map::new()))
    }
}
