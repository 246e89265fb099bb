//! The closed backend set.
//!
//! `BackendExecutor` implements the core `Executor` contract by matching
//! the spec variant exhaustively -- there is no string-keyed registry. One
//! value is built at startup (with the CI client configuration) and shared
//! by every dispatcher and worker.

pub mod ci;
pub mod http;
pub mod noop;

use serde_json::Value;
use skein_core::executor::{
    ExecutionParameters, Executor, ExecutorError, ExecutorResponse, ValidationError, validate_spec,
};
use skein_types::spec::ExecutorSpec;

pub use ci::{CiConfig, CiExecutor};
pub use http::HttpExecutor;
pub use noop::NoOpExecutor;

/// The full backend set behind one `Executor` implementation.
pub struct BackendExecutor {
    noop: NoOpExecutor,
    http: HttpExecutor,
    ci: CiExecutor,
}

impl BackendExecutor {
    pub fn new(http: HttpExecutor, ci: CiExecutor) -> Self {
        Self {
            noop: NoOpExecutor,
            http,
            ci,
        }
    }
}

impl Executor for BackendExecutor {
    fn validate(&self, spec: &ExecutorSpec) -> Result<(), ValidationError> {
        validate_spec(spec)
    }

    async fn execute(
        &self,
        spec: &ExecutorSpec,
        params: &ExecutionParameters,
    ) -> Result<ExecutorResponse, ExecutorError> {
        match spec {
            ExecutorSpec::NoOp {} => self.noop.execute(params),
            ExecutorSpec::Http {
                url,
                payload,
                headers,
                response_policy,
            } => {
                self.http
                    .execute(url, payload, headers, response_policy, params)
                    .await
            }
            ExecutorSpec::CiTask { .. } | ExecutorSpec::CiWorkflow { .. } => {
                self.ci.execute(spec, params).await
            }
        }
    }

    async fn check(
        &self,
        spec: &ExecutorSpec,
        backend_id: &str,
    ) -> Result<ExecutorResponse, ExecutorError> {
        match spec {
            ExecutorSpec::NoOp {} => Err(ExecutorError::Unsupported("no_op")),
            ExecutorSpec::Http { .. } => Err(ExecutorError::Unsupported("http")),
            ExecutorSpec::CiTask { .. } | ExecutorSpec::CiWorkflow { .. } => {
                self.ci.check(backend_id).await
            }
        }
    }

    async fn handle_webhook(
        &self,
        spec: &ExecutorSpec,
        payload: &Value,
    ) -> Result<ExecutorResponse, ExecutorError> {
        match spec {
            ExecutorSpec::NoOp {} => Err(ExecutorError::Unsupported("no_op")),
            ExecutorSpec::Http { .. } => Err(ExecutorError::Unsupported("http")),
            ExecutorSpec::CiTask { .. } | ExecutorSpec::CiWorkflow { .. } => {
                self.ci.handle_webhook(payload)
            }
        }
    }
}
