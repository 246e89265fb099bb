//! Executor specs: the declarative "what to run" attached to component nodes.
//!
//! `ExecutorSpec` is a closed tagged union with one variant per known backend,
//! matched exhaustively by the executor layer. Spec documents may embed
//! `${{ inputs.X }}` / `${{ secrets.X }}` expressions anywhere in their string
//! leaves; those are resolved per execution, never at configuration time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ResponsePolicy
// ---------------------------------------------------------------------------

/// What an HTTP backend response must look like to count as success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponsePolicy {
    /// HTTP status codes accepted as success.
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
}

fn default_status_codes() -> Vec<u16> {
    vec![200]
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            status_codes: default_status_codes(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorSpec
// ---------------------------------------------------------------------------

/// Backend-specific execution spec.
///
/// Internally tagged by `type` to match the canvas document structure:
/// ```yaml
/// spec:
///   type: http
///   url: https://example.com/deploy
///   payload:
///     environment: "${{ inputs.ENVIRONMENT }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Do nothing; completes immediately with success.
    NoOp {},
    /// POST a JSON document to a URL and judge success by status code.
    Http {
        url: String,
        #[serde(default)]
        payload: Map<String, Value>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        response_policy: ResponsePolicy,
    },
    /// Run a single task on the remote CI system.
    CiTask {
        branch: String,
        task: String,
        #[serde(default)]
        parameters: HashMap<String, String>,
    },
    /// Run a full pipeline file on the remote CI system.
    CiWorkflow {
        branch: String,
        pipeline_file: String,
        #[serde(default)]
        parameters: HashMap<String, String>,
    },
}

impl ExecutorSpec {
    /// Stable backend name, used for logging and display.
    pub fn backend_name(&self) -> &'static str {
        match self {
            ExecutorSpec::NoOp {} => "no_op",
            ExecutorSpec::Http { .. } => "http",
            ExecutorSpec::CiTask { .. } => "ci_task",
            ExecutorSpec::CiWorkflow { .. } => "ci_workflow",
        }
    }

    /// Whether this backend proxies a long-running remote job.
    ///
    /// Async backends return unfinished responses from `execute` and complete
    /// later through polling or a webhook.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            ExecutorSpec::CiTask { .. } | ExecutorSpec::CiWorkflow { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
