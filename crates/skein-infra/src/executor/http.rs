//! The HTTP executor: POST a JSON document, judge success by status code.
//!
//! Wire contract: the body carries the execution correlation fields merged
//! with the spec payload, the execution token rides in an
//! `X-Execution-Token` header (so the remote side can call back with proof
//! of which execution it is completing), success iff the response status is
//! in the spec's response policy (default `[200]`), and a top-level
//! `outputs` object in the JSON response body becomes the execution's
//! outputs.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value, json};
use skein_core::executor::{ExecutionParameters, ExecutorError, ExecutorResponse};
use skein_types::spec::ResponsePolicy;

/// Header carrying the execution-scoped bearer token.
pub const EXECUTION_TOKEN_HEADER: &str = "X-Execution-Token";

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn execute(
        &self,
        url: &str,
        payload: &Map<String, Value>,
        headers: &HashMap<String, String>,
        policy: &ResponsePolicy,
        params: &ExecutionParameters,
    ) -> Result<ExecutorResponse, ExecutorError> {
        let body = build_body(payload, params);

        let mut request = self
            .client
            .post(url)
            .header(EXECUTION_TOKEN_HEADER, &params.token)
            .json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecutorError::Backend(format!("http request failed: {e}")))?;

        let status = response.status().as_u16();
        if !policy.status_codes.contains(&status) {
            return Err(ExecutorError::Backend(format!(
                "status code {status} not in allowed codes"
            )));
        }

        let outputs = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("outputs")?.as_object().cloned())
            .unwrap_or_default();

        tracing::debug!(
            execution_id = %params.execution_id,
            status,
            outputs = outputs.len(),
            "http execution finished"
        );
        Ok(ExecutorResponse::completed(true, outputs))
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// The outgoing JSON body: correlation fields plus the spec payload.
fn build_body(payload: &Map<String, Value>, params: &ExecutionParameters) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("node_id".to_string(), json!(params.node_id.to_string()));
    body.insert(
        "execution_id".to_string(),
        json!(params.execution_id.to_string()),
    );
    for (key, value) in payload {
        body.insert(key.clone(), value.clone());
    }
    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
