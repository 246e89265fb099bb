//! Input/secret binding provider.
//!
//! Supplies the already-resolved `inputs`/`secrets` maps the expression
//! resolver consumes. Values are layered in priority order: environment
//! variables (with a configurable prefix) override statically configured
//! secrets, so deployments can rotate a secret without touching config.

use std::collections::HashMap;

use serde_json::Value;
use skein_core::executor::{BindingError, BindingProvider};
use skein_core::expression::Bindings;
use skein_types::execution::Execution;

/// Default prefix for environment-sourced secrets.
pub const DEFAULT_SECRET_ENV_PREFIX: &str = "SKEIN_SECRET_";

/// Config-backed binding provider with env-var secret overrides.
pub struct ConfigBindingProvider {
    inputs: HashMap<String, Value>,
    secrets: HashMap<String, Value>,
    env_prefix: Option<String>,
}

impl ConfigBindingProvider {
    pub fn new(inputs: HashMap<String, Value>, secrets: HashMap<String, Value>) -> Self {
        Self {
            inputs,
            secrets,
            env_prefix: Some(DEFAULT_SECRET_ENV_PREFIX.to_string()),
        }
    }

    /// Override (or disable, with `None`) the env-var secret prefix.
    pub fn with_env_prefix(mut self, prefix: Option<String>) -> Self {
        self.env_prefix = prefix;
        self
    }
}

impl BindingProvider for ConfigBindingProvider {
    async fn bindings_for(&self, _execution: &Execution) -> Result<Bindings, BindingError> {
        let mut secrets = self.secrets.clone();
        if let Some(prefix) = &self.env_prefix {
            for (key, value) in std::env::vars() {
                if let Some(name) = key.strip_prefix(prefix.as_str()) {
                    secrets.insert(name.to_string(), Value::String(value));
                }
            }
        }
        Ok(Bindings {
            inputs: self.inputs.clone(),
            secrets,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_types::node::NodeConfiguration;
    use skein_types::spec::ExecutorSpec;
    use uuid::Uuid;

    fn execution() -> Execution {
        Execution::pending(
            Uuid::now_v7(),
            NodeConfiguration::Component {
                spec: ExecutorSpec::NoOp {},
            },
            Uuid::now_v7(),
            Uuid::now_v7(),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn static_maps_pass_through() {
        let provider = ConfigBindingProvider::new(
            HashMap::from([("ENVIRONMENT".to_string(), json!("staging"))]),
            HashMap::from([("API_KEY".to_string(), json!("k"))]),
        )
        .with_env_prefix(None);

        let bindings = provider.bindings_for(&execution()).await.unwrap();
        assert_eq!(bindings.inputs["ENVIRONMENT"], json!("staging"));
        assert_eq!(bindings.secrets["API_KEY"], json!("k"));
    }

    #[tokio::test]
    async fn env_secrets_override_static_ones() {
        // Process-global env var; prefix is unique to this test.
        unsafe { std::env::set_var("SKEIN_TEST_BINDING_API_KEY", "from-env") };
        let provider = ConfigBindingProvider::new(
            HashMap::new(),
            HashMap::from([("API_KEY".to_string(), json!("from-config"))]),
        )
        .with_env_prefix(Some("SKEIN_TEST_BINDING_".to_string()));

        let bindings = provider.bindings_for(&execution()).await.unwrap();
        assert_eq!(bindings.secrets["API_KEY"], json!("from-env"));
        unsafe { std::env::remove_var("SKEIN_TEST_BINDING_API_KEY") };
    }
}
