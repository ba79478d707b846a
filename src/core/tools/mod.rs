pub mod policy;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use crate::core::llm::{ToolCall, ToolSchema};

/// Typed rejection at the tool boundary. Never escapes to the job level:
/// every variant serializes to a `{ok:false,...}` wire string the model can
/// read and react to within the same turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' is not permitted for this agent")]
    Unauthorized(String),
    #[error("unknown tool '{0}'")]
    Unknown(String),
    #[error("invalid arguments for '{0}': {1}")]
    InvalidArguments(String, String),
    #[error("tool '{0}' failed: {1}")]
    Failed(String, String),
}

impl ToolError {
    fn detail(&self) -> &'static str {
        match self {
            ToolError::Unauthorized(_) => "unauthorized",
            ToolError::Unknown(_) => "unknown_tool",
            ToolError::InvalidArguments(_, _) => "invalid_arguments",
            ToolError::Failed(_, _) => "tool_failed",
        }
    }
}

/// Job-scoped identity handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub job_id: String,
    pub user_id: String,
    pub agent_id: String,
}

/// Executes a sandboxed effect. Implementations are supplied by the host;
/// the engine owns only the policy of which tools a job may call.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<serde_json::Value, ToolError>;

    /// Schema for a tool, if the runner can describe it. Tools without one
    /// are advertised with an opaque object schema.
    fn schema(&self, _name: &str) -> Option<ToolSchema> {
        None
    }
}

/// Serialize a tool outcome to the wire string fed back into the
/// conversation. Success merges `{ok:true}` into object results; failure is
/// `{ok:false, error, detail}`.
pub fn wire_result(result: Result<serde_json::Value, ToolError>) -> String {
    match result {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("ok".to_string(), serde_json::Value::Bool(true));
            serde_json::Value::Object(map).to_string()
        }
        Ok(value) => json!({ "ok": true, "result": value }).to_string(),
        Err(err) => json!({
            "ok": false,
            "error": err.to_string(),
            "detail": err.detail(),
        })
        .to_string(),
    }
}

/// Wraps a host runner with the per-job allowed set resolved by
/// [`policy::resolve_tools`]. Calls outside the set are rejected before the
/// inner runner sees them.
pub struct SandboxedRunner {
    inner: Arc<dyn ToolRunner>,
    allowed: BTreeSet<String>,
}

impl SandboxedRunner {
    pub fn new(inner: Arc<dyn ToolRunner>, allowed: BTreeSet<String>) -> Self {
        Self { inner, allowed }
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.allowed
            .iter()
            .map(|name| {
                self.inner
                    .schema(name)
                    .unwrap_or_else(|| ToolSchema::opaque(name))
            })
            .collect()
    }
}

#[async_trait]
impl ToolRunner for SandboxedRunner {
    async fn run(&self, call: &ToolCall, ctx: &ToolContext) -> Result<serde_json::Value, ToolError> {
        if !self.allowed.contains(&call.name) {
            return Err(ToolError::Unauthorized(call.name.clone()));
        }
        self.inner.run(call, ctx).await
    }

    fn schema(&self, name: &str) -> Option<ToolSchema> {
        self.inner.schema(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner;

    #[async_trait]
    impl ToolRunner for EchoRunner {
        async fn run(
            &self,
            call: &ToolCall,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            let args: serde_json::Value = serde_json::from_str(&call.arguments)
                .map_err(|e| ToolError::InvalidArguments(call.name.clone(), e.to_string()))?;
            Ok(json!({ "echo": args }))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            job_id: "job-1".to_string(),
            user_id: "user-1".to_string(),
            agent_id: "agent-1".to_string(),
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn wire_result_merges_ok_into_object() {
        let out = wire_result(Ok(json!({ "value": 7 })));
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["value"], 7);
    }

    #[test]
    fn wire_result_wraps_non_object_values() {
        let out = wire_result(Ok(json!("plain")));
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["result"], "plain");
    }

    #[test]
    fn wire_result_encodes_failure_with_detail() {
        let out = wire_result(Err(ToolError::Unauthorized("shell".to_string())));
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["detail"], "unauthorized");
        assert!(parsed["error"].as_str().unwrap().contains("shell"));
    }

    #[tokio::test]
    async fn sandbox_rejects_tools_outside_the_set() {
        let allowed: BTreeSet<String> = ["echo".to_string()].into_iter().collect();
        let sandbox = SandboxedRunner::new(Arc::new(EchoRunner), allowed);

        let denied = sandbox.run(&call("shell", "{}"), &ctx()).await;
        assert!(matches!(denied, Err(ToolError::Unauthorized(_))));

        let ok = sandbox.run(&call("echo", r#"{"x":1}"#), &ctx()).await.unwrap();
        assert_eq!(ok["echo"]["x"], 1);
    }

    #[test]
    fn sandbox_advertises_opaque_schema_for_undescribed_tools() {
        let allowed: BTreeSet<String> = ["echo".to_string()].into_iter().collect();
        let sandbox = SandboxedRunner::new(Arc::new(EchoRunner), allowed);
        let schemas = sandbox.schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
        assert_eq!(schemas[0].parameters["type"], "object");
    }
}
