//! Memory-strictly execution: whole result sets are buffered and every
//! channel is back in its pool before `execute` returns.

use super::{fan_out, EngineContext, ExecuteEngine, ExecutionRequest, ExecutionResult};
use super::{ProxyMode, Retention, StatementKind};
use crate::error::Result;
use crate::types::Value;
use async_trait::async_trait;

/// Buffers text query results and releases channels immediately
#[derive(Debug, Clone)]
pub struct TextMemoryStrictlyEngine {
    context: EngineContext,
}

impl TextMemoryStrictlyEngine {
    /// Create an engine over `context`
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ExecuteEngine for TextMemoryStrictlyEngine {
    fn mode(&self) -> ProxyMode {
        ProxyMode::MemoryStrictly
    }

    fn statement_kind(&self) -> StatementKind {
        StatementKind::Text
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        request.expect_kind(StatementKind::Text)?;
        Ok(fan_out(
            &self.context,
            request,
            None,
            Retention::Buffer,
            ProxyMode::MemoryStrictly,
        )
        .await)
    }
}

/// Buffers prepared statement results and releases channels immediately
#[derive(Debug, Clone)]
pub struct StatementMemoryStrictlyEngine {
    context: EngineContext,
    parameters: Vec<Value>,
}

impl StatementMemoryStrictlyEngine {
    /// Create an engine binding `parameters`
    pub fn new(context: EngineContext, parameters: Vec<Value>) -> Self {
        Self {
            context,
            parameters,
        }
    }
}

#[async_trait]
impl ExecuteEngine for StatementMemoryStrictlyEngine {
    fn mode(&self) -> ProxyMode {
        ProxyMode::MemoryStrictly
    }

    fn statement_kind(&self) -> StatementKind {
        StatementKind::Prepared
    }

    fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        request.expect_kind(StatementKind::Prepared)?;
        let parameters = request.bind_parameters(&self.parameters)?;
        Ok(fan_out(
            &self.context,
            request,
            Some(parameters),
            Retention::Buffer,
            ProxyMode::MemoryStrictly,
        )
        .await)
    }
}
