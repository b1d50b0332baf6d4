//! Engine selection from the process-wide proxy mode

use super::memory::{StatementMemoryStrictlyEngine, TextMemoryStrictlyEngine};
use super::stream::{StatementConnectionStrictlyEngine, TextConnectionStrictlyEngine};
use super::{EngineContext, ExecuteEngine, ExecutionRequest, ProxyMode, StatementKind};
use crate::error::{Error, Result};
use crate::types::Value;

/// Picks the engine variant for a statement
#[derive(Debug, Clone)]
pub struct ExecuteEngineFactory {
    mode: Option<ProxyMode>,
    context: EngineContext,
}

impl ExecuteEngineFactory {
    /// Factory for `mode`; an unset mode fails every `create` call
    pub fn new(mode: Option<ProxyMode>, context: EngineContext) -> Self {
        Self { mode, context }
    }

    /// Configured proxy mode
    pub fn mode(&self) -> Result<ProxyMode> {
        self.mode
            .ok_or_else(|| Error::config("proxy mode is not configured"))
    }

    /// Shared engine context
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Engine for text statements
    pub fn create_text_protocol_instance(&self) -> Result<Box<dyn ExecuteEngine>> {
        let context = self.context.clone();
        Ok(match self.mode()? {
            ProxyMode::MemoryStrictly => Box::new(TextMemoryStrictlyEngine::new(context)),
            ProxyMode::ConnectionStrictly => Box::new(TextConnectionStrictlyEngine::new(context)),
        })
    }

    /// Engine for prepared statements, binding `parameters`
    pub fn create_statement_protocol_instance(
        &self,
        parameters: Vec<Value>,
    ) -> Result<Box<dyn ExecuteEngine>> {
        let context = self.context.clone();
        Ok(match self.mode()? {
            ProxyMode::MemoryStrictly => {
                Box::new(StatementMemoryStrictlyEngine::new(context, parameters))
            }
            ProxyMode::ConnectionStrictly => {
                Box::new(StatementConnectionStrictlyEngine::new(context, parameters))
            }
        })
    }

    /// Engine matching the request's statement kind
    pub fn create(&self, request: &ExecutionRequest) -> Result<Box<dyn ExecuteEngine>> {
        match request.kind() {
            StatementKind::Text => self.create_text_protocol_instance(),
            StatementKind::Prepared => {
                self.create_statement_protocol_instance(request.parameters().to_vec())
            }
        }
    }
}
