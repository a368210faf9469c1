//! RPC function registry: method name → handler.
//!
//! Filled once at startup, then shared read-only by every connection.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::connection::MessageOrigin;
use crate::protocol::SET_LOG_POSITION;
use crate::replay;

/// Outcome of a handler: the `result` value or the failure placed in the reply's `error`.
pub type RpcResult = Result<Value, RpcError>;

/// Handler invoked with the message origin and its `params` (`null` when absent).
pub type RpcHandler = Arc<dyn Fn(&MessageOrigin, &Value) -> RpcResult + Send + Sync>;

/// Failure of a single RPC call. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("Function '{0}' does not exist.")]
    UnknownFunction(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Function '{0}' panicked.")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("RPC function '{0}' is already registered")]
    DuplicateFunction(String),
}

#[derive(Clone, Default)]
pub struct RpcFunctionRegistry {
    functions: HashMap<String, RpcHandler>,
}

impl RpcFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the functions the connection engine serves itself.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .functions
            .insert(SET_LOG_POSITION.to_owned(), Arc::new(replay::set_log_position));
        registry
    }

    /// Add a handler. Names are exact-match and case-sensitive; registering a name twice
    /// is a startup error.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&MessageOrigin, &Value) -> RpcResult + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(RegistryError::DuplicateFunction(name));
        }
        self.functions.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&RpcHandler> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolve and call `name`. Unknown names and panicking handlers become `RpcError`s.
    pub fn invoke(&self, name: &str, origin: &MessageOrigin, params: &Value) -> RpcResult {
        let handler = self
            .lookup(name)
            .ok_or_else(|| RpcError::UnknownFunction(name.to_owned()))?;
        catch_unwind(AssertUnwindSafe(|| handler(origin, params)))
            .unwrap_or_else(|_| Err(RpcError::Panicked(name.to_owned())))
    }
}

impl fmt::Debug for RpcFunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RpcFunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}
