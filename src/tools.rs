//! Tool definition and execution for function calling.
//!
//! A [`Tool`] bundles a wire declaration (name, description, parameter
//! schema) with an async handler. The [`ToolRegistry`] maps unique names to
//! tools and drives execution for a batch of model-issued function calls:
//! unknown names and handler failures are captured as error results rather
//! than aborting the batch, and every call runs under a timeout.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use gemini_client::{tool, ToolRegistry};
//! use serde_json::json;
//!
//! let get_time = tool("get_time", "Current wall-clock time")
//!     .build(|_args| async move { Ok(json!({"now": "2024-01-01T00:00:00Z"})) });
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(get_time);
//! assert!(registry.get("get_time").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;

use crate::types::{FunctionCall, FunctionDeclaration, FunctionResponse, Part, ToolSpec};
use crate::{Error, Result};

/// Type alias for tool handler functions.
///
/// Handlers take the call's JSON arguments and return a JSON result. The
/// pinned, boxed future erases the concrete async type so handlers of any
/// shape can live in one registry; `Arc` makes them cheap to share across
/// tasks.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// A callable tool: wire declaration plus handler.
///
/// Tools are immutable once built; clones share the handler.
#[derive(Clone)]
pub struct Tool {
    /// Unique function name (snake_case by convention).
    pub name: String,
    /// Description the model uses to decide when to call this tool.
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Option<Value>,
    handler: ToolHandler,
}

impl Tool {
    /// Creates a tool from its parts.
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Option<Value>,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }

    /// Wire declaration for this tool.
    pub fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Runs the handler with the given arguments.
    pub async fn execute(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Builder for tools with incremental parameter declarations.
///
/// Parameters declared via [`ToolBuilder::param`] become a flat JSON Schema
/// object; use [`ToolBuilder::schema`] to supply a full schema instead.
pub struct ToolBuilder {
    name: String,
    description: String,
    properties: serde_json::Map<String, Value>,
    required: Vec<String>,
    schema: Option<Value>,
}

/// Starts building a tool.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        properties: serde_json::Map::new(),
        required: Vec::new(),
        schema: None,
    }
}

impl ToolBuilder {
    /// Declares a required parameter with a simple type name
    /// (`string`, `number`, `integer`, `boolean`).
    pub fn param(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let name = name.into();
        self.properties
            .insert(name.clone(), json!({"type": type_name.into()}));
        self.required.push(name);
        self
    }

    /// Declares an optional parameter.
    pub fn optional_param(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        self.properties
            .insert(name.into(), json!({"type": type_name.into()}));
        self
    }

    /// Replaces the parameter schema wholesale.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Finishes the tool with its handler.
    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let parameters = match self.schema {
            Some(schema) => Some(schema),
            None if self.properties.is_empty() => None,
            None => Some(json!({
                "type": "object",
                "properties": Value::Object(self.properties),
                "required": self.required,
            })),
        };
        Tool::new(self.name, self.description, parameters, move |args| {
            Box::pin(handler(args))
        })
    }
}

/// Outcome of one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    /// Correlation id from the originating call, when present.
    pub call_id: Option<String>,
    /// Function name.
    pub name: String,
    /// Result payload; an `{"error": ...}` object when `is_error` is set.
    pub response: Value,
    /// Whether the handler failed, timed out, or was unknown.
    pub is_error: bool,
}

impl ToolExecutionResult {
    /// Converts to the wire response echoed back to the model.
    pub fn to_function_response(&self) -> FunctionResponse {
        FunctionResponse {
            id: self.call_id.clone(),
            name: self.name.clone(),
            response: self.response.clone(),
        }
    }

    /// Converts to a content part.
    pub fn to_part(&self) -> Part {
        Part::function_response(self.to_function_response())
    }
}

/// Map from function name to tool, with an execution driver.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<Tool>>,
    execution_timeout: Duration,
}

impl ToolRegistry {
    /// Creates an empty registry with the default 30 s per-call timeout.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            execution_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-call execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Registers a tool. Re-registering a name replaces the prior handler.
    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Tool>> {
        self.tools.get(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Wire declarations for every registered tool, for request bodies.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        let mut declarations: Vec<_> =
            self.tools.values().map(|tool| tool.declaration()).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }

    /// The registry as a single tool spec, or `None` when empty.
    pub fn to_tool_spec(&self) -> Option<ToolSpec> {
        if self.tools.is_empty() {
            None
        } else {
            Some(ToolSpec::FunctionDeclarations(self.declarations()))
        }
    }

    /// Executes a batch of calls sequentially, in order.
    ///
    /// Per-call failures (unknown name, handler error, timeout) become
    /// error results; the batch always completes with one result per call.
    pub async fn execute_calls(&self, calls: &[FunctionCall]) -> Vec<ToolExecutionResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(call).await);
        }
        results
    }

    /// Executes a batch of calls concurrently. Results keep call order.
    pub async fn execute_calls_parallel(
        &self,
        calls: &[FunctionCall],
    ) -> Vec<ToolExecutionResult> {
        futures::future::join_all(calls.iter().map(|call| self.execute_call(call))).await
    }

    async fn execute_call(&self, call: &FunctionCall) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(name = %call.name, "function call for unregistered tool");
            return error_result(call, format!("unknown tool '{}'", call.name));
        };
        let execution = tool.execute(call.args.clone());
        match tokio::time::timeout(self.execution_timeout, execution).await {
            Ok(Ok(response)) => ToolExecutionResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                response,
                is_error: false,
            },
            Ok(Err(err)) => error_result(call, err.to_string()),
            Err(_) => error_result(
                call,
                format!("execution exceeded {:?}", self.execution_timeout),
            ),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

fn error_result(call: &FunctionCall, message: String) -> ToolExecutionResult {
    ToolExecutionResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        response: json!({"error": message}),
        is_error: true,
    }
}
