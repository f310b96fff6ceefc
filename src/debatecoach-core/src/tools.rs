//! Tool registry for model-invoked function calls.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Callback invoked when the model calls a registered tool.
///
/// Receives the parsed arguments and returns a JSON result, or an error
/// message that is relayed to the model.
pub type ToolCallback = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Declaration of a tool, sent to the model in the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Tools the debate opponent may call.
pub fn debate_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::function(
            "end_debate",
            "End the debate when time is up or the conversation has reached a natural conclusion",
            json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the debate is ending, e.g. 'time_up', 'natural_conclusion', 'user_conceded'"
                    },
                    "explanation": {
                        "type": "string",
                        "description": "A brief explanation of why the debate is ending"
                    }
                },
                "required": ["reason"]
            }),
        ),
        ToolDefinition::function(
            "time_warning",
            "Issue a warning that time is running out for the debate",
            json!({
                "type": "object",
                "properties": {
                    "remaining_seconds": {
                        "type": "number",
                        "description": "Approximate number of seconds remaining in the debate"
                    },
                    "message": {
                        "type": "string",
                        "description": "Custom warning message to display to the user"
                    }
                },
                "required": ["remaining_seconds"]
            }),
        ),
    ]
}

/// Mapping from tool name to callback.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    callbacks: HashMap<String, ToolCallback>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the callback for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the callback for `name`.
    ///
    /// Every failure mode, including a panicking callback, comes back as
    /// an error payload of the form `{"error": "..."}`.
    pub fn invoke(&self, name: &str, arguments: Value) -> Result<Value, Value> {
        let Some(callback) = self.callbacks.get(name) else {
            return Err(json!({ "error": format!("Function {} not found", name) }));
        };

        match catch_unwind(AssertUnwindSafe(|| callback(arguments))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(json!({
                "error": format!("Error executing function: {}", message)
            })),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                Err(json!({
                    "error": format!("Error executing function: {}", message)
                }))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register("echo", |args| Ok(json!({ "echo": args })));

        let result = registry.invoke("echo", json!({"a": 1})).unwrap();
        assert_eq!(result, json!({"echo": {"a": 1}}));
    }

    #[test]
    fn test_invoke_unknown_tool_is_error_payload() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("foo", json!({})).unwrap_err();
        assert_eq!(err["error"], "Function foo not found");
    }

    #[test]
    fn test_callback_error_is_wrapped() {
        let mut registry = ToolRegistry::new();
        registry.register("fail", |_| Err("boom".to_string()));

        let err = registry.invoke("fail", json!({})).unwrap_err();
        assert_eq!(err["error"], "Error executing function: boom");
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register("explode", |_| panic!("kaboom"));

        let err = registry.invoke("explode", json!({})).unwrap_err();
        assert_eq!(err["error"], "Error executing function: kaboom");
    }

    #[test]
    fn test_register_overwrites() {
        let mut registry = ToolRegistry::new();
        registry.register("t", |_| Ok(json!(1)));
        registry.register("t", |_| Ok(json!(2)));
        assert_eq!(registry.invoke("t", Value::Null).unwrap(), json!(2));
        assert_eq!(registry.names(), vec!["t"]);
    }

    #[test]
    fn test_debate_tool_definitions() {
        let tools = debate_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["end_debate", "time_warning"]);

        let json = serde_json::to_value(&tools[0]).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["parameters"]["required"][0], "reason");
    }
}
