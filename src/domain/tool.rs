//! Tool definitions and the `ToolLookup` seam consumed by [`crate::domain::signature`].
//!
//! The registry that actually indexes tools by name (C1) lives in
//! `application::registry` — the domain only owns the data shape and the
//! trait that lets the pure signature/validation functions stay ignorant of
//! how lookups are implemented, the same way `EnvelopeVerifier` keeps the
//! teacher's `SmcpSession` domain type ignorant of the crypto backend.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ids::RequestId;

/// A single named argument's requirement and optional validation pattern, as
/// loaded from a service's tool manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgDefinition {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validate: Option<String>,
}

/// Immutable, source-of-truth tool description (spec.md §3 "Tool
/// Definition"). `args` maps argument name to its requirement/validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub service_name: String,
    #[serde(default)]
    pub description: String,
    /// Template with `{arg}` placeholders, canonical parts separated by `, `
    /// (spec.md §4.1). Empty template means a zero-arity signature.
    #[serde(default)]
    pub signature_template: String,
    #[serde(default)]
    pub args: HashMap<String, ArgDefinition>,
}

#[derive(Debug, Error)]
pub enum ToolCompileError {
    #[error("tool '{0}': invalid regex for arg '{1}': {2}")]
    InvalidValidator(String, String, regex::Error),
}

/// A `ToolDefinition` plus its pre-compiled validators and required-arg set,
/// so that per-request validation never re-parses a regex (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct CompiledTool {
    pub definition: ToolDefinition,
    pub required_args: HashSet<String>,
    pub validators: HashMap<String, Regex>,
}

impl CompiledTool {
    pub fn compile(definition: ToolDefinition) -> Result<Self, ToolCompileError> {
        let mut required_args = HashSet::new();
        let mut validators = HashMap::new();
        for (arg_name, arg_def) in &definition.args {
            if arg_def.required {
                required_args.insert(arg_name.clone());
            }
            if let Some(pattern) = &arg_def.validate {
                let re = Regex::new(pattern).map_err(|e| {
                    ToolCompileError::InvalidValidator(definition.name.clone(), arg_name.clone(), e)
                })?;
                validators.insert(arg_name.clone(), re);
            }
        }
        Ok(Self {
            definition,
            required_args,
            validators,
        })
    }
}

/// One argument's public schema, as surfaced by the `list_tools` RPC method
/// (spec.md §4.9, §6): whether it's required and the validator's source
/// pattern, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSummary {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,
}

/// A tool's public view, as surfaced by the `list_tools` RPC method
/// (spec.md §4.9: "name, description, service, and arg schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub service: String,
    pub args: HashMap<String, ArgSummary>,
}

/// Read-only lookups the signature/validation pipeline needs from whatever
/// holds the loaded tool set. Implemented by `application::registry::ToolRegistry`.
pub trait ToolLookup: Send + Sync {
    fn get_tool(&self, name: &str) -> Option<&ToolDefinition>;
    fn get_service_name(&self, name: &str) -> Option<&str>;
    fn required_args(&self, name: &str) -> HashSet<String>;
    fn arg_validators(&self, name: &str) -> HashMap<String, &Regex>;

    /// Ordered signature parts for `name`/`args`, or `None` if `name` is not
    /// in the registry (caller falls back to the sorted-keys scheme).
    fn signature_parts(&self, name: &str, args: &Map<String, Value>) -> Option<Vec<String>>;

    /// The registry's public view, for the `list_tools` RPC method.
    fn list_tools(&self) -> Vec<ToolSummary>;
}

/// Created per agent message, after validation and signature construction
/// succeed (spec.md §3 "Tool Request").
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub id: RequestId,
    pub tool_name: String,
    pub args: Map<String, Value>,
    pub signature: String,
}
