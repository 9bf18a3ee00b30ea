//! Tool registry (C1, spec.md §4.1): indexes compiled tool definitions by
//! name and renders signature parts from a tool's template, grounded on
//! `original_source/src/agent_gate/registry.py`'s `build_registry`.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::tool::{
    ArgSummary, CompiledTool, ToolCompileError, ToolDefinition, ToolLookup, ToolSummary,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),
    #[error(transparent)]
    Compile(#[from] ToolCompileError),
}

/// Immutable, built-once index of every tool this gateway knows about.
pub struct ToolRegistry {
    tools: HashMap<String, CompiledTool>,
}

impl ToolRegistry {
    /// Build from a flat definition list, rejecting duplicate names outright
    /// rather than letting the last one silently win.
    pub fn build(definitions: Vec<ToolDefinition>) -> Result<Self, RegistryError> {
        let mut tools = HashMap::with_capacity(definitions.len());
        for def in definitions {
            if tools.contains_key(&def.name) {
                return Err(RegistryError::DuplicateTool(def.name));
            }
            let compiled = CompiledTool::compile(def)?;
            tools.insert(compiled.definition.name.clone(), compiled);
        }
        Ok(Self { tools })
    }

    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        let mut defs: Vec<&ToolDefinition> = self.tools.values().map(|t| &t.definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolLookup for ToolRegistry {
    fn get_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    fn get_service_name(&self, name: &str) -> Option<&str> {
        self.tools.get(name).map(|t| t.definition.service_name.as_str())
    }

    fn required_args(&self, name: &str) -> HashSet<String> {
        self.tools
            .get(name)
            .map(|t| t.required_args.clone())
            .unwrap_or_default()
    }

    fn arg_validators(&self, name: &str) -> HashMap<String, &Regex> {
        match self.tools.get(name) {
            Some(t) => t.validators.iter().map(|(k, v)| (k.clone(), v)).collect(),
            None => HashMap::new(),
        }
    }

    fn signature_parts(&self, name: &str, args: &Map<String, Value>) -> Option<Vec<String>> {
        let tool = self.tools.get(name)?;
        let template = &tool.definition.signature_template;
        if template.is_empty() {
            return Some(Vec::new());
        }
        // Split on the literal separator ", " (spec.md §4.1), then
        // substitute every `{key}` occurrence within each part.
        Some(template.split(", ").map(|part| substitute(part, args)).collect())
    }

    fn list_tools(&self) -> Vec<ToolSummary> {
        self.definitions()
            .into_iter()
            .map(|def| ToolSummary {
                name: def.name.clone(),
                description: def.description.clone(),
                service: def.service_name.clone(),
                args: def
                    .args
                    .iter()
                    .map(|(name, arg)| {
                        (
                            name.clone(),
                            ArgSummary {
                                required: arg.required,
                                validate: arg.validate.clone(),
                            },
                        )
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Replace every `{key}` occurrence in `template` with `stringify(args[key])`,
/// or the empty string if `key` is absent. Parts with no `{...}` placeholder
/// pass through unchanged (e.g. a signature template of plain `"lock"`).
fn substitute(part: &str, args: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    loop {
        match rest.find('{') {
            None => {
                out.push_str(rest);
                break;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after_open = &rest[open + 1..];
                match after_open.find('}') {
                    None => {
                        out.push_str(&rest[open..]);
                        break;
                    }
                    Some(close) => {
                        let key = &after_open[..close];
                        let rendered = args
                            .get(key)
                            .map(crate::domain::signature::stringify)
                            .unwrap_or_default();
                        out.push_str(&rendered);
                        rest = &after_open[close + 1..];
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(name: &str, template: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            service_name: "home_assistant".to_string(),
            description: String::new(),
            signature_template: template.to_string(),
            args: HashMap::new(),
        }
    }

    #[test]
    fn build_rejects_duplicate_names() {
        let defs = vec![def("ha_ping", ""), def("ha_ping", "")];
        assert!(matches!(
            ToolRegistry::build(defs),
            Err(RegistryError::DuplicateTool(_))
        ));
    }

    #[test]
    fn signature_parts_follow_template_order() {
        let registry = ToolRegistry::build(vec![def("ha_call_service", "{entity_id}, {state}")]).unwrap();
        let mut args = Map::new();
        args.insert("state".into(), json!("on"));
        args.insert("entity_id".into(), json!("light.kitchen"));
        let parts = registry.signature_parts("ha_call_service", &args).unwrap();
        assert_eq!(parts, vec!["light.kitchen".to_string(), "on".to_string()]);
    }

    #[test]
    fn unknown_tool_yields_no_signature_parts() {
        let registry = ToolRegistry::build(vec![]).unwrap();
        assert!(registry.signature_parts("ghost", &Map::new()).is_none());
    }
}
