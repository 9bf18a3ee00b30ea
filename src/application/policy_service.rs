//! Combines signature construction and policy evaluation into a single
//! use-case (C2+C3, spec.md §4.2-§4.3): every caller that needs a decision
//! needs both, in that order, so this is the one seam `presentation` calls
//! through rather than reaching into `domain::signature`/`domain::policy`
//! directly.

use serde_json::{Map, Value};

use crate::domain::policy::{Decision, PolicyEngine};
use crate::domain::signature::{build_signature, ValidationError};
use crate::domain::tool::ToolLookup;

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub signature: String,
    pub decision: Decision,
}

pub struct PolicyService<'a> {
    registry: &'a dyn ToolLookup,
    engine: &'a PolicyEngine,
}

impl<'a> PolicyService<'a> {
    pub fn new(registry: &'a dyn ToolLookup, engine: &'a PolicyEngine) -> Self {
        Self { registry, engine }
    }

    /// Validate, build the canonical signature, and evaluate policy against
    /// it — the exact pipeline order spec.md §4.2 mandates.
    pub fn evaluate(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<Evaluation, ValidationError> {
        let signature = build_signature(tool_name, args, Some(self.registry))?;
        let decision = self.engine.evaluate(&signature);
        Ok(Evaluation { signature, decision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::ToolRegistry;
    use crate::domain::policy::{PolicyAction, PolicyRule};
    use serde_json::json;

    #[test]
    fn evaluate_combines_signature_and_decision() {
        let registry = ToolRegistry::build(vec![]).unwrap();
        let rules = vec![PolicyRule {
            pattern: "ha_ping".to_string(),
            action: PolicyAction::Allow,
            description: String::new(),
        }];
        let engine = PolicyEngine::compile(&rules, &[]).unwrap();
        let service = PolicyService::new(&registry, &engine);
        let mut args = Map::new();
        args.insert("x".into(), json!("1"));
        let eval = service.evaluate("ha_ping", &args).unwrap();
        assert_eq!(eval.signature, "ha_ping(1)");
        assert_eq!(eval.decision, Decision::Allow);
    }
}
