//! Policy engine (C3, spec.md §4.3): maps a signature to a [`Decision`] via
//! ordered glob rules, deny-beats-allow-beats-ask regardless of file order.

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    Ask,
}

impl From<PolicyAction> for Decision {
    fn from(a: PolicyAction) -> Self {
        match a {
            PolicyAction::Allow => Decision::Allow,
            PolicyAction::Deny => Decision::Deny,
            PolicyAction::Ask => Decision::Ask,
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid glob pattern '{0}': {1}")]
    InvalidPattern(String, globset::Error),
}

/// A single rule as authored in the permissions config: a glob `pattern`
/// matched against the whole signature, and the `action` it yields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub description: String,
}

struct CompiledRule {
    matcher: GlobMatcher,
    action: PolicyAction,
}

/// Compiled, read-only-after-construction policy: an ordered `rules` list
/// (explicit per-action three-pass scan) and a `defaults` list
/// (first-match-wins), falling back to [`Decision::Ask`].
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    defaults: Vec<CompiledRule>,
}

impl PolicyEngine {
    pub fn compile(rules: &[PolicyRule], defaults: &[PolicyRule]) -> Result<Self, PolicyError> {
        Ok(Self {
            rules: compile_rules(rules)?,
            defaults: compile_rules(defaults)?,
        })
    }

    /// Evaluate a signature against the compiled rules.
    ///
    /// 1. Explicit rules, scanned once per action in priority order
    ///    `deny, allow, ask` — first pattern match in that pass wins.
    /// 2. Defaults, scanned once, first match wins.
    /// 3. Global fallback: `Ask`.
    pub fn evaluate(&self, signature: &str) -> Decision {
        for action in [PolicyAction::Deny, PolicyAction::Allow, PolicyAction::Ask] {
            for rule in &self.rules {
                if rule.action == action && rule.matcher.is_match(signature) {
                    return action.into();
                }
            }
        }
        for rule in &self.defaults {
            if rule.matcher.is_match(signature) {
                return rule.action.into();
            }
        }
        Decision::Ask
    }
}

fn compile_rules(rules: &[PolicyRule]) -> Result<Vec<CompiledRule>, PolicyError> {
    rules
        .iter()
        .map(|r| {
            let glob = Glob::new(&r.pattern)
                .map_err(|e| PolicyError::InvalidPattern(r.pattern.clone(), e))?;
            Ok(CompiledRule {
                matcher: glob.compile_matcher(),
                action: r.action,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, action: PolicyAction) -> PolicyRule {
        PolicyRule {
            pattern: pattern.to_string(),
            action,
            description: String::new(),
        }
    }

    #[test]
    fn deny_beats_allow_regardless_of_rule_order() {
        let rules = vec![
            rule("ha_call_service(*)", PolicyAction::Allow),
            rule("ha_call_service(lock.*)", PolicyAction::Deny),
        ];
        let engine = PolicyEngine::compile(&rules, &[]).unwrap();
        assert_eq!(
            engine.evaluate("ha_call_service(lock.lock, lock.front)"),
            Decision::Deny
        );
    }

    #[test]
    fn defaults_used_when_no_explicit_rule_matches() {
        let defaults = vec![rule("ha_get_state(*)", PolicyAction::Allow)];
        let engine = PolicyEngine::compile(&[], &defaults).unwrap();
        assert_eq!(engine.evaluate("ha_get_state(sensor.temp)"), Decision::Allow);
    }

    #[test]
    fn fallback_is_ask() {
        let engine = PolicyEngine::compile(&[], &[]).unwrap();
        assert_eq!(engine.evaluate("whatever(1, 2)"), Decision::Ask);
    }

    #[test]
    fn policy_monotonicity_any_deny_rule_wins() {
        let rules = vec![
            rule("*", PolicyAction::Ask),
            rule("danger(*)", PolicyAction::Deny),
            rule("danger(*)", PolicyAction::Allow),
        ];
        let engine = PolicyEngine::compile(&rules, &[]).unwrap();
        assert_eq!(engine.evaluate("danger(x)"), Decision::Deny);
    }
}
